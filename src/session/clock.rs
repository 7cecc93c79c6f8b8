//! Sources for the local clock correction handed to the transport.
//!
//! The remote rejects requests whose timestamps drift too far from its own
//! clock, so the offset (server time minus local time, in milliseconds) is
//! measured once per connection.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;
const NTP_PACKET_LEN: usize = 48;
/// LI = 0, VN = 3, Mode = 3 (client).
const NTP_CLIENT_HEADER: u8 = 0x1B;
const DEFAULT_NTP_PORT: u16 = 123;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("clock source I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no reply from {server} within {timeout:?}")]
    Timeout { server: String, timeout: Duration },
    #[error("malformed time reply: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait ClockSource: Send + Sync {
    /// Server time minus local time, in milliseconds.
    async fn offset_ms(&self) -> Result<i64, ClockError>;

    fn describe(&self) -> String;
}

/// Trust the local clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl ClockSource for SystemClock {
    async fn offset_ms(&self) -> Result<i64, ClockError> {
        Ok(0)
    }

    fn describe(&self) -> String {
        "system".to_string()
    }
}

/// A known, constant correction.
#[derive(Debug, Clone, Copy)]
pub struct FixedOffset(pub i64);

#[async_trait]
impl ClockSource for FixedOffset {
    async fn offset_ms(&self) -> Result<i64, ClockError> {
        Ok(self.0)
    }

    fn describe(&self) -> String {
        format!("fixed {}ms", self.0)
    }
}

/// Single-request SNTP query against `server` (`host` or `host:port`).
#[derive(Debug, Clone)]
pub struct SntpClock {
    server: String,
    timeout: Duration,
}

impl SntpClock {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn address(&self) -> String {
        if self.server.contains(':') {
            self.server.clone()
        } else {
            format!("{}:{}", self.server, DEFAULT_NTP_PORT)
        }
    }
}

#[async_trait]
impl ClockSource for SntpClock {
    async fn offset_ms(&self) -> Result<i64, ClockError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.address()).await?;

        let mut request = [0u8; NTP_PACKET_LEN];
        request[0] = NTP_CLIENT_HEADER;

        let sent_at = Utc::now();
        let exchange = async {
            socket.send(&request).await?;
            let mut reply = [0u8; NTP_PACKET_LEN];
            let len = socket.recv(&mut reply).await?;
            Ok::<_, std::io::Error>((reply, len))
        };
        let (reply, len) = timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClockError::Timeout {
                server: self.server.clone(),
                timeout: self.timeout,
            })??;
        let received_at = Utc::now();

        let server_time = transmit_time(&reply[..len])?;
        let local_mid = sent_at + (received_at - sent_at) / 2;
        let offset = (server_time - local_mid).num_milliseconds();
        debug!(server = %self.server, offset_ms = offset, "Measured clock offset");
        Ok(offset)
    }

    fn describe(&self) -> String {
        format!("sntp {}", self.server)
    }
}

/// Transmit timestamp of an NTP reply (bytes 40..48).
pub fn transmit_time(packet: &[u8]) -> Result<DateTime<Utc>, ClockError> {
    if packet.len() < NTP_PACKET_LEN {
        return Err(ClockError::Malformed(format!(
            "{} byte reply, expected {}",
            packet.len(),
            NTP_PACKET_LEN
        )));
    }
    let mode = packet[0] & 0x07;
    if mode != 4 {
        return Err(ClockError::Malformed(format!("mode {mode}, expected server (4)")));
    }

    let seconds = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]);
    let fraction = u32::from_be_bytes([packet[44], packet[45], packet[46], packet[47]]);
    if seconds == 0 {
        return Err(ClockError::Malformed("zero transmit timestamp".into()));
    }

    let unix = i64::from(seconds) - NTP_UNIX_OFFSET;
    let nanos = ((u64::from(fraction) * 1_000_000_000) >> 32) as u32;
    Utc.timestamp_opt(unix, nanos)
        .single()
        .ok_or_else(|| ClockError::Malformed(format!("timestamp {unix} out of range")))
}
