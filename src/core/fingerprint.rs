//! Deterministic identity of a work unit's output.

use super::models::WorkUnit;

/// Hex-encoded BLAKE3 over the category and the fields that identify the
/// unit's content. Sizes are part of the key, so a source that changes size
/// gets a new fingerprint.
pub fn fingerprint(unit: &WorkUnit) -> String {
    let composite = match unit {
        WorkUnit::Download(u) => format!(
            "{}|{}|{}|{}",
            u.message.id.chat_id, u.message.id.message_id, u.media.file_id, u.media.size
        ),
        WorkUnit::Upload(u) => format!("{}|{}|{}", u.target, u.path.display(), u.size),
        WorkUnit::Forward(u) => format!(
            "{}|{}|{}",
            u.source.chat_id, u.source.message_id, u.target
        ),
    };

    let mut hasher = blake3::Hasher::new();
    hasher.update(unit.category().as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(composite.as_bytes());
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{DownloadUnit, ForwardUnit};
    use crate::remote::{MediaInfo, MessageRef, RemoteMessage};
    use chrono::Utc;

    fn download(size: u64) -> WorkUnit {
        WorkUnit::Download(DownloadUnit {
            message: RemoteMessage {
                id: MessageRef::new(10, 7),
                date: Utc::now(),
                text: String::new(),
                grouped_id: None,
                media: None,
            },
            media: MediaInfo {
                file_id: 99,
                name: "a.jpg".into(),
                size,
                mime_type: "image/jpeg".into(),
            },
        })
    }

    #[test]
    fn stable_and_size_sensitive() {
        assert_eq!(fingerprint(&download(100)), fingerprint(&download(100)));
        assert_ne!(fingerprint(&download(100)), fingerprint(&download(101)));
        assert_eq!(fingerprint(&download(1)).len(), 64);
    }

    #[test]
    fn categories_never_share_fingerprints() {
        let forward = WorkUnit::Forward(ForwardUnit {
            source: MessageRef::new(10, 7),
            target: 99,
            grouped_id: None,
            media_name: None,
        });
        assert_ne!(fingerprint(&forward), fingerprint(&download(100)));
    }
}
