use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span};

use super::{EngineContext, TransferEngine, UnitRun, wrong_unit};
use crate::core::models::{
    Category, DownloadUnit, ProgressEvent, SkipReason, UnitOutcome, WorkUnit,
};
use crate::core::plan::DownloadOptions;
use crate::core::progress::SpeedMeter;
use crate::core::template::{TemplateContext, rewrite_extension};
use crate::error::TransferError;
use crate::remote::endpoint;

const TMP_SUFFIX: &str = ".tmp";

/// Fetches media in chunks into `<dest>.tmp`, committing the offset after
/// every flushed chunk, then renames it into place.
pub struct DownloadEngine {
    opts: DownloadOptions,
}

impl DownloadEngine {
    pub fn new(opts: DownloadOptions) -> Self {
        Self { opts }
    }

    /// Final path of the unit's output file.
    pub fn destination(&self, unit: &DownloadUnit) -> PathBuf {
        let name = self.opts.template.render(&TemplateContext {
            dialog_id: unit.message.id.chat_id,
            message_id: unit.message.id.message_id,
            file_name: &unit.media.name,
            file_size: unit.media.size,
            message_date: unit.message.date,
            download_date: Utc::now(),
            caption: &unit.message.text,
        });
        let name = if self.opts.rewrite_ext {
            rewrite_extension(&name, &unit.media.mime_type)
        } else {
            name
        };
        self.opts.dir.join(name)
    }
}

pub fn tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

#[async_trait]
impl TransferEngine for DownloadEngine {
    fn category(&self) -> Category {
        Category::Download
    }

    async fn transfer(
        &self,
        ctx: &EngineContext,
        unit: &WorkUnit,
        run: &UnitRun<'_>,
    ) -> Result<UnitOutcome, TransferError> {
        let WorkUnit::Download(unit) = unit else {
            return Err(wrong_unit(self.category(), unit));
        };
        let dest = self.destination(unit);
        let span = info_span!("download", unit = %run.name, dest = %dest.display());

        async {
            fs::create_dir_all(&self.opts.dir)
                .await
                .map_err(|e| TransferError::local(&e, &self.opts.dir))?;

            // Size is the only signal here; a same-size file with other
            // content is treated as already downloaded.
            if self.opts.skip_same {
                if let Ok(meta) = fs::metadata(&dest).await {
                    if meta.is_file() && meta.len() == unit.media.size {
                        info!("Destination exists with matching size, skipping");
                        return Ok(UnitOutcome::skipped(SkipReason::SameFileExists));
                    }
                }
            }

            let bytes = self.fetch(ctx, unit, run, &dest).await?;
            Ok(UnitOutcome::Done { bytes })
        }
        .instrument(span)
        .await
    }
}

impl DownloadEngine {
    async fn fetch(
        &self,
        ctx: &EngineContext,
        unit: &DownloadUnit,
        run: &UnitRun<'_>,
        dest: &Path,
    ) -> Result<u64, TransferError> {
        let size = unit.media.size;
        let chunk_size = self.opts.chunk_size;
        let tmp = tmp_path(dest);

        // The stored offset is only good if the partial file still holds it.
        let requested = run.resume_from.map(|p| p.offset).unwrap_or(0).min(size);
        let start = match fs::metadata(&tmp).await {
            Ok(meta) if meta.len() >= requested => requested,
            _ => 0,
        };
        if start > 0 {
            info!(offset = start, total = size, "Resuming partial download");
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&tmp)
            .await
            .map_err(|e| TransferError::local(&e, &tmp))?;
        file.set_len(start)
            .await
            .map_err(|e| TransferError::local(&e, &tmp))?;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| TransferError::local(&e, &tmp))?;

        let offsets: Vec<u64> = (start..size).step_by(chunk_size as usize).collect();
        let extra = ctx.extra_permits(offsets.len().saturating_sub(1));
        let window = 1 + extra.len();
        debug!(chunks = offsets.len(), window, "Fetching chunks");

        let media = &unit.media;
        let mut chunks = stream::iter(offsets)
            .map(|offset| async move {
                let data = ctx
                    .chain
                    .invoke(endpoint::GET_FILE, run.ledger, || {
                        ctx.service.download_chunk(media, offset, chunk_size)
                    })
                    .await?;
                Ok::<_, TransferError>((offset, data))
            })
            .buffered(window);

        let started = Instant::now();
        let mut meter = SpeedMeter::new(start);
        let mut written = start;

        while let Some(next) = chunks.next().await {
            let (offset, data) = next?;
            let expected = (size - offset).min(u64::from(chunk_size));
            if data.len() as u64 != expected {
                return Err(TransferError::internal(format!(
                    "short chunk at offset {}: expected {} bytes, got {}",
                    offset,
                    expected,
                    data.len()
                )));
            }

            file.write_all(&data)
                .await
                .map_err(|e| TransferError::local(&e, &tmp))?;
            file.flush()
                .await
                .map_err(|e| TransferError::local(&e, &tmp))?;
            written += expected;

            ctx.store
                .mark_partial(Category::Download, run.fingerprint, written, size, None)
                .await?;

            let speed_bps = meter.sample(written);
            if ctx.chunk_log.should_log() {
                debug!(written, total = size, speed_bps, "Download progress");
            }
            ctx.events
                .progress(
                    run.fingerprint,
                    ProgressEvent {
                        unit_index: run.index,
                        unit_name: run.name.to_string(),
                        bytes_transferred: written,
                        total_bytes: size,
                        speed_bps,
                    },
                )
                .await;

            if ctx.cancel().is_cancelled() && written < size {
                debug!(written, "Cancelled at chunk boundary");
                return Err(TransferError::cancelled());
            }
        }
        drop(chunks);
        drop(extra);

        file.sync_all()
            .await
            .map_err(|e| TransferError::local(&e, &tmp))?;
        drop(file);

        fs::rename(&tmp, dest)
            .await
            .map_err(|e| TransferError::local(&e, dest))?;

        let mtime = filetime::FileTime::from_unix_time(unit.message.date.timestamp(), 0);
        if let Err(e) = filetime::set_file_mtime(dest, mtime) {
            debug!(error = %e, "Could not set modification time");
        }

        let elapsed = started.elapsed().as_secs_f64();
        info!(
            bytes = size - start,
            elapsed_secs = format!("{:.2}", elapsed),
            "Download complete"
        );
        Ok(size - start)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::fingerprint::fingerprint;
    use crate::core::middleware::RetryLedger;
    use crate::core::resume::{PartialState, Record};
    use crate::core::template::OutputTemplate;
    use crate::core::transfer_engine::testing;
    use crate::remote::{Fault, RemoteService, SimulatedService, simulated::sample_content};

    fn options(dir: &Path) -> DownloadOptions {
        let mut opts = DownloadOptions::new(dir);
        opts.chunk_size = 4096;
        opts
    }

    fn unit(sim: &SimulatedService, content: Vec<u8>) -> WorkUnit {
        let message = sim.add_media_message(1, "clip.mp4", "video/mp4", content, None);
        let media = message.media.clone().unwrap();
        WorkUnit::Download(DownloadUnit { message, media })
    }

    async fn run(
        engine: &DownloadEngine,
        ctx: &EngineContext,
        unit: &WorkUnit,
        resume_from: Option<PartialState>,
    ) -> Result<UnitOutcome, TransferError> {
        let ledger = RetryLedger::new();
        let fp = fingerprint(unit);
        let name = unit.name();
        engine
            .transfer(
                ctx,
                unit,
                &UnitRun {
                    index: 0,
                    name: &name,
                    fingerprint: &fp,
                    ledger: &ledger,
                    resume_from,
                },
            )
            .await
    }

    #[tokio::test]
    async fn downloads_through_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(SimulatedService::new());
        let content = sample_content(3, 10_000);
        let unit = unit(&sim, content.clone());
        let service: Arc<dyn RemoteService> = sim.clone();
        let ctx = testing::context(service, 4).await;
        let engine = DownloadEngine::new(options(dir.path()));

        let outcome = run(&engine, &ctx, &unit, None).await.unwrap();
        assert_eq!(outcome, UnitOutcome::Done { bytes: 10_000 });

        let dest = dir.path().join("1_1_clip.mp4");
        assert_eq!(std::fs::read(&dest).unwrap(), content);
        assert!(!tmp_path(&dest).exists());
        assert_eq!(sim.calls_to(endpoint::GET_FILE), 3);

        let meta = std::fs::metadata(&dest).unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        let WorkUnit::Download(u) = &unit else { unreachable!() };
        assert_eq!(mtime.unix_seconds(), u.message.date.timestamp());
    }

    #[tokio::test]
    async fn engine_leaves_done_marking_to_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(SimulatedService::new());
        let unit = unit(&sim, sample_content(5, 9000));
        sim.inject(endpoint::GET_FILE, Fault::Reject(crate::remote::RejectCode::BadRequest));
        let service: Arc<dyn RemoteService> = sim.clone();
        let ctx = testing::context(service, 1).await;
        let engine = DownloadEngine::new(options(dir.path()));

        let err = run(&engine, &ctx, &unit, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PermanentRequest);

        // The last committed offset is the full size; marking done is the
        // scheduler's job.
        run(&engine, &ctx, &unit, None).await.unwrap();
        let fp = fingerprint(&unit);
        match ctx.store.record(Category::Download, &fp).await.unwrap() {
            Some(Record::Partial { offset, size, .. }) => {
                assert_eq!(offset, 9000);
                assert_eq!(size, 9000);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[tokio::test]
    async fn resumes_from_committed_offset() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(SimulatedService::new());
        let content = sample_content(9, 12_288);
        let unit = unit(&sim, content.clone());
        let service: Arc<dyn RemoteService> = sim.clone();
        let ctx = testing::context(service, 1).await;
        let engine = DownloadEngine::new(options(dir.path()));

        let dest = dir.path().join("1_1_clip.mp4");
        std::fs::write(tmp_path(&dest), &content[..4096]).unwrap();

        let resume = PartialState {
            offset: 4096,
            handle: None,
        };
        let outcome = run(&engine, &ctx, &unit, Some(resume)).await.unwrap();
        assert_eq!(outcome, UnitOutcome::Done { bytes: 8192 });
        assert_eq!(sim.calls_to(endpoint::GET_FILE), 2);
        assert_eq!(std::fs::read(&dest).unwrap(), content);
    }

    #[tokio::test]
    async fn missing_partial_file_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(SimulatedService::new());
        let content = sample_content(1, 8192);
        let unit = unit(&sim, content.clone());
        let service: Arc<dyn RemoteService> = sim.clone();
        let ctx = testing::context(service, 1).await;
        let engine = DownloadEngine::new(options(dir.path()));

        let resume = PartialState {
            offset: 4096,
            handle: None,
        };
        let outcome = run(&engine, &ctx, &unit, Some(resume)).await.unwrap();
        assert_eq!(outcome, UnitOutcome::Done { bytes: 8192 });
        assert_eq!(
            std::fs::read(dir.path().join("1_1_clip.mp4")).unwrap(),
            content
        );
    }

    #[tokio::test]
    async fn skip_same_compares_size_only() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(SimulatedService::new());
        let unit = unit(&sim, sample_content(2, 100));
        let service: Arc<dyn RemoteService> = sim.clone();
        let ctx = testing::context(service, 1).await;

        let mut opts = options(dir.path());
        opts.skip_same = true;
        let engine = DownloadEngine::new(opts);

        // Different bytes, same length: still skipped.
        std::fs::write(dir.path().join("1_1_clip.mp4"), vec![0u8; 100]).unwrap();

        let outcome = run(&engine, &ctx, &unit, None).await.unwrap();
        assert_eq!(outcome, UnitOutcome::skipped(SkipReason::SameFileExists));
        assert_eq!(sim.total_calls(), 0);
    }

    #[test]
    fn template_and_extension_rewrite_shape_destination() {
        let sim = SimulatedService::new();
        let unit = unit(&sim, vec![1, 2, 3]);
        let WorkUnit::Download(unit) = unit else { unreachable!() };

        let mut opts = DownloadOptions::new("/out");
        opts.template = OutputTemplate::parse("{MessageID}-{FileName}").unwrap();
        opts.rewrite_ext = true;
        let mut unit = unit;
        unit.media.name = "clip.bin".into();

        let engine = DownloadEngine::new(opts);
        assert_eq!(engine.destination(&unit), PathBuf::from("/out/1-clip.mp4"));
    }
}
