use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rand::Rng;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{Instrument, debug, info, info_span, warn};

use super::{EngineContext, TransferEngine, UnitRun, wrong_unit};
use crate::core::models::{Category, ProgressEvent, UnitOutcome, UploadUnit, WorkUnit};
use crate::core::plan::UploadOptions;
use crate::core::progress::SpeedMeter;
use crate::error::TransferError;
use crate::remote::{UploadedFile, endpoint};

/// Splits a local file into parts, uploads them through the chain and sends
/// the assembled file to the target chat.
///
/// The upload id is committed before the first part so an interrupted
/// upload can continue on the same remote file.
pub struct UploadEngine {
    opts: UploadOptions,
}

impl UploadEngine {
    pub fn new(opts: UploadOptions) -> Self {
        Self { opts }
    }

    fn part_count(&self, size: u64) -> u32 {
        size.div_ceil(u64::from(self.opts.chunk_size)).max(1) as u32
    }

    fn sends_as_photo(&self, path: &Path) -> bool {
        self.opts.photo
            && mime_guess::from_path(path)
                .first_raw()
                .is_some_and(|mime| mime.starts_with("image/"))
    }
}

#[async_trait]
impl TransferEngine for UploadEngine {
    fn category(&self) -> Category {
        Category::Upload
    }

    async fn transfer(
        &self,
        ctx: &EngineContext,
        unit: &WorkUnit,
        run: &UnitRun<'_>,
    ) -> Result<UnitOutcome, TransferError> {
        let WorkUnit::Upload(unit) = unit else {
            return Err(wrong_unit(self.category(), unit));
        };
        let span = info_span!("upload", unit = %run.name, target = unit.target);

        async {
            let bytes = self.send(ctx, unit, run).await?;

            if self.opts.remove_after {
                match fs::remove_file(&unit.path).await {
                    Ok(()) => debug!("Removed local file after upload"),
                    Err(e) => warn!(error = %e, "Uploaded, but could not remove local file"),
                }
            }
            Ok(UnitOutcome::Done { bytes })
        }
        .instrument(span)
        .await
    }
}

impl UploadEngine {
    async fn send(
        &self,
        ctx: &EngineContext,
        unit: &UploadUnit,
        run: &UnitRun<'_>,
    ) -> Result<u64, TransferError> {
        let size = unit.size;
        let chunk = u64::from(self.opts.chunk_size);
        let parts = self.part_count(size);
        let path = unit.path.as_path();

        let (upload_id, start_part) = match run.resume_from {
            Some(state) => match state.handle {
                Some(id) => (id, (state.offset / chunk).min(u64::from(parts)) as u32),
                None => (new_upload_id(), 0),
            },
            None => (new_upload_id(), 0),
        };
        let start = (u64::from(start_part) * chunk).min(size);
        if start_part > 0 {
            info!(upload_id, part = start_part, parts, "Resuming partial upload");
        }

        ctx.store
            .mark_partial(Category::Upload, run.fingerprint, start, size, Some(upload_id))
            .await?;

        let mut file = File::open(path)
            .await
            .map_err(|e| TransferError::local(&e, path))?;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| TransferError::local(&e, path))?;

        // Parts are read in order, one at a time; only the remote calls overlap.
        let source = path.to_path_buf();
        let reads = stream::unfold((file, start_part), move |(mut file, part)| {
            let source = source.clone();
            async move {
                if part >= parts {
                    return None;
                }
                let offset = u64::from(part) * chunk;
                let mut buf = vec![0u8; (size - offset).min(chunk) as usize];
                let read = file
                    .read_exact(&mut buf)
                    .await
                    .map(|_| (part, buf))
                    .map_err(|e| TransferError::local(&e, &source));
                Some((read, (file, part + 1)))
            }
        });

        let extra = ctx.extra_permits((parts - start_part).saturating_sub(1) as usize);
        let window = 1 + extra.len();
        let uploads = reads
            .map(|read| async move {
                let (part, data) = read?;
                ctx.chain
                    .invoke(endpoint::SAVE_FILE_PART, run.ledger, || {
                        ctx.service.upload_part(upload_id, part, parts, &data)
                    })
                    .await?;
                Ok::<_, TransferError>(part)
            })
            .buffered(window);
        let mut uploads = std::pin::pin!(uploads);

        let mut meter = SpeedMeter::new(start);
        while let Some(next) = uploads.next().await {
            let part = next?;
            let committed = ((u64::from(part) + 1) * chunk).min(size);

            ctx.store
                .mark_partial(
                    Category::Upload,
                    run.fingerprint,
                    committed,
                    size,
                    Some(upload_id),
                )
                .await?;

            let speed_bps = meter.sample(committed);
            if ctx.chunk_log.should_log() {
                debug!(part, parts, speed_bps, "Upload progress");
            }
            ctx.events
                .progress(
                    run.fingerprint,
                    ProgressEvent {
                        unit_index: run.index,
                        unit_name: run.name.to_string(),
                        bytes_transferred: committed,
                        total_bytes: size,
                        speed_bps,
                    },
                )
                .await;

            if ctx.cancel().is_cancelled() && part + 1 < parts {
                debug!(part, "Cancelled at part boundary");
                return Err(TransferError::cancelled());
            }
        }
        drop(extra);

        let uploaded = UploadedFile {
            upload_id,
            parts,
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size,
        };
        let as_photo = self.sends_as_photo(path);
        let sent = ctx
            .chain
            .invoke(endpoint::SEND_MEDIA, run.ledger, || {
                ctx.service
                    .send_media(unit.target, &uploaded, as_photo, &self.opts.caption)
            })
            .await?;

        info!(
            message_id = sent.message_id,
            bytes = size,
            as_photo,
            "Upload complete"
        );
        Ok(size - start)
    }
}

fn new_upload_id() -> i64 {
    rand::thread_rng().gen_range(1..i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::core::fingerprint::fingerprint;
    use crate::core::middleware::RetryLedger;
    use crate::core::resume::{PartialState, Record};
    use crate::core::transfer_engine::testing;
    use crate::remote::{RemoteService, SimulatedService, simulated::sample_content};

    fn options(target: i64) -> UploadOptions {
        let mut opts = UploadOptions::new(target);
        opts.chunk_size = 4096;
        opts
    }

    fn local_file(dir: &Path, name: &str, content: &[u8]) -> WorkUnit {
        let path: PathBuf = dir.join(name);
        std::fs::write(&path, content).unwrap();
        WorkUnit::Upload(UploadUnit {
            path,
            size: content.len() as u64,
            target: 77,
        })
    }

    async fn run(
        engine: &UploadEngine,
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
    async fn uploads_parts_and_sends() {
        let dir = tempfile::tempdir().unwrap();
        let content = sample_content(4, 10_000);
        let unit = local_file(dir.path(), "notes.txt", &content);
        let sim = Arc::new(SimulatedService::new());
        let service: Arc<dyn RemoteService> = sim.clone();
        let ctx = testing::context(service, 4).await;

        let mut opts = options(77);
        opts.caption = "hello".into();
        let engine = UploadEngine::new(opts);

        let outcome = run(&engine, &ctx, &unit, None).await.unwrap();
        assert_eq!(outcome, UnitOutcome::Done { bytes: 10_000 });
        assert_eq!(sim.calls_to(endpoint::SAVE_FILE_PART), 3);

        let sent = sim.sent_media();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, 77);
        assert_eq!(sent[0].content, content);
        assert_eq!(sent[0].caption, "hello");
        assert!(!sent[0].as_photo);
    }

    #[tokio::test]
    async fn resumes_on_the_same_upload_id() {
        let dir = tempfile::tempdir().unwrap();
        let content = sample_content(8, 12_000);
        let unit = local_file(dir.path(), "a.bin", &content);
        let sim = Arc::new(SimulatedService::new());
        let service: Arc<dyn RemoteService> = sim.clone();
        let ctx = testing::context(service.clone(), 1).await;
        let engine = UploadEngine::new(options(77));

        service.upload_part(42, 0, 3, &content[..4096]).await.unwrap();
        let resume = PartialState {
            offset: 4096,
            handle: Some(42),
        };

        let outcome = run(&engine, &ctx, &unit, Some(resume)).await.unwrap();
        assert_eq!(outcome, UnitOutcome::Done { bytes: 12_000 - 4096 });
        assert_eq!(sim.calls_to(endpoint::SAVE_FILE_PART), 3);
        assert_eq!(sim.sent_media()[0].content, content);

        let fp = fingerprint(&unit);
        match ctx.store.record(Category::Upload, &fp).await.unwrap() {
            Some(Record::Partial { handle, offset, .. }) => {
                assert_eq!(handle, Some(42));
                assert_eq!(offset, 12_000);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[tokio::test]
    async fn photo_flag_only_applies_to_images() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(SimulatedService::new());
        let service: Arc<dyn RemoteService> = sim.clone();
        let ctx = testing::context(service, 2).await;

        let mut opts = options(77);
        opts.photo = true;
        let engine = UploadEngine::new(opts);

        let image = local_file(dir.path(), "cat.jpg", b"jpeg bytes");
        let text = local_file(dir.path(), "cat.txt", b"text bytes");
        run(&engine, &ctx, &image, None).await.unwrap();
        run(&engine, &ctx, &text, None).await.unwrap();

        let sent = sim.sent_media();
        assert!(sent[0].as_photo);
        assert!(!sent[1].as_photo);
    }

    #[tokio::test]
    async fn remove_after_deletes_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(SimulatedService::new());
        let service: Arc<dyn RemoteService> = sim.clone();
        let ctx = testing::context(service, 1).await;

        let mut opts = options(77);
        opts.remove_after = true;
        let engine = UploadEngine::new(opts);

        let unit = local_file(dir.path(), "gone.txt", b"");
        run(&engine, &ctx, &unit, None).await.unwrap();

        assert!(!dir.path().join("gone.txt").exists());
        assert_eq!(sim.calls_to(endpoint::SAVE_FILE_PART), 1);
        assert_eq!(sim.sent_media()[0].content, Vec::<u8>::new());
    }

    #[tokio::test]
    async fn truncated_source_is_a_local_failure() {
        let dir = tempfile::tempdir().unwrap();
        let unit = local_file(dir.path(), "short.bin", &[1; 100]);
        let WorkUnit::Upload(mut inner) = unit else { unreachable!() };
        inner.size = 5000;
        let unit = WorkUnit::Upload(inner);

        let service: Arc<dyn RemoteService> = Arc::new(SimulatedService::new());
        let ctx = testing::context(service, 1).await;
        let engine = UploadEngine::new(options(77));

        let err = run(&engine, &ctx, &unit, None).await.unwrap_err();
        assert!(err.kind().is_local());
    }
}
