use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{EngineContext, TransferEngine, UnitRun, wrong_unit};
use crate::core::middleware::RetryLedger;
use crate::core::models::{Category, ForwardUnit, SkipReason, UnitOutcome, WorkUnit};
use crate::core::plan::ForwardOptions;
use crate::error::TransferError;
use crate::remote::{ForwardMode, ForwardRequest, endpoint};

/// Forwards (or clones) messages into the target chat, one at a time or as
/// a batch sharing a single remote call.
pub struct ForwardEngine {
    opts: ForwardOptions,
}

impl ForwardEngine {
    pub fn new(opts: ForwardOptions) -> Self {
        Self { opts }
    }

    fn request(&self, from_chat: i64, ids: Vec<i32>) -> ForwardRequest {
        ForwardRequest {
            from_chat,
            ids,
            to_chat: self.opts.target,
            mode: self.opts.mode,
            silent: self.opts.silent,
            caption: match self.opts.mode {
                ForwardMode::Clone => self.opts.edit_text.clone(),
                ForwardMode::Direct => None,
            },
        }
    }

    async fn send(
        &self,
        ctx: &EngineContext,
        request: &ForwardRequest,
        ledger: &RetryLedger,
    ) -> Result<Vec<Result<UnitOutcome, TransferError>>, TransferError> {
        let results = ctx
            .chain
            .invoke(endpoint::FORWARD, ledger, || ctx.service.forward(request))
            .await?;

        if results.len() != request.ids.len() {
            warn!(
                requested = request.ids.len(),
                returned = results.len(),
                "Forward returned a different number of results"
            );
        }
        let outcomes = (0..request.ids.len())
            .map(|i| match results.get(i) {
                Some(Ok(_)) => Ok(UnitOutcome::Done { bytes: 0 }),
                Some(Err(e)) => Err(TransferError::from(e.clone())),
                None => Err(TransferError::internal("no result for forwarded message")),
            })
            .collect();
        Ok(outcomes)
    }
}

fn forward_unit<'a>(engine: Category, unit: &'a WorkUnit) -> Result<&'a ForwardUnit, TransferError> {
    match unit {
        WorkUnit::Forward(f) => Ok(f),
        other => Err(wrong_unit(engine, other)),
    }
}

#[async_trait]
impl TransferEngine for ForwardEngine {
    fn category(&self) -> Category {
        Category::Forward
    }

    async fn transfer(
        &self,
        ctx: &EngineContext,
        unit: &WorkUnit,
        run: &UnitRun<'_>,
    ) -> Result<UnitOutcome, TransferError> {
        let unit = forward_unit(self.category(), unit)?;
        if self.opts.dry_run {
            info!(unit = %run.name, "Dry run, not forwarding");
            return Ok(UnitOutcome::skipped(SkipReason::DryRun));
        }

        let request = self.request(unit.source.chat_id, vec![unit.source.message_id]);
        let mut outcomes = self.send(ctx, &request, run.ledger).await?;
        let outcome = outcomes
            .pop()
            .unwrap_or_else(|| Err(TransferError::internal("empty forward result")))?;
        debug!(unit = %run.name, "Forwarded");
        Ok(outcome)
    }

    async fn transfer_batch(
        &self,
        ctx: &EngineContext,
        units: &[WorkUnit],
        ledger: &RetryLedger,
    ) -> Option<Vec<Result<UnitOutcome, TransferError>>> {
        if self.opts.dry_run {
            info!(units = units.len(), "Dry run, not forwarding batch");
            return Some(
                units
                    .iter()
                    .map(|_| Ok(UnitOutcome::skipped(SkipReason::DryRun)))
                    .collect(),
            );
        }

        let mut ids = Vec::with_capacity(units.len());
        let mut from_chat = None;
        for unit in units {
            let unit = match forward_unit(self.category(), unit) {
                Ok(unit) => unit,
                Err(e) => return Some(units.iter().map(|_| Err(e.clone())).collect()),
            };
            match from_chat {
                Some(chat) if chat != unit.source.chat_id => {
                    let e = TransferError::internal("forward batch spans several source chats");
                    return Some(units.iter().map(|_| Err(e.clone())).collect());
                }
                _ => from_chat = Some(unit.source.chat_id),
            }
            ids.push(unit.source.message_id);
        }
        let from_chat = from_chat?;

        let request = self.request(from_chat, ids);
        let outcomes = match self.send(ctx, &request, ledger).await {
            Ok(outcomes) => outcomes,
            Err(e) => units.iter().map(|_| Err(e.clone())).collect(),
        };
        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        info!(
            from_chat,
            to_chat = self.opts.target,
            size = units.len(),
            failed,
            "Forwarded batch"
        );
        Some(outcomes)
    }
}
