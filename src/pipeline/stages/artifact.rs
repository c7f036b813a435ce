//! On-demand full-frame artifacts.
//!
//! The coordinator asks for a frame through a [`FrameRequest`]. The next tick
//! that sees the request attaches the whole frame, base64 encoded, to its
//! record. Requests arriving while the per-source rate limit is active are
//! dropped and counted as throttled; several requests pending on the same
//! tick are answered by one artifact.

use crate::error::Result;
use crate::pipeline::record::{ArtifactPayload, StageOutput};
use crate::pipeline::stage::{StageConfig, StageContext, StageOutcome, StagePlugin};
use crate::types::FrameRequest;
use base64::{engine::general_purpose::STANDARD, Engine};
use crossbeam_channel::Receiver;

pub const DEFAULT_RATE_LIMIT_SECONDS: u64 = 60;

/// Pixel format label carried with every artifact
pub const ARTIFACT_FORMAT: &str = "gray8";

/// Counters for artifact requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtifactStats {
    pub requests: u64,
    pub sent: u64,
    pub throttled: u64,
    pub coalesced: u64,
}

pub struct ArtifactStage {
    requests: Receiver<FrameRequest>,
    min_interval_ms: u64,
    last_sent_ms: Option<u64>,
    enabled: bool,
    stats: ArtifactStats,
}

impl ArtifactStage {
    pub const NAME: &'static str = "artifact";

    pub fn new(requests: Receiver<FrameRequest>) -> Self {
        Self {
            requests,
            min_interval_ms: DEFAULT_RATE_LIMIT_SECONDS * 1000,
            last_sent_ms: None,
            enabled: true,
            stats: ArtifactStats::default(),
        }
    }

    pub fn stats(&self) -> ArtifactStats {
        self.stats
    }

    fn is_throttled(&self, now_ms: u64) -> bool {
        self.last_sent_ms
            .is_some_and(|last| now_ms.saturating_sub(last) < self.min_interval_ms)
    }
}

impl StagePlugin for ArtifactStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        90
    }

    fn init(&mut self, config: &StageConfig) -> Result<()> {
        self.min_interval_ms =
            config.get_u64("rate_limit_seconds", DEFAULT_RATE_LIMIT_SECONDS) * 1000;
        self.enabled = config.get_bool("enabled", true);
        Ok(())
    }

    fn process(&mut self, ctx: &mut StageContext) -> StageOutcome {
        let pending: Vec<FrameRequest> = self.requests.try_iter().collect();
        let Some(first) = pending.first() else {
            return StageOutcome::Skip;
        };
        self.stats.requests += pending.len() as u64;

        if !self.enabled {
            tracing::debug!("Artifact requests disabled, dropping {}", pending.len());
            return StageOutcome::Skip;
        }

        if self.is_throttled(ctx.timestamp_ms) {
            self.stats.throttled += pending.len() as u64;
            tracing::debug!(
                "Artifact request {} throttled ({} ms since last artifact)",
                first.request_id,
                ctx.timestamp_ms
                    .saturating_sub(self.last_sent_ms.unwrap_or(ctx.timestamp_ms))
            );
            return StageOutcome::Skip;
        }

        let meta = ctx.frame.meta;
        let payload = ArtifactPayload {
            request_id: first.request_id.clone(),
            reason: first.reason,
            width: meta.width,
            height: meta.height,
            format: ARTIFACT_FORMAT.to_string(),
            data: STANDARD.encode(ctx.frame.data),
        };

        self.stats.sent += 1;
        self.stats.coalesced += pending.len() as u64 - 1;
        self.last_sent_ms = Some(ctx.timestamp_ms);

        tracing::info!(
            "Attaching artifact for request {} ({}) on tick {}, {} bytes",
            payload.request_id,
            payload.reason,
            ctx.tick_id,
            payload.data.len()
        );
        ctx.record.insert(Self::NAME, StageOutput::Artifact(payload));
        StageOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMeta, FrameView};
    use crate::pipeline::record::PipelineRecord;
    use crate::types::{SourceId, TriggerReason};
    use crossbeam_channel::{unbounded, Sender};

    fn request(id: &str) -> FrameRequest {
        FrameRequest {
            request_id: id.to_string(),
            source_id: SourceId::new("cam1"),
            reason: TriggerReason::HighMotion,
            tick_id: 0,
            requested_at_ms: 0,
        }
    }

    fn tick(stage: &mut ArtifactStage, now_ms: u64) -> (StageOutcome, PipelineRecord) {
        let meta = FrameMeta {
            width: 2,
            height: 2,
            timestamp_ms: now_ms,
            tick_id: 1,
        };
        let data = [1u8, 2, 3, 4];
        let mut record = PipelineRecord::new(SourceId::new("cam1"), 1, now_ms);
        let outcome = {
            let mut ctx = StageContext {
                frame: FrameView {
                    meta: &meta,
                    data: &data,
                },
                record: &mut record,
                tick_id: 1,
                timestamp_ms: now_ms,
                degraded: false,
            };
            stage.process(&mut ctx)
        };
        (outcome, record)
    }

    fn stage() -> (ArtifactStage, Sender<FrameRequest>) {
        let (tx, rx) = unbounded();
        (ArtifactStage::new(rx), tx)
    }

    #[test]
    fn test_no_request_skips() {
        let (mut stage, _tx) = stage();
        let (outcome, record) = tick(&mut stage, 0);
        assert_eq!(outcome, StageOutcome::Skip);
        assert!(record.artifact().is_none());
    }

    #[test]
    fn test_request_attaches_encoded_frame() {
        let (mut stage, tx) = stage();
        tx.send(request("r1")).unwrap();
        let (outcome, record) = tick(&mut stage, 1_000);
        assert_eq!(outcome, StageOutcome::Success);

        let artifact = record.artifact().unwrap();
        assert_eq!(artifact.request_id, "r1");
        assert_eq!(artifact.format, "gray8");
        assert_eq!(STANDARD.decode(&artifact.data).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_rate_limit_throttles() {
        let (mut stage, tx) = stage();
        tx.send(request("r1")).unwrap();
        tick(&mut stage, 0);

        tx.send(request("r2")).unwrap();
        let (outcome, _) = tick(&mut stage, 30_000);
        assert_eq!(outcome, StageOutcome::Skip);

        tx.send(request("r3")).unwrap();
        let (outcome, record) = tick(&mut stage, 60_000);
        assert_eq!(outcome, StageOutcome::Success);
        assert_eq!(record.artifact().unwrap().request_id, "r3");

        let stats = stage.stats();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.throttled, 1);
    }

    #[test]
    fn test_pending_requests_coalesce() {
        let (mut stage, tx) = stage();
        tx.send(request("a")).unwrap();
        tx.send(request("b")).unwrap();
        let (_, record) = tick(&mut stage, 0);
        assert_eq!(record.artifact().unwrap().request_id, "a");
        assert_eq!(stage.stats().coalesced, 1);
    }
}
