//! End-to-end orchestration: Source -> Resolver -> {Audit, Counterfactual}
//! -> Verdict -> Sinks.
//!
//! Everything after the fetch is synchronous and pure. Sink failures are
//! reported, never raised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::audit::{audit_artifact, AuditArtifact, FindingVerdict};
use crate::config::ResolutionConfig;
use crate::counterfactual::{run_counterfactuals, CounterfactualArtifact};
use crate::events::EventSource;
use crate::logging::{log, log_provenance, obj, ts_epoch_ms, v_str, Domain, Level, ProfileScope};
use crate::observer::{PipelineEvent, PipelineObserver};
use crate::resolver::{fetch_window, resolve_events, ResolveError, SeasonArtifact, SeasonRequest};
use crate::sink::{ArtifactRecord, CompositeSink, SinkError, SinkReport};
use crate::verdict::{resolve_verdict, LegitimacyVerdict};

/// Everything one run produced.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub artifact: SeasonArtifact,
    pub audit: AuditArtifact,
    pub counterfactuals: CounterfactualArtifact,
    pub verdict: LegitimacyVerdict,
    pub sink_report: SinkReport,
}

pub struct Pipeline {
    source: Arc<dyn EventSource>,
    config: ResolutionConfig,
    sinks: CompositeSink,
    observers: Vec<Arc<dyn PipelineObserver>>,
    cancelled: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(source: Arc<dyn EventSource>, config: ResolutionConfig) -> Self {
        Self {
            source,
            config,
            sinks: CompositeSink::new(),
            observers: Vec::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_sinks(mut self, sinks: CompositeSink) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &ResolutionConfig {
        &self.config
    }

    /// Shared flag; setting it stops runs that have not fetched yet.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn emit(&self, event: PipelineEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    pub async fn run(&self, request: &SeasonRequest) -> Result<PipelineOutcome, ResolveError> {
        self.emit(PipelineEvent::Started {
            season_id: request.season_id.clone(),
            community_id: request.community_id.clone(),
        });
        let result = self.run_stages(request).await;
        if let Err(err) = &result {
            self.emit(PipelineEvent::Failed {
                community_id: request.community_id.clone(),
                reason: err.to_string(),
            });
        }
        result
    }

    async fn run_stages(&self, request: &SeasonRequest) -> Result<PipelineOutcome, ResolveError> {
        let _scope = ProfileScope::with_context(
            "pipeline_run",
            &[("community_id", v_str(&request.community_id))],
        );
        self.config.validate()?;
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ResolveError::Cancelled);
        }

        let events = fetch_window(request, self.source.as_ref()).await?;
        self.emit(PipelineEvent::Fetched {
            community_id: request.community_id.clone(),
            events: events.len(),
        });

        let artifact = resolve_events(request, &events, &self.config)?;
        log_provenance(
            &artifact.season_id,
            &artifact.community_id,
            &artifact.hashes.input_hash,
            &artifact.hashes.config_hash,
            &artifact.hashes.output_hash,
        );
        self.emit(PipelineEvent::Resolved {
            community_id: artifact.community_id.clone(),
            output_hash: artifact.hashes.output_hash.clone(),
            eligible: artifact.stats.actors_eligible,
            max_weight: artifact.max_weight(),
        });

        let audit = audit_artifact(&artifact, &events)?;
        self.emit(PipelineEvent::Audited {
            community_id: audit.community_id.clone(),
            audit_hash: audit.audit_hash.clone(),
            hard_fail: audit.count(FindingVerdict::HardFail),
            soft_risk: audit.count(FindingVerdict::SoftRisk),
        });

        let counterfactuals = run_counterfactuals(&artifact, &events, &self.config)?;
        self.emit(PipelineEvent::CounterfactualsRun {
            community_id: counterfactuals.community_id.clone(),
            delta_hash: counterfactuals.delta_hash.clone(),
            critical: counterfactuals.critical().count(),
        });

        let verdict = resolve_verdict(&audit, &counterfactuals)?.signed(ts_epoch_ms());
        self.emit(PipelineEvent::VerdictReached {
            community_id: verdict.community_id.clone(),
            verdict: verdict.verdict,
            verdict_hash: verdict.verdict_hash.clone(),
        });

        let sink_report = self
            .persist(&artifact, &audit, &counterfactuals, &verdict)
            .await;
        self.emit(PipelineEvent::Persisted {
            community_id: artifact.community_id.clone(),
            attempted: sink_report.attempted,
            succeeded: sink_report.succeeded,
        });

        Ok(PipelineOutcome {
            artifact,
            audit,
            counterfactuals,
            verdict,
            sink_report,
        })
    }

    async fn persist(
        &self,
        artifact: &SeasonArtifact,
        audit: &AuditArtifact,
        counterfactuals: &CounterfactualArtifact,
        verdict: &LegitimacyVerdict,
    ) -> SinkReport {
        if self.sinks.is_empty() {
            return SinkReport::default();
        }
        let built: [Result<ArtifactRecord, SinkError>; 4] = [
            ArtifactRecord::season(artifact),
            ArtifactRecord::audit(audit),
            ArtifactRecord::counterfactual(counterfactuals),
            ArtifactRecord::verdict(verdict),
        ];
        let mut records = Vec::with_capacity(built.len());
        let mut report = SinkReport::default();
        for record in built {
            match record {
                Ok(r) => records.push(r),
                Err(err) => {
                    report.attempted += 1;
                    report.record_failure("encode", &artifact.community_id, err.to_string());
                }
            }
        }
        report.merge(self.sinks.write_all(&records).await);
        report
    }

    /// Run independent requests concurrently, at most `workers` at a time.
    /// Results come back in request order.
    pub async fn run_batch(
        self: &Arc<Self>,
        requests: Vec<SeasonRequest>,
        workers: usize,
    ) -> Vec<(SeasonRequest, Result<PipelineOutcome, ResolveError>)> {
        let workers = workers.max(1);
        log(
            Level::Info,
            Domain::System,
            "batch_start",
            obj(&[
                ("requests", json!(requests.len())),
                ("workers", json!(workers)),
            ]),
        );
        let permits = Arc::new(Semaphore::new(workers));

        let handles: Vec<_> = requests
            .iter()
            .cloned()
            .map(|request| {
                let pipeline = Arc::clone(self);
                let permits = Arc::clone(&permits);
                tokio::spawn(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|e| ResolveError::Worker(e.to_string()))?;
                    pipeline.run(&request).await
                })
            })
            .collect();

        let results = join_all(handles).await;
        let mut ok = 0usize;
        let out: Vec<_> = requests
            .into_iter()
            .zip(results)
            .map(|(request, joined)| {
                let result = joined.unwrap_or_else(|e| Err(ResolveError::Worker(e.to_string())));
                if result.is_ok() {
                    ok += 1;
                }
                (request, result)
            })
            .collect();
        log(
            Level::Info,
            Domain::System,
            "batch_done",
            obj(&[("ok", json!(ok)), ("failed", json!(out.len() - ok))]),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ActivityEvent, EventType, InMemoryEventSource, TimeWindow};
    use crate::observer::RecordingObserver;
    use crate::sink::MemorySink;

    fn events() -> Vec<ActivityEvent> {
        let types = [
            EventType::Comment,
            EventType::Upvote,
            EventType::ModerationAction,
            EventType::GovernanceVote,
        ];
        let mut out = Vec::new();
        for actor in 0..6 {
            for (i, t) in types.iter().enumerate() {
                out.push(ActivityEvent {
                    id: format!("e{}-{}", actor, i),
                    community_id: "c".to_string(),
                    actor_id: format!("u{}", actor),
                    event_type: t.clone(),
                    target_id: None,
                    ts: 100 + (actor * 10 + i) as u64,
                });
            }
        }
        out
    }

    fn pipeline(observer: Arc<RecordingObserver>, sink: Arc<MemorySink>) -> Pipeline {
        Pipeline::new(
            Arc::new(InMemoryEventSource::new(events())),
            ResolutionConfig::season0_default(),
        )
        .with_sinks(CompositeSink::new().with(sink))
        .with_observer(observer)
    }

    #[tokio::test]
    async fn test_run_emits_every_stage_and_persists() {
        let rec = Arc::new(RecordingObserver::new());
        let sink = Arc::new(MemorySink::new());
        let p = pipeline(rec.clone(), sink.clone());
        let out = p
            .run(&SeasonRequest::new("s0", "c", TimeWindow::new(0, 1_000)))
            .await
            .unwrap();

        assert_eq!(
            rec.stages(),
            vec![
                "started",
                "fetched",
                "resolved",
                "audited",
                "counterfactuals_run",
                "verdict_reached",
                "persisted"
            ]
        );
        assert_eq!(out.sink_report.attempted, 4);
        assert!(out.sink_report.is_clean());
        assert_eq!(sink.len(), 4);
        assert!(out.verdict.signed_at_ms.is_some());
    }

    #[tokio::test]
    async fn test_cancel_stops_before_fetch() {
        let rec = Arc::new(RecordingObserver::new());
        let p = pipeline(rec.clone(), Arc::new(MemorySink::new()));
        p.cancel();
        let err = p
            .run(&SeasonRequest::new("s0", "c", TimeWindow::new(0, 1_000)))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Cancelled));
        assert_eq!(rec.stages(), vec!["started", "failed"]);
    }

    #[tokio::test]
    async fn test_batch_preserves_request_order() {
        let p = Arc::new(pipeline(
            Arc::new(RecordingObserver::new()),
            Arc::new(MemorySink::new()),
        ));
        let requests: Vec<_> = ["c", "missing", "c"]
            .iter()
            .enumerate()
            .map(|(i, c)| SeasonRequest::new(&format!("s{}", i), c, TimeWindow::new(0, 1_000)))
            .collect();
        let results = p.run_batch(requests, 2).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[1].0.community_id, "missing");
        for (_, r) in &results {
            assert!(r.is_ok());
        }
        assert!(results[1].1.as_ref().unwrap().artifact.is_empty());
    }
}
