//! Run every community in `COMMUNITY_IDS` for one season, in parallel.

use std::sync::Arc;

use anyhow::{Context, Result};
use legitimacy_engine::events::JsonlEventSource;
use legitimacy_engine::logging::{log, obj, v_str, Domain, Level};
use legitimacy_engine::observer::LoggingObserver;
use legitimacy_engine::sink::sinks_from_settings;
use legitimacy_engine::{EngineSettings, Pipeline, SeasonRequest};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = EngineSettings::from_env();
    let config = settings.resolution_config()?;
    let (sinks, store) = sinks_from_settings(&settings).context("opening artifact sinks")?;

    let pipeline = Arc::new(
        Pipeline::new(Arc::new(JsonlEventSource::new(&settings.events_path)), config)
            .with_sinks(sinks)
            .with_observer(Arc::new(LoggingObserver)),
    );
    let window = settings.window().context("resolving run window")?;
    let requests: Vec<_> = settings
        .community_ids
        .iter()
        .map(|c| SeasonRequest::new(&settings.season_id, c, window))
        .collect();

    let results = pipeline.run_batch(requests, settings.workers).await;
    let mut failures = 0usize;
    for (request, result) in &results {
        match result {
            Ok(outcome) => println!(
                "{}",
                json!({
                    "community_id": request.community_id,
                    "verdict": outcome.verdict.verdict,
                    "verdict_hash": outcome.verdict.verdict_hash,
                    "max_weight": outcome.artifact.max_weight(),
                    "sink_failures": outcome.sink_report.failures.len(),
                })
            ),
            Err(err) => {
                failures += 1;
                log(
                    Level::Error,
                    Domain::System,
                    "community_failed",
                    obj(&[
                        ("community_id", v_str(&request.community_id)),
                        ("msg", v_str(&err.to_string())),
                    ]),
                );
            }
        }
    }

    let recent = store.list_recent(settings.recent_index_cap)?;
    log(
        Level::Info,
        Domain::System,
        "batch_summary",
        obj(&[
            ("communities", json!(results.len())),
            ("failed", json!(failures)),
            ("recent_artifacts", json!(recent.len())),
        ]),
    );
    if failures > 0 {
        anyhow::bail!("{} of {} communities failed", failures, results.len());
    }
    Ok(())
}
