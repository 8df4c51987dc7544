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
    let config = settings
        .resolution_config()
        .context("loading resolution config")?;
    let window = settings.window().context("resolving run window")?;
    let community_id = settings
        .community_ids
        .first()
        .cloned()
        .context("no community configured")?;
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("season_id", v_str(&settings.season_id)),
            ("community_id", v_str(&community_id)),
            ("config", v_str(&config.name)),
            ("events_path", v_str(&settings.events_path)),
        ]),
    );

    let (sinks, _store) = sinks_from_settings(&settings).context("opening artifact sinks")?;
    let pipeline = Pipeline::new(Arc::new(JsonlEventSource::new(&settings.events_path)), config)
        .with_sinks(sinks)
        .with_observer(Arc::new(LoggingObserver));

    let request = SeasonRequest::new(&settings.season_id, &community_id, window);
    let outcome = pipeline.run(&request).await?;

    if !outcome.sink_report.is_clean() {
        log(
            Level::Warn,
            Domain::Sink,
            "partial_persist",
            obj(&[("failures", json!(outcome.sink_report.failures))]),
        );
    }
    // log records go to LOG_CONSOLE (stderr by default); stdout carries only the verdict
    println!("{}", serde_json::to_string_pretty(&outcome.verdict)?);
    Ok(())
}
