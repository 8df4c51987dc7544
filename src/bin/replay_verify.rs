//! Replay stored season artifacts from the event log and compare hashes.
//!
//! Exits non-zero if any stored artifact fails to reproduce.

use anyhow::{bail, Context, Result};
use legitimacy_engine::events::{EventSource, JsonlEventSource};
use legitimacy_engine::replay::verify_replay;
use legitimacy_engine::sink::{ArtifactKind, SqliteArtifactStore};
use legitimacy_engine::EngineSettings;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = EngineSettings::from_env();
    let config = settings.resolution_config()?;
    let store = SqliteArtifactStore::open(&settings.sqlite_path, settings.recent_index_cap)
        .with_context(|| format!("opening {}", settings.sqlite_path))?;
    let source = JsonlEventSource::new(&settings.events_path);

    let mut failed = Vec::new();
    for community_id in &settings.community_ids {
        let stored = store
            .load_season(community_id, &settings.season_id)?
            .with_context(|| {
                format!("no stored artifact for {}/{}", community_id, settings.season_id)
            })?;
        let events = source
            .list(community_id, stored.window.start_ms, stored.window.end_ms)
            .await?;
        let report = verify_replay(&stored, &events, &config)?;

        let verdict_match = store
            .get(community_id, &settings.season_id, ArtifactKind::Verdict)?
            .map(|v| v.content_hash == report.replayed_verdict_hash);
        println!(
            "{}",
            json!({
                "report": report,
                "verdict_match": verdict_match,
            })
        );
        if !report.is_exact() || verdict_match == Some(false) {
            failed.push(community_id.clone());
        }
    }

    if !failed.is_empty() {
        bail!("replay mismatch for {}", failed.join(", "));
    }
    Ok(())
}
