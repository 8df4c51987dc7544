//! Resolution configuration (hashed data) and process settings (env).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::events::{EventType, TimeWindow};

const DAY_MS: f64 = 86_400_000.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("config {field} is invalid: {reason}")]
    Invalid { field: String, reason: String },
    #[error("cannot read config {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// How the whale cap is enforced after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClampMode {
    /// Pin capped actors and rescale the rest until nobody free exceeds the cap.
    #[default]
    Converge,
    /// One clamp, one proportional redistribution, one renormalize.
    SinglePass,
}

/// Named, versioned bundle of tunables. Hashed in full into `configHash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionConfig {
    pub name: String,
    pub version: String,
    /// Coefficient per event-type tag
    pub type_weights: BTreeMap<String, f64>,
    /// `k` in `1 - e^(-k * raw)`
    pub saturation_k: f64,
    /// Maximum individual share, `0 < max_share <= 1`
    pub max_share: f64,
    /// Minimum counted events for eligibility
    pub min_events: u32,
    /// Decay half-life; `<= 0` disables decay
    pub half_life_ms: f64,
    /// Skip events whose type has no coefficient (else they count at weight 0)
    pub drop_unknown_types: bool,
    #[serde(default)]
    pub clamp_mode: ClampMode,
}

impl ResolutionConfig {
    /// Reference Season-0 preset.
    pub fn season0_default() -> Self {
        let mut type_weights = BTreeMap::new();
        for (t, w) in [
            (EventType::Upvote, 1.0),
            (EventType::Downvote, 0.5),
            (EventType::Comment, 2.0),
            (EventType::ModerationAction, 4.0),
            (EventType::GovernanceProposal, 5.0),
            (EventType::GovernanceVote, 3.0),
            (EventType::CommunityJoin, 0.5),
        ] {
            type_weights.insert(t.as_str().to_string(), w);
        }
        Self {
            name: "season0-default".to_string(),
            version: "1.0.0".to_string(),
            type_weights,
            saturation_k: 0.1,
            max_share: 0.15,
            min_events: 3,
            half_life_ms: 14.0 * DAY_MS,
            drop_unknown_types: true,
            clamp_mode: ClampMode::Converge,
        }
    }

    pub fn weight_for(&self, t: &EventType) -> Option<f64> {
        self.type_weights.get(t.as_str()).copied()
    }

    pub fn set_weight(&mut self, t: &EventType, w: f64) {
        self.type_weights.insert(t.as_str().to_string(), w);
    }

    /// Reject configurations that would silently produce a wrong artifact.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(ConfigError::invalid("version", "must not be empty"));
        }
        for (tag, w) in &self.type_weights {
            if !w.is_finite() || *w < 0.0 {
                return Err(ConfigError::invalid(
                    format!("type_weights.{}", tag),
                    format!("must be finite and >= 0, got {}", w),
                ));
            }
        }
        if !self.saturation_k.is_finite() || self.saturation_k <= 0.0 {
            return Err(ConfigError::invalid(
                "saturation_k",
                format!("must be finite and > 0, got {}", self.saturation_k),
            ));
        }
        if !(self.max_share > 0.0 && self.max_share <= 1.0) {
            return Err(ConfigError::invalid(
                "max_share",
                format!("must be in (0, 1], got {}", self.max_share),
            ));
        }
        if !self.half_life_ms.is_finite() {
            return Err(ConfigError::invalid(
                "half_life_ms",
                format!("must be finite, got {}", self.half_life_ms),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON config.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(text).map_err(|e| ConfigError::Unreadable {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&text).map_err(|e| match e {
            ConfigError::Unreadable { reason, .. } => ConfigError::Unreadable {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self::season0_default()
    }
}

// =============================================================================
// Process settings
// =============================================================================

/// Settings for the binaries, read from the environment.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub season_id: String,
    pub community_ids: Vec<String>,
    pub window_start_ms: u64,
    /// Required; an open-ended window decays every event to nothing
    pub window_end_ms: Option<u64>,
    pub events_path: String,
    pub config_path: Option<String>,
    pub sqlite_path: String,
    pub artifact_log_path: Option<String>,
    pub recent_index_cap: usize,
    pub workers: usize,
}

impl EngineSettings {
    pub fn from_env() -> Self {
        let community_ids = std::env::var("COMMUNITY_IDS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|ids| !ids.is_empty())
            .unwrap_or_else(|| {
                vec![std::env::var("COMMUNITY_ID").unwrap_or_else(|_| "default".to_string())]
            });
        Self {
            season_id: std::env::var("SEASON_ID").unwrap_or_else(|_| "season-0".to_string()),
            community_ids,
            window_start_ms: std::env::var("WINDOW_START_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(0),
            window_end_ms: std::env::var("WINDOW_END_MS").ok().and_then(|v| v.parse().ok()),
            events_path: std::env::var("EVENTS_PATH").unwrap_or_else(|_| "./events.jsonl".to_string()),
            config_path: std::env::var("CONFIG_PATH").ok(),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./artifacts.sqlite".to_string()),
            artifact_log_path: std::env::var("ARTIFACT_LOG_PATH").ok(),
            recent_index_cap: std::env::var("RECENT_INDEX_CAP").ok().and_then(|v| v.parse().ok()).unwrap_or(50),
            workers: std::env::var("WORKERS").ok().and_then(|v| v.parse().ok()).unwrap_or_else(num_cpus::get),
        }
    }

    /// The run window. `WINDOW_END_MS` must be set, finite and after the start.
    pub fn window(&self) -> Result<TimeWindow, ConfigError> {
        let end = match self.window_end_ms {
            None => return Err(ConfigError::invalid("WINDOW_END_MS", "must be set")),
            Some(u64::MAX) => {
                return Err(ConfigError::invalid("WINDOW_END_MS", "must be a bounded timestamp"))
            }
            Some(end) => end,
        };
        let window = TimeWindow::new(self.window_start_ms, end);
        if window.is_empty() {
            return Err(ConfigError::invalid(
                "WINDOW_END_MS",
                format!("must be after WINDOW_START_MS {}", self.window_start_ms),
            ));
        }
        Ok(window)
    }

    /// Load the resolution config named by `CONFIG_PATH`, or the default preset.
    pub fn resolution_config(&self) -> Result<ResolutionConfig, ConfigError> {
        match &self.config_path {
            Some(path) => ResolutionConfig::load(Path::new(path)),
            None => Ok(ResolutionConfig::season0_default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(start: u64, end: Option<u64>) -> EngineSettings {
        EngineSettings {
            season_id: "s0".to_string(),
            community_ids: vec!["c".to_string()],
            window_start_ms: start,
            window_end_ms: end,
            events_path: "events.jsonl".to_string(),
            config_path: None,
            sqlite_path: ":memory:".to_string(),
            artifact_log_path: None,
            recent_index_cap: 50,
            workers: 1,
        }
    }

    #[test]
    fn test_window_requires_bounded_end() {
        let err = settings(0, None).window().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "WINDOW_END_MS"));
        assert!(settings(0, Some(u64::MAX)).window().is_err());
        assert!(settings(500, Some(500)).window().is_err());
        assert_eq!(
            settings(100, Some(200)).window().unwrap(),
            TimeWindow::new(100, 200)
        );
    }

    #[test]
    fn test_default_is_valid() {
        assert!(ResolutionConfig::season0_default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_max_share() {
        for bad in [0.0, -0.1, 1.5, f64::NAN] {
            let cfg = ResolutionConfig {
                max_share: bad,
                ..Default::default()
            };
            assert!(
                matches!(cfg.validate(), Err(ConfigError::Invalid { ref field, .. }) if field == "max_share"),
                "max_share {} should be rejected",
                bad
            );
        }
        let cfg = ResolutionConfig {
            max_share: 1.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_negative_weight() {
        let mut cfg = ResolutionConfig::default();
        cfg.set_weight(&EventType::Downvote, -1.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_non_positive_saturation() {
        let cfg = ResolutionConfig {
            saturation_k: 0.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_defaults_clamp_mode() {
        let mut json = serde_json::to_value(ResolutionConfig::default()).unwrap();
        json.as_object_mut().unwrap().remove("clamp_mode");
        let cfg = ResolutionConfig::from_json(&json.to_string()).unwrap();
        assert_eq!(cfg.clamp_mode, ClampMode::Converge);
        assert_eq!(cfg, ResolutionConfig::default());
    }

    #[test]
    fn test_malformed_json_is_loud() {
        assert!(matches!(
            ResolutionConfig::from_json("{not json"),
            Err(ConfigError::Unreadable { .. })
        ));
    }
}
