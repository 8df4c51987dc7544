//! Seasonal recognition-weight resolution with legitimacy auditing.
//!
//! A run resolves one community's activity window into bounded, normalized
//! weights, audits the outcome, replays it with each protection removed and
//! folds everything into a hash-chained verdict.

pub mod audit;
pub mod canonical;
pub mod config;
pub mod counterfactual;
pub mod events;
pub mod logging;
pub mod observer;
pub mod pipeline;
pub mod replay;
pub mod resolver;
pub mod sink;
pub mod verdict;

pub use config::{ClampMode, EngineSettings, ResolutionConfig};
pub use events::{ActivityEvent, EventSource, EventType, TimeWindow};
pub use pipeline::{Pipeline, PipelineOutcome};
pub use resolver::{resolve_events, run_season, ResolveError, SeasonArtifact, SeasonRequest};
pub use verdict::{LegitimacyVerdict, VerdictState};
