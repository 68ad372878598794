//! # Vigil Engine - Event Correlation for Managed Network Appliances
//!
//! Collects operational and security events from a network controller over
//! several unreliable channels, normalizes them into one event model, and
//! correlates them into deduplicated findings an operator can act on.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              VIGIL ENGINE                                 │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  REALTIME WORKER ─┐                                                       │
//! │  POLLING API ─────┼→ FALLBACK ORCHESTRATOR → CORRELATION → DEDUP STORE    │
//! │  SHELL LOGS ──────┘                                                       │
//! │  STORE QUERY ─────────────────────────────→ THREAT AGGREGATOR             │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The realtime listener runs on its own thread and runtime; everything else
//! is driven sequentially from the caller's context by [`engine::Engine`].

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod buffer;
pub mod client;
pub mod config;
pub mod correlation;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod logging;
pub mod normalize;
pub mod orchestrator;
pub mod realtime;
pub mod shell;
pub mod sources;
pub mod template;
pub mod threat;
pub mod types;
pub mod worker;

pub use buffer::{BufferStats, EventBuffer};
pub use config::VigilConfig;
pub use correlation::CorrelationEngine;
pub use dedup::{DedupKey, DedupStore, MergeOutcome};
pub use engine::{CycleReport, Engine};
pub use error::{CollectionError, CollectorError, ConfigError, VigilError, VigilResult};
pub use orchestrator::{CollectOptions, CollectionReport, FallbackOrchestrator};
pub use sources::EventSource;
pub use threat::{ThreatAggregator, ThreatReport};
pub use types::{BufferedEvent, EventOrigin, Finding, FindingCategory, NormalizedEvent, Severity};
pub use worker::BackgroundWorker;

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "vigil-engine";
pub const ENGINE_FULL_NAME: &str = "Vigil Event Correlation Engine";

// ----------------------------------------------------------------------------
// Buffer & Queue Sizes
// ----------------------------------------------------------------------------

/// Default capacity of the realtime event buffer
pub const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 10_000;

/// Default minimum event count before shell fallback is skipped
pub const DEFAULT_MIN_EVENTS: usize = 10;

/// Default number of log lines fetched per shell collection
pub const DEFAULT_SHELL_MAX_LINES: usize = 5_000;

/// Default number of alert records fetched per store query
pub const DEFAULT_ALERT_QUERY_LIMIT: usize = 10_000;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Timeout for controller HTTP requests (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Timeout for remote shell commands (seconds)
pub const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 30;

/// Pause between realtime reconnect attempts (seconds)
pub const REALTIME_RECONNECT_BACKOFF_SECS: u64 = 5;

/// Timeout for a single realtime connection attempt (seconds)
pub const REALTIME_CONNECT_TIMEOUT_SECS: u64 = 30;

/// How long `stop()` waits for the realtime thread (seconds)
pub const WORKER_STOP_TIMEOUT_SECS: u64 = 5;

/// Tolerated clock skew when filtering by a `since` cutoff (seconds)
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 300;

/// Default interval between collection cycles (seconds)
pub const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 300;

/// Default look-back window for polling the controller (hours)
pub const DEFAULT_POLL_WINDOW_HOURS: u32 = 24;

// ----------------------------------------------------------------------------
// Correlation & Deduplication
// ----------------------------------------------------------------------------

/// Default clustering window for repeated findings (seconds)
pub const DEFAULT_DEDUP_WINDOW_SECS: u64 = 3600;

/// Occurrence count at which a finding is considered recurring
pub const RECURRING_THRESHOLD: u32 = 5;

/// Roam events per subject in one batch that indicate flapping
pub const ROAM_FLAP_THRESHOLD: usize = 5;

/// Placeholder substituted for missing template values
pub const UNKNOWN_TOKEN: &str = "Unknown";

// ----------------------------------------------------------------------------
// Threat Aggregation
// ----------------------------------------------------------------------------

/// Minimum events from one address before it is reported
pub const DEFAULT_SOURCE_THRESHOLD: usize = 10;

/// Signature id range reserved for the paid rule feed
pub const PREMIUM_SIGNATURE_RANGE: std::ops::RangeInclusive<u64> = 2_800_000..=2_899_999;

/// Sample signatures kept per source address
pub const MAX_SAMPLE_SIGNATURES: usize = 3;

// ----------------------------------------------------------------------------
// Network & Protocol
// ----------------------------------------------------------------------------

/// Realtime message kinds forwarded to the buffer; everything else is noise
pub const REALTIME_EVENT_KINDS: &[&str] = &["events", "alarm"];

/// Port of the controller's embedded document store
pub const DEFAULT_STORE_PORT: u16 = 27117;
