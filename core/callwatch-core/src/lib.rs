//! # callwatch-core
//!
//! Session-synchronization core for the callwatch operator console: keeps the
//! live-call registry, per-call subscriptions, transcripts, escalations and
//! operator availability consistent across an unreliable push channel and a
//! slower snapshot poll.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. The driver owns sockets,
//!   HTTP and timers and feeds results in.
//! - **Not thread-safe**: One [`MonitorEngine`] per operator session, owned by
//!   a single event loop.
//! - **Failures resolve into state**: Event processing never returns errors.
//!   Only operator-initiated operations and configuration do.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use callwatch_core::{load_config, MonitorEngine};
//!
//! let config = load_config(None)?;
//! let mut engine = MonitorEngine::new(&config);
//! engine.poll_due();
//! let commands = engine.take_commands();
//! ```

pub mod availability;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod monitor;
pub mod patterns;
pub mod registry;
pub mod subscriptions;
pub mod transcript;
pub mod types;

pub use availability::{AvailabilityState, AvailabilityTracker, OperatorAvailability};
pub use config::{callwatch_dir, default_config_path, load_config, MonitorConfig};
pub use connection::{
    is_token_shaped, AckOutcome, ConnectionManager, ConnectionPhase, Dial, FrameSink, HandlerId,
    ReconnectBackoff, ReconnectPlan,
};
pub use engine::{Command, MonitorEngine, Notification};
pub use error::{CallwatchError, Result};
pub use escalation::{EscalationClosure, EscalationQueue, EscalationRequest, Resolution};
pub use monitor::CallMonitor;
pub use patterns::display_identity;
pub use registry::{ActiveCallRegistry, RegistryChange, SnapshotOutcome};
pub use subscriptions::{SubscriptionCoordinator, SubscriptionPhase};
pub use transcript::{CallTranscript, Speaker, TranscriptEntry, TranscriptFragment};
pub use types::CallSession;
