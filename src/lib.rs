//! Credential profile store and rate-limit failover engine for AI coding
//! agents.
//!
//! Holds multiple credential profiles (OAuth accounts or API keys), each with
//! its own isolated credential directory, and routes subprocess launches to
//! whichever profile is currently usable: a versioned persistent store, a
//! pure classifier over captured subprocess output, a recurring usage
//! monitor, and a selection policy that swaps profiles reactively on
//! rate-limit hits and proactively on usage thresholds.

pub mod config;
pub mod credential_dir;
pub mod credentials;
pub mod detector;
pub mod monitor;
pub mod profile;
pub mod selector;
pub mod service;
pub mod store;
pub mod usage;

#[cfg(test)]
pub mod test_support;

pub use detector::{classify, RateLimitDetection};
pub use monitor::{SwapSignal, UsageMonitor};
pub use profile::{AutoSwitchSettings, LimitKind, Profile, ProfileKind, SwitchMode};
pub use selector::SwapReason;
pub use service::{FailoverService, ProfileEnv};
