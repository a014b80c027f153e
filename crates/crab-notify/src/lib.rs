//! `crab-notify` — alert matching and dispatch for the crab daemon.
//!
//! The [`engine::NotifyEngine`] consumes status deltas from the monitor's
//! fan-out and turns them into alerts: rules filter by host/crabid and a
//! severity floor, repeats are deduplicated per (rule, job) within a
//! cool-down, a per-rule token bucket rate-limits bursts, and delivery
//! goes through pluggable [`transport::Transport`] adapters with
//! exponential-backoff retries. Email (SMTP) and shell-command transports
//! ship in-tree.

pub mod command;
pub mod email;
pub mod engine;
pub mod error;
pub mod format;
pub mod transport;

pub use command::CommandTransport;
pub use email::EmailTransport;
pub use engine::{NotifyConfig, NotifyEngine};
pub use error::TransportError;
pub use transport::{dispatch_with_retry, RetryPolicy, Transport, TransportRegistry};
