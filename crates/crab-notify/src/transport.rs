use std::collections::HashMap;

use async_trait::async_trait;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crab_core::config::TransportSection;

use crate::command::CommandTransport;
use crate::email::EmailTransport;
use crate::error::{Result, TransportError};

/// Common interface implemented by every alert transport (email, shell
/// command, …).
///
/// Implementations must be `Send + Sync` so they can be stored in a
/// [`TransportRegistry`] and driven from concurrent dispatch tasks;
/// `dispatch` takes `&self` so one transport can deliver concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable lowercase identifier, matched against a rule's `method`.
    fn name(&self) -> &str;

    /// Deliver a single alert to one address.
    async fn dispatch(&self, address: &str, subject: &str, body: &str) -> Result<()>;
}

/// Maps configured transport names to constructed adapters.
///
/// Construction is by name lookup only; a rule whose `method` has no entry
/// fails that rule's dispatch without touching the others.
#[derive(Default)]
pub struct TransportRegistry {
    transports: HashMap<String, Box<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from the `[transport.*]` config tables.
    pub fn from_config(section: &TransportSection) -> Self {
        let mut registry = Self::new();
        if let Some(email) = &section.email {
            registry.register(Box::new(EmailTransport::new(email.clone())));
        }
        if let Some(command) = &section.command {
            registry.register(Box::new(CommandTransport::new(command.clone())));
        }
        registry
    }

    /// Register a transport adapter. A same-named one is replaced.
    pub fn register(&mut self, transport: Box<dyn Transport>) {
        let name = transport.name().to_string();
        info!(transport = %name, "registering alert transport");
        self.transports.insert(name, transport);
    }

    pub fn get(&self, name: &str) -> Result<&(dyn Transport)> {
        self.transports
            .get(name)
            .map(|t| t.as_ref())
            .ok_or_else(|| TransportError::Unknown(name.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

/// Retry schedule for a failing dispatch.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // 5 s -> 10 s -> 20 s -> ... capped at 5 minutes.
        RetryPolicy {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
            max_attempts: 5,
        }
    }
}

/// Dispatch with exponential backoff.
///
/// Returns the number of attempts it took on success, or the final error
/// with the attempt count once the policy is exhausted.
pub async fn dispatch_with_retry(
    transport: &dyn Transport,
    address: &str,
    subject: &str,
    body: &str,
    policy: &RetryPolicy,
) -> std::result::Result<u32, (u32, TransportError)> {
    let mut delay = policy.base;

    for attempt in 1..=policy.max_attempts {
        match transport.dispatch(address, subject, body).await {
            Ok(()) => return Ok(attempt),
            Err(e) if attempt == policy.max_attempts => return Err((attempt, e)),
            Err(e) => {
                warn!(
                    transport = transport.name(),
                    %address,
                    attempt,
                    max = policy.max_attempts,
                    retry_after = ?delay,
                    "dispatch failed, retrying with backoff: {e}"
                );
                sleep(delay).await;
                delay = (delay * 2).min(policy.cap);
            }
        }
    }

    // Unreachable: the loop always returns inside the match arms above.
    unreachable!("backoff loop exited without returning")
}
