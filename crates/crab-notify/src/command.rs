//! Shell-command transport: the rule's address is a command line, run
//! under the configured shell with the alert body piped to stdin and the
//! subject exported as `CRAB_SUBJECT`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crab_core::config::CommandTransportConfig;

use crate::error::{Result, TransportError};
use crate::transport::Transport;

/// Commands that neither read stdin nor exit get killed after this long.
const COMMAND_TIMEOUT_SECS: u64 = 60;

pub struct CommandTransport {
    config: CommandTransportConfig,
}

impl CommandTransport {
    pub fn new(config: CommandTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for CommandTransport {
    fn name(&self) -> &str {
        "command"
    }

    async fn dispatch(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        let mut child = Command::new(&self.config.shell)
            .arg("-c")
            .arg(address)
            .env("CRAB_SUBJECT", subject)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Dispatch(format!("spawn {address:?}: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(body.as_bytes())
                .await
                .map_err(|e| TransportError::Dispatch(format!("write stdin: {e}")))?;
            // Close stdin so line-readers terminate.
            drop(stdin);
        }

        let output = tokio::time::timeout(
            std::time::Duration::from_secs(COMMAND_TIMEOUT_SECS),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| TransportError::Dispatch(format!("command timed out: {address:?}")))?
        .map_err(|e| TransportError::Dispatch(format!("wait: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(TransportError::Dispatch(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}
