//! DockerStack attribute: deploy a compose file as a swarm stack.
//!
//! `Args[0]` is the compose file, `Args[1]` the stack name and `Value` the
//! stack version, exposed to the compose file as `STACK_VERSION`.

use std::ffi::OsString;

use anyhow::anyhow;
use async_trait::async_trait;
use tether_state::{ActualStatus, Attempt, DesiredAttribute, Microcontroller};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::command::{output_tail, run_command, CommandError};

const DOCKER_BINARY: &str = "docker";

#[derive(Debug)]
pub struct DockerStackMicrocontroller {
    binary: OsString,
}

impl DockerStackMicrocontroller {
    pub fn new() -> Self {
        Self::with_binary(DOCKER_BINARY)
    }

    /// Use a specific docker CLI.
    pub fn with_binary(binary: impl Into<OsString>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for DockerStackMicrocontroller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Microcontroller for DockerStackMicrocontroller {
    async fn achieve(&mut self, cancel: &CancellationToken, desired: &DesiredAttribute) -> Attempt {
        let (compose_file, stack) = match desired.args.as_slice() {
            [compose_file, stack, ..] => (compose_file, stack),
            _ => {
                return Attempt::failed(
                    ActualStatus::Undefined,
                    "",
                    anyhow!("docker stack attribute needs Args [compose file, stack name]"),
                )
            }
        };

        let mut command = Command::new(&self.binary);
        command
            .args(["stack", "deploy", "--compose-file"])
            .arg(compose_file)
            .arg(stack)
            .env("STACK_VERSION", &desired.value);

        match run_command(cancel, command).await {
            Ok(output) if output.status.success() => {
                info!(stack = %stack, version = %desired.value, "Stack deployed");
                Attempt::finished(output_tail(&output))
            }
            Ok(output) => {
                let tail = output_tail(&output);
                warn!(stack = %stack, status = %output.status, "Stack deploy failed");
                Attempt::failed(
                    ActualStatus::Pending,
                    tail.clone(),
                    anyhow!("docker stack deploy {stack} exited with {}: {tail}", output.status),
                )
            }
            Err(e @ CommandError::Cancelled { .. }) => {
                Attempt::failed(ActualStatus::InProgress, "", e)
            }
            Err(e) => Attempt::failed(ActualStatus::Pending, "", e),
        }
    }
}
