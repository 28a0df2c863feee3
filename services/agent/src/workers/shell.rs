//! Shell attribute: run a program to completion.
//!
//! `Value` is the program, `Args` its arguments. A run that exits non-zero
//! still counts as a finished attempt, with the failure recorded in the
//! attribute error so the achiever retries it.

use anyhow::anyhow;
use async_trait::async_trait;
use tether_state::{ActualStatus, Attempt, DesiredAttribute, Microcontroller};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::command::{output_tail, run_command, CommandError};

#[derive(Debug, Default)]
pub struct ShellMicrocontroller;

impl ShellMicrocontroller {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Microcontroller for ShellMicrocontroller {
    async fn achieve(&mut self, cancel: &CancellationToken, desired: &DesiredAttribute) -> Attempt {
        if desired.value.trim().is_empty() {
            return Attempt::failed(
                ActualStatus::Undefined,
                "",
                anyhow!("shell attribute has no program"),
            );
        }

        let mut command = Command::new(&desired.value);
        command.args(&desired.args);

        match run_command(cancel, command).await {
            Ok(output) if output.status.success() => {
                debug!(program = %desired.value, offset = %desired.offset, "Shell attribute ran");
                Attempt::finished(output_tail(&output))
            }
            Ok(output) => {
                let tail = output_tail(&output);
                warn!(program = %desired.value, status = %output.status, "Shell attribute failed");
                Attempt::failed(
                    ActualStatus::Finished,
                    tail.clone(),
                    anyhow!("{} exited with {}: {}", desired.value, output.status, tail),
                )
            }
            Err(e @ CommandError::Cancelled { .. }) => {
                Attempt::failed(ActualStatus::InProgress, "", e)
            }
            Err(e) => Attempt::failed(ActualStatus::Pending, "", e),
        }
    }
}
