//! External command execution shared by the process-backed workers.

use std::process::{Output, Stdio};

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Number of trailing bytes of output kept in attribute info.
const OUTPUT_TAIL: usize = 512;

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to run {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program:?} cancelled")]
    Cancelled { program: String },
}

/// Run `command` to completion, killing it if `cancel` fires first.
pub async fn run_command(
    cancel: &CancellationToken,
    mut command: Command,
) -> Result<Output, CommandError> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(program = %program, "Running command");

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CommandError::Cancelled { program }),
        output = command.output() => {
            output.map_err(|source| CommandError::Spawn { program, source })
        }
    }
}

/// Last few hundred bytes of combined output, trimmed.
pub fn output_tail(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.trim().is_empty() {
            text.push('\n');
        }
        text.push_str(&stderr);
    }

    let text = text.trim();
    if text.len() <= OUTPUT_TAIL {
        return text.to_string();
    }

    let mut start = text.len() - OUTPUT_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
