//! Microcontrollers for the attribute kinds this agent manages.

mod agent_binary;
mod command;
mod docker;
mod shell;

use tether_state::{AttributeKind, Factories};

pub use agent_binary::{AgentBinaryMicrocontroller, AGENT_VERSION};
pub use command::{output_tail, run_command, CommandError};
pub use docker::DockerStackMicrocontroller;
pub use shell::ShellMicrocontroller;

/// Factory table covering every built-in attribute kind.
pub fn default_factories() -> Factories {
    Factories::new()
        .with(AttributeKind::DockerStack, DockerStackMicrocontroller::new)
        .with(AttributeKind::AgentBinary, AgentBinaryMicrocontroller::new)
        .with(AttributeKind::Shell, ShellMicrocontroller::new)
}
