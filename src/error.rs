// This file is part of the impexpd disk-transfer supervisor.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// The error taxonomy for the whole run. Every variant maps to an exit code
/// via [`SupervisorError::exit_code`] and, except for [`SupervisorError::Config`],
/// is also expected to be written into `error_message` in the status file
/// before the process exits.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("{0}")]
    Config(String),

    #[error("Verification attempt of selected compression method '{name}' failed: {reason}")]
    ToolUnavailable { name: String, reason: String },

    #[error("failed to spawn child pipeline")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Unhandled(#[from] anyhow::Error),
}

impl SupervisorError {
    /// The process exit code this error should produce, given the
    /// configured generic failure code (no CLI flag sets this; it
    /// defaults to 1, the conventional `RTN_FAILURE`).
    pub fn exit_code(&self, failure_code: i32) -> i32 {
        match self {
            Self::Spawn(_) => 127,
            _ => failure_code,
        }
    }

    pub(crate) fn tool_unavailable(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ToolUnavailable {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
