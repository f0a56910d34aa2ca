//! Command/response vocabulary of the motion-controller firmware.
//!
//! The controller understands a fixed set of line commands, each acknowledged
//! by a fixed response line once the action has completed. The table here is
//! plain data consumed by [`crate::WatchdogCommand`]; the engine itself
//! treats every string as an opaque token compared by equality.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::LinkResult;
use crate::waiter::timeout_from_secs;

/// Message the controller emits after a successful startup. Wait-only; there
/// is no command that provokes it.
pub const READY_MESSAGE: &str = "controller_ready";

/// An outgoing command paired with the response that acknowledges it.
///
/// Deserializable so command tables can come from configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Line sent to the controller.
    pub outgoing: String,
    /// Response line that completes the command.
    pub expected: String,
    /// Default timeout in seconds; absent means wait indefinitely.
    #[serde(default)]
    pub timeout_secs: Option<f64>,
}

impl CommandSpec {
    /// Create a spec with no default timeout.
    pub fn new(outgoing: impl Into<String>, expected: impl Into<String>) -> Self {
        CommandSpec {
            outgoing: outgoing.into(),
            expected: expected.into(),
            timeout_secs: None,
        }
    }

    /// Validated default timeout.
    pub fn timeout(&self) -> LinkResult<Option<Duration>> {
        self.timeout_secs.map(timeout_from_secs).transpose()
    }
}

/// Commands understood by the motion-controller firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCommand {
    /// Probe the link (`connect` / `connected`).
    Connect,
    /// Move the sample out of the beam (`move_out` / `pos_out`).
    MoveOut,
    /// Move the sample into the beam (`move_in` / `pos_in`).
    MoveIn,
    /// Stop linear movement (`stop_lin` / `lin_stopped`).
    StopLinear,
    /// Rotate clockwise by the given steps (`rot_cw+<steps>` / `rot_stopped`).
    RotateCw {
        /// Steps to rotate, rendered in decimal with no leading zeros.
        steps: u32,
    },
    /// Rotate counterclockwise by the given steps (`rot_ccw+<steps>` /
    /// `rot_stopped`).
    RotateCcw {
        /// Steps to rotate.
        steps: u32,
    },
    /// Stop rotational movement (`stop_rot` / `rot_stopped`).
    StopRotation,
    /// Stop all movement (`stop_all` / `all_stopped`).
    StopAll,
    /// Open the shutter (`open_shutter` / `shutter_opened`).
    OpenShutter,
    /// Close the shutter (`close_shutter` / `shutter_closed`).
    CloseShutter,
}

impl ControllerCommand {
    /// The line sent to the controller.
    pub fn outgoing(&self) -> String {
        match self {
            ControllerCommand::Connect => "connect".to_string(),
            ControllerCommand::MoveOut => "move_out".to_string(),
            ControllerCommand::MoveIn => "move_in".to_string(),
            ControllerCommand::StopLinear => "stop_lin".to_string(),
            ControllerCommand::RotateCw { steps } => format!("rot_cw+{steps}"),
            ControllerCommand::RotateCcw { steps } => format!("rot_ccw+{steps}"),
            ControllerCommand::StopRotation => "stop_rot".to_string(),
            ControllerCommand::StopAll => "stop_all".to_string(),
            ControllerCommand::OpenShutter => "open_shutter".to_string(),
            ControllerCommand::CloseShutter => "close_shutter".to_string(),
        }
    }

    /// The response line acknowledging the command.
    pub fn expected(&self) -> &'static str {
        match self {
            ControllerCommand::Connect => "connected",
            ControllerCommand::MoveOut => "pos_out",
            ControllerCommand::MoveIn => "pos_in",
            ControllerCommand::StopLinear => "lin_stopped",
            ControllerCommand::RotateCw { .. } | ControllerCommand::RotateCcw { .. } => {
                "rot_stopped"
            }
            ControllerCommand::StopRotation => "rot_stopped",
            ControllerCommand::StopAll => "all_stopped",
            ControllerCommand::OpenShutter => "shutter_opened",
            ControllerCommand::CloseShutter => "shutter_closed",
        }
    }

    /// The command as a data entry.
    pub fn spec(&self) -> CommandSpec {
        CommandSpec::new(self.outgoing(), self.expected())
    }
}
