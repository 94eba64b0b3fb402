//! Program lifecycle state machine
//!
//! Three states: Idle, Running, Paused. The Controller arranges the side
//! effects of each transition (rewinding or holding the Sender, resetting
//! the Feeder); this type only guards the transitions themselves.

use cncd_core::HoldReason;
use serde::{Deserialize, Serialize};

/// Program execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    /// No program running
    #[default]
    Idle,
    /// Program streaming
    Running,
    /// Program suspended by the operator or an inline sentinel
    Paused,
}

/// Program lifecycle FSM
#[derive(Debug, Default)]
pub struct Workflow {
    state: WorkflowState,
    pause_reason: Option<HoldReason>,
}

impl Workflow {
    /// Create an Idle workflow
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Why the workflow is paused, when it is
    pub fn pause_reason(&self) -> Option<&HoldReason> {
        self.pause_reason.as_ref()
    }

    /// Idle/Paused → Running. Returns true when the state changed.
    pub fn start(&mut self) -> bool {
        if self.state == WorkflowState::Running {
            return false;
        }
        self.state = WorkflowState::Running;
        self.pause_reason = None;
        true
    }

    /// Running → Paused. Returns true when the state changed.
    pub fn pause(&mut self, reason: Option<HoldReason>) -> bool {
        if self.state != WorkflowState::Running {
            return false;
        }
        self.state = WorkflowState::Paused;
        self.pause_reason = reason;
        true
    }

    /// Paused → Running. Returns true when the state changed.
    pub fn resume(&mut self) -> bool {
        if self.state != WorkflowState::Paused {
            return false;
        }
        self.state = WorkflowState::Running;
        self.pause_reason = None;
        true
    }

    /// Any state → Idle. Returns true when the state changed.
    pub fn stop(&mut self) -> bool {
        if self.state == WorkflowState::Idle {
            return false;
        }
        self.state = WorkflowState::Idle;
        self.pause_reason = None;
        true
    }
}
