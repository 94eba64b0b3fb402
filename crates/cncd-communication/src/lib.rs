//! # cncd-communication
//!
//! Transports, streaming state machines, and firmware dialects for the
//! cncd daemon. Each open connection is owned by a [`Controller`] task
//! composing a [`Sender`] (program streaming under flow control), a
//! [`Feeder`] (ad-hoc command queue), a [`Workflow`] lifecycle FSM, and a
//! firmware [`firmware::Dialect`] that parses the wire into typed events.

pub mod controller;
pub mod event_trigger;
pub mod events;
pub mod feeder;
pub mod firmware;
pub mod sender;
pub mod transport;
pub mod workflow;

pub use controller::{Controller, ControllerDeps, ControllerHandle, Request};
pub use event_trigger::{EventTrigger, SystemAction};
pub use events::Push;
pub use feeder::{Feeder, FeederData, FeederStatus};
pub use firmware::{ControllerKind, Dialect, RunnerEvent, StatusReport};
pub use sender::{Sender, SenderOutput, SenderStatus, StreamingMode, WAIT_TRAILER};
pub use transport::{list_ports, ConnectionOptions, LineBuffer, Transport, TransportEvent};
pub use workflow::{Workflow, WorkflowState};
