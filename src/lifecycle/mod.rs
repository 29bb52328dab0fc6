//! Instance Lifecycle
//!
//! Connect/reconnect, the connection state machine and transition recording.
//! [`state`] holds the pure transition function; [`LifecycleController`] is
//! the only writer of instance status and QR.

mod controller;
pub mod state;

pub use controller::{LifecycleController, ReconnectOutcome, event_for_remote_state};
pub use state::{
    InstanceStatus, InvalidTransition, LifecycleEvent, QrEffect, Transition, transition,
};
