#![deny(clippy::all, warnings)]

//! The uniform workflow-action contract: typed in/out parameters,
//! fail-fast validation, `Started`/`Running`/`Ended` events, idempotent
//! stop, and DAG composition with success-gated successors. Data-frame
//! steps and a generic run-code step demonstrate the contract over the
//! execution engine.

pub mod action;
pub mod actions;
pub mod chain;
pub mod events;
pub mod params;

pub use action::{ActionBody, ActionEventType, ActionResult, WorkflowAction};
pub use actions::{AddColumnBody, CreateDataFrameBody, RunCodeBody, SessionCodeRunner};
pub use chain::{ActionChain, ChainError, ChainOutcome};
pub use events::{
    ActionDescriptor, ActionEvent, ActionEventKind, ActionId, ActionObserver, ActionProgress,
};
pub use params::{Parameter, ParameterValue, Parameters, ValidationError};
