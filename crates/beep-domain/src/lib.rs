#![deny(clippy::all, warnings)]

//! Data model and persisted document schemas for the beep-python runtime
//! host. Everything here is plain data: services live in `beep-core`.

pub mod clock;
pub mod environment;
pub mod execution;
pub mod ids;
pub mod layout;
pub mod packages;
pub mod registry_doc;
pub mod runtime;
pub mod session;

pub use environment::VirtualEnvironment;
pub use execution::{ExecutionResult, ExitKind};
pub use ids::{EnvId, RuntimeId, ScopeHandle, SessionId};
pub use layout::DataLayout;
pub use packages::{
    InstallSource, MessageLevel, PackageOperationResult, PackageRecord, PackageRequirement,
    ProfileDocument,
};
pub use registry_doc::{RegistryDocument, REGISTRY_SCHEMA_VERSION};
pub use runtime::{PythonRuntime, RuntimeKind, RuntimeStatus};
pub use session::{Session, SessionState};
