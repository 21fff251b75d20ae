#![deny(clippy::all, warnings)]

//! The beep-python runtime fabric: provision embedded interpreters,
//! catalog runtimes, manage virtual environments and execution sessions,
//! install packages, and run user code with cancellation, timeouts, and
//! captured output.

mod fsops;
mod net;
mod process;

pub mod bootstrap;
pub mod diagnostics;
pub mod engine;
pub mod packages;
pub mod progress;
pub mod provision;
pub mod registry;
pub mod session;
pub mod venv;

pub use bootstrap::{
    BootstrapOptions, BootstrapResult, BootstrapStage, PythonHost, DEFAULT_PYTHON_VERSION,
};
pub use diagnostics::{probe_python, PythonDiagnostics};
pub use engine::{ExecError, ExecOptions, ExecutionEngine};
pub use packages::{PackageError, PackageManager};
pub use process::{RunOutput, StreamedOutput};
pub use progress::{CancellationToken, ProgressSink, ProgressUpdate};
pub use provision::{
    ProvisionError, ProvisionPhase, ProvisionRequest, Provisioner, VerifiedRuntime,
};
pub use registry::{RegistryError, RuntimeRegistry};
pub use session::{SessionError, SessionManager};
pub use venv::{python_executable, EnvError, EnvManager};
