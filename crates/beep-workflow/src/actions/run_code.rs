use beep_core::{CancellationToken, ProgressSink};

use super::SessionCodeRunner;
use crate::action::{ActionBody, ActionResult};
use crate::params::Parameters;

/// Runs an arbitrary snippet in the bound session. The generic escape
/// hatch for steps that have no dedicated body.
pub struct RunCodeBody {
    runner: SessionCodeRunner,
}

impl RunCodeBody {
    #[must_use]
    pub fn new(runner: SessionCodeRunner) -> Self {
        Self { runner }
    }
}

impl ActionBody for RunCodeBody {
    fn type_name(&self) -> &'static str {
        "run_code"
    }

    fn required_inputs(&self) -> &'static [&'static str] {
        &["code"]
    }

    fn execute(
        &self,
        inputs: &Parameters,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ActionResult> {
        let code = inputs.require_str("code")?;
        self.runner.run(code, progress, cancel)
    }
}
