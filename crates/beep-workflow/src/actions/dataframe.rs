use beep_core::{CancellationToken, ProgressSink};

use super::SessionCodeRunner;
use crate::action::{ActionBody, ActionResult};
use crate::params::{ParameterValue, Parameters, ValidationError};

fn is_python_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn require_identifier(inputs: &Parameters, name: &str) -> Result<(), ValidationError> {
    let value = inputs.require_str(name)?;
    if is_python_identifier(value) {
        Ok(())
    } else {
        Err(ValidationError::BadArg {
            name: name.to_string(),
            reason: format!("`{value}` is not a valid identifier"),
        })
    }
}

fn build_create_code(name: &str, columns: &[&str]) -> String {
    let columns = serde_json::to_string(columns).unwrap_or_else(|_| "[]".to_string());
    format!("import pandas as pd\n{name} = pd.DataFrame(columns={columns})")
}

fn build_add_column_code(frame: &str, column: &str, data: &str) -> String {
    let column = serde_json::to_string(column).unwrap_or_else(|_| "\"column\"".to_string());
    format!("{frame}[{column}] = {data}")
}

/// Creates an empty data frame named by `name` with the comma-separated
/// columns in `source`.
pub struct CreateDataFrameBody {
    runner: SessionCodeRunner,
}

impl CreateDataFrameBody {
    #[must_use]
    pub fn new(runner: SessionCodeRunner) -> Self {
        Self { runner }
    }
}

impl ActionBody for CreateDataFrameBody {
    fn type_name(&self) -> &'static str {
        "create_dataframe"
    }

    fn required_inputs(&self) -> &'static [&'static str] {
        &["name", "source"]
    }

    fn validate(&self, inputs: &Parameters) -> Result<(), ValidationError> {
        require_identifier(inputs, "name")?;
        let source = inputs.require_str("source")?;
        if source.split(',').all(|column| column.trim().is_empty()) {
            return Err(ValidationError::BadArg {
                name: "source".to_string(),
                reason: "no columns given".to_string(),
            });
        }
        Ok(())
    }

    fn execute(
        &self,
        inputs: &Parameters,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ActionResult> {
        let name = inputs.require_str("name")?;
        let source = inputs.require_str("source")?;
        let columns: Vec<&str> = source
            .split(',')
            .map(str::trim)
            .filter(|column| !column.is_empty())
            .collect();
        let code = build_create_code(name, &columns);
        let mut result = self.runner.run(&code, progress, cancel)?;
        if result.is_success() {
            result.message = format!("created data frame {name}");
            result.output = Some(ParameterValue::Str(name.to_string()));
        }
        Ok(result)
    }
}

/// Derives a new column on an existing frame: `df[col] = <data>`, where
/// `data` is a Python expression evaluated in the session scope.
pub struct AddColumnBody {
    runner: SessionCodeRunner,
}

impl AddColumnBody {
    #[must_use]
    pub fn new(runner: SessionCodeRunner) -> Self {
        Self { runner }
    }
}

impl ActionBody for AddColumnBody {
    fn type_name(&self) -> &'static str {
        "add_column"
    }

    fn required_inputs(&self) -> &'static [&'static str] {
        &["df", "col", "data"]
    }

    fn validate(&self, inputs: &Parameters) -> Result<(), ValidationError> {
        require_identifier(inputs, "df")?;
        inputs.require_str("col")?;
        inputs.require_str("data")?;
        Ok(())
    }

    fn execute(
        &self,
        inputs: &Parameters,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ActionResult> {
        let frame = inputs.require_str("df")?;
        let column = inputs.require_str("col")?;
        let data = inputs.require_str("data")?;
        let code = build_add_column_code(frame, column, data);
        let mut result = self.runner.run(&code, progress, cancel)?;
        if result.is_success() {
            result.message = format!("added column {column} to {frame}");
            result.output = Some(ParameterValue::Str(column.to_string()));
        }
        Ok(result)
    }
}
