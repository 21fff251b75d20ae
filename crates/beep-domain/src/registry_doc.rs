use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ids::RuntimeId;
use crate::runtime::PythonRuntime;

pub const REGISTRY_SCHEMA_VERSION: &str = "1.0";

/// The on-disk catalog of runtimes; source of truth across restarts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub version: String,
    #[serde(rename = "defaultRuntimeId")]
    pub default_runtime_id: Option<RuntimeId>,
    pub runtimes: Vec<PythonRuntime>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: REGISTRY_SCHEMA_VERSION.to_string(),
            default_runtime_id: None,
            runtimes: Vec::new(),
        }
    }
}

impl RegistryDocument {
    #[must_use]
    pub fn find(&self, id: &RuntimeId) -> Option<&PythonRuntime> {
        self.runtimes.iter().find(|runtime| &runtime.id == id)
    }

    pub fn find_mut(&mut self, id: &RuntimeId) -> Option<&mut PythonRuntime> {
        self.runtimes.iter_mut().find(|runtime| &runtime.id == id)
    }

    #[must_use]
    pub fn find_by_path(&self, path: &Path) -> Option<&PythonRuntime> {
        self.runtimes.iter().find(|runtime| runtime.path == path)
    }

    #[must_use]
    pub fn default_runtime(&self) -> Option<&PythonRuntime> {
        self.default_runtime_id
            .as_ref()
            .and_then(|id| self.find(id))
    }

    /// Insert a record, replacing any existing record with the same path.
    /// The existing record's id is preserved so callers holding the id do
    /// not see it change across a rediscovery.
    pub fn upsert_by_path(&mut self, mut record: PythonRuntime) -> RuntimeId {
        if let Some(existing) = self
            .runtimes
            .iter_mut()
            .find(|runtime| runtime.path == record.path)
        {
            record.id = existing.id.clone();
            record.created_at = existing.created_at.clone();
            *existing = record;
            return existing.id.clone();
        }
        let id = record.id.clone();
        self.runtimes.push(record);
        id
    }

    pub fn remove(&mut self, id: &RuntimeId) -> Option<PythonRuntime> {
        let pos = self.runtimes.iter().position(|runtime| &runtime.id == id)?;
        let removed = self.runtimes.remove(pos);
        if self.default_runtime_id.as_ref() == Some(id) {
            // Promote any remaining runtime so the default stays valid.
            self.default_runtime_id = self.runtimes.first().map(|runtime| runtime.id.clone());
        }
        Some(removed)
    }

    /// Invariants: pairwise-distinct ids and paths; the default references
    /// an existing record, or is None only when the registry is empty.
    pub fn validate(&self) -> Result<(), String> {
        for (index, runtime) in self.runtimes.iter().enumerate() {
            for other in &self.runtimes[index + 1..] {
                if runtime.id == other.id {
                    return Err(format!("duplicate runtime id {}", runtime.id));
                }
                if runtime.path == other.path {
                    return Err(format!("duplicate runtime path {}", runtime.path.display()));
                }
            }
        }
        match &self.default_runtime_id {
            Some(id) if self.find(id).is_none() => {
                Err(format!("default runtime {id} is not in the registry"))
            }
            None if !self.runtimes.is_empty() => {
                Err("registry has runtimes but no default".to_string())
            }
            _ => Ok(()),
        }
    }
}
