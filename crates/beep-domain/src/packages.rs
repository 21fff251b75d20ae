use std::str::FromStr;

use indexmap::IndexMap;
use pep440_rs::{Version, VersionSpecifiers};
use pep508_rs::{Requirement as PepRequirement, VersionOrUrl};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PROFILE_SCHEMA_VERSION: &str = "1";

/// Which installer handles a requirement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallSource {
    #[default]
    Pip,
    Conda,
    LocalWheel,
}

/// One desired package, as stored in profile documents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRequirement {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_spec: Option<String>,
    #[serde(default)]
    pub source: InstallSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum RequirementError {
    #[error("unable to parse requirement `{input}`: {reason}")]
    Unparseable { input: String, reason: String },
    #[error("URL requirements are not supported in profiles: `{0}`")]
    UrlRequirement(String),
}

impl PackageRequirement {
    #[must_use]
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_spec: None,
            source: InstallSource::Pip,
            index_url: None,
        }
    }

    #[must_use]
    pub fn pinned(name: impl Into<String>, spec: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_spec: Some(spec.into()),
            source: InstallSource::Pip,
            index_url: None,
        }
    }

    /// Parse a PEP 508 requirement line (`numpy>=1.24`) into a record.
    pub fn parse(input: &str) -> Result<Self, RequirementError> {
        let requirement =
            PepRequirement::from_str(input.trim()).map_err(|err| RequirementError::Unparseable {
                input: input.to_string(),
                reason: err.to_string(),
            })?;
        let version_spec = match requirement.version_or_url {
            Some(VersionOrUrl::VersionSpecifier(specifiers)) => Some(specifiers.to_string()),
            Some(VersionOrUrl::Url(_)) => {
                return Err(RequirementError::UrlRequirement(input.to_string()));
            }
            None => None,
        };
        Ok(Self {
            name: requirement.name.to_string(),
            version_spec,
            source: InstallSource::Pip,
            index_url: None,
        })
    }

    /// The argument handed to the installer (`numpy>=1.24` or `numpy`).
    #[must_use]
    pub fn install_spec(&self) -> String {
        match &self.version_spec {
            Some(spec) => format!("{}{spec}", self.name),
            None => self.name.clone(),
        }
    }

    /// Whether an installed version satisfies this requirement. An
    /// unparseable spec or version is treated as satisfied; pip is the
    /// authority, this check only gates redundant installs.
    #[must_use]
    pub fn accepts_version(&self, version: &str) -> bool {
        let Some(spec) = &self.version_spec else {
            return true;
        };
        match (VersionSpecifiers::from_str(spec), Version::from_str(version)) {
            (Ok(specifiers), Ok(version)) => specifiers.contains(&version),
            _ => true,
        }
    }
}

/// One installed package as reported by the env's installer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub version: String,
}

/// Named requirement lists, persisted as `package-requirements.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProfileDocument {
    pub version: String,
    pub profiles: IndexMap<String, Vec<PackageRequirement>>,
}

impl Default for ProfileDocument {
    fn default() -> Self {
        Self {
            version: PROFILE_SCHEMA_VERSION.to_string(),
            profiles: IndexMap::new(),
        }
    }
}

impl ProfileDocument {
    /// The document written on first run: seed tooling plus the two
    /// profiles the stock workflows expect.
    #[must_use]
    pub fn seeded() -> Self {
        let mut profiles = IndexMap::new();
        profiles.insert(
            "base".to_string(),
            vec![
                PackageRequirement::bare("pip"),
                PackageRequirement::bare("setuptools"),
                PackageRequirement::bare("wheel"),
            ],
        );
        profiles.insert(
            "data-science".to_string(),
            vec![
                PackageRequirement::bare("numpy"),
                PackageRequirement::bare("pandas"),
            ],
        );
        profiles.insert(
            "ml".to_string(),
            vec![
                PackageRequirement::bare("scikit-learn"),
                PackageRequirement::bare("matplotlib"),
            ],
        );
        Self {
            version: PROFILE_SCHEMA_VERSION.to_string(),
            profiles,
        }
    }

    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&[PackageRequirement]> {
        self.profiles.get(name).map(Vec::as_slice)
    }
}

/// Severity attached to a package operation message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

/// Structured outcome of one package operation. `details` carries the raw
/// installer stdout/stderr; `command_executed` is the logical tool command
/// shown to callers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageOperationResult {
    pub success: bool,
    pub level: MessageLevel,
    pub message: String,
    pub package: String,
    pub details: String,
    pub command_executed: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_name_and_specifier() {
        let requirement = PackageRequirement::parse("numpy>=1.24,<2").expect("parse");
        assert_eq!(requirement.name, "numpy");
        let spec = requirement.version_spec.as_deref().expect("spec");
        assert!(spec.contains(">=1.24"));
        assert!(requirement.accepts_version("1.26.4"));
        assert!(!requirement.accepts_version("2.0.0"));
    }

    #[test]
    fn bare_requirement_accepts_anything() {
        let requirement = PackageRequirement::parse("pandas").expect("parse");
        assert_eq!(requirement.version_spec, None);
        assert!(requirement.accepts_version("0.0.1"));
        assert_eq!(requirement.install_spec(), "pandas");
    }

    #[test]
    fn url_requirements_are_rejected() {
        let err = PackageRequirement::parse("pkg @ https://example.invalid/pkg.whl")
            .expect_err("url requirement");
        assert!(matches!(err, RequirementError::UrlRequirement(_)));
    }

    #[test]
    fn profile_document_round_trips_with_schema_names() {
        let doc = ProfileDocument::seeded();
        let json = serde_json::to_value(&doc).expect("serialize");
        assert_eq!(json["version"], "1");
        assert_eq!(json["profiles"]["base"][0]["name"], "pip");
        assert_eq!(json["profiles"]["base"][0]["source"], "pip");

        let parsed: ProfileDocument = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed.profile("data-science").map(<[_]>::len), Some(2));
        assert!(parsed.profile("missing").is_none());
    }

    #[test]
    fn install_spec_appends_the_specifier() {
        let requirement = PackageRequirement::pinned("pandas", "==2.2.2");
        assert_eq!(requirement.install_spec(), "pandas==2.2.2");
    }
}
