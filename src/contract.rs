use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fully materialized process environment handed to a stage.
pub type Environment = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("environment variable '{key}' is missing or empty")]
    MissingKey { key: String },
    #[error("environment variable '{key}' expected '{expected}' but found '{actual}'")]
    ValueMismatch {
        key: String,
        expected: String,
        actual: String,
    },
}

impl ContractViolation {
    pub fn key(&self) -> &str {
        match self {
            ContractViolation::MissingKey { key } => key,
            ContractViolation::ValueMismatch { key, .. } => key,
        }
    }
}

/// Errors raised while building a contract from a definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("contract entry has an empty key")]
    EmptyKey,
    #[error("contract key '{0}' is declared more than once")]
    DuplicateKey(String),
    #[error("invalid contract entry '{0}'")]
    InvalidEntry(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractEntry {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ContractEntry {
    pub fn presence(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Parses `KEY=VALUE` (value check) or `KEY` (presence check).
    pub fn parse(raw: &str) -> Result<Self, ContractError> {
        let raw = raw.trim();
        let (key, value) = match raw.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value.to_string())),
            None => (raw, None),
        };
        if key.is_empty() {
            return Err(if raw.is_empty() {
                ContractError::EmptyKey
            } else {
                ContractError::InvalidEntry(raw.to_string())
            });
        }
        if key.chars().any(char::is_whitespace) {
            return Err(ContractError::InvalidEntry(raw.to_string()));
        }
        Ok(Self {
            key: key.to_string(),
            value,
        })
    }
}

impl fmt::Display for ContractEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.key, value),
            None => f.write_str(&self.key),
        }
    }
}

/// Definition-side form: either a `KEY=VALUE` shorthand or a `{key, value}` map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContractEntrySpec {
    Shorthand(String),
    Entry(ContractEntry),
}

impl ContractEntrySpec {
    pub fn resolve(&self) -> Result<ContractEntry, ContractError> {
        match self {
            ContractEntrySpec::Shorthand(raw) => ContractEntry::parse(raw),
            ContractEntrySpec::Entry(entry) => {
                if entry.key.trim().is_empty() {
                    return Err(ContractError::EmptyKey);
                }
                Ok(entry.clone())
            }
        }
    }
}

/// Ordered, immutable set of environment requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentContract {
    entries: Vec<ContractEntry>,
}

impl EnvironmentContract {
    pub fn new(entries: impl IntoIterator<Item = ContractEntry>) -> Result<Self, ContractError> {
        let entries: Vec<ContractEntry> = entries.into_iter().collect();
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if entry.key.is_empty() {
                return Err(ContractError::EmptyKey);
            }
            if !seen.insert(entry.key.as_str()) {
                return Err(ContractError::DuplicateKey(entry.key.clone()));
            }
        }
        Ok(Self { entries })
    }

    pub fn from_specs(specs: &[ContractEntrySpec]) -> Result<Self, ContractError> {
        let entries = specs
            .iter()
            .map(ContractEntrySpec::resolve)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(entries)
    }

    pub fn entries(&self) -> &[ContractEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.key.as_str())
    }

    /// Checks `actual` against every entry and returns the first violation.
    pub fn verify(&self, actual: &Environment) -> Result<(), ContractViolation> {
        match self.entries.iter().find_map(|entry| check_entry(entry, actual)) {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    pub fn violations(&self, actual: &Environment) -> Vec<ContractViolation> {
        self.entries
            .iter()
            .filter_map(|entry| check_entry(entry, actual))
            .collect()
    }
}

fn check_entry(entry: &ContractEntry, actual: &Environment) -> Option<ContractViolation> {
    // An empty value counts as unset.
    let found = match actual.get(&entry.key) {
        Some(value) if !value.is_empty() => value,
        _ => {
            return Some(ContractViolation::MissingKey {
                key: entry.key.clone(),
            });
        }
    };
    match &entry.value {
        Some(expected) if expected != found => Some(ContractViolation::ValueMismatch {
            key: entry.key.clone(),
            expected: expected.clone(),
            actual: found.clone(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_parsing() {
        assert_eq!(
            ContractEntry::parse("MODE=training").unwrap(),
            ContractEntry::equals("MODE", "training")
        );
        assert_eq!(
            ContractEntry::parse("S3_BUCKET").unwrap(),
            ContractEntry::presence("S3_BUCKET")
        );
        assert_eq!(
            ContractEntry::parse("URL=a=b").unwrap(),
            ContractEntry::equals("URL", "a=b")
        );
        assert_eq!(ContractEntry::parse(""), Err(ContractError::EmptyKey));
        assert!(matches!(
            ContractEntry::parse("=value"),
            Err(ContractError::InvalidEntry(_))
        ));
    }

    #[test]
    fn violations_reports_every_entry() {
        let contract = EnvironmentContract::new([
            ContractEntry::equals("MODE", "training"),
            ContractEntry::presence("TOKEN"),
        ])
        .unwrap();
        let mut env = Environment::new();
        env.insert("MODE".into(), "save".into());
        let violations = contract.violations(&env);
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].key(), "MODE");
        assert_eq!(violations[1].key(), "TOKEN");
    }
}
