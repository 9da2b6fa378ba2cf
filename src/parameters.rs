//! Job parameters and module results.
//!
//! A [`ParameterSet`] keeps insertion order and unique names. Jobs own their set
//! exclusively and hand out clones, so callers never observe in-place merges.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ParameterError;

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(v) => write!(f, "{v}"),
            ParameterValue::Integer(v) => write!(f, "{v}"),
            ParameterValue::Float(v) => write!(f, "{v}"),
            ParameterValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Text(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::Text(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Integer(value)
    }
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        ParameterValue::Integer(i64::from(value))
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ParameterValue,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered parameter store with unique names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    entries: IndexMap<String, ParameterValue>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert that overwrites an existing value.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.entries.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Append a new parameter. Fails if the name is taken.
    pub fn add(&mut self, parameter: Parameter) -> Result<(), ParameterError> {
        if self.entries.contains_key(&parameter.name) {
            return Err(ParameterError::Duplicate(parameter.name));
        }
        self.entries.insert(parameter.name, parameter.value);
        Ok(())
    }

    /// Overwrite the value of an existing parameter, keeping its position.
    pub fn update(
        &mut self,
        name: &str,
        value: impl Into<ParameterValue>,
    ) -> Result<(), ParameterError> {
        match self.entries.get_mut(name) {
            Some(slot) => {
                *slot = value.into();
                Ok(())
            }
            None => Err(ParameterError::NotFound(name.to_string())),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<ParameterValue> {
        self.entries.shift_remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<Parameter> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = Parameter>>(iter: I) -> Self {
        let mut set = ParameterSet::new();
        for parameter in iter {
            set.entries.insert(parameter.name, parameter.value);
        }
        set
    }
}

/// Outcome of a single module invocation. Consumed exactly once by the
/// result interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodResult {
    pub method: String,
    pub exit_status: i32,
    pub errors: Vec<String>,
    pub outputs: ParameterSet,
}

impl MethodResult {
    pub fn success(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            exit_status: 0,
            errors: Vec::new(),
            outputs: ParameterSet::new(),
        }
    }

    pub fn failure(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(method, 1, message)
    }

    /// A failed result with an explicit non-zero exit status.
    pub fn with_status(method: impl Into<String>, exit_status: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            method: method.into(),
            exit_status: if exit_status == 0 { 1 } else { exit_status },
            errors: vec![if message.is_empty() {
                "unknown error".to_string()
            } else {
                message
            }],
            outputs: ParameterSet::new(),
        }
    }

    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.outputs.entries.insert(name.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_status == 0
    }

    pub fn first_error(&self) -> &str {
        self.errors.first().map(String::as_str).unwrap_or("unknown error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_keeps_position() {
        let mut set = ParameterSet::new()
            .with("a", 1)
            .with("b", "two")
            .with("c", true);
        set.update("b", "three").unwrap();

        let names: Vec<_> = set.names().collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(set.get("b"), Some(&ParameterValue::from("three")));
    }

    #[test]
    fn update_missing_parameter_fails() {
        let mut set = ParameterSet::new();
        let err = set.update("batchID", "42").unwrap_err();
        assert_eq!(err, ParameterError::NotFound("batchID".into()));
        assert!(set.is_empty());
    }

    #[test]
    fn add_rejects_duplicates() {
        let mut set = ParameterSet::new().with("a", 1);
        let err = set.add(Parameter::new("a", 2)).unwrap_err();
        assert_eq!(err, ParameterError::Duplicate("a".into()));
        assert_eq!(set.get("a"), Some(&ParameterValue::Integer(1)));
    }

    #[test]
    fn remove_preserves_order_of_rest() {
        let mut set = ParameterSet::new().with("a", 1).with("b", 2).with("c", 3);
        assert_eq!(set.remove("b"), Some(ParameterValue::Integer(2)));
        let names: Vec<_> = set.names().collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn failure_always_has_a_message() {
        let result = MethodResult::with_status("qsub", 0, "");
        assert!(!result.is_success());
        assert_eq!(result.exit_status, 1);
        assert_eq!(result.first_error(), "unknown error");
    }

    #[test]
    fn untagged_values_from_toml() {
        let set: ParameterSet = toml::from_str(
            r#"
            workDir = "/scratch/run1"
            nodes = 4
            walltime = 1.5
            notify = false
            "#,
        )
        .unwrap();
        assert_eq!(set.get("nodes"), Some(&ParameterValue::Integer(4)));
        assert_eq!(set.get("walltime"), Some(&ParameterValue::Float(1.5)));
        assert_eq!(set.get("notify"), Some(&ParameterValue::Bool(false)));
        assert_eq!(set.get("workDir").unwrap().to_string(), "/scratch/run1");
    }
}
