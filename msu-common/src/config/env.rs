//! Environment variable parsing with type safety.
//!
//! Errors are collected rather than returned one at a time, so a
//! misconfigured host reports every bad variable in a single run.

use super::source::Sourced;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Prefix shared by every preflight environment variable.
pub const ENV_PREFIX: &str = "MSU_PREFLIGHT_";

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    /// Variable set to an empty string where a value is required.
    #[error("Empty value for {var}")]
    Empty { var: String },
}

type Lookup = Box<dyn Fn(&str) -> Option<String>>;

/// Type-safe environment variable parser.
pub struct EnvParser {
    prefix: &'static str,
    lookup: Lookup,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Parser over the process environment.
    pub fn new() -> Self {
        Self {
            prefix: ENV_PREFIX,
            lookup: Box::new(|name| std::env::var(name).ok()),
            errors: Vec::new(),
        }
    }

    /// Parser over a fixed set of variables instead of the process environment.
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self {
            prefix: ENV_PREFIX,
            lookup: Box::new(move |name| vars.get(name).cloned()),
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Get a non-empty string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match (self.lookup)(&var_name) {
            Some(value) if value.trim().is_empty() => {
                self.errors.push(EnvError::Empty { var: var_name });
                Sourced::default_value(default.to_string())
            }
            Some(value) => Sourced::from_env(value, var_name),
            None => Sourced::default_value(default.to_string()),
        }
    }

    /// Get a path value with default.
    pub fn get_path(&mut self, name: &str, default: PathBuf) -> Sourced<PathBuf> {
        let var_name = self.var_name(name);
        match (self.lookup)(&var_name) {
            Some(value) if value.trim().is_empty() => {
                self.errors.push(EnvError::Empty { var: var_name });
                Sourced::default_value(default)
            }
            Some(value) => Sourced::from_env(PathBuf::from(value), var_name),
            None => Sourced::default_value(default),
        }
    }

    /// Get a u32 value with default and range validation.
    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> Sourced<u32> {
        let var_name = self.var_name(name);
        match (self.lookup)(&var_name) {
            Some(value) => match value.trim().parse::<u32>() {
                Ok(n) if (min..=max).contains(&n) => Sourced::from_env(n, var_name),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name,
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::default_value(default)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "unsigned 32-bit integer".to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            None => Sourced::default_value(default),
        }
    }

    /// Get a u64 value with default and range validation.
    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> Sourced<u64> {
        let var_name = self.var_name(name);
        match (self.lookup)(&var_name) {
            Some(value) => match value.trim().parse::<u64>() {
                Ok(n) if (min..=max).contains(&n) => Sourced::from_env(n, var_name),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name,
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::default_value(default)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "unsigned 64-bit integer".to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            None => Sourced::default_value(default),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}
