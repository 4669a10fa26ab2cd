//! Variable interpolation for `${VAR}`, `${VAR:-default}`, `$VAR` and `$$` patterns

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Regex for matching interpolation patterns: `$$`, `${...}` or `$NAME`
static INTERPOLATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:(\$)|\{([^}]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("interpolation pattern is a valid regex")
});

/// Regex for the inside of a braced expression: `NAME`, `NAME:-x`, `NAME?x`, ...
static BRACED_EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)(?:(:?[-?+])(.*))?$")
        .expect("braced expression pattern is a valid regex")
});

/// Interpolation context containing all available variables
///
/// Lookup order follows compose: the process environment wins over values
/// loaded from the project `.env` file.
#[derive(Debug, Clone)]
pub struct Interpolator {
    /// Variables from the project `.env` file
    pub vars: HashMap<String, String>,
    /// Whether to consult the process environment
    pub use_process_env: bool,
}

impl Default for Interpolator {
    fn default() -> Self {
        Self {
            vars: HashMap::new(),
            use_process_env: true,
        }
    }
}

impl Interpolator {
    /// Create a new interpolator backed by the process environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an interpolator that only sees explicitly added variables
    pub fn isolated() -> Self {
        Self {
            vars: HashMap::new(),
            use_process_env: false,
        }
    }

    /// Add a variable
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Add multiple variables
    pub fn with_vars(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.vars.extend(vars);
        self
    }

    /// Look up a variable, returning `None` when it is unset
    pub fn lookup(&self, name: &str) -> Option<String> {
        if self.use_process_env {
            if let Ok(value) = std::env::var(name) {
                return Some(value);
            }
        }
        self.vars.get(name).cloned()
    }

    /// Interpolate all patterns in a string
    pub fn interpolate(&self, input: &str) -> Result<String, InterpolationError> {
        let mut error: Option<InterpolationError> = None;

        let result = INTERPOLATION_PATTERN.replace_all(input, |caps: &Captures| {
            if error.is_some() {
                return String::new();
            }

            match self.resolve_capture(caps) {
                Ok(value) => value,
                Err(e) => {
                    error = Some(e);
                    String::new()
                }
            }
        });

        if let Some(e) = error {
            return Err(e);
        }

        Ok(result.into_owned())
    }

    /// Interpolate every string scalar of a parsed YAML document in place
    ///
    /// Mapping keys are left untouched.
    pub fn interpolate_value(&self, value: &mut serde_yaml::Value) -> Result<(), InterpolationError> {
        match value {
            serde_yaml::Value::String(s) => {
                if s.contains('$') {
                    *s = self.interpolate(s)?;
                }
            }
            serde_yaml::Value::Sequence(items) => {
                for item in items {
                    self.interpolate_value(item)?;
                }
            }
            serde_yaml::Value::Mapping(map) => {
                for (_, item) in map.iter_mut() {
                    self.interpolate_value(item)?;
                }
            }
            serde_yaml::Value::Tagged(tagged) => self.interpolate_value(&mut tagged.value)?,
            _ => {}
        }
        Ok(())
    }

    /// Resolve a single capture group
    fn resolve_capture(&self, caps: &Captures) -> Result<String, InterpolationError> {
        // $$ - literal dollar
        if caps.get(1).is_some() {
            return Ok("$".to_string());
        }

        // ${...}
        if let Some(expr) = caps.get(2) {
            return self.resolve_braced(expr.as_str());
        }

        // $NAME
        if let Some(name) = caps.get(3) {
            return Ok(self.resolve_plain(name.as_str()));
        }

        Err(InterpolationError::InvalidExpression(
            caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
        ))
    }

    fn resolve_plain(&self, name: &str) -> String {
        self.lookup(name).unwrap_or_else(|| {
            log::warn!("Variable '{}' is not set, defaulting to a blank string", name);
            String::new()
        })
    }

    /// Resolve a braced expression with an optional modifier
    fn resolve_braced(&self, expr: &str) -> Result<String, InterpolationError> {
        let caps = BRACED_EXPRESSION
            .captures(expr.trim())
            .ok_or_else(|| InterpolationError::InvalidExpression(format!("${{{}}}", expr)))?;

        let name = &caps[1];
        let Some(modifier) = caps.get(2).map(|m| m.as_str()) else {
            return Ok(self.resolve_plain(name));
        };
        let operand = caps.get(3).map(|m| m.as_str()).unwrap_or_default();

        // With a leading ':' an empty value is treated like an unset one
        let value = self.lookup(name);
        let present = if modifier.starts_with(':') {
            value.as_deref().is_some_and(|v| !v.is_empty())
        } else {
            value.is_some()
        };

        match modifier.trim_start_matches(':') {
            "-" => Ok(if present {
                value.unwrap_or_default()
            } else {
                operand.to_string()
            }),
            "?" => {
                if present {
                    Ok(value.unwrap_or_default())
                } else {
                    Err(InterpolationError::Required {
                        name: name.to_string(),
                        message: operand.to_string(),
                    })
                }
            }
            "+" => Ok(if present {
                operand.to_string()
            } else {
                String::new()
            }),
            _ => Err(InterpolationError::InvalidExpression(format!("${{{}}}", expr))),
        }
    }
}

/// Errors that can occur during interpolation
#[derive(Debug, thiserror::Error)]
pub enum InterpolationError {
    #[error("Required variable '{name}' is missing a value: {message}")]
    Required { name: String, message: String },

    #[error("Invalid interpolation expression: {0}")]
    InvalidExpression(String),
}
