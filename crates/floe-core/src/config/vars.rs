//! Environment variable interpolation for config files.
//!
//! - `$VAR` or `${VAR}` substitutes the value and fails if it is unset
//! - `${VAR:-default}` falls back when VAR is unset or empty
//! - `${VAR-default}` falls back only when VAR is unset
//! - `$$` is a literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        |
        \$\{
            (?P<braced>[A-Za-z_][A-Za-z0-9_]*)
            (?: (?P<op>:?-) (?P<default>[^}]*) )?
        \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("valid interpolation pattern")
});

/// Result of environment variable interpolation.
#[derive(Debug)]
pub struct InterpolationResult {
    pub text: String,
    /// Every problem found; interpolation does not stop at the first one.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

fn resolve(caps: &Captures) -> Result<String, String> {
    let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
        return Ok("$".to_string());
    };
    let name = name.as_str();
    let default = caps.name("default").map(|m| m.as_str());
    let empty_uses_default = caps.name("op").is_some_and(|op| op.as_str() == ":-");

    match env::var(name) {
        Ok(value) if value.contains(['\n', '\r']) => Err(format!(
            "environment variable '{name}' contains newlines, which is not allowed"
        )),
        Ok(value) if value.is_empty() && empty_uses_default => {
            Ok(default.unwrap_or_default().to_string())
        }
        Ok(value) => Ok(value),
        Err(_) => default
            .map(str::to_string)
            .ok_or_else(|| format!("environment variable '{name}' is not set")),
    }
}

/// Interpolate environment variables in `input`.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &Captures| match resolve(caps) {
            Ok(value) => value,
            Err(message) => {
                errors.push(message);
                caps[0].to_string()
            }
        })
        .into_owned();

    InterpolationResult { text, errors }
}
