//! Environment helpers shared by the `from_env` constructors.

use std::str::FromStr;

/// Trimmed, non-empty environment variable.
pub fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// First set variable in `names`.
pub fn first_var(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| var(name))
}

/// Parsed variable, `None` when unset or unparsable.
pub fn parse<T: FromStr>(name: &str) -> Option<T> {
    var(name).and_then(|v| v.parse().ok())
}

/// Upper-snake form of an account alias, e.g. `serp-apps` -> `SERP_APPS`.
pub fn alias_suffix(alias: &str) -> String {
    alias
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}
