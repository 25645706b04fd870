use std::env;
use std::fmt::Display;
use std::str::FromStr;

use anyhow::{anyhow, Result};

/// Turns on shadow mode
pub const DRY_RUN: &str = "FEECTL_DRY_RUN";
/// Overrides the executor's attempt budget
pub const MAX_ATTEMPTS: &str = "FEECTL_MAX_ATTEMPTS";
/// Overrides the per-channel cooldown
pub const COOLDOWN_MINUTES: &str = "FEECTL_COOLDOWN_MINUTES";

/// Look up a variable in the process environment
pub fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Parse a boolean flag, accepting `1`/`0`, `true`/`false`, `yes`/`no`
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read and parse an optional variable.  An unset or empty variable is `None`.
pub fn parse_var<T>(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Ok(None),
        Some(v) => {
            v.trim().parse().map(Some).map_err(|e| anyhow!("{}={:?}: {}", key, v, e))
        }
    }
}

/// Read an optional boolean flag
pub fn flag_var(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    match lookup(key) {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Ok(None),
        Some(v) => parse_flag(&v).map(Some).ok_or_else(|| anyhow!("{}={:?}: not a flag", key, v)),
    }
}
