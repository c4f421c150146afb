/// Typed lookup of string settings.
///
/// Binaries pass a lookup function (the process environment in production,
/// a map in tests); this module never reads the environment itself.
use std::str::FromStr;

use crate::error::SettingError;

/// Parse `key` from `var`, or return `default` when it is unset.
///
/// Surrounding whitespace is ignored.
pub fn parse_or<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, SettingError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = var(key) else {
        return Ok(default);
    };
    let parsed = value.trim().parse::<T>();
    parsed.map_err(|e| SettingError {
        key: key.to_string(),
        reason: e.to_string(),
        value,
    })
}
