use std::str::FromStr;

use snafu::{whatever, Whatever};

/// Reads an environment variable for the current process.
///
/// Compared to [std::env::var] there are a couple of differences:
///
/// - [var] uses [dotenvy] which loads the `.env` file from the current or
///   parent directories before returning the value.
///
/// - [var] returns `Ok(None)` (instead of `Err`) if an environment variable
///   wasn't set.
#[track_caller]
pub fn var(key: &str) -> Result<Option<String>, Whatever> {
    match dotenvy::var(key) {
        Ok(content) => Ok(Some(content)),
        Err(dotenvy::Error::EnvVar(std::env::VarError::NotPresent)) => Ok(None),
        Err(error) => whatever!(Err(error), "Failed to read {key} environment variable"),
    }
}

/// Reads an environment variable and parses it with [FromStr] if it is set.
///
/// The parse error only has to be displayable, so types like
/// [crate::readable_size::ReadableSize] whose error is a plain `String` work
/// as well.
#[track_caller]
pub fn var_parsed<R>(key: &str) -> Result<Option<R>, Whatever>
where
    R: FromStr,
    R::Err: std::fmt::Display,
{
    match var(key)? {
        Some(content) => match content.trim().parse::<R>() {
            Ok(v) => Ok(Some(v)),
            Err(e) => whatever!("Failed to parse {key} environment variable; {e}"),
        },
        None => Ok(None),
    }
}

/// Reads a boolean flag. Accepts `1/0`, `true/false`, `yes/no`, `on/off`.
#[track_caller]
pub fn var_flag(key: &str) -> Result<Option<bool>, Whatever> {
    let Some(content) = var(key)? else {
        return Ok(None);
    };
    match content.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => whatever!("Failed to parse {key} environment variable as a flag: {other:?}"),
    }
}
