//! Environment variable helpers
//!
//! Generic parsing with defaults, used by the configuration layer.
//!
//! ```ignore
//! let workers: usize = env_get("WEFT_NUM_WORKERS", 4);
//! let pin = env_get_bool("WEFT_PIN_CPU", false);
//! ```

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable as a boolean.
///
/// "1", "true", "yes", "on" (case-insensitive) count as true; anything
/// else set counts as false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
