//! Environment lookup helpers shared by the config structs.

use std::fmt::Display;
use std::str::FromStr;

use crate::error::ConfigError;

/// Read an environment variable, treating empty/whitespace values as absent.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Read and parse an environment variable, falling back to a default.
pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match optional_env(key)? {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes env-mutating tests to prevent parallel races.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn optional_env_absent_is_none() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX in tests.
        unsafe {
            std::env::remove_var("AGENTEVOLUTION_TEST_ABSENT");
        }
        assert!(
            optional_env("AGENTEVOLUTION_TEST_ABSENT")
                .expect("lookup")
                .is_none()
        );
    }

    #[test]
    fn optional_env_blank_is_none() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("AGENTEVOLUTION_TEST_BLANK", "   ");
        }
        assert!(
            optional_env("AGENTEVOLUTION_TEST_BLANK")
                .expect("lookup")
                .is_none()
        );
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::remove_var("AGENTEVOLUTION_TEST_BLANK");
        }
    }

    #[test]
    fn parse_optional_env_default_and_override() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::remove_var("AGENTEVOLUTION_TEST_NUM");
        }
        assert_eq!(
            parse_optional_env::<u32>("AGENTEVOLUTION_TEST_NUM", 7).expect("parse"),
            7
        );

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("AGENTEVOLUTION_TEST_NUM", "42");
        }
        assert_eq!(
            parse_optional_env::<u32>("AGENTEVOLUTION_TEST_NUM", 7).expect("parse"),
            42
        );

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("AGENTEVOLUTION_TEST_NUM", "not-a-number");
        }
        assert!(parse_optional_env::<u32>("AGENTEVOLUTION_TEST_NUM", 7).is_err());

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::remove_var("AGENTEVOLUTION_TEST_NUM");
        }
    }
}
