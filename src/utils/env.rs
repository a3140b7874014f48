use std::str::FromStr;

/// Get environment variable with TOLLWAY_ prefix, falling back to unprefixed version
///
/// ```rust
/// use tollway::utils::get_env_with_prefix;
///
/// // Checks TOLLWAY_PADDLE_API_KEY first, then PADDLE_API_KEY
/// let key = get_env_with_prefix("PADDLE_API_KEY");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("TOLLWAY_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Like [`get_env_with_prefix`], parsed into `T`.
///
/// # Errors
///
/// Returns `"<KEY>: invalid value '<raw>'"` when the variable is set but
/// does not parse, so callers can report it instead of silently falling
/// back to a default.
pub fn get_env_parsed<T: FromStr>(key: &str) -> Result<Option<T>, String> {
    let Some(raw) = get_env_with_prefix(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| format!("{}: invalid value '{}'", key, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_with_prefix() {
        unsafe {
            std::env::set_var("TOLLWAY_ENV_TEST_PREFIXED", "prefixed_value");
        }
        assert_eq!(
            get_env_with_prefix("ENV_TEST_PREFIXED"),
            Some("prefixed_value".to_string())
        );
        unsafe {
            std::env::remove_var("TOLLWAY_ENV_TEST_PREFIXED");
        }

        unsafe {
            std::env::set_var("ENV_TEST_FALLBACK", "unprefixed_value");
        }
        assert_eq!(
            get_env_with_prefix("ENV_TEST_FALLBACK"),
            Some("unprefixed_value".to_string())
        );
        unsafe {
            std::env::remove_var("ENV_TEST_FALLBACK");
        }

        assert_eq!(get_env_with_prefix("ENV_TEST_MISSING"), None);
    }

    #[test]
    fn test_get_env_parsed() {
        unsafe {
            std::env::set_var("TOLLWAY_ENV_TEST_NUMBER", " 42 ");
            std::env::set_var("TOLLWAY_ENV_TEST_GARBAGE", "forty-two");
        }
        assert_eq!(get_env_parsed::<u32>("ENV_TEST_NUMBER"), Ok(Some(42)));
        assert_eq!(
            get_env_parsed::<u32>("ENV_TEST_GARBAGE"),
            Err("ENV_TEST_GARBAGE: invalid value 'forty-two'".to_string())
        );
        assert_eq!(get_env_parsed::<u32>("ENV_TEST_UNSET"), Ok(None));
        unsafe {
            std::env::remove_var("TOLLWAY_ENV_TEST_NUMBER");
            std::env::remove_var("TOLLWAY_ENV_TEST_GARBAGE");
        }
    }
}
