// src/utils/env.rs
use log::{debug, info};
use std::str::FromStr;

/// Loads variables from a `.env` file if one exists. Variables already set in
/// the process environment win.
pub fn load_env() {
    match dotenv::dotenv() {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(e) => debug!("No .env file loaded ({}); using process environment", e),
    }
}

/// Parses an environment variable, falling back to `default` when it is unset
/// or does not parse.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("REGION_MATCHING_TEST_NUM", "not-a-number");
        assert_eq!(env_or("REGION_MATCHING_TEST_NUM", 7usize), 7);
        std::env::set_var("REGION_MATCHING_TEST_NUM", " 42 ");
        assert_eq!(env_or("REGION_MATCHING_TEST_NUM", 7usize), 42);
        std::env::remove_var("REGION_MATCHING_TEST_NUM");
        assert_eq!(env_or("REGION_MATCHING_TEST_NUM", 7usize), 7);
    }

    #[test]
    fn test_env_string_ignores_blank_values() {
        std::env::set_var("REGION_MATCHING_TEST_STR", "   ");
        assert_eq!(env_string("REGION_MATCHING_TEST_STR", "fallback"), "fallback");
        std::env::remove_var("REGION_MATCHING_TEST_STR");
    }
}
