use std::time::Duration;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_millis(10_000);

pub const SESSION_TIMEOUT_ENV: &str = "MCP_TRANSPORT_SESSION_TIMEOUT_MS";
pub const OPEN_TIMEOUT_ENV: &str = "MCP_TRANSPORT_OPEN_TIMEOUT_MS";
pub const DISABLE_STUN_ENV: &str = "MCP_TRANSPORT_DISABLE_STUN";
pub const LOG_FILTER_ENV: &str = "MCP_TRANSPORT_LOG_FILTER";
pub const TRACE_DEPS_ENV: &str = "MCP_TRANSPORT_TRACE_DEPS";

pub fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

/// Reads a millisecond duration from `var`, falling back to `default` when
/// unset, unparsable or zero.
pub fn env_duration_ms(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

pub fn session_timeout_from_env() -> Duration {
    env_duration_ms(SESSION_TIMEOUT_ENV, DEFAULT_SESSION_TIMEOUT)
}

pub fn open_timeout_from_env() -> Duration {
    env_duration_ms(OPEN_TIMEOUT_ENV, DEFAULT_OPEN_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_or_bad_values_fall_back() {
        assert_eq!(
            env_duration_ms("MCP_TRANSPORT_TEST_UNSET_VAR", Duration::from_millis(7)),
            Duration::from_millis(7)
        );
        assert_eq!(env_truthy("MCP_TRANSPORT_TEST_UNSET_VAR"), None);
    }
}
