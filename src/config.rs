//! Explicit run configuration. Threaded through the executor rather than
//! read from ambient globals (spec Open Question 9(b)).

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 9222;
pub const DEFAULT_MAX_MESSAGES: usize = 1000;
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub host: String,
    pub port: u16,
    pub max_messages: usize,
    pub step_timeout: Duration,
    pub command_timeout: Duration,
    pub profile_dir: Option<PathBuf>,
    pub stop_on_error: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_messages: DEFAULT_MAX_MESSAGES,
            step_timeout: Duration::from_millis(DEFAULT_STEP_TIMEOUT_MS),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            profile_dir: None,
            stop_on_error: true,
        }
    }
}

impl RunConfig {
    /// Merges environment variables over the defaults. CLI flags are applied
    /// by the caller afterward so they take precedence.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("BROWSERSTEP_HOST") {
            if !host.is_empty() {
                config.host = host;
            }
        }
        if let Ok(port) = std::env::var("BROWSERSTEP_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(max_messages) = std::env::var("BROWSERSTEP_MAX_MESSAGES") {
            if let Ok(max_messages) = max_messages.parse() {
                config.max_messages = max_messages;
            }
        }
        if let Ok(dir) = std::env::var("BROWSERSTEP_PROFILE_DIR") {
            if !dir.is_empty() {
                config.profile_dir = Some(PathBuf::from(dir));
            }
        }

        config
    }

    /// Resolves the site-profile directory, falling back to a user-config
    /// directory default only here — never read as an ambient global elsewhere.
    pub fn resolved_profile_dir(&self) -> PathBuf {
        self.profile_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("browserstep")
                .join("site-profiles")
        })
    }

    pub fn discovery_base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Clamps a caller-supplied millisecond timeout to `[0, 300_000]` (spec §8
/// boundary behavior) and converts it to a `Duration`. Negative values clamp
/// to zero rather than panicking on the unsigned conversion.
pub fn clamp_timeout_ms(ms: i64) -> Duration {
    let clamped = ms.clamp(0, MAX_TIMEOUT_MS as i64);
    Duration::from_millis(clamped as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_timeouts_clamp_to_zero() {
        assert_eq!(clamp_timeout_ms(-500), Duration::from_millis(0));
    }

    #[test]
    fn oversized_timeouts_clamp_to_max() {
        assert_eq!(clamp_timeout_ms(10_000_000), Duration::from_millis(MAX_TIMEOUT_MS));
    }

    #[test]
    fn in_range_timeouts_pass_through() {
        assert_eq!(clamp_timeout_ms(1500), Duration::from_millis(1500));
    }
}
