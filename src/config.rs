use std::time::Duration;

/// Quiet interval after the last button press before the inhibit is
/// released, expressed in microseconds against the monotonic clock.
pub const DEFAULT_INHIBIT_TIMEOUT_US: u64 = 600_000_000;

const TIMEOUT_ENV_VAR: &str = "JOYNOSLEEP_INHIBIT_TIMEOUT_US";

/// Reads the quiet interval from the environment, falling back to the
/// compiled-in default. There is no config file: a single env var is the
/// only knob this daemon exposes.
pub fn inhibit_timeout() -> Duration {
    let micros = std::env::var(TIMEOUT_ENV_VAR)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_INHIBIT_TIMEOUT_US);
    Duration::from_micros(micros)
}
