use thiserror::Error;

/// The only error kind that reaches the top of `main`. Everything else
/// (bus calls at runtime, per-device opens/reads, hotplug setup) is
/// absorbed at the component boundary that detected it and turned into
/// a log line plus a state change (device dropped, cookie not issued,
/// ...), never propagated this far.
#[derive(Debug, Error)]
pub enum JoyNoSleepError {
    #[error("failed to start up: {0}")]
    FatalStartup(#[from] anyhow::Error),
}

/// Non-fatal, per-device open failure. Logged by the caller; the device
/// is simply not tracked.
#[derive(Debug, Error)]
#[error("failed to open {path}: {source}")]
pub struct DeviceOpenError {
    pub path: std::path::PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Non-fatal, per-device read failure. `ENODEV` means the device went
/// away and is expected; anything else is logged louder.
#[derive(Debug, Error)]
#[error("read failed: {0}")]
pub struct DeviceReadError(#[from] pub std::io::Error);

impl DeviceReadError {
    pub fn is_gone(&self) -> bool {
        self.0.raw_os_error() == Some(libc::ENODEV)
            || self.0.kind() == std::io::ErrorKind::UnexpectedEof
    }
}
