//! Keeps the foreground process attached while a remote routine runs.
//!
//! Detached SSH dispatch returns immediately; some callers still want
//! the local process to stay alive (for example to keep a terminal
//! session open). This is a plain blocking wait: it performs no polling
//! of remote state.

use std::thread;
use std::time::Duration;

/// Interval between liveness notices while waiting without a timeout.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(60);

/// Blocks the calling thread.
///
/// With a timeout the call sleeps that long and returns; the remote
/// routine may still be running. Without one it blocks until the
/// process is externally terminated, emitting a periodic liveness
/// notice.
pub fn wait(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => {
            thread::sleep(duration);
            tracing::info!(
                seconds = duration.as_secs(),
                "wait timed out; the remote routine may still be running"
            );
        }
        None => loop {
            thread::sleep(LIVENESS_INTERVAL);
            tracing::info!("still attached; remote routine running");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_with_timeout_returns() {
        wait(Some(Duration::from_millis(5)));
    }
}
