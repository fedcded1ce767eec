//! Helpers for asynchronous, timing-sensitive tests
//!
//! Connections settle in background tasks, so most assertions about state
//! that another task changes go through [`eventually`].

use std::future::Future;
use std::time::Duration;

/// Install a test subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Check if running in a CI environment
///
/// Checks common CI environment variables.
pub fn is_ci_environment() -> bool {
    std::env::var("CI").is_ok()
        || std::env::var("GITHUB_ACTIONS").is_ok()
        || std::env::var("GITLAB_CI").is_ok()
        || std::env::var("CIRCLECI").is_ok()
}

/// Get CI-adjusted timeout duration
///
/// CI machines are slower and more contended; timeouts triple there.
pub fn ci_timeout(base_timeout: Duration) -> Duration {
    if is_ci_environment() {
        base_timeout * 3
    } else {
        base_timeout
    }
}

/// Await `fut`, panicking with `what` if it does not finish in time.
///
/// # Panics
///
/// Panics when the CI-adjusted timeout elapses.
pub async fn within<F: Future>(base_timeout: Duration, what: &str, fut: F) -> F::Output {
    match tokio::time::timeout(ci_timeout(base_timeout), fut).await {
        Ok(output) => output,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Poll `check` every 10ms until it returns true.
///
/// # Panics
///
/// Panics if `check` is still false after the CI-adjusted timeout.
pub async fn eventually(base_timeout: Duration, what: &str, mut check: impl FnMut() -> bool) {
    within(base_timeout, what, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ci_timeout() {
        let base = Duration::from_secs(5);
        let adjusted = ci_timeout(base);

        if is_ci_environment() {
            assert_eq!(adjusted, Duration::from_secs(15));
        } else {
            assert_eq!(adjusted, base);
        }
    }

    #[tokio::test]
    async fn test_eventually_returns_once_true() {
        let mut calls = 0;
        eventually(Duration::from_secs(1), "third poll", || {
            calls += 1;
            calls >= 3
        })
        .await;
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    #[should_panic(expected = "timed out waiting for never")]
    async fn test_within_panics_on_timeout() {
        within(Duration::from_millis(20), "never", std::future::pending::<()>()).await;
    }
}
