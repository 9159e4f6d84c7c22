//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction and the polling primitive used for every bounded
//! wait against the cluster.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::trace;

use crate::Error;

/// Default interval between readiness polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Default ceiling for a readiness wait
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(3600);

/// Interval and deadline for [`poll_until`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    /// Time between polling attempts
    pub interval: Duration,
    /// Maximum time to wait for the condition
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl PollConfig {
    /// Create a poll config with explicit interval and timeout
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Outcome of a [`poll_until`] that did not reach its condition
#[derive(Debug)]
pub enum PollError<E> {
    /// The deadline elapsed while the condition was still false
    Timeout(Duration),
    /// A single check failed; polling stopped at that check
    Check(E),
}

/// Poll until a condition is met or the timeout is reached
///
/// The first check runs immediately, later checks run every
/// `config.interval`. The whole wait, including any check still in flight,
/// is bounded by `config.timeout`.
///
/// A check returning `Err` aborts the wait at once: only "not yet" is
/// retried, transport failures are not.
///
/// # Returns
/// `Ok(())` if the condition was met, `PollError::Timeout` if the deadline
/// elapsed first, or `PollError::Check` with the failing check's error.
pub async fn poll_until<F, Fut, E>(config: PollConfig, mut check_fn: F) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let polling = async {
        loop {
            match check_fn().await {
                Ok(true) => return Ok(()),
                Ok(false) => trace!("Polling condition not yet met, retrying..."),
                Err(e) => return Err(e),
            }
            tokio::time::sleep(config.interval).await;
        }
    };

    match tokio::time::timeout(config.timeout, polling).await {
        Ok(result) => result.map_err(PollError::Check),
        Err(_) => Err(PollError::Timeout(config.timeout)),
    }
}

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
///
/// Without a path the config is inferred: in-cluster service account first,
/// then `KUBECONFIG` / `~/.kube/config`.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::client_config(format!("failed to read kubeconfig {}: {}", path.display(), e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::client_config(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::client_config(format!("failed to infer config: {}", e)))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(Client::try_from(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_first_true_check() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let start = tokio::time::Instant::now();

        let result: Result<(), PollError<&str>> = poll_until(PollConfig::default(), || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) + 1 >= 3) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // checks at 0s, 15s, 30s
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_success_does_not_sleep() {
        let start = tokio::time::Instant::now();
        let result: Result<(), PollError<&str>> =
            poll_until(PollConfig::default(), || async { Ok(true) }).await;
        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_true() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), PollError<&str>> = poll_until(PollConfig::default(), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        })
        .await;

        match result {
            Err(PollError::Timeout(waited)) => assert_eq!(waited, DEFAULT_POLL_TIMEOUT),
            other => panic!("expected timeout, got {:?}", other),
        }
        // 3600s / 15s, give or take the check racing the deadline
        let checks = count.load(Ordering::SeqCst);
        assert!((240..=241).contains(&checks), "checks = {}", checks);
    }

    #[tokio::test(start_paused = true)]
    async fn check_error_aborts_without_retry() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), PollError<&str>> = poll_until(PollConfig::default(), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(false)
                } else {
                    Err("connection refused")
                }
            }
        })
        .await;

        match result {
            Err(PollError::Check(e)) => assert_eq!(e, "connection refused"),
            other => panic!("expected check error, got {:?}", other),
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_interval_and_timeout() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = PollConfig::new(Duration::from_secs(1), Duration::from_secs(5));

        let result: Result<(), PollError<&str>> = poll_until(config, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        })
        .await;

        assert!(matches!(result, Err(PollError::Timeout(d)) if d == Duration::from_secs(5)));
        assert!(count.load(Ordering::SeqCst) >= 5);
    }
}
