// Copyright (c) 2024 The Botho Foundation

//! Bounded exponential backoff for transient chain failures.

use bth_gateway_core::RetrySettings;
use retry::delay::Exponential;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::error::ChainError;

/// Delays between retries of one RPC call: doubling from
/// `initial_backoff_ms`, capped at `max_backoff_ms`, `max_rpc_retries` long.
pub fn rpc_delays(settings: &RetrySettings) -> impl Iterator<Item = Duration> {
    let max_delay = Duration::from_millis(settings.max_backoff_ms);
    Exponential::from_millis_with_factor(settings.initial_backoff_ms, 2.0)
        .map(move |delay| delay.min(max_delay))
        .take(settings.max_rpc_retries as usize)
}

/// Run `op`, retrying transient failures after each delay in `delays`.
///
/// Definitive errors are returned at once. Once the delays run out the
/// final transient error is returned to the caller.
pub async fn retry_transient<T, F, Fut, I>(delays: I, what: &str, mut op: F) -> Result<T, ChainError>
where
    I: IntoIterator<Item = Duration>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let mut delays = delays.into_iter();
    let mut retry = 0u32;
    loop {
        match op().await {
            Err(err) if err.is_transient() => match delays.next() {
                Some(delay) => {
                    retry += 1;
                    warn!("{} failed ({}), retry {} in {:?}", what, err, retry, delay);
                    sleep(delay).await;
                }
                None => return Err(err),
            },
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings(initial_ms: u64, max_ms: u64, retries: u32) -> RetrySettings {
        RetrySettings {
            max_rpc_retries: retries,
            initial_backoff_ms: initial_ms,
            max_backoff_ms: max_ms,
            ..RetrySettings::default()
        }
    }

    #[test]
    fn test_delays_double_and_cap() {
        let delays: Vec<_> = rpc_delays(&settings(100, 350, 4)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350),
                Duration::from_millis(350),
            ]
        );
        assert_eq!(rpc_delays(&settings(100, 350, 0)).count(), 0);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = retry_transient(rpc_delays(&settings(1, 2, 3)), "balance", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ChainError::Transient("timeout".to_string()))
            } else {
                Ok(7u64)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> =
            retry_transient(rpc_delays(&settings(1, 1, 2)), "balance", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ChainError::Transient("unreachable".to_string()))
            })
            .await;

        assert!(matches!(result, Err(ChainError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_definitive_error_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> =
            retry_transient(rpc_delays(&settings(1, 1, 5)), "broadcast", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ChainError::Rejected("nonce too low".to_string()))
            })
            .await;

        assert!(matches!(result, Err(ChainError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
