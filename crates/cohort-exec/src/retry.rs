//! Retry wrapper around a `GenerationClient`.
//!
//! Retry control flow lives here, not in the executor loop. Each attempt is
//! bounded by the request timeout; an elapsed timeout is a `Transient` failure.
//! `Fatal` is never retried regardless of the policy. A server-supplied
//! `retry_after` is honored up to `max_delay_ms`, since the worker keeps its
//! concurrency permit while it waits.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cohort_core::config::RetryPolicy;
use cohort_core::types::ErrorKind;

use crate::client::{Generation, GenerationClient, GenerationError, GenerationRequest};

#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<Generation, GenerationError>,
    /// Calls made to the inner client.
    pub attempts: u32,
    /// Retrying stopped because cancellation fired during a backoff wait.
    /// The task has no terminal outcome and must be re-submitted.
    pub cancelled: bool,
}

#[derive(Clone)]
pub struct RetryingClient {
    inner: Arc<dyn GenerationClient>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn GenerationClient>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            inner,
            policy,
            timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn should_retry(&self, err: &GenerationError, attempt: u32) -> bool {
        attempt < self.policy.max_attempts
            && !matches!(err.kind, ErrorKind::Fatal | ErrorKind::Internal)
            && self.policy.is_retryable(err.kind)
    }

    /// Call the inner client until success, a non-retryable error, the attempt
    /// budget running out, or cancellation during backoff.
    ///
    /// `on_failure(err, attempt, will_retry)` sees every failed attempt; the
    /// executor uses it to react to rate limiting.
    pub async fn call<F>(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
        mut on_failure: F,
    ) -> RetryOutcome
    where
        F: FnMut(&GenerationError, u32, bool) + Send,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result =
                match tokio::time::timeout(self.timeout, self.inner.generate(request, self.timeout))
                    .await
                {
                    Ok(r) => r,
                    Err(_) => Err(GenerationError::transient(format!(
                        "timed out after {} ms",
                        self.timeout.as_millis()
                    ))),
                };

            let err = match result {
                Ok(generation) => {
                    return RetryOutcome {
                        result: Ok(generation),
                        attempts: attempt,
                        cancelled: false,
                    }
                }
                Err(e) => e,
            };

            let will_retry = self.should_retry(&err, attempt);
            on_failure(&err, attempt, will_retry);
            if !will_retry {
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                    cancelled: false,
                };
            }

            let delay = match err.retry_after {
                Some(asked) => asked.min(self.policy.max_delay()),
                None => self.policy.delay_after(attempt),
            };
            tracing::debug!(
                attempt,
                kind = %err.kind,
                delay_ms = delay.as_millis() as u64,
                error = %err.message,
                "retrying generation"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                        cancelled: true,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays a fixed list of results, then succeeds.
    struct Scripted {
        script: Mutex<Vec<Result<Generation, GenerationError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(mut script: Vec<Result<Generation, GenerationError>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            })
        }
        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl GenerationClient for Scripted {
        async fn generate(
            &self,
            _request: &GenerationRequest,
            _timeout: Duration,
        ) -> Result<Generation, GenerationError> {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(Generation::new("ok")))
        }
    }

    struct Slow;

    #[async_trait]
    impl GenerationClient for Slow {
        async fn generate(
            &self,
            _request: &GenerationRequest,
            _timeout: Duration,
        ) -> Result<Generation, GenerationError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Generation::new("late"))
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..RetryPolicy::default()
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            model: "m".into(),
            prompt: "p".into(),
            sampling: Default::default(),
        }
    }

    #[tokio::test]
    async fn transient_then_success() {
        let inner = Scripted::new(vec![
            Err(GenerationError::transient("blip")),
            Err(GenerationError::rate_limited("slow down", None)),
        ]);
        let client = RetryingClient::new(inner.clone(), fast_policy(3), Duration::from_secs(1));
        let mut seen = Vec::new();
        let out = client
            .call(&request(), &CancellationToken::new(), |e, _, retry| {
                seen.push((e.kind, retry))
            })
            .await;
        assert_eq!(out.result.unwrap().text, "ok");
        assert_eq!(out.attempts, 3);
        assert_eq!(
            seen,
            vec![(ErrorKind::Transient, true), (ErrorKind::RateLimited, true)]
        );
    }

    #[tokio::test]
    async fn malformed_and_fatal_are_not_retried() {
        for err in [
            GenerationError::malformed("junk"),
            GenerationError::fatal("401"),
        ] {
            let inner = Scripted::new(vec![Err(err.clone())]);
            let client =
                RetryingClient::new(inner.clone(), fast_policy(5), Duration::from_secs(1));
            let out = client
                .call(&request(), &CancellationToken::new(), |_, _, _| {})
                .await;
            assert_eq!(out.result.unwrap_err(), err);
            assert_eq!(inner.calls(), 1);
        }
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let inner = Scripted::new(vec![
            Err(GenerationError::transient("1")),
            Err(GenerationError::transient("2")),
            Err(GenerationError::transient("3")),
        ]);
        let client = RetryingClient::new(inner.clone(), fast_policy(2), Duration::from_secs(1));
        let out = client
            .call(&request(), &CancellationToken::new(), |_, _, _| {})
            .await;
        assert_eq!(out.result.unwrap_err().message, "2");
        assert_eq!(out.attempts, 2);
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let client = RetryingClient::new(
            Arc::new(Slow),
            RetryPolicy::none(),
            Duration::from_millis(50),
        );
        let out = client
            .call(&request(), &CancellationToken::new(), |_, _, _| {})
            .await;
        assert_eq!(out.result.unwrap_err().kind, ErrorKind::Transient);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_stops_retrying() {
        let inner = Scripted::new(vec![Err(GenerationError::rate_limited(
            "wait",
            Some(Duration::from_secs(30)),
        ))]);
        let policy = RetryPolicy {
            max_delay_ms: 60_000,
            ..fast_policy(3)
        };
        let client = RetryingClient::new(inner.clone(), policy, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let out = client.call(&request(), &cancel, |_, _, _| {}).await;
        assert!(out.cancelled);
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn server_retry_after_is_capped_by_policy() {
        let inner = Scripted::new(vec![Err(GenerationError::rate_limited(
            "429",
            Some(Duration::from_secs(3)),
        ))]);
        let client = RetryingClient::new(inner.clone(), fast_policy(3), Duration::from_secs(1));
        let started = std::time::Instant::now();
        let out = tokio::time::timeout(
            Duration::from_secs(1),
            client.call(&request(), &CancellationToken::new(), |_, _, _| {}),
        )
        .await
        .expect("backoff should be clamped to max_delay_ms");
        assert_eq!(out.result.unwrap().text, "ok");
        assert_eq!(out.attempts, 2);
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
