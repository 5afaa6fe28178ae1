use std::time::Duration;

use async_trait::async_trait;
use relay_core::config::RetryConfig;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::provider::{ChatRequest, LlmProvider, ProviderError};
use crate::stream::StreamEvent;

/// Wraps a provider and retries transient failures that happen before the
/// stream starts.
///
/// Once `send_stream` has returned `Ok` events may already have reached the
/// consumer, so mid-stream errors are never retried here.
pub struct RetryingProvider {
    inner: Box<dyn LlmProvider>,
    policy: RetryConfig,
}

impl RetryingProvider {
    pub fn new(inner: Box<dyn LlmProvider>, policy: RetryConfig) -> Self {
        Self { inner, policy }
    }

    /// Delay before retry number `attempt` (0-based).
    fn backoff(&self, attempt: u32, err: &ProviderError) -> Duration {
        let base = self.policy.backoff_ms as f64
            * self.policy.backoff_multiplier.max(1.0).powi(attempt as i32);
        let mut ms = base as u64;
        if let ProviderError::RateLimited { retry_after_ms } = err {
            ms = ms.max(*retry_after_ms);
        }
        Duration::from_millis(ms)
    }
}

#[async_trait]
impl LlmProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let provider_name = self.inner.name();
        let mut attempt = 0;

        loop {
            match self.inner.send_stream(req, tx.clone()).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!(
                            provider = %provider_name,
                            attempt,
                            "stream request succeeded after retry"
                        );
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        provider = %provider_name,
                        attempt,
                        transient = e.is_transient(),
                        err = %e,
                        "provider send_stream failed"
                    );

                    if !e.is_transient() || attempt >= self.policy.max_retries {
                        return Err(e);
                    }

                    tokio::time::sleep(self.backoff(attempt, &e)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::types::Turn;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails the first `failures` calls with the error built by `make_err`.
    struct Flaky {
        calls: Arc<AtomicU32>,
        failures: u32,
        make_err: fn() -> ProviderError,
    }

    #[async_trait]
    impl LlmProvider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn send_stream(
            &self,
            req: &ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err((self.make_err)());
            }
            let _ = tx
                .send(StreamEvent::Done {
                    model: req.model.clone(),
                    finish_reason: Some("stop".into()),
                })
                .await;
            Ok(())
        }
    }

    fn dummy_request() -> ChatRequest {
        ChatRequest {
            model: "test-model".to_string(),
            messages: vec![Turn::user("hello", None)],
            max_tokens: 64,
            temperature: 1.0,
            functions: Vec::new(),
            user: None,
        }
    }

    fn policy(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            backoff_ms: 500,
            backoff_multiplier: 2.0,
        }
    }

    fn flaky(failures: u32, make_err: fn() -> ProviderError) -> (RetryingProvider, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let inner = Flaky {
            calls: calls.clone(),
            failures,
            make_err,
        };
        (RetryingProvider::new(Box::new(inner), policy(1)), calls)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_once() {
        let (provider, calls) = flaky(1, || ProviderError::from_status(503, "busy".into(), None));
        let (tx, mut rx) = mpsc::channel(4);

        provider.send_stream(&dummy_request(), tx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(rx.recv().await, Some(StreamEvent::Done { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let (provider, calls) = flaky(5, || ProviderError::RateLimited { retry_after_ms: 10 });
        let (tx, _rx) = mpsc::channel(4);

        let err = provider.send_stream(&dummy_request(), tx).await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_failure_is_not_retried() {
        let (provider, calls) = flaky(5, || ProviderError::from_status(401, "bad key".into(), None));
        let (tx, _rx) = mpsc::channel(4);

        let err = provider.send_stream(&dummy_request(), tx).await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_and_honours_retry_after() {
        let (provider, _) = flaky(0, || ProviderError::Cancelled);
        let server = ProviderError::from_status(500, String::new(), None);
        assert_eq!(provider.backoff(0, &server), Duration::from_millis(500));
        assert_eq!(provider.backoff(1, &server), Duration::from_millis(1000));
        assert_eq!(provider.backoff(2, &server), Duration::from_millis(2000));

        let limited = ProviderError::RateLimited { retry_after_ms: 3000 };
        assert_eq!(provider.backoff(0, &limited), Duration::from_millis(3000));
    }
}
