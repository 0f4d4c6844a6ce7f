//! Embedding provider trait (§4.4, Component D) and the retry wrapper that
//! implements its bounded-retry contract.

use std::time::Duration;

use {
    async_trait::async_trait,
    tracing::warn,
};

/// A provider of text embeddings. `embed_batch`'s default implementation
/// embeds one text at a time; providers with a native batch endpoint (e.g.
/// `OpenAiEmbeddingProvider`) override it.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn model_name(&self) -> &str;
    fn dimensions(&self) -> usize;
    fn provider_key(&self) -> &str;
}

/// Wraps a provider with the bounded-retry contract from §4.4: up to 3
/// attempts, exponential backoff starting at 1s with factor 2 (1s, 2s, 4s).
/// On final failure, the error propagates so the caller can record
/// `embeddingStatus = failed` for the affected chunks.
pub struct RetryingEmbeddingProvider {
    inner: Box<dyn EmbeddingProvider>,
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryingEmbeddingProvider {
    pub fn new(inner: Box<dyn EmbeddingProvider>) -> Self {
        Self {
            inner,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }

    /// Construct with a custom base delay, primarily for fast unit tests.
    pub fn with_base_delay(inner: Box<dyn EmbeddingProvider>, base_delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: 3,
            base_delay,
        }
    }

    async fn retry<F, Fut, T>(&self, op_name: &str, op: F) -> anyhow::Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0u32;
        let mut delay = self.base_delay;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        op = op_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "embedding call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for RetryingEmbeddingProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.retry("embed", || self.inner.embed(text)).await
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.retry("embed_batch", || self.inner.embed_batch(texts))
            .await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn provider_key(&self) -> &str {
        self.inner.provider_key()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FlakyProvider {
        fail_times: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                anyhow::bail!("transient failure");
            }
            Ok(vec![1.0, 2.0])
        }

        fn model_name(&self) -> &str {
            "flaky"
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn provider_key(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures_within_budget() {
        let provider = RetryingEmbeddingProvider::with_base_delay(
            Box::new(FlakyProvider {
                fail_times: 2,
                calls: AtomicUsize::new(0),
            }),
            Duration::from_millis(1),
        );
        let result = provider.embed("hi").await.unwrap();
        assert_eq!(result, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn exhausts_retries_and_propagates_error() {
        let provider = RetryingEmbeddingProvider::with_base_delay(
            Box::new(FlakyProvider {
                fail_times: 10,
                calls: AtomicUsize::new(0),
            }),
            Duration::from_millis(1),
        );
        let err = provider.embed("hi").await.unwrap_err();
        assert!(err.to_string().contains("transient failure"));
    }

    #[tokio::test]
    async fn default_embed_batch_calls_embed_per_text() {
        struct OnePerCall;
        #[async_trait]
        impl EmbeddingProvider for OnePerCall {
            async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
                Ok(vec![text.len() as f32])
            }
            fn model_name(&self) -> &str {
                "one"
            }
            fn dimensions(&self) -> usize {
                1
            }
            fn provider_key(&self) -> &str {
                "one"
            }
        }
        let provider = OnePerCall;
        let out = provider
            .embed_batch(&["ab".to_string(), "abc".to_string()])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![2.0], vec![3.0]]);
    }
}
