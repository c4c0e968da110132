//! Retrying gateway — bounded attempts with exponential backoff at the transport boundary.
//!
//! Retryable transport errors and timeouts are retried transparently; anything else
//! surfaces on the first failure. After the last attempt the original error is
//! returned unchanged so its text reaches the task record verbatim.

use async_trait::async_trait;
use nudgebot_core::config::GatewayConfig;
use nudgebot_core::error::Result;
use nudgebot_core::traits::Gateway;
use nudgebot_core::types::{ChatMessage, MessageRef};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// `base * 2^(attempt-1)`, exponent capped at 10.
pub fn retry_delay_ms(base_delay_ms: u64, attempt: usize) -> u64 {
    if base_delay_ms == 0 {
        return 0;
    }
    let exponent = attempt.saturating_sub(1).min(10) as u32;
    base_delay_ms.saturating_mul(1_u64 << exponent)
}

pub struct RetryGateway {
    inner: Arc<dyn Gateway>,
    max_attempts: usize,
    base_delay_ms: u64,
}

impl RetryGateway {
    pub fn new(inner: Arc<dyn Gateway>, config: &GatewayConfig) -> Self {
        Self {
            inner,
            max_attempts: config.retry_max_attempts.max(1),
            base_delay_ms: config.retry_base_delay_ms,
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = retry_delay_ms(self.base_delay_ms, attempt);
                    tracing::warn!(
                        "⚠️ {} {} failed (attempt {}/{}): {}, retrying in {}ms",
                        self.inner.name(),
                        op,
                        attempt,
                        self.max_attempts,
                        e,
                        delay
                    );
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Gateway for RetryGateway {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn open_direct_channel(&self, user_id: &str) -> Result<String> {
        self.with_retry("open_direct_channel", move || self.inner.open_direct_channel(user_id))
            .await
    }

    async fn send_message(
        &self,
        channel_id: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<MessageRef> {
        self.with_retry("send_message", move || {
            self.inner.send_message(channel_id, text, thread_ts)
        })
        .await
    }

    async fn add_reaction(&self, channel_id: &str, message_ts: &str, emoji: &str) -> Result<()> {
        self.with_retry("add_reaction", move || {
            self.inner.add_reaction(channel_id, message_ts, emoji)
        })
        .await
    }

    async fn fetch_thread_replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        self.with_retry("fetch_thread_replies", move || {
            self.inner.fetch_thread_replies(channel_id, thread_ts, limit)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockGateway;
    use nudgebot_core::error::NudgeError;

    fn config(attempts: usize) -> GatewayConfig {
        GatewayConfig {
            retry_max_attempts: attempts,
            retry_base_delay_ms: 0,
        }
    }

    #[test]
    fn test_retry_delay_ms() {
        assert_eq!(retry_delay_ms(0, 3), 0);
        assert_eq!(retry_delay_ms(500, 1), 500);
        assert_eq!(retry_delay_ms(500, 2), 1000);
        assert_eq!(retry_delay_ms(500, 3), 2000);
        assert_eq!(retry_delay_ms(1, 50), 1024);
    }

    #[tokio::test]
    async fn test_retryable_error_is_retried() {
        let mock = Arc::new(MockGateway::default());
        mock.fail_next_sends([NudgeError::transport("ratelimited"), NudgeError::transport("ratelimited")]);
        let gw = RetryGateway::new(mock.clone(), &config(3));

        let sent = gw.send_message("D1", "hello", None).await.unwrap();
        assert_eq!(sent.channel_id, "D1");
        assert_eq!(mock.send_attempts(), 3);
        assert_eq!(mock.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_raw_error() {
        let mock = Arc::new(MockGateway::default());
        mock.fail_next_sends((0..5).map(|_| NudgeError::transport("upstream 503")));
        let gw = RetryGateway::new(mock.clone(), &config(2));

        let err = gw.send_message("D1", "hello", None).await.unwrap_err();
        assert!(err.to_string().contains("upstream 503"));
        assert_eq!(mock.send_attempts(), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let mock = Arc::new(MockGateway::default());
        mock.fail_next_sends([NudgeError::transport_fatal("channel_not_found")]);
        let gw = RetryGateway::new(mock.clone(), &config(5));

        assert!(gw.send_message("D1", "hello", None).await.is_err());
        assert_eq!(mock.send_attempts(), 1);
    }
}
