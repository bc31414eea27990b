//! In-process provider adapters.
//!
//! A provider may declare itself SDK-style instead of a subprocess; the
//! invoker then delegates to a registered adapter with the same result
//! shape. The built-in adapter speaks the Anthropic Messages API.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{CoordError, CoordResult};

/// An in-process completion backend.
#[async_trait]
pub trait SdkAdapter: Send + Sync {
    /// Run a single completion and return the response text.
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> CoordResult<String>;
}

/// Adapter for the Anthropic Messages API.
pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    max_tokens: u32,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 8192,
        }
    }

    /// Build from the conventional environment variable, when present.
    pub fn from_env() -> Option<Self> {
        std::env::var("ANTHROPIC_API_KEY").ok().map(Self::new)
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn post_messages(&self, model: &str, prompt: &str) -> CoordResult<String> {
        let body = json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoordError::Provider(format!("messages request failed: {e}")))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| CoordError::Provider(format!("messages response unreadable: {e}")))?;

        if !status.is_success() {
            let detail = payload
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(CoordError::Provider(format!(
                "messages API returned {status}: {detail}"
            )));
        }

        let text = payload
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        debug!(model, chars = text.len(), "messages completion finished");
        Ok(text)
    }
}

#[async_trait]
impl SdkAdapter for AnthropicAdapter {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> CoordResult<String> {
        tokio::select! {
            result = self.post_messages(model, prompt) => result,
            () = cancel.cancelled() => {
                Err(CoordError::Provider("completion cancelled".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoAdapter;

    #[async_trait]
    impl SdkAdapter for EchoAdapter {
        async fn complete(
            &self,
            model: &str,
            prompt: &str,
            _cancel: &CancellationToken,
        ) -> CoordResult<String> {
            Ok(format!("{model}: {prompt}"))
        }
    }

    #[tokio::test]
    async fn test_adapter_trait_is_object_safe() {
        let adapter: Box<dyn SdkAdapter> = Box::new(EchoAdapter);
        let out = adapter
            .complete("sonnet", "hi", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "sonnet: hi");
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_slow_requests() {
        struct SlowAdapter;

        #[async_trait]
        impl SdkAdapter for SlowAdapter {
            async fn complete(
                &self,
                _model: &str,
                _prompt: &str,
                cancel: &CancellationToken,
            ) -> CoordResult<String> {
                tokio::select! {
                    () = tokio::time::sleep(std::time::Duration::from_secs(60)) => Ok("done".into()),
                    () = cancel.cancelled() => Err(CoordError::Provider("completion cancelled".into())),
                }
            }
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = SlowAdapter.complete("m", "p", &cancel).await;
        assert!(result.is_err());
    }
}
