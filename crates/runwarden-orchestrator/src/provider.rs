//! Language-model provider capability.

use async_trait::async_trait;

use runwarden_core::{ProviderError, ProviderRequest, ProviderResponse};

/// Callback invoked with each streamed chunk.
pub type ChunkCallback<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Generates a response for a request, optionally streaming.
///
/// Adapters classify their own failures; the runtime trusts
/// [`ProviderError::retryable`] verbatim.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name used in logs.
    fn name(&self) -> &str;

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Stream the response, calling `on_chunk` for every piece of text.
    ///
    /// The returned response carries the full text and final usage.
    async fn generate_stream(
        &self,
        request: &ProviderRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<ProviderResponse, ProviderError> {
        let response = self.generate(request).await?;
        on_chunk(&response.text);
        Ok(response)
    }
}

/// Provider that answers with the prompt it was given.
///
/// Used by the `runwarden` binary to drive a seed plan without network access.
#[derive(Debug, Clone, Default)]
pub struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let token_in = request.prompt.split_whitespace().count() as u64;
        Ok(ProviderResponse {
            text: request.prompt.clone(),
            tool_calls: Vec::new(),
            usage: runwarden_core::Usage::new(token_in, token_in, 0.0),
        })
    }

    async fn generate_stream(
        &self,
        request: &ProviderRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<ProviderResponse, ProviderError> {
        for word in request.prompt.split_inclusive(' ') {
            on_chunk(word);
        }
        self.generate(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn echo_streams_every_word() {
        let chunks = Mutex::new(Vec::new());
        let request = ProviderRequest::new("hello wide world").streaming();
        let response = EchoProvider
            .generate_stream(&request, &|c: &str| chunks.lock().unwrap().push(c.to_string()))
            .await
            .unwrap();

        assert_eq!(response.text, "hello wide world");
        assert_eq!(response.usage.token_in, 3);
        assert_eq!(chunks.lock().unwrap().concat(), "hello wide world");
    }
}
