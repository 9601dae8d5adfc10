//! Unified inference engine: format-independent generate, stream and embed.
//!
//! Each call takes a scoped reference on the model for its whole duration;
//! the reference is released when the call returns, fails, panics or (for
//! streams) is cancelled or dropped.

pub mod session;
pub mod stream;

use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::model_runtime::{GenerationParams, ModelId, Phase};
use crate::registry::ModelRegistry;

pub use session::{CancellationFlag, InferenceSession};
pub use stream::{Token, TokenStream};

use stream::fault_to_error;

/// Result of a non-streaming generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub model_id: ModelId,
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: usize,
}

#[derive(Clone)]
pub struct InferenceEngine {
    registry: ModelRegistry,
    dispatcher: Arc<Dispatcher>,
}

impl InferenceEngine {
    pub fn new(registry: ModelRegistry, dispatcher: Arc<Dispatcher>) -> Self {
        Self { registry, dispatcher }
    }

    /// Full completion; identical to concatenating every token of
    /// [`stream_generate`](Self::stream_generate) with the same arguments.
    pub async fn generate(&self, model_id: &ModelId, prompt: &str, params: &GenerationParams) -> Result<Completion> {
        let mut stream = self.stream_generate(model_id, prompt, params).await?;
        let mut text = String::new();
        let mut completion_tokens = 0;
        while let Some(token) = stream.next().await {
            text.push_str(&token?.text);
            completion_tokens += 1;
        }
        info!(model_id = %model_id, completion_tokens, "Generation complete");
        Ok(Completion {
            model_id: model_id.clone(),
            text,
            prompt_tokens: stream.prompt_tokens(),
            completion_tokens,
        })
    }

    /// Runs prefill, then hands back a lazy stream over the decode phase.
    pub async fn stream_generate(
        &self,
        model_id: &ModelId,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenStream> {
        let guard = self.registry.acquire(model_id).await?;
        let handle = Arc::clone(guard.handle());
        let mut session = InferenceSession::new(model_id.clone(), Phase::Prefill, prompt.chars().count());

        let prefill = {
            let dispatch = self.dispatcher.dispatch(&handle, &session).await?;
            handle
                .engine()
                .prefill(dispatch.target, prompt, params)
                .await
                .map_err(|fault| fault_to_error(&self.registry, &handle, fault))?
        };
        debug!(model_id = %model_id, prompt_tokens = prefill.prompt_tokens, "Prefill complete");

        session.enter(Phase::Decode);
        let dispatch = self.dispatcher.dispatch(&handle, &session).await?;
        let tokens = handle
            .engine()
            .decode(dispatch.target, prompt, params)
            .await
            .map_err(|fault| fault_to_error(&self.registry, &handle, fault))?;

        Ok(TokenStream::new(
            tokens,
            dispatch,
            guard,
            session,
            self.registry.clone(),
            prefill.prompt_tokens,
        ))
    }

    /// Embedding vector whose length always equals the model's declared width.
    ///
    /// # Panics
    ///
    /// If the engine returns a vector of a different width. That is a loader
    /// defect, not a request failure.
    pub async fn embed(&self, model_id: &ModelId, text: &str) -> Result<Vec<f32>> {
        let guard = self.registry.acquire(model_id).await?;
        let handle = guard.handle();
        let dimension = handle.engine().embedding_dimension().ok_or_else(|| {
            Error::no_backend(format!("{} does not produce embeddings", handle.policy().backend))
        })?;

        let session = InferenceSession::new(model_id.clone(), Phase::Embedding, text.chars().count());
        let dispatch = self.dispatcher.dispatch(handle, &session).await?;
        let vector = handle
            .engine()
            .embed(dispatch.target, text)
            .await
            .map_err(|fault| fault_to_error(&self.registry, handle, fault))?;

        assert_eq!(
            vector.len(),
            dimension,
            "engine for {} returned a {}-wide embedding, declared {}",
            model_id,
            vector.len(),
            dimension
        );
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchConfig;
    use crate::events::EventBus;
    use crate::hardware::HardwareProfiler;
    use crate::registry::ModelState;
    use crate::test_support::{apple_profile, plan_for, ScriptedBackend};
    use std::time::Duration;

    const GIB: u64 = 1024 * 1024 * 1024;

    async fn engine_with(backend: &ScriptedBackend) -> (InferenceEngine, ModelRegistry) {
        let events = EventBus::default();
        let registry = ModelRegistry::new(events.clone());
        registry.load(plan_for(backend, "m1", GIB, 12 * GIB)).await.unwrap();
        let dispatcher = Dispatcher::new(
            DispatchConfig::default(),
            Arc::new(HardwareProfiler::fixed(apple_profile(16))),
            events,
        );
        (InferenceEngine::new(registry.clone(), Arc::new(dispatcher)), registry)
    }

    #[tokio::test]
    async fn test_generate_equals_concatenated_stream() {
        let backend = ScriptedBackend::default().with_tokens(&["The", " quick", " brown", " fox"]);
        let (engine, _) = engine_with(&backend).await;
        let params = GenerationParams::default();
        let id: ModelId = "m1".into();

        let completion = engine.generate(&id, "Once upon", &params).await.unwrap();
        let mut stream = engine.stream_generate(&id, "Once upon", &params).await.unwrap();
        let mut streamed = String::new();
        while let Some(token) = stream.next().await {
            streamed.push_str(&token.unwrap().text);
        }

        assert_eq!(completion.text, streamed);
        assert_eq!(completion.text, "The quick brown fox");
        assert_eq!(completion.completion_tokens, 4);
        assert!(completion.prompt_tokens > 0);
    }

    #[tokio::test]
    async fn test_cancel_after_three_tokens() {
        let backend = ScriptedBackend::default()
            .with_tokens(&["a", "b", "c", "d", "e", "f"])
            .with_token_delay(Duration::from_millis(5));
        let (engine, registry) = engine_with(&backend).await;
        let id: ModelId = "m1".into();

        let mut stream = engine
            .stream_generate(&id, "hi", &GenerationParams::default())
            .await
            .unwrap();
        let mut received = Vec::new();
        while let Some(token) = stream.next().await {
            received.push(token.unwrap().text);
            if received.len() == 3 {
                stream.cancel();
            }
        }

        assert_eq!(received, vec!["a", "b", "c"]);
        assert!(!stream.is_active());
        assert_eq!(stream.session().output(), "abc");
        let handle = registry.acquire(&id).await.unwrap();
        assert_eq!(handle.ref_count(), 1);
        assert_eq!(handle.state(), ModelState::Ready);
    }

    #[tokio::test]
    async fn test_cancel_releases_reference_without_polling() {
        let backend = ScriptedBackend::default()
            .with_tokens(&["a", "b", "c", "d", "e", "f"])
            .with_token_delay(Duration::from_millis(5));
        let (engine, registry) = engine_with(&backend).await;
        let id: ModelId = "m1".into();

        let mut stream = engine
            .stream_generate(&id, "hi", &GenerationParams::default())
            .await
            .unwrap();
        for _ in 0..3 {
            stream.next().await.unwrap().unwrap();
        }
        let cancellation = stream.cancellation();
        assert!(stream.is_active());
        assert_eq!(registry.list_models()[0].ref_count, 1);

        cancellation.cancel();
        assert!(!stream.is_active());
        assert_eq!(registry.list_models()[0].ref_count, 0);
        registry.unload(&id).await.unwrap();
        assert_eq!(stream.session().output(), "abc");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_reference() {
        let backend = ScriptedBackend::default().with_tokens(&["a", "b"]);
        let (engine, registry) = engine_with(&backend).await;
        let id: ModelId = "m1".into();

        let stream = engine
            .stream_generate(&id, "hi", &GenerationParams::default())
            .await
            .unwrap();
        let outstanding = stream.cancellation();
        assert!(stream.is_active());
        drop(stream);
        registry.unload(&id).await.unwrap();
        assert!(!outstanding.is_cancelled());
    }

    #[tokio::test]
    async fn test_execution_error_keeps_model_ready() {
        let backend = ScriptedBackend::default().failing_requests();
        let (engine, registry) = engine_with(&backend).await;
        let id: ModelId = "m1".into();

        let err = engine
            .generate(&id, "hi", &GenerationParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "backend_execution_error");
        assert_eq!(registry.state(&id), ModelState::Ready);
    }

    #[tokio::test]
    async fn test_corrupted_engine_evicts_model() {
        let backend = ScriptedBackend::default().corrupting();
        let (engine, registry) = engine_with(&backend).await;
        let id: ModelId = "m1".into();

        let err = engine
            .generate(&id, "hi", &GenerationParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "backend_execution_error");
        assert_eq!(registry.state(&id), ModelState::Unloaded);
        assert_eq!(
            engine.generate(&id, "hi", &GenerationParams::default()).await.unwrap_err().code(),
            "model_not_found"
        );
    }

    #[tokio::test]
    async fn test_embed_dimension_is_stable() {
        let backend = ScriptedBackend::default().with_dimension(384);
        let (engine, _) = engine_with(&backend).await;
        let id: ModelId = "m1".into();

        let a = engine.embed(&id, "hello world").await.unwrap();
        let b = engine.embed(&id, "hello world").await.unwrap();
        assert_eq!(a.len(), 384);
        assert_eq!(a.len(), b.len());
    }

    #[tokio::test]
    #[should_panic(expected = "declared 384")]
    async fn test_embed_dimension_mismatch_is_fatal() {
        let backend = ScriptedBackend::default().with_dimension(384).with_wrong_embedding_width();
        let (engine, _) = engine_with(&backend).await;
        let _ = engine.embed(&"m1".into(), "hello").await;
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let backend = ScriptedBackend::default();
        let (engine, _) = engine_with(&backend).await;
        let err = engine.embed(&"ghost".into(), "x").await.unwrap_err();
        assert_eq!(err.code(), "model_not_found");
    }
}
