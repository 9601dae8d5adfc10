//! Lazy, cancellable token stream over a decode phase.

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::debug;

use super::session::{CancellationFlag, InferenceSession};
use crate::dispatcher::Dispatch;
use crate::error::{Error, Result};
use crate::model_runtime::{EngineFault, EngineTokens};
use crate::registry::{ModelHandle, ModelRegistry, ReferenceGuard};

/// One generated piece of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    pub index: usize,
    pub text: String,
}

/// Maps an engine fault to the API taxonomy, evicting the handle if the
/// engine reports its state as corrupted.
pub(crate) fn fault_to_error(registry: &ModelRegistry, handle: &Arc<ModelHandle>, fault: EngineFault) -> Error {
    match fault {
        EngineFault::Failed(cause) => Error::execution(&cause),
        EngineFault::Corrupted(cause) => {
            registry.mark_failed(handle);
            Error::execution(&cause)
        }
    }
}

/// Tokens of one `stream_generate` call, in production order.
///
/// The caller pulls; the engine is only polled when the caller asks for the
/// next token. Cancelling (or dropping the stream) stops polling the engine
/// and releases the model reference at once; tokens already yielded stay
/// with the caller.
pub struct TokenStream {
    tokens: Option<EngineTokens>,
    lease: Arc<Mutex<Option<Lease>>>,
    handle: Arc<ModelHandle>,
    session: InferenceSession,
    cancel: CancellationFlag,
    registry: ModelRegistry,
    prompt_tokens: u32,
}

/// Lane permit and model reference held while the stream is live. Shared
/// with the cancellation hook so `cancel` releases both without a poll.
struct Lease {
    _dispatch: Dispatch,
    _guard: ReferenceGuard,
}

impl TokenStream {
    pub(crate) fn new(
        tokens: EngineTokens,
        dispatch: Dispatch,
        guard: ReferenceGuard,
        session: InferenceSession,
        registry: ModelRegistry,
        prompt_tokens: u32,
    ) -> Self {
        let cancel = session.cancellation();
        let handle = Arc::clone(guard.handle());
        let lease = Arc::new(Mutex::new(Some(Lease {
            _dispatch: dispatch,
            _guard: guard,
        })));
        let held = Arc::downgrade(&lease);
        cancel.on_cancel(move || {
            if let Some(lease) = held.upgrade() {
                let released = lease.lock().take();
                drop(released);
            }
        });
        Self {
            tokens: Some(tokens),
            lease,
            handle,
            session,
            cancel,
            registry,
            prompt_tokens,
        }
    }

    /// Handle for cancelling from another task.
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn session(&self) -> &InferenceSession {
        &self.session
    }

    pub fn prompt_tokens(&self) -> u32 {
        self.prompt_tokens
    }

    /// Whether the stream still holds its model reference.
    pub fn is_active(&self) -> bool {
        self.lease.lock().is_some()
    }

    fn finish(&mut self) {
        self.tokens = None;
        let released = self.lease.lock().take();
        drop(released);
    }
}

impl Stream for TokenStream {
    type Item = Result<Token>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.tokens.is_none() {
            return Poll::Ready(None);
        }

        this.cancel.register(cx);
        if this.cancel.is_cancelled() {
            debug!(
                session = %this.session.id(),
                tokens = this.session.tokens_emitted(),
                "Stream cancelled"
            );
            this.finish();
            return Poll::Ready(None);
        }

        let polled = match this.tokens.as_mut() {
            Some(tokens) => tokens.poll_next_unpin(cx),
            None => return Poll::Ready(None),
        };

        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(text))) => {
                let index = this.session.tokens_emitted();
                this.session.append(&text);
                Poll::Ready(Some(Ok(Token { index, text })))
            }
            Poll::Ready(Some(Err(fault))) => {
                let err = fault_to_error(&this.registry, &this.handle, fault);
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("session", &self.session.id())
            .field("active", &self.is_active())
            .finish()
    }
}
