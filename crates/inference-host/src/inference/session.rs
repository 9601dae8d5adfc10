//! Per-request session state.

use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Context;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::model_runtime::{ModelId, Phase};

type CancelHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    waker: AtomicWaker,
    notify: Notify,
    hooks: Mutex<Vec<CancelHook>>,
}

/// Shared cancellation signal. Clones observe the same flag.
#[derive(Clone, Default)]
pub struct CancellationFlag {
    state: Arc<CancelState>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag and runs every registered hook on the calling thread.
    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(&mut *self.state.hooks.lock());
        for hook in hooks {
            hook();
        }
        self.state.waker.wake();
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Runs `hook` once, at cancellation time, or right away if the flag is
    /// already set.
    pub(crate) fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.state.hooks.lock();
        if self.is_cancelled() {
            drop(hooks);
            hook();
            return;
        }
        hooks.push(Box::new(hook));
    }

    /// Wakes the polling task when cancelled; for manual `Stream` impls.
    pub(crate) fn register(&self, cx: &Context<'_>) {
        self.state.waker.register(cx.waker());
    }
}

impl std::fmt::Debug for CancellationFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationFlag")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// One in-flight request against a handle.
#[derive(Debug)]
pub struct InferenceSession {
    id: Uuid,
    model_id: ModelId,
    phase: Phase,
    input_chars: usize,
    output: String,
    tokens: usize,
    cancel: CancellationFlag,
}

impl InferenceSession {
    pub fn new(model_id: ModelId, phase: Phase, input_chars: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            model_id,
            phase,
            input_chars,
            output: String::new(),
            tokens: 0,
            cancel: CancellationFlag::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn enter(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn input_chars(&self) -> usize {
        self.input_chars
    }

    /// Output is append-only.
    pub(crate) fn append(&mut self, text: &str) {
        self.output.push_str(text);
        self.tokens += 1;
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn tokens_emitted(&self) -> usize {
        self.tokens
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
