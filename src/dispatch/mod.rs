pub mod machine;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::DispatchConfig;
use crate::conversation::ConversationStore;
use crate::session::{SessionController, SessionOutcome};

pub use machine::{DispatchAction, DispatchMachine, DispatchState};

struct Inner {
    machine: Mutex<DispatchMachine>,
    controller: SessionController,
    context_refs: Mutex<Vec<String>>,
    state: watch::Sender<DispatchState>,
}

/// Folds bursts of user messages into single chat turns.
///
/// Each submitted message re-arms a quiet period; when it elapses the whole
/// conversation goes out as one request. Input that arrives while a reply is
/// streaming is picked up by a short follow-up timer once that reply ends.
#[derive(Clone)]
pub struct CoalescingDispatcher {
    inner: Arc<Inner>,
}

impl CoalescingDispatcher {
    #[must_use]
    pub fn new(controller: SessionController, config: &DispatchConfig) -> Self {
        let (state, _) = watch::channel(DispatchState::Idle);
        Self {
            inner: Arc::new(Inner {
                machine: Mutex::new(DispatchMachine::new(config.debounce(), config.followup())),
                controller,
                context_refs: Mutex::new(Vec::new()),
                state,
            }),
        }
    }

    #[must_use]
    pub fn store(&self) -> &ConversationStore {
        self.inner.controller.store()
    }

    /// Append a user message and schedule its dispatch. Returns its index.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, text: impl Into<String>) -> usize {
        let index = self.store().push_user(text);
        let action = self.inner.transition(DispatchMachine::on_user_message);
        tracing::debug!(message_index = index, state = ?self.state(), "user message queued");
        self.inner.apply(action);
        index
    }

    /// Context references attached to every subsequent request.
    pub fn set_context_refs(&self, refs: Vec<String>) {
        *self.inner.context_refs.lock() = refs;
    }

    /// Cancel the streaming reply and drop any queued dispatch.
    ///
    /// Messages already in the conversation stay there and ride along with
    /// the next submitted message.
    pub fn stop(&self) {
        self.inner.transition(|machine| {
            machine.on_stop();
            DispatchAction::None
        });
        if self.inner.controller.cancel_active() {
            tracing::info!("active chat turn stopped");
        }
    }

    #[must_use]
    pub fn state(&self) -> DispatchState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<DispatchState> {
        self.inner.state.subscribe()
    }

    /// Resolve once nothing is queued or streaming.
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe_state();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|state| *state == DispatchState::Idle).await;
    }
}

impl Inner {
    fn transition(&self, step: impl FnOnce(&mut DispatchMachine) -> DispatchAction) -> DispatchAction {
        let mut machine = self.machine.lock();
        let action = step(&mut machine);
        self.state.send_replace(machine.state());
        action
    }

    fn apply(self: &Arc<Self>, action: DispatchAction) {
        match action {
            DispatchAction::None => {}
            DispatchAction::ArmTimer { epoch, delay } => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.on_timer(epoch);
                });
            }
            DispatchAction::StartCycle => self.start_cycle(),
        }
    }

    fn on_timer(self: &Arc<Self>, epoch: u64) {
        let pending = self.controller.store().pending_user_count();
        let action = self.transition(|machine| machine.on_timer(epoch, pending));
        self.apply(action);
    }

    fn start_cycle(self: &Arc<Self>) {
        let store = self.controller.store();
        let pending = store.pending_user_count();
        let history = store.wire_history();
        let refs = self.context_refs.lock().clone();
        tracing::info!(
            pending_messages = pending,
            context_refs = refs.len(),
            "dispatching coalesced turn"
        );

        let handle = self.controller.start(history, refs);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let request_id = handle.request_id();
            match handle.wait().await {
                SessionOutcome::Completed => {}
                SessionOutcome::Cancelled => {
                    tracing::debug!(request_id = %request_id, "chat turn cancelled");
                }
                SessionOutcome::Failed(err) => {
                    tracing::warn!(request_id = %request_id, error = %err, "chat turn failed");
                }
            }
            let action = inner.transition(DispatchMachine::on_cycle_finished);
            inner.apply(action);
        });
    }
}
