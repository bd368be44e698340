pub mod flows;

pub use flows::{AdjustMode, CompletedFlow, FlowKind};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::TopupConfig;
use crate::error::ShopResult;
use crate::store::Store;

/// Where the flow's prompt message lives, so handlers can edit it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// The single in-progress multi-step flow for one user.
#[derive(Debug, Clone)]
pub struct PendingConversation {
    pub flow: FlowKind,
    pub step: usize,
    pub fields: HashMap<String, String>,
    pub message: MessageRef,
}

/// Result of feeding one input into a user's pending flow.
#[derive(Debug, Clone)]
pub enum Advance {
    /// Input accepted; the cursor moved. Show the next prompt.
    Next { prompt: String },
    /// Flow finished; the entry is cleared. The terminal side effect is the
    /// caller's to run.
    Complete(CompletedFlow),
    /// Input rejected; state unchanged, user may retry the same step.
    Rejected { reason: String },
}

/// Per-user keyed holder of in-progress multi-step interactions.
///
/// Invariant: at most one pending conversation per user. `begin` replaces any
/// existing entry unconditionally — last start wins, matching the menu-driven
/// UX where opening a new wizard abandons the previous one.
#[derive(Clone)]
pub struct ConversationRegistry {
    entries: Arc<RwLock<HashMap<String, PendingConversation>>>,
    store: Store,
    topup: TopupConfig,
}

impl ConversationRegistry {
    pub fn new(store: Store, topup: TopupConfig) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            store,
            topup,
        }
    }

    /// Start a flow for a user, replacing any prior entry. Returns the first
    /// prompt to display.
    pub async fn begin(&self, user_id: &str, flow: FlowKind, message: MessageRef) -> String {
        let prompt = flows::first_prompt(&flow);
        let mut entries = self.entries.write().await;
        if entries
            .insert(
                user_id.to_string(),
                PendingConversation {
                    flow,
                    step: 0,
                    fields: HashMap::new(),
                    message,
                },
            )
            .is_some()
        {
            debug!(user_id, "replaced in-progress conversation (last start wins)");
        }
        prompt
    }

    /// Feed raw user input to the pending flow, if any. Returns `None` when
    /// the user has no active conversation.
    pub async fn advance(&self, user_id: &str, input: &str) -> ShopResult<Option<Advance>> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(user_id) else {
            return Ok(None);
        };

        let outcome = flows::handle_step(
            &entry.flow,
            entry.step,
            input,
            &mut entry.fields,
            &self.store,
            &self.topup,
        )?;

        let advance = match outcome {
            flows::StepResult::Next(prompt) => {
                entry.step += 1;
                Advance::Next { prompt }
            }
            flows::StepResult::Finish(completed) => {
                entries.remove(user_id);
                Advance::Complete(completed)
            }
            flows::StepResult::Reject(reason) => Advance::Rejected { reason },
        };
        Ok(Some(advance))
    }

    /// Clear the user's entry. Idempotent: cancelling twice equals cancelling
    /// once.
    pub async fn cancel(&self, user_id: &str) -> bool {
        self.entries.write().await.remove(user_id).is_some()
    }

    pub async fn is_active(&self, user_id: &str) -> bool {
        self.entries.read().await.contains_key(user_id)
    }

    pub async fn message_ref(&self, user_id: &str) -> Option<MessageRef> {
        self.entries.read().await.get(user_id).map(|e| e.message)
    }
}
