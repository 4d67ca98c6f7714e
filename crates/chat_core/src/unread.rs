use chat_shared::domain::{ConversationId, UserId};

use crate::conversations::ConversationStore;

/// Derives unread counts from accepted arrivals and the current focus.
#[derive(Debug, Clone, Default)]
pub struct UnreadTracker {
    focused: Option<ConversationId>,
}

impl UnreadTracker {
    pub fn focused(&self) -> Option<ConversationId> {
        self.focused
    }

    pub fn is_focused(&self, id: ConversationId) -> bool {
        self.focused == Some(id)
    }

    /// Focus moves and the count resets at once. Nothing rolls this back.
    pub fn focus(&mut self, store: &mut ConversationStore, id: ConversationId) -> u32 {
        self.focused = Some(id);
        store
            .get_mut(id)
            .map(|conversation| std::mem::take(&mut conversation.unread_count))
            .unwrap_or(0)
    }

    pub fn clear_focus(&mut self) {
        self.focused = None;
    }

    /// Called once per newly accepted message.
    pub fn on_new_message(
        &self,
        store: &mut ConversationStore,
        id: ConversationId,
        sender_id: UserId,
        me: UserId,
    ) {
        if sender_id == me || self.is_focused(id) {
            return;
        }
        if let Some(conversation) = store.get_mut(id) {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
    }

    /// Server counts win unless the conversation is focused.
    pub fn apply_server_count(&self, store: &mut ConversationStore, id: ConversationId, count: u32) {
        if let Some(conversation) = store.get_mut(id) {
            conversation.unread_count = if self.is_focused(id) { 0 } else { count };
        }
    }

    pub fn forget(&mut self, id: ConversationId) {
        if self.is_focused(id) {
            self.focused = None;
        }
    }
}
