use std::collections::HashMap;

use chat_shared::{
    domain::{
        Attachment, ConversationId, DeliveryState, MessageId, MessageKey, TempId, UserId,
    },
    error::ValidationError,
    protocol::{ConversationRecord, Envelope, EnvelopeKind, MessageRecord},
};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, warn};

use crate::{
    config::Settings,
    conversations::{Conversation, ConversationStore, LastMessage},
    error::SyncError,
    recent_sends::RecentSendIndex,
    timeline::{Message, MessageTimeline},
    unread::UnreadTracker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub fuzzy_window: Duration,
    pub recent_send_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            fuzzy_window: Duration::seconds(5),
            recent_send_capacity: 64,
        }
    }
}

impl From<&Settings> for ReconcilerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            fuzzy_window: settings.fuzzy_window(),
            recent_send_capacity: settings.recent_send_capacity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Fetch,
    Push,
}

/// Outcome of one reconciliation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Appended(MessageKey),
    Confirmed {
        temp_id: TempId,
        message_id: MessageId,
    },
    Updated(MessageKey),
    Unchanged,
}

impl Applied {
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// A provisional message ready to be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub temp_id: TempId,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

/// Everything a UI needs to redraw after one accepted mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncUpdate {
    /// Conversation whose timeline is carried; `None` for list-only changes
    /// with nothing focused.
    pub conversation_id: Option<ConversationId>,
    pub focused: Option<ConversationId>,
    pub timeline: Vec<Message>,
    pub conversations: Vec<Conversation>,
}

/// The only writer of message timelines.
pub struct Reconciler {
    me: UserId,
    config: ReconcilerConfig,
    store: ConversationStore,
    timelines: HashMap<ConversationId, MessageTimeline>,
    recent: HashMap<ConversationId, RecentSendIndex>,
    unread: UnreadTracker,
}

impl Reconciler {
    pub fn new(me: UserId, config: ReconcilerConfig) -> Self {
        Self {
            me,
            config,
            store: ConversationStore::new(),
            timelines: HashMap::new(),
            recent: HashMap::new(),
            unread: UnreadTracker::default(),
        }
    }

    pub fn me(&self) -> UserId {
        self.me
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.store.list().to_vec()
    }

    pub fn timeline(&self, id: ConversationId) -> Option<&MessageTimeline> {
        self.timelines.get(&id)
    }

    pub fn messages(&self, id: ConversationId) -> Vec<Message> {
        self.timelines
            .get(&id)
            .map(MessageTimeline::snapshot)
            .unwrap_or_default()
    }

    pub fn focused(&self) -> Option<ConversationId> {
        self.unread.focused()
    }

    pub fn snapshot(&self, id: ConversationId) -> SyncUpdate {
        SyncUpdate {
            conversation_id: Some(id),
            focused: self.unread.focused(),
            timeline: self.messages(id),
            conversations: self.conversations(),
        }
    }

    /// Snapshot for list-level changes: carries the focused timeline, if any.
    pub fn list_snapshot(&self) -> SyncUpdate {
        match self.unread.focused() {
            Some(id) => self.snapshot(id),
            None => SyncUpdate {
                conversation_id: None,
                focused: None,
                timeline: Vec::new(),
                conversations: self.conversations(),
            },
        }
    }

    pub fn confirmed_alias(&self, id: ConversationId, temp_id: TempId) -> Option<MessageId> {
        self.timelines.get(&id)?.alias_of(&temp_id).cloned()
    }

    pub fn newest_confirmed_id(&self, id: ConversationId) -> Option<MessageId> {
        self.timelines.get(&id)?.newest_confirmed_id().cloned()
    }

    pub fn oldest_server_id(&self, id: ConversationId) -> Option<MessageId> {
        self.timelines.get(&id)?.oldest_server_id().cloned()
    }

    pub fn focus(&mut self, id: ConversationId, now: DateTime<Utc>) -> u32 {
        self.store.ensure(id, now);
        self.unread.focus(&mut self.store, id)
    }

    pub fn clear_focus(&mut self) {
        self.unread.clear_focus();
    }

    pub fn apply_conversation_list(&mut self, records: &[ConversationRecord]) {
        for record in records {
            self.store.upsert(record);
            self.unread
                .apply_server_count(&mut self.store, record.conversation_id, record.unread_count);
        }
    }

    pub fn remove_conversation(&mut self, id: ConversationId) -> Option<Conversation> {
        self.timelines.remove(&id);
        self.recent.remove(&id);
        self.unread.forget(id);
        self.store.remove(id)
    }

    /// Optimistic append. Visible before any network I/O starts.
    pub fn append_pending(
        &mut self,
        id: ConversationId,
        content: String,
        attachments: Vec<Attachment>,
        now: DateTime<Utc>,
    ) -> OutgoingMessage {
        let me = self.me;
        let temp_id = TempId::generate();
        let timeline = timeline_entry(&mut self.timelines, id);
        let created_at = timeline.local_timestamp(now);
        timeline.insert(Message {
            key: MessageKey::Temp(temp_id),
            conversation_id: id,
            sender_id: me,
            content: content.clone(),
            created_at,
            delivery: DeliveryState::Pending,
            attachments: attachments.clone(),
            edited: false,
        });
        self.recent_entry(id)
            .record(temp_id, me, &content, created_at);
        self.after_accept(id, now);
        debug!(conversation_id = %id, temp_id = %temp_id, "sync: appended pending message");
        OutgoingMessage {
            conversation_id: id,
            temp_id,
            content,
            attachments,
            created_at,
        }
    }

    /// Persistence acknowledgement for a pending send.
    pub fn confirm_pending(
        &mut self,
        id: ConversationId,
        temp_id: TempId,
        record: &MessageRecord,
    ) -> Result<Applied, SyncError> {
        let timeline = self
            .timelines
            .get_mut(&id)
            .ok_or(SyncError::UnknownConversation(id))?;
        let temp_key = MessageKey::Temp(temp_id);
        let index = timeline
            .position(&temp_key)
            .ok_or_else(|| SyncError::UnknownMessage {
                conversation_id: id,
                key: temp_key.clone(),
            })?;
        if !timeline.at(index).key.is_provisional() {
            if timeline.alias_server(index, record.message_id.clone()) {
                debug!(conversation_id = %id, temp_id = %temp_id, message_id = %record.message_id, "sync: ack id recorded as alias of echo-confirmed send");
            }
            return Ok(Applied::Unchanged);
        }

        let server_key = MessageKey::Server(record.message_id.clone());
        if timeline.position(&server_key).is_some() {
            let delivery = timeline.at(index).delivery;
            if !delivery.can_transition_to(DeliveryState::Confirmed) {
                return Err(SyncError::InvalidTransition {
                    key: temp_key,
                    from: delivery,
                    to: DeliveryState::Confirmed,
                });
            }
            timeline.collapse_into(index, record.message_id.clone());
            debug!(conversation_id = %id, temp_id = %temp_id, message_id = %record.message_id, "sync: pending send collapsed into fetched entry");
        } else {
            timeline.confirm(index, record.message_id.clone(), record.sent_at)?;
        }

        self.forget_recent(id, &temp_id);
        self.refresh_last_message(id);
        Ok(Applied::Confirmed {
            temp_id,
            message_id: record.message_id.clone(),
        })
    }

    pub fn fail_pending(&mut self, id: ConversationId, temp_id: TempId) -> Result<Applied, SyncError> {
        let timeline = self
            .timelines
            .get_mut(&id)
            .ok_or(SyncError::UnknownConversation(id))?;
        let key = MessageKey::Temp(temp_id);
        let index = timeline
            .position(&key)
            .ok_or_else(|| SyncError::UnknownMessage {
                conversation_id: id,
                key: key.clone(),
            })?;
        timeline.mark_failed(index)?;
        self.forget_recent(id, &temp_id);
        Ok(Applied::Updated(key))
    }

    /// Re-keys a failed entry as a fresh pending send.
    pub fn retry_failed(
        &mut self,
        id: ConversationId,
        temp_id: TempId,
        now: DateTime<Utc>,
    ) -> Result<OutgoingMessage, SyncError> {
        let me = self.me;
        let timeline = self
            .timelines
            .get_mut(&id)
            .ok_or(SyncError::UnknownConversation(id))?;
        let key = MessageKey::Temp(temp_id);
        let index = timeline
            .position(&key)
            .ok_or_else(|| SyncError::UnknownMessage {
                conversation_id: id,
                key: key.clone(),
            })?;
        let fresh = TempId::generate();
        let index = timeline.resubmit(index, fresh, now)?;
        let message = timeline.at(index).clone();
        self.recent_entry(id)
            .record(fresh, me, &message.content, message.created_at);
        self.after_accept(id, now);
        debug!(conversation_id = %id, old_temp_id = %temp_id, temp_id = %fresh, "sync: failed send resubmitted");
        Ok(OutgoingMessage {
            conversation_id: id,
            temp_id: fresh,
            content: message.content,
            attachments: message.attachments,
            created_at: message.created_at,
        })
    }

    /// Applies a history page. Returns how many entries were appended.
    pub fn ingest_page(
        &mut self,
        id: ConversationId,
        records: &[MessageRecord],
        now: DateTime<Utc>,
    ) -> usize {
        let mut appended = 0;
        for record in records {
            if record.conversation_id != id {
                warn!(conversation_id = %id, message_id = %record.message_id, "sync: fetched record belongs to another conversation");
                continue;
            }
            match self.ingest_authoritative(id, Message::from_record(record), None, Source::Fetch, now) {
                Ok(Applied::Appended(_)) => appended += 1,
                Ok(_) => {}
                Err(err) if err.is_invariant_violation() => {
                    error!(conversation_id = %id, "sync: invariant violation while applying history: {err}");
                }
                Err(err) => {
                    warn!(conversation_id = %id, "sync: skipped fetched record: {err}");
                }
            }
        }
        if self.timelines.contains_key(&id) {
            self.refresh_last_message(id);
        }
        appended
    }

    pub fn ingest_envelope(
        &mut self,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> Result<Applied, SyncError> {
        envelope.validate()?;
        let id = envelope.conversation_id;
        match envelope.kind {
            kind if kind.is_ephemeral() => Ok(Applied::Unchanged),
            EnvelopeKind::Text => match &envelope.message_id {
                Some(MessageKey::Temp(temp_id)) => Ok(self.ingest_provisional(envelope, *temp_id, now)),
                Some(MessageKey::Server(message_id)) => {
                    let incoming = message_from_envelope(envelope, message_id.clone());
                    self.ingest_authoritative(id, incoming, envelope.original_id.as_ref(), Source::Push, now)
                }
                None => Err(ValidationError::MissingMessageId { kind: "text" }.into()),
            },
            EnvelopeKind::Edit => {
                let key = required_key(envelope)?;
                self.edit_existing(id, key, &envelope.content, false)
            }
            EnvelopeKind::Delete => {
                let key = required_key(envelope)?;
                self.tombstone_existing(id, key, false)
            }
            EnvelopeKind::System | EnvelopeKind::Typing | EnvelopeKind::Read => Ok(Applied::Unchanged),
        }
    }

    /// Ownership and state checks that gate unsend and edit before any API call.
    pub fn check_own_confirmed(
        &self,
        id: ConversationId,
        key: &MessageKey,
        intent: DeliveryState,
    ) -> Result<MessageId, SyncError> {
        let timeline = self
            .timelines
            .get(&id)
            .ok_or(SyncError::UnknownConversation(id))?;
        let message = timeline.get(key).ok_or_else(|| SyncError::UnknownMessage {
            conversation_id: id,
            key: key.clone(),
        })?;
        if message.sender_id != self.me {
            return Err(ValidationError::NotOwnMessage(message.key.to_string()).into());
        }
        match (&message.key, message.delivery) {
            (MessageKey::Server(message_id), DeliveryState::Confirmed) => Ok(message_id.clone()),
            (_, from) => Err(SyncError::InvalidTransition {
                key: message.key.clone(),
                from,
                to: intent,
            }),
        }
    }

    pub fn apply_unsend(&mut self, id: ConversationId, message_id: &MessageId) -> Result<Applied, SyncError> {
        self.tombstone_existing(id, &MessageKey::Server(message_id.clone()), true)
    }

    pub fn apply_edit(
        &mut self,
        id: ConversationId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<Applied, SyncError> {
        self.edit_existing(id, &MessageKey::Server(message_id.clone()), content, true)
    }

    fn ingest_provisional(&mut self, envelope: &Envelope, temp_id: TempId, now: DateTime<Utc>) -> Applied {
        let id = envelope.conversation_id;
        let key = MessageKey::Temp(temp_id);
        let timeline = timeline_entry(&mut self.timelines, id);
        if timeline.position(&key).is_some() {
            return Applied::Unchanged;
        }
        let created_at = timeline.local_timestamp(now);
        timeline.insert(Message {
            key: key.clone(),
            conversation_id: id,
            sender_id: envelope.sender_id,
            content: envelope.content.clone(),
            created_at,
            delivery: DeliveryState::Pending,
            attachments: envelope.attachments.clone(),
            edited: false,
        });
        self.recent_entry(id)
            .record(temp_id, envelope.sender_id, &envelope.content, created_at);
        self.after_accept(id, now);
        self.unread
            .on_new_message(&mut self.store, id, envelope.sender_id, self.me);
        Applied::Appended(key)
    }

    fn ingest_authoritative(
        &mut self,
        id: ConversationId,
        incoming: Message,
        original_id: Option<&MessageKey>,
        source: Source,
        now: DateTime<Utc>,
    ) -> Result<Applied, SyncError> {
        let key = incoming.key.clone();
        let timeline = timeline_entry(&mut self.timelines, id);

        if let Some(index) = timeline.position(&key) {
            if fold_duplicate(timeline, index, &incoming)? {
                self.refresh_last_message(id);
                return Ok(Applied::Updated(key));
            }
            return Ok(Applied::Unchanged);
        }

        if let Some(MessageKey::Temp(temp_id)) = original_id {
            if let Some(index) = timeline.position(&MessageKey::Temp(*temp_id)) {
                if timeline.at(index).key.is_provisional() {
                    return self.confirm_entry(id, index, *temp_id, incoming);
                }
                if let Some(extra) = key.server_id() {
                    if timeline.alias_server(index, extra.clone()) {
                        debug!(conversation_id = %id, temp_id = %temp_id, message_id = %extra, "sync: echo id recorded as alias of ack-confirmed send");
                    }
                }
                let current = timeline.at(index).key.clone();
                if fold_duplicate(timeline, index, &incoming)? {
                    self.refresh_last_message(id);
                    return Ok(Applied::Updated(current));
                }
                return Ok(Applied::Unchanged);
            }
        }

        if incoming.is_visible() {
            let echo = self.recent.get(&id).and_then(|recent| {
                recent.match_echo(incoming.sender_id, &incoming.content, incoming.created_at)
            });
            if let Some(temp_id) = echo {
                let index = self
                    .timelines
                    .get(&id)
                    .and_then(|timeline| timeline.position(&MessageKey::Temp(temp_id)));
                if let Some(index) = index {
                    debug!(conversation_id = %id, temp_id = %temp_id, message_id = %key, "sync: fuzzy echo match");
                    return self.confirm_entry(id, index, temp_id, incoming);
                }
            }
        }

        let visible = incoming.is_visible();
        let sender_id = incoming.sender_id;
        let touched_at = match source {
            Source::Push => now,
            Source::Fetch => incoming.created_at,
        };
        timeline_entry(&mut self.timelines, id).insert(incoming);
        self.after_accept(id, touched_at);
        if visible && source == Source::Push {
            self.unread
                .on_new_message(&mut self.store, id, sender_id, self.me);
        }
        Ok(Applied::Appended(key))
    }

    fn confirm_entry(
        &mut self,
        id: ConversationId,
        index: usize,
        temp_id: TempId,
        incoming: Message,
    ) -> Result<Applied, SyncError> {
        let message_id = incoming
            .key
            .server_id()
            .cloned()
            .ok_or_else(|| SyncError::MalformedEnvelope("confirmation without server id".into()))?;
        let timeline = timeline_entry(&mut self.timelines, id);
        let index = timeline.confirm(index, message_id.clone(), incoming.created_at)?;
        if !incoming.is_visible() {
            timeline.tombstone(index)?;
        } else if incoming.edited {
            timeline.apply_edit(index, &incoming.content);
        }
        self.forget_recent(id, &temp_id);
        self.refresh_last_message(id);
        Ok(Applied::Confirmed {
            temp_id,
            message_id,
        })
    }

    fn edit_existing(
        &mut self,
        id: ConversationId,
        key: &MessageKey,
        content: &str,
        strict: bool,
    ) -> Result<Applied, SyncError> {
        let Some((timeline, index)) = self.locate(id, key, strict)? else {
            return Ok(Applied::Unchanged);
        };
        let current = timeline.at(index).key.clone();
        if !timeline.apply_edit(index, content) {
            return Ok(Applied::Unchanged);
        }
        self.refresh_last_message(id);
        Ok(Applied::Updated(current))
    }

    fn tombstone_existing(
        &mut self,
        id: ConversationId,
        key: &MessageKey,
        strict: bool,
    ) -> Result<Applied, SyncError> {
        let Some((timeline, index)) = self.locate(id, key, strict)? else {
            return Ok(Applied::Unchanged);
        };
        let current = timeline.at(index).key.clone();
        if !timeline.tombstone(index)? {
            return Ok(Applied::Unchanged);
        }
        self.refresh_last_message(id);
        Ok(Applied::Updated(current))
    }

    /// Unknown targets are an error for local commands and ignored for pushes.
    fn locate(
        &mut self,
        id: ConversationId,
        key: &MessageKey,
        strict: bool,
    ) -> Result<Option<(&mut MessageTimeline, usize)>, SyncError> {
        let found = self
            .timelines
            .get_mut(&id)
            .and_then(|timeline| timeline.position(key).map(|index| (timeline, index)));
        match found {
            Some(found) => Ok(Some(found)),
            None if strict => Err(SyncError::UnknownMessage {
                conversation_id: id,
                key: key.clone(),
            }),
            None => {
                debug!(conversation_id = %id, key = %key, "sync: ignoring update for unknown message");
                Ok(None)
            }
        }
    }

    fn recent_entry(&mut self, id: ConversationId) -> &mut RecentSendIndex {
        let config = self.config;
        self.recent
            .entry(id)
            .or_insert_with(|| RecentSendIndex::new(config.recent_send_capacity, config.fuzzy_window))
    }

    fn forget_recent(&mut self, id: ConversationId, temp_id: &TempId) {
        if let Some(recent) = self.recent.get_mut(&id) {
            recent.forget(temp_id);
            if recent.is_empty() {
                self.recent.remove(&id);
            }
        }
    }

    fn after_accept(&mut self, id: ConversationId, touched_at: DateTime<Utc>) {
        self.store.touch(id, touched_at);
        self.refresh_last_message(id);
    }

    fn refresh_last_message(&mut self, id: ConversationId) {
        let last = self
            .timelines
            .get(&id)
            .and_then(MessageTimeline::latest_visible)
            .map(LastMessage::from);
        self.store.set_last_message(id, last);
    }
}

fn timeline_entry(
    timelines: &mut HashMap<ConversationId, MessageTimeline>,
    id: ConversationId,
) -> &mut MessageTimeline {
    timelines.entry(id).or_insert_with(MessageTimeline::new)
}

/// An exact duplicate may still carry a tombstone or an edit.
fn fold_duplicate(
    timeline: &mut MessageTimeline,
    index: usize,
    incoming: &Message,
) -> Result<bool, SyncError> {
    let existing = timeline.at(index);
    if existing.delivery != DeliveryState::Confirmed {
        return Ok(false);
    }
    if !incoming.is_visible() {
        return timeline.tombstone(index);
    }
    if incoming.edited {
        return Ok(timeline.apply_edit(index, &incoming.content));
    }
    Ok(false)
}

fn required_key(envelope: &Envelope) -> Result<&MessageKey, SyncError> {
    envelope.message_id.as_ref().ok_or_else(|| {
        ValidationError::MissingMessageId {
            kind: envelope.kind.as_str(),
        }
        .into()
    })
}

fn message_from_envelope(envelope: &Envelope, message_id: MessageId) -> Message {
    let mut message = Message {
        key: MessageKey::Server(message_id),
        conversation_id: envelope.conversation_id,
        sender_id: envelope.sender_id,
        content: envelope.content.clone(),
        created_at: envelope.timestamp,
        delivery: DeliveryState::Confirmed,
        attachments: envelope.attachments.clone(),
        edited: envelope.is_edited,
    };
    if envelope.is_deleted {
        message.delivery = DeliveryState::Deleted;
        message.content.clear();
        message.attachments.clear();
    }
    message
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
