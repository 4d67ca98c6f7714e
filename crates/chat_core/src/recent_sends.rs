use std::collections::VecDeque;

use chat_shared::domain::{TempId, UserId};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
struct RecentSend {
    temp_id: TempId,
    sender_id: UserId,
    content: String,
    sent_at: DateTime<Utc>,
}

/// Bounded index of provisional sends still awaiting their authoritative echo.
#[derive(Debug, Clone)]
pub struct RecentSendIndex {
    capacity: usize,
    window: Duration,
    entries: VecDeque<RecentSend>,
}

impl RecentSendIndex {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(
        &mut self,
        temp_id: TempId,
        sender_id: UserId,
        content: &str,
        sent_at: DateTime<Utc>,
    ) {
        self.forget(&temp_id);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(RecentSend {
            temp_id,
            sender_id,
            content: content.to_string(),
            sent_at,
        });
    }

    /// Closest-in-time send by the same sender with identical content, strictly
    /// inside the window.
    pub fn match_echo(
        &self,
        sender_id: UserId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Option<TempId> {
        self.entries
            .iter()
            .filter(|send| send.sender_id == sender_id && send.content == content)
            .map(|send| (send.temp_id, (at - send.sent_at).abs()))
            .filter(|(_, distance)| *distance < self.window)
            .min_by_key(|(_, distance)| *distance)
            .map(|(temp_id, _)| temp_id)
    }

    pub fn forget(&mut self, temp_id: &TempId) {
        self.entries.retain(|send| &send.temp_id != temp_id);
    }
}
