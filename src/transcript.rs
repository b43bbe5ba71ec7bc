//! Turn-based transcript accumulation
//!
//! Transcription deltas for the current turn are buffered per direction and
//! only committed as [`TranscriptItem`]s when the turn completes.

use serde::Serialize;
use std::time::Duration;

/// Speaker of a transcript item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Ai,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ai => "ai",
        }
    }
}

/// A committed line of the conversation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptItem {
    pub id: String,
    pub role: Role,
    pub text: String,
    /// Milliseconds on the session clock
    pub timestamp: u64,
    pub is_final: bool,
}

/// Running transcript for one session
#[derive(Debug, Default)]
pub struct Transcript {
    items: Vec<TranscriptItem>,
    /// In-progress user text (not shown live)
    input: String,
    /// In-progress model text
    output: String,
    /// Last model text shown live; survives the end of a turn
    subtitle: String,
    next_seq: u64,
    last_timestamp: Option<u64>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[TranscriptItem] {
        &self.items
    }

    pub fn subtitle(&self) -> &str {
        &self.subtitle
    }

    pub fn push_input(&mut self, delta: &str) {
        self.input.push_str(delta);
    }

    /// Append model text and return the updated subtitle.
    pub fn push_output(&mut self, delta: &str) -> &str {
        self.output.push_str(delta);
        self.subtitle.clone_from(&self.output);
        &self.subtitle
    }

    /// Drop the in-progress model text and the subtitle (barge-in).
    pub fn clear_output(&mut self) {
        self.output.clear();
        self.subtitle.clear();
    }

    /// Finalize the current turn.
    ///
    /// Emits a user item and then an ai item for whichever buffers are
    /// non-empty after trimming, each with a strictly larger timestamp than
    /// anything committed before. Both buffers are cleared either way; the
    /// subtitle keeps the last line until the next delta.
    pub fn complete_turn(&mut self, now: Duration) -> Vec<TranscriptItem> {
        let user_text = self.input.trim().to_string();
        let ai_text = self.output.trim().to_string();
        self.input.clear();
        self.output.clear();

        let mut committed = Vec::new();
        if !user_text.is_empty() {
            committed.push(self.commit(Role::User, user_text, now));
        }
        if !ai_text.is_empty() {
            committed.push(self.commit(Role::Ai, ai_text, now));
        }
        committed
    }

    /// Forget buffers and committed items, e.g. for a new connection attempt.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Forget the in-progress buffers and the subtitle.
    pub fn reset_buffers(&mut self) {
        self.input.clear();
        self.output.clear();
        self.subtitle.clear();
    }

    fn commit(&mut self, role: Role, text: String, now: Duration) -> TranscriptItem {
        let now_ms = now.as_millis() as u64;
        let timestamp = match self.last_timestamp {
            Some(last) if now_ms <= last => last + 1,
            _ => now_ms,
        };
        self.last_timestamp = Some(timestamp);

        let item = TranscriptItem {
            id: format!("{}-{}", self.next_seq, role.as_str()),
            role,
            text,
            timestamp,
            is_final: true,
        };
        self.next_seq += 1;
        self.items.push(item.clone());
        item
    }
}
