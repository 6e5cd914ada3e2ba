// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session routing state: the active request (with its output-message
//! chain, for reply-to-active-output detection) and, in mention mode, a
//! pending mention-reply batch awaiting a flushing mention.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use convo_bus::AdapterMessageCreated;

/// The currently-running request for a session, tracked so replies to its
/// output messages can be recognised as steer/interrupt/follow-up triggers
/// rather than fresh prompts.
#[derive(Debug, Clone)]
pub struct ActiveSessionState {
    pub request_id: String,
    pub active_output_message_ids: HashSet<String>,
}

/// Mention-mode only: replies to the active output that carry no mention
/// accumulate here until a mention arrives to flush them, or the request
/// resolves and the batch is discarded.
#[derive(Debug, Clone, Default)]
pub struct PendingMentionReplyBatch {
    pub messages: Vec<AdapterMessageCreated>,
}

impl PendingMentionReplyBatch {
    pub fn push(&mut self, message: AdapterMessageCreated) {
        self.messages.push(message);
    }

    pub fn take(&mut self) -> Vec<AdapterMessageCreated> {
        std::mem::take(&mut self.messages)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Default)]
struct SessionState {
    active: Option<ActiveSessionState>,
    pending_batch: PendingMentionReplyBatch,
}

/// Explicit per-session state: `Idle` (no active request, no buffer),
/// `BufferOpen` (debounce buffer accumulating), `GateCheck` (buffer
/// flushed, gate call in flight), `ActiveStarted` (a request is running).
/// This type names the states the router moves a session through; the
/// buffer/gate/active bookkeeping itself lives in [`DebounceManager`] and
/// [`SessionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    BufferOpen,
    GateCheck,
    ActiveStarted,
}

/// All session state the router needs, keyed by session id.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, session_id: &str, has_buffer: bool) -> SessionPhase {
        let sessions = self.sessions.lock().expect("session table poisoned");
        match sessions.get(session_id) {
            Some(s) if s.active.is_some() => SessionPhase::ActiveStarted,
            _ if has_buffer => SessionPhase::BufferOpen,
            _ => SessionPhase::Idle,
        }
    }

    pub fn active_request(&self, session_id: &str) -> Option<ActiveSessionState> {
        self.sessions.lock().expect("session table poisoned").get(session_id).and_then(|s| s.active.clone())
    }

    pub fn has_active_request(&self, session_id: &str) -> bool {
        self.active_request(session_id).is_some()
    }

    pub fn start_request(&self, session_id: &str, request_id: &str) {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        let entry = sessions.entry(session_id.to_string()).or_default();
        entry.active = Some(ActiveSessionState {
            request_id: request_id.to_string(),
            active_output_message_ids: HashSet::new(),
        });
    }

    /// Record a new output message for the session's active request, so a
    /// later reply to it is recognised as targeting the active request.
    pub fn record_active_output(&self, session_id: &str, request_id: &str, message_id: &str) {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        if let Some(state) = sessions.get_mut(session_id) {
            if let Some(active) = &mut state.active {
                if active.request_id == request_id {
                    active.active_output_message_ids.insert(message_id.to_string());
                }
            }
        }
    }

    /// Clear the active request on resolution/failure/cancellation, and
    /// discard any pending mention-reply batch (it addressed the request
    /// that is now gone).
    pub fn finish_request(&self, session_id: &str) -> Vec<AdapterMessageCreated> {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        if let Some(state) = sessions.get_mut(session_id) {
            state.active = None;
            return state.pending_batch.take();
        }
        Vec::new()
    }

    pub fn push_pending_batch(&self, session_id: &str, message: AdapterMessageCreated) {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        sessions.entry(session_id.to_string()).or_default().pending_batch.push(message);
    }

    pub fn take_pending_batch(&self, session_id: &str) -> Vec<AdapterMessageCreated> {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        match sessions.get_mut(session_id) {
            Some(state) => state.pending_batch.take(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str) -> AdapterMessageCreated {
        AdapterMessageCreated {
            platform: "discord".into(),
            channel_id: "C".into(),
            message_id: id.into(),
            user_id: "u1".into(),
            user_name: None,
            text: "hi".into(),
            ts: 0,
            raw: serde_json::json!({}),
        }
    }

    #[test]
    fn starts_idle_and_moves_to_active_started() {
        let table = SessionTable::new();
        assert_eq!(table.phase("s1", false), SessionPhase::Idle);
        table.start_request("s1", "discord:s1:m1");
        assert_eq!(table.phase("s1", false), SessionPhase::ActiveStarted);
        assert!(table.has_active_request("s1"));
    }

    #[test]
    fn buffer_open_phase_reported_when_no_active_request() {
        let table = SessionTable::new();
        assert_eq!(table.phase("s1", true), SessionPhase::BufferOpen);
    }

    #[test]
    fn finishing_a_request_clears_active_state_and_returns_pending_batch() {
        let table = SessionTable::new();
        table.start_request("s1", "discord:s1:m1");
        table.push_pending_batch("s1", msg("r1"));
        let drained = table.finish_request("s1");
        assert_eq!(drained.len(), 1);
        assert!(!table.has_active_request("s1"));
    }

    #[test]
    fn active_output_membership_tracks_only_the_current_request() {
        let table = SessionTable::new();
        table.start_request("s1", "discord:s1:m1");
        table.record_active_output("s1", "discord:s1:m1", "out1");
        let active = table.active_request("s1").unwrap();
        assert!(active.active_output_message_ids.contains("out1"));

        table.record_active_output("s1", "stale-request", "out2");
        let active = table.active_request("s1").unwrap();
        assert!(!active.active_output_message_ids.contains("out2"));
    }
}
