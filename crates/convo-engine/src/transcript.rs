// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use convo_model::{Message, MessageContent, Role};

/// Ordered message history driving one agent run, plus the token-budget
/// bookkeeping the turn engine and auto-compaction both read from.
///
/// Invariant: after any mutation the transcript is "valid" — no `tool`
/// message's `tool_call_id` is unmatched by an earlier open tool-call, and
/// the list never ends with an `assistant` message that still has open
/// tool-calls.
#[derive(Debug)]
pub struct Transcript {
    pub messages: Vec<Message>,
    /// Approximate total token count for `messages` (chars/4 heuristic).
    pub token_count: usize,
    /// Context window of the active model, in tokens.
    pub max_tokens: usize,
    /// Token overhead of items sent with every request but not stored in
    /// `messages`: tool schemas, dynamic system-prompt suffix.
    pub schema_overhead: usize,
    /// Running multiplier correcting the chars/4 estimate against the
    /// provider's actual reported input token counts.
    pub calibration_factor: f32,
    pub cache_read_total: u64,
    pub cache_write_total: u64,
}

impl Transcript {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            schema_overhead: 0,
            calibration_factor: 1.0,
            cache_read_total: 0,
            cache_write_total: 0,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs {
            self.push(m);
        }
    }

    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list wholesale (compaction / interrupt rewind /
    /// explicit resubmit) and recompute bookkeeping.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// Calibrated estimate of tokens actually sent on the next request:
    /// stored messages plus schema overhead, scaled by `calibration_factor`.
    pub fn estimated_input_tokens(&self) -> usize {
        (((self.token_count + self.schema_overhead) as f32) * self.calibration_factor) as usize
    }

    /// Tokens available for input after reserving the model's output budget.
    pub fn input_budget(&self) -> usize {
        self.max_tokens
    }

    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        (self.estimated_input_tokens() as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    pub fn add_cache_usage(&mut self, cache_read: u64, cache_write: u64) {
        self.cache_read_total += cache_read;
        self.cache_write_total += cache_write;
    }

    /// Update `calibration_factor` from a provider's actual reported input
    /// token count against our chars/4 `estimated` figure. Blends rather than
    /// replaces so a single noisy sample can't swing the factor wildly.
    pub fn update_calibration(&mut self, actual_input: u64, estimated: usize) {
        if estimated == 0 {
            return;
        }
        let sample = actual_input as f32 / estimated as f32;
        self.calibration_factor = self.calibration_factor * 0.7 + sample * 0.3;
    }

    /// Whether `messages` ends in a state that is safe to send as the final
    /// element of an outbound turn: a user message, an assistant message with
    /// no open tool-calls, or a tool message that closes every call opened by
    /// the preceding assistant message.
    pub fn is_valid_boundary(&self) -> bool {
        is_valid_boundary(&self.messages)
    }

    /// Longest prefix of `messages` ending at a valid boundary. Used by
    /// interrupt-rewind to discard a partially-executed turn.
    pub fn last_valid_boundary(&self) -> usize {
        last_valid_boundary(&self.messages)
    }
}

/// Return `true` if `msgs` is empty, or its last message is `user`, an
/// `assistant` message with no open tool-calls, or a `tool` message closing
/// every call opened by the immediately preceding assistant message.
pub fn is_valid_boundary(msgs: &[Message]) -> bool {
    last_valid_boundary(msgs) == msgs.len()
}

/// Index of the end of the longest valid-boundary prefix of `msgs`.
pub fn last_valid_boundary(msgs: &[Message]) -> usize {
    if msgs.is_empty() {
        return 0;
    }
    for end in (1..=msgs.len()).rev() {
        if boundary_ok_at(&msgs[..end]) {
            return end;
        }
    }
    0
}

fn boundary_ok_at(prefix: &[Message]) -> bool {
    match prefix.last() {
        None => true,
        Some(last) => match (&last.role, &last.content) {
            (Role::User, _) => true,
            (Role::Assistant, MessageContent::ToolCall { .. }) => false,
            (Role::Assistant, _) => true,
            (Role::Tool, MessageContent::ToolResult { tool_call_id, .. }) => {
                open_tool_calls(prefix).contains(tool_call_id)
            }
            _ => false,
        },
    }
}

/// Tool-call ids opened by the most recent run of assistant tool-call
/// messages that have not yet been closed by a matching tool-result.
fn open_tool_calls(msgs: &[Message]) -> std::collections::HashSet<String> {
    let mut open = std::collections::HashSet::new();
    for m in msgs {
        match (&m.role, &m.content) {
            (Role::Assistant, MessageContent::ToolCall { tool_call_id, .. }) => {
                open.insert(tool_call_id.clone());
            }
            (Role::Tool, MessageContent::ToolResult { tool_call_id, .. }) => {
                open.remove(tool_call_id);
            }
            _ => {}
        }
    }
    open
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
