// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use convo_model::{Message, Usage};
use convo_tools::ToolCall;

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    MaxTokens,
}

/// Why a turn was aborted before it finished naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Interrupt,
    Manual,
}

/// Which half of a turn the abort interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortPhase {
    Model,
    Tools,
}

/// Why the transcript was authoritatively replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    Interrupt,
    Replace,
    Compaction,
}

/// Add `b`'s counters into `a`, in place.
pub fn accumulate_usage(a: &mut Usage, b: &Usage) {
    a.input_tokens += b.input_tokens;
    a.output_tokens += b.output_tokens;
    a.cache_read_tokens += b.cache_read_tokens;
    a.cache_write_tokens += b.cache_write_tokens;
}

/// Events emitted to turn-engine subscribers — the authoritative stream a
/// Session-Queue Runner or Output Relay drives off of. Consumers must treat
/// `MessagesReset` as replacing their view of the transcript wholesale.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    AgentEnd { transcript: Vec<Message>, total_usage: Usage },

    TurnStart,
    TurnEnd {
        finish_reason: FinishReason,
        new_messages: Vec<Message>,
        usage: Usage,
        total_usage: Usage,
    },
    TurnAbort { reason: AbortReason, phase: AbortPhase, detail: Option<String> },

    MessagesReset {
        reason: ResetReason,
        messages: Vec<Message>,
        dropped_message_count: Option<usize>,
        previous_message_count: Option<usize>,
    },

    MessageStart,
    MessageUpdate { text_delta: Option<String>, reasoning_delta: Option<String> },
    MessageEnd { message: Message },

    ToolExecutionStart { call: ToolCall },
    ToolExecutionUpdate { call_id: String, chunk: String },
    ToolExecutionEnd { call_id: String, tool_name: String, output: String, is_error: bool },
}
