// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Auto-compaction: watches turn usage against a model's context window and
//! rewrites the outbound message list to fit, via hierarchical summarization
//! with a deterministic truncation fallback.
//!
//! This crate has no dependency on `convo-engine` — the turn engine installs
//! it as a [`convo_engine::TransformMessages`]/[`convo_engine::TurnErrorHandler`]
//! pair at the call site instead, keeping the dependency edge one-directional.

use std::cmp::{max, min};

use async_trait::async_trait;
use convo_model::{ContentPart, Message, MessageContent, Role, ToolResultContent};
use convo_tools::OutputCategory;

/// The capability of the model currently in use, as reported by
/// `convo_model::ModelProvider::{catalog_context_window, catalog_max_output_tokens}`.
#[derive(Debug, Clone, Copy)]
pub struct ModelCapability {
    pub context_limit: u32,
    /// `None` when the provider/catalog doesn't report an output limit.
    pub output_limit: Option<u32>,
}

/// Why compaction was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionReason {
    /// `turn_end.usage.inputTokens` crossed [`compute_input_budget`].
    Threshold,
    /// The model call itself failed with a context-overflow error.
    Overflow,
}

/// `reservedOutputTokens = clamp(outputLimit, [1024, contextLimit-1])`, or
/// `max(1024, 0.2 * contextLimit)` when the output limit is unknown.
pub fn reserved_output_tokens(cap: &ModelCapability) -> u32 {
    match cap.output_limit {
        Some(limit) => limit.clamp(1024, cap.context_limit.saturating_sub(1).max(1024)),
        None => max(1024, (cap.context_limit as f64 * 0.2) as u32),
    }
}

/// `inputBudget = min(contextLimit - reservedOutputTokens, floor(contextLimit * 0.8))`.
pub fn compute_input_budget(cap: &ModelCapability) -> u32 {
    let reserved = reserved_output_tokens(cap);
    let safe_input_budget = cap.context_limit.saturating_sub(reserved);
    let early_input_budget = (cap.context_limit as f64 * 0.8) as u32;
    min(safe_input_budget, early_input_budget)
}

/// Heuristic budget used when the model's capability is unknown and a real
/// context-overflow error was observed: shrink more aggressively on each
/// retry. `attempt` is 1-based.
pub fn heuristic_overflow_budget(baseline: u32, attempt: u32) -> u32 {
    let factor = (0.7 - 0.15 * (attempt.saturating_sub(1)) as f64).max(0.2);
    max(256, (baseline as f64 * factor) as u32)
}

/// Decide whether a just-finished turn should trigger compaction, given a
/// known capability and the turn's reported input token count.
pub fn should_schedule_on_threshold(cap: &ModelCapability, turn_input_tokens: u32) -> bool {
    turn_input_tokens >= compute_input_budget(cap)
}

// ─── Summarization boundary ────────────────────────────────────────────────

/// Abstraction over "ask the model to summarize this text", so this crate
/// never depends on a concrete `ModelProvider`. The turn engine supplies an
/// adapter backed by `convo_model::ModelProvider::complete` with
/// `tools: vec![]`.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str, max_output_tokens: usize) -> anyhow::Result<String>;
}

// ─── Transcript repair / boundary helpers (self-contained; mirrors the
// validity rules convo-engine's Transcript enforces, duplicated here so this
// crate has no circular dependency on convo-engine) ─────────────────────────

fn open_tool_call_ids(msgs: &[Message]) -> std::collections::HashSet<String> {
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

/// Drop `tool` messages whose `tool_call_id` has no matching open call, and
/// any message with empty text/tool-result content — step 2 of the
/// compaction transform.
fn repair_transcript(msgs: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(msgs.len());
    let mut open: std::collections::HashSet<String> = std::collections::HashSet::new();
    for m in msgs {
        match (&m.role, &m.content) {
            (Role::Assistant, MessageContent::ToolCall { tool_call_id, .. }) => {
                open.insert(tool_call_id.clone());
                out.push(m.clone());
            }
            (Role::Tool, MessageContent::ToolResult { tool_call_id, content }) => {
                let empty = matches!(content, ToolResultContent::Text(t) if t.is_empty());
                if open.remove(tool_call_id) && !empty {
                    out.push(m.clone());
                }
            }
            _ => out.push(m.clone()),
        }
    }
    out
}

/// A cut point is valid if it lands on a user message, or an assistant
/// message with no open tool-calls preceding it.
fn is_cut_boundary(msgs: &[Message], idx: usize) -> bool {
    if idx == 0 || idx >= msgs.len() {
        return true;
    }
    match &msgs[idx].role {
        Role::User => true,
        Role::Assistant => open_tool_call_ids(&msgs[..idx]).is_empty(),
        _ => false,
    }
}

/// Walk backward from the end, accumulating `approx_tokens`, until the
/// retained suffix would exceed `keep_budget` tokens, then snap forward to
/// the nearest valid cut boundary — step 3.
fn choose_suffix_start(msgs: &[Message], keep_budget: usize, fallback_keep_n: usize) -> usize {
    let mut tokens = 0usize;
    let mut idx = msgs.len();
    while idx > 0 {
        let next = idx - 1;
        let t = msgs[next].approx_tokens();
        if tokens + t > keep_budget && idx != msgs.len() {
            break;
        }
        tokens += t;
        idx = next;
    }
    while idx < msgs.len() && !is_cut_boundary(msgs, idx) {
        idx += 1;
    }
    if idx >= msgs.len() {
        // Nothing fit within budget at a valid boundary — fall back to
        // keeping the last `fallback_keep_n` messages at the nearest
        // boundary at or before that point.
        let mut fallback = msgs.len().saturating_sub(fallback_keep_n);
        while fallback < msgs.len() && !is_cut_boundary(msgs, fallback) {
            fallback += 1;
        }
        return fallback.min(msgs.len());
    }
    idx
}

fn render_history(msgs: &[Message]) -> String {
    msgs.iter()
        .filter(|m| m.role != Role::System)
        .map(render_one)
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_one(m: &Message) -> String {
    let role = match m.role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::Tool => "Tool",
        Role::System => "System",
    };
    let text = match &m.content {
        MessageContent::Text(t) => t.clone(),
        MessageContent::ContentParts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => text.clone(),
                ContentPart::Image { .. } => "[image]".to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        MessageContent::ToolCall { function, .. } => {
            format!("[tool_call: {}({})]", function.name, function.arguments)
        }
        MessageContent::ToolResult { content, .. } => format!("[tool_result: {content}]"),
    };
    format!("{role}: {text}")
}

const SUMMARIZE_PROMPT: &str = "Summarize the following conversation history in a concise, \
information-dense way. Preserve technical details, decisions, file names, and facts that may \
be relevant to future turns. This summary will replace the original history.";

/// Split `text` into chunks of roughly `chunk_chars` characters, splitting at
/// the nearest preceding blank-line boundary so a chunk never ends mid-turn.
fn chunk_text(text: &str, chunk_chars: usize) -> Vec<String> {
    if text.len() <= chunk_chars || chunk_chars == 0 {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > chunk_chars {
        let cut = rest[..chunk_chars]
            .rfind("\n\n")
            .map(|p| p + 2)
            .unwrap_or(chunk_chars);
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Hierarchically summarize `history` in chunks sized to ~35% of the
/// summarizer model's context window, folding each chunk's summary into the
/// next ("init" then repeated "update"). On overflow, halves the chunk size
/// and retries up to 6 passes; falls back to a deterministic character
/// truncation if every pass overflows.
async fn summarize_hierarchical(
    history: &str,
    summarizer: &dyn Summarizer,
    summarizer_context_tokens: usize,
) -> String {
    let mut chunk_chars = ((summarizer_context_tokens as f64 * 0.35) as usize * 4).max(2000);
    for _pass in 0..6 {
        let chunks = chunk_text(history, chunk_chars);
        let mut running_summary = String::new();
        let mut overflowed = false;
        for chunk in &chunks {
            let prompt = if running_summary.is_empty() {
                format!("{SUMMARIZE_PROMPT}\n\n---\n\n{chunk}")
            } else {
                format!(
                    "{SUMMARIZE_PROMPT}\n\nExisting summary so far:\n{running_summary}\n\n\
                     New history to fold in:\n{chunk}"
                )
            };
            match summarizer.summarize(&prompt, summarizer_context_tokens / 4).await {
                Ok(s) => running_summary = s,
                Err(_) => {
                    overflowed = true;
                    break;
                }
            }
        }
        if !overflowed {
            return running_summary;
        }
        chunk_chars /= 2;
    }
    // Deterministic fallback: truncate to a bounded length.
    let cap = 4000;
    if history.len() <= cap {
        history.to_string()
    } else {
        format!("{}\n[...history truncated for compaction...]", &history[..cap])
    }
}

/// Outcome of a compaction pass — the new outbound message list plus
/// bookkeeping for the `messages_reset` event the caller should emit.
pub struct CompactionOutcome {
    pub messages: Vec<Message>,
    pub previous_message_count: usize,
    pub dropped_message_count: usize,
}

/// Run the full compaction transform (SPEC §4.4) over `messages`, producing
/// a replacement list that fits within `cap`'s input budget.
///
/// `keep_budget_tokens` is the token budget for the retained (non-summarized)
/// suffix; callers typically pass a fraction of [`compute_input_budget`].
pub async fn compact(
    messages: &[Message],
    summarizer: &dyn Summarizer,
    cap: &ModelCapability,
    summarizer_context_tokens: usize,
    keep_budget_tokens: usize,
    fallback_keep_n: usize,
) -> CompactionOutcome {
    let before = messages.len();

    // Step 1: refuse if the outbound tail is an assistant message with open
    // tool-calls (caller must not compact mid-tool-turn).
    if !messages.is_empty() && !open_tool_call_ids(messages).is_empty() {
        return CompactionOutcome {
            messages: messages.to_vec(),
            previous_message_count: before,
            dropped_message_count: 0,
        };
    }

    // Step 2: repair.
    let repaired = repair_transcript(messages);

    // Step 3: choose suffix start.
    let mut suffix_start = choose_suffix_start(&repaired, keep_budget_tokens, fallback_keep_n);

    // Step 4: if the suffix starts on an assistant message, fold back to the
    // preceding user message so the split-turn prefix is summarized too.
    if suffix_start < repaired.len() && repaired[suffix_start].role == Role::Assistant {
        let mut j = suffix_start;
        while j > 0 && repaired[j - 1].role != Role::User {
            j -= 1;
        }
        suffix_start = j;
    }

    let discarded = &repaired[..suffix_start];
    let retained = &repaired[suffix_start..];

    if discarded.is_empty() {
        return CompactionOutcome {
            messages: repaired,
            previous_message_count: before,
            dropped_message_count: 0,
        };
    }

    // Step 5: summarize the discarded history.
    let history_text = render_history(discarded);
    let summary = summarize_hierarchical(&history_text, summarizer, summarizer_context_tokens).await;

    // Step 6: prepend the summary, splice the retained suffix.
    let mut out = Vec::with_capacity(retained.len() + 1);
    out.push(Message::user(format!("<summary>\n{summary}\n</summary>")));
    out.extend(retained.iter().cloned());

    // Step 7: shrink-to-budget if still over.
    let input_budget = compute_input_budget(cap) as usize;
    shrink_to_budget(&mut out, input_budget);

    let dropped = before.saturating_sub(out.len());
    CompactionOutcome { messages: out, previous_message_count: before, dropped_message_count: dropped }
}

fn total_tokens(msgs: &[Message]) -> usize {
    msgs.iter().map(|m| m.approx_tokens()).sum()
}

/// Step 7: progressively shrink `msgs` in place until it fits `budget`
/// tokens — first by omitting tool-result bodies, then by dropping
/// non-essential middle messages (never the head summary or the last user
/// message), then by character-truncating the head message.
fn shrink_to_budget(msgs: &mut Vec<Message>, budget: usize) {
    if total_tokens(msgs) <= budget || msgs.len() <= 2 {
        return;
    }

    // 7a: omit tool-result bodies one at a time, largest first.
    let mut tool_result_indices: Vec<usize> = msgs
        .iter()
        .enumerate()
        .filter(|(_, m)| matches!(m.content, MessageContent::ToolResult { .. }))
        .map(|(i, _)| i)
        .collect();
    tool_result_indices.sort_by_key(|&i| std::cmp::Reverse(msgs[i].approx_tokens()));
    for i in tool_result_indices {
        if total_tokens(msgs) <= budget {
            return;
        }
        if let MessageContent::ToolResult { tool_call_id, .. } = &msgs[i].content {
            let id = tool_call_id.clone();
            msgs[i] = Message {
                role: Role::Tool,
                content: MessageContent::ToolResult {
                    tool_call_id: id,
                    content: ToolResultContent::Text(
                        "[tool output omitted by emergency compaction]".into(),
                    ),
                },
            };
        }
    }

    // 7b: drop non-essential middle messages — never index 0 (head summary)
    // or the last user message.
    let last_user = msgs.iter().rposition(|m| m.role == Role::User);
    let mut i = msgs.len().saturating_sub(1);
    while total_tokens(msgs) > budget && msgs.len() > 2 && i > 0 {
        if i != 0 && Some(i) != last_user {
            msgs.remove(i);
        }
        i = i.saturating_sub(1);
    }

    // 7c: character-truncate the head message if still over budget.
    if total_tokens(msgs) > budget {
        if let Some(head) = msgs.first_mut() {
            if let Some(text) = head.as_text() {
                let cap_chars = budget.saturating_mul(4).max(200);
                if text.len() > cap_chars {
                    let truncated = format!("{}…[truncated for compaction]", &text[..cap_chars]);
                    *head = Message { role: head.role.clone(), content: MessageContent::Text(truncated) };
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
