// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use convo_model::Message;
use serde_json::Value;

/// A single source message already fetched by the adapter, narrowed to the
/// fields composition needs. Ordered oldest-to-newest within a composed
/// chain; no duplicate `message_id` within one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyChainMessage {
    pub message_id: String,
    pub author_id: String,
    pub author_name: String,
    pub is_bot: bool,
    pub ts: i64,
    pub text: String,
    pub attachments: Vec<SourceAttachment>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceAttachment {
    pub url: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
}

/// Contiguous same-author messages within the merge window, flattened into
/// one logical message.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedChunk {
    pub author_id: String,
    pub author_name: String,
    pub is_bot: bool,
    pub message_ids: Vec<String>,
    pub text: String,
    pub attachments: Vec<SourceAttachment>,
    pub ts_last: i64,
}

/// Why composition was triggered; governs session-divider cutoff and
/// active-burst applicability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    Reply,
    Mention,
    Active,
}

/// The result of any of the three entry points: the ordered model-message
/// list plus the intermediate chain/merge views, for callers that need to
/// inspect composition (tests, logging).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposedRequest {
    pub messages: Vec<Message>,
    pub chain: Vec<ReplyChainMessage>,
    pub merged: Vec<MergedChunk>,
}
