// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Reconstructs the model-facing request from a Discord transcript: reply
//! chains, mention threads, and active-session bursts all fold through the
//! same merge-window and rendering pipeline.

mod attachments;
mod compose;
mod merge;
mod render;
mod types;

pub use attachments::{
    categorize, resolve_attachment, AttachmentBudget, AttachmentCategory, AttachmentFetcher,
    MAX_ATTACHMENT_BYTES, MAX_TOTAL_ATTACHMENT_BYTES,
};
pub use compose::{compose_from_mention_thread, compose_from_reply_chain, compose_recent_channel_messages, MessageSource};
pub use merge::{
    apply_active_burst, cut_at_last_divider_before, is_session_divider, merge_window,
    sort_by_ts_then_id, MERGE_WINDOW_SECS, SESSION_DIVIDER_MARKER,
};
pub use render::{build_user_message, render_bot_chunk, render_user_chunk, strip_leading_mention};
pub use types::{ComposedRequest, MergedChunk, ReplyChainMessage, SourceAttachment, TriggerType};
