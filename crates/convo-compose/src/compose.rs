// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The three composition entry points: reply-chain anchored, mention-thread
//! anchored, and recent-channel active-burst anchored. Each walks an
//! already-fetched transcript through divider cutoff, active-burst
//! selection (where applicable), merge-window folding, and rendering into
//! model messages.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::attachments::{resolve_attachment, AttachmentBudget, AttachmentFetcher};
use crate::merge::{apply_active_burst, cut_at_last_divider_before, merge_window, sort_by_ts_then_id};
use crate::render::{build_user_message, render_bot_chunk, render_user_chunk};
use crate::types::{ComposedRequest, ReplyChainMessage};

/// Fetches already-downloaded transcript data; the adapter's API client and
/// message cache live outside this crate's boundary.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Walk up the reply chain starting at (but not including) `message_id`,
    /// oldest-to-newest, stopping after `max_depth` ancestors or at a
    /// cross-session reference the adapter does not resolve further.
    async fn fetch_reply_chain(
        &self,
        channel_id: &str,
        message_id: &str,
        max_depth: usize,
    ) -> anyhow::Result<Vec<ReplyChainMessage>>;

    /// Fetch up to `limit` of the most recent messages in `channel_id`,
    /// oldest-to-newest, ending at or before `before_ts` when given.
    async fn fetch_recent_channel_messages(
        &self,
        channel_id: &str,
        limit: usize,
        before_ts: Option<i64>,
    ) -> anyhow::Result<Vec<ReplyChainMessage>>;
}

async fn render_chain(
    chain: Vec<ReplyChainMessage>,
    fetcher: &dyn AttachmentFetcher,
    aliases: &HashMap<String, String>,
) -> ComposedRequest {
    if chain.is_empty() {
        return ComposedRequest::default();
    }
    let merged = merge_window(&chain);
    let mut budget = AttachmentBudget::default();
    let mut cache = HashMap::new();
    let mut messages = Vec::with_capacity(merged.len());
    for chunk in &merged {
        if chunk.is_bot {
            messages.push(render_bot_chunk(chunk));
            continue;
        }
        let mut parts = Vec::new();
        for att in &chunk.attachments {
            parts.push(resolve_attachment(att, fetcher, &mut budget, &mut cache).await);
        }
        let alias = aliases.get(&chunk.author_id).map(String::as_str);
        let rendered = render_user_chunk(chunk, alias, &[]);
        messages.push(build_user_message(rendered, parts));
    }
    ComposedRequest { messages, chain, merged }
}

/// Compose a request anchored on a reply chain: walk ancestors up to
/// `max_depth`, append the anchor message itself, cut at the last session
/// divider, fold into merge chunks, and render.
pub async fn compose_from_reply_chain(
    source: &dyn MessageSource,
    fetcher: &dyn AttachmentFetcher,
    aliases: &HashMap<String, String>,
    channel_id: &str,
    anchor: ReplyChainMessage,
    max_depth: usize,
) -> anyhow::Result<ComposedRequest> {
    let mut chain = source
        .fetch_reply_chain(channel_id, &anchor.message_id, max_depth)
        .await?;
    chain.push(anchor);
    sort_by_ts_then_id(&mut chain);
    let anchor_index = chain.len();
    let chain = cut_at_last_divider_before(&chain, anchor_index);
    Ok(render_chain(chain, fetcher, aliases).await)
}

/// Compose a request anchored on a mention: pull the recent channel window
/// ending at the mention, cut at the last divider, fold, and render.
pub async fn compose_from_mention_thread(
    source: &dyn MessageSource,
    fetcher: &dyn AttachmentFetcher,
    aliases: &HashMap<String, String>,
    channel_id: &str,
    anchor: ReplyChainMessage,
    lookback_limit: usize,
) -> anyhow::Result<ComposedRequest> {
    let mut chain = source
        .fetch_recent_channel_messages(channel_id, lookback_limit, Some(anchor.ts))
        .await?;
    if chain.last().map(|m| m.message_id != anchor.message_id).unwrap_or(true) {
        chain.push(anchor);
    }
    sort_by_ts_then_id(&mut chain);
    let anchor_index = chain.len();
    let chain = cut_at_last_divider_before(&chain, anchor_index);
    Ok(render_chain(chain, fetcher, aliases).await)
}

/// Compose a request for an active session turn: pull the recent channel
/// window, apply the active-burst age/gap/limit rules relative to
/// `anchor_ts`, cut at the last divider, fold, and render.
pub async fn compose_recent_channel_messages(
    source: &dyn MessageSource,
    fetcher: &dyn AttachmentFetcher,
    aliases: &HashMap<String, String>,
    channel_id: &str,
    anchor_ts: i64,
    limit: usize,
) -> anyhow::Result<ComposedRequest> {
    let mut chain = source
        .fetch_recent_channel_messages(channel_id, limit, Some(anchor_ts))
        .await?;
    sort_by_ts_then_id(&mut chain);
    let burst = apply_active_burst(&chain, anchor_ts, limit);
    let anchor_index = burst.len();
    let chain = cut_at_last_divider_before(&burst, anchor_index);
    Ok(render_chain(chain, fetcher, aliases).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::SESSION_DIVIDER_MARKER;
    use crate::types::SourceAttachment;

    struct EmptySource;

    #[async_trait]
    impl MessageSource for EmptySource {
        async fn fetch_reply_chain(&self, _: &str, _: &str, _: usize) -> anyhow::Result<Vec<ReplyChainMessage>> {
            Ok(vec![])
        }
        async fn fetch_recent_channel_messages(&self, _: &str, _: usize, _: Option<i64>) -> anyhow::Result<Vec<ReplyChainMessage>> {
            Ok(vec![])
        }
    }

    struct FixedSource(Vec<ReplyChainMessage>);

    #[async_trait]
    impl MessageSource for FixedSource {
        async fn fetch_reply_chain(&self, _: &str, _: &str, max_depth: usize) -> anyhow::Result<Vec<ReplyChainMessage>> {
            let mut v = self.0.clone();
            v.truncate(max_depth);
            Ok(v)
        }
        async fn fetch_recent_channel_messages(&self, _: &str, limit: usize, _: Option<i64>) -> anyhow::Result<Vec<ReplyChainMessage>> {
            let mut v = self.0.clone();
            v.truncate(limit);
            Ok(v)
        }
    }

    struct NoopFetcher;

    #[async_trait]
    impl AttachmentFetcher for NoopFetcher {
        async fn fetch(&self, _url: &str) -> anyhow::Result<Vec<u8>> {
            Ok(vec![])
        }
    }

    fn msg(id: &str, author: &str, is_bot: bool, ts: i64, text: &str) -> ReplyChainMessage {
        ReplyChainMessage {
            message_id: id.into(),
            author_id: author.into(),
            author_name: author.into(),
            is_bot,
            ts,
            text: text.into(),
            attachments: vec![],
            raw: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn empty_transcript_composes_to_empty_request() {
        let source = EmptySource;
        let fetcher = NoopFetcher;
        let anchor = msg("anchor", "u1", false, 0, "hi");
        let out = compose_from_reply_chain(&source, &fetcher, &HashMap::new(), "c1", anchor, 20)
            .await
            .unwrap();
        assert!(out.messages.is_empty());
        assert!(out.chain.is_empty());
        assert!(out.merged.is_empty());
    }

    #[tokio::test]
    async fn reply_chain_includes_ancestors_and_anchor_in_order() {
        let ancestors = vec![msg("1", "u1", false, 0, "first"), msg("2", "bot", true, 10, "reply")];
        let source = FixedSource(ancestors);
        let fetcher = NoopFetcher;
        let anchor = msg("3", "u1", false, 20, "thanks");
        let out = compose_from_reply_chain(&source, &fetcher, &HashMap::new(), "c1", anchor, 20)
            .await
            .unwrap();
        assert_eq!(out.chain.len(), 3);
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[1].as_text(), Some("reply"));
    }

    #[tokio::test]
    async fn reply_chain_respects_max_depth() {
        let ancestors = vec![
            msg("1", "u1", false, 0, "a"),
            msg("2", "u1", false, 100, "b"),
            msg("3", "u1", false, 200, "c"),
        ];
        let source = FixedSource(ancestors);
        let fetcher = NoopFetcher;
        let anchor = msg("4", "u1", false, 300, "d");
        let out = compose_from_reply_chain(&source, &fetcher, &HashMap::new(), "c1", anchor, 2)
            .await
            .unwrap();
        // 2 ancestors (depth-limited) + anchor = 3 total source messages.
        assert_eq!(out.chain.len(), 3);
    }

    #[tokio::test]
    async fn mention_thread_cuts_at_divider() {
        let history = vec![
            msg("1", "u1", false, 0, "old"),
            msg("2", "bot", true, 10, SESSION_DIVIDER_MARKER),
            msg("3", "u2", false, 20, "mentioning the bot"),
        ];
        let source = FixedSource(history);
        let fetcher = NoopFetcher;
        let anchor = msg("3", "u2", false, 20, "mentioning the bot");
        let out = compose_from_mention_thread(&source, &fetcher, &HashMap::new(), "c1", anchor, 10)
            .await
            .unwrap();
        assert_eq!(out.chain.len(), 1);
        assert_eq!(out.chain[0].message_id, "3");
    }

    #[tokio::test]
    async fn active_composition_applies_burst_rules() {
        let history = vec![msg("1", "u1", false, 0, "old"), msg("2", "u1", false, 4 * 3600, "recent")];
        let source = FixedSource(history);
        let fetcher = NoopFetcher;
        let out = compose_recent_channel_messages(&source, &fetcher, &HashMap::new(), "c1", 4 * 3600, 10)
            .await
            .unwrap();
        assert_eq!(out.chain.len(), 1);
        assert_eq!(out.chain[0].message_id, "2");
    }

    #[tokio::test]
    async fn attachments_are_resolved_into_content_parts() {
        let mut m = msg("1", "u1", false, 0, "see attached");
        m.attachments = vec![SourceAttachment {
            url: "https://cdn.discordapp.com/x.png".into(),
            filename: "x.png".into(),
            content_type: Some("image/png".into()),
            size_bytes: 100,
        }];
        let source = FixedSource(vec![]);
        let fetcher = NoopFetcher;
        let out = compose_from_reply_chain(&source, &fetcher, &HashMap::new(), "c1", m, 20)
            .await
            .unwrap();
        assert_eq!(out.messages.len(), 1);
        assert!(out.messages[0].image_urls().contains(&"https://cdn.discordapp.com/x.png"));
    }
}
