// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Merge window, session-divider cutoff, and active-burst selection — the
//! pure transforms composition applies to an already-fetched chain.

use crate::types::{MergedChunk, ReplyChainMessage};

/// Contiguous same-author messages whose successive `ts` gap is at most
/// this many seconds are folded into one chunk.
pub const MERGE_WINDOW_SECS: i64 = 7 * 60;

pub const ACTIVE_BURST_MAX_AGE_SECS: i64 = 3 * 3600;
pub const ACTIVE_BURST_MAX_GAP_SECS: i64 = 2 * 3600;

/// The session-divider marker. The source defines this string elsewhere and
/// treats it here as an opaque predicate on assistant text (Design Note);
/// this is a placeholder value a deployment can override by pre-filtering
/// `chain` before calling [`cut_at_last_divider_before`].
pub const SESSION_DIVIDER_MARKER: &str = "\u{2500}\u{2500}\u{2500} session reset \u{2500}\u{2500}\u{2500}";

pub fn is_session_divider(text: &str) -> bool {
    text.trim() == SESSION_DIVIDER_MARKER
}

/// Fold `chain` (oldest-to-newest) into merge chunks. Merging an
/// already-merged chain (expressed back as one message per chunk) is a
/// no-op: author identity and the folded `ts_last` prevent re-splitting.
pub fn merge_window(chain: &[ReplyChainMessage]) -> Vec<MergedChunk> {
    let mut out: Vec<MergedChunk> = Vec::new();
    for m in chain {
        if let Some(last) = out.last_mut() {
            if last.author_id == m.author_id && (m.ts - last.ts_last) <= MERGE_WINDOW_SECS {
                last.text.push_str("\n\n");
                last.text.push_str(&m.text);
                last.attachments.extend(m.attachments.iter().cloned());
                last.message_ids.push(m.message_id.clone());
                last.ts_last = m.ts;
                continue;
            }
        }
        out.push(MergedChunk {
            author_id: m.author_id.clone(),
            author_name: m.author_name.clone(),
            is_bot: m.is_bot,
            message_ids: vec![m.message_id.clone()],
            text: m.text.clone(),
            attachments: m.attachments.clone(),
            ts_last: m.ts,
        });
    }
    out
}

/// Drop everything at or before the last divider message that occurs
/// strictly before `anchor_index`. The divider message itself is always
/// excluded from the result (here and by [`is_session_divider`] filtering
/// downstream), regardless of cutoff.
pub fn cut_at_last_divider_before(chain: &[ReplyChainMessage], anchor_index: usize) -> Vec<ReplyChainMessage> {
    let bound = anchor_index.min(chain.len());
    let last_divider = chain[..bound].iter().rposition(|m| is_session_divider(&m.text));
    match last_divider {
        Some(idx) => chain[idx + 1..].to_vec(),
        None => chain.to_vec(),
    }
}

/// Walk backward from `anchor_ts`, keeping messages until age-from-anchor
/// exceeds 3h or the silence gap to the next-older message exceeds 2h (the
/// gap-crossing message is excluded), bounded by `limit`. `chain` must be
/// oldest-to-newest; the result preserves that order.
pub fn apply_active_burst(chain: &[ReplyChainMessage], anchor_ts: i64, limit: usize) -> Vec<ReplyChainMessage> {
    let mut kept: Vec<ReplyChainMessage> = Vec::new();
    let mut prev_ts = anchor_ts;
    for m in chain.iter().rev() {
        if anchor_ts.saturating_sub(m.ts) > ACTIVE_BURST_MAX_AGE_SECS {
            break;
        }
        if !kept.is_empty() && prev_ts.saturating_sub(m.ts) > ACTIVE_BURST_MAX_GAP_SECS {
            break;
        }
        kept.push(m.clone());
        prev_ts = m.ts;
        if kept.len() >= limit {
            break;
        }
    }
    kept.reverse();
    kept
}

/// Platform/system notifications (`raw.discord.isChat == false`) are
/// excluded from model context but kept in raw listings by the caller.
pub fn filter_chat_messages(chain: Vec<ReplyChainMessage>, is_chat: impl Fn(&ReplyChainMessage) -> bool) -> Vec<ReplyChainMessage> {
    chain.into_iter().filter(is_chat).collect()
}

/// Snowflake-lexical tiebreak for messages sharing a `ts` (Open Question
/// (a): preserved from the source rather than re-derived).
pub fn sort_by_ts_then_id(chain: &mut [ReplyChainMessage]) {
    chain.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.message_id.cmp(&b.message_id)));
}
