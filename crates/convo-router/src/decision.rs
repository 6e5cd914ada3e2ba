// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The pure routing decision table (§4.1). No I/O, no bus, no timers — this
//! is the part a reviewer can check scenario-by-scenario against the spec's
//! table directly.

use convo_config::RouterMode;

/// Which row of the decision table a trigger falls into, already resolved
/// from raw envelope fields (mention/reply/active-output membership).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    PlainMessage,
    MentionNotReply,
    ReplyToActiveOutputNoMention,
    ReplyToActiveOutputAndMention,
    ReplyToNonActiveBotMessage,
}

/// One of the decision table's seven outcomes, with the extra parameters
/// a caller needs to act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    Skip,
    Buffer,
    StartPrompt,
    /// Mention mode: a second mention while one request is already running
    /// for this session queues behind it rather than steering.
    QueuePrompt,
    /// Active mode: a reply to a stale (non-active) bot message while
    /// something else is running forks a second, queued-behind request.
    QueuePromptForked,
    Steer { reanchor_inherit_reply_to: bool },
    SteerOrInterrupt { reanchor_to_this_message: bool },
    FollowUp,
    EnqueuePendingMentionReplyBatch,
    FlushPendingBatchThenSteerOrInterrupt,
}

/// Apply the nine-row decision table.
pub fn decide(
    mode: RouterMode,
    is_dm: bool,
    trigger: TriggerKind,
    has_active_request: bool,
) -> RouteAction {
    use RouteAction::*;
    use TriggerKind::*;

    match (mode, trigger) {
        (RouterMode::Active, PlainMessage) => {
            if has_active_request {
                FollowUp
            } else if is_dm {
                FollowUp
            } else {
                Buffer
            }
        }
        (RouterMode::Active, MentionNotReply) => {
            if has_active_request {
                Steer { reanchor_inherit_reply_to: true }
            } else {
                StartPrompt
            }
        }
        (RouterMode::Active, ReplyToActiveOutputNoMention) => {
            if has_active_request {
                FollowUp
            } else {
                StartPrompt
            }
        }
        (RouterMode::Active, ReplyToActiveOutputAndMention) => {
            if has_active_request {
                SteerOrInterrupt { reanchor_to_this_message: true }
            } else {
                StartPrompt
            }
        }
        (RouterMode::Active, ReplyToNonActiveBotMessage) => {
            if has_active_request {
                QueuePromptForked
            } else {
                StartPrompt
            }
        }
        (RouterMode::Mention, PlainMessage) => Skip,
        (RouterMode::Mention, MentionNotReply) => {
            if has_active_request {
                QueuePrompt
            } else {
                StartPrompt
            }
        }
        (RouterMode::Mention, ReplyToActiveOutputAndMention) => {
            if has_active_request {
                FlushPendingBatchThenSteerOrInterrupt
            } else {
                StartPrompt
            }
        }
        (RouterMode::Mention, ReplyToActiveOutputNoMention) => {
            if has_active_request {
                EnqueuePendingMentionReplyBatch
            } else {
                StartPrompt
            }
        }
        // Not a row of the table: in mention mode a reply to a past
        // (non-active) bot message carries no mention, so it behaves like
        // any other non-trigger message.
        (RouterMode::Mention, ReplyToNonActiveBotMessage) => Skip,
    }
}

/// Classify a raw Discord envelope plus active-output-chain membership into
/// a [`TriggerKind`].
pub fn classify_trigger(
    mentions_bot: bool,
    reply_to_message_id: Option<&str>,
    active_output_message_ids: &std::collections::HashSet<String>,
) -> TriggerKind {
    match reply_to_message_id {
        None => {
            if mentions_bot {
                TriggerKind::MentionNotReply
            } else {
                TriggerKind::PlainMessage
            }
        }
        Some(id) => {
            let is_active_output = active_output_message_ids.contains(id);
            match (is_active_output, mentions_bot) {
                (true, true) => TriggerKind::ReplyToActiveOutputAndMention,
                (true, false) => TriggerKind::ReplyToActiveOutputNoMention,
                (false, _) => TriggerKind::ReplyToNonActiveBotMessage,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn mention_mode_plain_message_always_skips() {
        assert_eq!(
            decide(RouterMode::Mention, false, TriggerKind::PlainMessage, false),
            RouteAction::Skip
        );
        assert_eq!(
            decide(RouterMode::Mention, false, TriggerKind::PlainMessage, true),
            RouteAction::Skip
        );
    }

    #[test]
    fn mention_mode_mention_queues_behind_active_request() {
        assert_eq!(
            decide(RouterMode::Mention, false, TriggerKind::MentionNotReply, true),
            RouteAction::QueuePrompt
        );
        assert_eq!(
            decide(RouterMode::Mention, false, TriggerKind::MentionNotReply, false),
            RouteAction::StartPrompt
        );
    }

    #[test]
    fn mention_mode_reply_to_active_output_and_mention_flushes_batch() {
        assert_eq!(
            decide(RouterMode::Mention, false, TriggerKind::ReplyToActiveOutputAndMention, true),
            RouteAction::FlushPendingBatchThenSteerOrInterrupt
        );
    }

    #[test]
    fn mention_mode_reply_to_active_output_no_mention_enqueues_pending_batch() {
        assert_eq!(
            decide(RouterMode::Mention, false, TriggerKind::ReplyToActiveOutputNoMention, true),
            RouteAction::EnqueuePendingMentionReplyBatch
        );
    }

    #[test]
    fn active_mode_plain_message_buffers_in_channel_but_follows_up_in_dm() {
        assert_eq!(decide(RouterMode::Active, false, TriggerKind::PlainMessage, false), RouteAction::Buffer);
        assert_eq!(decide(RouterMode::Active, true, TriggerKind::PlainMessage, false), RouteAction::FollowUp);
        assert_eq!(decide(RouterMode::Active, false, TriggerKind::PlainMessage, true), RouteAction::FollowUp);
    }

    #[test]
    fn active_mode_mention_steers_with_reanchor_when_running() {
        assert_eq!(
            decide(RouterMode::Active, false, TriggerKind::MentionNotReply, true),
            RouteAction::Steer { reanchor_inherit_reply_to: true }
        );
    }

    #[test]
    fn active_mode_reply_to_non_active_bot_message_forks_a_queued_request() {
        assert_eq!(
            decide(RouterMode::Active, false, TriggerKind::ReplyToNonActiveBotMessage, true),
            RouteAction::QueuePromptForked
        );
        assert_eq!(
            decide(RouterMode::Active, false, TriggerKind::ReplyToNonActiveBotMessage, false),
            RouteAction::StartPrompt
        );
    }

    #[test]
    fn classify_trigger_distinguishes_active_output_from_stale_reply() {
        let mut active = HashSet::new();
        active.insert("a2".to_string());
        assert_eq!(
            classify_trigger(true, Some("a2"), &active),
            TriggerKind::ReplyToActiveOutputAndMention
        );
        assert_eq!(
            classify_trigger(false, Some("stale"), &active),
            TriggerKind::ReplyToNonActiveBotMessage
        );
        assert_eq!(classify_trigger(true, None, &active), TriggerKind::MentionNotReply);
        assert_eq!(classify_trigger(false, None, &active), TriggerKind::PlainMessage);
    }
}
