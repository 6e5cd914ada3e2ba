// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-chunk rendering into model messages: user chunks get an attribution
//! header, bot/assistant chunks render as plain assistant text.

use convo_model::{ContentPart, Message};

use crate::types::MergedChunk;

/// `[discord user_id=<authorId> user_name=<sanitized> [user_alias=<alias>]
/// message_id=<last> [reactions=...] ]\n<normalized body>`
pub fn render_user_chunk(chunk: &MergedChunk, alias: Option<&str>, reactions: &[String]) -> String {
    let mut header = format!(
        "[discord user_id={} user_name={}",
        chunk.author_id,
        sanitize_name(&chunk.author_name)
    );
    if let Some(a) = alias {
        header.push_str(&format!(" user_alias={a}"));
    }
    let last_id = chunk.message_ids.last().map(String::as_str).unwrap_or("");
    header.push_str(&format!(" message_id={last_id}"));
    if !reactions.is_empty() {
        header.push_str(&format!(" reactions={}", reactions.join(",")));
    }
    header.push_str(" ]");
    format!("{header}\n{}", normalize_body(&chunk.text))
}

fn sanitize_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_body(text: &str) -> String {
    text.trim().to_string()
}

/// Strip a leading bot mention token (`<@id>` or `@botName`) exactly once.
/// Idempotent: a second call on the result is a no-op, satisfying the
/// round-trip law "no trailing leading-mention" after one strip.
pub fn strip_leading_mention(text: &str, token: &str) -> String {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix(token) {
        rest.trim_start().to_string()
    } else {
        text.to_string()
    }
}

/// Builds a `Message::user` with attachment content parts appended after
/// the rendered text header.
pub fn build_user_message(header_and_body: String, attachments: Vec<ContentPart>) -> Message {
    if attachments.is_empty() {
        Message::user(header_and_body)
    } else {
        let mut parts = vec![ContentPart::text(header_and_body)];
        parts.extend(attachments);
        Message::user_with_parts(parts)
    }
}

/// Bot/assistant chunks render with no attribution header.
pub fn render_bot_chunk(chunk: &MergedChunk) -> Message {
    Message::assistant(normalize_body(&chunk.text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MergedChunk;

    fn chunk() -> MergedChunk {
        MergedChunk {
            author_id: "u1".into(),
            author_name: "Alice  Smith".into(),
            is_bot: false,
            message_ids: vec!["m1".into(), "m2".into()],
            text: "hello there".into(),
            attachments: vec![],
            ts_last: 0,
        }
    }

    #[test]
    fn renders_header_with_last_message_id() {
        let out = render_user_chunk(&chunk(), None, &[]);
        assert!(out.starts_with("[discord user_id=u1 user_name=Alice Smith message_id=m2 ]"));
        assert!(out.ends_with("hello there"));
    }

    #[test]
    fn renders_alias_and_reactions_when_present() {
        let out = render_user_chunk(&chunk(), Some("ally"), &["👍".to_string()]);
        assert!(out.contains("user_alias=ally"));
        assert!(out.contains("reactions=👍"));
    }

    #[test]
    fn strips_leading_mention_exactly_once() {
        let once = strip_leading_mention("<@bot> hi there", "<@bot>");
        assert_eq!(once, "hi there");
        let twice = strip_leading_mention(&once, "<@bot>");
        assert_eq!(twice, once, "stripping an already-stripped text must be a no-op");
    }

    #[test]
    fn bot_chunk_has_no_attribution_header() {
        let mut c = chunk();
        c.is_bot = true;
        c.text = "I can help with that.".into();
        let msg = render_bot_chunk(&c);
        assert_eq!(msg.as_text(), Some("I can help with that."));
    }
}
