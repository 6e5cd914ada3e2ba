// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Attachment categorization and bounded download, with a per-composition
//! URL-keyed dedup cache and a total-download budget.

use std::collections::HashMap;

use async_trait::async_trait;
use convo_model::ContentPart;

use crate::types::SourceAttachment;

pub const MAX_ATTACHMENT_BYTES: u64 = 25 * 1024 * 1024;
pub const MAX_TOTAL_ATTACHMENT_BYTES: u64 = 50 * 1024 * 1024;
pub const TEXT_TRUNCATE_BYTES: usize = 512 * 1024;
pub const TEXT_TRUNCATE_CHARS: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentCategory {
    Image,
    Pdf,
    TextExtractable,
    Unknown,
}

pub fn categorize(content_type: Option<&str>, filename: &str) -> AttachmentCategory {
    let ct = content_type.unwrap_or("").to_ascii_lowercase();
    if ct.starts_with("image/") {
        return AttachmentCategory::Image;
    }
    if ct == "application/pdf" {
        return AttachmentCategory::Pdf;
    }
    if is_text_extractable(&ct, filename) {
        return AttachmentCategory::TextExtractable;
    }
    AttachmentCategory::Unknown
}

fn is_text_extractable(ct: &str, filename: &str) -> bool {
    ct.starts_with("text/")
        || ct == "application/json"
        || ct.ends_with("+json")
        || ct.contains("javascript")
        || ct.contains("xml")
        || ct.contains("yaml")
        || filename.ends_with(".md")
        || filename.ends_with(".txt")
}

/// Downloads attachment bytes from their Discord CDN URL. The concrete HTTP
/// client and CDN access live with the adapter, out of this crate's scope.
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

/// Tracks the 50 MiB total-download budget for one composition pass.
#[derive(Debug, Default)]
pub struct AttachmentBudget {
    consumed: u64,
}

impl AttachmentBudget {
    pub fn remaining(&self) -> u64 {
        MAX_TOTAL_ATTACHMENT_BYTES.saturating_sub(self.consumed)
    }

    fn consume(&mut self, bytes: u64) {
        self.consumed = self.consumed.saturating_add(bytes);
    }
}

fn looks_binary(bytes: &[u8]) -> bool {
    if bytes.contains(&0) {
        return true;
    }
    let text = String::from_utf8_lossy(bytes);
    let total = text.chars().count().max(1);
    let replacement = text.chars().filter(|c| *c == '\u{FFFD}').count();
    (replacement as f64 / total as f64) > 0.05
}

fn truncate_text(text: &str) -> (String, bool) {
    let byte_capped = if text.len() > TEXT_TRUNCATE_BYTES {
        // Find a char boundary at or before the byte cap.
        let mut end = TEXT_TRUNCATE_BYTES;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    } else {
        text
    };
    if byte_capped.chars().count() > TEXT_TRUNCATE_CHARS {
        let truncated: String = byte_capped.chars().take(TEXT_TRUNCATE_CHARS).collect();
        (truncated, true)
    } else {
        (byte_capped.to_string(), byte_capped.len() < text.len())
    }
}

/// Resolve one attachment into a model content part, downloading and
/// decoding text-extractable attachments (bounded by per-attachment and
/// total budgets), falling back to a URL-only header otherwise.
pub async fn resolve_attachment(
    att: &SourceAttachment,
    fetcher: &dyn AttachmentFetcher,
    budget: &mut AttachmentBudget,
    cache: &mut HashMap<String, ContentPart>,
) -> ContentPart {
    if let Some(cached) = cache.get(&att.url) {
        return cached.clone();
    }
    let category = categorize(att.content_type.as_deref(), &att.filename);
    let part = match category {
        AttachmentCategory::Image => ContentPart::image(att.url.clone()),
        AttachmentCategory::Pdf => {
            ContentPart::text(format!("[discord_attachment url={} filename={} type=pdf]", att.url, att.filename))
        }
        AttachmentCategory::TextExtractable => {
            if att.size_bytes > MAX_ATTACHMENT_BYTES || att.size_bytes > budget.remaining() {
                ContentPart::text(format!(
                    "[discord_attachment url={} filename={} type=text (url-only, over budget)]",
                    att.url, att.filename
                ))
            } else {
                match fetcher.fetch(&att.url).await {
                    Ok(bytes) => {
                        budget.consume(bytes.len() as u64);
                        if looks_binary(&bytes) {
                            ContentPart::text(format!(
                                "[discord_attachment url={} filename={} type=text (binary content detected)]",
                                att.url, att.filename
                            ))
                        } else {
                            let decoded = String::from_utf8_lossy(&bytes).into_owned();
                            let (body, truncated) = truncate_text(&decoded);
                            let marker = if truncated { " (truncated)" } else { "" };
                            ContentPart::text(format!(
                                "[discord_attachment url={} filename={}{marker}]\n{body}",
                                att.url, att.filename
                            ))
                        }
                    }
                    Err(_) => ContentPart::text(format!(
                        "[discord_attachment url={} filename={} type=text (fetch failed)]",
                        att.url, att.filename
                    )),
                }
            }
        }
        AttachmentCategory::Unknown => {
            ContentPart::text(format!("[discord_attachment url={} filename={}]", att.url, att.filename))
        }
    };
    cache.insert(att.url.clone(), part.clone());
    part
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticFetcher(Vec<u8>);

    #[async_trait]
    impl AttachmentFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str) -> anyhow::Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    fn att(size: u64, ct: &str) -> SourceAttachment {
        SourceAttachment {
            url: "https://cdn.discordapp.com/a.txt".into(),
            filename: "a.txt".into(),
            content_type: Some(ct.into()),
            size_bytes: size,
        }
    }

    #[test]
    fn categorizes_by_content_type() {
        assert_eq!(categorize(Some("image/png"), "x.png"), AttachmentCategory::Image);
        assert_eq!(categorize(Some("application/pdf"), "x.pdf"), AttachmentCategory::Pdf);
        assert_eq!(categorize(Some("text/plain"), "x.txt"), AttachmentCategory::TextExtractable);
        assert_eq!(categorize(Some("application/octet-stream"), "x.bin"), AttachmentCategory::Unknown);
    }

    #[tokio::test]
    async fn attachment_at_exactly_25mib_is_accepted() {
        let a = att(MAX_ATTACHMENT_BYTES, "text/plain");
        let fetcher = StaticFetcher(b"hello".to_vec());
        let mut budget = AttachmentBudget::default();
        let mut cache = HashMap::new();
        let part = resolve_attachment(&a, &fetcher, &mut budget, &mut cache).await;
        match part {
            ContentPart::Text { text } => assert!(text.contains("hello")),
            _ => panic!("expected text part"),
        }
    }

    #[tokio::test]
    async fn attachment_over_25mib_falls_back_to_url_only() {
        let a = att(MAX_ATTACHMENT_BYTES + 1, "text/plain");
        let fetcher = StaticFetcher(b"hello".to_vec());
        let mut budget = AttachmentBudget::default();
        let mut cache = HashMap::new();
        let part = resolve_attachment(&a, &fetcher, &mut budget, &mut cache).await;
        match part {
            ContentPart::Text { text } => assert!(text.contains("url-only")),
            _ => panic!("expected text part"),
        }
    }

    #[tokio::test]
    async fn binary_content_is_detected_and_not_inlined() {
        let a = att(10, "text/plain");
        let fetcher = StaticFetcher(vec![0u8, 1, 2, 3, 0, 0]);
        let mut budget = AttachmentBudget::default();
        let mut cache = HashMap::new();
        let part = resolve_attachment(&a, &fetcher, &mut budget, &mut cache).await;
        match part {
            ContentPart::Text { text } => assert!(text.contains("binary content detected")),
            _ => panic!("expected text part"),
        }
    }

    #[tokio::test]
    async fn dedup_cache_avoids_refetch() {
        let a = att(10, "text/plain");
        let fetcher = StaticFetcher(b"hello".to_vec());
        let mut budget = AttachmentBudget::default();
        let mut cache = HashMap::new();
        let first = resolve_attachment(&a, &fetcher, &mut budget, &mut cache).await;
        let consumed_after_first = MAX_TOTAL_ATTACHMENT_BYTES - budget.remaining();
        let second = resolve_attachment(&a, &fetcher, &mut budget, &mut cache).await;
        assert_eq!(first, second);
        assert_eq!(MAX_TOTAL_ATTACHMENT_BYTES - budget.remaining(), consumed_after_first, "second call must not consume budget again");
    }
}
