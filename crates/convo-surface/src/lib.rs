// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Narrows the untyped `raw` blob an adapter event carries (duck-typed at
//! the bus boundary) into a concrete, optional-fields struct per platform.
//! Only `discord` exists today; a second platform adds a variant, not a
//! rewrite of every consumer's field access.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A `(messageId, channelId)` cross-reference, e.g. the message a reply
/// points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub message_id: String,
    pub channel_id: String,
}

/// A single Discord attachment, as narrowed from the adapter's raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscordAttachment {
    pub url: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
}

/// The concrete shape of `raw.discord` per the external-interface table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordRaw {
    #[serde(default)]
    pub is_dm_based: bool,
    #[serde(default)]
    pub mentions_bot: bool,
    #[serde(default)]
    pub reply_to_bot: bool,
    pub reply_to_message_id: Option<String>,
    pub parent_channel_id: Option<String>,
    pub session_model_override: Option<String>,
    pub bot_user_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<DiscordAttachment>,
    /// `false` marks platform/system notifications, excluded from model
    /// context but kept in raw listings.
    #[serde(default = "default_true")]
    pub is_chat: bool,
}

fn default_true() -> bool {
    true
}

/// A tagged variant per platform, narrowing the duck-typed `raw` blob.
/// Only `Discord` is populated today; future platforms add variants here
/// rather than widening every consumer's ad-hoc field access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEnvelope {
    pub discord: Option<DiscordRaw>,
    pub reference: Option<Reference>,
}

#[derive(Debug, thiserror::Error)]
pub enum RawEnvelopeError {
    #[error("raw envelope is not a JSON object: {0}")]
    NotAnObject(Value),
    #[error("failed to parse raw envelope: {0}")]
    Parse(#[from] serde_json::Error),
}

impl RawEnvelope {
    /// Parse an adapter event's `raw` JSON blob into a concrete envelope.
    /// Unknown/missing fields default rather than error — the bus payload
    /// is duck-typed by design; this is the validator that narrows it.
    pub fn parse(raw: &Value) -> Result<Self, RawEnvelopeError> {
        if !raw.is_object() && !raw.is_null() {
            return Err(RawEnvelopeError::NotAnObject(raw.clone()));
        }
        if raw.is_null() {
            return Ok(Self { discord: None, reference: None });
        }
        Ok(serde_json::from_value(raw.clone())?)
    }

    pub fn discord(&self) -> Option<&DiscordRaw> {
        self.discord.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_discord_mention_envelope() {
        let raw = serde_json::json!({
            "discord": {"mentionsBot": true, "isChat": true},
        });
        let env = RawEnvelope::parse(&raw).unwrap();
        assert!(env.discord().unwrap().mentions_bot);
        assert!(env.reference.is_none());
    }

    #[test]
    fn missing_fields_default_conservatively() {
        let raw = serde_json::json!({ "discord": {} });
        let env = RawEnvelope::parse(&raw).unwrap();
        let d = env.discord().unwrap();
        assert!(!d.mentions_bot);
        assert!(!d.is_dm_based);
        assert!(d.is_chat, "isChat must default to true when absent");
        assert!(d.attachments.is_empty());
    }

    #[test]
    fn null_raw_parses_to_empty_envelope() {
        let env = RawEnvelope::parse(&Value::Null).unwrap();
        assert!(env.discord.is_none());
    }

    #[test]
    fn non_object_raw_is_rejected() {
        let raw = serde_json::json!("not an object");
        assert!(RawEnvelope::parse(&raw).is_err());
    }

    #[test]
    fn reference_round_trips() {
        let raw = serde_json::json!({
            "reference": {"messageId": "m1", "channelId": "c1"}
        });
        let env = RawEnvelope::parse(&raw).unwrap();
        let r = env.reference.unwrap();
        assert_eq!(r.message_id, "m1");
        assert_eq!(r.channel_id, "c1");
    }
}
