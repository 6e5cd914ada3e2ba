// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Event and command payloads carried on the bus topics of the external
//! interface table: `evt.adapter`, `evt.surface`, `evt.request`,
//! `cmd.request`, `cmd.surface`, `out.req.<id>`.

use convo_model::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `evt.adapter` / `adapter.message.created`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterMessageCreated {
    pub platform: String,
    pub channel_id: String,
    pub message_id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub text: String,
    pub ts: i64,
    /// Duck-typed per-platform metadata; narrowed by `convo_surface::RawEnvelope`.
    pub raw: Value,
}

/// A `(platform, channelId, messageId)` reference, used wherever the spec
/// refers to "msgRef".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgRef {
    pub platform: String,
    pub channel_id: String,
    pub message_id: String,
}

/// `evt.surface` / `surface.output.message.created`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceOutputMessageCreated {
    pub request_id: String,
    pub session_id: String,
    pub msg_ref: MsgRef,
}

/// `state` field of `request.lifecycle.changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Queued,
    Running,
    Resolved,
    Failed,
    Cancelled,
}

/// `evt.request` / `request.lifecycle.changed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLifecycleChanged {
    pub request_id: String,
    pub session_id: String,
    pub request_client: String,
    pub state: LifecycleState,
    pub detail: Option<String>,
    pub ts: i64,
}

/// `evt.request` / `request.reply` — signals the Output Relay to subscribe
/// to `out.req.<id>` for this request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestReply {
    pub request_id: String,
    pub session_id: String,
    pub request_client: String,
}

/// `queue` field of `cmd.request.message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueMode {
    Prompt,
    FollowUp,
    Steer,
    Interrupt,
}

/// `cmd.request` / `request.message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub request_id: String,
    pub session_id: String,
    pub request_client: String,
    pub queue: QueueMode,
    pub messages: Vec<Message>,
    pub model_override: Option<String>,
    pub raw: Value,
}

/// `mode` field of `surface.output.reanchor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReanchorMode {
    Steer,
    Interrupt,
}

/// `cmd.surface` / `surface.output.reanchor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceOutputReanchor {
    pub request_id: String,
    pub session_id: String,
    pub inherit_reply_to: bool,
    pub reply_to: Option<MsgRef>,
    pub mode: ReanchorMode,
}

/// `out.req.<id>` events. One broadcast topic is created per request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutputEvent {
    DeltaText(String),
    ToolCall { name: String, args: Value },
    ResponseText(String),
    ResponseBinary { mime: String, data: Vec<u8> },
}
