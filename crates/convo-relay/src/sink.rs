// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The surface adapter boundary. A concrete Discord (or other platform)
//! adapter implements this trait to turn relayed output into actual
//! messages; this crate never talks to a platform directly.

use async_trait::async_trait;
use convo_bus::MsgRef;
use serde_json::Value;

/// Driven by [`crate::OutputRelay`] once per request's output stream.
#[async_trait]
pub trait SurfaceSink: Send + Sync {
    /// Send (or append) assistant text for `request_id`/`session_id`. The
    /// sink decides whether this starts a new surface message or edits one
    /// already in flight for the request.
    async fn send_text(&self, request_id: &str, session_id: &str, text: &str) -> anyhow::Result<MsgRef>;

    /// Report a tool call in progress, best-effort (e.g. "typing" or a
    /// status line). Not subject to `NO_REPLY` suppression.
    async fn send_tool_call(
        &self,
        request_id: &str,
        session_id: &str,
        name: &str,
        args: &Value,
    ) -> anyhow::Result<()>;

    /// Send a binary attachment (e.g. an image the model produced).
    async fn send_binary(
        &self,
        request_id: &str,
        session_id: &str,
        mime: &str,
        data: &[u8],
    ) -> anyhow::Result<MsgRef>;
}
