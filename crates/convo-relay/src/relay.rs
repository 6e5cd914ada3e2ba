// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Surface-Output Relay: subscribes to each request's `out.req.<id>`
//! stream as soon as `request.reply` announces it, forwards output through
//! a [`SurfaceSink`], suppresses a bare `NO_REPLY` final answer, and aborts
//! a stream that goes silent for too long.

use std::sync::Arc;
use std::time::Duration;

use convo_bus::{
    Bus, MsgRef, OutputEvent, RequestReply, RequestTopicEvent, SurfaceOutputMessageCreated,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::sink::SurfaceSink;

const NO_REPLY_SENTINEL: &str = "NO_REPLY";
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// Tracks whether the text accumulated so far for the current assistant
/// message could still turn out to be the bare `NO_REPLY` sentinel.
///
/// Buffering stops the moment the accumulated text can no longer match the
/// sentinel (longer than it, or diverges character-for-character), so a
/// real answer starts forwarding without waiting for the full response.
enum SentinelState {
    Buffering(String),
    PassThrough,
}

impl SentinelState {
    fn new() -> Self {
        Self::Buffering(String::new())
    }

    /// Feed a delta in. Returns text that should be forwarded now, if any.
    fn push_delta(&mut self, delta: &str) -> Option<String> {
        match self {
            SentinelState::PassThrough => Some(delta.to_string()),
            SentinelState::Buffering(buf) => {
                buf.push_str(delta);
                if NO_REPLY_SENTINEL.starts_with(buf.trim_start()) {
                    None
                } else {
                    let flushed = std::mem::take(buf);
                    *self = SentinelState::PassThrough;
                    Some(flushed)
                }
            }
        }
    }

    /// The assistant message ended with `final_text`. Returns the text that
    /// should still be forwarded, or `None` if it was the sentinel and must
    /// be suppressed.
    fn finish(&mut self, final_text: &str) -> Option<String> {
        let still_buffering = matches!(self, SentinelState::Buffering(_));
        *self = SentinelState::new();
        if still_buffering && final_text.trim() == NO_REPLY_SENTINEL {
            None
        } else if still_buffering {
            Some(final_text.to_string())
        } else {
            // Already passed through as deltas; nothing left to flush.
            None
        }
    }
}

/// Subscribes to `evt.request`'s `request.reply` signal and, for each
/// request it announces, drains that request's `out.req.<id>` stream.
pub struct OutputRelay {
    bus: Arc<Bus>,
    sink: Arc<dyn SurfaceSink>,
    idle_timeout: Duration,
}

impl OutputRelay {
    pub fn new(bus: Arc<Bus>, sink: Arc<dyn SurfaceSink>) -> Self {
        Self { bus, sink, idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS) }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Runs until the `evt.request` topic closes. Spawns one task per
    /// request so a slow or stalled request never blocks another.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.bus.subscribe_request();
        loop {
            match rx.recv().await {
                Ok(RequestTopicEvent::Reply(reply)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.drain_request(reply).await });
                }
                Ok(RequestTopicEvent::LifecycleChanged(_)) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "output relay lagged on evt.request");
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    async fn drain_request(&self, reply: RequestReply) {
        let RequestReply { request_id, session_id, .. } = reply;
        let mut rx = self.bus.subscribe_output(&request_id);
        let mut sentinel = SentinelState::new();

        loop {
            let next = tokio::time::timeout(self.idle_timeout, rx.recv()).await;
            let event = match next {
                Ok(Ok(event)) => event,
                Ok(Err(RecvError::Lagged(n))) => {
                    warn!(request_id = %request_id, skipped = n, "output relay lagged");
                    continue;
                }
                Ok(Err(RecvError::Closed)) => return,
                Err(_) => {
                    warn!(request_id = %request_id, timeout_ms = %self.idle_timeout.as_millis(), "output relay idle timeout, aborting stream");
                    return;
                }
            };

            match event {
                OutputEvent::DeltaText(delta) => {
                    if let Some(text) = sentinel.push_delta(&delta) {
                        self.forward_text(&request_id, &session_id, &text).await;
                    }
                }
                OutputEvent::ResponseText(text) => {
                    if let Some(text) = sentinel.finish(&text) {
                        self.forward_text(&request_id, &session_id, &text).await;
                    }
                }
                OutputEvent::ToolCall { name, args } => {
                    if let Err(err) = self.sink.send_tool_call(&request_id, &session_id, &name, &args).await {
                        warn!(request_id = %request_id, %err, "surface sink rejected tool call status");
                    }
                }
                OutputEvent::ResponseBinary { mime, data } => match self
                    .sink
                    .send_binary(&request_id, &session_id, &mime, &data)
                    .await
                {
                    Ok(msg_ref) => self.announce(&request_id, &session_id, msg_ref),
                    Err(err) => warn!(request_id = %request_id, %err, "surface sink rejected binary output"),
                },
            }
        }
    }

    async fn forward_text(&self, request_id: &str, session_id: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.sink.send_text(request_id, session_id, text).await {
            Ok(msg_ref) => self.announce(request_id, session_id, msg_ref),
            Err(err) => warn!(request_id = %request_id, %err, "surface sink rejected text output"),
        }
    }

    fn announce(&self, request_id: &str, session_id: &str, msg_ref: MsgRef) {
        debug!(request_id = %request_id, message_id = %msg_ref.message_id, "surface output message created");
        self.bus.publish_surface(SurfaceOutputMessageCreated {
            request_id: request_id.to_string(),
            session_id: session_id.to_string(),
            msg_ref,
        });
    }
}
