// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! A minimal in-process topic bus implementing exactly the topics of the
//! external-interface table: `evt.adapter`, `evt.surface`, `evt.request`,
//! `cmd.request`, `cmd.surface`, and one dynamic `out.req.<id>` topic per
//! request. No persistence, no consumer groups, no redelivery — those are
//! the concrete event-bus implementation's job, not this crate's.
//!
//! Grounded on the broadcast-channel-per-topic pattern: each topic is a
//! `tokio::sync::broadcast` channel so every subscriber sees every message,
//! and a slow subscriber only loses messages to itself (`RecvError::Lagged`)
//! rather than blocking publishers.

pub mod events;

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

pub use events::*;

/// Channel capacities for each topic. Mirrors the purpose of
/// `EventBusCaps` in the reference bus pattern: small caps surface
/// backpressure quickly in tests, larger ones absorb production bursts.
#[derive(Debug, Clone, Copy)]
pub struct BusCaps {
    pub adapter: usize,
    pub surface: usize,
    pub request: usize,
    pub command: usize,
    pub surface_command: usize,
    pub output: usize,
}

impl Default for BusCaps {
    fn default() -> Self {
        Self { adapter: 256, surface: 256, request: 256, command: 256, surface_command: 64, output: 256 }
    }
}

/// The in-process bus. One instance is shared (behind an `Arc`) by the
/// router, runner, and relay.
pub struct Bus {
    adapter_tx: broadcast::Sender<AdapterMessageCreated>,
    surface_tx: broadcast::Sender<SurfaceOutputMessageCreated>,
    request_tx: broadcast::Sender<RequestTopicEvent>,
    command_tx: broadcast::Sender<RequestMessage>,
    surface_command_tx: broadcast::Sender<SurfaceOutputReanchor>,
    output_cap: usize,
    output: Mutex<HashMap<String, broadcast::Sender<OutputEvent>>>,
}

/// `evt.request` carries two event types (`request.lifecycle.changed` and
/// `request.reply`) on one topic; this enum is the in-process equivalent of
/// dispatching on event type within a single subscription.
#[derive(Debug, Clone)]
pub enum RequestTopicEvent {
    LifecycleChanged(RequestLifecycleChanged),
    Reply(RequestReply),
}

impl Bus {
    pub fn new(caps: BusCaps) -> Self {
        Self {
            adapter_tx: broadcast::channel(caps.adapter).0,
            surface_tx: broadcast::channel(caps.surface).0,
            request_tx: broadcast::channel(caps.request).0,
            command_tx: broadcast::channel(caps.command).0,
            surface_command_tx: broadcast::channel(caps.surface_command).0,
            output_cap: caps.output,
            output: Mutex::new(HashMap::new()),
        }
    }

    // ── evt.adapter ──────────────────────────────────────────────────────
    pub fn publish_adapter(&self, event: AdapterMessageCreated) {
        let _ = self.adapter_tx.send(event);
    }
    pub fn subscribe_adapter(&self) -> broadcast::Receiver<AdapterMessageCreated> {
        self.adapter_tx.subscribe()
    }

    // ── evt.surface ──────────────────────────────────────────────────────
    pub fn publish_surface(&self, event: SurfaceOutputMessageCreated) {
        let _ = self.surface_tx.send(event);
    }
    pub fn subscribe_surface(&self) -> broadcast::Receiver<SurfaceOutputMessageCreated> {
        self.surface_tx.subscribe()
    }

    // ── evt.request ──────────────────────────────────────────────────────
    pub fn publish_lifecycle(&self, event: RequestLifecycleChanged) {
        tracing::debug!(request_id = %event.request_id, state = ?event.state, "request lifecycle changed");
        let _ = self.request_tx.send(RequestTopicEvent::LifecycleChanged(event));
    }
    pub fn publish_request_reply(&self, event: RequestReply) {
        let _ = self.request_tx.send(RequestTopicEvent::Reply(event));
    }
    pub fn subscribe_request(&self) -> broadcast::Receiver<RequestTopicEvent> {
        self.request_tx.subscribe()
    }

    // ── cmd.request ──────────────────────────────────────────────────────
    pub fn publish_command(&self, cmd: RequestMessage) {
        tracing::debug!(request_id = %cmd.request_id, session_id = %cmd.session_id, queue = ?cmd.queue, "request command published");
        let _ = self.command_tx.send(cmd);
    }
    pub fn subscribe_command(&self) -> broadcast::Receiver<RequestMessage> {
        self.command_tx.subscribe()
    }

    // ── cmd.surface ──────────────────────────────────────────────────────
    pub fn publish_reanchor(&self, cmd: SurfaceOutputReanchor) {
        let _ = self.surface_command_tx.send(cmd);
    }
    pub fn subscribe_reanchor(&self) -> broadcast::Receiver<SurfaceOutputReanchor> {
        self.surface_command_tx.subscribe()
    }

    // ── out.req.<id> ─────────────────────────────────────────────────────
    fn output_sender(&self, request_id: &str) -> broadcast::Sender<OutputEvent> {
        let mut map = self.output.lock().expect("output topic map poisoned");
        map.entry(request_id.to_string())
            .or_insert_with(|| broadcast::channel(self.output_cap).0)
            .clone()
    }

    pub fn publish_output(&self, request_id: &str, event: OutputEvent) {
        let _ = self.output_sender(request_id).send(event);
    }

    pub fn subscribe_output(&self, request_id: &str) -> broadcast::Receiver<OutputEvent> {
        self.output_sender(request_id).subscribe()
    }

    /// Drop the output topic for a finished request so the map doesn't grow
    /// unboundedly across a long-running process.
    pub fn close_output(&self, request_id: &str) {
        self.output.lock().expect("output topic map poisoned").remove(request_id);
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(BusCaps::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_topic_round_trips() {
        let bus = Bus::default();
        let mut rx = bus.subscribe_command();
        bus.publish_command(RequestMessage {
            request_id: "discord:C:m1".into(),
            session_id: "discord:C".into(),
            request_client: "discord".into(),
            queue: QueueMode::Prompt,
            messages: vec![convo_model::Message::user("hi")],
            model_override: None,
            raw: serde_json::json!({}),
        });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.request_id, "discord:C:m1");
        assert!(matches!(got.queue, QueueMode::Prompt));
    }

    #[tokio::test]
    async fn output_topic_is_scoped_per_request_id() {
        let bus = Bus::default();
        let mut rx_a = bus.subscribe_output("req-a");
        let mut rx_b = bus.subscribe_output("req-b");
        bus.publish_output("req-a", OutputEvent::DeltaText("hello".into()));
        let got = rx_a.recv().await.unwrap();
        assert!(matches!(got, OutputEvent::DeltaText(t) if t == "hello"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn lifecycle_and_reply_share_the_request_topic() {
        let bus = Bus::default();
        let mut rx = bus.subscribe_request();
        bus.publish_request_reply(RequestReply {
            request_id: "r1".into(),
            session_id: "s1".into(),
            request_client: "discord".into(),
        });
        bus.publish_lifecycle(RequestLifecycleChanged {
            request_id: "r1".into(),
            session_id: "s1".into(),
            request_client: "discord".into(),
            state: LifecycleState::Running,
            detail: None,
            ts: 0,
        });
        assert!(matches!(rx.recv().await.unwrap(), RequestTopicEvent::Reply(_)));
        assert!(matches!(rx.recv().await.unwrap(), RequestTopicEvent::LifecycleChanged(_)));
    }

    #[test]
    fn closing_output_topic_removes_it_from_the_map() {
        let bus = Bus::default();
        let _rx = bus.subscribe_output("req-a");
        bus.close_output("req-a");
        assert!(bus.output.lock().unwrap().get("req-a").is_none());
    }
}
