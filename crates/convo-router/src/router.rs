// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Orchestrates the pieces in this crate into the event-driven state
//! machine of the request router: subscribes `evt.adapter`, tracks active
//! requests from `evt.surface`/`evt.request`, classifies and decides each
//! inbound message, and publishes `cmd.request`/`cmd.surface`.

use std::collections::HashMap;
use std::sync::Arc;

use convo_bus::{
    AdapterMessageCreated, Bus, LifecycleState, MsgRef, QueueMode, ReanchorMode,
    RequestMessage, RequestTopicEvent, SurfaceOutputReanchor,
};
use convo_compose::{
    compose_from_mention_thread, compose_from_reply_chain, compose_recent_channel_messages,
    AttachmentFetcher, MessageSource, ReplyChainMessage, SourceAttachment,
};
use convo_config::ConfigWatcher;
use convo_model::Message;
use convo_surface::{DiscordRaw, RawEnvelope};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::debounce::{DebounceBuffer, DebounceManager};
use crate::decision::{classify_trigger, decide, RouteAction, TriggerKind};
use crate::directives::{classify_steer_or_interrupt, extract_model_override, resolve_model_override};
use crate::gate::{decide_with_gate, Gate, GateContext};
use crate::state::{ActiveSessionState, SessionTable};

const REPLY_CHAIN_MAX_DEPTH: usize = 25;
const MENTION_LOOKBACK_LIMIT: usize = 50;
const ACTIVE_BURST_LIMIT: usize = 50;

type SuppressHook = Box<dyn Fn(&AdapterMessageCreated) -> bool + Send + Sync>;

/// The Request Router. Construct with [`Router::new`], then spawn
/// [`Router::run`] as a background task fed by the returned debounce
/// receiver.
pub struct Router {
    bus: Arc<Bus>,
    config: Mutex<ConfigWatcher>,
    sessions: SessionTable,
    debounce: DebounceManager,
    gate: Arc<dyn Gate>,
    source: Arc<dyn MessageSource>,
    fetcher: Arc<dyn AttachmentFetcher>,
    aliases: HashMap<String, String>,
    suppress: Option<SuppressHook>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<Bus>,
        config: ConfigWatcher,
        gate: Arc<dyn Gate>,
        source: Arc<dyn MessageSource>,
        fetcher: Arc<dyn AttachmentFetcher>,
        aliases: HashMap<String, String>,
        suppress: Option<SuppressHook>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DebounceBuffer>) {
        let (debounce, debounce_rx) = DebounceManager::new();
        let router = Arc::new(Self {
            bus,
            config: Mutex::new(config),
            sessions: SessionTable::new(),
            debounce,
            gate,
            source,
            fetcher,
            aliases,
            suppress,
        });
        (router, debounce_rx)
    }

    /// Drive the router until the bus's adapter topic (or the debounce
    /// channel) closes. Intended to be spawned as a background task.
    pub async fn run(self: Arc<Self>, mut debounce_rx: mpsc::UnboundedReceiver<DebounceBuffer>) {
        use tokio::sync::broadcast::error::RecvError;

        let mut adapter_rx = self.bus.subscribe_adapter();
        let mut surface_rx = self.bus.subscribe_surface();
        let mut request_rx = self.bus.subscribe_request();

        loop {
            tokio::select! {
                evt = adapter_rx.recv() => match evt {
                    Ok(evt) => self.handle_adapter(evt).await,
                    Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "router lagged on evt.adapter"),
                    Err(RecvError::Closed) => break,
                },
                surf = surface_rx.recv() => match surf {
                    Ok(s) => self.sessions.record_active_output(&s.session_id, &s.request_id, &s.msg_ref.message_id),
                    Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "router lagged on evt.surface"),
                    Err(RecvError::Closed) => break,
                },
                req = request_rx.recv() => match req {
                    Ok(RequestTopicEvent::LifecycleChanged(ev)) => {
                        if matches!(ev.state, LifecycleState::Resolved | LifecycleState::Failed | LifecycleState::Cancelled) {
                            self.sessions.finish_request(&ev.session_id);
                        }
                    }
                    Ok(RequestTopicEvent::Reply(_)) => {}
                    Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "router lagged on evt.request"),
                    Err(RecvError::Closed) => break,
                },
                flushed = debounce_rx.recv() => match flushed {
                    Some(buffer) => self.handle_flush(buffer).await,
                    None => break,
                },
            }
        }
    }

    async fn handle_adapter(&self, evt: AdapterMessageCreated) {
        let envelope = match RawEnvelope::parse(&evt.raw) {
            Ok(e) => e,
            Err(err) => {
                tracing::error!(error = %err, message_id = %evt.message_id, "malformed adapter envelope, dropping");
                return;
            }
        };
        let Some(discord) = envelope.discord().cloned() else {
            tracing::warn!(message_id = %evt.message_id, "adapter event carries no discord raw fields, skipping");
            return;
        };
        if !discord.is_chat {
            return;
        }
        if let Some(suppress) = &self.suppress {
            if suppress(&evt) {
                return;
            }
        }

        let session_id = evt.channel_id.clone();
        // The active-batch gate runs on debounce flush (`handle_flush`), not
        // on every raw message, so its enabled-ness isn't needed here.
        let (mode, debounce_ms, static_model) = {
            let mut watcher = self.config.lock().await;
            let cfg = watcher.reload_if_needed();
            let router_cfg = cfg.surface.router.clone();
            let session_override = router_cfg.session_modes.get(&session_id).cloned().unwrap_or_default();
            (
                session_override.mode.unwrap_or(router_cfg.default_mode),
                router_cfg.active_debounce_ms,
                session_override.model,
            )
        };

        let active = self.sessions.active_request(&session_id);
        let has_active = active.is_some();
        let active_output_ids =
            active.as_ref().map(|a| a.active_output_message_ids.clone()).unwrap_or_default();

        let trigger = classify_trigger(discord.mentions_bot, discord.reply_to_message_id.as_deref(), &active_output_ids);
        let action = decide(mode, discord.is_dm_based, trigger, has_active);

        match action {
            RouteAction::Skip => {}
            RouteAction::Buffer => {
                self.debounce
                    .push(&session_id, &session_id, discord.parent_channel_id.clone(), evt, debounce_ms)
                    .await;
            }
            RouteAction::StartPrompt => {
                self.start_prompt(&session_id, &evt, &discord, trigger, static_model.as_deref()).await;
            }
            RouteAction::QueuePrompt | RouteAction::QueuePromptForked => {
                self.queue_behind(&session_id, &evt, &discord, active.as_ref(), static_model.as_deref()).await;
            }
            RouteAction::FollowUp => {
                if let Some(active) = &active {
                    self.publish_follow_up(&session_id, active, &evt).await;
                }
            }
            RouteAction::Steer { reanchor_inherit_reply_to } => {
                if let Some(active) = &active {
                    self.publish_steer(&session_id, active, &evt, reanchor_inherit_reply_to).await;
                }
            }
            RouteAction::SteerOrInterrupt { reanchor_to_this_message } => {
                if let Some(active) = &active {
                    self.publish_steer_or_interrupt(&session_id, active, &evt, reanchor_to_this_message, Vec::new())
                        .await;
                }
            }
            RouteAction::EnqueuePendingMentionReplyBatch => {
                self.sessions.push_pending_batch(&session_id, evt);
            }
            RouteAction::FlushPendingBatchThenSteerOrInterrupt => {
                if let Some(active) = &active {
                    let batch = self.sessions.take_pending_batch(&session_id);
                    self.publish_steer_or_interrupt(&session_id, active, &evt, true, batch).await;
                }
            }
        }
    }

    async fn handle_flush(&self, buffer: DebounceBuffer) {
        if buffer.messages.is_empty() {
            return;
        }
        let (gate_enabled, timeout_ms, static_model) = {
            let mut watcher = self.config.lock().await;
            let cfg = watcher.reload_if_needed();
            let router_cfg = cfg.surface.router.clone();
            let session_override =
                router_cfg.session_modes.get(&buffer.session_id).cloned().unwrap_or_default();
            (
                session_override.gate.unwrap_or(router_cfg.active_gate.enabled),
                router_cfg.active_gate.timeout_ms,
                session_override.model,
            )
        };

        let batch_text = buffer.messages.iter().map(|m| m.text.as_str()).collect::<Vec<_>>().join("\n\n");

        if gate_enabled {
            let verdict = decide_with_gate(self.gate.as_ref(), GateContext::ActiveBatch, &batch_text, timeout_ms).await;
            if !verdict.forward {
                tracing::debug!(session_id = %buffer.session_id, reason = ?verdict.reason, "active batch gated out");
                return;
            }
        }

        let last = buffer.messages.last().expect("checked non-empty above");
        let channel_id = buffer.parent_channel_id.clone().unwrap_or_else(|| last.channel_id.clone());
        let composed = compose_recent_channel_messages(
            self.source.as_ref(),
            self.fetcher.as_ref(),
            &self.aliases,
            &channel_id,
            last.ts,
            ACTIVE_BURST_LIMIT,
        )
        .await;
        let composed = match composed {
            Ok(c) => c,
            Err(err) => {
                tracing::error!(error = %err, session_id = %buffer.session_id, "active-batch composition failed");
                return;
            }
        };

        let request_id = format!("req:{}", Uuid::new_v4());
        self.sessions.start_request(&buffer.session_id, &request_id);
        self.bus.publish_command(RequestMessage {
            request_id,
            session_id: buffer.session_id,
            request_client: "discord".into(),
            queue: QueueMode::Prompt,
            messages: composed.messages,
            model_override: static_model,
            raw: serde_json::json!({ "triggerType": "active" }),
        });
    }

    async fn start_prompt(
        &self,
        session_id: &str,
        evt: &AdapterMessageCreated,
        discord: &DiscordRaw,
        trigger: TriggerKind,
        static_model: Option<&str>,
    ) {
        let anchor = to_reply_chain_message(evt, discord);
        let composed = match trigger {
            TriggerKind::MentionNotReply | TriggerKind::PlainMessage => {
                compose_from_mention_thread(
                    self.source.as_ref(),
                    self.fetcher.as_ref(),
                    &self.aliases,
                    &evt.channel_id,
                    anchor,
                    MENTION_LOOKBACK_LIMIT,
                )
                .await
            }
            TriggerKind::ReplyToActiveOutputNoMention
            | TriggerKind::ReplyToActiveOutputAndMention
            | TriggerKind::ReplyToNonActiveBotMessage => {
                compose_from_reply_chain(
                    self.source.as_ref(),
                    self.fetcher.as_ref(),
                    &self.aliases,
                    &evt.channel_id,
                    anchor,
                    REPLY_CHAIN_MAX_DEPTH,
                )
                .await
            }
        };
        let composed = match composed {
            Ok(c) => c,
            Err(err) => {
                tracing::error!(error = %err, message_id = %evt.message_id, "prompt composition failed");
                return;
            }
        };

        let (per_request_override, _) = extract_model_override(&evt.text);
        let model_override = resolve_model_override(
            per_request_override.as_deref(),
            discord.session_model_override.as_deref(),
            static_model,
        );

        let request_id = format!("discord:{}:{}", session_id, evt.message_id);
        self.sessions.start_request(session_id, &request_id);
        self.bus.publish_command(RequestMessage {
            request_id,
            session_id: session_id.to_string(),
            request_client: "discord".into(),
            queue: QueueMode::Prompt,
            messages: composed.messages,
            model_override,
            raw: serde_json::json!({ "triggerType": trigger_type_label(trigger) }),
        });
    }

    /// `QueuePrompt`/`QueuePromptForked`: a second trigger for a session
    /// that already has a request running. Since at most one agent runs
    /// per session, this is realized as a follow-up onto the running
    /// turn's agent (the Session-Queue Runner's existing coercion), kept
    /// under its own request id so its `queued`→`resolved` lifecycle is
    /// still independently observable.
    async fn queue_behind(
        &self,
        session_id: &str,
        evt: &AdapterMessageCreated,
        discord: &DiscordRaw,
        active: Option<&ActiveSessionState>,
        static_model: Option<&str>,
    ) {
        let active_request_id = active.map(|a| a.request_id.as_str()).unwrap_or("unknown");
        let request_id = format!("queued:{active_request_id}");
        let (per_request_override, text) = extract_model_override(&evt.text);
        let model_override = resolve_model_override(
            per_request_override.as_deref(),
            discord.session_model_override.as_deref(),
            static_model,
        );
        self.bus.publish_command(RequestMessage {
            request_id,
            session_id: session_id.to_string(),
            request_client: "discord".into(),
            queue: QueueMode::Prompt,
            messages: vec![Message::user(text)],
            model_override,
            raw: evt.raw.clone(),
        });
    }

    async fn publish_follow_up(&self, session_id: &str, active: &ActiveSessionState, evt: &AdapterMessageCreated) {
        self.bus.publish_command(RequestMessage {
            request_id: active.request_id.clone(),
            session_id: session_id.to_string(),
            request_client: "discord".into(),
            queue: QueueMode::FollowUp,
            messages: vec![Message::user(evt.text.clone())],
            model_override: None,
            raw: evt.raw.clone(),
        });
    }

    async fn publish_steer(
        &self,
        session_id: &str,
        active: &ActiveSessionState,
        evt: &AdapterMessageCreated,
        inherit_reply_to: bool,
    ) {
        let (model_override, text) = extract_model_override(&evt.text);
        self.bus.publish_reanchor(SurfaceOutputReanchor {
            request_id: active.request_id.clone(),
            session_id: session_id.to_string(),
            inherit_reply_to,
            reply_to: if inherit_reply_to { None } else { Some(msg_ref(evt)) },
            mode: ReanchorMode::Steer,
        });
        self.bus.publish_command(RequestMessage {
            request_id: format!("discord:{session_id}:{}", evt.message_id),
            session_id: session_id.to_string(),
            request_client: "discord".into(),
            queue: QueueMode::Steer,
            messages: vec![Message::user(text)],
            model_override,
            raw: evt.raw.clone(),
        });
    }

    async fn publish_steer_or_interrupt(
        &self,
        session_id: &str,
        active: &ActiveSessionState,
        evt: &AdapterMessageCreated,
        reanchor_to_this_message: bool,
        prior_batch: Vec<AdapterMessageCreated>,
    ) {
        let (model_override, after_model) = extract_model_override(&evt.text);
        let (kind, text) = classify_steer_or_interrupt(&after_model);

        let mut combined = String::new();
        for m in &prior_batch {
            combined.push_str(&m.text);
            combined.push_str("\n\n");
        }
        combined.push_str(&text);

        let mode = match kind {
            crate::directives::SteerOrInterrupt::Steer => ReanchorMode::Steer,
            crate::directives::SteerOrInterrupt::Interrupt => ReanchorMode::Interrupt,
        };
        let queue = match kind {
            crate::directives::SteerOrInterrupt::Steer => QueueMode::Steer,
            crate::directives::SteerOrInterrupt::Interrupt => QueueMode::Interrupt,
        };

        self.bus.publish_reanchor(SurfaceOutputReanchor {
            request_id: active.request_id.clone(),
            session_id: session_id.to_string(),
            inherit_reply_to: !reanchor_to_this_message,
            reply_to: if reanchor_to_this_message { Some(msg_ref(evt)) } else { None },
            mode,
        });
        self.bus.publish_command(RequestMessage {
            request_id: format!("discord:{session_id}:{}", evt.message_id),
            session_id: session_id.to_string(),
            request_client: "discord".into(),
            queue,
            messages: vec![Message::user(combined)],
            model_override,
            raw: evt.raw.clone(),
        });
    }
}

fn msg_ref(evt: &AdapterMessageCreated) -> MsgRef {
    MsgRef {
        platform: evt.platform.clone(),
        channel_id: evt.channel_id.clone(),
        message_id: evt.message_id.clone(),
    }
}

fn trigger_type_label(trigger: TriggerKind) -> &'static str {
    match trigger {
        TriggerKind::PlainMessage => "active",
        TriggerKind::MentionNotReply => "mention",
        TriggerKind::ReplyToActiveOutputNoMention
        | TriggerKind::ReplyToActiveOutputAndMention
        | TriggerKind::ReplyToNonActiveBotMessage => "reply",
    }
}

fn to_reply_chain_message(evt: &AdapterMessageCreated, discord: &DiscordRaw) -> ReplyChainMessage {
    ReplyChainMessage {
        message_id: evt.message_id.clone(),
        author_id: evt.user_id.clone(),
        author_name: evt.user_name.clone().unwrap_or_else(|| evt.user_id.clone()),
        is_bot: false,
        ts: evt.ts,
        text: evt.text.clone(),
        attachments: discord
            .attachments
            .iter()
            .map(|a| SourceAttachment {
                url: a.url.clone(),
                filename: a.filename.clone(),
                content_type: a.content_type.clone(),
                size_bytes: a.size_bytes,
            })
            .collect(),
        raw: evt.raw.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use convo_bus::BusCaps;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EmptySource;
    #[async_trait]
    impl MessageSource for EmptySource {
        async fn fetch_reply_chain(&self, _c: &str, _m: &str, _d: usize) -> anyhow::Result<Vec<ReplyChainMessage>> {
            Ok(Vec::new())
        }
        async fn fetch_recent_channel_messages(
            &self,
            _c: &str,
            _l: usize,
            _b: Option<i64>,
        ) -> anyhow::Result<Vec<ReplyChainMessage>> {
            Ok(Vec::new())
        }
    }

    struct NoopFetcher;
    #[async_trait]
    impl AttachmentFetcher for NoopFetcher {
        async fn fetch(&self, _url: &str) -> anyhow::Result<Vec<u8>> {
            anyhow::bail!("not used in these tests")
        }
    }

    struct AlwaysForwardGate;
    #[async_trait]
    impl Gate for AlwaysForwardGate {
        async fn check(&self, _c: GateContext, _t: &str) -> anyhow::Result<crate::gate::GateVerdict> {
            Ok(crate::gate::GateVerdict { forward: true, reason: None })
        }
    }

    fn adapter_event(message_id: &str, text: &str, mentions_bot: bool, reply_to: Option<&str>) -> AdapterMessageCreated {
        AdapterMessageCreated {
            platform: "discord".into(),
            channel_id: "C".into(),
            message_id: message_id.into(),
            user_id: "u1".into(),
            user_name: Some("alice".into()),
            text: text.into(),
            ts: 1_000,
            raw: serde_json::json!({
                "discord": {
                    "isDmBased": false,
                    "mentionsBot": mentions_bot,
                    "replyToBot": reply_to.is_some(),
                    "replyToMessageId": reply_to,
                    "isChat": true,
                }
            }),
        }
    }

    async fn new_router(bus: Arc<Bus>) -> (Arc<Router>, mpsc::UnboundedReceiver<DebounceBuffer>) {
        let tmp = tempfile_config();
        let watcher = ConfigWatcher::new(Some(tmp.as_path())).unwrap();
        Router::new(
            bus,
            watcher,
            Arc::new(AlwaysForwardGate),
            Arc::new(EmptySource),
            Arc::new(NoopFetcher),
            HashMap::new(),
            None,
        )
    }

    fn tempfile_config() -> std::path::PathBuf {
        use std::io::Write;
        let mut path = std::env::temp_dir();
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        path.push(format!("convo-router-test-{}.yaml", COUNTER.fetch_add(1, Ordering::Relaxed)));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "surface:\n  router:\n    defaultMode: mention\n    activeDebounceMs: 10").unwrap();
        path
    }

    #[tokio::test]
    async fn mention_with_no_active_request_starts_a_prompt() {
        let bus = Arc::new(Bus::default());
        let mut cmd_rx = bus.subscribe_command();
        let (router, _debounce_rx) = new_router(bus.clone()).await;

        router.handle_adapter(adapter_event("m1", "@bot hi", true, None)).await;

        let cmd = cmd_rx.try_recv().unwrap();
        assert_eq!(cmd.request_id, "discord:C:m1");
        assert!(matches!(cmd.queue, QueueMode::Prompt));
    }

    #[tokio::test]
    async fn plain_message_in_mention_mode_is_skipped() {
        let bus = Arc::new(Bus::default());
        let mut cmd_rx = bus.subscribe_command();
        let (router, _debounce_rx) = new_router(bus.clone()).await;

        router.handle_adapter(adapter_event("m1", "just chatting", false, None)).await;

        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reply_to_active_output_with_mention_steers_and_reanchors() {
        let bus = Arc::new(Bus::new(BusCaps::default()));
        let mut reanchor_rx = bus.subscribe_reanchor();
        let mut cmd_rx = bus.subscribe_command();
        let (router, _debounce_rx) = new_router(bus.clone()).await;

        router.sessions.start_request("C", "discord:C:anchor-req");
        router.sessions.record_active_output("C", "discord:C:anchor-req", "out1");

        router.handle_adapter(adapter_event("m2", "@bot keep going", true, Some("out1"))).await;

        let reanchor = reanchor_rx.try_recv().unwrap();
        assert!(!reanchor.inherit_reply_to);
        assert_eq!(reanchor.reply_to.unwrap().message_id, "m2");
        let cmd = cmd_rx.try_recv().unwrap();
        assert!(matches!(cmd.queue, QueueMode::Steer));
    }

    #[tokio::test]
    async fn interrupt_directive_publishes_interrupt_queue() {
        let bus = Arc::new(Bus::default());
        let mut cmd_rx = bus.subscribe_command();
        let (router, _debounce_rx) = new_router(bus.clone()).await;

        router.sessions.start_request("C", "discord:C:anchor-req");
        router.sessions.record_active_output("C", "discord:C:anchor-req", "out1");

        router
            .handle_adapter(adapter_event("m2", "@bot !interrupt: stop that", true, Some("out1")))
            .await;

        let cmd = cmd_rx.try_recv().unwrap();
        assert!(matches!(cmd.queue, QueueMode::Interrupt));
    }

    #[tokio::test]
    async fn reply_to_non_active_bot_message_while_running_forks_a_queued_request() {
        let bus = Arc::new(Bus::default());
        let mut cmd_rx = bus.subscribe_command();
        let tmp = {
            use std::io::Write;
            let mut path = std::env::temp_dir();
            path.push("convo-router-test-active-mode.yaml");
            let mut f = std::fs::File::create(&path).unwrap();
            writeln!(f, "surface:\n  router:\n    defaultMode: active\n    activeDebounceMs: 10").unwrap();
            path
        };
        let watcher = ConfigWatcher::new(Some(tmp.as_path())).unwrap();
        let (router, _debounce_rx) = Router::new(
            bus.clone(),
            watcher,
            Arc::new(AlwaysForwardGate),
            Arc::new(EmptySource),
            Arc::new(NoopFetcher),
            HashMap::new(),
            None,
        );

        router.sessions.start_request("C", "discord:C:anchor-req");
        router.handle_adapter(adapter_event("m2", "reply to a stale message", false, Some("stale-out"))).await;

        let cmd = cmd_rx.try_recv().unwrap();
        assert_eq!(cmd.request_id, "queued:discord:C:anchor-req");
    }
}
