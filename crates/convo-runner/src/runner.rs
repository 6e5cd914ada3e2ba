// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Session-Queue Runner: serializes `cmd.request.message` commands per
//! session so at most one agent runs per session at a time, coercing a
//! `prompt` that arrives while one is already running into a `followUp`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use convo_bus::{Bus, LifecycleState, OutputEvent, QueueMode, RequestLifecycleChanged, RequestMessage, RequestReply};
use convo_engine::{Agent, AgentEvent, AgentHandle, TurnResult};
use convo_model::Message;
use tokio::sync::Mutex;
use tracing::{debug, warn};

fn now_ts() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn render_text(messages: &[Message]) -> String {
    messages
        .iter()
        .filter_map(|m| m.as_text())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds a fresh [`Agent`] for a session's next turn. The concrete model
/// provider, tool registry, compaction wiring, and system prompt are host
/// integration concerns, same as `convo_tools::ToolRegistry`'s "register
/// via host integration" boundary — this crate only owns serialization.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn build(&self, session_id: &str, model_override: Option<&str>) -> anyhow::Result<Agent>;
}

struct SessionEntry {
    running: bool,
    active_request_id: Option<String>,
    handle: Option<AgentHandle>,
    queue: VecDeque<RequestMessage>,
}

impl SessionEntry {
    fn new() -> Self {
        Self { running: false, active_request_id: None, handle: None, queue: VecDeque::new() }
    }
}

/// Owns one [`Agent`] per session, serialized through a per-session queue.
pub struct Runner {
    bus: Arc<Bus>,
    factory: Arc<dyn AgentFactory>,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionEntry>>>>,
}

impl Runner {
    pub fn new(bus: Arc<Bus>, factory: Arc<dyn AgentFactory>) -> Self {
        Self { bus, factory, sessions: Mutex::new(HashMap::new()) }
    }

    /// Subscribe to `cmd.request` and dispatch every command until the bus
    /// is dropped. Intended to be spawned as a background task.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.bus.subscribe_command();
        loop {
            match rx.recv().await {
                Ok(cmd) => self.clone().dispatch(cmd).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "runner lagged behind cmd.request, dropped commands");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn entry_for(&self, session_id: &str) -> Arc<Mutex<SessionEntry>> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionEntry::new())))
            .clone()
    }

    /// Route one command: forward to the running agent, coerce a `prompt`
    /// into a `followUp` if one is already running, or enqueue/start a new
    /// turn.
    pub async fn dispatch(self: Arc<Self>, cmd: RequestMessage) {
        let entry = self.entry_for(&cmd.session_id).await;
        let mut guard = entry.lock().await;

        if guard.running {
            match cmd.queue {
                QueueMode::Steer => {
                    if let Some(h) = &guard.handle {
                        h.steer(render_text(&cmd.messages)).await;
                    }
                    return;
                }
                QueueMode::Interrupt => {
                    if let Some(h) = &guard.handle {
                        let _ = h.interrupt(render_text(&cmd.messages)).await;
                    }
                    return;
                }
                QueueMode::Prompt | QueueMode::FollowUp => {
                    debug!(request_id = %cmd.request_id, "prompt coerced to followUp: agent already running");
                    if let Some(h) = &guard.handle {
                        h.follow_up(render_text(&cmd.messages)).await;
                        self.bus.publish_lifecycle(RequestLifecycleChanged {
                            request_id: cmd.request_id.clone(),
                            session_id: cmd.session_id.clone(),
                            request_client: cmd.request_client.clone(),
                            state: LifecycleState::Queued,
                            detail: Some("coerced to follow-up of the active turn".into()),
                            ts: now_ts(),
                        });
                    } else {
                        guard.queue.push_back(cmd);
                    }
                    return;
                }
            }
        }

        match cmd.queue {
            QueueMode::Steer | QueueMode::Interrupt => {
                debug!(request_id = %cmd.request_id, "no agent running for session, dropping steer/interrupt");
            }
            QueueMode::Prompt | QueueMode::FollowUp => {
                guard.queue.push_back(cmd);
                drop(guard);
                self.drain(entry).await;
            }
        }
    }

    /// Pop the next queued request and start it, publishing the `queued` →
    /// `running` transition. No-op if a turn is already running or the
    /// queue is empty.
    async fn drain(self: Arc<Self>, entry: Arc<Mutex<SessionEntry>>) {
        let next = {
            let mut guard = entry.lock().await;
            if guard.running {
                return;
            }
            match guard.queue.pop_front() {
                Some(cmd) => {
                    guard.running = true;
                    guard.active_request_id = Some(cmd.request_id.clone());
                    cmd
                }
                None => return,
            }
        };

        self.bus.publish_lifecycle(RequestLifecycleChanged {
            request_id: next.request_id.clone(),
            session_id: next.session_id.clone(),
            request_client: next.request_client.clone(),
            state: LifecycleState::Running,
            detail: None,
            ts: now_ts(),
        });
        // Tells the Output Relay to subscribe to this request's `out.req.<id>`
        // topic. Published before the agent is built so the relay has a
        // subscriber in place before the first output event can be sent.
        self.bus.publish_request_reply(RequestReply {
            request_id: next.request_id.clone(),
            session_id: next.session_id.clone(),
            request_client: next.request_client.clone(),
        });

        let mut agent = match self.factory.build(&next.session_id, next.model_override.as_deref()).await {
            Ok(a) => a,
            Err(err) => {
                self.fail(&entry, &next, &err.to_string()).await;
                self.clone().drain(entry).await;
                return;
            }
        };

        {
            let mut guard = entry.lock().await;
            guard.handle = Some(agent.handle());
        }

        let bus = self.bus.clone();
        let request_id = next.request_id.clone();
        let messages = next.messages.clone();

        let (tx, mut rx) = tokio::sync::mpsc::channel::<AgentEvent>(256);
        let relay_request_id = request_id.clone();
        let relay_bus = bus.clone();
        let relay = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Some(out) = to_output_event(&event) {
                    relay_bus.publish_output(&relay_request_id, out);
                }
            }
        });

        let result = agent.prompt(tx, messages).await;
        relay.await.ok();
        bus.close_output(&request_id);

        match result {
            Ok(TurnResult::Ok) => self.resolve(&entry, &next).await,
            Ok(TurnResult::AbortedByInterrupt) => self.resolve(&entry, &next).await,
            Ok(TurnResult::AbortedByManual) => self.cancel(&entry, &next).await,
            Err(err) => self.fail(&entry, &next, &err.to_string()).await,
        }

        {
            let mut guard = entry.lock().await;
            guard.running = false;
            guard.active_request_id = None;
            guard.handle = None;
        }
        self.clone().drain(entry).await;
    }

    async fn resolve(&self, _entry: &Arc<Mutex<SessionEntry>>, req: &RequestMessage) {
        self.bus.publish_lifecycle(RequestLifecycleChanged {
            request_id: req.request_id.clone(),
            session_id: req.session_id.clone(),
            request_client: req.request_client.clone(),
            state: LifecycleState::Resolved,
            detail: None,
            ts: now_ts(),
        });
    }

    async fn cancel(&self, _entry: &Arc<Mutex<SessionEntry>>, req: &RequestMessage) {
        self.bus.publish_lifecycle(RequestLifecycleChanged {
            request_id: req.request_id.clone(),
            session_id: req.session_id.clone(),
            request_client: req.request_client.clone(),
            state: LifecycleState::Cancelled,
            detail: None,
            ts: now_ts(),
        });
    }

    async fn fail(&self, _entry: &Arc<Mutex<SessionEntry>>, req: &RequestMessage, detail: &str) {
        self.bus.publish_lifecycle(RequestLifecycleChanged {
            request_id: req.request_id.clone(),
            session_id: req.session_id.clone(),
            request_client: req.request_client.clone(),
            state: LifecycleState::Failed,
            detail: Some(detail.to_string()),
            ts: now_ts(),
        });
    }
}

fn to_output_event(event: &AgentEvent) -> Option<OutputEvent> {
    match event {
        AgentEvent::MessageUpdate { text_delta: Some(delta), .. } => {
            Some(OutputEvent::DeltaText(delta.clone()))
        }
        AgentEvent::ToolExecutionStart { call } => {
            Some(OutputEvent::ToolCall { name: call.name.clone(), args: call.args.clone() })
        }
        AgentEvent::MessageEnd { message } => {
            message.as_text().map(|t| OutputEvent::ResponseText(t.to_string()))
        }
        _ => None,
    }
}
