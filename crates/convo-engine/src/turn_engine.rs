// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Agent Turn Engine: a cooperative, single-tasked streaming turn loop.
//!
//! All transcript mutation happens on the task driving [`Agent::prompt`].
//! Steering, follow-up, and interrupt requests may arrive concurrently (from
//! a Session-Queue Runner reacting to bus commands) but only enqueue work or
//! flip an abort signal; they never touch the transcript directly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use convo_model::{
    CompletionRequest, FunctionCall, Message, MessageContent, ModelProvider, ResponseEvent, Role,
    ToolSchema as ModelToolSchema, Usage,
};
use convo_tools::{ToolCall, ToolOutput, ToolPolicy, ToolRegistry};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::events::{AbortPhase, AbortReason, AgentEvent, FinishReason, ResetReason};
use crate::transcript::Transcript;

/// How the steering queue drains once a tool-call batch completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteeringMode {
    OneAtATime,
    All,
}

/// How the follow-up queue drains once a text-only turn ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpMode {
    OneAtATime,
    All,
}

/// Outcome of a full [`Agent::prompt`] / [`Agent::resume`] run. `Err` is
/// reserved for errors the configured [`TurnErrorHandler`] chose to fail on,
/// or that occurred with no handler installed.
#[derive(Debug)]
pub enum TurnResult {
    Ok,
    AbortedByInterrupt,
    AbortedByManual,
}

/// Internal control-flow signal — never escapes the turn loop as an `Err`
/// returned to the caller; translated into a [`TurnResult`] variant or
/// handled by the turn-error handler instead.
#[derive(Debug, thiserror::Error)]
enum TurnAborted {
    #[error("turn aborted: {reason:?} during {phase:?}")]
    Aborted { reason: AbortReason, phase: AbortPhase },
}

/// Decides whether a model-call error should be retried (after the outbound
/// transform hook has had a chance to react, e.g. auto-compaction shrinking
/// the transcript) or should fail the run.
pub trait TurnErrorHandler: Send + Sync {
    fn on_error(&mut self, err: &anyhow::Error, attempt: u32) -> ErrorAction;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Retry,
    Fail,
}

/// Rewrites the outbound message list before a model call without mutating
/// the canonical transcript (used by auto-compaction). Must never return a
/// list ending in an assistant message.
pub type TransformMessages = dyn Fn(&[Message]) -> Vec<Message> + Send + Sync;

struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self) -> ToolCall {
        let args = serde_json::from_str(&self.args_buf)
            .unwrap_or_else(|_| serde_json::json!({ "_raw": self.args_buf }));
        ToolCall { id: self.id, name: self.name, args }
    }
}

/// Drives one conversation's turn loop: model call → optional tool
/// execution → repeat, with steering / follow-up / interrupt support.
pub struct Agent {
    pub transcript: Transcript,
    tools: Arc<ToolRegistry>,
    tool_policy: ToolPolicy,
    model: Arc<dyn ModelProvider>,
    system_prompt: Option<String>,
    max_tool_rounds: u32,
    steering_mode: SteeringMode,
    follow_up_mode: FollowUpMode,

    steering_queue: Arc<Mutex<VecDeque<String>>>,
    follow_up_queue: Arc<Mutex<VecDeque<String>>>,
    interrupt_text: Arc<Mutex<Option<String>>>,
    interrupt_pending: Arc<AtomicBool>,
    manual_abort: Arc<AtomicBool>,

    transform_messages: Option<Arc<TransformMessages>>,
    error_handler: Option<Arc<Mutex<dyn TurnErrorHandler>>>,
}

/// A cheap, cloneable handle onto one agent's steering / follow-up /
/// interrupt / abort state, independent of the `Agent` value itself. Safe
/// to hold and call from a task other than the one driving [`Agent::prompt`]
/// — see [`Agent::handle`].
#[derive(Clone)]
pub struct AgentHandle {
    steering_queue: Arc<Mutex<VecDeque<String>>>,
    follow_up_queue: Arc<Mutex<VecDeque<String>>>,
    interrupt_text: Arc<Mutex<Option<String>>>,
    interrupt_pending: Arc<AtomicBool>,
    manual_abort: Arc<AtomicBool>,
}

impl AgentHandle {
    pub async fn steer(&self, text: impl Into<String>) {
        self.steering_queue.lock().await.push_back(text.into());
    }

    pub async fn follow_up(&self, text: impl Into<String>) {
        self.follow_up_queue.lock().await.push_back(text.into());
    }

    pub async fn interrupt(&self, text: impl Into<String>) -> anyhow::Result<()> {
        if self
            .interrupt_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            anyhow::bail!("an interrupt is already pending for this agent");
        }
        *self.interrupt_text.lock().await = Some(text.into());
        Ok(())
    }

    pub fn abort(&self) {
        self.manual_abort.store(true, Ordering::SeqCst);
    }
}

impl Agent {
    pub fn new(
        transcript: Transcript,
        tools: Arc<ToolRegistry>,
        tool_policy: ToolPolicy,
        model: Arc<dyn ModelProvider>,
        system_prompt: Option<String>,
        max_tool_rounds: u32,
    ) -> Self {
        Self {
            transcript,
            tools,
            tool_policy,
            model,
            system_prompt,
            max_tool_rounds,
            steering_mode: SteeringMode::OneAtATime,
            follow_up_mode: FollowUpMode::OneAtATime,
            steering_queue: Arc::new(Mutex::new(VecDeque::new())),
            follow_up_queue: Arc::new(Mutex::new(VecDeque::new())),
            interrupt_text: Arc::new(Mutex::new(None)),
            interrupt_pending: Arc::new(AtomicBool::new(false)),
            manual_abort: Arc::new(AtomicBool::new(false)),
            transform_messages: None,
            error_handler: None,
        }
    }

    pub fn with_transform_messages(mut self, f: Arc<TransformMessages>) -> Self {
        self.transform_messages = Some(f);
        self
    }

    pub fn with_error_handler(mut self, h: Arc<Mutex<dyn TurnErrorHandler>>) -> Self {
        self.error_handler = Some(h);
        self
    }

    pub fn with_steering_mode(mut self, m: SteeringMode) -> Self {
        self.steering_mode = m;
        self
    }

    pub fn with_follow_up_mode(mut self, m: FollowUpMode) -> Self {
        self.follow_up_mode = m;
        self
    }

    /// Queue a steering message. Drained at the next tool-call boundary
    /// inside the current turn, or immediately before the next turn starts
    /// if none is in flight.
    pub async fn steer(&self, text: impl Into<String>) {
        self.steering_queue.lock().await.push_back(text.into());
    }

    /// Queue a follow-up message. Drained once the current turn ends with
    /// no tool calls.
    pub async fn follow_up(&self, text: impl Into<String>) {
        self.follow_up_queue.lock().await.push_back(text.into());
    }

    /// Request an interrupt. At most one may be pending; a second call
    /// before the first is processed is an error.
    pub async fn interrupt(&self, text: impl Into<String>) -> anyhow::Result<()> {
        if self
            .interrupt_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            anyhow::bail!("an interrupt is already pending for this agent");
        }
        *self.interrupt_text.lock().await = Some(text.into());
        Ok(())
    }

    /// Request a manual abort (no transcript rewind).
    pub fn abort(&self) {
        self.manual_abort.store(true, Ordering::SeqCst);
    }

    /// Clone a lightweight control handle sharing this agent's steering /
    /// follow-up / interrupt / abort state. Call this before moving the
    /// agent into the task that drives [`Agent::prompt`] — a Session-Queue
    /// Runner holds the handle to signal a turn in flight on another task
    /// without needing `&mut Agent`.
    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            steering_queue: self.steering_queue.clone(),
            follow_up_queue: self.follow_up_queue.clone(),
            interrupt_text: self.interrupt_text.clone(),
            interrupt_pending: self.interrupt_pending.clone(),
            manual_abort: self.manual_abort.clone(),
        }
    }

    fn request_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.transcript.messages.len() + 1);
        if let Some(sys) = &self.system_prompt {
            out.push(Message::system(sys));
        }
        out.extend(self.transcript.messages.clone());
        if let Some(transform) = &self.transform_messages {
            transform(&out)
        } else {
            out
        }
    }

    /// Run the agent to completion: seed `messages` as a user turn, then
    /// loop turns until the model stops requesting tools and no follow-ups
    /// remain, an interrupt/manual abort stops the run, or the error
    /// handler fails the run.
    pub async fn prompt(
        &mut self,
        tx: mpsc::Sender<AgentEvent>,
        messages: Vec<Message>,
    ) -> anyhow::Result<TurnResult> {
        self.transcript.push_many(messages);
        self.run(tx).await
    }

    async fn run(&mut self, tx: mpsc::Sender<AgentEvent>) -> anyhow::Result<TurnResult> {
        let _ = tx.send(AgentEvent::AgentStart).await;
        let mut total_usage = Usage::default();
        let mut rounds = 0u32;

        let result = loop {
            if self.manual_abort.load(Ordering::SeqCst) {
                break TurnResult::AbortedByManual;
            }
            rounds += 1;
            if rounds > self.max_tool_rounds {
                self.transcript.push(Message::user(format!(
                    "You have reached the maximum tool-call budget ({} rounds). \
                     Do not call any more tools; summarize progress and remaining work.",
                    self.max_tool_rounds
                )));
            }

            let mut attempt = 0u32;
            let turn_outcome = loop {
                attempt += 1;
                match self.run_one_turn(&tx, &mut total_usage, rounds > self.max_tool_rounds).await
                {
                    Ok(outcome) => break Ok(outcome),
                    Err(e) => {
                        if let Some(TurnAborted::Aborted { reason, phase }) =
                            e.downcast_ref::<TurnAborted>()
                        {
                            let _ = tx
                                .send(AgentEvent::TurnAbort {
                                    reason: *reason,
                                    phase: *phase,
                                    detail: None,
                                })
                                .await;
                            break Err(TurnLoopSignal::Aborted(*reason));
                        }
                        let action = match &self.error_handler {
                            Some(h) => h.lock().await.on_error(&e, attempt),
                            None => ErrorAction::Fail,
                        };
                        if action == ErrorAction::Retry && attempt <= 3 {
                            continue;
                        }
                        break Err(TurnLoopSignal::Fatal(e));
                    }
                }
            };

            match turn_outcome {
                Ok(TurnOutcome::Done) => break TurnResult::Ok,
                Ok(TurnOutcome::Continue) => continue,
                Err(TurnLoopSignal::Aborted(AbortReason::Manual)) => {
                    break TurnResult::AbortedByManual;
                }
                Err(TurnLoopSignal::Aborted(AbortReason::Interrupt)) => {
                    self.rewind_to_last_valid_boundary(&tx, ResetReason::Interrupt).await;
                    let text = self.interrupt_text.lock().await.take().unwrap_or_default();
                    self.interrupt_pending.store(false, Ordering::SeqCst);
                    self.transcript.push(Message::user(text));
                    continue;
                }
                Err(TurnLoopSignal::Fatal(e)) => return Err(e),
            }
        };

        let _ = tx
            .send(AgentEvent::AgentEnd { transcript: self.transcript.messages.clone(), total_usage })
            .await;
        Ok(result)
    }

    async fn rewind_to_last_valid_boundary(&mut self, tx: &mpsc::Sender<AgentEvent>, reason: ResetReason) {
        let before = self.transcript.messages.len();
        let boundary = self.transcript.last_valid_boundary();
        let dropped = before - boundary;
        let mut msgs = self.transcript.messages.clone();
        msgs.truncate(boundary);
        self.transcript.replace_messages(msgs);
        let _ = tx
            .send(AgentEvent::MessagesReset {
                reason,
                messages: self.transcript.messages.clone(),
                dropped_message_count: Some(dropped),
                previous_message_count: Some(before),
            })
            .await;
    }

    fn check_abort(&self) -> Option<AbortReason> {
        if self.manual_abort.load(Ordering::SeqCst) {
            Some(AbortReason::Manual)
        } else if self.interrupt_pending.load(Ordering::SeqCst) {
            Some(AbortReason::Interrupt)
        } else {
            None
        }
    }

    /// Run exactly one turn: one model streaming call plus, if requested,
    /// one round of local tool execution.
    async fn run_one_turn(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        total_usage: &mut Usage,
        tools_disabled: bool,
    ) -> anyhow::Result<TurnOutcome> {
        let _ = tx.send(AgentEvent::TurnStart).await;

        let outbound = self.request_messages();
        let schemas: Vec<ModelToolSchema> = if tools_disabled {
            vec![]
        } else {
            self.tools
                .schemas()
                .into_iter()
                .map(|s| ModelToolSchema { name: s.name, description: s.description, parameters: s.parameters })
                .collect()
        };

        let req = CompletionRequest {
            messages: outbound,
            tools: schemas,
            stream: true,
            system_dynamic_suffix: None,
        };

        let mut stream = self.model.complete(req).await.context("model completion failed")?;

        let _ = tx.send(AgentEvent::MessageStart).await;
        let mut full_text = String::new();
        let mut pending_tcs: HashMap<u32, PendingToolCall> = HashMap::new();
        let mut usage = Usage::default();
        let mut hit_max_tokens = false;

        use futures::StreamExt;
        while let Some(event) = stream.next().await {
            if let Some(reason) = self.check_abort() {
                return Err(TurnAborted::Aborted { reason, phase: AbortPhase::Model }.into());
            }
            match event? {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    full_text.push_str(&delta);
                    let _ = tx
                        .send(AgentEvent::MessageUpdate { text_delta: Some(delta), reasoning_delta: None })
                        .await;
                }
                ResponseEvent::ThinkingDelta(delta) => {
                    let _ = tx
                        .send(AgentEvent::MessageUpdate { text_delta: None, reasoning_delta: Some(delta) })
                        .await;
                }
                ResponseEvent::ToolCall { index, id, name, arguments } => {
                    let ptc = pending_tcs.entry(index).or_insert_with(|| PendingToolCall {
                        id: String::new(),
                        name: String::new(),
                        args_buf: String::new(),
                    });
                    if !id.is_empty() {
                        ptc.id = id;
                    }
                    if !name.is_empty() {
                        ptc.name = name;
                    }
                    ptc.args_buf.push_str(&arguments);
                }
                ResponseEvent::Usage { input_tokens, output_tokens, cache_read_tokens, cache_write_tokens } => {
                    usage = Usage { input_tokens, output_tokens, cache_read_tokens, cache_write_tokens };
                    self.transcript.add_cache_usage(cache_read_tokens as u64, cache_write_tokens as u64);
                    if input_tokens > 0 {
                        let estimated = self.transcript.token_count + self.transcript.schema_overhead;
                        self.transcript.update_calibration(
                            (input_tokens + cache_read_tokens) as u64,
                            estimated,
                        );
                    }
                }
                ResponseEvent::MaxTokens => hit_max_tokens = true,
                ResponseEvent::Error(msg) => warn!("model stream error: {msg}"),
                ResponseEvent::Done => break,
            }
        }

        let mut tool_calls: Vec<ToolCall> = {
            let mut sorted: Vec<(u32, PendingToolCall)> = pending_tcs.into_iter().collect();
            sorted.sort_by_key(|(idx, _)| *idx);
            sorted
                .into_iter()
                .filter(|(_, ptc)| !ptc.name.is_empty())
                .map(|(_, ptc)| ptc.finish())
                .collect()
        };
        for (i, tc) in tool_calls.iter_mut().enumerate() {
            if tc.id.is_empty() {
                tc.id = format!("tc_synthetic_{i}");
            }
        }

        crate::events::accumulate_usage(total_usage, &usage);

        let finish_reason = if !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else if hit_max_tokens {
            FinishReason::MaxTokens
        } else {
            FinishReason::Stop
        };

        let mut new_messages = Vec::new();
        if !full_text.is_empty() {
            let m = Message::assistant(&full_text);
            self.transcript.push(m.clone());
            new_messages.push(m);
            let _ = tx.send(AgentEvent::MessageEnd { message: new_messages.last().unwrap().clone() }).await;
        }

        if finish_reason != FinishReason::ToolCalls {
            let _ = tx
                .send(AgentEvent::TurnEnd {
                    finish_reason,
                    new_messages,
                    usage,
                    total_usage: total_usage.clone(),
                })
                .await;
            // No tool calls: drain follow-ups, or terminate the run.
            let next = self.follow_up_queue.lock().await.pop_front();
            return match next {
                Some(text) => {
                    self.transcript.push(Message::user(text));
                    if self.follow_up_mode == FollowUpMode::All {
                        let mut q = self.follow_up_queue.lock().await;
                        while let Some(more) = q.pop_front() {
                            self.transcript.push(Message::user(more));
                        }
                    }
                    Ok(TurnOutcome::Continue)
                }
                None => Ok(TurnOutcome::Done),
            };
        }

        // finish_reason == ToolCalls: execute each call in emission order.
        for tc in &tool_calls {
            self.transcript.push(Message {
                role: Role::Assistant,
                content: MessageContent::ToolCall {
                    tool_call_id: tc.id.clone(),
                    function: FunctionCall { name: tc.name.clone(), arguments: tc.args.to_string() },
                },
            });
        }
        new_messages.extend(tool_calls.iter().map(|tc| Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: tc.id.clone(),
                function: FunctionCall { name: tc.name.clone(), arguments: tc.args.to_string() },
            },
        }));

        for tc in &tool_calls {
            if let Some(reason) = self.check_abort() {
                return Err(TurnAborted::Aborted { reason, phase: AbortPhase::Tools }.into());
            }

            let _ = tx.send(AgentEvent::ToolExecutionStart { call: tc.clone() }).await;

            let denied = matches!(
                self.tools.get(&tc.name).map(|t| t.default_policy()),
                Some(convo_tools::ApprovalPolicy::Deny)
            ) || matches!(
                self.tool_policy.decide(&tc.name),
                convo_tools::ApprovalPolicy::Deny
            );

            let output = if denied {
                ToolOutput::err(&tc.id, "tool call denied by policy")
            } else {
                self.tools.execute(tc).await
            };

            let _ = tx
                .send(AgentEvent::ToolExecutionEnd {
                    call_id: tc.id.clone(),
                    tool_name: tc.name.clone(),
                    output: output.content.clone(),
                    is_error: output.is_error,
                })
                .await;

            let tool_msg = Message::tool_result(&tc.id, &output.content);
            self.transcript.push(tool_msg.clone());
            new_messages.push(tool_msg);

            // Drain steering queue at this tool-call boundary.
            let steering_drained = self.drain_steering().await;
            if steering_drained {
                break;
            }

            if let Some(reason) = self.check_abort() {
                return Err(TurnAborted::Aborted { reason, phase: AbortPhase::Tools }.into());
            }
        }

        let _ = tx
            .send(AgentEvent::TurnEnd { finish_reason, new_messages, usage, total_usage: total_usage.clone() })
            .await;
        Ok(TurnOutcome::Continue)
    }

    /// If the steering queue is non-empty, synthesize error results for any
    /// tool calls the caller hasn't yet pushed results for (none, since we
    /// only call this between already-completed tool results), append the
    /// steering message(s), and signal the outer loop to move to the next
    /// turn. Returns `true` if steering drained (and the remaining tool
    /// calls in this batch should be skipped).
    async fn drain_steering(&mut self) -> bool {
        let mut q = self.steering_queue.lock().await;
        if q.is_empty() {
            return false;
        }
        match self.steering_mode {
            SteeringMode::OneAtATime => {
                if let Some(text) = q.pop_front() {
                    drop(q);
                    self.transcript.push(Message::user(text));
                    return true;
                }
            }
            SteeringMode::All => {
                let mut texts = Vec::new();
                while let Some(text) = q.pop_front() {
                    texts.push(text);
                }
                drop(q);
                for text in texts {
                    self.transcript.push(Message::user(text));
                }
                return true;
            }
        }
        false
    }
}

enum TurnOutcome {
    Done,
    Continue,
}

enum TurnLoopSignal {
    Aborted(AbortReason),
    Fatal(anyhow::Error),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
