// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Request Router: turns `evt.adapter` messages into `cmd.request`/
//! `cmd.surface` commands per the session mode decision table, debounce
//! buffering, active-batch gate, and steer/interrupt directive parsing.

mod debounce;
mod decision;
mod directives;
mod gate;
mod router;
mod state;

pub use debounce::{DebounceBuffer, DebounceManager};
pub use decision::{classify_trigger, decide, RouteAction, TriggerKind};
pub use directives::{
    classify_steer_or_interrupt, extract_model_override, resolve_model_override, SteerOrInterrupt,
};
pub use gate::{decide_with_gate, Gate, GateContext, GateVerdict};
pub use router::Router;
pub use state::{ActiveSessionState, PendingMentionReplyBatch, SessionPhase, SessionTable};
