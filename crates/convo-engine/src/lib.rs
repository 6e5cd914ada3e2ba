// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
// `agent.rs` and `compact.rs` remain on disk as superseded reference
// material (see DESIGN.md) until the auto-compaction crate lands; they are
// intentionally not part of the module tree below.
mod events;
mod transcript;
mod turn_engine;

pub use events::{AbortPhase, AbortReason, AgentEvent, FinishReason, ResetReason, accumulate_usage};
pub use transcript::Transcript;
pub use turn_engine::{
    Agent, AgentHandle, ErrorAction, FollowUpMode, SteeringMode, TurnErrorHandler, TurnResult,
};
