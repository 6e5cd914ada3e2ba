// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Session-Queue Runner: owns at most one running [`convo_engine::Agent`]
//! per session, serializing `cmd.request.message` commands and publishing
//! `request.lifecycle.changed` transitions.

mod runner;

pub use runner::{AgentFactory, Runner};
