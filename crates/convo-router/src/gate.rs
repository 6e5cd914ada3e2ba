// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The disambiguation gate: a fast-model yes/no call with a hard timeout,
//! fail-open or fail-closed depending on which of the two contexts invoked
//! it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which of the two call sites invoked the gate — governs fail-open vs.
/// fail-closed on error/timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateContext {
    /// "Should the bot respond to this active-mode burst?" Fail-closed
    /// (skip) on error or timeout.
    ActiveBatch,
    /// "Is this reply addressed to the bot or just referencing it?" Only
    /// invoked when the message is a reply to the bot but `@`-mentions
    /// someone else. Fail-open (treat as addressed) on error or timeout.
    ReplyMentionDisambiguation,
}

impl GateContext {
    fn fail_open(self) -> bool {
        matches!(self, GateContext::ReplyMentionDisambiguation)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    pub forward: bool,
    pub reason: Option<String>,
}

/// Invokes the configured "fast" model slot with a strict JSON-output
/// schema. The concrete provider call lives outside this crate's boundary;
/// implementors wrap `convo_model::ModelProvider::complete`.
#[async_trait]
pub trait Gate: Send + Sync {
    async fn check(&self, context: GateContext, batch_text: &str) -> anyhow::Result<GateVerdict>;
}

/// Run `gate.check` under `timeout_ms`, applying fail-open/fail-closed on
/// error or timeout per `context`. Never blocks the caller beyond
/// `timeout_ms` plus the cost of constructing the timeout future itself.
pub async fn decide_with_gate(
    gate: &dyn Gate,
    context: GateContext,
    batch_text: &str,
    timeout_ms: u64,
) -> GateVerdict {
    let result = tokio::time::timeout(
        Duration::from_millis(timeout_ms),
        gate.check(context, batch_text),
    )
    .await;

    match result {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(err)) => {
            tracing::warn!(error = %err, ?context, "gate call failed");
            GateVerdict { forward: context.fail_open(), reason: Some("gate error".into()) }
        }
        Err(_) => {
            tracing::warn!(?context, timeout_ms, "gate call timed out");
            GateVerdict { forward: context.fail_open(), reason: Some("gate timeout".into()) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration as StdDuration};

    struct AlwaysForward;
    #[async_trait]
    impl Gate for AlwaysForward {
        async fn check(&self, _c: GateContext, _t: &str) -> anyhow::Result<GateVerdict> {
            Ok(GateVerdict { forward: true, reason: None })
        }
    }

    struct AlwaysErrors;
    #[async_trait]
    impl Gate for AlwaysErrors {
        async fn check(&self, _c: GateContext, _t: &str) -> anyhow::Result<GateVerdict> {
            anyhow::bail!("boom")
        }
    }

    struct NeverResponds;
    #[async_trait]
    impl Gate for NeverResponds {
        async fn check(&self, _c: GateContext, _t: &str) -> anyhow::Result<GateVerdict> {
            sleep(StdDuration::from_secs(3600)).await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn forwards_when_gate_says_so() {
        let v = decide_with_gate(&AlwaysForward, GateContext::ActiveBatch, "hi", 100).await;
        assert!(v.forward);
    }

    #[tokio::test]
    async fn active_batch_fails_closed_on_error() {
        let v = decide_with_gate(&AlwaysErrors, GateContext::ActiveBatch, "hi", 100).await;
        assert!(!v.forward);
    }

    #[tokio::test]
    async fn disambiguation_fails_open_on_error() {
        let v = decide_with_gate(&AlwaysErrors, GateContext::ReplyMentionDisambiguation, "hi", 100).await;
        assert!(v.forward);
    }

    #[tokio::test(start_paused = true)]
    async fn active_batch_fails_closed_on_timeout() {
        let check = decide_with_gate(&NeverResponds, GateContext::ActiveBatch, "hi", 50);
        tokio::time::pause();
        let handle = tokio::spawn(check);
        tokio::time::advance(StdDuration::from_millis(60)).await;
        let v = handle.await.unwrap();
        assert!(!v.forward);
    }
}
