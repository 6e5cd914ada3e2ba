// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod sanitize;
mod types;
mod provider;
mod mock;

pub use catalog::{ModelCatalogEntry, InputModality};
pub use types::*;
pub use provider::ModelProvider;
pub use mock::{MockProvider, ScriptedMockProvider};

use anyhow::bail;
use convo_config::ModelConfig;

/// Construct a boxed [`ModelProvider`] from configuration.
///
/// The concrete LLM SDK drivers (HTTP transport, provider-specific wire
/// formats) live outside this crate's boundary. This factory only resolves
/// the deterministic `"mock"` echo provider used for local development and
/// tests; [`ScriptedMockProvider`] is constructed directly by test code that
/// needs scripted responses rather than through config.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "mock" => Ok(Box::new(MockProvider)),
        other => bail!("unknown model provider: {other} (expected \"mock\")"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_builds_mock_provider() {
        let cfg = ModelConfig { provider: "mock".into(), name: "mock-model".into(), ..ModelConfig::default() };
        let provider = from_config(&cfg).unwrap();
        assert_eq!(provider.name(), "mock");
    }

    #[test]
    fn from_config_rejects_unknown_provider() {
        let cfg = ModelConfig { provider: "nonexistent".into(), name: "x".into(), ..ModelConfig::default() };
        assert!(from_config(&cfg).is_err());
    }
}
