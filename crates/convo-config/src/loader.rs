// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/convo/config.yaml"));
    paths.push(PathBuf::from("/etc/convo/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/convo/config.yaml"));
        paths.push(home.join(".config/convo/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("convo/config.yaml"));
        paths.push(cfg.join("convo/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".convo/config.yaml"));
    paths.push(PathBuf::from(".convo/config.yml"));
    paths.push(PathBuf::from(".convo.yaml"));
    paths.push(PathBuf::from(".convo.yml"));
    paths.push(PathBuf::from("convo.yaml"));
    paths.push(PathBuf::from("convo.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    // Deserialize the merged YAML value into Config, falling back to defaults
    // when the merged value is empty (no config files found).
    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Watches the config search path's mtimes and reloads only when something
/// on disk actually changed, retaining the last-known-good [`Config`] on a
/// reload error rather than propagating it.
///
/// The Request Router (§4.1) needs `reloadConfigIfNeeded()` on every inbound
/// message without re-parsing YAML on the hot path; this wrapper is that
/// cache.
pub struct ConfigWatcher {
    extra: Option<PathBuf>,
    current: Config,
    mtimes: Vec<(PathBuf, std::time::SystemTime)>,
    last_warned_at: Option<std::time::Instant>,
}

const RELOAD_WARNING_RATE_LIMIT: std::time::Duration = std::time::Duration::from_secs(30);

impl ConfigWatcher {
    pub fn new(extra: Option<&Path>) -> anyhow::Result<Self> {
        let current = load(extra)?;
        let mtimes = snapshot_mtimes(extra);
        Ok(Self {
            extra: extra.map(Path::to_path_buf),
            current,
            mtimes,
            last_warned_at: None,
        })
    }

    pub fn current(&self) -> &Config {
        &self.current
    }

    /// Re-runs the loader only if any watched file's mtime changed since the
    /// last successful load. On a reload error, keeps serving the
    /// last-known-good config and logs at most one warning per 30s.
    pub fn reload_if_needed(&mut self) -> &Config {
        let fresh_mtimes = snapshot_mtimes(self.extra.as_deref());
        if fresh_mtimes == self.mtimes {
            return &self.current;
        }

        match load(self.extra.as_deref()) {
            Ok(cfg) => {
                self.current = cfg;
                self.mtimes = fresh_mtimes;
            }
            Err(err) => {
                let should_warn = match self.last_warned_at {
                    None => true,
                    Some(t) => t.elapsed() >= RELOAD_WARNING_RATE_LIMIT,
                };
                if should_warn {
                    tracing::warn!(error = %err, "config reload failed, keeping last-known-good config");
                    self.last_warned_at = Some(std::time::Instant::now());
                }
                // Don't retry against the same broken mtimes every call.
                self.mtimes = fresh_mtimes;
            }
        }
        &self.current
    }
}

fn snapshot_mtimes(extra: Option<&Path>) -> Vec<(PathBuf, std::time::SystemTime)> {
    let mut paths = config_search_paths();
    if let Some(p) = extra {
        paths.push(p.to_path_buf());
    }
    paths
        .into_iter()
        .filter_map(|p| {
            let mtime = std::fs::metadata(&p).ok()?.modified().ok()?;
            Some((p, mtime))
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("model:\n  provider: openai\n  name: gpt-4o");
        let src = val("model:\n  name: gpt-4o-mini");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["model"]["provider"].as_str(), Some("openai"));
        assert_eq!(dst["model"]["name"].as_str(), Some("gpt-4o-mini"));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/convo_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_with_no_extra_path_returns_defaults() {
        let cfg = load(None).unwrap();
        assert_eq!(cfg.model.provider, "openai");
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "model:\n  provider: anthropic\n  name: test-model").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.model.provider, "anthropic");
        assert_eq!(cfg.model.name, "test-model");
    }

    #[test]
    fn watcher_picks_up_explicit_file_on_construction() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "model:\n  provider: anthropic\n  name: initial").unwrap();
        let watcher = ConfigWatcher::new(Some(f.path())).unwrap();
        assert_eq!(watcher.current().model.name, "initial");
    }

    #[test]
    fn watcher_reload_if_needed_is_noop_when_mtime_unchanged() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "model:\n  provider: anthropic\n  name: initial").unwrap();
        let mut watcher = ConfigWatcher::new(Some(f.path())).unwrap();
        let before = watcher.current().model.name.clone();
        let after = watcher.reload_if_needed().model.name.clone();
        assert_eq!(before, after);
    }

    #[test]
    fn watcher_reloads_when_file_changes() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "model:\n  provider: anthropic\n  name: initial").unwrap();
        let mut watcher = ConfigWatcher::new(Some(f.path())).unwrap();
        assert_eq!(watcher.current().model.name, "initial");

        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(f.path(), "model:\n  provider: anthropic\n  name: updated\n").unwrap();

        let cfg = watcher.reload_if_needed();
        assert_eq!(cfg.model.name, "updated");
    }

    #[test]
    fn watcher_keeps_last_known_good_on_reload_error() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "model:\n  provider: anthropic\n  name: initial").unwrap();
        let mut watcher = ConfigWatcher::new(Some(f.path())).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(f.path(), "not: [valid: yaml").unwrap();

        let cfg = watcher.reload_if_needed();
        assert_eq!(cfg.model.name, "initial");
    }
}
