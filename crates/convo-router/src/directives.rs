// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Text-level directive parsing: steer-vs-interrupt, and the one-shot
//! `!m:<modelspec>` override. Both directives are stripped from the text
//! forwarded to the model; parsing always happens after the leading bot
//! mention (if any) has already been stripped.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteerOrInterrupt {
    Steer,
    Interrupt,
}

/// `!interrupt` / `!int`, case-insensitive, with an optional `:`/`,`
/// separator before the remaining text. Anything else is `Steer`.
pub fn classify_steer_or_interrupt(text: &str) -> (SteerOrInterrupt, String) {
    let trimmed = text.trim_start();
    let lower = trimmed.to_ascii_lowercase();
    for token in ["!interrupt", "!int"] {
        if lower.starts_with(token) {
            let rest = &trimmed[token.len()..];
            let rest = rest.trim_start_matches([':', ',']);
            return (SteerOrInterrupt::Interrupt, rest.trim_start().to_string());
        }
    }
    (SteerOrInterrupt::Steer, trimmed.to_string())
}

/// Extract a leading `!m:<modelspec>` token (up to the next whitespace) and
/// return `(model_override, remaining_text)`.
pub fn extract_model_override(text: &str) -> (Option<String>, String) {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix("!m:") {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let spec = &rest[..end];
        if spec.is_empty() {
            return (None, text.to_string());
        }
        let remainder = rest[end..].trim_start().to_string();
        return (Some(spec.to_string()), remainder);
    }
    (None, text.to_string())
}

/// Effective model precedence: per-request override > session raw override
/// > static per-session config.
pub fn resolve_model_override(
    per_request: Option<&str>,
    session_raw: Option<&str>,
    static_session_config: Option<&str>,
) -> Option<String> {
    per_request
        .or(session_raw)
        .or(static_session_config)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_interrupt_with_colon() {
        let (kind, rest) = classify_steer_or_interrupt("!interrupt: stop now");
        assert_eq!(kind, SteerOrInterrupt::Interrupt);
        assert_eq!(rest, "stop now");
    }

    #[test]
    fn classifies_int_case_insensitively() {
        let (kind, rest) = classify_steer_or_interrupt("!INT, please stop");
        assert_eq!(kind, SteerOrInterrupt::Interrupt);
        assert_eq!(rest, "please stop");
    }

    #[test]
    fn anything_else_is_steer() {
        let (kind, rest) = classify_steer_or_interrupt("keep going");
        assert_eq!(kind, SteerOrInterrupt::Steer);
        assert_eq!(rest, "keep going");
    }

    #[test]
    fn extracts_model_override_up_to_whitespace() {
        let (model, rest) = extract_model_override("!m:anthropic/claude-opus-4-5 hello there");
        assert_eq!(model.as_deref(), Some("anthropic/claude-opus-4-5"));
        assert_eq!(rest, "hello there");
    }

    #[test]
    fn no_override_present_returns_text_unchanged() {
        let (model, rest) = extract_model_override("just a message");
        assert!(model.is_none());
        assert_eq!(rest, "just a message");
    }

    #[test]
    fn override_precedence_prefers_per_request() {
        let resolved = resolve_model_override(Some("a"), Some("b"), Some("c"));
        assert_eq!(resolved.as_deref(), Some("a"));
    }

    #[test]
    fn override_precedence_falls_back_to_session_raw() {
        let resolved = resolve_model_override(None, Some("b"), Some("c"));
        assert_eq!(resolved.as_deref(), Some("b"));
    }

    #[test]
    fn override_precedence_falls_back_to_static_config() {
        let resolved = resolve_model_override(None, None, Some("c"));
        assert_eq!(resolved.as_deref(), Some("c"));
    }
}
