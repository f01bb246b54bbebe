//! Prompt redaction for LLM calls.
//!
//! Strips raw personal data (card PANs, emails, phone numbers, IP addresses)
//! from any text that leaves the process toward an LLM or embedding
//! provider. Stable pseudonymous identifiers (hashed card ids, merchant ids,
//! device fingerprint hashes) pass through untouched so correlation still
//! works downstream.

use regex::Regex;
use std::sync::OnceLock;

fn pan_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{13,19}\b").expect("valid PAN regex"))
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid email regex")
    })
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\+?\d[\d\s().-]{7,14}\d").expect("valid phone regex")
    })
}

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("valid IPv4 regex")
    })
}

/// Redact raw personal data from text bound for an external provider.
///
/// Order matters: PANs are longer digit runs than phone numbers, so they are
/// replaced first.
pub fn redact(text: &str) -> String {
    let text = pan_re().replace_all(text, "[REDACTED-PAN]");
    let text = email_re().replace_all(&text, "[REDACTED-EMAIL]");
    let text = ipv4_re().replace_all(&text, "[REDACTED-IP]");
    let text = phone_re().replace_all(&text, "[REDACTED-PHONE]");
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_pan() {
        let out = redact("card 4111111111111111 declined");
        assert_eq!(out, "card [REDACTED-PAN] declined");
    }

    #[test]
    fn test_redacts_email_and_ip() {
        let out = redact("holder jane.doe@example.com from 203.0.113.7");
        assert!(out.contains("[REDACTED-EMAIL]"));
        assert!(out.contains("[REDACTED-IP]"));
        assert!(!out.contains("jane.doe"));
        assert!(!out.contains("203.0.113.7"));
    }

    #[test]
    fn test_redacts_phone() {
        let out = redact("callback +1 415-555-0100 requested");
        assert!(out.contains("[REDACTED-PHONE]"));
        assert!(!out.contains("555-0100"));
    }

    #[test]
    fn test_keeps_pseudonymous_identifiers() {
        let out = redact("card tok_burst_abc123 at merchant m_778 device fp_9c2d4e");
        assert_eq!(out, "card tok_burst_abc123 at merchant m_778 device fp_9c2d4e");
    }
}
