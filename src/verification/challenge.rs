//! challenge tokens and the TXT conventions that carry them

use lazy_static::lazy_static;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Prefix of the native TXT value, `pds-verify=<token>`
pub const NATIVE_PREFIX: &str = "pds-verify=";

/// Label prepended to the domain for the native TXT record
pub const NATIVE_RECORD_LABEL: &str = "_pds-verify";

/// Random bytes per token; rendered as twice as many hex characters
pub const TOKEN_BYTES: usize = 32;

const MAX_DOMAIN_LEN: usize = 253;

lazy_static! {
    static ref DOMAIN_PATTERN: Regex =
        Regex::new(r"^([a-z0-9]([a-z0-9\-]{0,61}[a-z0-9])?\.)+[a-z]{2,}$")
            .expect("Failed to compile domain regex");
    static ref NATIVE_TOKEN_PATTERN: Regex =
        Regex::new(r"pds-verify=([a-f0-9]+)").expect("Failed to compile token regex");
}

/// Trim and lowercase a domain, returning it only if it is a valid hostname
pub fn normalize_domain(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();

    if domain.len() > MAX_DOMAIN_LEN || !DOMAIN_PATTERN.is_match(&domain) {
        return None;
    }

    Some(domain)
}

/// 32 bytes from the operating system generator, as lowercase hex
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);

    hex::encode(bytes)
}

pub fn format_txt_record(token: &str) -> String {
    ChallengeFormat::Native.format(token)
}

/// Pull the token out of a native TXT value, if it carries one
pub fn extract_verification_token(value: &str) -> Option<String> {
    NATIVE_TOKEN_PATTERN
        .captures(value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalProvider {
    OneLogin,
}

impl ExternalProvider {
    pub fn prefix(self) -> &'static str {
        match self {
            ExternalProvider::OneLogin => "onelogin-domain-verification=",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ExternalProvider::OneLogin => "onelogin",
        }
    }
}

impl std::str::FromStr for ExternalProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<ExternalProvider, String> {
        match s.to_ascii_lowercase().as_str() {
            "onelogin" => Ok(ExternalProvider::OneLogin),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// Where a challenge is published and what its TXT value looks like
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeFormat {
    Native,
    External(ExternalProvider),
}

impl ChallengeFormat {
    pub fn prefix(self) -> &'static str {
        match self {
            ChallengeFormat::Native => NATIVE_PREFIX,
            ChallengeFormat::External(provider) => provider.prefix(),
        }
    }

    pub fn format(self, token: &str) -> String {
        format!("{}{}", self.prefix(), token)
    }

    /// The owner name the TXT record is expected at
    pub fn record_name(self, domain: &str) -> String {
        match self {
            ChallengeFormat::Native => format!("{}.{}", NATIVE_RECORD_LABEL, domain),
            ChallengeFormat::External(_) => domain.to_string(),
        }
    }

    /// Whether a published TXT value proves `token`. A value may hold several
    /// whitespace separated entries; one of them must equal the expected value.
    pub fn matches(self, value: &str, token: &str) -> bool {
        let expected = self.format(token);
        value.split_whitespace().any(|part| part == expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_validation() {
        assert_eq!(Some("example.com".to_string()), normalize_domain(" Example.COM "));
        assert_eq!(Some("a-b.example.co".to_string()), normalize_domain("a-b.example.co."));

        assert_eq!(None, normalize_domain("localhost"));
        assert_eq!(None, normalize_domain("-bad.example.com"));
        assert_eq!(None, normalize_domain("bad-.example.com"));
        assert_eq!(None, normalize_domain("example.c0m"));
        assert_eq!(None, normalize_domain("exa mple.com"));
        assert_eq!(None, normalize_domain(""));

        let long_label = format!("{}.com", "a".repeat(64));
        assert_eq!(None, normalize_domain(&long_label));

        let too_long = format!("{}com", "abcdefghi.".repeat(26));
        assert!(too_long.len() > 253);
        assert_eq!(None, normalize_domain(&too_long));
    }

    #[test]
    fn test_tokens_are_hex_and_unique() {
        let a = generate_token();
        let b = generate_token();

        assert_eq!(64, a.len());
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_format_and_extract() {
        let token = "00ff".repeat(16);
        let value = format_txt_record(&token);

        assert_eq!(format!("pds-verify={}", token), value);
        assert_eq!(Some(token), extract_verification_token(&value));
        assert_eq!(None, extract_verification_token("v=spf1 -all"));
    }

    #[test]
    fn test_matches_whole_entries_only() {
        let token = "abc123";
        let native = ChallengeFormat::Native;

        assert!(native.matches("pds-verify=abc123", token));
        assert!(native.matches("v=spf1 pds-verify=abc123 other", token));
        assert!(!native.matches("pds-verify=abc1234", token));
        assert!(!native.matches("xpds-verify=abc123", token));
        assert!(!native.matches("onelogin-domain-verification=abc123", token));

        let onelogin = ChallengeFormat::External(ExternalProvider::OneLogin);
        assert!(onelogin.matches("onelogin-domain-verification=abc123", token));
        assert!(!onelogin.matches("pds-verify=abc123", token));
    }

    #[test]
    fn test_record_names() {
        assert_eq!(
            "_pds-verify.example.com",
            ChallengeFormat::Native.record_name("example.com")
        );
        assert_eq!(
            "example.com",
            ChallengeFormat::External(ExternalProvider::OneLogin).record_name("example.com")
        );
    }
}
