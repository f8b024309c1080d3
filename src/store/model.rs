//! persisted rows: domains, records and verifications

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::verification::challenge::{ChallengeFormat, ExternalProvider};

/// TTL used when a record carries none
pub const DEFAULT_RECORD_TTL: u32 = 300;

fn default_ttl() -> u32 {
    DEFAULT_RECORD_TTL
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub name: String,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "Domain::internal_source")]
    pub source: String,
}

impl Domain {
    pub fn new(name: &str) -> Domain {
        let now = Utc::now();
        Domain {
            id: Uuid::new_v4(),
            name: name.to_ascii_lowercase(),
            verified: false,
            verified_at: None,
            created_at: now,
            updated_at: now,
            source: Domain::internal_source(),
        }
    }

    fn internal_source() -> String {
        "internal".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    AAAA,
    CNAME,
    MX,
    TXT,
    SRV,
    NS,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            RecordType::A => "A",
            RecordType::AAAA => "AAAA",
            RecordType::CNAME => "CNAME",
            RecordType::MX => "MX",
            RecordType::TXT => "TXT",
            RecordType::SRV => "SRV",
            RecordType::NS => "NS",
        };
        f.write_str(name)
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<RecordType, String> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::AAAA),
            "CNAME" => Ok(RecordType::CNAME),
            "MX" => Ok(RecordType::MX),
            "TXT" => Ok(RecordType::TXT),
            "SRV" => Ok(RecordType::SRV),
            "NS" => Ok(RecordType::NS),
            other => Err(format!("unsupported record type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub domain: String,
    /// Subdomain label, `@` for the apex
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub value: String,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default = "default_active")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(
        domain: &Domain,
        name: &str,
        record_type: RecordType,
        value: &str,
        ttl: Option<u32>,
    ) -> Record {
        let now = Utc::now();
        Record {
            id: Uuid::new_v4(),
            domain_id: domain.id,
            domain: domain.name.clone(),
            name: name.trim().to_ascii_lowercase(),
            record_type,
            value: value.to_string(),
            ttl: ttl.unwrap_or(DEFAULT_RECORD_TTL),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Owner name of the record as it appears on the wire, without trailing dot
    pub fn fqdn(&self) -> String {
        let domain = self.domain.trim_end_matches('.').to_ascii_lowercase();
        let name = self.name.trim_end_matches('.').to_ascii_lowercase();

        if name.is_empty() || name == "@" || name == domain {
            domain
        } else if name.ends_with(&format!(".{}", domain)) {
            name
        } else {
            format!("{}.{}", name, domain)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Failed,
    Expired,
    ForceCompleted,
}

impl VerificationStatus {
    pub fn is_terminal(self) -> bool {
        self != VerificationStatus::Pending
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Failed => "failed",
            VerificationStatus::Expired => "expired",
            VerificationStatus::ForceCompleted => "force_completed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    OneLogin,
    Pds,
    Government,
    Other,
}

impl ServiceType {
    /// Services that get a callback when a verification reaches a terminal state
    pub fn requires_notification(self) -> bool {
        match self {
            ServiceType::OneLogin | ServiceType::Pds | ServiceType::Government => true,
            ServiceType::Other => false,
        }
    }

    pub fn challenge_format(self) -> ChallengeFormat {
        match self {
            ServiceType::OneLogin => ChallengeFormat::External(ExternalProvider::OneLogin),
            _ => ChallengeFormat::Native,
        }
    }
}

impl Default for ServiceType {
    fn default() -> Self {
        ServiceType::Pds
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            ServiceType::OneLogin => "onelogin",
            ServiceType::Pds => "pds",
            ServiceType::Government => "government",
            ServiceType::Other => "other",
        };
        f.write_str(name)
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<ServiceType, String> {
        match s.to_ascii_lowercase().as_str() {
            "onelogin" => Ok(ServiceType::OneLogin),
            "pds" => Ok(ServiceType::Pds),
            "government" => Ok(ServiceType::Government),
            "other" => Ok(ServiceType::Other),
            other => Err(format!("unknown service type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub id: Uuid,
    pub domain: String,
    pub token: String,
    pub txt_record: String,
    pub status: VerificationStatus,
    pub attempts: u32,
    pub service_type: ServiceType,
    pub service_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl Verification {
    pub fn challenge_format(&self) -> ChallengeFormat {
        self.service_type.challenge_format()
    }

    /// Whether the expiry instant has passed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> Record {
        let domain = Domain::new("Example.com");
        Record::new(&domain, name, RecordType::TXT, "v", None)
    }

    #[test]
    fn test_fqdn() {
        assert_eq!("example.com", record("@").fqdn());
        assert_eq!("_pds-verify.example.com", record("_pds-verify").fqdn());
        assert_eq!("_pds-verify.example.com", record("_pds-verify.example.com").fqdn());
        assert_eq!("a.b.example.com", record("A.B").fqdn());
    }

    #[test]
    fn test_default_ttl() {
        assert_eq!(DEFAULT_RECORD_TTL, record("@").ttl);

        let json = r#"{
            "id": "00000000-0000-0000-0000-000000000001",
            "domain_id": "00000000-0000-0000-0000-000000000002",
            "domain": "example.com",
            "name": "@",
            "type": "TXT",
            "value": "pds-verify=abc",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        }"#;
        let rec: Record = serde_json::from_str(json).unwrap();
        assert_eq!(300, rec.ttl);
        assert!(rec.active);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            "\"force_completed\"",
            serde_json::to_string(&VerificationStatus::ForceCompleted).unwrap()
        );
        assert!(!VerificationStatus::Pending.is_terminal());
        assert!(VerificationStatus::Expired.is_terminal());
    }

    #[test]
    fn test_service_type() {
        assert_eq!(Ok(ServiceType::OneLogin), "OneLogin".parse());
        assert!(!ServiceType::Other.requires_notification());
        assert_eq!(
            "\"onelogin\"",
            serde_json::to_string(&ServiceType::OneLogin).unwrap()
        );
    }
}
