//! drives verifications from challenge to a terminal outcome

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::Config;
use crate::dns::resolver::{TxtResolver, UpstreamTxtResolver};
use crate::store::model::{Domain, ServiceType, Verification, VerificationStatus};
use crate::store::{RecordStore, VerificationStore};
use crate::verification::challenge::{
    self, generate_token, normalize_domain, ChallengeFormat, ExternalProvider,
};
use crate::verification::evidence::EvidenceCollector;
use crate::verification::machine::{self, Step};
use crate::verification::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::verification::{Result, VerificationError};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Lifetime of a challenge, in seconds
    pub challenge_ttl: i64,
    /// Whether native challenges may also be proven through public DNS
    pub native_live_lookup: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            challenge_ttl: 86400,
            native_live_lookup: true,
        }
    }
}

/// What a caller needs to publish a challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub verification_id: Uuid,
    pub domain: String,
    pub token: String,
    pub txt_record_name: String,
    pub txt_record_value: String,
    pub expires_at: DateTime<Utc>,
    pub instructions: String,
}

impl From<&Verification> for Challenge {
    fn from(v: &Verification) -> Self {
        let txt_record_name = v.challenge_format().record_name(&v.domain);
        let instructions = format!(
            "Add a TXT record named {} with the value {} before {}",
            txt_record_name,
            v.txt_record,
            v.expires_at.to_rfc3339()
        );

        Challenge {
            verification_id: v.id,
            domain: v.domain.clone(),
            token: v.token.clone(),
            txt_record_name,
            txt_record_value: v.txt_record.clone(),
            expires_at: v.expires_at,
            instructions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptOutcome {
    pub verification_id: Uuid,
    pub domain: String,
    pub status: VerificationStatus,
    pub attempts_remaining: u32,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Verification> for AttemptOutcome {
    fn from(v: &Verification) -> Self {
        AttemptOutcome {
            verification_id: v.id,
            domain: v.domain.clone(),
            status: v.status,
            attempts_remaining: machine::attempts_remaining(v),
            completed_at: v.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub success: bool,
    pub status: VerificationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalOutcome {
    pub status: VerificationStatus,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetOutcome {
    pub domain: String,
    pub removed: usize,
}

/// How a caller names a verification when asking for its status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationRef {
    Id(Uuid),
    Token(String),
}

impl VerificationRef {
    /// A UUID is an id, anything else is taken as a token
    pub fn parse(reference: &str) -> VerificationRef {
        match Uuid::parse_str(reference.trim()) {
            Ok(id) => VerificationRef::Id(id),
            Err(_) => VerificationRef::Token(reference.trim().to_ascii_lowercase()),
        }
    }
}

pub struct VerificationEngine {
    records: Arc<dyn RecordStore>,
    verifications: Arc<dyn VerificationStore>,
    evidence: EvidenceCollector,
    notifier: Arc<dyn Notifier>,
    challenge_ttl: Duration,
}

impl VerificationEngine {
    pub fn new(
        records: Arc<dyn RecordStore>,
        verifications: Arc<dyn VerificationStore>,
        resolver: Arc<dyn TxtResolver>,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
    ) -> VerificationEngine {
        VerificationEngine {
            evidence: EvidenceCollector::new(records.clone(), resolver, settings.native_live_lookup),
            records,
            verifications,
            notifier,
            challenge_ttl: Duration::seconds(settings.challenge_ttl),
        }
    }

    /// Wire the engine the way the binaries run it: live lookups against the
    /// configured upstream, webhook delivery when a URL is set
    pub fn from_config<S>(
        store: Arc<S>,
        config: &Config,
    ) -> std::result::Result<VerificationEngine, Box<dyn std::error::Error>>
    where
        S: RecordStore + VerificationStore + 'static,
    {
        let (host, port) = config.upstream()?;
        let resolver = UpstreamTxtResolver::connect(&host, port, config.dns_lookup_timeout_ms)?;

        let notifier: Arc<dyn Notifier> = match config.webhook_url {
            Some(ref url) => Arc::new(WebhookNotifier::new(url, config.webhook_timeout())),
            None => Arc::new(LogNotifier),
        };

        let settings = EngineSettings {
            challenge_ttl: config.challenge_token_expiry,
            native_live_lookup: config.native_live_lookup,
        };

        Ok(VerificationEngine::new(
            store.clone(),
            store,
            Arc::new(resolver),
            notifier,
            settings,
        ))
    }

    fn validate_domain(domain: &str) -> Result<String> {
        normalize_domain(domain).ok_or_else(|| VerificationError::InvalidDomain(domain.to_string()))
    }

    fn new_verification(
        &self,
        domain: &str,
        service_type: ServiceType,
        service_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Verification {
        self.new_verification_with_token(domain, &generate_token(), service_type, service_id, now)
    }

    fn new_verification_with_token(
        &self,
        domain: &str,
        token: &str,
        service_type: ServiceType,
        service_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Verification {
        Verification {
            id: Uuid::new_v4(),
            domain: domain.to_string(),
            token: token.to_string(),
            txt_record: service_type.challenge_format().format(token),
            status: VerificationStatus::Pending,
            attempts: 0,
            service_type,
            service_id: service_id.map(|s| s.to_string()),
            created_at: now,
            expires_at: now + self.challenge_ttl,
            completed_at: None,
            verified_at: None,
        }
    }

    fn load(&self, id: Uuid) -> Result<Verification> {
        self.verifications
            .get_verification(id)?
            .ok_or_else(|| VerificationError::NotFound(format!("verification {}", id)))
    }

    /// Issue a challenge for `domain`, or hand back the one still pending for
    /// the same service
    pub fn generate_challenge(
        &self,
        domain: &str,
        service_type: ServiceType,
        service_id: Option<&str>,
    ) -> Result<Challenge> {
        let domain = Self::validate_domain(domain)?;

        self.records.insert_domain(Domain::new(&domain))?;

        loop {
            let now = Utc::now();
            let candidate = self.new_verification(&domain, service_type, service_id, now);
            let stored = self
                .verifications
                .insert_pending_verification(candidate.clone())?;

            if stored.id == candidate.id {
                log::info!(
                    "Issued challenge {} for {} ({})",
                    stored.id,
                    domain,
                    stored.service_type
                );
                return Ok(Challenge::from(&stored));
            }

            // a lapsed pending challenge is closed out before a new one is issued
            match machine::begin_attempt(&stored, now) {
                Step::Expire(expired) => {
                    if self
                        .verifications
                        .compare_and_swap_verification(&stored, &expired)?
                    {
                        log::info!("Challenge {} for {} expired", expired.id, domain);
                        self.on_terminal(&expired);
                    }
                }
                _ => return Ok(Challenge::from(&stored)),
            }
        }
    }

    /// Run one verification attempt against the current evidence
    pub fn attempt_verification(&self, id: Uuid) -> Result<AttemptOutcome> {
        let (previous, reserved) = loop {
            let current = self.load(id)?;

            match machine::begin_attempt(&current, Utc::now()) {
                Step::Terminal => {
                    if current.status == VerificationStatus::Verified {
                        self.repair_domain_flag(&current)?;
                    }
                    return Ok(AttemptOutcome::from(&current));
                }
                Step::Expire(expired) => {
                    if self
                        .verifications
                        .compare_and_swap_verification(&current, &expired)?
                    {
                        log::info!("Verification {} for {} expired", id, expired.domain);
                        self.on_terminal(&expired);
                        return Ok(AttemptOutcome::from(&expired));
                    }
                }
                // the final attempt never concluded, settle it without reserving
                Step::Exhausted => break (current.clone(), current),
                Step::Reserve(reserved) => {
                    if self
                        .verifications
                        .compare_and_swap_verification(&current, &reserved)?
                    {
                        break (current, reserved);
                    }
                }
            }
        };

        let evidence = match self.evidence.find(&reserved) {
            Ok(evidence) => evidence,
            Err(err) => {
                // a store outage must not burn an attempt
                if previous.attempts != reserved.attempts {
                    match self
                        .verifications
                        .compare_and_swap_verification(&reserved, &previous)
                    {
                        Ok(true) => {}
                        Ok(false) => log::debug!("Verification {} moved before release", id),
                        Err(e) => log::warn!("Failed to release attempt on {}: {}", id, e),
                    }
                }
                return Err(err.into());
            }
        };
        let matched = evidence.is_some();
        log::info!(
            "Attempt {} of {} for {}: {}",
            reserved.attempts,
            machine::MAX_ATTEMPTS,
            reserved.domain,
            match evidence {
                Some(source) => format!("matched via {:?}", source),
                None => "no match".to_string(),
            }
        );

        let mut base = reserved;
        loop {
            let next = match machine::conclude(&base, matched, Utc::now()) {
                Some(next) => next,
                None => return Ok(AttemptOutcome::from(&base)),
            };

            if self
                .verifications
                .compare_and_swap_verification(&base, &next)?
            {
                log::info!("Verification {} for {} is {}", id, next.domain, next.status);
                self.on_terminal(&next);
                if next.status == VerificationStatus::Verified {
                    self.mark_domain_verified(&next.domain, "internal")?;
                }
                return Ok(AttemptOutcome::from(&next));
            }

            // a concurrent attempt moved the row, conclude against what it left
            base = self.load(id)?;
            if base.status.is_terminal() {
                return Ok(AttemptOutcome::from(&base));
            }
        }
    }

    /// Resolve the reference and run an attempt on it
    pub fn check_status(&self, reference: &VerificationRef) -> Result<AttemptOutcome> {
        let verification = match *reference {
            VerificationRef::Id(id) => self.load(id)?,
            VerificationRef::Token(ref token) => self.verification_by_token(token)?,
        };

        self.attempt_verification(verification.id)
    }

    pub fn complete_verification(
        &self,
        id: Uuid,
        service_id: Option<&str>,
        force: bool,
    ) -> Result<Completion> {
        loop {
            let current = self.load(id)?;

            if let Some(service_id) = service_id {
                if current.service_id.as_deref() != Some(service_id) {
                    return Err(VerificationError::ServiceMismatch);
                }
            }

            match current.status {
                VerificationStatus::Pending if !force => {
                    let outcome = self.attempt_verification(id)?;
                    return Ok(Completion {
                        success: outcome.status == VerificationStatus::Verified,
                        status: outcome.status,
                    });
                }
                VerificationStatus::Pending => {
                    let forced = match machine::force_complete(&current, Utc::now()) {
                        Some(forced) => forced,
                        None => continue,
                    };

                    if self
                        .verifications
                        .compare_and_swap_verification(&current, &forced)?
                    {
                        log::info!("Verification {} for {} force completed", id, forced.domain);
                        self.on_terminal(&forced);
                        return Ok(Completion {
                            success: true,
                            status: forced.status,
                        });
                    }
                }
                VerificationStatus::Verified => {
                    return Ok(Completion {
                        success: true,
                        status: current.status,
                    });
                }
                VerificationStatus::ForceCompleted if force => {
                    return Ok(Completion {
                        success: true,
                        status: current.status,
                    });
                }
                status => return Err(VerificationError::AlreadyTerminal(status)),
            }
        }
    }

    /// Check a challenge published for an external provider, registering the
    /// domain on first success
    pub fn verify_external(
        &self,
        domain: &str,
        token: &str,
        provider: ExternalProvider,
    ) -> Result<ExternalOutcome> {
        let domain = Self::validate_domain(domain)?;
        let token = token.trim().to_ascii_lowercase();
        let format = ChallengeFormat::External(provider);

        // a token is bound to one domain for life
        if let Some(existing) = self.verifications.find_by_token(&token)? {
            if existing.domain != domain {
                return Err(VerificationError::NotFound(format!(
                    "token {} for {}",
                    token, domain
                )));
            }

            let outcome = self.attempt_verification(existing.id)?;
            return Ok(ExternalOutcome {
                status: outcome.status,
                domain,
            });
        }

        if !self.evidence.in_public_dns(&domain, &token, format) {
            log::info!("{} challenge for {} not found", provider.name(), domain);
            return Ok(ExternalOutcome {
                status: VerificationStatus::Failed,
                domain,
            });
        }

        let now = Utc::now();
        let mut verification = self.new_verification_with_token(
            &domain,
            &token,
            ServiceType::OneLogin,
            None,
            now,
        );
        verification.status = VerificationStatus::Verified;
        verification.attempts = 1;
        verification.completed_at = Some(now);
        verification.verified_at = Some(now);

        self.mark_domain_verified(&domain, provider.name())?;
        self.verifications.insert_verification(verification)?;
        log::info!("Domain {} verified through {}", domain, provider.name());

        Ok(ExternalOutcome {
            status: VerificationStatus::Verified,
            domain,
        })
    }

    /// Forget every verification of a domain and clear its verified flag
    pub fn reset_verification(&self, domain: &str) -> Result<ResetOutcome> {
        let name = normalize_domain(domain).unwrap_or_else(|| domain.trim().to_ascii_lowercase());

        if self.records.find_domain_by_name(&name)?.is_none() {
            return Err(VerificationError::NotFound(format!("domain {}", name)));
        }

        let removed = self.verifications.delete_for_domain(&name)?;
        self.records.set_domain_verified(&name, false)?;
        log::info!("Reset {} verification(s) for {}", removed, name);

        Ok(ResetOutcome {
            domain: name,
            removed,
        })
    }

    pub fn verifications_for_domain(&self, domain: &str) -> Result<Vec<Verification>> {
        let name = normalize_domain(domain).unwrap_or_else(|| domain.trim().to_ascii_lowercase());
        Ok(self.verifications.find_by_domain(&name)?)
    }

    pub fn verification_by_token(&self, token: &str) -> Result<Verification> {
        self.verifications
            .find_by_token(token)?
            .ok_or_else(|| VerificationError::NotFound(format!("token {}", token)))
    }

    pub fn pending_verifications(&self) -> Result<Vec<Verification>> {
        Ok(self.verifications.list_pending()?)
    }

    pub fn format_txt_record(&self, token: &str) -> String {
        challenge::format_txt_record(token)
    }

    fn mark_domain_verified(&self, domain: &str, source: &str) -> Result<()> {
        let mut row = Domain::new(domain);
        row.source = source.to_string();

        self.records.insert_domain(row)?;
        self.records.set_domain_verified(domain, true)?;

        Ok(())
    }

    // a verified row whose domain flag write failed is fixed on the next look
    fn repair_domain_flag(&self, verification: &Verification) -> Result<()> {
        match self.records.find_domain_by_name(&verification.domain)? {
            Some(ref domain) if domain.verified => Ok(()),
            _ => {
                log::warn!("Domain {} was not flagged verified, repairing", verification.domain);
                self.mark_domain_verified(&verification.domain, "internal")
            }
        }
    }

    fn on_terminal(&self, verification: &Verification) {
        if verification.service_type.requires_notification() {
            self.notifier.notify(verification.into());
        }
    }
}
