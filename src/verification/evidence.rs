//! where proof of a challenge is looked for

use std::sync::Arc;

use crate::dns::resolver::TxtResolver;
use crate::store::model::{RecordType, Verification};
use crate::store::{RecordStore, Result};
use crate::verification::challenge::ChallengeFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evidence {
    /// An active TXT record held by this service
    RecordStore,
    /// A TXT record published in public DNS
    LiveLookup,
}

pub struct EvidenceCollector {
    records: Arc<dyn RecordStore>,
    resolver: Arc<dyn TxtResolver>,
    native_live_lookup: bool,
}

impl EvidenceCollector {
    pub fn new(
        records: Arc<dyn RecordStore>,
        resolver: Arc<dyn TxtResolver>,
        native_live_lookup: bool,
    ) -> EvidenceCollector {
        EvidenceCollector {
            records,
            resolver,
            native_live_lookup,
        }
    }

    /// First matching source wins. Only store failures are errors; a failed
    /// live lookup is logged and treated as a miss.
    pub fn find(&self, verification: &Verification) -> Result<Option<Evidence>> {
        let format = verification.challenge_format();

        if self.in_record_store(verification, format)? {
            return Ok(Some(Evidence::RecordStore));
        }

        let live = match format {
            ChallengeFormat::Native => self.native_live_lookup,
            ChallengeFormat::External(_) => true,
        };
        if live && self.in_public_dns(&verification.domain, &verification.token, format) {
            return Ok(Some(Evidence::LiveLookup));
        }

        Ok(None)
    }

    fn in_record_store(&self, verification: &Verification, format: ChallengeFormat) -> Result<bool> {
        let domain = match self.records.find_domain_by_name(&verification.domain)? {
            Some(domain) => domain,
            None => return Ok(false),
        };

        let found = self
            .records
            .find_records_for_domain(domain.id)?
            .iter()
            .filter(|rec| rec.active && rec.record_type == RecordType::TXT)
            .any(|rec| {
                ChallengeFormat::Native.matches(&rec.value, &verification.token)
                    || format.matches(&rec.value, &verification.token)
            });

        Ok(found)
    }

    /// Look for `token` in the TXT records published for `domain` under `format`
    pub fn in_public_dns(&self, domain: &str, token: &str, format: ChallengeFormat) -> bool {
        let name = format.record_name(domain);

        match self.resolver.lookup_txt(&name) {
            Ok(values) => values.iter().any(|value| format.matches(value, token)),
            Err(err) => {
                log::warn!("TXT lookup for {} failed, counting as a miss: {}", name, err);
                false
            }
        }
    }
}
