//! outbound TXT lookups used as verification evidence

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dns::client::{ClientError, DnsClient, DnsNetworkClient};
use crate::dns::protocol::{QueryType, ResultCode};

type Result<T> = std::result::Result<T, ClientError>;

/// Answers the question "which TXT strings are published at this name right now"
pub trait TxtResolver: Send + Sync {
    /// One entry per TXT resource record, character-strings already joined.
    /// NXDOMAIN and empty answers are an empty list, never an error.
    fn lookup_txt(&self, name: &str) -> Result<Vec<String>>;
}

/// Queries a single upstream nameserver for every lookup without caching
pub struct UpstreamTxtResolver {
    client: Arc<dyn DnsClient>,
    host: String,
    port: u16,
}

impl UpstreamTxtResolver {
    pub fn new(client: Arc<dyn DnsClient>, host: &str, port: u16) -> UpstreamTxtResolver {
        UpstreamTxtResolver {
            client,
            host: host.to_string(),
            port,
        }
    }

    /// Bind a fresh network client on an ephemeral port and start its worker
    pub fn connect(host: &str, port: u16, timeout_ms: u64) -> Result<UpstreamTxtResolver> {
        let client = DnsNetworkClient::new(0, timeout_ms)?;
        client.run()?;

        Ok(UpstreamTxtResolver::new(Arc::new(client), host, port))
    }

    pub fn upstream(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

impl TxtResolver for UpstreamTxtResolver {
    fn lookup_txt(&self, name: &str) -> Result<Vec<String>> {
        let qname = name.trim_end_matches('.');
        let packet =
            self.client
                .send_query(qname, QueryType::Txt, (&self.host, self.port), true)?;

        match packet.header.rescode {
            ResultCode::NOERROR | ResultCode::NXDOMAIN => Ok(packet.txt_answers(qname)),
            ResultCode::REFUSED => Err(ClientError::Refused),
            rescode => {
                log::info!("Upstream answered {:?} for {}", rescode, qname);
                Err(ClientError::ServerFailure)
            }
        }
    }
}

#[derive(Clone)]
enum StaticAnswer {
    Values(Vec<String>),
    Failure,
}

/// In-process resolver holding scripted answers, for tooling and tests
#[derive(Default)]
pub struct StaticTxtResolver {
    answers: Mutex<HashMap<String, StaticAnswer>>,
    queries: Mutex<Vec<String>>,
}

impl StaticTxtResolver {
    pub fn new() -> StaticTxtResolver {
        StaticTxtResolver::default()
    }

    pub fn set(&self, name: &str, values: Vec<String>) {
        self.answers
            .lock()
            .insert(name.to_ascii_lowercase(), StaticAnswer::Values(values));
    }

    /// Make every lookup of `name` fail as if the upstream were unreachable
    pub fn fail(&self, name: &str) {
        self.answers
            .lock()
            .insert(name.to_ascii_lowercase(), StaticAnswer::Failure);
    }

    pub fn clear(&self, name: &str) {
        self.answers.lock().remove(&name.to_ascii_lowercase());
    }

    /// Names looked up so far, in order
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

impl TxtResolver for StaticTxtResolver {
    fn lookup_txt(&self, name: &str) -> Result<Vec<String>> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        self.queries.lock().push(name.clone());

        match self.answers.lock().get(&name).cloned() {
            Some(StaticAnswer::Values(values)) => Ok(values),
            Some(StaticAnswer::Failure) => Err(ClientError::TimeOut),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::client::tests::DnsStubClient;
    use crate::dns::protocol::{DnsPacket, DnsRecord};

    fn stub_resolver(rescode: ResultCode, answers: Vec<DnsRecord>) -> UpstreamTxtResolver {
        let client = DnsStubClient::new(Box::new(move |qname, qtype, _, _| {
            assert_eq!(QueryType::Txt, qtype);

            let mut packet = DnsPacket::new();
            packet.header.rescode = rescode;
            packet
                .questions
                .push(crate::dns::protocol::DnsQuestion::new(qname.to_string(), qtype));
            packet.answers = answers.clone();
            Ok(packet)
        }));

        UpstreamTxtResolver::new(Arc::new(client), "127.0.0.1", 53)
    }

    fn txt(domain: &str, data: &str) -> DnsRecord {
        DnsRecord::Txt {
            domain: domain.to_string(),
            data: data.to_string(),
            ttl: 300,
        }
    }

    #[test]
    fn test_txt_answers_are_returned() {
        let resolver = stub_resolver(
            ResultCode::NOERROR,
            vec![
                txt("_pds-verify.example.com", "pds-verify=abc"),
                txt("_pds-verify.example.com", "v=something"),
                txt("unrelated.example.com", "pds-verify=zzz"),
            ],
        );

        let values = resolver.lookup_txt("_pds-verify.example.com.").unwrap();
        assert_eq!(vec!["pds-verify=abc", "v=something"], values);
    }

    #[test]
    fn test_nxdomain_is_empty() {
        let resolver = stub_resolver(ResultCode::NXDOMAIN, Vec::new());
        assert!(resolver.lookup_txt("missing.example.com").unwrap().is_empty());
    }

    #[test]
    fn test_servfail_is_an_error() {
        let resolver = stub_resolver(ResultCode::SERVFAIL, Vec::new());
        assert!(matches!(
            resolver.lookup_txt("example.com"),
            Err(ClientError::ServerFailure)
        ));

        let resolver = stub_resolver(ResultCode::REFUSED, Vec::new());
        assert!(matches!(
            resolver.lookup_txt("example.com"),
            Err(ClientError::Refused)
        ));
    }

    #[test]
    fn test_static_resolver() {
        let resolver = StaticTxtResolver::new();
        resolver.set("Example.com", vec!["a".to_string()]);
        resolver.fail("broken.example.com");

        assert_eq!(vec!["a"], resolver.lookup_txt("example.com.").unwrap());
        assert!(resolver.lookup_txt("broken.example.com").is_err());
        assert!(resolver.lookup_txt("other.example.com").unwrap().is_empty());
        assert_eq!(3, resolver.queries().len());
    }
}
