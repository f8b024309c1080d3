//! Integration tests for the TXT responder
//!
//! Every test binds real UDP and TCP listeners on ephemeral loopback ports
//! and talks to them with the network client.

use std::sync::Arc;

use uuid::Uuid;

use pdsdns::dns::client::{DnsClient, DnsNetworkClient};
use pdsdns::dns::context::ServerContext;
use pdsdns::dns::protocol::{DnsRecord, QueryType, ResultCode};
use pdsdns::dns::responder::DnsResponder;
use pdsdns::store::{
    self, Domain, MemoryStore, Record, RecordStore, RecordType, StoreError, TxtAnswer,
};

fn start_responder(store: Arc<dyn RecordStore>) -> DnsResponder {
    let mut context = ServerContext::new(store);
    context.dns_host = "127.0.0.1".to_string();
    context.dns_port = 0;
    context.udp_thread_count = 2;
    context.tcp_thread_count = 2;

    let mut responder = DnsResponder::new(Arc::new(context));
    responder.start().expect("Failed to start responder");
    responder
}

fn client() -> DnsNetworkClient {
    let client = DnsNetworkClient::new(0, 2000).expect("Failed to bind client");
    client.run().expect("Failed to start client worker");
    client
}

fn store_with_records() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let domain = store.insert_domain(Domain::new("example.com")).unwrap();

    store
        .insert_record(Record::new(
            &domain,
            "_pds-verify",
            RecordType::TXT,
            "pds-verify=first",
            Some(120),
        ))
        .unwrap();
    store
        .insert_record(Record::new(
            &domain,
            "_pds-verify",
            RecordType::TXT,
            "pds-verify=second",
            None,
        ))
        .unwrap();
    store
        .insert_record(Record::new(&domain, "@", RecordType::A, "192.0.2.1", None))
        .unwrap();

    store
}

fn txt_values(answers: &[DnsRecord]) -> Vec<String> {
    let mut values: Vec<String> = answers
        .iter()
        .filter_map(|rec| match *rec {
            DnsRecord::Txt { ref data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect();
    values.sort();
    values
}

struct UnavailableStore;

impl RecordStore for UnavailableStore {
    fn find_active_txt_records(&self, _name: &str) -> store::Result<Vec<TxtAnswer>> {
        Err(StoreError::Unavailable("database is down".to_string()))
    }

    fn find_records_for_domain(&self, _domain_id: Uuid) -> store::Result<Vec<Record>> {
        Err(StoreError::Unavailable("database is down".to_string()))
    }

    fn insert_record(&self, _record: Record) -> store::Result<Record> {
        Err(StoreError::Unavailable("database is down".to_string()))
    }

    fn set_record_active(&self, _record_id: Uuid, _active: bool) -> store::Result<Record> {
        Err(StoreError::Unavailable("database is down".to_string()))
    }

    fn find_domain_by_name(&self, _name: &str) -> store::Result<Option<Domain>> {
        Err(StoreError::Unavailable("database is down".to_string()))
    }

    fn insert_domain(&self, _domain: Domain) -> store::Result<Domain> {
        Err(StoreError::Unavailable("database is down".to_string()))
    }

    fn list_domains(&self) -> store::Result<Vec<Domain>> {
        Err(StoreError::Unavailable("database is down".to_string()))
    }

    fn set_domain_verified(&self, _name: &str, _verified: bool) -> store::Result<Domain> {
        Err(StoreError::Unavailable("database is down".to_string()))
    }
}

#[test]
fn test_txt_answers_over_udp_and_tcp() {
    let responder = start_responder(store_with_records());
    let udp = responder.udp_addr().unwrap();
    let tcp = responder.tcp_addr().unwrap();
    let client = client();

    let res = client
        .send_udp_query("_pds-verify.example.com", QueryType::Txt, ("127.0.0.1", udp.port()), false)
        .unwrap();
    assert_eq!(ResultCode::NOERROR, res.header.rescode);
    assert!(res.header.authoritative_answer);
    assert_eq!(
        vec!["pds-verify=first".to_string(), "pds-verify=second".to_string()],
        txt_values(&res.answers)
    );

    let ttls: Vec<u32> = res.answers.iter().map(|rec| rec.get_ttl()).collect();
    assert!(ttls.contains(&120));
    assert!(ttls.contains(&300));

    let res = client
        .send_tcp_query("_PDS-VERIFY.Example.COM", QueryType::Txt, ("127.0.0.1", tcp.port()), false)
        .unwrap();
    assert_eq!(ResultCode::NOERROR, res.header.rescode);
    assert_eq!(2, res.answers.len());

    let stats = &responder.context().statistics;
    assert_eq!(1, stats.get_udp_query_count());
    assert_eq!(1, stats.get_tcp_query_count());
}

#[test]
fn test_unknown_name_and_other_types_are_empty() {
    let responder = start_responder(store_with_records());
    let port = responder.udp_addr().unwrap().port();
    let client = client();

    let res = client
        .send_udp_query("nothing.example.com", QueryType::Txt, ("127.0.0.1", port), false)
        .unwrap();
    assert_eq!(ResultCode::NOERROR, res.header.rescode);
    assert!(res.answers.is_empty());

    // A records exist in the store but only TXT is served
    let res = client
        .send_udp_query("example.com", QueryType::A, ("127.0.0.1", port), false)
        .unwrap();
    assert_eq!(ResultCode::NOERROR, res.header.rescode);
    assert!(res.answers.is_empty());
    assert_eq!(1, res.questions.len());
}

#[test]
fn test_deactivated_record_is_not_served() {
    let store = store_with_records();
    let responder = start_responder(store.clone());
    let port = responder.udp_addr().unwrap().port();
    let client = client();

    let domain = store.find_domain_by_name("example.com").unwrap().unwrap();
    let first = store
        .find_records_for_domain(domain.id)
        .unwrap()
        .into_iter()
        .find(|rec| rec.value == "pds-verify=first")
        .unwrap();
    store.set_record_active(first.id, false).unwrap();

    let res = client
        .send_udp_query("_pds-verify.example.com", QueryType::Txt, ("127.0.0.1", port), false)
        .unwrap();
    assert_eq!(vec!["pds-verify=second".to_string()], txt_values(&res.answers));
}

#[test]
fn test_store_failure_answers_empty() {
    let responder = start_responder(Arc::new(UnavailableStore));
    let port = responder.udp_addr().unwrap().port();
    let client = client();

    let res = client
        .send_udp_query("_pds-verify.example.com", QueryType::Txt, ("127.0.0.1", port), false)
        .unwrap();
    assert_eq!(ResultCode::NOERROR, res.header.rescode);
    assert!(res.answers.is_empty());
    assert_eq!(1, responder.context().statistics.get_store_failure_count());
}

#[test]
fn test_stop_releases_listeners() {
    let mut responder = start_responder(store_with_records());
    assert!(responder.is_running());

    responder.stop();
    assert!(!responder.is_running());
    assert!(responder.context().is_shutting_down());
    assert_eq!(None, responder.udp_addr());
}
