//! The `ServerContext` in this module holds the common state across the server

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::store::model::DEFAULT_RECORD_TTL;
use crate::store::RecordStore;

#[derive(Default)]
pub struct ServerStatistics {
    pub tcp_query_count: AtomicUsize,
    pub udp_query_count: AtomicUsize,
    pub store_failure_count: AtomicUsize,
}

impl ServerStatistics {
    pub fn get_tcp_query_count(&self) -> usize {
        self.tcp_query_count.load(Ordering::Acquire)
    }

    pub fn get_udp_query_count(&self) -> usize {
        self.udp_query_count.load(Ordering::Acquire)
    }

    pub fn get_store_failure_count(&self) -> usize {
        self.store_failure_count.load(Ordering::Acquire)
    }
}

/// Shared by every listener and worker thread of one responder
pub struct ServerContext {
    pub store: Arc<dyn RecordStore>,
    pub dns_host: String,
    pub dns_port: u16,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub udp_thread_count: usize,
    pub tcp_thread_count: usize,
    /// Served when a stored TTL is out of range
    pub default_ttl: u32,
    pub statistics: ServerStatistics,
    shutdown: AtomicBool,
}

impl ServerContext {
    pub fn new(store: Arc<dyn RecordStore>) -> ServerContext {
        ServerContext {
            store,
            dns_host: "0.0.0.0".to_string(),
            dns_port: 53235,
            enable_udp: true,
            enable_tcp: true,
            udp_thread_count: 4,
            tcp_thread_count: 4,
            default_ttl: DEFAULT_RECORD_TTL,
            statistics: ServerStatistics::default(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn from_config(store: Arc<dyn RecordStore>, config: &Config) -> ServerContext {
        let mut context = ServerContext::new(store);
        context.dns_host = config.dns_host.clone();
        context.dns_port = config.dns_port;
        context.udp_thread_count = config.udp_threads.max(1);
        context.tcp_thread_count = config.tcp_threads.max(1);
        context
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use crate::store::MemoryStore;

    pub fn create_test_context(store: Arc<dyn RecordStore>) -> Arc<ServerContext> {
        let mut context = ServerContext::new(store);
        context.dns_host = "127.0.0.1".to_string();
        context.dns_port = 0;
        context.udp_thread_count = 1;
        context.tcp_thread_count = 1;

        Arc::new(context)
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.dns_port = 5353;
        config.udp_threads = 0;

        let context = ServerContext::from_config(Arc::new(MemoryStore::new()), &config);
        assert_eq!(5353, context.dns_port);
        assert_eq!(1, context.udp_thread_count);
        assert!(!context.is_shutting_down());

        context.request_shutdown();
        assert!(context.is_shutting_down());
    }
}
