//! the authoritative TXT responder as a start/stop service

use std::net::SocketAddr;
use std::sync::Arc;

use crate::dns::context::ServerContext;
use crate::dns::server::{DnsServer, DnsTcpServer, DnsUdpServer, ServerError, ServerHandle};

type Result<T> = std::result::Result<T, ServerError>;

pub struct DnsResponder {
    context: Arc<ServerContext>,
    udp: Option<ServerHandle>,
    tcp: Option<ServerHandle>,
}

impl DnsResponder {
    pub fn new(context: Arc<ServerContext>) -> DnsResponder {
        DnsResponder {
            context,
            udp: None,
            tcp: None,
        }
    }

    /// Bind the enabled listeners and return once they are serving
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        if self.context.enable_udp {
            let server = DnsUdpServer::new(self.context.clone(), self.context.udp_thread_count);
            self.udp = Some(server.run_server()?);
        }

        if self.context.enable_tcp {
            let server = DnsTcpServer::new(self.context.clone(), self.context.tcp_thread_count);
            match server.run_server() {
                Ok(handle) => self.tcp = Some(handle),
                Err(err) => {
                    self.stop();
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Ask every thread to finish and wait for them. The context stays shut
    /// down, so a stopped responder is not restarted.
    pub fn stop(&mut self) {
        self.context.request_shutdown();
        self.wait();

        log::info!("DNS responder stopped");
    }

    /// Block until the listeners exit, which happens once shutdown is
    /// requested on the context
    pub fn wait(&mut self) {
        if let Some(handle) = self.udp.take() {
            handle.join();
        }
        if let Some(handle) = self.tcp.take() {
            handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.udp.is_some() || self.tcp.is_some()
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().map(|handle| handle.local_addr)
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().map(|handle| handle.local_addr)
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }
}

impl Drop for DnsResponder {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}
