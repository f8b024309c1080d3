//! client for sending DNS queries to other servers

use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::Builder;
use std::time::Duration as StdDuration;

use chrono::*;
use derive_more::{Display, Error, From};

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer, StreamPacketBuffer};
use crate::dns::netutil::{read_packet_length, write_packet_length};
use crate::dns::protocol::{DnsPacket, DnsQuestion, QueryType};

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Protocol(crate::dns::protocol::ProtocolError),
    Io(std::io::Error),
    PoisonedLock,
    LookupFailed,
    TimeOut,
    ServerFailure,
    Refused,
}

type Result<T> = std::result::Result<T, ClientError>;

/// How often the response thread wakes up to expire stale queries
const POLL_INTERVAL_MS: u64 = 100;

pub trait DnsClient: Send + Sync {
    fn get_sent_count(&self) -> usize;
    fn get_failed_count(&self) -> usize;

    fn run(&self) -> Result<()>;
    fn send_query(
        &self,
        qname: &str,
        qtype: QueryType,
        server: (&str, u16),
        recursive: bool,
    ) -> Result<DnsPacket>;
}

/// The UDP client
///
/// This includes a fair bit of synchronization due to the stateless nature of UDP.
/// When many queries are sent in parallell, the response packets can come back
/// in any order. For that reason, we fire off queries on the sending thread, but
/// handle replies on a single thread. A channel is created for every response,
/// and the caller will block on the channel until a response is received or the
/// query times out.
#[derive(Clone)]
pub struct DnsNetworkClient {
    total_sent: Arc<AtomicUsize>,
    total_failed: Arc<AtomicUsize>,

    /// The listener socket
    socket: Arc<UdpSocket>,

    /// Queries in progress
    pending_queries: Arc<Mutex<Vec<PendingQuery>>>,

    timeout: Duration,
}

/// A query in progress. This struct holds the `id` of the request, what was
/// asked and of whom, and a channel endpoint for returning a response back to
/// the thread from which the query was posed.
struct PendingQuery {
    seq: u16,
    server: SocketAddr,
    qname: String,
    qtype: QueryType,
    timestamp: DateTime<Local>,
    tx: Sender<Option<DnsPacket>>,
}

impl PendingQuery {
    /// A response belongs to this query only if it carries our id, comes
    /// from the server we asked and echoes the question
    fn answered_by(&self, packet: &DnsPacket, src: SocketAddr) -> bool {
        if self.seq != packet.header.id || self.server != src {
            return false;
        }

        match packet.questions.first() {
            Some(question) => {
                question.qtype == self.qtype && question.name.eq_ignore_ascii_case(&self.qname)
            }
            None => false,
        }
    }
}

impl DnsNetworkClient {
    pub fn new(port: u16, timeout_ms: u64) -> Result<DnsNetworkClient> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(StdDuration::from_millis(POLL_INTERVAL_MS)))?;

        if let Ok(local_addr) = socket.local_addr() {
            log::debug!("DNS client bound to port {}", local_addr.port());
        }

        Ok(DnsNetworkClient {
            total_sent: Arc::new(AtomicUsize::new(0)),
            total_failed: Arc::new(AtomicUsize::new(0)),
            socket: Arc::new(socket),
            pending_queries: Arc::new(Mutex::new(Vec::new())),
            timeout: Duration::milliseconds(timeout_ms as i64),
        })
    }

    fn build_query(&self, qname: &str, qtype: QueryType, recursive: bool) -> DnsPacket {
        let mut packet = DnsPacket::new();

        packet.header.id = rand::random::<u16>();
        packet.header.questions = 1;
        packet.header.recursion_desired = recursive;

        packet
            .questions
            .push(DnsQuestion::new(qname.to_string(), qtype));

        packet
    }

    fn std_timeout(&self) -> StdDuration {
        self.timeout.to_std().unwrap_or(StdDuration::from_secs(3))
    }

    /// Send a DNS query using TCP transport
    ///
    /// This is much simpler than using UDP, since the kernel will take care of
    /// packet ordering and connection state. Connect, read and write are all
    /// bounded by the client timeout.
    pub fn send_tcp_query(
        &self,
        qname: &str,
        qtype: QueryType,
        server: (&str, u16),
        recursive: bool,
    ) -> Result<DnsPacket> {
        let _ = self.total_sent.fetch_add(1, Ordering::Release);

        let mut packet = self.build_query(qname, qtype, recursive);

        let mut req_buffer = BytePacketBuffer::new();
        packet.write(&mut req_buffer, 0xFFFF)?;

        let addr: SocketAddr = server
            .to_socket_addrs()?
            .next()
            .ok_or(ClientError::LookupFailed)?;

        let timeout = self.std_timeout();
        let mut socket = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            let _ = self.total_failed.fetch_add(1, Ordering::Release);
            log::info!("Failed to connect to {} for {}: {}", addr, qname, e);
            e
        })?;
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))?;

        write_packet_length(&mut socket, req_buffer.pos())?;
        socket.write_all(&req_buffer.buf[0..req_buffer.pos])?;
        socket.flush()?;

        let _ = read_packet_length(&mut socket)?;

        let mut stream_buffer = StreamPacketBuffer::new(&mut socket);
        let packet = DnsPacket::from_buffer(&mut stream_buffer)?;

        Ok(packet)
    }

    /// Send a DNS query using UDP transport
    ///
    /// This will construct a query packet, and fire it off to the specified server.
    /// The query is sent from the callee thread, but responses are read on a
    /// worker thread, and returned to this thread through a channel. Thus this
    /// method is thread safe, and can be used from any number of threads in
    /// parallell.
    pub fn send_udp_query(
        &self,
        qname: &str,
        qtype: QueryType,
        server: (&str, u16),
        recursive: bool,
    ) -> Result<DnsPacket> {
        let _ = self.total_sent.fetch_add(1, Ordering::Release);

        let mut packet = self.build_query(qname, qtype, recursive);

        let addr: SocketAddr = server
            .to_socket_addrs()?
            .next()
            .ok_or(ClientError::LookupFailed)?;

        // Create a return channel, and add a `PendingQuery` to the list of lookups
        // in progress
        let (tx, rx) = channel();
        {
            let mut pending_queries = self
                .pending_queries
                .lock()
                .map_err(|_| ClientError::PoisonedLock)?;

            // ids of queries in flight stay distinct
            while pending_queries.iter().any(|q| q.seq == packet.header.id) {
                packet.header.id = rand::random::<u16>();
            }

            pending_queries.push(PendingQuery {
                seq: packet.header.id,
                server: addr,
                qname: qname.to_ascii_lowercase(),
                qtype,
                timestamp: Local::now(),
                tx,
            });
        }

        let mut req_buffer = BytePacketBuffer::new();
        packet.write(&mut req_buffer, 512)?;
        self.socket.send_to(&req_buffer.buf[0..req_buffer.pos], addr)?;

        // the worker answers with None on expiry, the extra margin only guards
        // against the worker having gone away
        let deadline = self.std_timeout() + StdDuration::from_millis(POLL_INTERVAL_MS * 2);
        match rx.recv_timeout(deadline) {
            Ok(Some(qr)) => Ok(qr),
            Ok(None) => {
                let _ = self.total_failed.fetch_add(1, Ordering::Release);
                Err(ClientError::TimeOut)
            }
            Err(_) => {
                let _ = self.total_failed.fetch_add(1, Ordering::Release);
                Err(ClientError::LookupFailed)
            }
        }
    }
}

impl DnsClient for DnsNetworkClient {
    fn get_sent_count(&self) -> usize {
        self.total_sent.load(Ordering::Acquire)
    }

    fn get_failed_count(&self) -> usize {
        self.total_failed.load(Ordering::Acquire)
    }

    /// The run method launches a worker thread. Unless this thread is running, no
    /// responses will ever be delivered, and UDP queries will just time out.
    ///
    /// The thread exits once every handle to the client has been dropped.
    fn run(&self) -> Result<()> {
        let socket_copy = self.socket.try_clone()?;
        let pending_queries_lock = self.pending_queries.clone();
        let timeout = self.timeout;

        Builder::new()
            .name("DnsNetworkClient-worker-thread".into())
            .spawn(move || {
                // the worker holds the last reference once all clients are gone
                while Arc::strong_count(&pending_queries_lock) > 1 {
                    let mut res_buffer = BytePacketBuffer::new();
                    let received = socket_copy.recv_from(&mut res_buffer.buf).ok();

                    if let Ok(mut pending_queries) = pending_queries_lock.lock() {
                        if let Some((_, src)) = received {
                            match DnsPacket::from_buffer(&mut res_buffer) {
                                Ok(packet) => {
                                    let position = pending_queries
                                        .iter()
                                        .position(|q| q.answered_by(&packet, src));

                                    match position {
                                        Some(idx) => {
                                            let pending_query = pending_queries.remove(idx);
                                            let _ = pending_query.tx.send(Some(packet));
                                        }
                                        None => {
                                            log::info!(
                                                "Discarding unmatched response with id {} from {}",
                                                packet.header.id,
                                                src
                                            );
                                        }
                                    }
                                }
                                Err(err) => {
                                    log::info!(
                                        "DnsNetworkClient failed to parse packet with error: {}",
                                        err
                                    );
                                }
                            }
                        }

                        let now = Local::now();
                        pending_queries.retain(|pending_query| {
                            if pending_query.timestamp + timeout < now {
                                let _ = pending_query.tx.send(None);
                                false
                            } else {
                                true
                            }
                        });
                    }
                }

                log::debug!("DnsNetworkClient worker exiting");
            })?;

        Ok(())
    }

    fn send_query(
        &self,
        qname: &str,
        qtype: QueryType,
        server: (&str, u16),
        recursive: bool,
    ) -> Result<DnsPacket> {
        let packet = self.send_udp_query(qname, qtype, server, recursive)?;
        if !packet.header.truncated_message {
            return Ok(packet);
        }

        log::info!("Truncated response - resending as TCP");
        self.send_tcp_query(qname, qtype, server, recursive)
    }
}
