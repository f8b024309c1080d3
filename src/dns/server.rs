//! UDP and TCP server implementations for DNS

use std::collections::VecDeque;
use std::io::{ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{sleep, Builder, JoinHandle};
use std::time::Duration;

use derive_more::{Display, Error, From};
use rand::random;

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer, StreamPacketBuffer, VectorPacketBuffer};
use crate::dns::context::ServerContext;
use crate::dns::netutil::{read_packet_length, write_packet_length};
use crate::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType, ResultCode, CLASS_IN};

#[derive(Debug, Display, From, Error)]
pub enum ServerError {
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ServerError>;

/// How long blocking calls wait before rechecking the shutdown flag
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read timeout for a single TCP client
const TCP_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

const UDP_MIN_PAYLOAD: usize = 512;

macro_rules! return_or_report {
    ( $x:expr, $message:expr ) => {
        match $x {
            Ok(res) => res,
            Err(_) => {
                log::info!($message);
                return;
            }
        }
    };
}

macro_rules! ignore_or_report {
    ( $x:expr, $message:expr ) => {
        match $x {
            Ok(_) => {}
            Err(_) => {
                log::info!($message);
                return;
            }
        };
    };
}

/// A running listener: where it is bound, and the threads serving it
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Wait for every thread; only returns once shutdown has been requested
    pub fn join(self) {
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

/// Common trait for DNS servers
pub trait DnsServer {
    /// Initialize the server and start listenening
    ///
    /// This method should _NOT_ block. Rather, servers are expected to spawn
    /// threads to handle requests and return immediately. The threads run until
    /// shutdown is requested on the context.
    fn run_server(self) -> Result<ServerHandle>;
}

/// TTLs above 2^31-1 are invalid on the wire and replaced by the default
pub fn serving_ttl(stored: u32, default: u32) -> u32 {
    if stored > i32::MAX as u32 {
        default
    } else {
        stored
    }
}

/// Build the initial response packet with common headers
fn build_response_packet(request: &DnsPacket) -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet.header.id = request.header.id;
    packet.header.opcode = request.header.opcode;
    packet.header.recursion_desired = request.header.recursion_desired;
    packet.header.response = true;
    packet.header.authoritative_answer = true;
    packet.header.recursion_available = false;
    packet
}

/// Look the question up in the record store. A failing store yields an empty
/// answer rather than an error, so the responder stays available.
fn answer_txt_question(context: &ServerContext, question: &DnsQuestion, packet: &mut DnsPacket) {
    match context.store.find_active_txt_records(&question.name) {
        Ok(answers) => {
            for answer in answers {
                packet.answers.push(DnsRecord::Txt {
                    domain: question.name.clone(),
                    data: answer.value,
                    ttl: serving_ttl(answer.ttl, context.default_ttl),
                });
            }
        }
        Err(err) => {
            let _ = context
                .statistics
                .store_failure_count
                .fetch_add(1, Ordering::Release);
            log::warn!("Record store lookup for {} failed: {}", question.name, err);

            sentry::with_scope(
                |scope| {
                    scope.set_tag("component", "dns_responder");
                    scope.set_tag("query_name", &question.name);
                },
                || {
                    sentry::capture_message(
                        &format!("Record store lookup failed: {}", err),
                        sentry::Level::Error,
                    )
                },
            );
        }
    }
}

/// Perform the actual work for a query
///
/// This function will always return a valid packet, even if the request could not
/// be performed, since we still want to send something back to the client.
pub fn execute_query(context: &ServerContext, request: &DnsPacket) -> DnsPacket {
    let mut packet = build_response_packet(request);

    let question = match request.questions.first() {
        Some(question) => question,
        None => {
            log::info!("FORMERR");
            packet.header.rescode = ResultCode::FORMERR;
            return packet;
        }
    };

    packet.questions.push(question.clone());

    if request.header.opcode != 0 {
        log::info!("NOTIMP for opcode {}", request.header.opcode);
        packet.header.rescode = ResultCode::NOTIMP;
        return packet;
    }

    log::debug!("question: {}", question);

    if question.qtype == QueryType::Txt && question.qclass == CLASS_IN {
        answer_txt_question(context, question, &mut packet);
    }

    packet
}

/// The UDP server
///
/// Accepts DNS queries through UDP, and uses the `ServerContext` to determine
/// how to service the request. Packets are read on a single thread, after which
/// they are queued for a pool of worker threads.
pub struct DnsUdpServer {
    context: Arc<ServerContext>,
    request_queue: Arc<Mutex<VecDeque<(SocketAddr, DnsPacket)>>>,
    request_cond: Arc<Condvar>,
    thread_count: usize,
}

impl DnsUdpServer {
    pub fn new(context: Arc<ServerContext>, thread_count: usize) -> DnsUdpServer {
        DnsUdpServer {
            context,
            request_queue: Arc::new(Mutex::new(VecDeque::new())),
            request_cond: Arc::new(Condvar::new()),
            thread_count: thread_count.max(1),
        }
    }

    /// Process a single DNS request and send the response
    fn process_request(
        socket: &UdpSocket,
        context: &ServerContext,
        src: SocketAddr,
        request: &DnsPacket,
    ) {
        let size_limit = request
            .edns_payload_size()
            .map(|len| (len as usize).max(UDP_MIN_PAYLOAD))
            .unwrap_or(UDP_MIN_PAYLOAD);

        let mut res_buffer = VectorPacketBuffer::new();

        let mut packet = execute_query(context, request);
        ignore_or_report!(
            packet.write(&mut res_buffer, size_limit),
            "Failed to write packet to buffer"
        );

        // Fire off the response
        let len = res_buffer.pos();
        let data = return_or_report!(res_buffer.get_range(0, len), "Failed to get buffer data");
        ignore_or_report!(socket.send_to(data, src), "Failed to send response packet");
    }

    /// Spawn a worker thread to handle DNS requests
    fn spawn_request_handler(
        &self,
        thread_id: usize,
        socket: UdpSocket,
    ) -> std::io::Result<JoinHandle<()>> {
        let context = self.context.clone();
        let request_cond = self.request_cond.clone();
        let request_queue = self.request_queue.clone();

        let name = format!("DnsUdpServer-request-{}", thread_id);

        Builder::new().name(name).spawn(move || loop {
            if context.is_shutting_down() {
                break;
            }

            // Acquire lock, and wait on the condition until data is available
            let next = match request_queue.lock() {
                Ok(queue) => match request_cond.wait_timeout(queue, POLL_INTERVAL) {
                    Ok((mut queue, _)) => queue.pop_front(),
                    Err(_) => None,
                },
                Err(_) => {
                    log::info!("UDP request queue lock poisoned");
                    break;
                }
            };

            if let Some((src, request)) = next {
                Self::process_request(&socket, &context, src, &request);
            }
        })
    }

    /// Spawn the main incoming request handler thread
    fn spawn_incoming_handler(self, socket: UdpSocket) -> std::io::Result<JoinHandle<()>> {
        Builder::new()
            .name("DnsUdpServer-incoming".into())
            .spawn(move || {
                while !self.context.is_shutting_down() {
                    // Read a query packet
                    let mut req_buffer = BytePacketBuffer::new();
                    let (_, src) = match socket.recv_from(&mut req_buffer.buf) {
                        Ok(x) => x,
                        Err(ref e)
                            if e.kind() == ErrorKind::WouldBlock
                                || e.kind() == ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            log::info!("Failed to read from UDP socket: {:?}", e);
                            continue;
                        }
                    };

                    let _ = self
                        .context
                        .statistics
                        .udp_query_count
                        .fetch_add(1, Ordering::Release);

                    // Parse it
                    let request = match DnsPacket::from_buffer(&mut req_buffer) {
                        Ok(x) => x,
                        Err(e) => {
                            log::info!("Failed to parse UDP query packet: {:?}", e);
                            continue;
                        }
                    };

                    // Add request to queue and notify waiting threads
                    self.enqueue_request(src, request);
                }

                self.request_cond.notify_all();
            })
    }

    /// Add a request to the queue and notify waiting threads
    fn enqueue_request(&self, src: SocketAddr, request: DnsPacket) {
        match self.request_queue.lock() {
            Ok(mut queue) => {
                queue.push_back((src, request));
                self.request_cond.notify_one();
            }
            Err(e) => {
                log::info!("Failed to send UDP request for processing: {}", e);
            }
        }
    }
}

impl DnsServer for DnsUdpServer {
    /// Launch the server
    ///
    /// This method takes ownership of the server, preventing the method from
    /// being called multiple times.
    fn run_server(self) -> Result<ServerHandle> {
        let socket = UdpSocket::bind((self.context.dns_host.as_str(), self.context.dns_port))?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;

        let mut threads = Vec::with_capacity(self.thread_count + 1);

        // Spawn worker threads for handling requests
        for thread_id in 0..self.thread_count {
            let socket_clone = socket.try_clone()?;
            threads.push(self.spawn_request_handler(thread_id, socket_clone)?);
        }

        // Start servicing incoming requests
        threads.push(self.spawn_incoming_handler(socket)?);

        log::info!("Listening for DNS over UDP on {}", local_addr);

        Ok(ServerHandle {
            local_addr,
            threads,
        })
    }
}

/// TCP DNS server
pub struct DnsTcpServer {
    context: Arc<ServerContext>,
    senders: Vec<Sender<TcpStream>>,
    thread_count: usize,
}

impl DnsTcpServer {
    pub fn new(context: Arc<ServerContext>, thread_count: usize) -> DnsTcpServer {
        DnsTcpServer {
            context,
            senders: Vec::new(),
            thread_count: thread_count.max(1),
        }
    }

    fn handle_connection(context: &ServerContext, mut stream: TcpStream) {
        let _ = context
            .statistics
            .tcp_query_count
            .fetch_add(1, Ordering::Release);

        ignore_or_report!(
            stream.set_nonblocking(false),
            "Failed to switch TCP stream to blocking mode"
        );
        ignore_or_report!(
            stream.set_read_timeout(Some(TCP_CLIENT_TIMEOUT)),
            "Failed to set TCP read timeout"
        );

        // When DNS packets are sent over TCP, they're prefixed with a two byte
        // length. We don't really need to know the length in advance, so we
        // just move past it and continue reading as usual
        ignore_or_report!(
            read_packet_length(&mut stream),
            "Failed to read query packet length"
        );

        let request = {
            let mut stream_buffer = StreamPacketBuffer::new(&mut stream);
            return_or_report!(
                DnsPacket::from_buffer(&mut stream_buffer),
                "Failed to read query packet"
            )
        };

        let mut res_buffer = VectorPacketBuffer::new();

        let mut packet = execute_query(context, &request);
        ignore_or_report!(
            packet.write(&mut res_buffer, 0xFFFF),
            "Failed to write packet to buffer"
        );

        // As is the case for incoming queries, we need to send a 2 byte length
        // value before handing of the actual packet.
        let len = res_buffer.pos();
        ignore_or_report!(
            write_packet_length(&mut stream, len),
            "Failed to write packet size"
        );

        // Now we can go ahead and write the actual packet
        let data = return_or_report!(res_buffer.get_range(0, len), "Failed to get packet data");

        ignore_or_report!(stream.write_all(data), "Failed to write response packet");

        ignore_or_report!(stream.shutdown(Shutdown::Both), "Failed to shutdown socket");
    }
}

impl DnsServer for DnsTcpServer {
    fn run_server(mut self) -> Result<ServerHandle> {
        let socket = TcpListener::bind((self.context.dns_host.as_str(), self.context.dns_port))?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let mut threads = Vec::with_capacity(self.thread_count + 1);

        // Spawn threads for handling requests, and create the channels
        for thread_id in 0..self.thread_count {
            let (tx, rx) = channel::<TcpStream>();
            self.senders.push(tx);

            let context = self.context.clone();

            let name = "DnsTcpServer-request-".to_string() + &thread_id.to_string();
            threads.push(Builder::new().name(name).spawn(move || loop {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(stream) => Self::handle_connection(&context, stream),
                    Err(RecvTimeoutError::Timeout) => {
                        if context.is_shutting_down() {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })?);
        }

        threads.push(
            Builder::new()
                .name("DnsTcpServer-incoming".into())
                .spawn(move || {
                    while !self.context.is_shutting_down() {
                        let stream = match socket.accept() {
                            Ok((stream, _)) => stream,
                            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                                sleep(POLL_INTERVAL / 2);
                                continue;
                            }
                            Err(err) => {
                                log::info!("Failed to accept TCP connection: {:?}", err);
                                continue;
                            }
                        };

                        // Hand it off to a worker thread
                        let thread_no = random::<usize>() % self.thread_count;
                        match self.senders[thread_no].send(stream) {
                            Ok(_) => {}
                            Err(e) => {
                                log::info!(
                                    "Failed to send TCP request for processing on thread {}: {}",
                                    thread_no,
                                    e
                                );
                            }
                        }
                    }
                })?,
        );

        log::info!("Listening for DNS over TCP on {}", local_addr);

        Ok(ServerHandle {
            local_addr,
            threads,
        })
    }
}

#[cfg(test)]
mod tests {

    use std::sync::Arc;

    use super::*;
    use crate::dns::context::tests::create_test_context;
    use crate::store::model::{Domain, Record, RecordType};
    use crate::store::{MemoryStore, RecordStore, StoreError, TxtAnswer};

    struct FailingStore;

    impl RecordStore for FailingStore {
        fn find_active_txt_records(&self, _name: &str) -> crate::store::Result<Vec<TxtAnswer>> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        fn find_records_for_domain(
            &self,
            _domain_id: uuid::Uuid,
        ) -> crate::store::Result<Vec<Record>> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        fn insert_record(&self, _record: Record) -> crate::store::Result<Record> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        fn set_record_active(
            &self,
            _record_id: uuid::Uuid,
            _active: bool,
        ) -> crate::store::Result<Record> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        fn find_domain_by_name(&self, _name: &str) -> crate::store::Result<Option<Domain>> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        fn insert_domain(&self, _domain: Domain) -> crate::store::Result<Domain> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        fn list_domains(&self) -> crate::store::Result<Vec<Domain>> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        fn set_domain_verified(
            &self,
            _name: &str,
            _verified: bool,
        ) -> crate::store::Result<Domain> {
            Err(StoreError::Unavailable("down".to_string()))
        }
    }

    fn build_query(qname: &str, qtype: QueryType) -> DnsPacket {
        let mut query_packet = DnsPacket::new();
        query_packet.header.id = 4242;
        query_packet.header.recursion_desired = true;

        query_packet
            .questions
            .push(DnsQuestion::new(qname.into(), qtype));

        query_packet
    }

    fn populated_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let domain = store.insert_domain(Domain::new("example.com")).unwrap();

        for (name, value, ttl) in &[
            ("_pds-verify", "pds-verify=abc", Some(60)),
            ("_pds-verify", "second", Some(u32::MAX)),
            ("@", "apex", None),
        ] {
            store
                .insert_record(Record::new(&domain, name, RecordType::TXT, value, *ttl))
                .unwrap();
        }
        store
            .insert_record(Record::new(&domain, "@", RecordType::A, "127.0.0.1", None))
            .unwrap();

        store
    }

    #[test]
    fn test_execute_query() {
        let context = create_test_context(populated_store());

        // TXT answers with the stored values
        {
            let res = execute_query(&context, &build_query("_PDS-verify.example.com", QueryType::Txt));
            assert_eq!(4242, res.header.id);
            assert!(res.header.response);
            assert!(res.header.authoritative_answer);
            assert!(res.header.recursion_desired);
            assert!(!res.header.recursion_available);
            assert_eq!(ResultCode::NOERROR, res.header.rescode);
            assert_eq!(1, res.questions.len());
            assert_eq!(2, res.answers.len());

            match res.answers[0] {
                DnsRecord::Txt {
                    ref domain,
                    ref data,
                    ttl,
                } => {
                    assert_eq!("_pds-verify.example.com", domain);
                    assert_eq!("pds-verify=abc", data);
                    assert_eq!(60, ttl);
                }
                _ => panic!(),
            }

            // out of range TTL falls back to the default
            assert_eq!(300, res.answers[1].get_ttl());
        };

        // Apex records
        {
            let res = execute_query(&context, &build_query("example.com.", QueryType::Txt));
            assert_eq!(1, res.answers.len());
        };

        // A name without records is empty, not NXDOMAIN
        {
            let res = execute_query(&context, &build_query("nothing.example.com", QueryType::Txt));
            assert_eq!(ResultCode::NOERROR, res.header.rescode);
            assert!(res.answers.is_empty());
        };

        // Other query types are never answered with data
        {
            let res = execute_query(&context, &build_query("example.com", QueryType::A));
            assert_eq!(ResultCode::NOERROR, res.header.rescode);
            assert!(res.answers.is_empty());
        };

        // Other classes neither
        {
            let mut query = build_query("example.com", QueryType::Txt);
            query.questions[0].qclass = 3;
            let res = execute_query(&context, &query);
            assert!(res.answers.is_empty());
        };

        // Send a query without a question, which should fail with an error code
        {
            let query_packet = DnsPacket::new();
            let res = execute_query(&context, &query_packet);
            assert_eq!(ResultCode::FORMERR, res.header.rescode);
            assert_eq!(0, res.answers.len());
        };
    }

    #[test]
    fn test_failing_store_yields_empty_answer() {
        let context = create_test_context(Arc::new(FailingStore));

        let res = execute_query(&context, &build_query("example.com", QueryType::Txt));
        assert_eq!(ResultCode::NOERROR, res.header.rescode);
        assert!(res.answers.is_empty());
        assert_eq!(1, context.statistics.get_store_failure_count());
    }

    #[test]
    fn test_serving_ttl() {
        assert_eq!(0, serving_ttl(0, 300));
        assert_eq!(3600, serving_ttl(3600, 300));
        assert_eq!(0x7FFF_FFFF, serving_ttl(0x7FFF_FFFF, 300));
        assert_eq!(300, serving_ttl(0x8000_0000, 300));
    }

    #[test]
    fn test_udp_server_shuts_down() {
        let context = create_test_context(populated_store());
        let handle = DnsUdpServer::new(context.clone(), 2).run_server().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut query = build_query("_pds-verify.example.com", QueryType::Txt);
        let mut req_buffer = BytePacketBuffer::new();
        query.write(&mut req_buffer, 512).unwrap();
        client
            .send_to(&req_buffer.buf[0..req_buffer.pos], handle.local_addr)
            .unwrap();

        let mut res_buffer = BytePacketBuffer::new();
        client.recv_from(&mut res_buffer.buf).unwrap();
        let res = DnsPacket::from_buffer(&mut res_buffer).unwrap();
        assert_eq!(2, res.answers.len());
        assert_eq!(1, context.statistics.get_udp_query_count());

        context.request_shutdown();
        handle.join();
    }
}
