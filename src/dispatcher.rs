//! The dispatcher: a single-threaded, readiness-multiplexing event loop over
//! the client-facing and upstream-facing UDP sockets.
//!
//! There is no concurrency between handlers — every datagram runs to
//! completion (classify, answer-or-forward, or correlate-and-relay) before
//! the next one is read. At the home/lab scale this relay targets, that's
//! enough: every operation here is bounded in-memory work plus one UDP send.
use std::io::ErrorKind;
use std::net::{SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::cache::Cache;
use crate::codec::{self, QType};
use crate::format_buffer;
use crate::hosts::HostTable;
use crate::pending::PendingTable;

/// How often the cache's expired-entry sweep runs, independent of the
/// dispatcher's 100 ms readiness tick.
pub const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const TICK: Duration = Duration::from_millis(100);

pub struct Dispatcher {
    client_sock: UdpSocket,
    upstream_sock: UdpSocket,
    upstream_addr: SocketAddrV4,
    hosts: HostTable,
    cache: Cache,
    pending: PendingTable,
    trace: bool,
    verbose: bool,
    last_cache_sweep: Instant,
    query_seq: u64,
}

impl Dispatcher {
    pub fn new(
        client_sock: UdpSocket,
        upstream_sock: UdpSocket,
        upstream_addr: SocketAddrV4,
        hosts: HostTable,
        cache: Cache,
        trace: bool,
        verbose: bool,
    ) -> std::io::Result<Self> {
        client_sock.set_read_timeout(Some(TICK))?;
        upstream_sock.set_read_timeout(Some(Duration::from_millis(1)))?;

        Ok(Dispatcher {
            client_sock,
            upstream_sock,
            upstream_addr,
            hosts,
            cache,
            pending: PendingTable::new(),
            trace,
            verbose,
            last_cache_sweep: Instant::now(),
            query_seq: 0,
        })
    }

    /// Run until `shutdown` is set (by the SIGINT handler installed in
    /// `main`), then return. Sockets and owned tables are dropped when this
    /// returns, via ordinary Rust scope exit.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) {
        let mut buf = [0u8; codec::MAX_DNS_PACKET_SIZE];

        while !shutdown.load(Ordering::Relaxed) {
            let mut did_io = false;

            match self.client_sock.recv_from(&mut buf) {
                Ok((len, addr)) => {
                    did_io = true;
                    if let std::net::SocketAddr::V4(addr) = addr {
                        self.handle_client_query(&buf[..len], addr);
                    } else {
                        warn!("ignoring client datagram from non-IPv4 address: {addr}");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) => warn!("client socket recv error: {e}"),
            }

            match self.upstream_sock.recv_from(&mut buf) {
                Ok((len, _addr)) => {
                    did_io = true;
                    self.handle_upstream_response(&buf[..len]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) => warn!("upstream socket recv error: {e}"),
            }

            if !did_io {
                self.run_timeout_sweep();

                let now = Instant::now();
                if now.saturating_duration_since(self.last_cache_sweep) >= CACHE_CLEANUP_INTERVAL {
                    self.cache.sweep(now);
                    self.last_cache_sweep = now;
                    if self.verbose {
                        let stats = self.cache.stats();
                        debug!(
                            "cache sweep complete: {stats:?} hit_rate={:.2} size={}/{}",
                            stats.hit_rate(),
                            self.cache.size(),
                            self.cache.max_entries()
                        );
                    }
                }
            }
        }
    }

    fn send_to_client(&self, bytes: &[u8], addr: SocketAddrV4) {
        if let Err(e) = self.client_sock.send_to(bytes, addr) {
            warn!("failed to send response to client {addr}: {e}");
        }
    }

    fn handle_client_query(&mut self, query: &[u8], client_addr: SocketAddrV4) {
        if query.len() < codec::HEADER_SIZE || codec::qdcount(query) != 1 {
            debug!("dropping malformed client query from {client_addr} ({} bytes)", query.len());
            return;
        }

        let question = match codec::parse_question(query) {
            Ok(q) => q,
            Err(e) => {
                debug!("dropping unparseable client query from {client_addr}: {e}");
                return;
            }
        };

        if self.trace {
            self.query_seq += 1;
            info!(
                "query #{} t={} qtype={} from {client_addr}: {}",
                self.query_seq,
                crate::util::now_unix_secs(),
                question.qtype_raw,
                question.domain
            );
        }
        if self.verbose {
            debug!("client query buffer: {}", format_buffer!("X", &query));
        }

        let qtype = match (
            QType::try_from(question.qtype_raw),
            question.qclass_raw == codec::QCLASS_IN,
        ) {
            (Ok(qtype), true) => qtype,
            _ => {
                debug!(
                    "unsupported qtype={} qclass={} for {}",
                    question.qtype_raw, question.qclass_raw, question.domain
                );
                let resp = codec::build_error_response(query, question.question_len, codec::RCODE_NOTIMP);
                self.send_to_client(&resp, client_addr);
                return;
            }
        };

        if let Some(record) = self.hosts.lookup(&question.domain) {
            if record.is_blocked() {
                debug!("blocklisted domain: {}", question.domain);
                let resp = codec::build_error_response(query, question.question_len, codec::RCODE_NXDOMAIN);
                self.send_to_client(&resp, client_addr);
            } else if qtype.matches_family(&record.ip) {
                debug!("local record hit: {} -> {}", question.domain, record.ip);
                let resp = codec::build_standard_answer(query, question.question_len, qtype, record.ip);
                self.send_to_client(&resp, client_addr);
            } else {
                debug!(
                    "local record family mismatch for {} (have {}, asked {qtype})",
                    question.domain, record.ip
                );
                let resp = codec::build_error_response(query, question.question_len, codec::RCODE_NOERROR);
                self.send_to_client(&resp, client_addr);
            }
            return;
        }

        let now = Instant::now();
        if let Some(entry) = self.cache.get(&question.domain, qtype, now) {
            if self.verbose {
                debug!(
                    "cache hit for {} {qtype}: {} remaining_ttl={}s",
                    question.domain,
                    entry.ip,
                    entry.remaining_ttl(now)
                );
            }
            let resp = codec::build_standard_answer(query, question.question_len, qtype, entry.ip);
            self.send_to_client(&resp, client_addr);
            return;
        }

        self.forward_to_upstream(query, &question, qtype, client_addr, now);
    }

    fn forward_to_upstream(
        &mut self,
        query: &[u8],
        question: &codec::Question,
        qtype: QType,
        client_addr: SocketAddrV4,
        now: Instant,
    ) {
        let client_id = codec::transaction_id(query);

        let Some(upstream_id) = self.pending.insert(
            client_id,
            client_addr,
            query.to_vec(),
            question.question_len,
            qtype,
            question.domain.clone(),
            now,
        ) else {
            warn!("pending-forward ID space exhausted, dropping query for {}", question.domain);
            return;
        };

        // the original receive buffer is never mutated; the outbound
        // datagram is a short-lived stack copy with its transaction ID
        // rewritten to the relay's own correlation ID.
        let mut forward_buffer = [0u8; codec::MAX_DNS_PACKET_SIZE];
        let forward_buffer = &mut forward_buffer[..query.len()];
        forward_buffer.copy_from_slice(query);
        codec::set_transaction_id(forward_buffer, upstream_id);

        debug!(
            "forwarding {qtype} query for {} to upstream: client_id={client_id} upstream_id={upstream_id}",
            question.domain
        );
        if let Err(e) = self.upstream_sock.send_to(forward_buffer, self.upstream_addr) {
            warn!("failed to forward query to upstream: {e}");
            self.pending.remove(upstream_id);
        }
    }

    fn handle_upstream_response(&mut self, response: &[u8]) {
        if response.len() < codec::HEADER_SIZE {
            debug!("dropping undersized upstream response ({} bytes)", response.len());
            return;
        }

        let upstream_id = codec::transaction_id(response);
        let Some(forward) = self.pending.remove(upstream_id) else {
            debug!("no pending forward for upstream_id={upstream_id}, dropping response");
            return;
        };

        match codec::extract_first_answer(response, forward.qtype) {
            Ok((ip, ttl)) => {
                self.cache.put(&forward.domain, forward.qtype, ip, ttl, Instant::now());
                debug!("cached {} {} -> {ip} (ttl={ttl})", forward.domain, forward.qtype);
            }
            Err(e) => {
                debug!(
                    "upstream answer for {} not cacheable ({e}); relaying as-is",
                    forward.domain
                );
            }
        }

        let mut reply = response.to_vec();
        codec::set_transaction_id(&mut reply, forward.client_id);
        self.send_to_client(&reply, forward.client_addr);
    }

    fn run_timeout_sweep(&mut self) {
        let now = Instant::now();
        for (upstream_id, forward) in self.pending.take_expired(now) {
            warn!(
                "forward timed out: upstream_id={upstream_id} client_id={} domain={}",
                forward.client_id, forward.domain
            );
            let servfail = codec::build_error_response(
                &forward.query_bytes,
                forward.question_len,
                codec::RCODE_SERVFAIL,
            );
            self.send_to_client(&servfail, forward.client_addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::HostTable;
    use byteorder::{BigEndian, ByteOrder};
    use std::net::Ipv4Addr;

    fn bind_loopback() -> UdpSocket {
        UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap()
    }

    fn build_query(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
        let mut buf = vec![0u8; codec::HEADER_SIZE];
        BigEndian::write_u16(&mut buf[0..2], id);
        BigEndian::write_u16(&mut buf[2..4], 0x0100);
        BigEndian::write_u16(&mut buf[4..6], 1);
        for label in domain.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        let mut tail = [0u8; 4];
        BigEndian::write_u16(&mut tail[0..2], qtype);
        BigEndian::write_u16(&mut tail[2..4], codec::QCLASS_IN);
        buf.extend_from_slice(&tail);
        buf
    }

    fn new_dispatcher(hosts: HostTable) -> (Dispatcher, UdpSocket, UdpSocket) {
        let client_sock = bind_loopback();
        let client_peer = bind_loopback();
        client_peer.connect(client_sock.local_addr().unwrap()).unwrap();

        let upstream_sock = bind_loopback();
        let fake_upstream = bind_loopback();
        let upstream_addr = match fake_upstream.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        let dispatcher = Dispatcher::new(
            client_sock,
            upstream_sock,
            upstream_addr,
            hosts,
            Cache::new(16),
            false,
            false,
        )
        .unwrap();

        (dispatcher, client_peer, fake_upstream)
    }

    #[test]
    fn local_a_hit_preserves_transaction_id_and_returns_address() {
        // HostTable has no public constructor from a map in production code
        // (it's always file-loaded), so build it through a temp file here.
        let mut path = std::env::temp_dir();
        path.push("dnsrelay-dispatcher-test-local-hit.txt");
        std::fs::write(&path, "1.2.3.4 example.com\n").unwrap();
        let hosts = HostTable::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let (mut dispatcher, client_peer, _upstream) = new_dispatcher(hosts);
        let query = build_query(0xABCD, "example.com", 1);
        let client_addr = match client_peer.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        dispatcher.handle_client_query(&query, client_addr);

        let mut buf = [0u8; 512];
        let len = client_peer.recv(&mut buf).unwrap();
        let resp = &buf[..len];
        assert_eq!(codec::transaction_id(resp), 0xABCD);
        assert_eq!(BigEndian::read_u16(&resp[2..4]), 0x8180);
        assert_eq!(&resp[resp.len() - 4..], &[1, 2, 3, 4]);
    }

    #[test]
    fn blocklisted_domain_returns_nxdomain() {
        let mut path = std::env::temp_dir();
        path.push("dnsrelay-dispatcher-test-blocklist.txt");
        std::fs::write(&path, "0.0.0.0 ads.test\n").unwrap();
        let hosts = HostTable::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let (mut dispatcher, client_peer, _upstream) = new_dispatcher(hosts);
        let query = build_query(7, "ads.test", 1);
        let client_addr = match client_peer.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        dispatcher.handle_client_query(&query, client_addr);

        let mut buf = [0u8; 512];
        let len = client_peer.recv(&mut buf).unwrap();
        let resp = &buf[..len];
        assert_eq!(BigEndian::read_u16(&resp[2..4]), 0x8183);
        assert_eq!(BigEndian::read_u16(&resp[6..8]), 0);
    }

    #[test]
    fn unsupported_qtype_returns_notimp() {
        let (mut dispatcher, client_peer, _upstream) = new_dispatcher(HostTable::default());
        let query = build_query(99, "example.com", 15); // MX
        let client_addr = match client_peer.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        dispatcher.handle_client_query(&query, client_addr);

        let mut buf = [0u8; 512];
        let len = client_peer.recv(&mut buf).unwrap();
        let resp = &buf[..len];
        assert_eq!(BigEndian::read_u16(&resp[2..4]), 0x8184);
    }

    #[test]
    fn forward_then_upstream_reply_populates_cache_and_relays() {
        let (mut dispatcher, client_peer, upstream) = new_dispatcher(HostTable::default());
        let query = build_query(0x1111, "foo.example", 1);
        let client_addr = match client_peer.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        dispatcher.handle_client_query(&query, client_addr);
        assert_eq!(dispatcher.pending.len(), 1);

        // the relay should have forwarded a copy with a rewritten ID
        let mut fwd_buf = [0u8; 512];
        upstream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let (fwd_len, relay_addr) = upstream.recv_from(&mut fwd_buf).unwrap();
        let forwarded = &fwd_buf[..fwd_len];
        let upstream_id = codec::transaction_id(forwarded);
        assert_ne!(upstream_id, 0x1111);

        // synthesize an upstream answer and feed it back in
        let mut answer = forwarded.to_vec();
        BigEndian::write_u16(&mut answer[6..8], 1); // ANCOUNT=1
        answer.push(0xC0);
        answer.push(0x0C);
        let mut rr = [0u8; 10];
        BigEndian::write_u16(&mut rr[0..2], 1); // TYPE A
        BigEndian::write_u16(&mut rr[2..4], codec::QCLASS_IN);
        BigEndian::write_u32(&mut rr[4..8], 60);
        BigEndian::write_u16(&mut rr[8..10], 4);
        answer.extend_from_slice(&rr);
        answer.extend_from_slice(&[93, 184, 216, 34]);
        upstream.send_to(&answer, relay_addr).unwrap();

        dispatcher.handle_upstream_response(&answer);
        assert_eq!(dispatcher.pending.len(), 0);
        assert_eq!(dispatcher.cache.size(), 1);

        let mut reply_buf = [0u8; 512];
        client_peer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let len = client_peer.recv(&mut reply_buf).unwrap();
        let reply = &reply_buf[..len];
        assert_eq!(codec::transaction_id(reply), 0x1111);

        // second query for the same name should now be answered from cache,
        // with no further traffic sent to upstream.
        let query2 = build_query(0x2222, "foo.example", 1);
        dispatcher.handle_client_query(&query2, client_addr);
        let len2 = client_peer.recv(&mut reply_buf).unwrap();
        let reply2 = &reply_buf[..len2];
        assert_eq!(codec::transaction_id(reply2), 0x2222);
        assert_eq!(&reply2[reply2.len() - 4..], &[93, 184, 216, 34]);
        assert_eq!(dispatcher.pending.len(), 0);
    }

    #[test]
    fn timeout_sweep_synthesizes_servfail() {
        let (mut dispatcher, client_peer, _upstream) = new_dispatcher(HostTable::default());
        let query = build_query(0x3333, "timeout.example", 1);
        let client_addr = match client_peer.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        dispatcher.handle_client_query(&query, client_addr);
        assert_eq!(dispatcher.pending.len(), 1);

        // force the forward to look old enough to time out
        for (_, forward) in dispatcher.pending.entries.iter_mut() {
            forward.created_at = Instant::now() - crate::pending::RELAY_TIMEOUT - Duration::from_millis(5);
        }

        dispatcher.run_timeout_sweep();
        assert_eq!(dispatcher.pending.len(), 0);

        let mut buf = [0u8; 512];
        client_peer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let len = client_peer.recv(&mut buf).unwrap();
        let resp = &buf[..len];
        assert_eq!(BigEndian::read_u16(&resp[2..4]), 0x8182);
    }

    #[test]
    fn lru_eviction_follows_touch_order() {
        let (mut dispatcher, client_peer, upstream) = new_dispatcher(HostTable::default());
        upstream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        client_peer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let client_addr = match client_peer.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        // prime the cache directly to its 16-entry capacity, oldest first.
        let now = Instant::now();
        for n in 0..16u8 {
            dispatcher
                .cache
                .put(&format!("host{n}.test"), QType::A, std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 300, now);
        }
        assert_eq!(dispatcher.cache.size(), 16);

        // touch host0 so it's no longer the least-recently-used entry.
        let touch = build_query(1, "host0.test", 1);
        dispatcher.handle_client_query(&touch, client_addr);
        let mut buf = [0u8; 512];
        client_peer.recv(&mut buf).unwrap();

        // one more insert should now evict host1 (the new LRU), not host0.
        let fresh = build_query(2, "new.test", 1);
        dispatcher.handle_client_query(&fresh, client_addr);
        let mut fwd_buf = [0u8; 512];
        let (fwd_len, relay_addr) = upstream.recv_from(&mut fwd_buf).unwrap();
        let mut answer = fwd_buf[..fwd_len].to_vec();
        BigEndian::write_u16(&mut answer[6..8], 1);
        answer.push(0xC0);
        answer.push(0x0C);
        let mut rr = [0u8; 10];
        BigEndian::write_u16(&mut rr[0..2], 1);
        BigEndian::write_u16(&mut rr[2..4], codec::QCLASS_IN);
        BigEndian::write_u32(&mut rr[4..8], 300);
        BigEndian::write_u16(&mut rr[8..10], 4);
        answer.extend_from_slice(&rr);
        answer.extend_from_slice(&[10, 0, 0, 99]);
        upstream.send_to(&answer, relay_addr).unwrap();
        dispatcher.handle_upstream_response(&answer);
        client_peer.recv(&mut buf).unwrap();

        assert_eq!(dispatcher.cache.size(), 16);
        let still_cached = build_query(3, "host0.test", 1);
        dispatcher.handle_client_query(&still_cached, client_addr);
        let len = client_peer.recv(&mut buf).unwrap();
        assert_eq!(&buf[len - 4..len], &[10, 0, 0, 0]);

        // host1 was evicted: the same query now forwards instead of
        // answering straight from cache.
        let evicted = build_query(4, "host1.test", 1);
        dispatcher.handle_client_query(&evicted, client_addr);
        assert_eq!(dispatcher.pending.len(), 1);
    }
}
