//! The pending-forwards table: in-flight upstream queries keyed by the
//! rewritten transaction ID the relay assigned them.
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::num::Wrapping;
use std::time::{Duration, Instant};

use log::debug;

use crate::codec::QType;

/// How long a forward waits for an upstream reply before it's synthesized
/// into a SERVFAIL and sent to the client.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PendingForward {
    pub client_id: u16,
    pub client_addr: SocketAddrV4,
    pub query_bytes: Vec<u8>,
    pub question_len: usize,
    pub qtype: QType,
    pub domain: String,
    pub(crate) created_at: Instant,
}

impl PendingForward {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > RELAY_TIMEOUT
    }
}

/// Allocates monotonically increasing `upstream_id`s (skipping 0) and maps
/// them back to the client that's waiting on a reply.
pub struct PendingTable {
    pub(crate) entries: HashMap<u16, PendingForward>,
    next_id: Wrapping<u16>,
}

impl PendingTable {
    pub fn new() -> Self {
        // start from a random point so a freshly (re)started relay doesn't
        // reuse IDs a just-timed-out upstream might still answer.
        let seed: u16 = rand::random();
        PendingTable {
            entries: HashMap::new(),
            next_id: Wrapping(seed.max(1)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn allocate_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            self.next_id += Wrapping(1);
            if self.next_id.0 == 0 {
                self.next_id += Wrapping(1);
            }
            let candidate = self.next_id.0;
            if !self.entries.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Insert a new forward, returning the `upstream_id` it was assigned,
    /// or `None` if the ID space is exhausted (impossible at target scale,
    /// handled defensively rather than assumed away).
    pub fn insert(
        &mut self,
        client_id: u16,
        client_addr: SocketAddrV4,
        query_bytes: Vec<u8>,
        question_len: usize,
        qtype: QType,
        domain: String,
        now: Instant,
    ) -> Option<u16> {
        let id = self.allocate_id()?;
        self.entries.insert(
            id,
            PendingForward {
                client_id,
                client_addr,
                query_bytes,
                question_len,
                qtype,
                domain,
                created_at: now,
            },
        );
        Some(id)
    }

    pub fn remove(&mut self, upstream_id: u16) -> Option<PendingForward> {
        self.entries.remove(&upstream_id)
    }

    /// Drain and return every forward whose deadline has passed, so the
    /// caller can synthesize a SERVFAIL for each.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(u16, PendingForward)> {
        let expired_ids: Vec<u16> = self
            .entries
            .iter()
            .filter(|(_, f)| f.is_expired(now))
            .map(|(id, _)| *id)
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(entry) = self.entries.remove(&id) {
                debug!(
                    "forward timed out: upstream_id={id} client_id={} domain={}",
                    entry.client_id, entry.domain
                );
                expired.push((id, entry));
            }
        }
        expired
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}
