//! Packet fragmentation and reassembly
//!
//! A packet larger than one frame is split into `count` fragments that share a
//! packet id and carry consecutive indices. Each fragment also gets its own
//! sequence number, used by the delivery window for acknowledgement; the
//! reassembler only cares about `(packet, index, count)`.

use crate::TunnelError;
use log::{debug, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Highest fragment count a packet may be split into
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// Completed or purged packet ids remembered to drop late fragments
const MAX_TOMBSTONES: usize = 256;

/// One piece of a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Sequence number in the sending direction (wraps)
    pub seq: u16,
    /// Parent packet id (wraps)
    pub packet: u16,
    pub index: u8,
    pub count: u8,
    pub data: Vec<u8>,
}

impl Fragment {
    pub fn is_final(&self) -> bool {
        usize::from(self.index) + 1 == usize::from(self.count)
    }
}

/// Split `packet` into fragments of at most `capacity` bytes.
///
/// Sequence numbers start at `first_seq` and wrap. An empty packet still
/// produces one (empty) fragment.
pub fn fragment_packet(
    packet: &[u8],
    packet_id: u16,
    first_seq: u16,
    capacity: usize,
) -> Result<Vec<Fragment>, TunnelError> {
    if capacity == 0 {
        return Err(TunnelError::Framing("fragment capacity is zero".into()));
    }
    let count = packet.len().div_ceil(capacity).max(1);
    if count > MAX_FRAGMENTS {
        return Err(TunnelError::PacketTooLarge {
            size: packet.len(),
            max: capacity * MAX_FRAGMENTS,
        });
    }

    if packet.is_empty() {
        return Ok(vec![Fragment {
            seq: first_seq,
            packet: packet_id,
            index: 0,
            count: 1,
            data: Vec::new(),
        }]);
    }

    Ok(packet
        .chunks(capacity)
        .enumerate()
        .map(|(i, chunk)| Fragment {
            seq: first_seq.wrapping_add(i as u16),
            packet: packet_id,
            index: i as u8,
            count: count as u8,
            data: chunk.to_vec(),
        })
        .collect())
}

/// Partially received packet
#[derive(Debug)]
struct Run {
    slots: Vec<Option<Vec<u8>>>,
    received: usize,
    created: Instant,
}

impl Run {
    fn new(count: u8, now: Instant) -> Self {
        Self {
            slots: vec![None; usize::from(count)],
            received: 0,
            created: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    fn assemble(self) -> Vec<u8> {
        self.slots.into_iter().flatten().flatten().collect()
    }
}

/// Reassembles fragments into packets, emitting each packet exactly once
#[derive(Debug)]
pub struct Reassembler {
    runs: HashMap<u16, Run>,
    tombstones: HashSet<u16>,
    tombstone_order: VecDeque<u16>,
    max_runs: usize,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(max_runs: usize, timeout: Duration) -> Self {
        Self {
            runs: HashMap::new(),
            tombstones: HashSet::new(),
            tombstone_order: VecDeque::new(),
            max_runs: max_runs.max(1),
            timeout,
        }
    }

    /// Number of incomplete runs
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Add a fragment; returns the packet when this fragment completes it
    pub fn insert(&mut self, fragment: Fragment, now: Instant) -> Result<Option<Vec<u8>>, TunnelError> {
        self.purge(now);

        if fragment.count == 0 || fragment.index >= fragment.count {
            return Err(TunnelError::Framing(format!(
                "fragment {}/{} of packet {} is out of range",
                fragment.index, fragment.count, fragment.packet
            )));
        }

        if self.tombstones.contains(&fragment.packet) {
            debug!("Dropping late fragment {} of packet {}", fragment.index, fragment.packet);
            return Ok(None);
        }

        if !self.runs.contains_key(&fragment.packet) && self.runs.len() >= self.max_runs {
            self.evict_oldest();
        }

        let run = self
            .runs
            .entry(fragment.packet)
            .or_insert_with(|| Run::new(fragment.count, now));

        if run.slots.len() != usize::from(fragment.count) {
            return Err(TunnelError::Protocol(format!(
                "packet {} announced {} fragments, now {}",
                fragment.packet,
                run.slots.len(),
                fragment.count
            )));
        }

        match &run.slots[usize::from(fragment.index)] {
            Some(existing) if *existing == fragment.data => {
                debug!("Duplicate fragment {} of packet {}", fragment.index, fragment.packet);
                return Ok(None);
            }
            Some(_) => {
                return Err(TunnelError::Protocol(format!(
                    "conflicting data for fragment {} of packet {}",
                    fragment.index, fragment.packet
                )));
            }
            None => {}
        }

        run.slots[usize::from(fragment.index)] = Some(fragment.data);
        run.received += 1;
        if !run.is_complete() {
            return Ok(None);
        }

        let packet = match self.runs.remove(&fragment.packet) {
            Some(run) => run.assemble(),
            None => return Ok(None),
        };
        self.bury(fragment.packet);
        Ok(Some(packet))
    }

    /// Drop runs older than the reassembly timeout; returns how many
    pub fn purge(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let stale: Vec<u16> = self
            .runs
            .iter()
            .filter(|(_, run)| now.saturating_duration_since(run.created) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            if let Some(run) = self.runs.remove(id) {
                debug!(
                    "Purged stale packet {} ({}/{} fragments)",
                    id,
                    run.received,
                    run.slots.len()
                );
            }
            self.bury(*id);
        }
        stale.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .runs
            .iter()
            .min_by_key(|(_, run)| run.created)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            warn!("Reassembly slots full, evicting packet {}", id);
            self.runs.remove(&id);
            self.bury(id);
        }
    }

    fn bury(&mut self, id: u16) {
        if self.tombstones.insert(id) {
            self.tombstone_order.push_back(id);
        }
        while self.tombstone_order.len() > MAX_TOMBSTONES {
            if let Some(old) = self.tombstone_order.pop_front() {
                self.tombstones.remove(&old);
            }
        }
    }
}
