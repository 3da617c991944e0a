//! The pull-based block download scheduler.
//!
//! Work arrives as `(hash, height)` pairs and is cut into batches of eight.
//! Idle peers ask for work; the head batch is handed to whoever asks first.
//! Nothing is pushed: a slow peer simply asks less often, and the only thing
//! that gets a peer disconnected is delivering nothing at all for two full
//! rate windows. Slow is not stalled.
//!
//! Batches are owned by a slab and referenced by index, so ownership moves
//! between the queue and peer slots without any aliasing: a batch index is
//! either in the queue, or in exactly one peer slot, or on the free list.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use bitcoin::BlockHash;
use ibis_common::bitset::DenseBits;
use log::debug;
use log::info;
use log::warn;

use crate::peer::PeerId;

/// Blocks per work batch.
pub const DEFAULT_BATCH_SIZE: usize = 8;

/// Queue cap; `add_work` returns short counts beyond this many batches.
pub const DEFAULT_MAX_BATCHES: usize = 4096;

/// Rate-smoothing window for per-peer throughput.
pub const DEFAULT_PERF_WINDOW: Duration = Duration::from_millis(10_000);

/// Stalled-peer eviction is suppressed once this few reporting peers remain.
pub const DEFAULT_MIN_PEERS_TO_KEEP: usize = 3;

/// Largest getdata sent while draining a chunk.
const DRAIN_GETDATA_LIMIT: usize = 64;

/// How many peers may be asked for the same block during a drain pass.
const DRAIN_REDUNDANCY: u32 = 3;

/// Aggregate cap on redundant requests per drain pass, so an aggressive
/// drain cannot flood every peer at once.
const DRAIN_AGGREGATE_LIMIT: usize = 512;

/// Largest getdata sent while filling gaps.
const GAP_GETDATA_LIMIT: usize = 128;

/// Outbound actions the scheduler needs from its surroundings.
pub trait DownloadSink {
    fn send_getdata(&mut self, peer: PeerId, hashes: Vec<BlockHash>);
    fn disconnect_peer(&mut self, peer: PeerId, reason: &str);
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub batch_size: usize,
    pub max_batches: usize,
    pub perf_window: Duration,
    pub min_peers_to_keep: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            max_batches: DEFAULT_MAX_BATCHES,
            perf_window: DEFAULT_PERF_WINDOW,
            min_peers_to_keep: DEFAULT_MIN_PEERS_TO_KEEP,
        }
    }
}

#[derive(Debug)]
struct WorkBatch {
    hashes: Vec<BlockHash>,
    heights: Vec<u32>,
    /// Bit per entry, set once that block arrived.
    received: u32,
    remaining: usize,
    /// `None` while queued, the assignment time while a peer holds it.
    assigned_at: Option<Instant>,
}

impl WorkBatch {
    fn new() -> Self {
        WorkBatch {
            hashes: Vec::new(),
            heights: Vec::new(),
            received: 0,
            remaining: 0,
            assigned_at: None,
        }
    }

    fn push(&mut self, hash: BlockHash, height: u32) {
        self.hashes.push(hash);
        self.heights.push(height);
        self.remaining += 1;
    }

    fn is_received(&self, pos: usize) -> bool {
        self.received & (1 << pos) != 0
    }

    fn mark_received(&mut self, pos: usize) {
        self.received |= 1 << pos;
        self.remaining -= 1;
    }
}

#[derive(Debug)]
struct PeerPerf {
    batch: Option<usize>,
    bytes_this_window: u64,
    window_start: Instant,
    bytes_per_second: u64,
    /// Whether this peer ever delivered anything. Peers that haven't are
    /// still warming up and exempt from eviction.
    has_reported: bool,
    last_delivery: Instant,
    first_work_at: Option<Instant>,
}

impl PeerPerf {
    fn new(now: Instant) -> Self {
        PeerPerf {
            batch: None,
            bytes_this_window: 0,
            window_start: now,
            bytes_per_second: 0,
            has_reported: false,
            last_delivery: now,
            first_work_at: None,
        }
    }
}

pub struct DownloadManager {
    config: DownloadConfig,

    /// Batch slab plus free list; `queue` holds indices of unassigned batches.
    batches: Vec<Option<WorkBatch>>,
    free_slots: Vec<usize>,
    queue: VecDeque<usize>,

    /// Deterministic iteration order matters for the staggered offsets.
    peers: BTreeMap<PeerId, PeerPerf>,

    /// One bit per height that is queued or in flight and not yet received.
    tracked: DenseBits,
    pending_blocks: usize,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig) -> Self {
        DownloadManager {
            config,
            batches: Vec::new(),
            free_slots: Vec::new(),
            queue: VecDeque::new(),
            peers: BTreeMap::new(),
            tracked: DenseBits::with_capacity(1 << 20),
            pending_blocks: 0,
        }
    }

    /// Registers a peer. Re-adding a known peer changes nothing.
    pub fn add_peer(&mut self, peer: PeerId) {
        self.peers
            .entry(peer)
            .or_insert_with(|| PeerPerf::new(Instant::now()));
    }

    /// Forgets a peer. An unfinished batch goes back to the head of the
    /// queue; a finished one is freed.
    pub fn remove_peer(&mut self, peer: PeerId) {
        let Some(perf) = self.peers.remove(&peer) else {
            return;
        };
        if let Some(index) = perf.batch {
            let batch = self.batches[index]
                .as_mut()
                .expect("peer slots only hold live batches");
            if batch.remaining > 0 {
                batch.assigned_at = None;
                self.queue.push_front(index);
                debug!("{peer} left, batch of {} blocks requeued", batch.remaining);
            } else {
                self.free_batch(index);
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peers currently holding a batch with undelivered blocks.
    pub fn active_peer_count(&self) -> usize {
        self.peers
            .values()
            .filter(|perf| {
                perf.batch
                    .is_some_and(|index| self.batches[index].as_ref().unwrap().remaining > 0)
            })
            .count()
    }

    pub fn queued_batches(&self) -> usize {
        self.queue.len()
    }

    /// Heights queued or in flight, not yet received.
    pub fn pending_blocks(&self) -> usize {
        self.pending_blocks
    }

    /// Undelivered blocks across the batches peers are holding right now.
    /// Queued batches don't count; nobody asked for those yet.
    pub fn in_flight_blocks(&self) -> usize {
        self.peers
            .values()
            .filter_map(|perf| perf.batch)
            .map(|index| self.batch(index).remaining)
            .sum()
    }

    /// Whether `height` is queued or in flight.
    pub fn has_height(&self, height: u32) -> bool {
        self.tracked.get(height as usize)
    }

    /// Appends work in FIFO order, batching it up. Heights already tracked
    /// are skipped, so re-adding the same range is a no-op. Returns how many
    /// items were queued; a short count means the queue is full and the
    /// caller should back off.
    pub fn add_work(&mut self, items: &[(BlockHash, u32)]) -> usize {
        let mut added = 0;

        for &(hash, height) in items {
            if self.tracked.get(height as usize) {
                continue;
            }

            // Top up the tail batch before opening a new one
            let tail = self
                .queue
                .back()
                .copied()
                .filter(|&index| self.batch(index).hashes.len() < self.config.batch_size);

            let index = match tail {
                Some(index) => index,
                None => {
                    if self.queue.len() >= self.config.max_batches {
                        warn!("download queue full, accepted {added} items");
                        break;
                    }
                    let index = self.alloc_batch();
                    self.queue.push_back(index);
                    index
                }
            };

            self.batches[index]
                .as_mut()
                .expect("queued batches are live")
                .push(hash, height);
            self.tracked.set(height as usize);
            self.pending_blocks += 1;
            added += 1;
        }
        added
    }

    /// An idle peer asking for work. Frees the peer's batch if it delivered
    /// everything, then assigns the head of the queue. Returns whether work
    /// was handed out. Peers that find the queue empty just ask again later;
    /// starvation is cooperative.
    pub fn peer_request_work(&mut self, peer: PeerId, sink: &mut dyn DownloadSink) -> bool {
        let Some(perf) = self.peers.get_mut(&peer) else {
            return false;
        };

        if let Some(index) = perf.batch {
            if self.batches[index].as_ref().unwrap().remaining > 0 {
                // Still has work outstanding
                return false;
            }
            perf.batch = None;
            self.free_batch(index);
        }

        let Some(index) = self.queue.pop_front() else {
            return false;
        };

        let now = Instant::now();
        let perf = self.peers.get_mut(&peer).expect("checked above");
        perf.batch = Some(index);
        perf.first_work_at.get_or_insert(now);

        let batch = self.batches[index].as_mut().expect("queued batches are live");
        batch.assigned_at = Some(now);
        let hashes = batch.hashes.clone();

        sink.send_getdata(peer, hashes);
        true
    }

    /// A block arrived from `peer`. Returns `true` only for the first
    /// delivery of a block we are waiting for; duplicates and strays return
    /// `false`. Deliveries from unknown peers are accepted but not counted
    /// towards anyone's rate.
    pub fn block_received(&mut self, peer: PeerId, hash: BlockHash, size: u64) -> bool {
        let now = Instant::now();
        if let Some(perf) = self.peers.get_mut(&peer) {
            perf.bytes_this_window += size;
            perf.last_delivery = now;
        }

        // The peer's own batch is the common case; a hit anywhere else means
        // a drain pass requested this block redundantly
        let Some((index, pos)) = self.find_batch_entry(peer, hash) else {
            return false;
        };

        let batch = self.batches[index].as_mut().expect("found batches are live");
        if batch.is_received(pos) {
            return false;
        }
        batch.mark_received(pos);
        let height = batch.heights[pos];
        self.tracked.clear(height as usize);
        self.pending_blocks -= 1;
        true
    }

    /// Rolls the rate windows and disconnects peers that delivered nothing
    /// for two full windows. Eviction stops once only `min_peers_to_keep`
    /// reporting peers would remain; warming-up peers are never evicted.
    /// Returns how many peers were dropped.
    pub fn check_performance(&mut self, sink: &mut dyn DownloadSink) -> usize {
        let now = Instant::now();
        let window = self.config.perf_window;

        for perf in self.peers.values_mut() {
            if now.duration_since(perf.window_start) >= window {
                perf.bytes_per_second =
                    perf.bytes_this_window * 1000 / window.as_millis().max(1) as u64;
                if perf.bytes_this_window > 0 {
                    perf.has_reported = true;
                }
                perf.bytes_this_window = 0;
                perf.window_start = now;
            }
        }

        let reporting = self.peers.values().filter(|p| p.has_reported).count();
        let stalled: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, perf)| {
                perf.has_reported
                    && perf.first_work_at.is_some()
                    && perf.bytes_per_second == 0
                    && now.duration_since(perf.last_delivery) > window * 2
            })
            .map(|(&id, _)| id)
            .collect();

        let mut dropped = 0;
        for peer in stalled {
            if reporting - dropped <= self.config.min_peers_to_keep {
                break;
            }
            info!("{peer} stalled, disconnecting");
            sink.disconnect_peer(peer, "stalled: no data for two rate windows");
            self.remove_peer(peer);
            dropped += 1;
        }
        dropped
    }

    /// Re-requests outstanding blocks from idle peers, three peers per block,
    /// to finish off a chunk. With a zero `stall_timeout` every in-flight
    /// batch is collected; otherwise only batches held by peers that have
    /// been quiet longer than the timeout. Returns the number of getdata
    /// messages sent.
    pub fn drain_accelerate(
        &mut self,
        stall_timeout: Duration,
        sink: &mut dyn DownloadSink,
    ) -> usize {
        let now = Instant::now();

        let mut outstanding = Vec::new();
        for perf in self.peers.values() {
            let Some(index) = perf.batch else {
                continue;
            };
            let batch = self.batches[index].as_ref().expect("live");

            if !stall_timeout.is_zero() {
                // Quiet time counts from whichever came last: the batch being
                // assigned or the peer's most recent delivery
                let busy_since = match batch.assigned_at {
                    Some(assigned) => assigned.max(perf.last_delivery),
                    None => perf.last_delivery,
                };
                if now.duration_since(busy_since) <= stall_timeout {
                    continue;
                }
            }

            for pos in 0..batch.hashes.len() {
                if !batch.is_received(pos) {
                    outstanding.push(batch.hashes[pos]);
                }
            }
        }
        if outstanding.is_empty() {
            return 0;
        }

        let idle: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, perf)| {
                perf.batch
                    .map_or(true, |index| self.batches[index].as_ref().unwrap().remaining == 0)
            })
            .map(|(&id, _)| id)
            .collect();
        if idle.is_empty() {
            return 0;
        }

        let mut requested = vec![0u32; outstanding.len()];
        let mut budget = DRAIN_AGGREGATE_LIMIT;
        let mut messages = 0;

        for (i, &peer) in idle.iter().enumerate() {
            // Stagger each peer's starting point across the outstanding list
            let start = i * outstanding.len() / idle.len();
            let mut hashes = Vec::new();

            for k in 0..outstanding.len() {
                let index = (start + k) % outstanding.len();
                if requested[index] >= DRAIN_REDUNDANCY {
                    continue;
                }
                requested[index] += 1;
                hashes.push(outstanding[index]);
                budget -= 1;
                if hashes.len() == DRAIN_GETDATA_LIMIT || budget == 0 {
                    break;
                }
            }

            if !hashes.is_empty() {
                sink.send_getdata(peer, hashes);
                messages += 1;
            }
            if budget == 0 {
                break;
            }
        }
        messages
    }

    /// Requests a list of gap hashes from up to `max_peers` peers at once,
    /// each starting at a different offset so the requests interleave.
    /// Returns the number of getdata messages sent.
    pub fn fill_gaps_staggered(
        &mut self,
        hashes: &[BlockHash],
        max_peers: usize,
        sink: &mut dyn DownloadSink,
    ) -> usize {
        if hashes.is_empty() {
            return 0;
        }
        let peers: Vec<PeerId> = self.peers.keys().copied().take(max_peers).collect();
        if peers.is_empty() {
            return 0;
        }

        let count = hashes.len();
        let mut messages = 0;
        for (p, &peer) in peers.iter().enumerate() {
            let start = p * count / peers.len();
            let rotated: Vec<BlockHash> = (0..count.min(GAP_GETDATA_LIMIT))
                .map(|k| hashes[(start + k) % count])
                .collect();
            sink.send_getdata(peer, rotated);
            messages += 1;
        }
        messages
    }

    /// Drops every queued and in-flight batch and clears the bitmap, for a
    /// full chunk restart. Peers stay registered.
    pub fn clear_work(&mut self) {
        let indices: Vec<usize> = self
            .queue
            .drain(..)
            .chain(self.peers.values_mut().filter_map(|perf| perf.batch.take()))
            .collect();
        for index in indices {
            self.free_batch(index);
        }
        self.pending_blocks = 0;
    }

    fn batch(&self, index: usize) -> &WorkBatch {
        self.batches[index].as_ref().expect("live batch index")
    }

    fn alloc_batch(&mut self) -> usize {
        match self.free_slots.pop() {
            Some(index) => {
                self.batches[index] = Some(WorkBatch::new());
                index
            }
            None => {
                self.batches.push(Some(WorkBatch::new()));
                self.batches.len() - 1
            }
        }
    }

    fn free_batch(&mut self, index: usize) {
        if let Some(batch) = self.batches[index].take() {
            // Anything undelivered stops being tracked
            for pos in 0..batch.heights.len() {
                if !batch.is_received(pos) {
                    self.tracked.clear(batch.heights[pos] as usize);
                    self.pending_blocks -= 1;
                }
            }
        }
        self.free_slots.push(index);
    }

    /// Locates `hash` in any in-flight batch, preferring `peer`'s own.
    fn find_batch_entry(&self, peer: PeerId, hash: BlockHash) -> Option<(usize, usize)> {
        let in_batch = |index: usize| {
            self.batch(index)
                .hashes
                .iter()
                .position(|&h| h == hash)
                .map(|pos| (index, pos))
        };

        if let Some(index) = self.peers.get(&peer).and_then(|perf| perf.batch) {
            if let Some(found) = in_batch(index) {
                return Some(found);
            }
        }
        self.peers
            .values()
            .filter_map(|perf| perf.batch)
            .find_map(in_batch)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        getdata: Vec<(PeerId, Vec<BlockHash>)>,
        disconnects: Vec<PeerId>,
    }

    impl DownloadSink for RecordingSink {
        fn send_getdata(&mut self, peer: PeerId, hashes: Vec<BlockHash>) {
            self.getdata.push((peer, hashes));
        }

        fn disconnect_peer(&mut self, peer: PeerId, _reason: &str) {
            self.disconnects.push(peer);
        }
    }

    fn hash(height: u32) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&height.to_le_bytes());
        BlockHash::from_byte_array(bytes)
    }

    fn work(range: std::ops::RangeInclusive<u32>) -> Vec<(BlockHash, u32)> {
        range.map(|height| (hash(height), height)).collect()
    }

    fn manager() -> DownloadManager {
        DownloadManager::new(DownloadConfig::default())
    }

    #[test]
    fn single_peer_works_through_two_batches() {
        let mut dm = manager();
        let mut sink = RecordingSink::default();
        let peer = PeerId(100);

        dm.add_peer(peer);
        assert_eq!(dm.add_work(&work(1..=16)), 16);
        assert_eq!(dm.queued_batches(), 2);
        assert_eq!(dm.pending_blocks(), 16);

        // First batch: heights 1..=8
        assert!(dm.peer_request_work(peer, &mut sink));
        assert_eq!(sink.getdata.last().unwrap().1.len(), 8);
        for height in 1..=8 {
            assert!(dm.block_received(peer, hash(height), 1000));
        }
        assert_eq!(dm.active_peer_count(), 0);

        // Second batch: heights 9..=16
        assert!(dm.peer_request_work(peer, &mut sink));
        assert_eq!(dm.active_peer_count(), 1);
        for height in 9..=16 {
            assert!(dm.block_received(peer, hash(height), 1000));
        }

        assert_eq!(dm.pending_blocks(), 0);
        for height in 1..=16 {
            assert!(!dm.has_height(height), "height {height} still tracked");
        }
        assert_eq!(dm.active_peer_count(), 0);

        // Nothing left
        assert!(!dm.peer_request_work(peer, &mut sink));
    }

    #[test]
    fn disconnect_mid_batch_requeues_at_the_head() {
        let mut dm = manager();
        let mut sink = RecordingSink::default();
        let first = PeerId(1);

        dm.add_peer(first);
        dm.add_work(&work(1..=8));
        // A second range, to prove the returned batch jumps the queue
        dm.add_work(&work(9..=16));

        assert!(dm.peer_request_work(first, &mut sink));
        for height in 1..=3 {
            assert!(dm.block_received(first, hash(height), 1000));
        }

        dm.remove_peer(first);
        assert_eq!(dm.queued_batches(), 2);
        // Bits for the undelivered half survive the requeue
        for height in 4..=8 {
            assert!(dm.has_height(height));
        }
        for height in 1..=3 {
            assert!(!dm.has_height(height));
        }

        // A new peer pulls the same batch back, re-requesting all eight
        let second = PeerId(2);
        dm.add_peer(second);
        assert!(dm.peer_request_work(second, &mut sink));
        let (_, hashes) = sink.getdata.last().unwrap();
        assert_eq!(hashes.len(), 8);
        assert_eq!(hashes[0], hash(1));

        // Re-delivering already-received blocks doesn't double count
        assert!(!dm.block_received(second, hash(1), 1000));
        assert!(dm.block_received(second, hash(4), 1000));
        assert_eq!(dm.pending_blocks(), 8 + 4);
    }

    #[test]
    fn add_work_is_idempotent() {
        let mut dm = manager();
        assert_eq!(dm.add_work(&work(1..=8)), 8);
        assert_eq!(dm.add_work(&work(1..=8)), 0);
        assert_eq!(dm.pending_blocks(), 8);
        assert_eq!(dm.queued_batches(), 1);
    }

    #[test]
    fn add_work_stops_at_the_queue_cap() {
        let mut dm = DownloadManager::new(DownloadConfig {
            max_batches: 2,
            ..Default::default()
        });
        // Three batches' worth of work into a two-batch queue
        assert_eq!(dm.add_work(&work(1..=24)), 16);
        assert_eq!(dm.queued_batches(), 2);
        assert!(!dm.has_height(17));
    }

    #[test]
    fn unknown_peers_and_strays_are_uncounted() {
        let mut dm = manager();
        let mut sink = RecordingSink::default();
        let peer = PeerId(1);
        dm.add_peer(peer);
        dm.add_work(&work(1..=8));
        dm.peer_request_work(peer, &mut sink);

        // A block nobody asked for
        assert!(!dm.block_received(peer, hash(99), 1000));
        // A delivery from a peer we never met still lands in the batch
        assert!(dm.block_received(PeerId(42), hash(1), 1000));
    }

    #[test]
    fn stalled_peers_are_dropped_but_never_below_the_floor() {
        let window = Duration::from_millis(30);
        let mut dm = DownloadManager::new(DownloadConfig {
            perf_window: window,
            min_peers_to_keep: 3,
            ..Default::default()
        });
        let mut sink = RecordingSink::default();

        // Four reporting peers and one that never delivered anything
        for id in 1..=5 {
            dm.add_peer(PeerId(id));
        }
        dm.add_work(&work(1..=8));
        dm.peer_request_work(PeerId(1), &mut sink);
        for id in 1..=4 {
            dm.block_received(PeerId(id), hash(1), 1000);
        }

        // First roll: everyone who delivered becomes a reporter
        std::thread::sleep(window + Duration::from_millis(10));
        assert_eq!(dm.check_performance(&mut sink), 0);

        // Second roll, well past two windows of silence
        std::thread::sleep(window * 2 + Duration::from_millis(10));
        let dropped = dm.check_performance(&mut sink);

        // Only one eviction fits above the three-reporter floor, and the
        // warming-up peer is untouched
        assert_eq!(dropped, 1);
        assert_eq!(sink.disconnects.len(), 1);
        assert!(dm.peers.contains_key(&PeerId(5)));
        assert_eq!(dm.peer_count(), 4);
        // The evicted peer's batch went back to the queue
        assert_eq!(dm.queued_batches(), 1);
    }

    #[test]
    fn drain_redistributes_to_idle_peers() {
        let mut dm = manager();
        let mut sink = RecordingSink::default();

        for id in 1..=4 {
            dm.add_peer(PeerId(id));
        }
        dm.add_work(&work(1..=8));
        assert!(dm.peer_request_work(PeerId(1), &mut sink));
        // Five of eight delivered; three outstanding
        for height in 1..=5 {
            dm.block_received(PeerId(1), hash(height), 1000);
        }
        sink.getdata.clear();

        // Zero timeout: maximum aggression, collect from everyone
        let messages = dm.drain_accelerate(Duration::ZERO, &mut sink);
        assert_eq!(messages, 3); // three idle peers, peer 1 is busy

        // Each outstanding block requested at most three times in total
        let mut per_block = std::collections::HashMap::new();
        for (_, hashes) in &sink.getdata {
            assert!(hashes.len() <= 64);
            for h in hashes {
                *per_block.entry(*h).or_insert(0u32) += 1;
            }
        }
        assert_eq!(per_block.len(), 3);
        assert!(per_block.values().all(|&n| n <= 3));

        // A redundant delivery from an idle peer completes the batch
        assert!(dm.block_received(PeerId(3), hash(6), 1000));
        assert!(!dm.block_received(PeerId(1), hash(6), 1000));
    }

    #[test]
    fn drain_with_timeout_skips_lively_peers() {
        let mut dm = manager();
        let mut sink = RecordingSink::default();

        dm.add_peer(PeerId(1));
        dm.add_peer(PeerId(2));
        dm.add_work(&work(1..=8));
        dm.peer_request_work(PeerId(1), &mut sink);
        dm.block_received(PeerId(1), hash(1), 1000);
        sink.getdata.clear();

        // Peer 1 delivered just now, so a generous timeout collects nothing
        let messages = dm.drain_accelerate(Duration::from_secs(60), &mut sink);
        assert_eq!(messages, 0);
    }

    #[test]
    fn gap_fill_staggers_offsets() {
        let mut dm = manager();
        let mut sink = RecordingSink::default();

        for id in 1..=2 {
            dm.add_peer(PeerId(id));
        }
        let gaps: Vec<BlockHash> = (1..=6).map(hash).collect();
        let messages = dm.fill_gaps_staggered(&gaps, 8, &mut sink);
        assert_eq!(messages, 2);

        // Peer zero starts at the head, peer one halfway through
        assert_eq!(sink.getdata[0].1[0], hash(1));
        assert_eq!(sink.getdata[1].1[0], hash(4));
        // Both requests cover the whole list
        assert_eq!(sink.getdata[0].1.len(), 6);
        assert_eq!(sink.getdata[1].1.len(), 6);
    }

    #[test]
    fn clear_work_releases_everything() {
        let mut dm = manager();
        let mut sink = RecordingSink::default();

        dm.add_peer(PeerId(1));
        dm.add_work(&work(1..=20));
        dm.peer_request_work(PeerId(1), &mut sink);

        dm.clear_work();
        assert_eq!(dm.pending_blocks(), 0);
        assert_eq!(dm.queued_batches(), 0);
        for height in 1..=20 {
            assert!(!dm.has_height(height));
        }
        // The peer is still with us and can pull new work
        dm.add_work(&work(21..=28));
        assert!(dm.peer_request_work(PeerId(1), &mut sink));
    }
}
