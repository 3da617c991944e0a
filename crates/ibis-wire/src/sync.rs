//! The sync state machine driving initial block download.
//!
//! One pass of the machine is headers, then repeated rounds of download →
//! drain → validate → flush → prune until the validated tip meets the header
//! tip. The machine itself never touches a socket or a database: everything
//! external happens through [SyncEnvironment], and the chunk validator runs
//! on its own worker thread, reporting back through [WorkerOutcome].

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use std::time::Instant;

use bitcoin::block::Header as BlockHeader;
use bitcoin::consensus::serialize;
use bitcoin::Block;
use bitcoin::BlockHash;
use ibis_chain::BlockTracker;
use ibis_chain::BlockchainError;
use ibis_chain::ChunkError;
use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::download_manager::DownloadConfig;
use crate::download_manager::DownloadManager;
use crate::peer::PeerId;

/// Block files this far below the validated tip must stay on disk so a
/// reorganization can still be processed.
pub const REORG_MARGIN: u32 = 550;

/// How often (in validated blocks) the chainstate gets a durability fence.
pub const CHECKPOINT_INTERVAL: u32 = 10_000;

/// A full headers message; anything shorter means the sender ran out.
pub const MAX_HEADERS_PER_MESSAGE: usize = 2000;

/// Blocks validated and flushed per chunk.
pub const DEFAULT_CHUNK_SIZE: u32 = 2016;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Idle,
    Headers,
    Download,
    Drain,
    Validate,
    Flush,
    Prune,
    Done,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncMode::Idle => "idle",
            SyncMode::Headers => "headers",
            SyncMode::Download => "download",
            SyncMode::Drain => "drain",
            SyncMode::Validate => "validate",
            SyncMode::Flush => "flush",
            SyncMode::Prune => "prune",
            SyncMode::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub chunk_size: u32,
    pub assume_valid_height: u32,
    /// Zero means archival: checkpoint, but never delete block files.
    pub prune_target_bytes: u64,
    pub reorg_margin: u32,
    pub checkpoint_interval: u32,
    /// How long a gap may block the drain before gap-fill requests go out.
    pub stall_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            assume_valid_height: 0,
            prune_target_bytes: 0,
            reorg_margin: REORG_MARGIN,
            checkpoint_interval: CHECKPOINT_INTERVAL,
            stall_timeout: Duration::from_secs(5),
        }
    }
}

/// Reports from the validator worker.
#[derive(Debug, Clone)]
pub enum WorkerOutcome {
    ChunkValidated { end: u32 },
    ChunkInvalid(ChunkError),
    /// A block file was unreadable or didn't parse, e.g. a torn write. Not a
    /// peer's fault; the height just needs re-fetching.
    ChunkUnavailable { height: u32 },
    ChunkFlushed { new_tip: u32 },
    Fatal(String),
}

/// Everything the sync machine needs from the outside world. The node
/// implements this over its peers, the header chain, the block store and the
/// validator worker.
pub trait SyncEnvironment: crate::download_manager::DownloadSink {
    /// Sends `getheaders` with a locator for the current header tip.
    fn request_headers(&mut self, peer: PeerId);

    /// Validates a header and extends the header chain. Returns its height.
    fn accept_header(&mut self, header: &BlockHeader) -> Result<u32, BlockchainError>;

    fn header_tip(&self) -> u32;
    fn block_hash_at(&self, height: u32) -> Option<BlockHash>;
    fn height_of(&self, hash: &BlockHash) -> Option<u32>;

    /// Persists a block file and marks the index entry `HAVE_DATA`.
    fn store_block(&mut self, height: u32, bytes: &[u8]) -> Result<(), BlockchainError>;

    /// Deletes a block file that failed validation, clearing `HAVE_DATA`.
    fn remove_block(&mut self, height: u32) -> Result<(), BlockchainError>;

    /// `(used_bytes, prune_target_bytes)`.
    fn storage_info(&self) -> (u64, u64);

    /// Wakes the validator worker for `[start, end]`.
    fn begin_chunk_validation(&mut self, start: u32, end: u32);

    /// Tells the worker to commit the batch it validated.
    fn begin_chunk_flush(&mut self);

    /// Removes block files at heights `<= up_to` and marks them pruned.
    fn prune_block_files(&mut self, up_to: u32) -> Result<u64, BlockchainError>;

    fn checkpoint_chainstate(&mut self) -> Result<(), BlockchainError>;
}

/// A point-in-time view of sync progress, for logging and introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub mode: String,
    pub validated_tip: u32,
    pub header_tip: u32,
    pub highest_stored: u32,
    pub pending_blocks: usize,
    pub queued_batches: usize,
    pub connected_peers: usize,
    pub headers_accepted: u64,
    pub blocks_stored: u64,
    pub flushed_chunks: u64,
    pub invalid_chunks: u64,
    pub pruned_files: u64,
}

pub struct SyncManager {
    config: SyncConfig,
    mode: SyncMode,
    downloads: DownloadManager,
    tracker: BlockTracker,

    /// Upper height of the chunk currently being fetched.
    chunk_end: u32,
    /// Which peer delivered each stored height, so an invalid block can be
    /// pinned on its sender.
    delivered_by: HashMap<u32, PeerId>,
    /// The gap currently blocking the drain, and since when.
    blocking: Option<(u32, Instant)>,
    last_checkpoint: u32,

    headers_accepted: u64,
    blocks_stored: u64,
    flushed_chunks: u64,
    invalid_chunks: u64,
    pruned_files: u64,
}

impl SyncManager {
    pub fn new(config: SyncConfig, downloads: DownloadConfig, validated_tip: u32) -> Self {
        SyncManager {
            config,
            mode: SyncMode::Idle,
            downloads: DownloadManager::new(downloads),
            tracker: BlockTracker::new(validated_tip),
            chunk_end: validated_tip,
            delivered_by: HashMap::new(),
            blocking: None,
            last_checkpoint: validated_tip,
            headers_accepted: 0,
            blocks_stored: 0,
            flushed_chunks: 0,
            invalid_chunks: 0,
            pruned_files: 0,
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn validated_tip(&self) -> u32 {
        self.tracker.validated_tip()
    }

    /// Marks blocks found on disk at startup, so a restarted node doesn't
    /// re-download what it already has.
    pub fn seed_stored(&mut self, heights: &[u32]) {
        for &height in heights {
            self.tracker.mark_available(height);
        }
    }

    pub fn stats<E: SyncEnvironment>(&self, env: &E) -> SyncStats {
        SyncStats {
            mode: self.mode.to_string(),
            validated_tip: self.tracker.validated_tip(),
            header_tip: env.header_tip(),
            highest_stored: self.tracker.highest_stored(),
            pending_blocks: self.downloads.pending_blocks(),
            queued_batches: self.downloads.queued_batches(),
            connected_peers: self.downloads.peer_count(),
            headers_accepted: self.headers_accepted,
            blocks_stored: self.blocks_stored,
            flushed_chunks: self.flushed_chunks,
            invalid_chunks: self.invalid_chunks,
            pruned_files: self.pruned_files,
        }
    }

    /// A new peer is ready to talk. The first one starts the headers phase.
    pub fn peer_connected<E: SyncEnvironment>(&mut self, peer: PeerId, env: &mut E) {
        self.downloads.add_peer(peer);
        match self.mode {
            SyncMode::Idle => {
                info!("starting header sync");
                self.mode = SyncMode::Headers;
                env.request_headers(peer);
            }
            SyncMode::Headers => env.request_headers(peer),
            _ => {}
        }
    }

    pub fn peer_disconnected(&mut self, peer: PeerId) {
        self.downloads.remove_peer(peer);
    }

    /// A headers message. A full message means the peer has more; a short
    /// one means we reached its tip.
    pub fn on_headers<E: SyncEnvironment>(
        &mut self,
        peer: PeerId,
        headers: Vec<BlockHeader>,
        env: &mut E,
    ) -> Result<(), BlockchainError> {
        let count = headers.len();

        for header in headers {
            match env.accept_header(&header) {
                Ok(_) => self.headers_accepted += 1,
                Err(BlockchainError::BlockValidation(e)) => {
                    warn!("sync phase={} height={} kind=invalid-header message={e}",
                        self.mode, env.header_tip() + 1);
                    self.disconnect(peer, "invalid header", env);
                    return Ok(());
                }
                Err(fatal) => return Err(fatal),
            }
        }

        if count >= MAX_HEADERS_PER_MESSAGE {
            env.request_headers(peer);
        } else if self.mode == SyncMode::Headers {
            self.enter_download(env);
        } else if self.mode == SyncMode::Done && env.header_tip() > self.tracker.validated_tip() {
            // The chain moved on while we were done; go get it
            self.enter_download(env);
        }
        Ok(())
    }

    /// A block message. Blocks we never asked for and blocks we already have
    /// are benign; everything else is written to disk and tracked.
    pub fn on_block<E: SyncEnvironment>(
        &mut self,
        peer: PeerId,
        block: &Block,
        env: &mut E,
    ) -> Result<(), BlockchainError> {
        let hash = block.block_hash();
        let Some(height) = env.height_of(&hash) else {
            debug!("{peer} sent block {hash} outside the header chain");
            return Ok(());
        };

        let bytes = serialize(block);
        self.downloads.block_received(peer, hash, bytes.len() as u64);

        if height <= self.tracker.validated_tip() || self.tracker.has_block(height) {
            return Ok(());
        }

        env.store_block(height, &bytes)?;
        self.tracker.mark_available(height);
        self.delivered_by.insert(height, peer);
        self.blocks_stored += 1;
        Ok(())
    }

    /// An idle peer polling for work. Returns whether work was assigned.
    pub fn peer_idle<E: SyncEnvironment>(&mut self, peer: PeerId, env: &mut E) -> bool {
        match self.mode {
            SyncMode::Download | SyncMode::Drain => self.downloads.peer_request_work(peer, env),
            _ => false,
        }
    }

    /// One scheduler tick. Drives the phase the machine is in; the waiting
    /// phases (headers, validate, flush) advance on messages instead.
    pub fn tick<E: SyncEnvironment>(&mut self, env: &mut E) -> Result<(), BlockchainError> {
        match self.mode {
            SyncMode::Idle | SyncMode::Headers | SyncMode::Validate | SyncMode::Flush
            | SyncMode::Done => {}

            SyncMode::Download => {
                self.downloads.check_performance(env);
                self.enqueue_chunk_work(env);

                let (used, target) = env.storage_info();
                if target > 0 && used >= target {
                    info!("storage at {used} of {target} bytes, draining early");
                    self.mode = SyncMode::Drain;
                } else if self.chunk_complete() {
                    self.mode = SyncMode::Drain;
                }
            }

            SyncMode::Drain => {
                self.downloads.check_performance(env);

                if let Some((start, end)) = self.tracker.find_consecutive_range() {
                    if end >= self.chunk_end || self.downloads.in_flight_blocks() == 0 {
                        self.begin_validate(start, end.min(self.chunk_end), env);
                        return Ok(());
                    }
                } else if self.downloads.in_flight_blocks() == 0 {
                    // The very next block is missing and nothing is in
                    // flight; fall back to normal downloading
                    self.mode = SyncMode::Download;
                    return Ok(());
                }

                self.downloads.drain_accelerate(self.config.stall_timeout, env);
                self.fill_gaps(env);
            }

            SyncMode::Prune => self.run_prune(env)?,
        }
        Ok(())
    }

    /// A report from the validator worker.
    pub fn on_worker_outcome<E: SyncEnvironment>(
        &mut self,
        outcome: WorkerOutcome,
        env: &mut E,
    ) -> Result<(), BlockchainError> {
        match outcome {
            WorkerOutcome::ChunkValidated { end } => {
                debug!("chunk validated up to {end}, flushing");
                self.mode = SyncMode::Flush;
                env.begin_chunk_flush();
            }
            WorkerOutcome::ChunkInvalid(err) => self.handle_invalid_chunk(err, env)?,
            WorkerOutcome::ChunkUnavailable { height } => {
                warn!(
                    "sync phase={} height={height} kind=missing-block message=block file unusable",
                    self.mode
                );
                env.remove_block(height)?;
                self.tracker.mark_missing(height);
                self.delivered_by.remove(&height);
                self.enter_download(env);
            }
            WorkerOutcome::ChunkFlushed { new_tip } => self.on_flushed(new_tip, env)?,
            WorkerOutcome::Fatal(message) => {
                error!("sync phase={} height={} kind=fatal message={message}",
                    self.mode, self.tracker.validated_tip());
                return Err(BlockchainError::Database(message));
            }
        }
        Ok(())
    }

    fn enter_download<E: SyncEnvironment>(&mut self, env: &mut E) {
        let header_tip = env.header_tip();
        let validated = self.tracker.validated_tip();
        if header_tip <= validated {
            info!("synced to the header tip at {validated}");
            self.mode = SyncMode::Done;
            return;
        }

        self.chunk_end = header_tip.min(validated + self.config.chunk_size);
        self.blocking = None;
        if self.mode != SyncMode::Download {
            info!(
                "downloading blocks {}..={} of {header_tip}",
                validated + 1,
                self.chunk_end
            );
        }
        self.mode = SyncMode::Download;
    }

    /// Queues every height of the current chunk that is neither stored nor
    /// already in flight. Safe to call every tick; the download manager
    /// drops duplicates.
    fn enqueue_chunk_work<E: SyncEnvironment>(&mut self, env: &mut E) {
        let validated = self.tracker.validated_tip();
        let header_tip = env.header_tip();
        if header_tip <= validated {
            return;
        }
        self.chunk_end = header_tip.min(validated + self.config.chunk_size);

        let mut items = Vec::new();
        for height in validated + 1..=self.chunk_end {
            if self.tracker.has_block(height) || self.downloads.has_height(height) {
                continue;
            }
            let Some(hash) = env.block_hash_at(height) else {
                break;
            };
            items.push((hash, height));
        }

        if !items.is_empty() {
            let added = self.downloads.add_work(&items);
            if added < items.len() {
                debug!("download queue full, deferred {}", items.len() - added);
            }
        }
    }

    fn chunk_complete(&self) -> bool {
        self.tracker
            .find_consecutive_range()
            .is_some_and(|(_, end)| end >= self.chunk_end)
    }

    fn begin_validate<E: SyncEnvironment>(&mut self, start: u32, end: u32, env: &mut E) {
        info!("validating blocks {start}..={end}");
        self.blocking = None;
        self.mode = SyncMode::Validate;
        env.begin_chunk_validation(start, end);
    }

    /// Tracks how long the first missing height has been blocking the drain
    /// and fires staggered gap-fill requests once it exceeds the stall
    /// timeout.
    fn fill_gaps<E: SyncEnvironment>(&mut self, env: &mut E) {
        let blocking = self.tracker.find_blocking_block();
        if blocking > self.tracker.highest_stored() {
            self.blocking = None;
            return;
        }

        match self.blocking {
            Some((height, since)) if height == blocking => {
                if since.elapsed() > self.config.stall_timeout {
                    let hashes: Vec<BlockHash> = (blocking..=self.chunk_end)
                        .filter(|&h| !self.tracker.has_block(h))
                        .filter_map(|h| env.block_hash_at(h))
                        .take(128)
                        .collect();
                    let sent = self.downloads.fill_gaps_staggered(&hashes, 8, env);
                    debug!("gap at {blocking}, sent {sent} staggered requests");
                    self.blocking = Some((blocking, Instant::now()));
                }
            }
            _ => self.blocking = Some((blocking, Instant::now())),
        }
    }

    /// One block failed consensus. Pin it on the peer that sent it, drop the
    /// file, and restart the chunk from scratch; the blocks that were fine
    /// are still on disk and satisfy the re-download instantly.
    fn handle_invalid_chunk<E: SyncEnvironment>(
        &mut self,
        err: ChunkError,
        env: &mut E,
    ) -> Result<(), BlockchainError> {
        error!(
            "sync phase={} height={} kind=consensus message={}",
            self.mode, err.height, err.error
        );

        if let Some(peer) = self.delivered_by.remove(&err.height) {
            self.disconnect(peer, "sent an invalid block", env);
        }
        env.remove_block(err.height)?;
        self.tracker.mark_missing(err.height);
        self.downloads.clear_work();
        self.invalid_chunks += 1;
        self.enter_download(env);
        Ok(())
    }

    fn on_flushed<E: SyncEnvironment>(
        &mut self,
        new_tip: u32,
        env: &mut E,
    ) -> Result<(), BlockchainError> {
        self.tracker.mark_validated(new_tip);
        self.delivered_by.retain(|&height, _| height > new_tip);
        self.flushed_chunks += 1;
        info!(
            "validated tip now {new_tip}, header tip {}",
            env.header_tip()
        );
        self.mode = SyncMode::Prune;
        Ok(())
    }

    fn run_prune<E: SyncEnvironment>(&mut self, env: &mut E) -> Result<(), BlockchainError> {
        if self.config.prune_target_bytes > 0 {
            let safe = self
                .tracker
                .validated_tip()
                .saturating_sub(self.config.reorg_margin);
            if safe > 0 {
                let pruned = env.prune_block_files(safe)?;
                if pruned > 0 {
                    info!("pruned {pruned} block files up to height {safe}");
                }
                self.pruned_files += pruned;
            }
        }

        // Archival nodes still fence the write-ahead state periodically
        let validated = self.tracker.validated_tip();
        if validated - self.last_checkpoint >= self.config.checkpoint_interval {
            env.checkpoint_chainstate()?;
            self.last_checkpoint = validated;
        }

        self.enter_download(env);
        Ok(())
    }

    fn disconnect<E: SyncEnvironment>(&mut self, peer: PeerId, reason: &str, env: &mut E) {
        env.disconnect_peer(peer, reason);
        self.downloads.remove_peer(peer);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bitcoin::Network;
    use ibis_chain::test_utils::ChainBuilder;
    use ibis_chain::ChainParams;
    use ibis_chain::Consensus;
    use ibis_chain::HeaderChain;

    use super::*;
    use crate::download_manager::DownloadSink;

    /// A scripted environment: a real header chain over a [ChainBuilder]
    /// chain, with every outbound action recorded.
    struct MockEnv {
        headers: HeaderChain,
        getdata: Vec<(PeerId, Vec<BlockHash>)>,
        headers_requested: Vec<PeerId>,
        disconnected: Vec<PeerId>,
        stored: HashMap<u32, Vec<u8>>,
        removed: Vec<u32>,
        validations: Vec<(u32, u32)>,
        flushes: usize,
        pruned_up_to: Option<u32>,
        checkpoints: usize,
        storage: (u64, u64),
    }

    impl MockEnv {
        fn new() -> Self {
            MockEnv {
                headers: HeaderChain::new(Consensus::new(ChainParams::from(Network::Regtest))),
                getdata: Vec::new(),
                headers_requested: Vec::new(),
                disconnected: Vec::new(),
                stored: HashMap::new(),
                removed: Vec::new(),
                validations: Vec::new(),
                flushes: 0,
                pruned_up_to: None,
                checkpoints: 0,
                storage: (0, 0),
            }
        }
    }

    impl DownloadSink for MockEnv {
        fn send_getdata(&mut self, peer: PeerId, hashes: Vec<BlockHash>) {
            self.getdata.push((peer, hashes));
        }

        fn disconnect_peer(&mut self, peer: PeerId, _reason: &str) {
            self.disconnected.push(peer);
        }
    }

    impl SyncEnvironment for MockEnv {
        fn request_headers(&mut self, peer: PeerId) {
            self.headers_requested.push(peer);
        }

        fn accept_header(&mut self, header: &BlockHeader) -> Result<u32, BlockchainError> {
            self.headers.accept_header(*header)
        }

        fn header_tip(&self) -> u32 {
            self.headers.tip_height()
        }

        fn block_hash_at(&self, height: u32) -> Option<BlockHash> {
            self.headers.hash_at(height)
        }

        fn height_of(&self, hash: &BlockHash) -> Option<u32> {
            self.headers.height_of(hash)
        }

        fn store_block(&mut self, height: u32, bytes: &[u8]) -> Result<(), BlockchainError> {
            self.stored.insert(height, bytes.to_vec());
            Ok(())
        }

        fn remove_block(&mut self, height: u32) -> Result<(), BlockchainError> {
            self.stored.remove(&height);
            self.removed.push(height);
            Ok(())
        }

        fn storage_info(&self) -> (u64, u64) {
            self.storage
        }

        fn begin_chunk_validation(&mut self, start: u32, end: u32) {
            self.validations.push((start, end));
        }

        fn begin_chunk_flush(&mut self) {
            self.flushes += 1;
        }

        fn prune_block_files(&mut self, up_to: u32) -> Result<u64, BlockchainError> {
            self.pruned_up_to = Some(up_to);
            Ok(up_to as u64 + 1)
        }

        fn checkpoint_chainstate(&mut self) -> Result<(), BlockchainError> {
            self.checkpoints += 1;
            Ok(())
        }
    }

    fn sync(config: SyncConfig) -> SyncManager {
        SyncManager::new(config, DownloadConfig::default(), 0)
    }

    fn deliver_chunk(
        sync: &mut SyncManager,
        env: &mut MockEnv,
        chain: &ChainBuilder,
        peer: PeerId,
        range: std::ops::RangeInclusive<u32>,
    ) {
        sync.tick(env).unwrap(); // enqueue work
        assert!(sync.peer_idle(peer, env));
        for height in range {
            sync.on_block(peer, &chain.block(height), env).unwrap();
            // Batches are eight blocks; keep pulling as they complete
            sync.peer_idle(peer, env);
        }
    }

    #[test]
    fn full_pipeline_reaches_done() {
        let mut chain = ChainBuilder::new();
        for _ in 0..12 {
            chain.add_block(Vec::new());
        }

        let mut env = MockEnv::new();
        let mut sync = sync(SyncConfig {
            chunk_size: 8,
            ..Default::default()
        });
        let peer = PeerId(1);

        // First peer kicks off the headers phase
        sync.peer_connected(peer, &mut env);
        assert_eq!(sync.mode(), SyncMode::Headers);
        assert_eq!(env.headers_requested, vec![peer]);

        // A short headers message means we have the whole chain
        sync.on_headers(peer, chain.headers(), &mut env).unwrap();
        assert_eq!(sync.mode(), SyncMode::Download);

        // Chunk one: blocks 1..=8
        deliver_chunk(&mut sync, &mut env, &chain, peer, 1..=8);
        sync.tick(&mut env).unwrap();
        assert_eq!(sync.mode(), SyncMode::Drain);
        sync.tick(&mut env).unwrap();
        assert_eq!(sync.mode(), SyncMode::Validate);
        assert_eq!(env.validations, vec![(1, 8)]);

        sync.on_worker_outcome(WorkerOutcome::ChunkValidated { end: 8 }, &mut env)
            .unwrap();
        assert_eq!(sync.mode(), SyncMode::Flush);
        assert_eq!(env.flushes, 1);

        sync.on_worker_outcome(WorkerOutcome::ChunkFlushed { new_tip: 8 }, &mut env)
            .unwrap();
        assert_eq!(sync.mode(), SyncMode::Prune);
        sync.tick(&mut env).unwrap();
        assert_eq!(sync.mode(), SyncMode::Download);
        assert_eq!(sync.validated_tip(), 8);
        // Archival: nothing pruned
        assert_eq!(env.pruned_up_to, None);

        // Chunk two: blocks 9..=12
        deliver_chunk(&mut sync, &mut env, &chain, peer, 9..=12);
        sync.tick(&mut env).unwrap();
        sync.tick(&mut env).unwrap();
        assert_eq!(env.validations.last(), Some(&(9, 12)));
        sync.on_worker_outcome(WorkerOutcome::ChunkValidated { end: 12 }, &mut env)
            .unwrap();
        sync.on_worker_outcome(WorkerOutcome::ChunkFlushed { new_tip: 12 }, &mut env)
            .unwrap();
        sync.tick(&mut env).unwrap();

        assert_eq!(sync.mode(), SyncMode::Done);
        assert_eq!(sync.validated_tip(), 12);

        let stats = sync.stats(&env);
        assert_eq!(stats.flushed_chunks, 2);
        assert_eq!(stats.blocks_stored, 12);
        assert_eq!(stats.headers_accepted, 12);
    }

    #[test]
    fn invalid_chunk_restarts_download_and_drops_the_sender() {
        let mut chain = ChainBuilder::new();
        for _ in 0..5 {
            chain.add_block(Vec::new());
        }

        let mut env = MockEnv::new();
        let mut sync = sync(SyncConfig {
            chunk_size: 5,
            ..Default::default()
        });
        let peer = PeerId(7);

        sync.peer_connected(peer, &mut env);
        sync.on_headers(peer, chain.headers(), &mut env).unwrap();
        deliver_chunk(&mut sync, &mut env, &chain, peer, 1..=5);
        sync.tick(&mut env).unwrap();
        sync.tick(&mut env).unwrap();
        assert_eq!(sync.mode(), SyncMode::Validate);

        // The worker found block 3 to be garbage
        let err = ChunkError {
            height: 3,
            error: ibis_chain::BlockValidationErrors::BadMerkleRoot,
        };
        sync.on_worker_outcome(WorkerOutcome::ChunkInvalid(err), &mut env)
            .unwrap();

        assert_eq!(sync.mode(), SyncMode::Download);
        assert_eq!(env.disconnected, vec![peer]);
        assert_eq!(env.removed, vec![3]);
        assert!(!env.stored.contains_key(&3));

        // Only the dropped height needs re-downloading
        let other = PeerId(8);
        sync.peer_connected(other, &mut env);
        sync.tick(&mut env).unwrap();
        env.getdata.clear();
        assert!(sync.peer_idle(other, &mut env));
        let (_, hashes) = env.getdata.last().unwrap();
        assert_eq!(hashes, &vec![chain.hash_at(3)]);

        // Redelivery completes the chunk again
        sync.on_block(other, &chain.block(3), &mut env).unwrap();
        sync.tick(&mut env).unwrap();
        sync.tick(&mut env).unwrap();
        assert_eq!(sync.mode(), SyncMode::Validate);
        assert_eq!(env.validations.last(), Some(&(1, 5)));
    }

    #[test]
    fn storage_pressure_forces_an_early_drain() {
        let mut chain = ChainBuilder::new();
        for _ in 0..10 {
            chain.add_block(Vec::new());
        }

        let mut env = MockEnv::new();
        env.storage = (600, 500); // over target
        let mut sync = sync(SyncConfig {
            chunk_size: 10,
            prune_target_bytes: 500,
            ..Default::default()
        });
        let peer = PeerId(1);

        sync.peer_connected(peer, &mut env);
        sync.on_headers(peer, chain.headers(), &mut env).unwrap();
        assert_eq!(sync.mode(), SyncMode::Download);

        // Deliver a prefix only, then hit the storage check
        sync.tick(&mut env).unwrap();
        assert!(sync.peer_idle(peer, &mut env));
        for height in 1..=4 {
            sync.on_block(peer, &chain.block(height), &mut env).unwrap();
        }
        sync.tick(&mut env).unwrap();
        assert_eq!(sync.mode(), SyncMode::Drain);

        // Everything in flight is delivered once the batch completes
        for height in 5..=8 {
            sync.on_block(peer, &chain.block(height), &mut env).unwrap();
        }
        sync.tick(&mut env).unwrap();
        // Consecutive run 1..=8 with nothing pending: validate what we have
        assert_eq!(sync.mode(), SyncMode::Validate);
        assert_eq!(env.validations, vec![(1, 8)]);
    }

    #[test]
    fn prune_runs_after_flush_when_configured() {
        let mut chain = ChainBuilder::new();
        for _ in 0..10 {
            chain.add_block(Vec::new());
        }

        let mut env = MockEnv::new();
        let mut sync = sync(SyncConfig {
            chunk_size: 10,
            prune_target_bytes: 1 << 30,
            reorg_margin: 4,
            ..Default::default()
        });
        let peer = PeerId(1);

        sync.peer_connected(peer, &mut env);
        sync.on_headers(peer, chain.headers(), &mut env).unwrap();
        deliver_chunk(&mut sync, &mut env, &chain, peer, 1..=10);
        sync.tick(&mut env).unwrap();
        sync.tick(&mut env).unwrap();
        sync.on_worker_outcome(WorkerOutcome::ChunkValidated { end: 10 }, &mut env)
            .unwrap();
        sync.on_worker_outcome(WorkerOutcome::ChunkFlushed { new_tip: 10 }, &mut env)
            .unwrap();
        sync.tick(&mut env).unwrap();

        // validated 10 - margin 4 leaves heights 0..=6 prunable
        assert_eq!(env.pruned_up_to, Some(6));
        assert_eq!(sync.mode(), SyncMode::Done);
    }

    #[test]
    fn headers_continue_while_the_message_is_full() {
        let mut chain = ChainBuilder::new();
        for _ in 0..(MAX_HEADERS_PER_MESSAGE + 5) {
            chain.add_block(Vec::new());
        }

        let mut env = MockEnv::new();
        let mut sync = sync(SyncConfig::default());
        let peer = PeerId(1);

        sync.peer_connected(peer, &mut env);
        let all = chain.headers();

        // A full message asks for more and stays in the headers phase
        sync.on_headers(peer, all[..MAX_HEADERS_PER_MESSAGE].to_vec(), &mut env)
            .unwrap();
        assert_eq!(sync.mode(), SyncMode::Headers);
        assert_eq!(env.headers_requested.len(), 2);

        // The short remainder completes the phase
        sync.on_headers(peer, all[MAX_HEADERS_PER_MESSAGE..].to_vec(), &mut env)
            .unwrap();
        assert_eq!(sync.mode(), SyncMode::Download);
        assert_eq!(env.header_tip(), MAX_HEADERS_PER_MESSAGE as u32 + 5);
    }

    #[test]
    fn invalid_header_disconnects_the_sender() {
        let mut chain = ChainBuilder::new();
        chain.add_block(Vec::new());
        chain.add_block(Vec::new());

        let mut env = MockEnv::new();
        let mut sync = sync(SyncConfig::default());
        let peer = PeerId(1);
        sync.peer_connected(peer, &mut env);

        // Headers out of order don't connect
        let mut headers = chain.headers();
        headers.reverse();
        sync.on_headers(peer, headers, &mut env).unwrap();
        assert_eq!(env.disconnected, vec![peer]);
        assert_eq!(env.header_tip(), 0);
    }
}
