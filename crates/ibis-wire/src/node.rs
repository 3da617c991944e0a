//! The node event loop and the validator worker.
//!
//! One tokio task owns every piece of mutable state the peers can touch: the
//! peer table, the header chain, the block index and the sync machine.
//! Inbound messages from a peer are handled in arrival order; outbound
//! requests go to per-peer channels owned by the transport.
//!
//! Validation and flushing run on a dedicated OS thread so database commits
//! and block-file reads never stall the event loop. The thread sleeps on a
//! condition variable and wakes when a command lands or shutdown is raised;
//! a flush transaction that already started always completes before the
//! thread exits.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use bitcoin::block::Header as BlockHeader;
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use bitcoin::Network;
use ibis_chain::BlockIndexStore;
use ibis_chain::BlockStatus;
use ibis_chain::BlockStore;
use ibis_chain::BlockchainError;
use ibis_chain::ChainParams;
use ibis_chain::ChunkProgress;
use ibis_chain::ChunkValidator;
use ibis_chain::Consensus;
use ibis_chain::HeaderChain;
use ibis_chain::KvBlockIndex;
use ibis_chain::KvUtxoStore;
use ibis_chain::NullScriptVerifier;
use ibis_chain::ScriptVerifier;
use ibis_chain::UtxoBatch;
use ibis_chain::UtxoStore;
use log::debug;
use log::error;
use log::info;
use log::warn;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::RwLock;

use crate::download_manager::DownloadConfig;
use crate::download_manager::DownloadSink;
use crate::error::WireError;
use crate::peer::PeerId;
use crate::peer::PeerMessage;
use crate::peer::PeerRequest;
use crate::sync::SyncConfig;
use crate::sync::SyncEnvironment;
use crate::sync::SyncManager;
use crate::sync::SyncStats;
use crate::sync::WorkerOutcome;

/// Everything the transport can tell the node.
#[derive(Debug)]
pub enum NodeEvent {
    /// A peer finished connecting; requests for it go into the given channel.
    PeerConnected(PeerId, mpsc::UnboundedSender<PeerRequest>),
    PeerDisconnected(PeerId),
    Message(PeerId, PeerMessage),
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub network: Network,
    pub data_dir: PathBuf,
    pub sync: SyncConfig,
    pub download: DownloadConfig,
    /// Ping a quiet peer after this long.
    pub ping_interval: Duration,
    /// Disconnect a peer that sent nothing at all for this long.
    pub peer_timeout: Duration,
    pub tick_interval: Duration,
}

impl NodeConfig {
    pub fn new(network: Network, data_dir: impl Into<PathBuf>) -> Self {
        NodeConfig {
            network,
            data_dir: data_dir.into(),
            sync: SyncConfig::default(),
            download: DownloadConfig::default(),
            ping_interval: Duration::from_secs(120),
            peer_timeout: Duration::from_secs(20 * 60),
            tick_interval: Duration::from_millis(250),
        }
    }
}

enum WorkerCmd {
    Validate {
        start: u32,
        end: u32,
        prev_hash: BlockHash,
    },
    Flush,
    Checkpoint,
}

struct WorkerShared {
    commands: Mutex<VecDeque<WorkerCmd>>,
    work_pending: Condvar,
    shutdown: AtomicBool,
}

impl WorkerShared {
    fn new() -> Self {
        WorkerShared {
            commands: Mutex::new(VecDeque::new()),
            work_pending: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }
}

#[derive(Clone)]
struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    fn send(&self, cmd: WorkerCmd) {
        self.shared
            .commands
            .lock()
            .expect("validator worker poisoned its own queue")
            .push_back(cmd);
        self.shared.work_pending.notify_one();
    }

    fn raise_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.work_pending.notify_one();
    }
}

/// The dedicated validation thread. Owns the UTXO database outright; the
/// event loop never touches it.
struct ValidatorWorker {
    shared: Arc<WorkerShared>,
    consensus: Consensus,
    store: Arc<BlockStore>,
    utxos: KvUtxoStore,
    scripts: Box<dyn ScriptVerifier + Send>,
    assume_valid_height: u32,
    outcomes: mpsc::UnboundedSender<WorkerOutcome>,
    /// The batch validated by the last `Validate` command, waiting for its
    /// `Flush`. Dropped on shutdown; a half-done chunk is redone on restart.
    pending: Option<(UtxoBatch, u32)>,
}

impl ValidatorWorker {
    fn run(mut self) {
        loop {
            let cmd = {
                let mut commands = self
                    .shared
                    .commands
                    .lock()
                    .expect("event loop poisoned the command queue");
                loop {
                    if let Some(cmd) = commands.pop_front() {
                        break cmd;
                    }
                    if self.shared.shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    commands = self
                        .shared
                        .work_pending
                        .wait(commands)
                        .expect("event loop poisoned the command queue");
                }
            };

            match cmd {
                WorkerCmd::Validate {
                    start,
                    end,
                    prev_hash,
                } => self.validate_chunk(start, end, prev_hash),
                WorkerCmd::Flush => self.flush_chunk(),
                WorkerCmd::Checkpoint => {
                    if let Err(e) = self.utxos.checkpoint() {
                        let _ = self.outcomes.send(WorkerOutcome::Fatal(e.to_string()));
                    }
                }
            }
        }
    }

    fn validate_chunk(&mut self, start: u32, end: u32, prev_hash: BlockHash) {
        let mut validator = ChunkValidator::new(
            &self.consensus,
            &*self.store,
            &self.utxos,
            &*self.scripts,
            start,
            end,
            prev_hash,
            self.assume_valid_height,
        );

        let outcome = loop {
            // A partially validated chunk is never flushed: drop it and let a
            // restart redo the work
            if self.shared.shutdown.load(Ordering::Relaxed) {
                return;
            }

            match validator.validate_next() {
                Ok(ChunkProgress::Done) => break WorkerOutcome::ChunkValidated { end },
                Ok(ChunkProgress::Validated(_)) => {}
                Err(BlockchainError::BlockValidation(_)) => {
                    let err = validator
                        .last_error()
                        .cloned()
                        .expect("consensus failures always record the height");
                    break WorkerOutcome::ChunkInvalid(err);
                }
                Err(BlockchainError::BlockNotFound(height))
                | Err(BlockchainError::CorruptBlockFile { height, .. }) => {
                    break WorkerOutcome::ChunkUnavailable { height };
                }
                Err(fatal) => break WorkerOutcome::Fatal(fatal.to_string()),
            }
        };

        if let WorkerOutcome::ChunkValidated { .. } = outcome {
            self.pending = Some((validator.into_batch(), end));
        }
        let _ = self.outcomes.send(outcome);
    }

    fn flush_chunk(&mut self) {
        let Some((batch, end)) = self.pending.take() else {
            warn!("flush requested with no validated chunk");
            return;
        };

        match self.utxos.apply_batch(&batch) {
            Ok(stats) => {
                debug!(
                    "flushed chunk {}..={}: +{} -{} ({} elided)",
                    batch.chunk_start(),
                    batch.chunk_end(),
                    stats.inserted,
                    stats.deleted,
                    batch.created_then_spent
                );
                let _ = self
                    .outcomes
                    .send(WorkerOutcome::ChunkFlushed { new_tip: end });
            }
            Err(e) => {
                let _ = self.outcomes.send(WorkerOutcome::Fatal(e.to_string()));
            }
        }
    }
}

struct PeerState {
    sender: mpsc::UnboundedSender<PeerRequest>,
    last_recv: Instant,
    ping: Option<(u64, Instant)>,
}

/// The [SyncEnvironment] the real node gives its sync machine: peers over
/// channels, a header chain, the block store and index, and the validator
/// worker behind its condition variable.
struct NodeEnv {
    peers: HashMap<PeerId, PeerState>,
    headers: HeaderChain,
    index: KvBlockIndex,
    store: Arc<BlockStore>,
    worker: WorkerHandle,
    prune_target_bytes: u64,
}

impl DownloadSink for NodeEnv {
    fn send_getdata(&mut self, peer: PeerId, hashes: Vec<BlockHash>) {
        if let Some(state) = self.peers.get(&peer) {
            let _ = state.sender.send(PeerRequest::GetData(hashes));
        }
    }

    fn disconnect_peer(&mut self, peer: PeerId, reason: &str) {
        if let Some(state) = self.peers.remove(&peer) {
            info!("disconnecting {peer}: {reason}");
            let _ = state.sender.send(PeerRequest::Disconnect {
                reason: reason.to_string(),
            });
        }
    }
}

impl SyncEnvironment for NodeEnv {
    fn request_headers(&mut self, peer: PeerId) {
        if let Some(state) = self.peers.get(&peer) {
            let _ = state.sender.send(PeerRequest::GetHeaders {
                locator: self.headers.locator(),
                stop: BlockHash::all_zeros(),
            });
        }
    }

    fn accept_header(&mut self, header: &BlockHeader) -> Result<u32, BlockchainError> {
        let height = self.headers.accept_header(*header)?;
        let entry = self
            .headers
            .index_entry(height)
            .expect("the header was just accepted");
        // A restarted node re-learns headers it already indexed; don't wipe
        // the status flags those entries accumulated
        if self.index.get_entry(&entry.block_hash())?.is_none() {
            self.index.save_entry(&entry)?;
            self.index.update_block_index(height, entry.block_hash())?;
        }
        Ok(height)
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
        self.store.write_height(height, bytes)?;
        if let Some(mut entry) = self.index.get_entry_by_height(height)? {
            entry.status.insert(BlockStatus::HAVE_DATA);
            self.index.save_entry(&entry)?;
        }
        Ok(())
    }

    fn remove_block(&mut self, height: u32) -> Result<(), BlockchainError> {
        self.store.prune_height(height)?;
        if let Some(mut entry) = self.index.get_entry_by_height(height)? {
            entry.status.remove(BlockStatus::HAVE_DATA);
            self.index.save_entry(&entry)?;
        }
        Ok(())
    }

    fn storage_info(&self) -> (u64, u64) {
        (self.store.total_size(), self.prune_target_bytes)
    }

    fn begin_chunk_validation(&mut self, start: u32, end: u32) {
        let prev_hash = self
            .headers
            .hash_at(start - 1)
            .expect("chunks start right above a validated header");
        self.worker.send(WorkerCmd::Validate {
            start,
            end,
            prev_hash,
        });
    }

    fn begin_chunk_flush(&mut self) {
        self.worker.send(WorkerCmd::Flush);
    }

    fn prune_block_files(&mut self, up_to: u32) -> Result<u64, BlockchainError> {
        let start = self.index.pruned_height()?.unwrap_or(0);
        let mut pruned = 0;
        for height in start..=up_to {
            if self.store.prune_height(height)? {
                pruned += 1;
            }
        }
        self.index.mark_pruned(up_to)?;
        Ok(pruned)
    }

    fn checkpoint_chainstate(&mut self) -> Result<(), BlockchainError> {
        self.worker.send(WorkerCmd::Checkpoint);
        Ok(())
    }
}

/// A handle for whoever feeds the node: the transport layer, or tests.
#[derive(Clone)]
pub struct NodeHandle {
    pub events: mpsc::UnboundedSender<NodeEvent>,
    pub stats: watch::Receiver<SyncStats>,
}

pub struct Node {
    config: NodeConfig,
    sync: SyncManager,
    env: NodeEnv,
    events: mpsc::UnboundedReceiver<NodeEvent>,
    outcomes: mpsc::UnboundedReceiver<WorkerOutcome>,
    worker_thread: Option<JoinHandle<()>>,
    kill_signal: Arc<RwLock<bool>>,
    stats_tx: watch::Sender<SyncStats>,
}

impl Node {
    /// Opens the stores under the configured data directory, spawns the
    /// validator worker and resumes from whatever the databases say.
    pub fn new(
        config: NodeConfig,
        kill_signal: Arc<RwLock<bool>>,
    ) -> Result<(Self, NodeHandle), WireError> {
        let store = Arc::new(BlockStore::open(&config.data_dir)?);
        let index =
            KvBlockIndex::new(&config.data_dir).map_err(|e| WireError::Database(e.to_string()))?;
        let utxos =
            KvUtxoStore::new(&config.data_dir).map_err(|e| WireError::Database(e.to_string()))?;

        let consensus = Consensus::new(ChainParams::from(config.network));
        let validated_tip = index
            .load_height()
            .map_err(|e| WireError::Database(e.to_string()))?
            .unwrap_or(0);

        let mut sync = SyncManager::new(config.sync.clone(), config.download.clone(), validated_tip);
        let stored = store.scan_heights()?;
        sync.seed_stored(&stored);
        if validated_tip > 0 || !stored.is_empty() {
            info!(
                "resuming: validated tip {validated_tip}, {} blocks on disk",
                stored.len()
            );
        }

        let shared = Arc::new(WorkerShared::new());
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let worker = ValidatorWorker {
            shared: shared.clone(),
            consensus: consensus.clone(),
            store: store.clone(),
            utxos,
            scripts: Box::new(NullScriptVerifier),
            assume_valid_height: config.sync.assume_valid_height,
            outcomes: outcome_tx,
            pending: None,
        };
        let worker_thread = std::thread::Builder::new()
            .name("ibis-validator".to_string())
            .spawn(move || worker.run())
            .map_err(WireError::WorkerSpawn)?;

        let env = NodeEnv {
            peers: HashMap::new(),
            headers: HeaderChain::new(consensus),
            index,
            store,
            worker: WorkerHandle { shared },
            prune_target_bytes: config.sync.prune_target_bytes,
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(SyncStats::default());

        let node = Node {
            config,
            sync,
            env,
            events: event_rx,
            outcomes: outcome_rx,
            worker_thread: Some(worker_thread),
            kill_signal,
            stats_tx,
        };
        let handle = NodeHandle {
            events: event_tx,
            stats: stats_rx,
        };
        Ok((node, handle))
    }

    /// Runs until the kill signal is raised or a fatal error surfaces, then
    /// shuts the worker down cleanly and reports through `stop_notify`.
    pub async fn run(mut self, stop_notify: oneshot::Sender<()>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *self.kill_signal.read().await {
                        break;
                    }
                    if let Err(e) = self.tick() {
                        error!("sync failed: {e}");
                        break;
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event) {
                            error!("sync failed: {e}");
                            break;
                        }
                    }
                    // Every handle is gone; nobody can feed us again
                    None => break,
                },
                outcome = self.outcomes.recv() => {
                    if let Some(outcome) = outcome {
                        if let Err(e) = self.handle_worker_outcome(outcome) {
                            error!("sync failed: {e}");
                            break;
                        }
                    }
                }
            }
        }

        info!("node stopping");
        self.env.worker.raise_shutdown();
        if let Some(thread) = self.worker_thread.take() {
            // The worker finishes any in-progress transaction first
            let _ = thread.join();
        }
        // Release every database handle before reporting shutdown, so the
        // data directory can be reopened as soon as the notification lands
        drop(self.env);
        let _ = stop_notify.send(());
    }

    fn tick(&mut self) -> Result<(), BlockchainError> {
        self.sync.tick(&mut self.env)?;
        self.check_peer_liveness();

        // Cooperative pull: every peer gets a chance to ask for work
        let peers: Vec<PeerId> = self.env.peers.keys().copied().collect();
        for peer in peers {
            self.sync.peer_idle(peer, &mut self.env);
        }

        let _ = self.stats_tx.send(self.sync.stats(&self.env));
        Ok(())
    }

    fn check_peer_liveness(&mut self) {
        let now = Instant::now();
        let mut timed_out = Vec::new();
        let mut quiet = Vec::new();

        for (&peer, state) in &self.env.peers {
            if now.duration_since(state.last_recv) > self.config.peer_timeout {
                timed_out.push(peer);
            } else if state.ping.is_none()
                && now.duration_since(state.last_recv) > self.config.ping_interval
            {
                quiet.push(peer);
            }
        }

        for peer in timed_out {
            warn!("{peer} sent nothing for {:?}", self.config.peer_timeout);
            self.env.disconnect_peer(peer, "receive timeout");
            self.sync.peer_disconnected(peer);
        }
        for peer in quiet {
            let nonce = rand::random();
            if let Some(state) = self.env.peers.get_mut(&peer) {
                state.ping = Some((nonce, now));
                let _ = state.sender.send(PeerRequest::Ping(nonce));
            }
        }
    }

    fn handle_event(&mut self, event: NodeEvent) -> Result<(), BlockchainError> {
        match event {
            NodeEvent::PeerConnected(peer, sender) => {
                info!("{peer} connected");
                self.env.peers.insert(
                    peer,
                    PeerState {
                        sender,
                        last_recv: Instant::now(),
                        ping: None,
                    },
                );
                self.sync.peer_connected(peer, &mut self.env);
            }
            NodeEvent::PeerDisconnected(peer) => {
                info!("{peer} disconnected");
                self.env.peers.remove(&peer);
                self.sync.peer_disconnected(peer);
            }
            NodeEvent::Message(peer, message) => {
                let Some(state) = self.env.peers.get_mut(&peer) else {
                    return Ok(());
                };
                state.last_recv = Instant::now();
                self.handle_message(peer, message)?;
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, peer: PeerId, message: PeerMessage) -> Result<(), BlockchainError> {
        match message {
            PeerMessage::Headers(headers) => self.sync.on_headers(peer, headers, &mut self.env)?,
            PeerMessage::Block(block) => self.sync.on_block(peer, &block, &mut self.env)?,
            PeerMessage::Ping(nonce) => {
                if let Some(state) = self.env.peers.get(&peer) {
                    let _ = state.sender.send(PeerRequest::Pong(nonce));
                }
            }
            PeerMessage::Pong(nonce) => {
                if let Some(state) = self.env.peers.get_mut(&peer) {
                    if state.ping.map_or(false, |(expected, _)| expected == nonce) {
                        state.ping = None;
                    }
                }
            }
            // During IBD we pull everything ourselves; announcements and
            // queries from peers are recognized but not acted on
            PeerMessage::Inv(_)
            | PeerMessage::GetData(_)
            | PeerMessage::GetHeaders { .. }
            | PeerMessage::NotFound(_)
            | PeerMessage::Tx(_)
            | PeerMessage::Addr(_)
            | PeerMessage::GetAddr
            | PeerMessage::Version { .. }
            | PeerMessage::Verack
            | PeerMessage::SendHeaders
            | PeerMessage::SendAddrV2
            | PeerMessage::WtxidRelay => {}
        }
        Ok(())
    }

    fn handle_worker_outcome(&mut self, outcome: WorkerOutcome) -> Result<(), BlockchainError> {
        // The validated-tip record follows the flush that made it true
        if let WorkerOutcome::ChunkFlushed { new_tip } = &outcome {
            self.env.index.save_height(*new_tip)?;
        }
        self.sync.on_worker_outcome(outcome, &mut self.env)
    }
}
