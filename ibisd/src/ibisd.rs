use std::fmt::Arguments;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

pub use bitcoin::Network;
use fern::colors::Color;
use fern::colors::ColoredLevelConfig;
use fern::FormatCallback;
use ibis_wire::Node;
use ibis_wire::NodeConfig;
use ibis_wire::NodeHandle;
use log::debug;
use log::error;
use log::info;
use log::warn;
use log::Record;
use tokio::sync::RwLock;
use tokio::task;
use tokio::time::Duration;

use crate::cli::Cli;
use crate::config_file::ConfigFile;

/// Prune targets below 128 MB are raised to it; anything smaller can't even
/// hold the reorg margin.
const MIN_PRUNE_TARGET_MB: u64 = 128;

#[derive(Clone)]
/// General configuration for the ibis daemon.
///
/// Those configs should be passed in by anyone that wants to start an ibis
/// instance. Some of these are also exposed through the config file.
pub struct Config {
    /// Where we should place our data
    ///
    /// This directory must be readable and writable by our process. We'll use
    /// this dir to store chain data: raw block files, the UTXO set and the
    /// block index. This should be kept in a non-volatile medium.
    ///
    /// If not set, it defaults to $HOME/.ibis
    pub data_dir: Option<String>,
    /// The network we are running in, it may be one of: bitcoin, signet,
    /// regtest or testnet.
    pub network: Network,
    /// How many megabytes of raw block files to keep around
    ///
    /// Once validated block files exceed this target, the node starts
    /// deleting the oldest ones, always keeping the reorg margin below the
    /// validated tip intact. Zero disables deletion entirely, making this an
    /// archival node. Values below 128 are raised to 128.
    pub prune_target_mb: u64,
    /// We consider scripts in blocks prior to this height to be valid
    ///
    /// This is an optimization mirrored from Core, where blocks before this
    /// one don't have their scripts checked. The idea here is that if a block
    /// is buried under a lot of PoW, it's very unlikely that it is invalid.
    /// Everything else (proof of work, merkle trees, the UTXO ledger,
    /// coinbase amounts) is still fully validated.
    pub assume_valid_height: Option<u32>,
    /// How many blocks to validate and flush as one atomic unit
    pub chunk_size: Option<u32>,
    /// Where should we read from a config file
    ///
    /// This is a toml-encoded file with ibis's configs. If a setting appears
    /// in both the config file and this struct, this struct has precedence.
    pub config_file: Option<String>,
    /// Whether we should log to a fs file
    pub log_to_file: bool,
    /// Whether we should post debug information to the console
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            network: Network::Bitcoin,
            prune_target_mb: 0,
            assume_valid_height: None,
            chunk_size: None,
            config_file: None,
            log_to_file: false,
            debug: false,
        }
    }
}

pub struct Ibisd {
    /// The config used by this node, see [Config] for more details
    config: Config,
    /// A channel that tells others to stop what they are doing because we
    /// are about to die
    stop_signal: Arc<RwLock<bool>>,
    /// A channel that notifies we are done, and it's safe to die now
    stop_notify: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
    /// The running node's handle, once started. A transport layer uses this
    /// to feed peer events in.
    node_handle: OnceLock<NodeHandle>,
}

impl Ibisd {
    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            stop_signal: Arc::new(RwLock::new(false)),
            stop_notify: Mutex::new(None),
            node_handle: OnceLock::new(),
        }
    }

    pub fn new() -> Self {
        Self::from_config(Config::default())
    }

    /// Kills a running ibisd, this will return as soon as the main node
    /// stops.
    ///
    /// It's not safe to stop your program before this returns because some
    /// information may not be fully flushed to disk yet, and killing the
    /// process before flushing everything is equivalent to an unclean
    /// shutdown.
    pub async fn stop(&self) {
        info!("Stopping node...");
        let mut stop_signal = self.stop_signal.write().await;
        *stop_signal = true;
    }

    pub async fn should_stop(&self) -> bool {
        let stop_signal = self.stop_signal.read().await;
        *stop_signal
    }

    pub fn get_stop_signal(&self) -> Arc<RwLock<bool>> {
        self.stop_signal.clone()
    }

    pub async fn wait_shutdown(&self) {
        let chan = {
            let mut guard = self.stop_notify.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        if let Some(chan) = chan {
            if let Err(e) = chan.await {
                error!("POSSIBLE BUG: unexpected error while shutting down {e:?}");
            }
        }
    }

    /// The running node's handle, for wiring a transport in.
    pub fn node_handle(&self) -> Option<&NodeHandle> {
        self.node_handle.get()
    }

    /// Actually runs ibisd, spawning the node and the validator worker and
    /// returning once everything is up.
    pub async fn start(&self) {
        let data_dir = Self::data_dir_path(&self.config);

        // Create the data directory if it doesn't exist
        if !Path::new(&data_dir).exists() {
            fs::create_dir_all(&data_dir).expect("Could not create data directory");
        }

        // Setup global logger
        Self::setup_logger(
            &data_dir,
            self.config.log_to_file,
            self.config.debug,
        )
        .expect("Failure to setup logger");

        // The config file inside our data directory or the specified one
        let config_file = match self.config.config_file {
            Some(ref path) => Self::get_config_file(path),
            None => {
                let default_path = format!("{data_dir}/config.toml");
                Self::get_config_file(&default_path)
            }
        };

        let mut node_config = NodeConfig::new(self.config.network, &data_dir);

        let prune_target_mb = match self.config.prune_target_mb {
            0 => config_file.node.prune_target_mb.unwrap_or(0),
            explicit => explicit,
        };
        if prune_target_mb > 0 {
            let target = prune_target_mb.max(MIN_PRUNE_TARGET_MB);
            if target != prune_target_mb {
                warn!("prune target below {MIN_PRUNE_TARGET_MB} MB, using {MIN_PRUNE_TARGET_MB} MB");
            }
            node_config.sync.prune_target_bytes = target * 1024 * 1024;
        }

        if let Some(height) = self
            .config
            .assume_valid_height
            .or(config_file.node.assume_valid_height)
        {
            node_config.sync.assume_valid_height = height;
        }

        if let Some(chunk_size) = self.config.chunk_size.or(config_file.node.chunk_size) {
            node_config.sync.chunk_size = chunk_size;
        }

        info!("Loading chainstate databases");
        let kill_signal = self.stop_signal.clone();
        let (node, handle) = match Node::new(node_config, kill_signal) {
            Ok(started) => started,
            Err(e) => {
                error!("Could not start the node: {e}");
                exit(1);
            }
        };

        if self.node_handle.set(handle.clone()).is_err() {
            core::panic!("We should be the first one setting this");
        }

        let (sender, receiver) = tokio::sync::oneshot::channel();
        {
            let mut recv = self.stop_notify.lock().unwrap();
            *recv = Some(receiver);
        }
        task::spawn(node.run(sender));

        // Periodic sync progress report
        let stats = handle.stats.clone();
        task::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                ticker.tick().await;
                let current = stats.borrow().clone();
                info!(
                    "sync {}: validated {} of {} headers, {} blocks stored, {} peers",
                    current.mode,
                    current.validated_tip,
                    current.header_tip,
                    current.blocks_stored,
                    current.connected_peers
                );
                if current.mode == "done" {
                    break;
                }
            }
        });

        info!("Node started; waiting for a transport to provide peers");
    }

    fn data_dir_path(config: &Config) -> String {
        // base dir: config.data_dir or $HOME/.ibis or "./.ibis"
        let mut base: PathBuf = config
            .data_dir
            .as_ref()
            .map(|s| s.trim_end_matches(['/', '\\']).into())
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".ibis")
            });

        // network-specific subdir
        match config.network {
            Network::Bitcoin => {} // no subdir
            Network::Signet => base.push("signet"),
            Network::Testnet => base.push("testnet3"),
            Network::Testnet4 => base.push("testnet4"),
            Network::Regtest => base.push("regtest"),
            _ => panic!("This network is not supported: {}", config.network),
        }

        base.to_string_lossy().into_owned()
    }

    fn setup_logger(data_dir: &String, log_file: bool, debug: bool) -> Result<(), fern::InitError> {
        let colors = ColoredLevelConfig::new()
            .error(Color::Red)
            .warn(Color::Yellow)
            .info(Color::Green)
            .debug(Color::Blue)
            .trace(Color::BrightBlack);

        let formatter = |use_colors: bool| {
            move |out: FormatCallback, message: &Arguments, record: &Record| {
                out.finish(format_args!(
                    "[{} {} {}] {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    match use_colors {
                        true => colors.color(record.level()).to_string(),
                        false => record.level().to_string(),
                    },
                    record.target(),
                    message
                ))
            }
        };

        let mut dispatchers = fern::Dispatch::new();
        let stdout_dispatcher = fern::Dispatch::new()
            .format(formatter(true))
            .level(if debug {
                log::LevelFilter::Debug
            } else {
                log::LevelFilter::Info
            })
            .chain(std::io::stdout());

        dispatchers = dispatchers.chain(stdout_dispatcher);

        if log_file {
            let file_dispatcher = fern::Dispatch::new()
                .format(formatter(false))
                .level(log::LevelFilter::Info)
                .chain(fern::log_file(format!("{data_dir}/output.log"))?);
            dispatchers = dispatchers.chain(file_dispatcher);
        }

        dispatchers.apply()?;

        Ok(())
    }

    /// Loads a config file from disk, returns default if it cannot load it
    fn get_config_file(path: &str) -> ConfigFile {
        match ConfigFile::from_file(path) {
            Ok(config_file) => config_file,
            Err(crate::error::Error::TomlParsing(e)) => {
                warn!("Could not parse config file, ignoring it");
                debug!("{e}");
                ConfigFile::default()
            }
            Err(crate::error::Error::Io(e)) => {
                debug!("Could not read config file: {e}");
                ConfigFile::default()
            }
        }
    }
}

impl Default for Ibisd {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Config> for Ibisd {
    fn from(config: Config) -> Self {
        Self::from_config(config)
    }
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Config {
            data_dir: cli.data_dir,
            network: cli.network,
            prune_target_mb: cli.prune,
            assume_valid_height: cli.assume_valid,
            chunk_size: cli.chunk_size,
            config_file: cli.config_file,
            log_to_file: cli.log_to_file,
            debug: cli.debug,
        }
    }
}
