//! BEP CLI - Command-line client for folders shared over the Block Exchange
//! Protocol.
//!
//! Provides commands for:
//! - Creating the local identity and configuration
//! - Managing peers and listing shared folders
//! - Browsing peer indexes
//! - Downloading, uploading, creating and deleting entries

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use bep_client::{load_keystore, BepClient, StaticAddressSupplier};
use bep_core::{describe_size, Configuration, DeviceId, DeviceInfo, FileInfo};
use bep_index::BrowserOptions;
use bep_net::ConnectionState;
use bep_store::{RocksRepository, StoreConfig};

/// BEP folder sync client.
#[derive(Parser)]
#[command(name = "bep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/bep/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the configuration and local identity
    Init {
        /// Local device name announced to peers
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Print the local device id
    Id,

    /// Add a peer device
    AddPeer {
        /// Device id of the peer
        device_id: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        /// Static address (tcp://host:port or relay://...), repeatable
        #[arg(short, long)]
        address: Vec<String>,
    },

    /// List configured peers and their connection state
    Peers {
        /// Connect before reporting
        #[arg(long)]
        connect: bool,
    },

    /// List shared folders with index statistics
    Folders,

    /// List a directory of a folder
    Ls {
        /// Folder id
        folder: String,

        /// Directory path, root when omitted
        path: Option<String>,
    },

    /// Download a file
    Pull {
        /// Folder id
        folder: String,

        /// File path inside the folder
        path: String,

        /// Output file (default: file name in the current directory, `-` for stdout)
        output: Option<PathBuf>,
    },

    /// Upload a local file
    Push {
        /// Folder id
        folder: String,

        /// Target path inside the folder
        path: String,

        /// Local file to upload
        file: PathBuf,
    },

    /// Create a directory
    Mkdir {
        /// Folder id
        folder: String,

        /// Directory path inside the folder
        path: String,
    },

    /// Delete a file or directory
    Rm {
        /// Folder id
        folder: String,

        /// Path inside the folder
        path: String,
    },

    /// Connect to all peers and acquire their indexes
    Sync,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;

    let config_path = expand_tilde(&cli.config);
    debug!(config = %config_path.display(), "using configuration");

    match cli.command {
        Commands::Init { name } => cmd_init(&config_path, name.as_deref()),

        Commands::Id => cmd_id(&config_path),

        Commands::AddPeer {
            device_id,
            name,
            address,
        } => cmd_add_peer(&config_path, &device_id, name.as_deref(), address),

        Commands::Peers { connect } => cmd_peers(&config_path, connect),

        Commands::Folders => cmd_folders(&config_path),

        Commands::Ls { folder, path } => cmd_ls(&config_path, &folder, path.as_deref()),

        Commands::Pull { folder, path, output } => cmd_pull(&config_path, &folder, &path, output.as_deref()),

        Commands::Push { folder, path, file } => cmd_push(&config_path, &folder, &path, &file),

        Commands::Mkdir { folder, path } => cmd_mkdir(&config_path, &folder, &path),

        Commands::Rm { folder, path } => cmd_rm(&config_path, &folder, &path),

        Commands::Sync => cmd_sync(&config_path),
    }
}

/// Expand ~ to home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

fn load_config(path: &Path) -> Result<Arc<Configuration>> {
    let config = Configuration::load(path).context("Failed to load configuration")?;
    Ok(Arc::new(config))
}

/// Opens the client on the RocksDB index next to the configuration file.
fn open_client(path: &Path) -> Result<BepClient> {
    let config = load_config(path)?;
    let database = config
        .database_path()
        .context("Configuration has no directory for the database")?;
    let store_config = StoreConfig::new(database);
    store_config.create_dirs().context("Failed to create database directory")?;
    let repository = Arc::new(RocksRepository::open(&store_config).context("Failed to open index database")?);

    let addresses = Arc::new(StaticAddressSupplier::new(config.clone()));
    let client = BepClient::new(config, repository.clone(), repository, addresses).context("Failed to start client")?;
    Ok(client)
}

fn cmd_init(path: &Path, name: Option<&str>) -> Result<()> {
    let config = load_config(path)?;
    if let Some(name) = name {
        config.set_local_device_name(name);
    }
    let keystore = load_keystore(&config).context("Failed to create identity")?;
    config.persist().context("Failed to write configuration")?;

    info!(config = %path.display(), "configuration ready");
    println!("Configuration: {}", path.display());
    println!("Device name:   {}", config.local_device_name());
    println!("Device id:     {}", keystore.device_id());
    Ok(())
}

fn cmd_id(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let keystore = load_keystore(&config).context("Failed to load identity")?;
    println!("{}", keystore.device_id());
    Ok(())
}

fn cmd_add_peer(path: &Path, device_id: &str, name: Option<&str>, addresses: Vec<String>) -> Result<()> {
    let device_id: DeviceId = device_id.parse().context("Invalid device id")?;
    let config = load_config(path)?;
    let mut peer = DeviceInfo::new(device_id, name);
    for address in addresses {
        peer = peer.with_address(address);
    }
    println!("Added peer {} ({})", peer.name, device_id);
    config.add_peer(peer);
    config.persist().context("Failed to write configuration")?;
    Ok(())
}

fn cmd_peers(path: &Path, connect: bool) -> Result<()> {
    let client = open_client(path)?;
    if connect {
        let connected = client.get_peer_connections();
        info!(connected = connected.len(), "connected to peers");
    }

    let status = client.peer_status();
    if status.is_empty() {
        println!("No peers configured");
    }
    for peer in status {
        let state = match peer.state {
            ConnectionState::Connected => "connected",
            ConnectionState::Closed | ConnectionState::Disconnected => "disconnected",
            _ => "connecting",
        };
        println!("{}  {:<20} {}", peer.device.device_id, peer.device.name, state);
        if let Some(address) = peer.address {
            println!("    via {address}");
        }
        if let Some(stats) = peer.stats {
            println!(
                "    sent {} in {} messages, received {} in {} messages",
                describe_size(stats.bytes_sent),
                stats.messages_sent,
                describe_size(stats.bytes_received),
                stats.messages_received
            );
        }
        for address in &peer.device.addresses {
            println!("    address {address}");
        }
    }
    client.close();
    Ok(())
}

fn cmd_folders(path: &Path) -> Result<()> {
    let client = open_client(path)?;
    client.update_index_from_peers();

    let browser = client.index_handler().new_folder_browser().context("Failed to read folders")?;
    let folders = browser.folder_info_and_stats_list();
    if folders.is_empty() {
        println!("No folders shared");
    }
    for (folder, stats) in folders {
        println!(
            "{:<24} {:>6} files {:>6} dirs {:>10}   {}",
            folder.folder_id,
            stats.file_count,
            stats.dir_count,
            describe_size(stats.size),
            folder.label
        );
    }
    browser.close();
    client.close();
    Ok(())
}

fn cmd_ls(path: &Path, folder: &str, dir: Option<&str>) -> Result<()> {
    let client = open_client(path)?;
    client.update_index_from_peers();

    let browser = client
        .index_handler()
        .new_index_browser(folder, BrowserOptions::default())
        .with_context(|| format!("Failed to browse folder {folder}"))?;
    let entries = browser.list_files(dir.unwrap_or(""))?;
    for entry in entries.iter().filter(|e| !e.deleted) {
        let kind = if entry.is_directory() { "d" } else { "-" };
        let size = entry.size.map(describe_size).unwrap_or_default();
        println!("{kind} {:>10}  {}", size, entry.file_name());
    }
    browser.close();
    client.close();
    Ok(())
}

fn find_file(client: &BepClient, folder: &str, path: &str) -> Result<FileInfo> {
    client.update_index_from_peers();
    let Some(file_info) = client.index_handler().get_file_info_by_path(folder, path)? else {
        bail!("{folder}:{path} not found in any peer index");
    };
    if !file_info.is_file() || file_info.deleted {
        bail!("{file_info} is not a file");
    }
    Ok(file_info)
}

fn cmd_pull(path: &Path, folder: &str, file: &str, output: Option<&Path>) -> Result<()> {
    let client = open_client(path)?;
    let file_info = find_file(&client, folder, file)?;
    info!(file = %file_info, "downloading");

    let observer = client.pull_file(&file_info).context("Failed to start download")?;
    while !observer.is_completed() {
        observer.wait_for_progress_update().context("Download failed")?;
        eprintln!("{}", observer.progress_message());
    }

    let mut stream = observer.input_stream()?;
    match output {
        Some(out) if out == Path::new("-") => {
            let stdout = io::stdout();
            io::copy(&mut stream, &mut stdout.lock()).context("Failed to write to stdout")?;
        }
        _ => {
            let out = output
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(file_info.file_name()));
            let mut writer = BufWriter::new(File::create(&out).with_context(|| format!("Failed to create {}", out.display()))?);
            io::copy(&mut stream, &mut writer).context("Failed to write file")?;
            writer.flush()?;
            println!("Downloaded {} to {}", file_info.describe_size(), out.display());
        }
    }
    observer.close();
    client.close();
    Ok(())
}

fn cmd_push(path: &Path, folder: &str, target: &str, file: &Path) -> Result<()> {
    let client = open_client(path)?;
    let input = File::open(file).with_context(|| format!("Failed to open {}", file.display()))?;

    let observer = client.push_file(input, folder, target).context("Failed to start upload")?;
    while !observer.is_completed() {
        let percentage = observer.wait_for_progress_update().context("Upload failed")?;
        eprintln!("{percentage}%");
    }
    observer.close()?;
    println!("Uploaded {} to {folder}:{target}", file.display());
    client.close();
    Ok(())
}

fn cmd_mkdir(path: &Path, folder: &str, dir: &str) -> Result<()> {
    let client = open_client(path)?;
    let observer = client.push_dir(folder, dir).context("Failed to create directory")?;
    observer.wait_for_complete()?;
    observer.close()?;
    println!("Created {folder}:{dir}");
    client.close();
    Ok(())
}

fn cmd_rm(path: &Path, folder: &str, target: &str) -> Result<()> {
    let client = open_client(path)?;
    let observer = client.push_delete(folder, target).context("Failed to delete")?;
    observer.wait_for_complete()?;
    observer.close()?;
    println!("Deleted {folder}:{target}");
    client.close();
    Ok(())
}

fn cmd_sync(path: &Path) -> Result<()> {
    let client = open_client(path)?;
    client.update_index_from_peers();
    let connections = client.connections();
    println!("Synchronized with {} peer(s)", connections.len());
    for connection in connections {
        println!("  {connection}");
        if let Some(info) = connection.cluster_config_info() {
            for folder in info.folders().filter(|f| f.is_shared) {
                println!("    {} ({})", folder.label, folder.folder_id);
            }
        }
    }
    client.close();
    Ok(())
}
