use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ota_core::diagnostics;
use ota_core::{
    AgentConfig, BootSequencer, BootStateStore, FileBootStore, FileFlash, PeerEvent, PeerNotifier,
    PeerSignal, SlotManager, WritePipeline, transport,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Dual-slot OTA update agent (host runner)", long_about = None)]
struct Args {
    /// Agent configuration (TOML)
    #[arg(long, default_value = "ota-agent.toml")]
    config: PathBuf,

    /// Flash image file
    #[arg(long, default_value = "flash.bin")]
    flash: PathBuf,

    /// Persistent boot state file
    #[arg(long, default_value = "boot_state.toml")]
    state: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one boot cycle: checkpoint, then one update attempt
    Run,
    /// Show slots, health and the boot pointer
    Status,
    /// Write an image into the factory slot and boot from it
    Provision {
        /// Application image
        #[arg(long)]
        image: PathBuf,
    },
    /// Write the default configuration
    InitConfig,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let result = match &args.command {
        Command::Run => run(&args),
        Command::Status => status(&args),
        Command::Provision { image } => provision(&args, image),
        Command::InitConfig => init_config(&args),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: &Path) -> Result<AgentConfig> {
    let config = if path.exists() {
        AgentConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?
    } else {
        info!(path = %path.display(), "No config file, using defaults");
        AgentConfig::default()
    };
    config.validate()?;
    Ok(config)
}

fn open_flash(args: &Args, config: &AgentConfig) -> Result<FileFlash> {
    FileFlash::open(&args.flash, config.layout.flash_size())
        .with_context(|| format!("Failed to open flash image {}", args.flash.display()))
}

fn run(args: &Args) -> Result<()> {
    let config = load_config(&args.config)?;
    let flash = open_flash(args, &config)?;
    let store = FileBootStore::new(&args.state);

    let slots = SlotManager::boot(config.layout.clone(), store, flash)?;
    if let Err(e) = diagnostics::log_boot_digests(&slots) {
        warn!("Failed to compute boot digests: {}", e);
    }

    info!(
        ssid = %config.network.ssid,
        channel = config.network.channel,
        max_peers = config.network.max_peers,
        "Access point configured"
    );
    let (signal, notifier) = PeerSignal::pair();
    spawn_peer_probe(&config, notifier);

    let mut transport = transport::for_url(&config.update_url);
    let outcome = BootSequencer::new(config, slots).run(&signal, &mut transport);

    println!("Restart onto {} ({})", outcome.slot(), outcome.cause());
    Ok(())
}

/// Report the update server as the attached peer while it accepts TCP connections.
fn spawn_peer_probe(config: &AgentConfig, notifier: PeerNotifier) {
    let interval = config.peer_poll_interval().max(Duration::from_millis(100));
    let Some(authority) = server_authority(&config.update_url) else {
        // Local images need no peer.
        notifier.notify(&PeerEvent::Attached {
            peer: "local".into(),
            aid: 0,
        });
        return;
    };

    thread::spawn(move || {
        let mut attached = false;
        loop {
            let reachable = authority
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .is_some_and(|addr| TcpStream::connect_timeout(&addr, interval).is_ok());

            if reachable != attached {
                attached = reachable;
                let peer = authority.clone();
                notifier.notify(&if attached {
                    PeerEvent::Attached { peer, aid: 1 }
                } else {
                    PeerEvent::Detached { peer, aid: 1 }
                });
            }
            thread::sleep(interval);
        }
    });
}

/// `host:port` of an http(s) URL.
fn server_authority(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let default_port = match scheme {
        "https" => 443,
        "http" => 80,
        _ => return None,
    };
    let authority = rest.split('/').next().filter(|a| !a.is_empty())?;
    if authority.contains(':') {
        Some(authority.to_string())
    } else {
        Some(format!("{}:{}", authority, default_port))
    }
}

fn status(args: &Args) -> Result<()> {
    let config = load_config(&args.config)?;
    let flash = open_flash(args, &config)?;
    let store = FileBootStore::new(&args.state);
    let state = store.load()?;

    let layout = config.layout.clone();
    let pointer = state.next_boot.and_then(|a| layout.by_address(a));
    let Some(current) = pointer.or_else(|| layout.default_boot()) else {
        bail!("Layout has no application slot");
    };
    let slots = SlotManager::new(layout, store, flash, current);

    println!("{:<16} {:>10} {:>10}  {:<16} {}", "SLOT", "ADDRESS", "SIZE", "HEALTH", "VERSION");
    for slot in slots.layout().slots.iter() {
        let (health, version) = if slot.is_application() {
            let version = slots
                .describe(*slot)?
                .map(|m| m.version.label())
                .unwrap_or_else(|| "-".into());
            (slots.health_of(*slot)?.to_string(), version)
        } else {
            ("-".into(), "-".into())
        };
        let marker = if Some(*slot) == pointer { " <- boot" } else { "" };
        println!(
            "{:<16} 0x{:08X} 0x{:08X}  {:<16} {}{}",
            slot.to_string(),
            slot.address,
            slot.size,
            health,
            version,
            marker
        );
    }

    if let Some(record) = &state.last_invalid {
        let version = record
            .firmware_version()
            .map(|v| v.label())
            .unwrap_or_else(|| "-".into());
        println!("Last invalid: 0x{:08X} (version {})", record.address, version);
    }
    Ok(())
}

fn provision(args: &Args, image_path: &Path) -> Result<()> {
    let config = load_config(&args.config)?;
    let Some(factory) = config.layout.factory() else {
        bail!("Layout has no factory slot");
    };

    let image = std::fs::read(image_path)
        .with_context(|| format!("Failed to read image {}", image_path.display()))?;
    let metadata = ota_core::parser::parse_header(&image)?;

    let flash = open_flash(args, &config)?;
    let pipeline = WritePipeline::new(&flash);
    let mut session = pipeline.open(factory, metadata)?;
    pipeline.write(&mut session, &image)?;
    let verified = pipeline.finalize(&mut session)?;

    let store = FileBootStore::new(&args.state);
    SlotManager::new(config.layout.clone(), store, flash, factory).set_boot_target(factory)?;

    info!(
        slot = %factory,
        version = %verified.metadata.version,
        len = verified.length,
        "Factory image provisioned"
    );
    Ok(())
}

fn init_config(args: &Args) -> Result<()> {
    if args.config.exists() {
        bail!("{} already exists", args.config.display());
    }
    AgentConfig::default().save_to_file(&args.config)?;
    info!(path = %args.config.display(), "Default configuration written");
    Ok(())
}
