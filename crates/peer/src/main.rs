use clap::Parser;
use retrieval_peer::{
    bridge::{BridgeEvent, ChannelBridge, UiCommand},
    config::{
        default_setup_config_path, load_setup_config, save_setup_config, FilePriceSource,
        PeerConfig, SetupConfig, DEFAULT_RENDEZVOUS_HOST, DEFAULT_RENDEZVOUS_PORT,
    },
    p2p::{load_or_create_identity, parse_multiaddrs, Libp2pLauncher},
    peer::{Collaborators, Peer},
    save::DirectorySaver,
    ws_bridge::WsBridge,
};
use std::{
    fs,
    io::{self, IsTerminal, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, oneshot},
};
use tracing::{info, warn};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "retrieval-peer",
    version,
    about = "Peer that answers price queries for pinned content and retrieves content it asks about"
)]
struct Args {
    #[arg(long, default_value = "./peer-data")]
    storage_path: String,

    #[arg(long, default_value_t = 10)]
    max_gb: u64,

    #[arg(long, num_args = 0.., default_value = "/ip4/0.0.0.0/tcp/0")]
    listen: Vec<String>,

    #[arg(long, default_value = DEFAULT_RENDEZVOUS_HOST)]
    rendezvous_host: String,

    #[arg(long, default_value_t = DEFAULT_RENDEZVOUS_PORT)]
    rendezvous_port: u16,

    /// Options file holding `pricesPerByte`; defaults to `<storage>/options.json`.
    #[arg(long)]
    options: Option<String>,

    #[arg(long, default_value = "./downloads")]
    download_dir: String,

    /// WebSocket URL of a UI; without it events go to stdout and commands
    /// come from stdin.
    #[arg(long)]
    ui_url: Option<String>,

    #[arg(long)]
    setup_config_path: Option<String>,

    #[arg(long, default_value_t = false)]
    interactive_setup: bool,

    #[arg(long, default_value_t = false)]
    print_peer_id: bool,

    #[arg(long, default_value_t = false)]
    log_json: bool,

    #[arg(long, default_value_t = false)]
    mdns: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let setup = build_setup_config(&args)?;
    fs::create_dir_all(&setup.storage_path)?;
    let storage_path = PathBuf::from(&setup.storage_path);
    let keypair = load_or_create_identity(&storage_path)?;
    if args.print_peer_id {
        println!("{}", keypair.public().to_peer_id());
        return Ok(());
    }

    info!(
        max_gb = setup.max_gb,
        path = %setup.storage_path,
        "Peer storage allocation configured"
    );

    let options_path = args
        .options
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| storage_path.join("options.json"));
    let (bridge, events) = ChannelBridge::channel();
    let collaborators = Collaborators {
        launcher: Arc::new(Libp2pLauncher {
            keypair,
            storage_path,
            max_gb: setup.max_gb,
            listen: parse_multiaddrs(&args.listen)?,
            enable_mdns: args.mdns,
        }),
        bridge: Arc::new(bridge),
        prices: Arc::new(FilePriceSource::new(options_path)),
        saver: Arc::new(DirectorySaver::new(&args.download_dir)),
    };
    let peer = Peer::create(
        PeerConfig::new(setup.rendezvous_host, setup.rendezvous_port),
        collaborators,
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    match args.ui_url {
        Some(url) => {
            WsBridge {
                url,
                peer: peer.clone(),
            }
            .run(events, shutdown_rx)
            .await?
        }
        None => run_console(peer.clone(), events, shutdown_rx).await?,
    }

    peer.stop().await
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

/// Prints bridge events as JSON lines and reads commands from stdin until
/// `quit`, end of input or ctrl-c.
async fn run_console(
    peer: Arc<Peer>,
    mut events: mpsc::UnboundedReceiver<BridgeEvent>,
    mut shutdown: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!(error = %e, "Failed to encode event"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        match line.trim() {
            "" => {}
            "quit" => break,
            "pins" => peer.post_pins(),
            other => match UiCommand::parse_line(other) {
                Some(command) => {
                    let peer = peer.clone();
                    tokio::spawn(async move { peer.dispatch(command).await });
                }
                None => warn!(input = %other, "Unrecognized command"),
            },
        }
    }

    printer.abort();
    Ok(())
}

fn build_setup_config(args: &Args) -> anyhow::Result<SetupConfig> {
    let launched_without_flags = std::env::args_os().len() <= 1;
    let has_terminal = io::stdin().is_terminal() && io::stdout().is_terminal();
    let config_path = args
        .setup_config_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(default_setup_config_path);
    let defaults = SetupConfig {
        storage_path: args.storage_path.clone(),
        max_gb: args.max_gb,
        rendezvous_host: args.rendezvous_host.clone(),
        rendezvous_port: args.rendezvous_port,
    };

    if args.interactive_setup || (launched_without_flags && has_terminal) {
        return run_interactive_setup(&defaults, &config_path);
    }

    if launched_without_flags {
        if let Some(saved) = load_setup_config(&config_path)? {
            info!(path = %config_path.display(), "Loaded saved peer setup");
            return Ok(saved);
        }
    }

    Ok(defaults)
}

fn run_interactive_setup(
    defaults: &SetupConfig,
    config_path: &Path,
) -> anyhow::Result<SetupConfig> {
    println!("===============================================");
    println!("            Retrieval Peer Setup               ");
    println!("===============================================");

    let mut baseline = defaults.clone();
    if let Some(saved) = load_setup_config(config_path)? {
        println!(
            "Found saved configuration at {}. Press Enter to keep current values.",
            config_path.to_string_lossy()
        );
        baseline = saved;
    }

    let storage_path = prompt_with_default("Storage directory", &baseline.storage_path)?;
    let max_gb = prompt_u64_with_default("Storage to allocate in GB", baseline.max_gb)?;
    let rendezvous_host = prompt_with_default("Rendezvous host", &baseline.rendezvous_host)?;
    let rendezvous_port = loop {
        let input = prompt_with_default("Rendezvous port", &baseline.rendezvous_port.to_string())?;
        match input.parse::<u16>() {
            Ok(port) if port > 0 => break port,
            _ => println!("Please enter a port between 1 and 65535."),
        }
    };

    let setup = SetupConfig {
        storage_path,
        max_gb,
        rendezvous_host,
        rendezvous_port,
    };
    save_setup_config(config_path, &setup)?;
    println!("Saved setup config to {}", config_path.to_string_lossy());
    Ok(setup)
}

fn prompt_with_default(label: &str, default_value: &str) -> anyhow::Result<String> {
    print!("{label} [{default_value}]: ");
    io::stdout().flush()?;

    let mut buf = String::new();
    io::stdin().read_line(&mut buf)?;
    let input = buf.trim();
    if input.is_empty() {
        return Ok(default_value.to_string());
    }
    Ok(input.to_string())
}

fn prompt_u64_with_default(label: &str, default_value: u64) -> anyhow::Result<u64> {
    loop {
        let input = prompt_with_default(label, &default_value.to_string())?;
        match input.parse::<u64>() {
            Ok(v) if v > 0 => return Ok(v),
            _ => println!("Please enter a positive integer."),
        }
    }
}
