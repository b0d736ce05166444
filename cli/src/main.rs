// eter: command-line node for the ÉTER mesh
//
// Cross-platform (macOS, Linux, Windows). Runs a mesh node, a relay server
// or a signaling server, and manages the local identity and config.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use eter_mesh_core::channel::{ChannelHub, PublicMessage};
use eter_mesh_core::relay::{GraphStore, MemoryRelay, RelayEndpoint, RelayServer};
use eter_mesh_core::signaling::{MemorySignalingHub, SignalingChannel, SignalingServer};
use eter_mesh_core::transport::{LoopbackNetwork, TransportEvent, TransportState};
use eter_mesh_core::{IdentityStore, ManualPairing, MeshConfig, MeshNode, NetworkStatus};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How long a manual pairing waits for the other device
const PAIRING_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(name = "eter")]
#[command(about = "ÉTER: serverless peer mesh with relay fallback", long_about = None)]
#[command(version)]
struct Cli {
    /// Also write logs to a daily-rotated file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a persistent identity
    Init {
        /// Nickname shown on public channels
        #[arg(short, long)]
        name: Option<String>,
        /// Replace an existing identity
        #[arg(long)]
        force: bool,
    },
    /// Show identity information
    Identity {
        #[command(subcommand)]
        action: Option<IdentityAction>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run a relay server
    Relay {
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Run a signaling (rendezvous) server
    Signal {
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Join the mesh and chat on a public channel
    Start {
        #[arg(short, long)]
        channel: Option<String>,
        /// Run without the stored identity
        #[arg(long)]
        anonymous: bool,
    },
    /// Send an end-to-end encrypted message to a public key
    Dm { recipient: String, message: String },
    /// Read the private inbox
    Inbox {
        /// Keep listening for new messages
        #[arg(short, long)]
        follow: bool,
    },
    /// Publish a JSON session snapshot and print its share id
    Share { file: PathBuf },
    /// Fetch a shared session snapshot by id
    FetchShare { share_id: String },
    /// Pair with another device by exchanging payloads by hand
    Pair {
        #[arg(value_enum)]
        role: PairRole,
    },
    /// Show network status
    Status {
        /// Seconds to listen for presence before reporting
        #[arg(short, long, default_value = "3")]
        wait: u64,
    },
    /// Run self-tests
    Test,
}

#[derive(Subcommand)]
enum IdentityAction {
    Show,
    /// Print the secret key (hex)
    Export,
    /// Delete the stored identity
    Reset,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },
}

#[derive(Subcommand)]
enum RelayAction {
    Add { url: String },
    Remove { url: String },
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum PairRole {
    Host,
    Guest,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Relay { .. } | Commands::Signal { .. } => "info",
        _ => "warn",
    };
    let _guard = init_tracing(default_level, cli.log_dir.as_deref())?;

    match cli.command {
        Commands::Init { name, force } => cmd_init(name, force).await,
        Commands::Identity { action } => cmd_identity(action).await,
        Commands::Config { action } => cmd_config(action).await,
        Commands::Relay { listen } => cmd_relay(listen).await,
        Commands::Signal { listen } => cmd_signal(listen).await,
        Commands::Start { channel, anonymous } => cmd_start(channel, anonymous).await,
        Commands::Dm { recipient, message } => cmd_dm(recipient, message).await,
        Commands::Inbox { follow } => cmd_inbox(follow).await,
        Commands::Share { file } => cmd_share(file).await,
        Commands::FetchShare { share_id } => cmd_fetch_share(share_id).await,
        Commands::Pair { role } => cmd_pair(role).await,
        Commands::Status { wait } => cmd_status(wait).await,
        Commands::Test => cmd_test().await,
    }
}

fn init_tracing(default_level: &str, log_dir: Option<&std::path::Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr = fmt::layer().with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "eter.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().json().with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            Ok(None)
        }
    }
}

fn identity_store() -> Result<IdentityStore> {
    Ok(IdentityStore::file(config::Config::identity_file()?))
}

/// Build a node from the saved config; `anonymous` skips the stored identity
fn build_node(config: &config::Config, anonymous: bool) -> Result<MeshNode> {
    let mut builder = MeshNode::builder(config.mesh.clone());

    if !anonymous {
        let store = identity_store()?;
        if let Some(keys) = store.load_keys()? {
            builder = builder.identity(keys);
        }
        if let Some(nickname) = store.load_nickname()? {
            builder = builder.alias(nickname);
        }
    }
    if let Some(alias) = &config.alias {
        builder = builder.alias(alias.clone());
    }

    Ok(builder.build()?)
}

/// Start a node that must carry an identity
async fn start_identified_node() -> Result<MeshNode> {
    let config = config::Config::load()?;
    let node = build_node(&config, false)?;
    if node.identity().is_none() {
        anyhow::bail!("No identity found. Run: eter init");
    }
    let status = node.start().await?;
    if status == NetworkStatus::Offline {
        println!("{} No relay reachable, relay-backed operations will fail", "!".yellow());
    }
    Ok(node)
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

async fn wait_for_ctrl_c() -> Result<()> {
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")
}

async fn cmd_init(name: Option<String>, force: bool) -> Result<()> {
    let store = identity_store()?;

    if !force {
        if let Some(existing) = store.load_keys()? {
            println!("{} Identity already exists", "!".yellow());
            println!("  Peer ID: {}", existing.peer_id().to_string().bright_cyan());
            println!();
            println!("Use {} to replace it.", "eter init --force".bright_green());
            return Ok(());
        }
    }

    let keys = eter_mesh_core::IdentityKeys::generate();
    store.save_keys(&keys)?;
    if let Some(nickname) = &name {
        store.save_nickname(nickname)?;
    }

    println!("{}", "Identity created".green().bold());
    println!();
    println!("  Peer ID:    {}", keys.peer_id().to_string().bright_cyan());
    if let Some(nickname) = name {
        println!("  Nickname:   {}", nickname);
    }
    println!("  Stored in:  {}", config::Config::identity_file()?.display());
    println!();
    println!("{}", "Next steps:".bold());
    println!("  {} add a relay", "eter config relay add ws://<host>:<port>".bright_green());
    println!("  {} join the mesh", "eter start".bright_green());

    Ok(())
}

async fn cmd_identity(action: Option<IdentityAction>) -> Result<()> {
    let store = identity_store()?;
    let keys = store.load_keys()?;

    match action.unwrap_or(IdentityAction::Show) {
        IdentityAction::Show => {
            let Some(keys) = keys else {
                println!("{}", "No identity yet. Run: eter init".dimmed());
                return Ok(());
            };
            println!("{}", "Identity".bold());
            println!("  Peer ID:    {}", keys.peer_id().to_string().bright_cyan());
            println!("  Public Key: {}", keys.public_key_hex().bright_yellow());
            if let Some(nickname) = store.load_nickname()? {
                println!("  Nickname:   {}", nickname);
            }
        }

        IdentityAction::Export => {
            let keys = keys.context("No identity to export. Run: eter init")?;
            println!("{} Keep this secret. Anyone holding it can read your inbox.", "!".yellow());
            println!("{}", keys.to_secret_hex().as_str());
        }

        IdentityAction::Reset => {
            store.clear()?;
            println!("{} Identity removed", "✓".green());
        }
    }

    Ok(())
}

async fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }

            println!();
            print_relays(&config);
        }

        ConfigAction::Relay { action } => match action {
            RelayAction::Add { url } => {
                if config.add_relay(url.clone())? {
                    println!("{} Added relay: {}", "✓".green(), url);
                } else {
                    println!("{}", "Relay already configured.".dimmed());
                }
            }

            RelayAction::Remove { url } => {
                if config.remove_relay(&url)? {
                    println!("{} Removed relay", "✓".green());
                } else {
                    println!("{}", "Relay not configured.".dimmed());
                }
            }

            RelayAction::List => print_relays(&config),
        },
    }

    Ok(())
}

fn print_relays(config: &config::Config) {
    println!("{}", "Relays:".bold());
    if config.mesh.relays.is_empty() {
        println!("  {}", "(none configured)".dimmed());
    } else {
        for (i, relay) in config.mesh.relays.iter().enumerate() {
            println!("  {}. {}", i + 1, relay);
        }
    }
}

async fn cmd_relay(listen: Option<String>) -> Result<()> {
    let config = config::Config::load()?;
    let addr = listen.unwrap_or(config.listen_addr);

    let handle = RelayServer::new().bind(&addr).await?;
    println!("{} Relay listening on {}", "✓".green(), handle.url().bright_cyan());
    println!("{}", "Press Ctrl-C to stop.".dimmed());

    wait_for_ctrl_c().await?;

    let stats = handle.stats();
    handle.shutdown().await;
    println!(
        "Served {} connection(s), {} write(s), {} read(s)",
        stats.connections_total, stats.writes_applied, stats.reads_served
    );
    Ok(())
}

async fn cmd_signal(listen: Option<String>) -> Result<()> {
    let config = config::Config::load()?;
    let addr = listen.unwrap_or(config.listen_addr);

    let handle = SignalingServer::new().bind(&addr).await?;
    println!("{} Signaling listening on {}", "✓".green(), handle.url().bright_cyan());
    println!("{}", "Press Ctrl-C to stop.".dimmed());

    wait_for_ctrl_c().await?;
    handle.shutdown().await;
    Ok(())
}

async fn cmd_start(channel: Option<String>, anonymous: bool) -> Result<()> {
    let config = config::Config::load()?;
    let channel = channel.unwrap_or_else(|| config.default_channel.clone());
    let node = build_node(&config, anonymous)?;

    println!("{}", "Starting ÉTER node...".bold());
    println!();
    println!("Peer ID: {}", node.local_peer().to_string().bright_cyan());

    let status = node.start().await?;
    println!("{} Network {}", "✓".green(), status_label(status));
    println!();

    let result = chat(&node, &channel).await;

    node.shutdown().await;
    result
}

/// Interactive chat on `channel` until stdin closes or the user quits
async fn chat(node: &MeshNode, channel: &str) -> Result<()> {
    let mut room = node.channels().join_public(channel).await?;
    println!("Joined #{}", room.name().bright_cyan());
    println!();
    println!("{}", "Commands:".bold());
    println!("  {}   live peers", "/peers".bright_green());
    println!("  {}  network status", "/status".bright_green());
    println!("  {}    leave", "/quit".bright_green());
    println!("  anything else is sent to the channel");
    println!();

    let own = node.local_peer().clone();
    let mut transport_events = node.transport().subscribe();
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    prompt();

    loop {
        tokio::select! {
            incoming = room.recv() => {
                let Some(message) = incoming else { break };
                if message.sender != own.as_str() {
                    print_public(&message);
                    prompt();
                }
            }

            event = transport_events.recv() => {
                match event {
                    Ok(TransportEvent::Connected { peer_id }) => {
                        println!("\n{} Direct link to {}", "✓".green(), peer_id.short());
                        prompt();
                    }
                    Ok(TransportEvent::Disconnected { peer_id }) => {
                        println!("\n{} Direct link to {} closed", "✗".red(), peer_id.short());
                        prompt();
                    }
                    Ok(TransportEvent::DataReceived { .. }) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    _ => break,
                };
                let line = line.trim();

                match line {
                    "" => {}
                    "/quit" | "/exit" => {
                        println!("Shutting down...");
                        break;
                    }
                    "/peers" => {
                        let peers = node.live_peers();
                        if peers.is_empty() {
                            println!("No peers.");
                        }
                        for peer in peers {
                            let via = if peer.direct { "direct" } else { "relay" };
                            println!("  • {} [{}]", peer.peer_id.short().bright_cyan(), via.dimmed());
                        }
                    }
                    "/status" => print_status(node),
                    text => match node.channels().send_public(channel, text).await {
                        Ok(report) => {
                            tracing::debug!(
                                "Message {} sent to {} direct peer(s), {} relay(s)",
                                report.message.id, report.direct, report.relay
                            );
                        }
                        Err(e) => println!("{} {}", "✗".red(), e),
                    },
                }
                prompt();
            }
        }
    }

    room.leave();
    Ok(())
}

fn print_public(message: &PublicMessage) {
    println!(
        "\n{} {} [{}]: {}",
        "←".bright_blue(),
        message.alias.bright_cyan(),
        format_timestamp(message.timestamp).dimmed(),
        message.text
    );
}

fn status_label(status: NetworkStatus) -> ColoredString {
    match status {
        NetworkStatus::Online => "online".green(),
        NetworkStatus::Searching => "searching".yellow(),
        NetworkStatus::Offline => "offline".red(),
    }
}

fn print_status(node: &MeshNode) {
    let health = node.health();
    println!("Status:  {}", status_label(node.status()));
    println!("Relays:  {}/{} connected", health.connected, health.configured);
    match health.last_self_test {
        Some(true) => println!("Check:   {}", "relay round-trip ok".green()),
        Some(false) => println!("Check:   {}", "relay round-trip failed".red()),
        None => println!("Check:   {}", "not run".dimmed()),
    }
    println!("Direct:  {}", node.transport().connection_count());
    println!("Peers:   {}", node.peer_count());
}

async fn cmd_dm(recipient: String, message: String) -> Result<()> {
    let node = start_identified_node().await?;
    let result = node.channels().send_private(&recipient, &message).await;
    node.shutdown().await;

    let sent = result?;
    println!("{} Sent {} to {}", "✓".green(), sent.id.dimmed(), recipient.bright_cyan());
    Ok(())
}

async fn cmd_inbox(follow: bool) -> Result<()> {
    let node = start_identified_node().await?;
    let hub: &ChannelHub = node.channels();

    let messages = match hub.fetch_inbox().await {
        Ok(messages) => messages,
        Err(e) => {
            node.shutdown().await;
            return Err(e.into());
        }
    };

    if messages.is_empty() {
        println!("{}", "Inbox is empty.".dimmed());
    } else {
        println!("{} ({} messages)", "Inbox".bold(), messages.len());
        println!();
        for message in &messages {
            println!(
                "{} {} [{}]",
                "←".bright_blue(),
                short_key(&message.from).bright_cyan(),
                format_timestamp(message.timestamp).dimmed()
            );
            println!("   {}", message.text);
        }
    }

    if follow {
        let mut live = hub.subscribe_inbox().await?;
        println!();
        println!("{}", "Waiting for messages, Ctrl-C to stop.".dimmed());
        loop {
            tokio::select! {
                message = live.recv() => {
                    let Some(message) = message else { break };
                    if messages.iter().any(|m| m.id == message.id) {
                        continue;
                    }
                    println!("{} {}: {}", "←".bright_blue(), short_key(&message.from).bright_cyan(), message.text);
                }
                _ = wait_for_ctrl_c() => break,
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

async fn cmd_share(file: PathBuf) -> Result<()> {
    let contents = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let session: serde_json::Value =
        serde_json::from_str(&contents).context("Session file is not valid JSON")?;

    let node = start_identified_node().await?;
    let result = node.channels().share_session(&session).await;
    node.shutdown().await;

    let share_id = result?;
    println!("{} Shared session", "✓".green());
    println!("  Share ID: {}", share_id.bright_cyan());
    Ok(())
}

async fn cmd_fetch_share(share_id: String) -> Result<()> {
    let node = start_identified_node().await?;
    let result = node.channels().fetch_shared_session(&share_id).await;
    node.shutdown().await;

    let session = result?;
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

async fn cmd_pair(role: PairRole) -> Result<()> {
    let config = config::Config::load()?;
    let node = build_node(&config, false)?;
    node.start().await?;

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    let mut pairing = match role {
        PairRole::Host => node.pair_host().await?,
        PairRole::Guest => node.pair_guest().await?,
    };

    if let Some(offer) = pairing.outbound_payload() {
        println!("{}", "Send this code to the other device:".bold());
        println!();
        println!("{}", offer);
        println!();
        println!("{}", "Paste the code you get back:".bold());
    } else {
        println!("{}", "Paste the code from the host device:".bold());
    }

    loop {
        prompt();
        let line = match lines.next_line().await? {
            Some(line) => line,
            None => {
                pairing.cancel().await;
                node.shutdown().await;
                anyhow::bail!("Pairing cancelled");
            }
        };
        match pairing.accept_inbound_payload(&line).await {
            Ok(()) => break,
            Err(e) => println!("{} {}, try again", "✗".red(), e),
        }
    }

    if let PairRole::Guest = role {
        if let Some(answer) = pairing.outbound_payload() {
            println!();
            println!("{}", "Send this code back to the host:".bold());
            println!();
            println!("{}", answer);
            println!();
        }
    }

    println!("{}", "Waiting for the direct link...".dimmed());
    if let Err(e) = wait_for_pairing(&pairing).await {
        pairing.cancel().await;
        node.shutdown().await;
        return Err(e);
    }
    println!("{} Paired with {}", "✓".green(), pairing.peer_id().short().bright_cyan());
    println!();

    let result = chat(&node, &config.default_channel).await;

    node.shutdown().await;
    result
}

async fn wait_for_pairing(pairing: &ManualPairing) -> Result<()> {
    pairing
        .wait_connected(PAIRING_TIMEOUT)
        .await
        .context("Direct link was not established")
}

async fn cmd_status(wait: u64) -> Result<()> {
    let config = config::Config::load()?;
    let node = build_node(&config, false)?;

    println!("{}", "ÉTER Status".bold());
    println!();
    println!("Peer ID: {}", node.local_peer().to_string().bright_cyan());

    node.start().await?;
    if node.relay().connected_count() > 0 {
        node.self_test().await;
    }
    tokio::time::sleep(Duration::from_secs(wait)).await;

    print_status(&node);
    node.shutdown().await;
    Ok(())
}

/// Two in-process nodes exercise presence, direct links and both channels
async fn cmd_test() -> Result<()> {
    println!("{}", "Running self-tests...".bold());
    println!();

    let config = MeshConfig {
        staleness_window_ms: 2_000,
        heartbeat_interval_ms: 100,
        stun_servers: Vec::new(),
        ..MeshConfig::default()
    };
    let store = Arc::new(GraphStore::new());
    let hub = MemorySignalingHub::new();
    let network = LoopbackNetwork::new();

    let make_node = |alias: &str| -> Result<MeshNode> {
        let relay: Arc<dyn RelayEndpoint> = Arc::new(MemoryRelay::new("mem://self-test", store.clone()));
        let signaling: Arc<dyn SignalingChannel> = Arc::new(hub.channel());
        Ok(MeshNode::builder(config.clone())
            .identity(eter_mesh_core::IdentityKeys::generate())
            .alias(alias)
            .relay_endpoints(vec![relay])
            .signaling(signaling)
            .link_factory(Arc::new(network.clone()))
            .build()?)
    };
    let alice = make_node("alice")?;
    let bob = make_node("bob")?;
    let eve = make_node("eve")?;
    println!("{} Identity generation", "✓".green());

    alice.start().await?;
    bob.start().await?;
    anyhow::ensure!(alice.self_test().await, "Relay round-trip failed");
    println!("{} Relay round-trip", "✓".green());

    let met = poll(Duration::from_secs(5), || {
        alice.peer_count() == 1 && bob.transport().state(alice.local_peer()) == TransportState::Connected
    })
    .await;
    anyhow::ensure!(met, "Nodes never saw each other");
    println!("{} Presence and direct link", "✓".green());

    let mut room = bob.channels().join_public("self-test").await?;
    alice.channels().send_public("self-test", "hello mesh").await?;
    let received = tokio::time::timeout(Duration::from_secs(3), room.recv())
        .await
        .context("Public message never arrived")?
        .context("Channel closed")?;
    anyhow::ensure!(received.text == "hello mesh", "Public message corrupted");
    println!("{} Public channel", "✓".green());

    let bob_key = bob.identity().map(|k| k.public_key_hex()).context("bob has no identity")?;
    alice.channels().send_private(&bob_key, "Secret").await?;
    let inbox = bob.channels().fetch_inbox().await?;
    anyhow::ensure!(inbox.iter().any(|m| m.text == "Secret"), "Private message missing");
    println!("{} Private inbox", "✓".green());

    eve.start().await?;
    let leaked = eve.channels().fetch_inbox().await?;
    anyhow::ensure!(leaked.is_empty(), "Private message readable by the wrong key");
    println!("{} Encryption security", "✓".green());

    for node in [&alice, &bob, &eve] {
        node.shutdown().await;
    }

    println!();
    println!("{}", "All tests passed!".green().bold());
    Ok(())
}

async fn poll(limit: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

fn short_key(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}

fn format_timestamp(timestamp_ms: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp_millis(timestamp_ms as i64).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();

    local.format("%H:%M:%S").to_string()
}
