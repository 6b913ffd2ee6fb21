//! Whisper CLI
//!
//! Thin wrapper around whisper-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! whisper info
//!
//! # Run a node, accept neighbors and dial one
//! whisper serve --listen 0.0.0.0:7420 --connect 192.168.1.20:7420
//!
//! # Send one message through a neighbor and exit
//! whisper send --connect 192.168.1.20:7420 <peer_id> "meet at the ridge"
//!
//! # List conversations, read one, mark it read
//! whisper conversations
//! whisper messages <peer_id>
//! whisper read <peer_id>
//!
//! # Flood a message through an in-process mesh
//! whisper simulate --nodes 6 --topology chain --ttl 2
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use whisper_core::query::{self, short_id};
use whisper_core::{
    CipherSuite, IdentityProvider, KeyManager, KvStore, MeshNode, MeshSimulation, NodeConfig,
    NodeEvent, PeerInfo, RedbKv, RelayPolicy, Topology, BROADCAST, DEFAULT_TTL,
};

/// Whisper - Offline Mesh Messaging
#[derive(Parser)]
#[command(name = "whisper")]
#[command(version)]
#[command(about = "Whisper - Offline Mesh Messaging")]
#[command(
    long_about = "Text messaging without infrastructure. Every node relays what it hears, so messages reach peers several hops away."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.whisper/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Cipher suite: keystream or sealed (both ends must agree)
    #[arg(long, global = true, default_value = "keystream")]
    cipher: CipherSuite,

    #[command(subcommand)]
    command: Commands,
}

/// Settings for commands that put a node on the mesh.
#[derive(Args, Clone)]
struct NodeOpts {
    /// Hop budget stamped on new packets
    #[arg(long, default_value_t = DEFAULT_TTL)]
    ttl: u32,

    /// Relay policy: flood or suppress
    #[arg(long, default_value = "flood")]
    relay: RelayPolicy,

    /// Send addressed text unencrypted even when the peer key is known
    #[arg(long)]
    plaintext: bool,

    /// Display name, used only when the identity is first created
    #[arg(long)]
    name: Option<String>,
}

impl NodeOpts {
    fn config(&self, cipher: CipherSuite) -> NodeConfig {
        let mut config = NodeConfig::default()
            .with_default_ttl(self.ttl)
            .with_relay_policy(self.relay)
            .with_encryption(!self.plaintext)
            .with_cipher_suite(cipher);
        if let Some(name) = &self.name {
            config = config.with_display_name(name);
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Key pair management
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// List conversations, newest first
    Conversations {
        /// Only show conversations with these peers (comma separated)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
    },

    /// Show the messages of one conversation
    Messages {
        /// Peer id, a unique suffix of one, or * for broadcasts
        peer: String,

        /// Number of most recent messages to show (default: all)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Mark a conversation as read
    Read {
        /// Peer id, a unique suffix of one, or * for broadcasts
        peer: String,
    },

    /// Delete one conversation
    Clear {
        /// Peer id, a unique suffix of one, or * for broadcasts
        peer: String,
    },

    /// Delete every conversation
    ClearAll {
        /// Confirm deletion (required)
        #[arg(long)]
        force: bool,
    },

    /// Run a node until Ctrl+C
    Serve {
        /// Address to accept neighbors on
        #[arg(short, long, default_value = "0.0.0.0:7420")]
        listen: SocketAddr,

        /// Neighbors to dial on startup (repeatable)
        #[arg(short, long)]
        connect: Vec<SocketAddr>,

        #[command(flatten)]
        opts: NodeOpts,
    },

    /// Send one message through a neighbor and exit
    Send {
        /// Neighbor to hand the message to
        #[arg(short, long)]
        connect: SocketAddr,

        /// Recipient peer id (or * for everyone)
        to: String,

        /// Message text
        text: String,

        /// Seconds to wait for the neighbor's hello before sending
        #[arg(long, default_value_t = 5)]
        wait: u64,

        #[command(flatten)]
        opts: NodeOpts,
    },

    /// Flood one message through an in-process mesh and report who got it
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value_t = 5)]
        nodes: usize,

        /// Topology: full, ring, star, chain or none
        #[arg(short, long, default_value = "ring")]
        topology: Topology,

        /// Address node N instead of broadcasting
        #[arg(long)]
        to: Option<usize>,

        /// Message text
        #[arg(long, default_value = "hello mesh")]
        text: String,

        #[command(flatten)]
        opts: NodeOpts,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Show the local identity
    Show,
    /// Generate a new identity (WARNING: replaces existing)
    Reset {
        /// Confirm reset (required)
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum KeysAction {
    /// Show key pair metadata
    Show,
    /// Replace the key pair (WARNING: old messages become unreadable)
    Rotate {
        /// Confirm rotation (required)
        #[arg(long)]
        force: bool,
    },
    /// Delete the key pair
    Delete {
        /// Confirm deletion (required)
        #[arg(long)]
        force: bool,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory (~/.whisper/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".whisper")
        .join("data")
}

/// Open the redb file backing every persisted record
fn open_kv(data_dir: &Path) -> Result<Arc<dyn KvStore>> {
    std::fs::create_dir_all(data_dir).map_err(|e| {
        anyhow::anyhow!("Failed to create data directory {}: {}", data_dir.display(), e)
    })?;
    let kv = RedbKv::open(data_dir.join("whisper.redb"))?;
    Ok(Arc::new(kv))
}

fn format_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| ms.to_string())
}

fn index_list(indexes: &[usize]) -> String {
    if indexes.is_empty() {
        return "(none)".to_string();
    }
    indexes
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Human label for a peer id
fn peer_label(node: &MeshNode, id: &str) -> String {
    if id == BROADCAST {
        return "(broadcast)".to_string();
    }
    if id == node.id() {
        return "You".to_string();
    }
    node.peers()
        .get(id)
        .map(|p| p.display_name())
        .unwrap_or_else(|| short_id(id).to_string())
}

/// Expand a unique id suffix to the full id of a known peer or conversation
fn resolve_peer(node: &MeshNode, input: &str) -> String {
    if input == BROADCAST {
        return input.to_string();
    }
    let mut known: HashSet<String> = node.peers().list().into_iter().map(|p| p.id).collect();
    known.extend(node.store().get_conversations().into_iter().map(|s| s.peer_id));
    if known.contains(input) {
        return input.to_string();
    }

    let matches: Vec<&String> = known.iter().filter(|id| id.ends_with(input)).collect();
    match matches.as_slice() {
        [only] => only.to_string(),
        _ => input.to_string(),
    }
}

fn print_event(node: &MeshNode, event: &NodeEvent) {
    match event {
        NodeEvent::MessageReceived { message, text } => {
            let channel = if message.to == BROADCAST {
                " (broadcast)"
            } else {
                ""
            };
            println!(
                "{}{}: {}",
                peer_label(node, &message.from),
                channel,
                text.as_deref().unwrap_or("[unreadable]")
            );
        }
        NodeEvent::DecryptFailed { from, error, .. } => {
            eprintln!(
                "Could not decrypt message from {}: {}",
                peer_label(node, from),
                error
            );
        }
        NodeEvent::VoiceStart { from, .. } => {
            println!("{} started a voice session", peer_label(node, from));
        }
        NodeEvent::VoiceEnd { from, .. } => {
            println!("{} ended a voice session", peer_label(node, from));
        }
        NodeEvent::PeerLinked { peer, link } => {
            println!("[+] {} ({}) on {}", peer.display_name(), short_id(&peer.id), link);
        }
        NodeEvent::PeerUnlinked { peer_id, link } => {
            println!("[-] {} left {}", peer_label(node, peer_id), link);
        }
    }
}

/// Send a line typed into `serve`: `@<peer> text` addresses one peer,
/// anything else is broadcast.
async fn send_line(node: &MeshNode, line: &str) {
    if line.is_empty() {
        return;
    }
    let (to, text) = match line.strip_prefix('@').and_then(|rest| rest.split_once(' ')) {
        Some((to, text)) => (resolve_peer(node, to), text.trim()),
        None => (BROADCAST.to_string(), line),
    };

    match node.send_text(&to, text).await {
        Ok(outcome) if outcome.queued => {
            println!("(queued {}, no neighbor in range)", short_id(&outcome.packet_id));
        }
        Ok(_) => println!("You -> {}: {}", peer_label(node, &to), text),
        Err(e) => eprintln!("Failed to send: {}", e),
    }
}

/// Wait for the first hello on any link.
async fn wait_for_peer(events: &mut tokio::sync::broadcast::Receiver<NodeEvent>) -> Option<PeerInfo> {
    loop {
        match events.recv().await {
            Ok(NodeEvent::PeerLinked { peer, .. }) => return Some(peer),
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let cipher = cli.cipher;

    match cli.command {
        // In-memory only; never touches the data directory
        Commands::Simulate {
            nodes,
            topology,
            to,
            text,
            opts,
        } => simulate(nodes, topology, to, &text, opts.config(cipher)).await,

        Commands::Identity { action } => identity_command(action, open_kv(&data_dir)?).await,

        Commands::Keys { action } => keys_command(action, open_kv(&data_dir)?).await,

        Commands::Serve {
            listen,
            connect,
            opts,
        } => {
            let node = MeshNode::open(open_kv(&data_dir)?, opts.config(cipher)).await?;
            serve(Arc::new(node), listen, connect, &data_dir).await
        }

        Commands::Send {
            connect,
            to,
            text,
            wait,
            opts,
        } => {
            let node = MeshNode::open(open_kv(&data_dir)?, opts.config(cipher)).await?;
            send_once(Arc::new(node), connect, &to, &text, Duration::from_secs(wait)).await
        }

        command => {
            let config = NodeConfig::default().with_cipher_suite(cipher);
            let node = MeshNode::open(open_kv(&data_dir)?, config).await?;
            let result = local_command(command, &node, &data_dir).await;
            node.shutdown().await?;
            result
        }
    }
}

async fn identity_command(action: IdentityAction, kv: Arc<dyn KvStore>) -> Result<()> {
    let provider = IdentityProvider::new(kv);

    match action {
        IdentityAction::Show => {
            let identity = provider.get_or_create().await?;
            println!("Identity:");
            println!("  ID: {}", identity.id);
            println!("  Short ID: {}", identity.short_id());
            println!("  Name: {}", identity.name);
            println!("  Created: {}", format_time(identity.created_at));
        }

        IdentityAction::Reset { force } => {
            if !force {
                println!("WARNING: Resetting identity is IRREVERSIBLE!");
                println!();
                println!("This will:");
                println!("  - Generate a new node id and name");
                println!("  - Make peers see you as a different node");
                println!();
                println!("To confirm, run: whisper identity reset --force");
            } else {
                provider.reset().await?;
                let identity = provider.get_or_create().await?;
                println!("Identity reset.");
                println!("  New ID: {}", identity.id);
                println!("  Name: {}", identity.name);
            }
        }
    }
    Ok(())
}

async fn keys_command(action: KeysAction, kv: Arc<dyn KvStore>) -> Result<()> {
    let keys = KeyManager::new(kv);

    match action {
        KeysAction::Show => {
            let metadata = keys.metadata().await?;
            if metadata.has_keys {
                let pair = keys.get_or_create().await?;
                println!("Keys:");
                println!("  Public key: {}", pair.public_key);
                println!("  Created: {}", format_time(pair.created_at));
            } else {
                println!("No key pair stored.");
                println!("A new pair is generated the next time the node starts.");
            }
        }

        KeysAction::Rotate { force } => {
            if !force {
                println!("WARNING: Rotating keys is IRREVERSIBLE!");
                println!();
                println!("This will:");
                println!("  - Generate a new key pair");
                println!("  - Make messages encrypted to the old key unreadable");
                println!();
                println!("To confirm, run: whisper keys rotate --force");
            } else {
                let pair = keys.rotate().await?;
                println!("Keys rotated.");
                println!("  New public key: {}", pair.public_key);
            }
        }

        KeysAction::Delete { force } => {
            if !force {
                println!("WARNING: Deleting keys is IRREVERSIBLE!");
                println!();
                println!("Encrypted messages will no longer be readable.");
                println!();
                println!("To confirm, run: whisper keys delete --force");
            } else {
                keys.delete().await?;
                println!("Keys deleted.");
            }
        }
    }
    Ok(())
}

async fn local_command(command: Commands, node: &MeshNode, data_dir: &Path) -> Result<()> {
    match command {
        Commands::Info => {
            let summaries = node.conversations(false);

            println!("Whisper v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Identity:");
            println!("  ID: {}", node.id());
            println!("  Name: {}", node.identity().name);
            println!("  Public key: {}", node.public_key());
            println!("  Cipher: {}", node.cipher().algorithm());
            println!();
            println!("Mesh:");
            println!("  Default TTL: {}", node.config().default_ttl);
            println!("  Relay policy: {:?}", node.config().relay_policy);
            println!("  Known peers: {}", node.peers().list().len());
            println!("  Pending packets: {}", node.store().pending().len());
            println!();
            println!("Messages:");
            println!("  Conversations: {}", summaries.len());
            println!("  Unread: {}", query::total_unread(&summaries));
            println!();
            println!("Data directory: {}", data_dir.display());
        }

        Commands::Conversations { only } => {
            let allow: Option<HashSet<String>> = if only.is_empty() {
                None
            } else {
                Some(only.iter().map(|p| resolve_peer(node, p)).collect())
            };
            let summaries = query::list_conversations(node.store(), allow.as_ref());

            if summaries.is_empty() {
                println!("No conversations.");
            } else {
                println!("Conversations ({}):", summaries.len());
                println!();
                for summary in summaries {
                    let unread = if summary.unread_count > 0 {
                        format!(" [{} unread]", summary.unread_count)
                    } else {
                        String::new()
                    };
                    println!(
                        "  {}{} - {}",
                        peer_label(node, &summary.peer_id),
                        unread,
                        format_time(summary.last_updated)
                    );
                    println!("    Peer: {}", summary.peer_id);
                    let who = if summary.last_from_me { "You: " } else { "" };
                    println!("    {}{}", who, summary.preview);
                    println!();
                }
            }
        }

        Commands::Messages { peer, limit } => {
            let peer = resolve_peer(node, &peer);
            let messages = node.store().get_messages(&peer);

            if messages.is_empty() {
                println!("No messages with {}.", peer);
            } else {
                let skip = limit.map_or(0, |n| messages.len().saturating_sub(n));
                println!("Conversation with {}:", peer_label(node, &peer));
                println!();
                for message in &messages[skip..] {
                    let body = match node.message_text(message) {
                        Ok(Some(text)) => text,
                        Ok(None) => "[no text]".to_string(),
                        Err(e) => format!("[unreadable: {}]", e),
                    };
                    println!(
                        "  [{}] {}: {}",
                        format_time(message.timestamp),
                        peer_label(node, &message.from),
                        body
                    );
                }
            }
        }

        Commands::Read { peer } => {
            let peer = resolve_peer(node, &peer);
            if !node.store().mark_conversation_read(&peer).await {
                anyhow::bail!("Conversation not found: {}", peer);
            }
            println!("Marked conversation with {} as read.", peer_label(node, &peer));
        }

        Commands::Clear { peer } => {
            let peer = resolve_peer(node, &peer);
            if !node.store().clear_conversation(&peer).await {
                anyhow::bail!("Conversation not found: {}", peer);
            }
            println!("Cleared conversation with {}.", peer_label(node, &peer));
        }

        Commands::ClearAll { force } => {
            if !force {
                println!("WARNING: This deletes every conversation and cannot be undone!");
                println!();
                println!("To confirm, run: whisper clear-all --force");
            } else {
                node.store().clear_all().await;
                println!("Cleared all conversations.");
            }
        }

        Commands::Identity { .. }
        | Commands::Keys { .. }
        | Commands::Serve { .. }
        | Commands::Send { .. }
        | Commands::Simulate { .. } => anyhow::bail!("Command needs a running node"),
    }
    Ok(())
}

async fn serve(
    node: Arc<MeshNode>,
    listen: SocketAddr,
    connect: Vec<SocketAddr>,
    data_dir: &Path,
) -> Result<()> {
    let mut events = node.subscribe_events();
    let inbox = node.spawn();

    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen on {}: {}", listen, e))?;
    let local_addr = listener.local_addr()?;

    println!("Starting Whisper node...");
    println!();
    println!("Identity:");
    println!("  ID: {}", node.id());
    println!("  Name: {}", node.identity().name);
    println!();
    println!("Listening on {}", local_addr);
    println!("Data directory: {}", data_dir.display());
    println!();

    let acceptor = {
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = node.serve_tcp(listener).await {
                tracing::error!(error = %e, "Listener stopped");
            }
        })
    };

    for addr in connect {
        match node.connect_tcp(addr).await {
            Ok(label) => println!("Connected to {}", label),
            Err(e) => eprintln!("Failed to connect to {}: {}", addr, e),
        }
    }

    println!("Node is running. Type a line to broadcast it, or \"@<peer> text\" to address one peer.");
    println!("Press Ctrl+C to stop.");
    println!();

    let reader = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = reader.lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Received shutdown signal...");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&node, &event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => send_line(&node, line.trim()).await,
                // Keep running headless once stdin is gone
                Ok(None) => stdin_open = false,
                Err(e) => {
                    eprintln!("Read error: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    println!("Shutting down...");
    acceptor.abort();
    node.shutdown().await?;
    inbox.abort();
    println!("Goodbye.");
    Ok(())
}

async fn send_once(
    node: Arc<MeshNode>,
    connect: SocketAddr,
    to: &str,
    text: &str,
    wait: Duration,
) -> Result<()> {
    let mut events = node.subscribe_events();
    let inbox = node.spawn();

    let label = node.connect_tcp(connect).await?;

    // The hello carries the neighbor's public key
    match tokio::time::timeout(wait, wait_for_peer(&mut events)).await {
        Ok(Some(peer)) => println!("Linked with {} ({})", peer.display_name(), short_id(&peer.id)),
        _ => println!("No hello on {} yet, sending anyway", label),
    }

    let to = resolve_peer(&node, to);
    let outcome = node.send_text(&to, text).await?;
    let encrypted = outcome.message.as_ref().is_some_and(|m| m.encrypted);

    println!("Sent message: {}", text);
    println!("  ID: {}", outcome.packet_id);
    println!("  To: {}", peer_label(&node, &to));
    println!("  Encrypted: {}", if encrypted { "yes" } else { "no" });
    if outcome.queued {
        println!("  Queued: no neighbor accepted it");
    }

    node.shutdown().await?;
    inbox.abort();
    Ok(())
}

async fn simulate(
    nodes: usize,
    topology: Topology,
    to: Option<usize>,
    text: &str,
    config: NodeConfig,
) -> Result<()> {
    if nodes < 2 {
        anyhow::bail!("A simulation needs at least 2 nodes");
    }
    if let Some(target) = to {
        if target == 0 || target >= nodes {
            anyhow::bail!("--to must be between 1 and {}", nodes - 1);
        }
    }

    println!(
        "Building {} nodes in a {} topology (ttl {})...",
        nodes, topology, config.default_ttl
    );
    let sim = MeshSimulation::build(nodes, topology, config).await?;
    let report = sim.flood(0, to, text).await?;

    let target = match to {
        Some(j) => format!("node {}", j),
        None => "everyone".to_string(),
    };
    println!();
    println!("Flood from node 0 to {}:", target);
    println!("  Packet: {}", short_id(&report.packet_id));
    println!("  Reached: {}", index_list(&report.reached));
    println!("  Missed: {}", index_list(&report.missed));
    println!("  Relays: {}", report.relays);
    println!("  Duplicates dropped: {}", report.duplicates);

    sim.shutdown().await;
    Ok(())
}
