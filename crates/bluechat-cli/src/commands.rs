//! Command handlers for the BlueChat CLI

use std::sync::Arc;

use bluechat_ble::BleTransport;
use bluechat_core::{
    ChatClient, ChatConfig, DiscoveryManager, MemoryRadio, Message, PeerId, RadioSession,
    ServerController, Transport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Addresses used by the in-process demo
pub const DEMO_SERVER_ADDRESS: &str = "CC:DD";
pub const DEMO_CLIENT_ADDRESS: &str = "11:22";

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Scan { seconds } => Self::handle_scan_command(&config, seconds).await,
            Commands::Devices => Self::handle_devices_command(&config).await,
            Commands::Serve => Self::handle_serve_command(&config).await,
            Commands::Connect { peer } => Self::handle_connect_command(&config, &peer).await,
            Commands::Demo => {
                for line in run_demo(config.chat.clone()).await? {
                    println!("{}", line);
                }
                Ok(())
            }
        }
    }

    fn radio(config: &AppConfig) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(BleTransport::with_config(config.ble.clone())?))
    }

    /// Handle the scan command
    async fn handle_scan_command(config: &AppConfig, seconds: Option<u64>) -> Result<()> {
        let radio = RadioSession::new(Self::radio(config)?);
        let mut discovery = DiscoveryManager::new(radio, config.chat.clone());
        let duration = config.cli.scan_duration(seconds);

        info!("Scanning for {:?}... Press Ctrl+C to stop", duration);
        discovery.start_scan().await;
        if !discovery.is_scanning().await {
            return Err(CliError::Config(
                "scanning could not be started; is Bluetooth enabled?".to_string(),
            ));
        }

        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                event = discovery.next_event() => {
                    let Some(event) = event else { break };
                    let before = discovery.discovered().len();
                    discovery.handle_event(event);
                    if discovery.discovered().len() > before {
                        if let Some(peer) = discovery.discovered().last() {
                            println!("  {}  {}", peer.id, discovery.display_name(peer));
                        }
                    }
                }
                _ = &mut deadline => break,
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        discovery.stop_scan().await;

        println!("{} chat server(s) found", discovery.discovered().len());
        Ok(())
    }

    /// Handle the devices command
    async fn handle_devices_command(config: &AppConfig) -> Result<()> {
        let radio = RadioSession::new(Self::radio(config)?);
        let discovery = DiscoveryManager::new(radio, config.chat.clone());
        discovery.refresh_known_peers().await;

        println!("Paired devices:");
        for peer in discovery.paired() {
            println!("  {}  {}", peer.id, discovery.display_name(&peer));
        }
        println!("Connected devices:");
        for peer in discovery.connected() {
            println!("  {}  {}", peer.id, discovery.display_name(&peer));
        }
        Ok(())
    }

    /// Handle the serve command
    async fn handle_serve_command(config: &AppConfig) -> Result<()> {
        let radio = RadioSession::new(Self::radio(config)?);
        let mut server = ServerController::new(radio, config.chat.clone());
        server.start_server().await?;
        println!("Serving chat; type a line to broadcast it, Ctrl+C to stop");

        let mut messages = server.subscribe_messages();
        let mut remotes = server.watch_remotes();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                event = server.next_event() => {
                    let Some(event) = event else { break };
                    server.handle_event(event).await;
                }
                message = messages.recv() => {
                    if let Some(line) = incoming_line(message) {
                        println!("{}", line);
                    }
                }
                changed = remotes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    println!("{} remote(s) connected", remotes.borrow_and_update().len());
                }
                line = lines.next_line() => {
                    let Some(text) = line? else { break };
                    if text.is_empty() {
                        continue;
                    }
                    match server.broadcast(&text).await {
                        Ok(delivered) => info!("Delivered to {} remote(s)", delivered),
                        Err(e) => warn!("Broadcast failed: {}", e),
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        server.stop_server().await;
        Ok(())
    }

    /// Handle the connect command
    async fn handle_connect_command(config: &AppConfig, peer: &str) -> Result<()> {
        let peer = parse_peer(peer)?;
        let mut client = ChatClient::new(Self::radio(config)?, config.chat.clone());

        client.connect(&peer).await?;
        client.wait_until_ready().await?;
        println!(
            "Connected to {}; type a line to send it, Ctrl+C to leave",
            client.status().label()
        );

        let mut messages = client.subscribe_messages();
        let mut status = client.watch_status();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                event = client.next_event() => {
                    let Some(event) = event else { break };
                    client.handle_event(event).await;
                }
                message = messages.recv() => {
                    if let Some(line) = incoming_line(message) {
                        println!("{}", line);
                    }
                }
                changed = status.changed() => {
                    if changed.is_err() || !status.borrow_and_update().connected {
                        println!("Connection closed");
                        break;
                    }
                }
                line = lines.next_line() => {
                    let Some(text) = line? else { break };
                    if text.is_empty() {
                        continue;
                    }
                    if let Err(e) = client.send(&text).await {
                        warn!("Send failed: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        client.close().await;
        Ok(())
    }
}

/// Validate a peer address typed by the user
pub fn parse_peer(input: &str) -> Result<PeerId> {
    let trimmed = input.trim();
    let valid = !trimmed.is_empty()
        && trimmed
            .split(':')
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(CliError::InvalidPeer(input.to_string()));
    }
    Ok(PeerId::new(trimmed.to_ascii_uppercase()))
}

/// One transcript line per message
pub fn format_message(message: &Message) -> String {
    let marker = if message.is_outgoing() { ">>" } else { "<<" };
    format!("[{}] {} {}", message.display_time(), marker, message.content())
}

fn incoming_line(received: std::result::Result<Message, broadcast::error::RecvError>) -> Option<String> {
    match received {
        Ok(message) if !message.is_outgoing() => Some(format_message(&message)),
        Ok(_) => None,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!("Skipped {} messages", skipped);
            None
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

// ----------------------------------------------------------------------------
// In-process Demo
// ----------------------------------------------------------------------------

/// Run one exchange between a client and a server sharing an in-memory radio
///
/// Returns both transcripts, server first.
pub async fn run_demo(config: ChatConfig) -> Result<Vec<String>> {
    let radio = MemoryRadio::new();
    radio.named_device(DEMO_SERVER_ADDRESS, "Demo Server");

    let server_radio = RadioSession::new(Arc::new(radio.device(DEMO_SERVER_ADDRESS)));
    let mut server = ServerController::new(server_radio, config.clone());
    server.start_server().await?;

    let mut client = ChatClient::new(Arc::new(radio.device(DEMO_CLIENT_ADDRESS)), config);
    client.connect(&PeerId::new(DEMO_SERVER_ADDRESS)).await?;
    client.wait_until_ready().await?;
    server.process_pending().await;

    client.send("hello").await?;
    server.process_pending().await;
    server.broadcast("hello yourself").await?;
    client.process_pending().await;

    let mut transcript = vec![format!("server {}:", DEMO_SERVER_ADDRESS)];
    transcript.extend(server.messages().iter().map(|m| format!("  {}", format_message(m))));
    transcript.push(format!("client {} ({}):", DEMO_CLIENT_ADDRESS, client.status().label()));
    transcript.extend(client.messages().iter().map(|m| format!("  {}", format_message(m))));

    client.close().await;
    server.stop_server().await;
    Ok(transcript)
}
