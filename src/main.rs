use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use lan_peer_share::networking::{StatusLevel, StatusNotifier, TransferStatus};
use lan_peer_share::{NodeConfig, PeerNode};
use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

fn print_separator() {
    println!("\n{}\n", "-".repeat(60));
}

fn print_help() {
    println!("Commands:");
    println!("  help                              Show this list");
    println!("  peers [json]                      List known peers");
    println!("  connect <ip> <port> [name]        Handshake with a peer");
    println!("  send <peer_id|ip:port> <file>     Send a file");
    println!("  status                            Show this node");
    println!("  quit                              Stop and exit");
}

enum Command {
    Help,
    Peers { json: bool },
    Connect { ip: IpAddr, port: u16, name: Option<String> },
    Send { target: String, path: PathBuf },
    Status,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };
    let command = match verb {
        "help" | "?" => Command::Help,
        "peers" => Command::Peers {
            json: parts.next() == Some("json"),
        },
        "status" => Command::Status,
        "quit" | "exit" => Command::Quit,
        "connect" => {
            let ip = parts
                .next()
                .ok_or_else(|| anyhow!("usage: connect <ip> <port> [name]"))?
                .parse::<IpAddr>()?;
            let port = parts
                .next()
                .ok_or_else(|| anyhow!("usage: connect <ip> <port> [name]"))?
                .parse::<u16>()?;
            let rest: Vec<&str> = parts.collect();
            let name = (!rest.is_empty()).then(|| rest.join(" "));
            Command::Connect { ip, port, name }
        }
        "send" => {
            let target = parts
                .next()
                .ok_or_else(|| anyhow!("usage: send <peer_id|ip:port> <file>"))?
                .to_string();
            let rest: Vec<&str> = parts.collect();
            if rest.is_empty() {
                return Err(anyhow!("usage: send <peer_id|ip:port> <file>"));
            }
            Command::Send {
                target,
                path: PathBuf::from(rest.join(" ")),
            }
        }
        other => return Err(anyhow!("unknown command {:?}, try 'help'", other)),
    };
    Ok(Some(command))
}

async fn execute(node: &PeerNode, command: Command) -> Result<()> {
    match command {
        Command::Help | Command::Quit => print_help(),
        Command::Peers { json: true } => {
            println!("{}", serde_json::to_string_pretty(&node.get_peers())?);
        }
        Command::Peers { json: false } => {
            let peers = node.get_peers();
            println!("\n=== Known Peers ({}) ===", peers.len());
            if peers.is_empty() {
                println!("No peers yet. Make sure other instances are running on the network.");
            }
            for (i, peer) in peers.iter().enumerate() {
                println!(
                    "{}: {} ({}) at {}:{} - last seen {}",
                    i + 1,
                    peer.display_name,
                    peer.peer_id,
                    peer.ip,
                    peer.port,
                    peer.last_seen.format("%H:%M:%S")
                );
            }
        }
        Command::Status => {
            let config = node.config();
            println!("\n=== Local Node ===");
            println!("ID: {}", node.identity());
            println!("Name: {}", config.display_name);
            match node.local_addr() {
                Some(addr) => println!("Data address: {}", addr),
                None => println!("Data address: not listening"),
            }
            println!("Discovery port: {}", config.discovery_port);
            println!("Downloads: {}", config.download_dir.display());
            println!("Known peers: {}", node.registry().len());
        }
        Command::Connect { ip, port, name } => {
            let name = name.unwrap_or_else(|| format!("{}:{}", ip, port));
            let record = node.connect_to_peer(ip, port, &name).await?;
            println!("✓ Connected to {} ({})", record.display_name, record.peer_id);
        }
        Command::Send { target, path } => {
            let transfer = match target.parse::<SocketAddr>() {
                Ok(addr) => node.send_file(&path, addr.ip(), addr.port()).await?,
                Err(_) => node.send_file_to_peer(&target, &path).await?,
            };
            println!(
                "✓ Sent {} ({} bytes)",
                transfer.request.file_name, transfer.bytes_transferred
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = NodeConfig::from_env();
    info!(
        "Starting {} on data port {} (discovery port {})",
        config.display_name, config.data_port, config.discovery_port
    );

    let notifier = StatusNotifier::with_callback(config.status_capacity, |event| match event.level {
        StatusLevel::Info => println!("{}", event),
        StatusLevel::Warning | StatusLevel::Error => eprintln!("{}", event),
    });
    let progress = Arc::new(|status: TransferStatus| match status {
        TransferStatus::Progress {
            transfer_id,
            percent_complete,
            ..
        } => debug!("Transfer {}: {:.1}%", transfer_id, percent_complete),
        TransferStatus::Completed {
            transfer_id,
            throughput_mbps,
            ..
        } => info!("Transfer {} finished at {:.2} MB/s", transfer_id, throughput_mbps),
        _ => {}
    });

    let mut node = PeerNode::new(config, notifier).with_progress_callback(progress);
    node.start().await.context("failed to start peer node")?;

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("failed to install Ctrl+C handler")?;

    print_separator();
    println!("Peer {} ready. Type 'help' for commands.", node.identity());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                println!("\nInterrupted");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Error reading input: {}", e);
                        break;
                    }
                };
                match parse_command(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        // Failures are already reported through the status channel
                        if let Err(e) = execute(&node, command).await {
                            debug!("Command failed: {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("❌ {}", e),
                }
            }
        }
    }

    node.stop().await;
    println!("Goodbye");
    Ok(())
}
