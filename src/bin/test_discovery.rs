use anyhow::{Context, Result};
use dotenv::dotenv;
use lan_peer_share::networking::interface::{default_broadcast_targets, get_local_ip, interface_broadcast_addresses};
use lan_peer_share::networking::{DiscoveryConfig, DiscoveryService, PeerIdentity, PeerRegistry, StatusNotifier};
use lan_peer_share::NodeConfig;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    println!("=== Peer Discovery Test Utility ===");
    println!("Run it on multiple machines to see them discover each other.");
    println!();

    let mut config = NodeConfig::from_env();
    if let Some(name) = std::env::args().nth(1) {
        config.display_name = name;
    }
    if let Some(port) = std::env::args().nth(2).and_then(|p| p.parse().ok()) {
        config.discovery_port = port;
    }

    println!("=== Broadcast Addresses ===");
    for (i, addr) in interface_broadcast_addresses().iter().enumerate() {
        println!("{}: {}", i + 1, addr);
    }

    let identity = PeerIdentity::generate();
    let advertised_ip = get_local_ip();
    println!("\n=== Local Peer ===");
    println!("ID: {}", identity);
    println!("Name: {}", config.display_name);
    println!("Address: {}:{}", advertised_ip, config.data_port);
    println!("Discovery port: {}", config.discovery_port);

    let targets = if config.broadcast_targets.is_empty() {
        default_broadcast_targets(config.discovery_port)
    } else {
        config.broadcast_targets.clone()
    };
    let registry = PeerRegistry::new();
    let service = DiscoveryService::new(
        DiscoveryConfig {
            bind_host: config.bind_host,
            discovery_port: config.discovery_port,
            data_port: config.data_port,
            display_name: config.display_name.clone(),
            interval: config.discovery_interval,
            response_timeout: config.discovery_response_timeout,
            peer_ttl: config.peer_ttl,
            targets,
            advertised_ip,
        },
        identity,
        registry.clone(),
        StatusNotifier::with_callback(config.status_capacity, |event| println!("{}", event)),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let discovery = tokio::spawn(service.run(shutdown_rx));

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("failed to install Ctrl+C handler")?;

    println!("\n=== Discovery Running ===");
    println!("Press Ctrl+C to exit");

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = sleep(Duration::from_secs(10)) => {
                let peers = registry.list();
                println!("\n=== Discovered Peers ({}) ===", peers.len());
                if peers.is_empty() {
                    println!("No peers discovered yet. Make sure other instances are running on the network.");
                }
                for (i, peer) in peers.iter().enumerate() {
                    println!("{}: {} ({}) at {}:{}", i + 1, peer.display_name, peer.peer_id, peer.ip, peer.port);
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    discovery.await?;
    Ok(())
}
