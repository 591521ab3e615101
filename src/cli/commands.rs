//! CLI commands for the SPV node
//!
//! Implements the command handlers for the `spv` binary.

use crate::core::{BlockHeader, Network, NetworkParams, ScriptType};
use crate::crypto::{Address, Payload};
use crate::encode::deserialize;
use crate::network::{Health, NodeConfig, SpvEvent, SpvNode};

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Parse an address and show what it watches
pub fn cmd_address(network: Network, address: &str) -> CliResult<()> {
    let params = NetworkParams::new(network);
    let address = Address::parse(address, &params)?;
    let script = address.script_pubkey();

    let kind = match address.payload() {
        Payload::PubkeyHash(_) => "P2PKH".to_string(),
        Payload::ScriptHash(_) => "P2SH".to_string(),
        Payload::WitnessProgram { version, .. } => format!("witness v{}", version),
    };

    println!("🏷️  Address {}", address);
    println!("   ├─ Network: {}", network);
    println!("   ├─ Type: {}", kind);
    println!("   ├─ Script: {}", hex::encode(&script));
    println!("   ├─ Script type: {}", ScriptType::classify(&script));
    println!(
        "   └─ Filter element: {}",
        hex::encode(address.filter_element())
    );

    Ok(())
}

/// Decode an 80-byte header and check its proof of work
pub fn cmd_header(network: Network, header_hex: &str) -> CliResult<()> {
    let params = NetworkParams::new(network);
    let bytes = hex::decode(header_hex.trim())?;
    let header: BlockHeader = deserialize(&bytes)?;

    println!("🧱 Block header {}", header.block_hash());
    println!("   ├─ Version: {:#x}", header.version);
    println!("   ├─ Previous: {}", header.prev_blockhash);
    println!("   ├─ Merkle root: {}", header.merkle_root);
    println!(
        "   ├─ Time: {}",
        header.timestamp().format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("   ├─ Bits: {:#010x}", header.bits);
    println!("   ├─ Nonce: {}", header.nonce);
    println!("   ├─ Work: {}", header.work());
    match header.validate_pow(params.pow_limit()) {
        Ok(()) => println!("   └─ Proof of work: ✅ valid on {}", network),
        Err(e) => println!("   └─ Proof of work: ❌ {}", e),
    }

    Ok(())
}

/// Run a node until Ctrl+C, printing matched transactions and blocks
pub async fn cmd_start(config: NodeConfig, peers: Vec<String>, watch: Vec<String>) -> CliResult<()> {
    println!("🌐 Starting SPV node on {}...", config.network);
    let mut node = SpvNode::new(config)?;

    node.on_transaction(|event| {
        let status = match event.height {
            Some(height) => format!("confirmed at height {}", height),
            None => "unconfirmed".to_string(),
        };
        println!(
            "💸 Transaction {} ({}, {} outputs, {} sat)",
            event.txid,
            status,
            event.tx.outputs.len(),
            event.tx.total_output()
        );
    })
    .await;
    node.on_block(|event| {
        if !event.matched.is_empty() {
            println!(
                "🧱 Block {} at height {} with {} matches",
                event.hash,
                event.height,
                event.matched.len()
            );
        }
    })
    .await;
    node.on_peer_connected(|info| {
        println!("🤝 Peer {} ready ({} {})", info.addr, info.user_agent, info.version);
    })
    .await;

    node.open().await?;
    print_peers(&node).await;

    for item in &watch {
        let item = node.watch_address(item).await?;
        println!("👀 Watching {}", item);
    }

    for peer in &peers {
        match node.connect_peer(peer).await {
            Ok(handle) => {
                let addr = handle.addr;
                match handle.wait().await {
                    Ok(_) => {}
                    Err(e) => println!("⚠️  Could not connect to {}: {}", addr, e),
                }
            }
            Err(e) => println!("⚠️  Could not connect to {}: {}", peer, e),
        }
    }
    print_peers(&node).await;

    node.start_sync().await?;

    let mut events = node.subscribe();
    let mut status = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n📴 Shutting down node...");
                break;
            }
            event = events.recv() => {
                if let Ok(SpvEvent::PeerDisconnected { addr, reason, .. }) = event {
                    println!(
                        "👋 Peer {} disconnected{}",
                        addr,
                        reason.map(|r| format!(": {}", r)).unwrap_or_default()
                    );
                }
            }
            _ = status.tick() => {
                let status = node.status().await;
                println!(
                    "⛓️  Height {} | {} peers ({} ready) | {} watched",
                    status.height, status.peers, status.ready_peers, status.watched
                );
                if status.health == Health::NoReachablePeers {
                    println!("⚠️  No reachable peers");
                }
            }
        }
    }

    node.close().await?;
    Ok(())
}

async fn print_peers(node: &SpvNode) {
    let peers = node.peers().await;
    println!("👥 Peers: {}", peers.len());
    for peer in peers {
        println!(
            "   └─ #{} {} {} ({})",
            peer.id,
            peer.addr,
            peer.state,
            if peer.outbound { "outbound" } else { "inbound" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::serialize;

    #[test]
    fn test_address_command() {
        assert!(cmd_address(Network::Main, "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").is_ok());
        assert!(cmd_address(Network::Main, "not-an-address").is_err());
    }

    #[test]
    fn test_header_command() {
        let genesis = NetworkParams::new(Network::Main).genesis_header();
        assert!(cmd_header(Network::Main, &hex::encode(serialize(&genesis))).is_ok());
        assert!(cmd_header(Network::Main, "00").is_err());
    }
}
