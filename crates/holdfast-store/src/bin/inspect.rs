//! # Store Inspector
//!
//! Prints what is sitting in a Holdfast store: pending writes per owner and
//! cache entries per owner, plus overall byte usage.
//!
//! ## Usage
//! ```bash
//! # Summarize every owner
//! cargo run -p holdfast-store --bin holdfast-inspect -- --db ./holdfast.db
//!
//! # One owner, listing each pending operation
//! cargo run -p holdfast-store --bin holdfast-inspect -- --db ./holdfast.db --owner user-1
//! ```

use std::collections::BTreeMap;
use std::env;

use holdfast_store::{Namespace, Store, StoreConfig};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,holdfast=debug,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().collect();

    let mut db_path = String::from("./holdfast.db");
    let mut owner_filter: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--owner" | "-o" => {
                if i + 1 < args.len() {
                    owner_filter = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Holdfast Store Inspector");
                println!();
                println!("Usage: holdfast-inspect [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --db <PATH>      Database file path (default: ./holdfast.db)");
                println!("  -o, --owner <ID>     Only show this owner, with operation detail");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    let store = Store::new(StoreConfig::new(&db_path)).await?;
    let entries = store.entries();

    println!("Holdfast store: {}", db_path);
    println!("================================");

    // Pending writes
    let queue_prefix = match owner_filter {
        Some(ref owner) => Namespace::Queue.owner_prefix(owner),
        None => Namespace::Queue.root_prefix(),
    };

    println!();
    println!("Pending writes");
    for row in entries.scan_prefix(&queue_prefix).await? {
        let Some((owner, _)) = Namespace::Queue.split(&row.key) else {
            continue;
        };
        if owner_filter.as_deref().is_some_and(|o| o != owner) {
            continue;
        }

        let ops: Vec<serde_json::Value> = match serde_json::from_str(&row.value) {
            Ok(ops) => ops,
            Err(e) => {
                warn!(owner = %owner, ?e, "Unreadable queue record");
                continue;
            }
        };

        println!("  {:<40} {:>5} ops  (updated {})", owner, ops.len(), row.updated_at);

        if owner_filter.is_some() {
            for op in &ops {
                println!(
                    "    {} {:<7} {}/{}  retries={}  at {}",
                    op["id"].as_str().unwrap_or("?"),
                    op["action"].as_str().unwrap_or("?"),
                    op["entity_kind"].as_str().unwrap_or("?"),
                    op["record_id"].as_str().unwrap_or("?"),
                    op["retry_count"].as_u64().unwrap_or(0),
                    op["timestamp"].as_str().unwrap_or("?"),
                );
            }
        }
    }

    // Cache entries
    let cache_prefix = match owner_filter {
        Some(ref owner) => Namespace::Cache.scan_prefix(owner),
        None => Namespace::Cache.root_prefix(),
    };

    let mut per_owner: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    for row in entries.scan_prefix(&cache_prefix).await? {
        if let Some((owner, _)) = Namespace::Cache.split(&row.key) {
            let slot = per_owner.entry(owner.to_string()).or_default();
            slot.0 += 1;
            slot.1 += row.size_bytes.max(0) as u64;
        }
    }

    println!();
    println!("Cache entries");
    for (owner, (count, bytes)) in &per_owner {
        println!("  {:<40} {:>5} entries  {:>10} bytes", owner, count, bytes);
    }

    // Usage
    let usage = store.usage().await?;
    println!();
    println!("Usage: {} bytes in {} rows", usage.used_bytes, usage.entries);

    store.close().await;
    Ok(())
}
