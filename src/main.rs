// Entry point for a standalone cache-manager / data-dist coordination node.

use std::collections::HashMap;

use cache_datadist::{config::Role, Engine};
use tracing::{error, info};

#[tokio::main]
async fn main() -> cache_datadist::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let role = match std::env::var("ENGINE_ROLE").as_deref() {
        Ok("decoder") => Role::Decoder,
        Ok("mix") => Role::Mix,
        _ => Role::Prompt,
    };

    let mut options = HashMap::new();
    options.insert("enable_cache_manager".to_string(), "1".to_string());
    options.insert("enable_remote_cache_accessible".to_string(), "1".to_string());
    options.insert(
        "mem_pool_cfg".to_string(),
        "{\"memory_size\": 1073741824}".to_string(),
    );
    options.insert(
        "host_mem_pool_cfg".to_string(),
        "{\"memory_size\": 1073741824}".to_string(),
    );
    if let Ok(listen) = std::env::var("ENGINE_LISTEN_IP_INFO") {
        options.insert("listen_ip_info".to_string(), listen);
    }

    let engine = Engine::new();
    engine.init(role, options)?;
    info!(?role, "cache-manager engine initialized");

    print_enabled_modules();

    // Demo node runs until interrupted; a real deployment drives the engine
    // from the inference serving loop instead of blocking here.
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }

    info!("shutting down");
    engine.finalize()?;
    cache_datadist::shutdown_all();
    Ok(())
}

fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║   KV-cache transfer engine  (CacheManager + DataDist)        ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
}

fn print_enabled_modules() {
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│ ENABLED MODULES                                             │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│   [✓] types      - descriptors, cache keys, transfer configs│");
    println!("│   [✓] registry   - cache registration and allocation        │");
    println!("│   [✓] pool       - device/host memory pool adapter          │");
    println!("│   [✓] link       - peer link manager (rank-table + endpoint)│");
    println!("│   [✓] transfer   - sync pull/push/swap + async layer pull   │");
    println!("│   [✓] engine     - role lifecycle + public API façade       │");
    println!("└─────────────────────────────────────────────────────────────┘");
    println!();
}
