//! Control API server with an in-process broker
//!
//! Run with: cargo run --example control_server [CONFIG.toml]
//!
//! Without a config file the server binds to 0.0.0.0:9095 and keeps the
//! registry in memory. Talk to it with one JSON object per line:
//!
//! ```text
//! $ nc localhost 9095
//! {"method":"RegisterService","params":{"service_name":"node","instance_id":"i1","callback_uri":"http://127.0.0.1:8080/events","routing_keys":["event.cloud.node.*"]}}
//! {"method":"StartHandling","params":{"service_uuid":"<uuid from above>"}}
//! {"method":"ListRoutes"}
//! ```
//!
//! Matching messages are POSTed to the callback URI; liveness pings go to
//! `<callback_uri>/ping`.

use std::sync::Arc;

use msg_client::{
    ControlServer, HttpCallbackClient, InMemoryBroker, MessageClientConfig, MessageRouter,
};

fn print_usage() {
    eprintln!("Usage: control_server [CONFIG]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  CONFIG    TOML configuration file (default: built-in defaults)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("msg_client=debug".parse()?)
                .add_directive("control_server=debug".parse()?),
        )
        .init();

    let config = match args.get(1) {
        Some(path) => MessageClientConfig::load(path)?,
        None => MessageClientConfig::default(),
    };

    let store = config.store.open()?;
    let router = Arc::new(MessageRouter::new(
        config.router.clone(),
        store,
        Arc::new(InMemoryBroker::new()),
        Arc::new(HttpCallbackClient::new()?),
    ));

    println!("Starting control server on {}", config.server.bind_addr);
    println!("Exchange: {}", config.router.exchange);
    println!();

    let server = ControlServer::new(config.server, router);

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\nShutting down...");
        })
        .await?;

    Ok(())
}
