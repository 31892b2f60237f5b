use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use sni_relay::{Protocol, Proxy, RouteFile, load_config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_owned());
    let config = load_config(&config_path)?;

    let mut proxy = Proxy::new();
    for listener in &config.listeners {
        let routes = Arc::new(
            RouteFile::load(&listener.routes)
                .with_context(|| format!("listener {}", listener.addr))?,
        );

        match listener.protocol {
            Protocol::Tls => {}
            Protocol::Smtp => {
                let server_name = listener
                    .server_name
                    .clone()
                    .context("smtp listener requires server_name")?;
                proxy.set_smtp_starttls(&listener.addr, server_name);
            }
            Protocol::Imap => proxy.set_imap_starttls(&listener.addr),
        }

        if let Some(timeout) = listener.acme_timeout() {
            proxy.set_acme_timeout(&listener.addr, timeout);
        }

        info!(
            listen_addr = %listener.addr,
            protocol = ?listener.protocol,
            route_count = routes.len(),
            routes_file = %listener.routes,
            "Listener configured"
        );
        proxy.add_sni_dynamic_route(&listener.addr, routes);
    }

    proxy.run().await
}
