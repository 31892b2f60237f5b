use anyhow::{Context as _, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::acme;
use crate::route::{Matcher, Route, RouteId, RouteKind, TargetLookup};
use crate::starttls::Negotiation;
use crate::stream::PeekStream;
use crate::target::Target;

/// Routing state for one listening address.
///
/// The rule list is ordered by registration and never reordered; the
/// ACME-eligible target set is append-only and shared by the listener's
/// single ACME pseudo-route.
pub(crate) struct ListenerTable {
    routes: Vec<Route>,
    acme_targets: Vec<Arc<dyn Target>>,
    stop_acme: bool,
    negotiation: Option<Negotiation>,
    acme_timeout: Duration,
}

impl ListenerTable {
    fn new() -> Self {
        Self {
            routes: Vec::new(),
            acme_targets: Vec::new(),
            stop_acme: false,
            negotiation: None,
            acme_timeout: acme::DEFAULT_CHALLENGE_TIMEOUT,
        }
    }
}

/// A relay routing inbound TCP connections to backend targets by inspecting
/// the application-layer handshake, without terminating TLS.
///
/// Routes are registered during a single-threaded setup phase; [`Proxy::run`]
/// consumes the proxy, so the route tables are immutable once serving
/// starts and readers never race a writer.
#[derive(Default)]
pub struct Proxy {
    listeners: HashMap<String, ListenerTable>,
}

impl Proxy {
    pub fn new() -> Self {
        Self::default()
    }

    fn table_for(&mut self, addr: &str) -> &mut ListenerTable {
        self.listeners
            .entry(addr.to_owned())
            .or_insert_with(ListenerTable::new)
    }

    /// Appends a route on `addr` that sends connections whose TLS SNI
    /// server name equals `sni` to `target`. Non-matching connections fall
    /// through to any further routes on the same address.
    pub fn add_sni_route(
        &mut self,
        addr: &str,
        sni: impl Into<String>,
        target: Arc<dyn Target>,
    ) -> RouteId {
        self.add_sni_match_route(addr, Matcher::equals(sni), target)
    }

    /// Appends a route on `addr` that sends connections whose SNI server
    /// name is accepted by `matcher` to `target`.
    ///
    /// Unless disabled with [`Proxy::add_stop_acme_search`], the first SNI
    /// route on an address also registers the listener's ACME pseudo-route,
    /// and every SNI route appends its target to the shared set of
    /// challenge candidates that pseudo-route races.
    pub fn add_sni_match_route(
        &mut self,
        addr: &str,
        matcher: Matcher,
        target: Arc<dyn Target>,
    ) -> RouteId {
        let id = RouteId::new();
        let table = self.table_for(addr);

        if !table.stop_acme {
            if table.acme_targets.is_empty() {
                table.routes.push(Route {
                    id,
                    kind: RouteKind::Acme,
                });
            }
            table.acme_targets.push(Arc::clone(&target));
        }

        table.routes.push(Route {
            id,
            kind: RouteKind::Sni { matcher, target },
        });
        id
    }

    /// Appends a route on `addr` that resolves targets through `lookup` per
    /// connection. Dynamic routes take no part in ACME challenge searches;
    /// challenge response is expected to happen behind the resolver.
    pub fn add_sni_dynamic_route(&mut self, addr: &str, lookup: Arc<dyn TargetLookup>) -> RouteId {
        let id = RouteId::new();
        self.table_for(addr).routes.push(Route {
            id,
            kind: RouteKind::Dynamic { lookup },
        });
        id
    }

    /// Stops ACME probing for SNI routes registered on `addr` after this
    /// call. Challenges for routes added earlier are still proxied to the
    /// candidates collected so far.
    pub fn add_stop_acme_search(&mut self, addr: &str) {
        self.table_for(addr).stop_acme = true;
    }

    /// Bounds each ACME challenge probe on `addr`, handshake included.
    pub fn set_acme_timeout(&mut self, addr: &str, timeout: Duration) {
        self.table_for(addr).acme_timeout = timeout;
    }

    /// Negotiates SMTP STARTTLS (with `server_name` in the banner) on every
    /// connection accepted on `addr` before any sniffing happens.
    pub fn set_smtp_starttls(&mut self, addr: &str, server_name: impl Into<String>) {
        self.table_for(addr).negotiation = Some(Negotiation::Smtp {
            server_name: server_name.into(),
        });
    }

    /// Negotiates IMAP STARTTLS on every connection accepted on `addr`
    /// before any sniffing happens.
    pub fn set_imap_starttls(&mut self, addr: &str) {
        self.table_for(addr).negotiation = Some(Negotiation::Imap);
    }

    /// Binds every configured address and serves until the process exits.
    pub async fn run(self) -> Result<()> {
        let mut servers = Vec::new();
        for (addr, table) in self.listeners {
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind to address {addr}"))?;
            info!(listen_addr = %addr, "relay listening");
            servers.push(tokio::spawn(serve(listener, Arc::new(table))));
        }

        for server in servers {
            server.await?;
        }
        Ok(())
    }
}

pub(crate) async fn serve(listener: TcpListener, table: Arc<ListenerTable>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let table = Arc::clone(&table);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer_addr, &table).await {
                        debug!(client_addr = %peer_addr, error = %e, "connection closed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[tracing::instrument(skip_all, fields(client_addr = %peer_addr))]
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    table: &ListenerTable,
) -> Result<()> {
    let mut stream = PeekStream::new(stream);

    if let Some(negotiation) = &table.negotiation {
        negotiation
            .run(&mut stream)
            .await
            .context("STARTTLS negotiation failed")?;
    }

    let mut matched = None;
    for route in &table.routes {
        if let Some((target, hostname)) = route
            .try_match(&mut stream, &table.acme_targets, table.acme_timeout)
            .await
        {
            debug!(route_id = %route.id, hostname = %hostname, "route matched");
            matched = Some(target);
            break;
        }
    }

    match matched {
        Some(target) => target.handle_conn(Box::new(stream)).await,
        // Fell through every rule: drop the connection.
        None => debug!("no route matched"),
    }
    Ok(())
}
