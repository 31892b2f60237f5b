use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::debug;
use uuid::Uuid;

use crate::acme;
use crate::sniff;
use crate::stream::PeekStream;
use crate::target::Target;

/// Opaque identifier assigned to every registered route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(Uuid);

impl RouteId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a rule decides whether the sniffed hostname is its business.
#[derive(Clone)]
pub enum Matcher {
    /// Matches iff the sniffed hostname equals this string.
    Equals(String),
    /// Caller-supplied predicate over the sniffed hostname; covers regex
    /// matching and arbitrary logic.
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl Matcher {
    pub fn equals(hostname: impl Into<String>) -> Self {
        Self::Equals(hostname.into())
    }

    pub fn predicate(matches: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(matches))
    }

    fn matches(&self, hostname: &str) -> bool {
        match self {
            Self::Equals(expected) => expected == hostname,
            Self::Predicate(matches) => matches(hostname),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals(hostname) => f.debug_tuple("Equals").field(hostname).finish(),
            Self::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

/// Caller-supplied hostname resolver backing dynamic routes.
///
/// `Ok(None)` declines the hostname; an error also counts as a non-match
/// and never aborts routing.
#[async_trait]
pub trait TargetLookup: Send + Sync {
    async fn lookup(&self, server_name: &str) -> Result<Option<Arc<dyn Target>>>;
}

pub(crate) enum RouteKind {
    /// Static matcher with a fixed destination.
    Sni {
        matcher: Matcher,
        target: Arc<dyn Target>,
    },
    /// External hostname-to-target resolution per connection.
    Dynamic { lookup: Arc<dyn TargetLookup> },
    /// Challenge race over the listener's ACME-eligible targets.
    Acme,
}

/// One matcher+target pairing in a listener's ordered rule list.
pub(crate) struct Route {
    pub(crate) id: RouteId,
    pub(crate) kind: RouteKind,
}

impl Route {
    /// Attempts to match the connection, re-sniffing the same buffered
    /// bytes this rule's predecessors saw. Returns the chosen target and
    /// the hostname it matched on.
    pub(crate) async fn try_match<S>(
        &self,
        stream: &mut PeekStream<S>,
        acme_targets: &[Arc<dyn Target>],
        acme_timeout: Duration,
    ) -> Option<(Arc<dyn Target>, String)>
    where
        S: AsyncRead + Unpin,
    {
        let server_name = sniff::server_name(stream).await;

        match &self.kind {
            RouteKind::Sni { matcher, target } => matcher
                .matches(&server_name)
                .then(|| (Arc::clone(target), server_name)),
            RouteKind::Dynamic { lookup } => match lookup.lookup(&server_name).await {
                Ok(Some(target)) => Some((target, server_name)),
                Ok(None) => None,
                Err(err) => {
                    debug!(hostname = %server_name, error = %err, "dynamic lookup declined");
                    None
                }
            },
            RouteKind::Acme => {
                if !server_name.ends_with(acme::CHALLENGE_SUFFIX) {
                    return None;
                }
                acme::resolve_challenge(&server_name, acme_targets, acme_timeout)
                    .await
                    .map(|target| (target, server_name))
            }
        }
    }
}
