use rustls::pki_types::{CertificateDer, ServerName};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;
use webpki::EndEntityCert;

use crate::target::Target;
use crate::tls;

/// Default bound on a single challenge probe, handshake included.
pub const DEFAULT_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Hostname suffix that marks a connection as a domain-validation probe.
pub(crate) const CHALLENGE_SUFFIX: &str = ".acme.invalid";

const PIPE_BUFFER_SIZE: usize = 16 * 1024;

/// Races TLS handshakes against every candidate backend and returns the
/// first one that proves it holds a certificate for the challenge hostname.
///
/// Each candidate is probed concurrently over an in-memory pipe: one end is
/// handed to the backend's connection handler as an independent task, the
/// other performs a TLS client handshake with `server_name` as SNI. The
/// race returns on the first proof of possession in order of arrival, which
/// is not registration order; losing attempts keep running to completion on
/// their own and close their own pipe ends. An empty candidate set, or one
/// where every attempt fails, resolves to `None`.
pub async fn resolve_challenge(
    server_name: &str,
    candidates: &[Arc<dyn Target>],
    challenge_timeout: Duration,
) -> Option<Arc<dyn Target>> {
    if candidates.is_empty() {
        return None;
    }

    let (tx, mut rx) = mpsc::channel(candidates.len());
    for target in candidates {
        let tx = tx.clone();
        let target = Arc::clone(target);
        let challenge_host = server_name.to_owned();
        tokio::spawn(async move {
            let proved = try_challenge(&target, &challenge_host, challenge_timeout).await;
            let _ = tx.send(proved.then_some(target)).await;
        });
    }
    drop(tx);

    for _ in 0..candidates.len() {
        match rx.recv().await {
            Some(Some(target)) => return Some(target),
            Some(None) => {}
            None => break,
        }
    }

    // No candidate was happy with the provided challenge.
    None
}

/// One probe: handshake with the candidate over a pipe and check that the
/// certificate it leads with covers the challenge hostname.
async fn try_challenge(
    target: &Arc<dyn Target>,
    challenge_host: &str,
    challenge_timeout: Duration,
) -> bool {
    let (near, far) = tokio::io::duplex(PIPE_BUFFER_SIZE);
    let backend = Arc::clone(target);
    tokio::spawn(async move { backend.handle_conn(Box::new(far)).await });

    let Ok(sni) = ServerName::try_from(challenge_host.to_owned()) else {
        return false;
    };

    let connector = TlsConnector::from(Arc::new(tls::probe_client_config()));
    let session = match timeout(challenge_timeout, connector.connect(sni, near)).await {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            debug!(challenge_host, error = %e, "challenge handshake failed");
            return false;
        }
        Err(_) => {
            debug!(challenge_host, "challenge handshake timed out");
            return false;
        }
    };

    let (_, connection) = session.get_ref();
    let Some(certs) = connection.peer_certificates() else {
        return false;
    };
    let Some(leaf) = certs.first() else {
        return false;
    };
    leaf_matches_host(leaf, challenge_host)
}

/// The first certificate offered must itself cover the challenge hostname;
/// the rest of the chain carries no weight here.
fn leaf_matches_host(cert: &CertificateDer<'_>, host: &str) -> bool {
    let Ok(end_entity) = EndEntityCert::try_from(cert) else {
        return false;
    };
    let Ok(name) = ServerName::try_from(host) else {
        return false;
    };
    end_entity.verify_is_valid_for_subject_name(&name).is_ok()
}
