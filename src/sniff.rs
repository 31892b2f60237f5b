use anyhow::{Context as _, Result, bail};
use rustls::server::Acceptor;
use std::io::Cursor;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::stream::PeekStream;

const RECORD_HEADER_LEN: usize = 5;
const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

/// Parameters extracted from a peeked TLS ClientHello.
#[derive(Debug, Clone, Default)]
pub struct ClientHelloInfo {
    /// SNI server name; empty when the extension is absent.
    pub server_name: String,
}

/// Reads the ClientHello carried in the first TLS record of `stream`
/// without consuming any bytes.
///
/// The record header is peeked first: byte 0 must announce a handshake
/// record and bytes 3-4 carry the record length (the version bytes are
/// ignored). The full record is then peeked and handed to a rustls
/// [`Acceptor`] reading from the byte window — a server that parses the
/// hello but never responds. A hello that spans multiple records is
/// rejected, matching the single-record window this sniffer peeks.
pub async fn read_client_hello<S>(stream: &mut PeekStream<S>) -> Result<ClientHelloInfo>
where
    S: AsyncRead + Unpin,
{
    let header = stream.peek(RECORD_HEADER_LEN).await?;
    if header[0] != RECORD_TYPE_HANDSHAKE {
        bail!("not a TLS handshake record");
    }
    let record_len = usize::from(u16::from_be_bytes([header[3], header[4]]));
    let window = stream
        .peek(RECORD_HEADER_LEN + record_len)
        .await
        .context("TLS record shorter than its declared length")?;

    parse_client_hello(window)
}

fn parse_client_hello(window: &[u8]) -> Result<ClientHelloInfo> {
    let mut acceptor = Acceptor::default();
    acceptor
        .read_tls(&mut Cursor::new(window))
        .context("buffering ClientHello bytes")?;

    match acceptor.accept() {
        Ok(Some(accepted)) => Ok(ClientHelloInfo {
            server_name: accepted
                .client_hello()
                .server_name()
                .unwrap_or_default()
                .to_owned(),
        }),
        Ok(None) => bail!("ClientHello does not fit in the first TLS record"),
        Err((err, _alert)) => bail!("rejected ClientHello: {err}"),
    }
}

/// The SNI server name at the head of `stream`, or the empty string when no
/// parseable ClientHello is there. Never consumes bytes, so calling this
/// repeatedly on one connection yields the same answer each time.
pub async fn server_name<S>(stream: &mut PeekStream<S>) -> String
where
    S: AsyncRead + Unpin,
{
    match read_client_hello(stream).await {
        Ok(info) => info.server_name,
        Err(err) => {
            debug!(error = %err, "no SNI extracted");
            String::new()
        }
    }
}

#[cfg(test)]
pub(crate) mod test_hello {
    use rustls::pki_types::ServerName;
    use std::sync::Arc;

    /// Serializes the ClientHello a real rustls client would send for `name`.
    pub(crate) fn client_hello_bytes(name: ServerName<'static>) -> Vec<u8> {
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let mut conn = rustls::ClientConnection::new(Arc::new(config), name).unwrap();

        let mut bytes = Vec::new();
        conn.write_tls(&mut bytes).unwrap();
        bytes
    }

    pub(crate) fn hello_for(host: &str) -> Vec<u8> {
        client_hello_bytes(ServerName::try_from(host.to_owned()).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::test_hello::{client_hello_bytes, hello_for};
    use super::*;
    use rustls::pki_types::ServerName;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn extracts_sni_hostname() {
        let bytes = hello_for("example.com");
        let mut stream = PeekStream::new(&bytes[..]);

        assert_eq!(server_name(&mut stream).await, "example.com");
    }

    #[tokio::test]
    async fn leaves_stream_unread() {
        let bytes = hello_for("example.com");
        let mut stream = PeekStream::new(&bytes[..]);
        server_name(&mut stream).await;

        let mut remaining = Vec::new();
        stream.read_to_end(&mut remaining).await.unwrap();
        assert_eq!(remaining, bytes);
    }

    #[tokio::test]
    async fn sniffing_twice_yields_identical_results() {
        let bytes = hello_for("example.com");
        let mut stream = PeekStream::new(&bytes[..]);

        assert_eq!(server_name(&mut stream).await, "example.com");
        assert_eq!(server_name(&mut stream).await, "example.com");
    }

    #[tokio::test]
    async fn hello_without_sni_reports_empty_name() {
        // rustls omits the SNI extension for IP-address server names.
        let bytes = client_hello_bytes(ServerName::try_from("192.0.2.7").unwrap());
        let mut stream = PeekStream::new(&bytes[..]);

        assert_eq!(server_name(&mut stream).await, "");
    }

    #[tokio::test]
    async fn non_tls_bytes_report_empty_name() {
        let bytes = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut stream = PeekStream::new(&bytes[..]);

        assert_eq!(server_name(&mut stream).await, "");
    }

    #[tokio::test]
    async fn short_input_reports_empty_name() {
        let mut stream = PeekStream::new(&[0x16, 0x03][..]);
        assert_eq!(server_name(&mut stream).await, "");
    }

    #[tokio::test]
    async fn truncated_record_reports_empty_name() {
        let mut bytes = hello_for("example.com");
        bytes.truncate(bytes.len() - 10);
        let mut stream = PeekStream::new(&bytes[..]);

        assert_eq!(server_name(&mut stream).await, "");
    }
}
