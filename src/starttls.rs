use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::stream::PeekStream;

const IMAP_GREETING: &str =
    "* OK [CAPABILITY IMAP4rev1 STARTTLS LOGINDISABLED] IMAP4rev1 Service Ready";

/// Pre-sniff negotiation run once on a freshly accepted connection.
///
/// Each variant is a single-pass, line-oriented exchange that talks the
/// plaintext preamble of its mail protocol just far enough to get the peer
/// to issue `STARTTLS`. On success the next bytes on the wire are the
/// client's TLS handshake and sniffing proceeds on the same connection; on
/// error the connection cannot continue in the expected mode and the caller
/// must close it. Nothing is retried.
#[derive(Debug, Clone)]
pub enum Negotiation {
    /// SMTP with the given banner name (`220 <name> Service ready`).
    Smtp { server_name: String },
    /// IMAP4rev1; `LOGINDISABLED` is advertised so compliant clients never
    /// attempt plaintext authentication.
    Imap,
}

impl Negotiation {
    pub async fn run<S>(&self, stream: &mut PeekStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            Self::Smtp { server_name } => negotiate_smtp(stream, server_name).await,
            Self::Imap => negotiate_imap(stream).await,
        }
    }
}

async fn negotiate_smtp<S>(stream: &mut PeekStream<S>, server_name: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_line(&format!("220 {server_name} Service ready"))
        .await?;

    let greeting = stream.read_line().await?;
    let client_name = parse_ehlo(&greeting)?;
    debug!(client = %client_name, "SMTP client greeted");

    stream
        .write_line(&format!("250-{server_name} G'day!"))
        .await?;
    stream.write_line("250 STARTTLS").await?;

    let command = stream.read_line().await?;
    if command != "STARTTLS" {
        bail!("expecting STARTTLS, got {command:?}");
    }
    stream.write_line("220 Go ahead").await?;
    Ok(())
}

/// Exactly one token is accepted after `EHLO`; guessing a client name out
/// of anything else would mask a broken peer.
fn parse_ehlo(line: &str) -> Result<&str> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("EHLO"), Some(client_name), None) => Ok(client_name),
        _ => bail!("could not read client name from {line:?}"),
    }
}

async fn negotiate_imap<S>(stream: &mut PeekStream<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_line(IMAP_GREETING).await?;

    let line = stream.read_line().await?;
    let Some((tag, rest)) = line.split_once(' ') else {
        bail!("malformed tagged command {line:?}");
    };
    let command = rest.split(' ').next().unwrap_or(rest);

    if command == "STARTTLS" {
        stream
            .write_line(&format!("{tag} OK Begin TLS negotiation now"))
            .await?;
        return Ok(());
    }

    stream
        .write_line(&format!("{tag} {command} Unsupported command"))
        .await?;
    bail!("unsupported command {command} received");
}
