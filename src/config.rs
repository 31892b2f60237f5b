use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::route::TargetLookup;
use crate::target::{Target, to};

#[derive(Deserialize)]
pub struct Config {
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Deserialize)]
pub struct ListenerConfig {
    /// Address to listen on, e.g. `0.0.0.0:443`.
    pub addr: String,
    #[serde(default)]
    pub protocol: Protocol,
    /// Banner name for SMTP STARTTLS; required when `protocol = "smtp"`.
    pub server_name: Option<String>,
    /// Path to the line-oriented route file for this listener.
    pub routes: String,
    pub acme_timeout_ms: Option<u64>,
}

impl ListenerConfig {
    pub fn acme_timeout(&self) -> Option<Duration> {
        self.acme_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Sniff the TLS ClientHello directly.
    #[default]
    Tls,
    /// Negotiate SMTP STARTTLS before sniffing.
    Smtp,
    /// Negotiate IMAP STARTTLS before sniffing.
    Imap,
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config file {path}"))?;
    parse_config(&content).with_context(|| format!("Failed to load {path}"))
}

fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("not valid TOML")?;
    for listener in &config.listeners {
        if listener.protocol == Protocol::Smtp && listener.server_name.is_none() {
            bail!(
                "listener {}: smtp protocol requires server_name",
                listener.addr
            );
        }
    }
    Ok(config)
}

/// Hostname routes loaded from a line-oriented file.
///
/// Each non-blank, non-comment line holds exactly two whitespace-separated
/// fields: a hostname regex and a backend address. Anything else fails at
/// load time; nothing is discovered lazily mid-connection. Lookup walks the
/// patterns in file order and the first match wins, so later lines never
/// override earlier ones.
pub struct RouteFile {
    routes: Vec<RoutePattern>,
}

struct RoutePattern {
    pattern: Regex,
    backend: String,
}

impl RouteFile {
    pub fn parse(input: &str) -> Result<Self> {
        let mut routes = Vec::new();
        for (index, line) in input.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [pattern, backend] => {
                    let pattern = Regex::new(pattern).with_context(|| {
                        format!("line {}: invalid hostname pattern {pattern:?}", index + 1)
                    })?;
                    routes.push(RoutePattern {
                        pattern,
                        backend: (*backend).to_owned(),
                    });
                }
                [field] => bail!("line {}: {field:?} on a line by itself", index + 1),
                _ => bail!("line {}: too many fields: {line:?}", index + 1),
            }
        }
        Ok(Self { routes })
    }

    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read route file {path}"))?;
        Self::parse(&content).with_context(|| format!("Failed to parse route file {path}"))
    }

    /// Backend for `hostname`, first matching pattern in file order.
    pub fn backend_for(&self, hostname: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|route| route.pattern.is_match(hostname))
            .map(|route| route.backend.as_str())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl TargetLookup for RouteFile {
    async fn lookup(&self, server_name: &str) -> Result<Option<Arc<dyn Target>>> {
        Ok(self.backend_for(server_name).map(to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_routes_and_skips_comments_and_blanks() {
        let file = RouteFile::parse(
            "# comment\n\
             \n\
             example\\.com 10.0.0.1:443\n\
             \t\n\
             .* 10.0.0.9:443\n",
        )
        .unwrap();

        assert_eq!(file.len(), 2);
    }

    #[test]
    fn single_field_line_is_rejected() {
        let err = RouteFile::parse("example.com\n").unwrap_err();
        assert!(err.to_string().contains("by itself"));
    }

    #[test]
    fn extra_fields_are_rejected() {
        let err = RouteFile::parse("example.com 10.0.0.1:443 10.0.0.2:443\n").unwrap_err();
        assert!(err.to_string().contains("too many fields"));
    }

    #[test]
    fn invalid_pattern_is_rejected_at_load_time() {
        assert!(RouteFile::parse("example(.com 10.0.0.1:443\n").is_err());
    }

    #[test]
    fn first_matching_pattern_wins() {
        let file = RouteFile::parse(
            "special\\.example\\.com 10.0.0.1:443\n\
             .*\\.example\\.com 10.0.0.2:443\n",
        )
        .unwrap();

        assert_eq!(
            file.backend_for("special.example.com"),
            Some("10.0.0.1:443")
        );
        assert_eq!(file.backend_for("other.example.com"), Some("10.0.0.2:443"));
        assert_eq!(file.backend_for("elsewhere.net"), None);
    }

    #[tokio::test]
    async fn lookup_resolves_to_a_target_or_declines() {
        let file = RouteFile::parse("mail\\.example 127.0.0.1:2525\n").unwrap();

        assert!(file.lookup("mail.example").await.unwrap().is_some());
        assert!(file.lookup("web.example").await.unwrap().is_none());
    }

    #[test]
    fn config_requires_server_name_for_smtp() {
        let err = parse_config(
            "[[listeners]]\n\
             addr = \"0.0.0.0:25\"\n\
             protocol = \"smtp\"\n\
             routes = \"routes.cfg\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("server_name"));
    }

    #[test]
    fn config_parses_all_listener_fields() {
        let parsed = parse_config(
            "[[listeners]]\n\
             addr = \"0.0.0.0:443\"\n\
             routes = \"routes.cfg\"\n\
             acme_timeout_ms = 2500\n\
             \n\
             [[listeners]]\n\
             addr = \"0.0.0.0:143\"\n\
             protocol = \"imap\"\n\
             routes = \"mail-routes.cfg\"\n",
        )
        .unwrap();

        assert_eq!(parsed.listeners.len(), 2);
        assert_eq!(parsed.listeners[0].protocol, Protocol::Tls);
        assert_eq!(
            parsed.listeners[0].acme_timeout(),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(parsed.listeners[1].protocol, Protocol::Imap);
    }
}
