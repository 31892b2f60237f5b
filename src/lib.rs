//! SNI Relay Server
//!
//! A TCP relay that routes inbound connections to backend targets by
//! inspecting the application-layer handshake: the TLS ClientHello (SNI),
//! or a brief STARTTLS preamble for plaintext mail protocols. The forwarded
//! TLS session is never terminated or decrypted; ACME domain-validation
//! challenges are resolved by racing handshakes against the registered
//! backends.

pub mod acme;
pub mod config;
pub mod proxy;
pub mod route;
pub mod sniff;
pub mod starttls;
pub mod stream;
pub mod target;
pub mod tls;

// Re-export commonly used types and functions
pub use config::{Config, ListenerConfig, Protocol, RouteFile, load_config};
pub use proxy::Proxy;
pub use route::{Matcher, RouteId, TargetLookup};
pub use sniff::{ClientHelloInfo, read_client_hello, server_name};
pub use starttls::Negotiation;
pub use stream::PeekStream;
pub use target::{Conn, DialTarget, ProxyStream, Target, to};
