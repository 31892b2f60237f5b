use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

const COPY_BUFFER_SIZE: usize = 8192;

/// Byte stream a target takes ownership of: a routed TCP connection, or one
/// end of an in-memory pipe during ACME challenge resolution.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for T {}

pub type Conn = Box<dyn ProxyStream>;

/// The capability to take ownership of a connection and proxy its bytes
/// to a backend. Shared by reference across any number of routes.
#[async_trait]
pub trait Target: Send + Sync {
    async fn handle_conn(&self, conn: Conn);
}

/// A target that dials a fixed backend address and splices bytes in both
/// directions until either side closes.
pub struct DialTarget {
    addr: String,
    connect_timeout: Duration,
}

impl DialTarget {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

/// Shorthand for a shareable [`DialTarget`].
pub fn to(addr: impl Into<String>) -> Arc<dyn Target> {
    Arc::new(DialTarget::new(addr))
}

#[async_trait]
impl Target for DialTarget {
    async fn handle_conn(&self, conn: Conn) {
        let backend = match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(backend_addr = %self.addr, error = %e, "backend connection failed");
                return;
            }
            Err(_) => {
                warn!(backend_addr = %self.addr, "backend connection timed out");
                return;
            }
        };

        let (to_backend, from_backend) = splice(conn, backend).await;
        debug!(
            backend_addr = %self.addr,
            bytes_to_backend = to_backend,
            bytes_from_backend = from_backend,
            "proxy session closed"
        );
    }
}

/// Copies bytes in both directions, returning (to_b, from_b) byte counts.
/// Each direction shuts down its write half on EOF from the other side.
async fn splice(a: Conn, b: TcpStream) -> (u64, u64) {
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = b.into_split();

    let a_to_b = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            match a_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    b_write.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
                Err(e) => return Err(e),
            }
        }
        b_write.shutdown().await?;
        Ok::<u64, io::Error>(total)
    };

    let b_to_a = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            match b_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    a_write.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
                Err(e) => return Err(e),
            }
        }
        a_write.shutdown().await?;
        Ok::<u64, io::Error>(total)
    };

    let (a_result, b_result) = tokio::join!(a_to_b, b_to_a);
    (a_result.unwrap_or(0), b_result.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::PeekStream;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    /// Echo server on an ephemeral port.
    async fn start_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) if stream.write_all(&buf[..n]).await.is_err() => break,
                            Ok(_) => {}
                        }
                    }
                });
            }
        });

        addr
    }

    /// Server that records everything the first connection sends.
    async fn start_capturing_server() -> (std::net::SocketAddr, Arc<Mutex<Vec<u8>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let captured = Arc::new(Mutex::new(Vec::new()));
        let captured_clone = captured.clone();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    captured_clone.lock().unwrap().extend_from_slice(&buf[..n]);
                }
            }
        });

        (addr, captured)
    }

    #[tokio::test]
    async fn forwards_bytes_both_ways() {
        let backend = start_echo_server().await;
        let target = DialTarget::new(backend.to_string());

        let (far, near) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move { target.handle_conn(Box::new(near)).await });

        let (mut read_half, mut write_half) = tokio::io::split(far);
        write_half.write_all(b"ping over the relay").await.unwrap();
        write_half.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        read_half.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"ping over the relay");

        session.await.unwrap();
    }

    #[tokio::test]
    async fn replays_peeked_bytes_to_backend() {
        let (backend, captured) = start_capturing_server().await;
        let target = DialTarget::new(backend.to_string());

        // Sniffed-but-unconsumed bytes must reach the backend first.
        let mut stream = PeekStream::new(&b"\x16\x03\x01 rest of the handshake"[..]);
        stream.peek(5).await.unwrap();
        target.handle_conn(Box::new(stream)).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let received = captured.lock().unwrap().clone();
        assert_eq!(received, b"\x16\x03\x01 rest of the handshake");
    }

    #[tokio::test]
    async fn unreachable_backend_closes_quietly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let unused = listener.local_addr().unwrap();
        drop(listener);

        let target =
            DialTarget::with_timeout(unused.to_string(), Duration::from_millis(200));
        let (_far, near) = tokio::io::duplex(64);
        target.handle_conn(Box::new(near)).await;
    }
}
