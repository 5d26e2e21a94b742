//! Strict request/reply TCP listener.
//!
//! One logical request must be answered before the next is read on the same
//! connection: the per-connection loop reads a frame, dispatches it, writes
//! exactly one `res` envelope, and only then reads again. That discipline is
//! what gives strict-duplex clients their in-order guarantee.
//!
//! A frame that fails to decode earns an error response but does not kill
//! the connection; a socket error does, quietly, without touching other
//! connections or the process.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use devbus_core::decode;

use crate::broker::Broker;
use crate::transport::{decode_error_response, read_frame, write_envelope, TransportError};

/// The strict duplex listener. Bind first (so tests can bind port 0 and
/// discover the real address), then run the accept loop.
pub struct DuplexListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl DuplexListener {
    /// Binds the TCP listener.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] when the port is taken or the
    /// process may not bind the address.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::BindFailed { addr, source })?;
        let local_addr = listener.local_addr().map_err(|source| {
            TransportError::BindFailed { addr, source }
        })?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The actually bound address (differs from the requested one when
    /// binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the accept loop until `running` is cleared. Each accepted
    /// connection gets its own task so one slow client never blocks others.
    pub async fn run(self, broker: Arc<Broker>, running: Arc<AtomicBool>) {
        info!("duplex listener on {}", self.local_addr);

        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; duplex accept loop stopping");
                break;
            }

            // Short accept timeout so the loop can observe the shutdown flag
            // even when no clients are connecting.
            match timeout(Duration::from_millis(200), self.listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    debug!("duplex connection from {peer}");
                    let broker = Arc::clone(&broker);
                    tokio::spawn(async move {
                        handle_connection(stream, peer, broker).await;
                    });
                }
                Ok(Err(e)) => {
                    // Transient accept error; keep serving.
                    warn!("duplex accept error: {e}");
                }
                Err(_) => {
                    // Accept timeout; loop back to check the shutdown flag.
                }
            }
        }
    }
}

/// Serves one connection to completion. Strictly sequential: read one
/// request, answer it, repeat.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, broker: Arc<Broker>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("duplex connection {peer} closed by peer");
                break;
            }
            Err(e) => {
                warn!("duplex connection {peer} read error: {e}");
                break;
            }
        };
        if frame.is_empty() {
            continue;
        }

        let response = match decode(frame.as_bytes()) {
            Ok(envelope) => broker.handle_envelope(&envelope).await,
            Err(e) => {
                // Message-fatal, not connection-fatal.
                debug!("duplex connection {peer}: undecodable frame: {e}");
                decode_error_response(&broker, &e)
            }
        };

        if let Err(e) = write_envelope(&mut write_half, &response).await {
            warn!("duplex connection {peer} write error: {e}; dropping connection");
            break;
        }
    }
}
