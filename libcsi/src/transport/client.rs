//! Client used by an orchestrator (or a test) to issue CSI requests.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, instrument, warn};

use super::{Connection, Endpoint, frame_codec};
use crate::error::CsiError;
use crate::message::{CsiMessage, Envelope};

/// A lightweight CSI client that sends [`CsiMessage`] requests over a single
/// connection and returns the server's response.
pub struct CsiClient {
    framed: Mutex<Framed<Box<dyn Connection>, LengthDelimitedCodec>>,
    next_id: AtomicU64,
}

impl CsiClient {
    /// Connect to the CSI server listening on `endpoint`.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, CsiError> {
        let conn: Box<dyn Connection> = match endpoint {
            Endpoint::Unix(path) => Box::new(UnixStream::connect(path).await.map_err(|e| {
                CsiError::TransportError(format!("connect {}: {e}", path.display()))
            })?),
            Endpoint::Tcp(addr) => Box::new(
                TcpStream::connect(addr.as_str())
                    .await
                    .map_err(|e| CsiError::TransportError(format!("connect {addr}: {e}")))?,
            ),
        };

        debug!(%endpoint, "CSI connection established");
        Ok(Self {
            framed: Mutex::new(Framed::new(conn, frame_codec())),
            next_id: AtomicU64::new(1),
        })
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// An error reported by the plugin comes back as `Ok(CsiMessage::Error)`;
    /// only transport failures are returned as `Err`.  Use [`Self::call`] to
    /// fold both into one `Result`.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_vec(&Envelope {
            id,
            message: msg.clone(),
        })
        .map_err(CsiError::internal)?;

        let mut framed = self.framed.lock().await;
        framed
            .send(Bytes::from(payload))
            .await
            .map_err(CsiError::transport)?;

        while let Some(frame) = framed.next().await {
            let frame = frame.map_err(CsiError::transport)?;
            let envelope: Envelope =
                serde_json::from_slice(&frame).map_err(CsiError::transport)?;
            if envelope.id == id {
                debug!(response = %envelope.message, "CSI response received");
                return Ok(envelope.message);
            }
            warn!(expected = id, got = envelope.id, "discarding response for another request");
        }

        Err(CsiError::TransportError(
            "connection closed before a response arrived".into(),
        ))
    }

    /// Like [`Self::request`], but returns a plugin-side error as `Err`.
    pub async fn call(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        self.request(msg).await?.into_result()
    }
}
