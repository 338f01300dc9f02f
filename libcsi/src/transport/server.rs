//! Accept loop and request dispatch for plugins.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use super::{Connection, Endpoint, frame_codec};
use crate::error::CsiError;
use crate::message::{CsiMessage, Envelope};
use crate::service::{CsiController, CsiIdentity, CsiNode};

enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

/// Serves one plugin implementing all three CSI services.
pub struct CsiServer<T> {
    listener: Listener,
    handler: Arc<T>,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    /// Bind a new server to `endpoint`.
    ///
    /// For Unix endpoints a socket file left behind by a previous run is
    /// removed and the parent directory is created.
    pub async fn bind(endpoint: &Endpoint, handler: Arc<T>) -> Result<Self, CsiError> {
        let listener = match endpoint {
            Endpoint::Unix(path) => {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => debug!(path = %path.display(), "removed stale CSI socket"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(CsiError::TransportError(format!(
                            "remove stale socket {}: {e}",
                            path.display()
                        )));
                    }
                }
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        CsiError::TransportError(format!("create {}: {e}", parent.display()))
                    })?;
                }
                let listener = UnixListener::bind(path).map_err(|e| {
                    CsiError::TransportError(format!("bind {}: {e}", path.display()))
                })?;
                Listener::Unix {
                    listener,
                    path: path.clone(),
                }
            }
            Endpoint::Tcp(addr) => Listener::Tcp(
                TcpListener::bind(addr.as_str())
                    .await
                    .map_err(|e| CsiError::TransportError(format!("bind {addr}: {e}")))?,
            ),
        };
        info!(%endpoint, "CSI server listening");
        Ok(Self { listener, handler })
    }

    /// Local address of a TCP server, useful when binding to port `0`.
    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix { .. } => None,
        }
    }

    /// Accept connections until the listener fails permanently.
    pub async fn serve(self) -> Result<(), CsiError> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Each accepted connection runs on its own Tokio task, and each request
    /// frame within a connection is dispatched on a task of its own, so a slow
    /// operation on one volume never delays another.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<(), CsiError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("CSI server shutting down");
                    break;
                }
                accepted = self.accept() => match accepted {
                    Ok(conn) => {
                        let handler = Arc::clone(&self.handler);
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_connection(conn, handler).await {
                                warn!(error = %e, "CSI connection error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        if let Listener::Unix { path, .. } = &self.listener {
            let _ = tokio::fs::remove_file(path).await;
        }
        Ok(())
    }

    async fn accept(&self) -> Result<Box<dyn Connection>, CsiError> {
        match &self.listener {
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await.map_err(CsiError::transport)?;
                debug!("CSI unix connection accepted");
                Ok(Box::new(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, remote) = listener.accept().await.map_err(CsiError::transport)?;
                debug!(%remote, "CSI tcp connection accepted");
                Ok(Box::new(stream))
            }
        }
    }

    /// Read request frames from one connection and answer each of them.
    ///
    /// Responses are funnelled through a channel into a single writer task,
    /// so they are written in completion order, tagged with the request id.
    #[instrument(skip_all)]
    async fn handle_connection(conn: Box<dyn Connection>, handler: Arc<T>) -> Result<(), CsiError> {
        let (mut sink, mut frames) = Framed::new(conn, frame_codec()).split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let writer = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let payload = serde_json::to_vec(&envelope).map_err(CsiError::internal)?;
                sink.send(Bytes::from(payload))
                    .await
                    .map_err(CsiError::transport)?;
            }
            Ok::<(), CsiError>(())
        });

        while let Some(frame) = frames.next().await {
            let frame = frame.map_err(CsiError::transport)?;
            let envelope: Envelope = match serde_json::from_slice(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "malformed CSI request frame");
                    let _ = tx.send(Envelope {
                        id: 0,
                        message: CsiMessage::Error(CsiError::TransportError(format!(
                            "malformed request: {e}"
                        ))),
                    });
                    continue;
                }
            };

            let handler = Arc::clone(&handler);
            let tx = tx.clone();
            tokio::spawn(async move {
                let Envelope { id, message } = envelope;
                debug!(id, request = %message, "CSI request received");
                let response = Self::dispatch(&handler, message).await;
                if let CsiMessage::Error(e) = &response {
                    debug!(id, code = %e.code(), error = %e, "CSI request failed");
                }
                if tx.send(Envelope { id, message: response }).is_err() {
                    debug!(id, "connection closed before the response was sent");
                }
            });
        }

        drop(tx);
        writer.await.map_err(CsiError::internal)?
    }

    async fn dispatch(handler: &T, request: CsiMessage) -> CsiMessage {
        use CsiMessage as M;
        let done = |()| M::Ok;
        match request {
            M::Probe => reply(handler.probe().await, M::ProbeResult),
            M::GetPluginInfo => reply(handler.get_plugin_info().await, M::PluginInfoResponse),
            M::GetPluginCapabilities => reply(
                handler.get_plugin_capabilities().await,
                M::PluginCapabilitiesResponse,
            ),

            M::CreateVolume(req) => reply(handler.create_volume(req).await, M::VolumeCreated),
            M::DeleteVolume(id) => reply(handler.delete_volume(&id).await, done),
            M::ValidateVolumeCapabilities(req) => reply(
                handler.validate_volume_capabilities(req).await,
                M::CapabilitiesValidated,
            ),
            M::ControllerGetCapabilities => reply(
                CsiController::get_capabilities(handler).await,
                M::ControllerCapabilities,
            ),

            M::StageVolume(req) => reply(handler.stage_volume(req).await, done),
            M::UnstageVolume {
                volume_id,
                staging_target_path,
            } => reply(
                handler
                    .unstage_volume(&volume_id, &staging_target_path)
                    .await,
                done,
            ),
            M::PublishVolume(req) => reply(handler.publish_volume(req).await, done),
            M::UnpublishVolume {
                volume_id,
                target_path,
            } => reply(
                handler.unpublish_volume(&volume_id, &target_path).await,
                done,
            ),
            M::GetNodeInfo => reply(handler.get_info().await, M::NodeInfoResponse),
            M::NodeGetCapabilities => reply(
                CsiNode::get_capabilities(handler).await,
                M::NodeCapabilities,
            ),

            response => {
                warn!(kind = response.kind(), "response variant sent as a request");
                M::Error(CsiError::InvalidArgument(format!(
                    "{} is not a request",
                    response.kind()
                )))
            }
        }
    }
}

fn reply<R>(result: Result<R, CsiError>, wrap: impl FnOnce(R) -> CsiMessage) -> CsiMessage {
    result.map_or_else(CsiMessage::Error, wrap)
}
