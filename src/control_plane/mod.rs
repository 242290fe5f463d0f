//! Request/response dispatch plus the event broadcast channel between the
//! storage service and the UI process, over an authenticated local Unix
//! socket (spec §4.11).

mod auth;
pub mod protocol;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::ServiceError;
use protocol::{Event, Request, RequestEnvelope, Response, ResponseEnvelope};

pub use auth::PeerAuth;

/// Default per-request timeout (spec §4.11: "Timeouts on every request
/// (default 30 s)").
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound applied to the event broadcast so a slow/absent UI client can't
/// grow memory without limit; lagging receivers simply miss old events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

pub struct ControlPlane {
    socket_path: PathBuf,
    auth: PeerAuth,
    handler: Arc<dyn RequestHandler>,
    events: broadcast::Sender<Event>,
}

impl ControlPlane {
    pub fn new(socket_path: PathBuf, auth: PeerAuth, handler: Arc<dyn RequestHandler>) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(ControlPlane { socket_path, auth, handler, events })
    }

    /// Handle to push an event to every currently-connected UI client
    /// (spec §4.11 event list); silently dropped if nobody is listening.
    pub fn events(&self) -> broadcast::Sender<Event> {
        self.events.clone()
    }

    pub fn publish(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Binds the socket (removing a stale file first) and serves
    /// connections until the listener errors or the process exits.
    pub async fn serve(self: Arc<Self>) -> Result<(), ServiceError> {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::MountFailed(e.to_string()))?;
        }
        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| ServiceError::MountFailed(format!("bind control plane socket: {e}")))?;
        info!(path = %self.socket_path.display(), "control plane listening");

        loop {
            let (stream, _addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "control plane accept failed");
                    continue;
                }
            };
            let plane = self.clone();
            tokio::spawn(async move {
                if let Err(e) = plane.handle_connection(stream).await {
                    warn!(error = %e, "control plane connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: UnixStream) -> Result<(), ServiceError> {
        self.auth.check(&stream)?;

        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut event_rx = self.events.subscribe();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.map_err(|e| ServiceError::Internal(e.to_string()))? else {
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let envelope: RequestEnvelope = match serde_json::from_str(&line) {
                        Ok(env) => env,
                        Err(e) => {
                            debug!(error = %e, "malformed control plane request, dropping connection");
                            break;
                        }
                    };
                    let response = match tokio::time::timeout(REQUEST_TIMEOUT, self.handler.handle(envelope.request)).await {
                        Ok(response) => response,
                        Err(_) => Response::Error(crate::error::IpcError::from_service_error(
                            "control_plane",
                            &ServiceError::XpcTimeout,
                        )),
                    };
                    let out = ResponseEnvelope { id: envelope.id, response };
                    write_line(&mut write_half, &out).await?;
                }
                event = event_rx.recv() => {
                    match event {
                        Ok(event) => write_line(&mut write_half, &protocol::EventFrame::Event(event)).await?,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "control plane event subscriber lagged, dropping events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }
}

async fn write_line<T: serde::Serialize>(
    out: &mut (impl AsyncWriteExt + Unpin),
    value: &T,
) -> Result<(), ServiceError> {
    let mut line = serde_json::to_string(value).map_err(|e| ServiceError::Internal(e.to_string()))?;
    line.push('\n');
    out.write_all(line.as_bytes())
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))
}
