//! Client sessions
//!
//! [`pull_session`] connects to a server, pulls the document for a session
//! and keeps it in sync: local changes are forwarded in the order they
//! happen, inbound events are applied with this session as their setter so
//! they are not echoed back, and requests are correlated to their replies by
//! token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value as Json};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::document::{CallbackId, Document, DocumentError, SetterId};
use crate::model::ModelDef;
use crate::protocol::{
    apply_inbound, forwarder, methods, Message, PeerState, ProtocolError, PullParams, PullReply,
    ServerInfo,
};
use crate::registry::ModelRegistry;
use crate::transport::{TcpTransport, Transport, TransportError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Request '{method}' timed out")]
    RequestTimeout { method: String },

    #[error("Session closed")]
    Closed,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Document error: {0}")]
    Document(String),
}

impl SessionError {
    /// Whether the failure came from the connection rather than the data.
    /// Transport failures are worth retrying with a new session.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SessionError::Transport(_)
                | SessionError::HandshakeTimeout(_)
                | SessionError::RequestTimeout { .. }
                | SessionError::Closed
        )
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e.to_string())
    }
}

impl From<DocumentError> for SessionError {
    fn from(e: DocumentError) -> Self {
        SessionError::Document(e.to_string())
    }
}

type Pending = Arc<StdMutex<HashMap<String, oneshot::Sender<Result<Json, SessionError>>>>>;

/// A pulled document kept in sync with a server.
pub struct ClientSession {
    id: String,
    setter: SetterId,
    document: Arc<Mutex<Document>>,
    transport: Arc<dyn Transport>,
    outbound: mpsc::UnboundedSender<String>,
    pending: Pending,
    callback: CallbackId,
    config: SessionConfig,
    closed: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Connect to `url` over TCP and pull the document for `session_id`, or the
/// server's default session when none is given.
pub async fn pull_session(
    url: &str,
    session_id: Option<&str>,
    query: Option<&str>,
    registry: Arc<ModelRegistry>,
    config: SessionConfig,
) -> Result<ClientSession, SessionError> {
    let transport = TcpTransport::connect(url).await?;
    pull_session_over(Arc::new(transport), session_id, query, registry, config).await
}

/// Pull a session over an already-open transport.
pub async fn pull_session_over(
    transport: Arc<dyn Transport>,
    session_id: Option<&str>,
    query: Option<&str>,
    registry: Arc<ModelRegistry>,
    config: SessionConfig,
) -> Result<ClientSession, SessionError> {
    let token = Uuid::new_v4().to_string();
    let params = PullParams {
        session_id: session_id.map(str::to_string),
        query: query.map(str::to_string),
    };
    let params = serde_json::to_value(params).map_err(|e| SessionError::Protocol(e.to_string()))?;
    log::debug!("Pulling session {:?}", session_id);
    transport
        .send(Message::request(token.as_str(), methods::PULL, params).encode()?)
        .await?;

    let limit = config.handshake_timeout();
    let result = tokio::time::timeout(limit, await_reply(transport.as_ref(), &token))
        .await
        .map_err(|_| SessionError::HandshakeTimeout(limit))??;
    let pulled: PullReply =
        serde_json::from_value(result).map_err(|e| SessionError::Protocol(e.to_string()))?;
    let mut document = Document::from_json(&pulled.doc, registry)?;

    let setter = Uuid::new_v4();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let peer = Arc::new(StdMutex::new(PeerState::new(
        document.model_ids().into_iter().collect(),
        pulled.doc.defs.iter().map(ModelDef::qualified_name).collect(),
    )));
    let callback = document.on_change(forwarder(
        setter,
        config.echo_inbound,
        Arc::clone(&peer),
        outbound.clone(),
        config.binary_arrays,
    ));
    let document = Arc::new(Mutex::new(document));
    let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));

    let writer = tokio::spawn(write_loop(
        Arc::clone(&transport),
        outbound_rx,
        Arc::clone(&pending),
    ));
    let reader = tokio::spawn(read_loop(
        Arc::clone(&transport),
        Arc::clone(&document),
        peer,
        Arc::clone(&pending),
        outbound.clone(),
        setter,
    ));
    log::info!("Pulled session {}", pulled.session_id);

    Ok(ClientSession {
        id: pulled.session_id,
        setter,
        document,
        transport,
        outbound,
        pending,
        callback,
        config,
        closed: AtomicBool::new(false),
        tasks: StdMutex::new(vec![writer, reader]),
    })
}

impl ClientSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The setter id stamped on events this session applies from the server.
    pub fn setter(&self) -> SetterId {
        self.setter
    }

    /// The synced document. Mutations made through it are sent to the server.
    pub fn document(&self) -> Arc<Mutex<Document>> {
        Arc::clone(&self.document)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a request and wait for its reply. The request is queued behind
    /// every change already sent.
    pub async fn request(&self, method: &str, params: Json) -> Result<Json, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let token = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| SessionError::Closed)?
            .insert(token.clone(), tx);

        let frame = Message::request(token.as_str(), method, params).encode()?;
        if self.outbound.send(frame).is_err() {
            self.forget(&token);
            return Err(SessionError::Transport(TransportError::Disconnected));
        }

        let reply = match self.config.request_timeout() {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.forget(&token);
                    return Err(SessionError::RequestTimeout {
                        method: method.to_string(),
                    });
                }
            },
            None => rx.await,
        };
        reply.map_err(|_| SessionError::Closed)?
    }

    /// Resolve once the server has processed everything sent before this call.
    pub async fn force_roundtrip(&self) -> Result<(), SessionError> {
        self.request(methods::ACK, json!({})).await.map(|_| ())
    }

    pub async fn server_info(&self) -> Result<ServerInfo, SessionError> {
        let result = self.request(methods::SERVER_INFO, json!({})).await?;
        serde_json::from_value(result).map_err(|e| SessionError::Protocol(e.to_string()))
    }

    /// Stop syncing. Outstanding requests fail with [`SessionError::Closed`];
    /// nothing already sent is recalled.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        fail_pending(&self.pending, SessionError::Closed);
        self.document.lock().await.remove_on_change(self.callback);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.transport.close().await?;
        log::info!("Closed session {}", self.id);
        Ok(())
    }

    fn forget(&self, token: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(token);
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// Read frames until the reply to `token` arrives.
async fn await_reply(transport: &dyn Transport, token: &str) -> Result<Json, SessionError> {
    loop {
        let frame = transport.recv().await?;
        match Message::decode(&frame)? {
            Message::Reply {
                token: reply_token,
                result,
                error,
            } if reply_token == token => {
                return match error {
                    Some(error) => Err(SessionError::Remote(error)),
                    None => Ok(result.unwrap_or(Json::Null)),
                };
            }
            other => log::debug!("Ignoring frame during handshake: {:?}", other),
        }
    }
}

fn fail_pending(pending: &Pending, error: SessionError) {
    let waiters: Vec<_> = match pending.lock() {
        Ok(mut pending) => pending.drain().collect(),
        Err(_) => return,
    };
    for (_, waiter) in waiters {
        let _ = waiter.send(Err(error.clone()));
    }
}

async fn write_loop(
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    pending: Pending,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = transport.send(frame).await {
            log::warn!("Session send failed: {}", e);
            fail_pending(&pending, SessionError::Transport(e));
            break;
        }
    }
}

async fn read_loop(
    transport: Arc<dyn Transport>,
    document: Arc<Mutex<Document>>,
    peer: Arc<StdMutex<PeerState>>,
    pending: Pending,
    outbound: mpsc::UnboundedSender<String>,
    setter: SetterId,
) {
    loop {
        let frame = match transport.recv().await {
            Ok(frame) => frame,
            Err(e) => {
                log::info!("Session connection ended: {}", e);
                fail_pending(&pending, SessionError::Transport(e));
                break;
            }
        };
        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Discarding malformed frame: {}", e);
                continue;
            }
        };
        match message {
            Message::Reply {
                token,
                result,
                error,
            } => {
                let waiter = pending.lock().ok().and_then(|mut p| p.remove(&token));
                match waiter {
                    Some(waiter) => {
                        let outcome = match error {
                            Some(error) => Err(SessionError::Remote(error)),
                            None => Ok(result.unwrap_or(Json::Null)),
                        };
                        let _ = waiter.send(outcome);
                    }
                    None => log::debug!("Discarding reply with unknown token {}", token),
                }
            }
            Message::Event { seq, event, defs } => {
                let mut doc = document.lock().await;
                if let Err(e) = apply_inbound(&peer, seq, &event, &defs, &mut doc, setter) {
                    log::error!("Failed to apply inbound event {}: {}", seq, e);
                }
            }
            Message::Request { token, method, .. } => {
                let reply = if method == methods::ACK {
                    Message::reply_ok(token, json!({}))
                } else {
                    Message::reply_err(token, format!("Unknown method '{method}'"))
                };
                match reply.encode() {
                    Ok(frame) => {
                        if outbound.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!("Failed to encode reply: {}", e),
                }
            }
        }
    }
}
