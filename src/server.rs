//! Session server
//!
//! Hosts documents keyed by session id. Each connection pulls one document;
//! events a connection sends are applied on its behalf and relayed to every
//! other connection attached to the same document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde_json::{json, Value as Json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::document::{CallbackId, Document, SetterId, PROTOCOL_VERSION};
use crate::model::ModelDef;
use crate::protocol::{
    apply_inbound, forwarder, methods, Message, PeerState, ProtocolError, PullParams, PullReply,
    ServerInfo,
};
use crate::registry::ModelRegistry;
use crate::transport::{TcpTransport, Transport, TransportError};

/// The document a connection has pulled, and how its events reach the peer.
struct Attachment {
    document: Arc<Mutex<Document>>,
    peer: Arc<StdMutex<PeerState>>,
    callback: CallbackId,
}

pub struct SessionServer {
    registry: Arc<ModelRegistry>,
    documents: RwLock<HashMap<String, Arc<Mutex<Document>>>>,
    config: ServerConfig,
    started_at: DateTime<Utc>,
    connections: AtomicUsize,
}

impl SessionServer {
    /// Returns `Arc<Self>` because every connection task holds a reference.
    pub fn new(registry: Arc<ModelRegistry>, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            documents: RwLock::new(HashMap::new()),
            config,
            started_at: Utc::now(),
            connections: AtomicUsize::new(0),
        })
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve `document` under `session_id`, replacing any document there.
    pub async fn insert_document(&self, session_id: impl Into<String>, document: Document) {
        let session_id = session_id.into();
        log::info!("Hosting document '{}' as session {}", document.title(), session_id);
        self.documents
            .write()
            .await
            .insert(session_id, Arc::new(Mutex::new(document)));
    }

    /// The document for `session_id`, created empty on first use.
    pub async fn document(&self, session_id: &str) -> Arc<Mutex<Document>> {
        if let Some(document) = self.documents.read().await.get(session_id) {
            return Arc::clone(document);
        }
        let mut documents = self.documents.write().await;
        let document = documents.entry(session_id.to_string()).or_insert_with(|| {
            log::info!("Creating document for session {}", session_id);
            Arc::new(Mutex::new(Document::new(Arc::clone(&self.registry))))
        });
        Arc::clone(document)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.documents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn server_info(&self) -> ServerInfo {
        ServerInfo {
            version: PROTOCOL_VERSION.to_string(),
            started_at: self.started_at,
            documents: self.documents.read().await.len(),
            connections: self.connections.load(Ordering::SeqCst),
        }
    }

    /// Bind `addr` and accept connections until the listener fails.
    pub async fn listen(self: Arc<Self>, addr: &str) -> Result<(), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("Listening on {}", listener.local_addr()?);
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> Result<(), TransportError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            log::info!("Accepted connection from {}", peer);
            self.spawn_connection(Arc::new(TcpTransport::from_stream(stream)));
        }
    }

    /// Serve one connection on a background task.
    pub fn spawn_connection(self: &Arc<Self>, transport: Arc<dyn Transport>) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.serve_connection(transport).await })
    }

    /// Serve one connection until the peer goes away.
    pub async fn serve_connection(&self, transport: Arc<dyn Transport>) {
        let setter = Uuid::new_v4();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let writer = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                while let Some(frame) = outbound_rx.recv().await {
                    if let Err(e) = transport.send(frame).await {
                        log::warn!("Dropping connection after send failure: {}", e);
                        break;
                    }
                }
            })
        };
        self.connections.fetch_add(1, Ordering::SeqCst);
        log::debug!("Connection {} opened", setter);

        let mut attachment: Option<Attachment> = None;
        loop {
            let frame = match transport.recv().await {
                Ok(frame) => frame,
                Err(e) => {
                    log::info!("Connection {} ended: {}", setter, e);
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
            let reply = match message {
                Message::Request {
                    token,
                    method,
                    params,
                } => {
                    self.handle_request(token, &method, params, setter, &outbound, &mut attachment)
                        .await
                }
                Message::Event { seq, event, defs } => {
                    self.handle_event(seq, &event, &defs, setter, attachment.as_ref())
                        .await;
                    None
                }
                Message::Reply { token, .. } => {
                    log::debug!("Discarding reply with unknown token {}", token);
                    None
                }
            };
            if let Some(reply) = reply {
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

        if let Some(attached) = attachment.take() {
            detach(attached).await;
        }
        drop(outbound);
        let _ = writer.await;
        self.connections.fetch_sub(1, Ordering::SeqCst);
        log::debug!("Connection {} closed", setter);
    }

    /// Answer one request. A successful pull queues its own reply, so
    /// `None` means nothing is left to send.
    async fn handle_request(
        &self,
        token: String,
        method: &str,
        params: Json,
        setter: SetterId,
        outbound: &mpsc::UnboundedSender<String>,
        attachment: &mut Option<Attachment>,
    ) -> Option<Message> {
        let reply = match method {
            methods::PULL => {
                let params: PullParams = match serde_json::from_value(params) {
                    Ok(params) => params,
                    Err(e) => return Some(Message::reply_err(token, format!("Invalid pull params: {e}"))),
                };
                if let Some(previous) = attachment.take() {
                    detach(previous).await;
                }
                match self.attach(&token, params, setter, outbound).await {
                    Ok(attached) => {
                        *attachment = Some(attached);
                        return None;
                    }
                    Err(e) => {
                        log::error!("Pull failed: {}", e);
                        Message::reply_err(token, e.to_string())
                    }
                }
            }
            methods::ACK => Message::reply_ok(token, json!({})),
            methods::SERVER_INFO => match serde_json::to_value(self.server_info().await) {
                Ok(info) => Message::reply_ok(token, info),
                Err(e) => Message::reply_err(token, e.to_string()),
            },
            other => {
                log::warn!("Unknown request method '{}'", other);
                Message::reply_err(token, format!("Unknown method '{other}'"))
            }
        };
        Some(reply)
    }

    /// Snapshot the requested document, queue the pull reply and start
    /// forwarding its events. All three happen under the document lock, so
    /// the reply is the first frame the peer sees and every later change
    /// follows it as an event.
    async fn attach(
        &self,
        token: &str,
        params: PullParams,
        setter: SetterId,
        outbound: &mpsc::UnboundedSender<String>,
    ) -> Result<Attachment, ProtocolError> {
        let session_id = params
            .session_id
            .unwrap_or_else(|| self.config.default_session.clone());
        if let Some(query) = &params.query {
            log::debug!("Pull for session {} with query {}", session_id, query);
        }
        let document = self.document(&session_id).await;
        let mut doc = document.lock().await;

        let (snapshot, emitted) = doc.encode_snapshot(self.config.binary_arrays)?;
        let known_types = snapshot.defs.iter().map(ModelDef::qualified_name).collect();
        let reply = serde_json::to_value(PullReply {
            session_id: session_id.clone(),
            doc: snapshot,
        })
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let frame = Message::reply_ok(token, reply).encode()?;
        outbound.send(frame).map_err(|_| ProtocolError::Closed)?;

        let peer = Arc::new(StdMutex::new(PeerState::new(emitted, known_types)));
        let callback = doc.on_change(forwarder(
            setter,
            false,
            Arc::clone(&peer),
            outbound.clone(),
            self.config.binary_arrays,
        ));
        drop(doc);
        log::info!("Connection {} pulled session {}", setter, session_id);

        Ok(Attachment {
            document: Arc::clone(&document),
            peer,
            callback,
        })
    }

    async fn handle_event(
        &self,
        seq: u64,
        event: &Json,
        defs: &[ModelDef],
        setter: SetterId,
        attachment: Option<&Attachment>,
    ) {
        let attached = match attachment {
            Some(attached) => attached,
            None => {
                log::warn!("Dropping event {} from connection {} before pull", seq, setter);
                return;
            }
        };
        let mut doc = attached.document.lock().await;
        if let Err(e) = apply_inbound(&attached.peer, seq, event, defs, &mut doc, setter) {
            log::error!("Failed to apply inbound event {}: {}", seq, e);
        }
    }
}

async fn detach(attached: Attachment) {
    attached
        .document
        .lock()
        .await
        .remove_on_change(attached.callback);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    async fn request(client: &ChannelTransport, token: &str, method: &str, params: Json) -> Message {
        client
            .send(Message::request(token, method, params).encode().unwrap())
            .await
            .unwrap();
        Message::decode(&client.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_pull_creates_named_session() {
        let server = SessionServer::new(
            Arc::new(ModelRegistry::with_builtins()),
            ServerConfig::default(),
        );
        let (client, remote) = ChannelTransport::pair();
        let task = server.spawn_connection(Arc::new(remote));

        let reply = request(&client, "t1", methods::PULL, json!({"session_id": "sales"})).await;
        match reply {
            Message::Reply {
                token,
                result: Some(result),
                error: None,
            } => {
                assert_eq!(token, "t1");
                let pulled: PullReply = serde_json::from_value(result).unwrap();
                assert_eq!(pulled.session_id, "sales");
                assert!(pulled.doc.roots.is_empty());
            }
            other => panic!("expected a pull reply, got {:?}", other),
        }
        assert_eq!(server.session_ids().await, vec!["sales".to_string()]);

        client.close().await.unwrap();
        task.await.unwrap();
        assert_eq!(server.server_info().await.connections, 0);
    }

    #[tokio::test]
    async fn test_unknown_method_gets_error_reply() {
        let server = SessionServer::new(
            Arc::new(ModelRegistry::with_builtins()),
            ServerConfig::default(),
        );
        let (client, remote) = ChannelTransport::pair();
        server.spawn_connection(Arc::new(remote));

        match request(&client, "t1", "shutdown", json!({})).await {
            Message::Reply { token, error, .. } => {
                assert_eq!(token, "t1");
                assert!(error.unwrap().contains("shutdown"));
            }
            other => panic!("expected a reply, got {:?}", other),
        }
        assert_eq!(
            request(&client, "t2", methods::ACK, json!({})).await,
            Message::reply_ok("t2", json!({}))
        );
    }

    #[tokio::test]
    async fn test_server_info_counts() {
        let server = SessionServer::new(
            Arc::new(ModelRegistry::with_builtins()),
            ServerConfig::default(),
        );
        let mut document = Document::new(Arc::clone(server.registry()));
        document.set_title("Loaded").unwrap();
        server.insert_document("default", document).await;

        let (client, remote) = ChannelTransport::pair();
        server.spawn_connection(Arc::new(remote));
        match request(&client, "t1", methods::SERVER_INFO, json!({})).await {
            Message::Reply {
                result: Some(result),
                ..
            } => {
                let info: ServerInfo = serde_json::from_value(result).unwrap();
                assert_eq!(info.version, PROTOCOL_VERSION);
                assert_eq!(info.documents, 1);
                assert_eq!(info.connections, 1);
            }
            other => panic!("expected server info, got {:?}", other),
        }

        match request(&client, "t2", methods::PULL, json!({})).await {
            Message::Reply {
                result: Some(result),
                ..
            } => {
                let pulled: PullReply = serde_json::from_value(result).unwrap();
                assert_eq!(pulled.session_id, "default");
                assert_eq!(pulled.doc.title, "Loaded");
            }
            other => panic!("expected a pull reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pull_reply_precedes_forwarded_events() {
        let server = SessionServer::new(
            Arc::new(ModelRegistry::with_builtins()),
            ServerConfig::default(),
        );
        let (outbound, mut frames) = mpsc::unbounded_channel();
        let attached = server
            .attach("t1", PullParams::default(), Uuid::new_v4(), &outbound)
            .await
            .unwrap();

        // the reply is already queued before any change can be forwarded
        match Message::decode(&frames.try_recv().unwrap()).unwrap() {
            Message::Reply {
                token,
                result: Some(_),
                error: None,
            } => assert_eq!(token, "t1"),
            other => panic!("expected the pull reply first, got {:?}", other),
        }
        assert!(frames.try_recv().is_err());

        attached.document.lock().await.set_title("Renamed").unwrap();
        match Message::decode(&frames.try_recv().unwrap()).unwrap() {
            Message::Event { seq, event, .. } => {
                assert_eq!(seq, 1);
                assert_eq!(event["title"], json!("Renamed"));
            }
            other => panic!("expected an event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pull_on_closed_connection_fails() {
        let server = SessionServer::new(
            Arc::new(ModelRegistry::with_builtins()),
            ServerConfig::default(),
        );
        let (outbound, frames) = mpsc::unbounded_channel();
        drop(frames);
        let result = server
            .attach("t1", PullParams::default(), Uuid::new_v4(), &outbound)
            .await;
        assert!(matches!(result, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn test_tcp_listener_serves_pulls() {
        let server = SessionServer::new(
            Arc::new(ModelRegistry::with_builtins()),
            ServerConfig::default(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&server).serve_listener(listener));

        let client = TcpTransport::connect(&addr.to_string()).await.unwrap();
        client
            .send(Message::request("t1", methods::ACK, json!({})).encode().unwrap())
            .await
            .unwrap();
        let reply = Message::decode(&client.recv().await.unwrap()).unwrap();
        assert_eq!(reply, Message::reply_ok("t1", json!({})));
    }
}
