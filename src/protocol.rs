//! Wire protocol
//!
//! Three message classes share one connection: requests, replies correlated
//! to them by token, and change events. Events carry a per-connection
//! sequence number so a receiver can drop anything it has already applied.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::document::{ChangeEvent, DocJson, Document, DocumentError, DocumentEvent, SetterId};
use crate::model::{DefinitionError, Model, ModelDef, ModelId};
use crate::wire::{DecodeError, Deserializer, EncodeError, Serializer};

/// Request method names.
pub mod methods {
    /// Fetch the full document; the reply is a snapshot.
    pub const PULL: &str = "pull";
    /// Round-trip marker; the reply is sent once everything before it has
    /// been processed.
    pub const ACK: &str = "ack";
    pub const SERVER_INFO: &str = "server_info";
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Peer state lock poisoned")]
    Poisoned,

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Connection closed")]
    Closed,
}

/// One frame on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Request {
        token: String,
        method: String,
        #[serde(default)]
        params: Json,
    },
    Reply {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Json>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Event {
        seq: u64,
        event: Json,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        defs: Vec<ModelDef>,
    },
}

impl Message {
    pub fn request(token: impl Into<String>, method: impl Into<String>, params: Json) -> Self {
        Message::Request {
            token: token.into(),
            method: method.into(),
            params,
        }
    }

    pub fn reply_ok(token: impl Into<String>, result: Json) -> Self {
        Message::Reply {
            token: token.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn reply_err(token: impl Into<String>, error: impl Into<String>) -> Self {
        Message::Reply {
            token: token.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(format!("{e}: {frame}")))
    }
}

/// Parameters of a `pull` request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PullParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Reply to `pull`: the session the document belongs to and its snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PullReply {
    pub session_id: String,
    pub doc: DocJson,
}

/// Reply to `server_info`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub documents: usize,
    pub connections: usize,
}

/// What one side of a connection knows about the other: which models and
/// types the peer already holds, and the event sequence numbers in each
/// direction.
#[derive(Debug, Default)]
pub(crate) struct PeerState {
    known: HashSet<ModelId>,
    known_types: HashSet<String>,
    next_seq: u64,
    last_inbound: u64,
}

impl PeerState {
    pub(crate) fn new(known: HashSet<ModelId>, known_types: HashSet<String>) -> Self {
        Self {
            known,
            known_types,
            next_seq: 0,
            last_inbound: 0,
        }
    }

    /// Encode a local change for the peer. Models the peer has not seen are
    /// written in full once, along with definitions of any new types.
    pub(crate) fn encode_event(
        &mut self,
        change: &ChangeEvent,
        doc: &Document,
        binary: bool,
    ) -> Result<String, ProtocolError> {
        let mut serializer = Serializer::new(doc.models())
            .with_known(&self.known)
            .with_binary(binary);
        let event = serializer.encode_with(&change.event)?;
        let emitted = serializer.into_emitted();

        let mut new_types: Vec<&str> = emitted
            .iter()
            .filter_map(|id| doc.get_model(id))
            .map(|model| model.type_name())
            .filter(|name| !self.known_types.contains(*name))
            .collect();
        new_types.sort_unstable();
        new_types.dedup();
        let mut defs = doc.registry().export_defs(&new_types)?;
        defs.retain(|def| !self.known_types.contains(&def.qualified_name()));

        self.known_types
            .extend(new_types.iter().map(|name| name.to_string()));
        self.known_types
            .extend(defs.iter().map(ModelDef::qualified_name));
        self.known.extend(emitted);
        self.next_seq += 1;

        Message::Event {
            seq: self.next_seq,
            event,
            defs,
        }
        .encode()
    }

    /// Decode an inbound event, registering its definitions. Returns the
    /// event with the models it carries, or `None` for an event already
    /// applied. Nothing is added to `doc` until the event is accepted.
    pub(crate) fn decode_event(
        &mut self,
        seq: u64,
        event: &Json,
        defs: &[ModelDef],
        doc: &Document,
    ) -> Result<Option<(DocumentEvent, Vec<Model>)>, ProtocolError> {
        if seq <= self.last_inbound {
            log::debug!("Dropping duplicate event {} (last applied {})", seq, self.last_inbound);
            return Ok(None);
        }
        doc.registry().resolve_defs(defs)?;
        self.known_types.extend(defs.iter().map(ModelDef::qualified_name));

        let (event, models) = {
            let mut de = Deserializer::new(doc.registry().as_ref()).with_lookup(doc.models());
            let event = DocumentEvent::from_json(event, &mut de)?;
            (event, de.finish()?)
        };
        self.known.extend(models.iter().map(|model| model.id().clone()));
        if let Some(model) = event.model() {
            self.known.insert(model.clone());
        }
        Ok(Some((event, models)))
    }

    pub(crate) fn mark_applied(&mut self, seq: u64) {
        self.last_inbound = self.last_inbound.max(seq);
    }
}

/// Apply an inbound event on behalf of `setter`. The peer lock is released
/// before the document emits, so forwarders may take it again. A rejected
/// event leaves neither its models in the document nor its seq consumed.
pub(crate) fn apply_inbound(
    peer: &Mutex<PeerState>,
    seq: u64,
    event: &Json,
    defs: &[ModelDef],
    doc: &mut Document,
    setter: SetterId,
) -> Result<bool, ProtocolError> {
    let decoded = {
        let mut state = peer.lock().map_err(|_| ProtocolError::Poisoned)?;
        state.decode_event(seq, event, defs, doc)?
    };
    let Some((event, models)) = decoded else {
        return Ok(false);
    };

    let fresh: Vec<ModelId> = models
        .iter()
        .map(|model| model.id().clone())
        .filter(|id| doc.get_model(id).is_none())
        .collect();
    doc.insert_models(models);
    match doc.apply(event, Some(setter)) {
        Ok(changed) => {
            peer.lock()
                .map_err(|_| ProtocolError::Poisoned)?
                .mark_applied(seq);
            Ok(changed)
        }
        Err(e) => {
            doc.remove_models(&fresh);
            Err(e.into())
        }
    }
}

/// A change callback that encodes document events for one peer and queues
/// them on `out`. Events applied by `setter` itself are skipped unless
/// `echo` is set.
pub(crate) fn forwarder(
    setter: SetterId,
    echo: bool,
    peer: Arc<Mutex<PeerState>>,
    out: mpsc::UnboundedSender<String>,
    binary: bool,
) -> impl FnMut(&ChangeEvent, &Document) + Send + 'static {
    move |change, doc| {
        if change.setter == Some(setter) && !echo {
            return;
        }
        let mut state = match peer.lock() {
            Ok(state) => state,
            Err(_) => {
                log::error!("Peer state lock poisoned; dropping event {}", change.seq);
                return;
            }
        };
        match state.encode_event(change, doc, binary) {
            Ok(frame) => {
                if out.send(frame).is_err() {
                    log::debug!("Outbound queue closed; dropping event {}", change.seq);
                }
            }
            Err(e) => log::error!("Failed to encode {} event: {}", change.event.kind(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelRegistry;
    use crate::wire::Value;
    use serde_json::json;
    use uuid::Uuid;

    fn registry() -> Arc<ModelRegistry> {
        let registry = ModelRegistry::with_builtins();
        registry
            .register(
                &ModelDef::new("Label")
                    .module("widgets")
                    .extends("Model", None)
                    .property("text", json!("String"), Some(json!(""))),
            )
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_message_shapes() {
        let request = Message::request("t1", methods::PULL, json!({"session_id": "s"}));
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"type": "request", "token": "t1", "method": "pull", "params": {"session_id": "s"}})
        );
        let reply = Message::reply_err("t1", "nope");
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"type": "reply", "token": "t1", "error": "nope"})
        );
        let decoded = Message::decode(r#"{"type":"reply","token":"t2","result":{}}"#).unwrap();
        assert_eq!(decoded, Message::reply_ok("t2", json!({})));
        assert!(matches!(Message::decode("{\"type\":\"shout\"}"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_event_carries_new_models_and_types_once() {
        let mut doc = Document::new(registry());
        let label = doc.create_model("widgets.Label", Vec::new()).unwrap();
        let mut peer = PeerState::default();

        let added = ChangeEvent {
            seq: 1,
            setter: None,
            event: DocumentEvent::RootAdded { model: label.clone() },
        };
        let first = Message::decode(&peer.encode_event(&added, &doc, true).unwrap()).unwrap();
        match first {
            Message::Event { seq, event, defs } => {
                assert_eq!(seq, 1);
                assert_eq!(event["model"]["name"], json!("widgets.Label"));
                assert_eq!(defs.len(), 1);
                assert_eq!(defs[0].qualified_name(), "widgets.Label");
            }
            other => panic!("expected an event, got {:?}", other),
        }

        let changed = ChangeEvent {
            seq: 2,
            setter: None,
            event: DocumentEvent::ModelChanged {
                model: label.clone(),
                attr: "text".to_string(),
                new: Value::string("hi"),
            },
        };
        let second = Message::decode(&peer.encode_event(&changed, &doc, true).unwrap()).unwrap();
        match second {
            Message::Event { seq, event, defs } => {
                assert_eq!(seq, 2);
                assert_eq!(event["model"], json!({"type": "object", "id": label.as_str()}));
                assert!(defs.is_empty());
            }
            other => panic!("expected an event, got {:?}", other),
        }
    }

    #[test]
    fn test_inbound_events_apply_once() {
        let mut sender_doc = Document::new(registry());
        let label = sender_doc.create_model("widgets.Label", Vec::new()).unwrap();
        let mut outbound = PeerState::default();
        let added = ChangeEvent {
            seq: 1,
            setter: None,
            event: DocumentEvent::RootAdded { model: label.clone() },
        };
        let frame = outbound.encode_event(&added, &sender_doc, true).unwrap();

        let (seq, event, defs) = match Message::decode(&frame).unwrap() {
            Message::Event { seq, event, defs } => (seq, event, defs),
            other => panic!("expected an event, got {:?}", other),
        };
        let mut receiver = Document::new(Arc::new(ModelRegistry::with_builtins()));
        let inbound = Mutex::new(PeerState::default());
        let setter = Uuid::new_v4();

        assert!(apply_inbound(&inbound, seq, &event, &defs, &mut receiver, setter).unwrap());
        assert!(!apply_inbound(&inbound, seq, &event, &defs, &mut receiver, setter).unwrap());
        assert_eq!(receiver.roots(), &[label]);
        assert!(receiver.registry().contains("widgets.Label"));
    }

    fn event_parts(frame: &str) -> (u64, Json, Vec<ModelDef>) {
        match Message::decode(frame).unwrap() {
            Message::Event { seq, event, defs } => (seq, event, defs),
            other => panic!("expected an event, got {:?}", other),
        }
    }

    #[test]
    fn test_rejected_inbound_event_leaves_no_trace() {
        let mut sender = Document::new(registry());
        let data = Value::dict([("x", Value::List(vec![Value::Int(1)]))]);
        let source = sender
            .create_model("ColumnDataSource", vec![("data".to_string(), data)])
            .unwrap();
        let label = sender.create_model("widgets.Label", Vec::new()).unwrap();
        let mut outbound = PeerState::default();
        let mut receiver = Document::new(Arc::new(ModelRegistry::with_builtins()));
        let inbound = Mutex::new(PeerState::default());
        let setter = Uuid::new_v4();

        let added = ChangeEvent {
            seq: 1,
            setter: None,
            event: DocumentEvent::RootAdded { model: source.clone() },
        };
        let (seq, event, defs) = event_parts(&outbound.encode_event(&added, &sender, true).unwrap());
        assert!(apply_inbound(&inbound, seq, &event, &defs, &mut receiver, setter).unwrap());
        let before = receiver.models().len();

        // the label travels inside a stream whose columns do not match
        let bad = ChangeEvent {
            seq: 2,
            setter: None,
            event: DocumentEvent::ColumnsStreamed {
                model: source.clone(),
                attr: "data".to_string(),
                data: [(Value::string("y"), Value::List(vec![Value::Ref(label.clone())]))]
                    .into_iter()
                    .collect(),
                rollover: None,
            },
        };
        let (seq, event, defs) = event_parts(&outbound.encode_event(&bad, &sender, true).unwrap());
        assert_eq!(seq, 2);
        assert!(matches!(
            apply_inbound(&inbound, seq, &event, &defs, &mut receiver, setter),
            Err(ProtocolError::Document(DocumentError::ColumnSetMismatch { .. }))
        ));
        assert_eq!(receiver.models().len(), before);
        assert!(receiver.get_model(&label).is_none());

        // the same seq is still accepted once it carries a valid change
        let good = ChangeEvent {
            seq: 3,
            setter: None,
            event: DocumentEvent::ColumnsStreamed {
                model: source.clone(),
                attr: "data".to_string(),
                data: [(Value::string("x"), Value::List(vec![Value::Int(2)]))]
                    .into_iter()
                    .collect(),
                rollover: None,
            },
        };
        let (_, event, defs) = event_parts(&outbound.encode_event(&good, &sender, true).unwrap());
        assert!(apply_inbound(&inbound, seq, &event, &defs, &mut receiver, setter).unwrap());
        assert!(!apply_inbound(&inbound, seq, &event, &defs, &mut receiver, setter).unwrap());
        let column = receiver.get_model(&source).unwrap().get("data").cloned();
        assert_eq!(
            column,
            Some(Value::dict([("x", Value::List(vec![Value::Int(1), Value::Int(2)]))]))
        );
    }

    #[test]
    fn test_forwarder_suppresses_own_echo() {
        let mut doc = Document::new(registry());
        let label = doc.create_model("widgets.Label", Vec::new()).unwrap();
        let setter = Uuid::new_v4();
        let peer = Arc::new(Mutex::new(PeerState::new(
            [label.clone()].into_iter().collect(),
            HashSet::new(),
        )));
        let (tx, mut rx) = mpsc::unbounded_channel();
        doc.on_change(forwarder(setter, false, Arc::clone(&peer), tx, true));

        let inbound = DocumentEvent::ModelChanged {
            model: label.clone(),
            attr: "text".to_string(),
            new: Value::string("from peer"),
        };
        doc.apply(inbound, Some(setter)).unwrap();
        assert!(rx.try_recv().is_err());

        doc.set_attr(&label, "text", "local").unwrap();
        let frame = rx.try_recv().unwrap();
        match Message::decode(&frame).unwrap() {
            Message::Event { event, .. } => assert_eq!(event["new"], json!("local")),
            other => panic!("expected an event, got {:?}", other),
        }
    }
}
