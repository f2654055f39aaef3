// Docsync - Document synchronization for shared model graphs

pub mod buffer;
pub mod config;
pub mod document;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
pub mod wire;

pub use config::{Config, ServerConfig, SessionConfig};
pub use document::{ChangeEvent, DocJson, Document, DocumentError, DocumentEvent};
pub use model::{Model, ModelDef, ModelId};
pub use registry::ModelRegistry;
pub use server::SessionServer;
pub use session::{pull_session, pull_session_over, ClientSession, SessionError};
pub use wire::Value;
