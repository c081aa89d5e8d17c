//! meridian-services: sessions, streams and the peer protocol on top of them.

pub mod catalog;
pub mod dispatch;
pub mod handshake;
pub mod message;
pub mod mirror;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod session;
pub mod streams;

pub use catalog::{CatalogService, PieceRequest, RecentRequest};
pub use message::Message;
pub use mirror::{mirror, resume_mirror, HashList, MirrorError, MirrorProgress, PartialMirror};
pub use protocol::{NetworkPeer, ProtocolHandler, SessionHandler, Signer};
pub use server::{serve_connection, Server};
pub use session::{ConnectionHeader, Role, Session, SessionError, SessionManager};
pub use streams::{LogicalStream, SharedStream, StreamId, StreamTable};
