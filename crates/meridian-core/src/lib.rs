//! meridian-core: shared types, wire format, piece chain and cryptographic
//! primitives. All other Meridian crates depend on this one.

pub mod config;
pub mod crypto;
pub mod piece;
pub mod record;
pub mod wire;

pub use crypto::{Identity, PublicKey};
pub use piece::{Collection, Piece, PieceError, PIECE_SIZE};
pub use record::Record;
pub use wire::MessageKind;
