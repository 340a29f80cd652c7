mod de;
mod metadata;
mod metainfo;
mod pieces;
mod registry;
mod service;
mod tree;

// Size of the blocks requested from peers when downloading a piece.
pub const CHUNK_SIZE: usize = 0x4000;

// Size of the blocks served over BEP-9 metadata exchange.
pub const METADATA_BLOCK_SIZE: usize = 0x4000;

// Opaque torrent key, handed out by the embedding application.
pub type TorrentId = u32;

pub use metadata::Metadata;
pub use metainfo::{File, Info, MetaInfo, MetaInfoError};
pub use pieces::{byte_mask, Bitfield, PieceSet};
pub use registry::{RegistryError, ServiceRegistry, AWAIT_TIMEOUT};
pub use service::{
    spawn, CommandToInfo, InfoError, InfoHandle, InfoTx, TorrentInfo, TreeEntry, ValidPieces,
};
pub use tree::{FileTree, Node, NodeKind};
