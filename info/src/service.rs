use std::sync::{Arc, RwLock};
use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use crate::{
    metadata::Metadata,
    metainfo::{MetaInfo, MetaInfoError},
    pieces::{byte_mask, PieceSet},
    tree::{FileTree, Node},
    CHUNK_SIZE,
};

#[derive(Debug, thiserror::Error)]
pub enum InfoError {

    #[error("invalid node id: {0}")]
    BadId(usize),

    #[error("metadata block index out of range: {0}")]
    BadPiece(usize),

    #[error("byte range at {start} of length {len} exceeds the file")]
    BadRange { start: u64, len: u64 },

    #[error("info service has shut down")]
    ServiceDropped,
}

impl<T> From<mpsc::error::SendError<T>> for InfoError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        InfoError::ServiceDropped
    }
}

impl From<oneshot::error::RecvError> for InfoError {
    fn from(_: oneshot::error::RecvError) -> Self {
        InfoError::ServiceDropped
    }
}

pub type Result<T> = std::result::Result<T, InfoError>;
pub type InfoTx = mpsc::UnboundedSender<CommandToInfo>;
pub type InfoRx = mpsc::UnboundedReceiver<CommandToInfo>;

// Supplies the current set of hash-verified pieces. Implemented by the
// download controller; queried when reporting per-node progress.
pub trait ValidPieces: Send + Sync {
    fn valid_pieces(&self) -> PieceSet;
}

impl ValidPieces for RwLock<PieceSet> {
    fn valid_pieces(&self) -> PieceSet {
        self.read().expect("piece set lock poisoned").clone()
    }
}

// One directory entry, shaped for UI trees.
#[derive(Debug, Clone)]
pub struct TreeEntry {

    pub id: usize,

    pub name: String,

    pub size: u64,

    // Number of descendants.
    pub capacity: usize,

    pub is_leaf: bool,

    // Downloaded fraction of the pieces covering this entry.
    pub progress: f64,

}

// Everything the query actor serves: the piece geometry, the file tree and
// the metadata block table. Built once from the metainfo before the task
// starts and never touched again.
#[derive(Debug)]
pub struct TorrentInfo {

    // Payload size, all files laid end to end.
    total_len: u64,

    // Nominal piece size. The trailing piece is usually a remainder, its
    // actual size kept in last_piece_len.
    piece_len: u64,

    last_piece_len: u64,

    num_pieces: usize,

    // Size of the blocks pieces are downloaded in.
    chunk_size: usize,

    // File and directory nodes, indexed by id.
    tree: FileTree,

    // Bencoded info dict, sliced for metadata exchange.
    metadata: Metadata,

}

impl TorrentInfo {

    pub fn new(metainfo: &MetaInfo) -> std::result::Result<Self, MetaInfoError> {
        let raw_info = metainfo.raw_info()?;
        let info = Self::from_parts(metainfo.piece_len(), metainfo.files(), raw_info);
        assert_eq!(
            info.num_pieces,
            metainfo.num_pieces(),
            "piece hash count disagrees with the file length sum",
        );
        Ok(info)
    }

    // Builds the tree and block table from raw parts, mainly split out for
    // tests that have no full metainfo at hand.
    pub fn from_parts(piece_len: u64, files: Vec<(String, u64)>, raw_info: Vec<u8>) -> Self {

        let tree = FileTree::build(piece_len, &files);
        let total_len = tree.root().size;
        let num_pieces = ((total_len + piece_len - 1) / piece_len) as usize;
        let last_piece_len = total_len - piece_len * (num_pieces as u64 - 1);

        Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            chunk_size: CHUNK_SIZE,
            tree,
            metadata: Metadata::new(raw_info),
        }
    }

    pub fn piece_size(&self) -> u64 { self.piece_len }

    pub fn chunk_size(&self) -> usize { self.chunk_size }

    pub fn num_pieces(&self) -> usize { self.num_pieces }

    pub fn total_len(&self) -> u64 { self.total_len }

    pub fn num_nodes(&self) -> usize { self.tree.len() }

    // Pieces are uniform apart from the trailing remainder piece.
    pub fn piece_len_at(&self, idx: usize) -> u64 {
        if idx == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    fn node(&self, id: usize) -> Result<&Node> {
        self.tree.get(id).ok_or(InfoError::BadId(id))
    }

    pub fn position(&self, id: usize) -> Result<u64> {
        Ok(self.node(id)?.offset)
    }

    pub fn size(&self, id: usize) -> Result<u64> {
        Ok(self.node(id)?.size)
    }

    pub fn file_name(&self, id: usize) -> Result<String> {
        Ok(self.node(id)?.path.clone())
    }

    // Joins the relative paths with ", ", a display convention relied on by
    // consumers.
    pub fn long_file_name(&self, ids: &[usize]) -> Result<String> {
        let mut names = Vec::with_capacity(ids.len());
        for &id in ids {
            names.push(self.node(id)?.path.clone());
        }
        Ok(names.join(", "))
    }

    pub fn tree_children(&self, id: usize, valid: &PieceSet) -> Result<Vec<TreeEntry>> {
        let node = self.node(id)?;
        let mut entries = Vec::with_capacity(node.children.len());
        for &child_id in &node.children {
            let child = self.node(child_id)?;
            let wanted = child.mask.count();
            let progress = if wanted == 0 {
                1.0
            } else {
                child.mask.intersection(valid).count() as f64 / wanted as f64
            };
            entries.push(TreeEntry {
                id: child_id,
                name: child.name.clone(),
                size: child.size,
                capacity: child.capacity,
                is_leaf: child.is_file(),
                progress,
            });
        }
        Ok(entries)
    }

    pub fn mask(&self, id: usize) -> Result<PieceSet> {
        Ok(self.node(id)?.mask.clone())
    }

    // Union of masks; an empty id list yields the empty set.
    pub fn mask_union(&self, ids: &[usize]) -> Result<PieceSet> {
        let mut union = PieceSet::new(self.num_pieces);
        for &id in ids {
            union.union_with(&self.node(id)?.mask);
        }
        Ok(union)
    }

    // Pieces covering bytes [start, start + len) within the node.
    pub fn mask_range(&self, id: usize, start: u64, len: u64) -> Result<PieceSet> {
        let node = self.node(id)?;
        if start + len > node.size {
            return Err(InfoError::BadRange { start, len });
        }
        Ok(byte_mask(node.offset + start, len, self.piece_len, self.total_len))
    }

    pub fn mask_to_filelist(&self, mask: &PieceSet) -> Vec<usize> {
        self.tree.mask_to_filelist(mask)
    }

    pub fn minimize_filelist(&self, ids: &[usize]) -> Vec<usize> {
        self.tree.minimize(ids)
    }

    pub fn metadata_size(&self) -> usize {
        self.metadata.len()
    }

    pub fn metadata_block(&self, idx: usize) -> Result<Bytes> {
        self.metadata.block(idx).ok_or(InfoError::BadPiece(idx))
    }
}

// Queries served by the info task. All of them are reads; the state is built
// before the task starts and never changes, so replies are consistent
// regardless of interleaving. Abandoned callers just drop the receiver.
pub enum CommandToInfo {

    PieceSize { tx: oneshot::Sender<u64> },

    ChunkSize { tx: oneshot::Sender<usize> },

    NumPieces { tx: oneshot::Sender<usize> },

    Position { id: usize, tx: oneshot::Sender<Result<u64>> },

    Size { id: usize, tx: oneshot::Sender<Result<u64>> },

    FileName { id: usize, tx: oneshot::Sender<Result<String>> },

    LongFileName { ids: Vec<usize>, tx: oneshot::Sender<Result<String>> },

    TreeChildren { id: usize, tx: oneshot::Sender<Result<Vec<TreeEntry>>> },

    Mask { id: usize, tx: oneshot::Sender<Result<PieceSet>> },

    MaskUnion { ids: Vec<usize>, tx: oneshot::Sender<Result<PieceSet>> },

    MaskRange { id: usize, start: u64, len: u64, tx: oneshot::Sender<Result<PieceSet>> },

    MaskToFilelist { mask: PieceSet, tx: oneshot::Sender<Vec<usize>> },

    MinimizeFilelist { ids: Vec<usize>, tx: oneshot::Sender<Vec<usize>> },

    MetadataSize { tx: oneshot::Sender<usize> },

    MetadataBlock { idx: usize, tx: oneshot::Sender<Result<Bytes>> },

    Shutdown,

}

pub struct InfoService {

    info: Arc<TorrentInfo>,

    // Download controller collaborator, consulted for progress reporting.
    valid: Arc<dyn ValidPieces>,

    info_rx: InfoRx,

}

// Setup and spawn the info task.
pub fn spawn(info: TorrentInfo, valid: Arc<dyn ValidPieces>) -> (JoinHandle<()>, InfoHandle) {
    let (info_tx, info_rx) = mpsc::unbounded_channel();
    let mut service = InfoService {
        info: Arc::new(info),
        valid,
        info_rx,
    };
    let handle = tokio::spawn(async move { service.run().await });
    (handle, InfoHandle { info_tx })
}

impl InfoService {

    #[tracing::instrument(name = "info", skip_all)]
    async fn run(&mut self) {
        tracing::info!(
            "info service started: {} nodes, {} pieces, {} metadata blocks",
            self.info.num_nodes(),
            self.info.num_pieces(),
            self.info.metadata.num_blocks(),
        );

        while let Some(cmd) = self.info_rx.recv().await {
            match cmd {

                CommandToInfo::PieceSize { tx } => { tx.send(self.info.piece_size()).ok(); }

                CommandToInfo::ChunkSize { tx } => { tx.send(self.info.chunk_size()).ok(); }

                CommandToInfo::NumPieces { tx } => { tx.send(self.info.num_pieces()).ok(); }

                CommandToInfo::Position { id, tx } => { tx.send(self.info.position(id)).ok(); }

                CommandToInfo::Size { id, tx } => { tx.send(self.info.size(id)).ok(); }

                CommandToInfo::FileName { id, tx } => { tx.send(self.info.file_name(id)).ok(); }

                CommandToInfo::LongFileName { ids, tx } => {
                    tx.send(self.info.long_file_name(&ids)).ok();
                }

                CommandToInfo::TreeChildren { id, tx } => {
                    let valid = self.valid.valid_pieces();
                    tx.send(self.info.tree_children(id, &valid)).ok();
                }

                CommandToInfo::Mask { id, tx } => { tx.send(self.info.mask(id)).ok(); }

                CommandToInfo::MaskUnion { ids, tx } => {
                    tx.send(self.info.mask_union(&ids)).ok();
                }

                CommandToInfo::MaskRange { id, start, len, tx } => {
                    tx.send(self.info.mask_range(id, start, len)).ok();
                }

                CommandToInfo::MaskToFilelist { mask, tx } => {
                    tx.send(self.info.mask_to_filelist(&mask)).ok();
                }

                CommandToInfo::MinimizeFilelist { ids, tx } => {
                    tx.send(self.info.minimize_filelist(&ids)).ok();
                }

                CommandToInfo::MetadataSize { tx } => { tx.send(self.info.metadata_size()).ok(); }

                CommandToInfo::MetadataBlock { idx, tx } => {
                    tx.send(self.info.metadata_block(idx)).ok();
                }

                CommandToInfo::Shutdown => {
                    tracing::info!("info service shutdown");
                    break;
                }
            }
        }
    }
}

// Cheap clonable handle for querying the info task.
#[derive(Debug, Clone)]
pub struct InfoHandle {
    info_tx: InfoTx,
}

impl InfoHandle {

    pub async fn piece_size(&self) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::PieceSize { tx })?;
        Ok(rx.await?)
    }

    pub async fn chunk_size(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::ChunkSize { tx })?;
        Ok(rx.await?)
    }

    pub async fn num_pieces(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::NumPieces { tx })?;
        Ok(rx.await?)
    }

    pub async fn position(&self, id: usize) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::Position { id, tx })?;
        rx.await?
    }

    pub async fn size(&self, id: usize) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::Size { id, tx })?;
        rx.await?
    }

    pub async fn file_name(&self, id: usize) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::FileName { id, tx })?;
        rx.await?
    }

    pub async fn long_file_name(&self, ids: Vec<usize>) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::LongFileName { ids, tx })?;
        rx.await?
    }

    pub async fn tree_children(&self, id: usize) -> Result<Vec<TreeEntry>> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::TreeChildren { id, tx })?;
        rx.await?
    }

    pub async fn mask(&self, id: usize) -> Result<PieceSet> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::Mask { id, tx })?;
        rx.await?
    }

    pub async fn mask_union(&self, ids: Vec<usize>) -> Result<PieceSet> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::MaskUnion { ids, tx })?;
        rx.await?
    }

    pub async fn mask_range(&self, id: usize, start: u64, len: u64) -> Result<PieceSet> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::MaskRange { id, start, len, tx })?;
        rx.await?
    }

    pub async fn mask_to_filelist(&self, mask: PieceSet) -> Result<Vec<usize>> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::MaskToFilelist { mask, tx })?;
        Ok(rx.await?)
    }

    pub async fn minimize_filelist(&self, ids: Vec<usize>) -> Result<Vec<usize>> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::MinimizeFilelist { ids, tx })?;
        Ok(rx.await?)
    }

    pub async fn metadata_size(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::MetadataSize { tx })?;
        Ok(rx.await?)
    }

    pub async fn metadata_block(&self, idx: usize) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(CommandToInfo::MetadataBlock { idx, tx })?;
        rx.await?
    }

    pub fn shutdown(&self) -> Result<()> {
        self.info_tx.send(CommandToInfo::Shutdown)?;
        Ok(())
    }
}
