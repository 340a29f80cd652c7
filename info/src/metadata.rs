use bytes::Bytes;
use crate::METADATA_BLOCK_SIZE;

// The bencoded info dictionary, sliced into the fixed-size blocks served
// over BEP-9 metadata exchange. Blocks are views into a single shared
// buffer, so handing them out is cheap.
#[derive(Debug, Clone)]
pub struct Metadata {
    raw: Bytes,
}

impl Metadata {

    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn num_blocks(&self) -> usize {
        (self.raw.len() + METADATA_BLOCK_SIZE - 1) / METADATA_BLOCK_SIZE
    }

    // Block idx covers bytes [idx * 16384, (idx + 1) * 16384) of the info
    // dictionary; only the final block may be short.
    pub fn block(&self, idx: usize) -> Option<Bytes> {
        if idx >= self.num_blocks() {
            return None;
        }
        let start = idx * METADATA_BLOCK_SIZE;
        let end = (start + METADATA_BLOCK_SIZE).min(self.raw.len());
        Some(self.raw.slice(start..end))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}
