use std::net::SocketAddr;
use rand::Rng;

// Length in bytes of a node identifier (160 bits), sharing the metric space
// with infohashes.
pub const NODE_ID_LEN: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {

    pub fn random() -> Self {
        let mut id = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill(&mut id[..]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// A peer in the overlay: identifier plus reachable socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {

    pub id: NodeId,

    pub addr: SocketAddr,

}
