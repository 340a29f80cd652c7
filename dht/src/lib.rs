mod message;
mod node;

pub use message::{CodecError, FindMode, Packet, PacketCodec, QueryBody, ResponseBody};
pub use node::{NodeId, NodeInfo, NODE_ID_LEN};
