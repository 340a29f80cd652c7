use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::node::{NodeId, NodeInfo, NODE_ID_LEN};

// Packet discriminators.
const PACKET_QUERY: u8 = 0;
const PACKET_RESPONSE: u8 = 1;
const PACKET_ERROR: u8 = 2;

// Query and response subtypes.
const TYPE_PING: u8 = 0;
const TYPE_FIND: u8 = 1;
const TYPE_STORE: u8 = 2;

// Find modes.
const MODE_NODE: u8 = 0;
const MODE_VALUE: u8 = 1;

// Address family tags in node descriptors.
const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet truncated")]
    Truncated,

    #[error("invalid packet discriminator: {0}")]
    InvalidPacket(u8),

    #[error("invalid query type: {0}")]
    InvalidQuery(u8),

    #[error("invalid response type: {0}")]
    InvalidResponse(u8),

    #[error("invalid find mode: {0}")]
    InvalidFindMode(u8),

    #[error("invalid address family: {0}")]
    InvalidFamily(u8),

    #[error("varint overflows 64 bits")]
    InvalidVarint,

    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),

    #[error("field of {0} bytes exceeds its length prefix")]
    FieldTooLong(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindMode {

    // Locate the nodes closest to a target id.
    Node,

    // Locate value holders; the responder may hand back a store token.
    Value,
}

#[cfg_attr(test, derive(Clone))]
#[derive(Debug, PartialEq, Eq)]
pub enum QueryBody {

    // Probes a node for liveness.
    Ping,

    // Asks for the closest nodes to, or the holders of, a target id.
    Find { mode: FindMode, target: NodeId },

    // Asks the receiver to store the sender as a holder of key, proving a
    // previous find with the token it was issued.
    Store { token: Vec<u8>, key: NodeId, port: u16 },
}

#[cfg_attr(test, derive(Clone))]
#[derive(Debug, PartialEq, Eq)]
pub enum ResponseBody {

    Ping,

    // Closest nodes to the queried target.
    FindNode { nodes: Vec<NodeInfo> },

    // Value mode also carries the token for a follow-up store.
    FindValue { token: Vec<u8>, nodes: Vec<NodeInfo> },

    StoreAck,
}

// A DHT packet. The tag is an opaque byte string chosen by the querying side
// and echoed back in responses and errors to match up transactions.
#[cfg_attr(test, derive(Clone))]
#[derive(Debug, PartialEq, Eq)]
pub enum Packet {

    Query { tag: Vec<u8>, id: NodeId, body: QueryBody },

    Response { tag: Vec<u8>, id: NodeId, body: ResponseBody },

    Error { tag: Vec<u8>, id: NodeId, code: u64, message: Vec<u8> },

}

pub struct PacketCodec;

impl Encoder<Packet> for PacketCodec {

    type Error = CodecError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match packet {

            // query: <0><tag><id><subtype><args>
            Packet::Query { tag, id, body } => {
                dst.put_u8(PACKET_QUERY);
                put_short_bytes(dst, &tag)?;
                dst.extend_from_slice(id.as_bytes());
                match body {

                    QueryBody::Ping => dst.put_u8(TYPE_PING),

                    // find: <1><mode><target>
                    QueryBody::Find { mode, target } => {
                        dst.put_u8(TYPE_FIND);
                        dst.put_u8(mode_byte(mode));
                        dst.extend_from_slice(target.as_bytes());
                    }

                    // store: <2><token><key><port>
                    QueryBody::Store { token, key, port } => {
                        dst.put_u8(TYPE_STORE);
                        put_short_bytes(dst, &token)?;
                        dst.extend_from_slice(key.as_bytes());
                        dst.put_u16(port);
                    }
                }
            }

            // response: <1><tag><id><subtype><args>
            Packet::Response { tag, id, body } => {
                dst.put_u8(PACKET_RESPONSE);
                put_short_bytes(dst, &tag)?;
                dst.extend_from_slice(id.as_bytes());
                match body {

                    ResponseBody::Ping => dst.put_u8(TYPE_PING),

                    // find, node mode: <1><0><nodes>
                    ResponseBody::FindNode { nodes } => {
                        dst.put_u8(TYPE_FIND);
                        dst.put_u8(MODE_NODE);
                        put_nodes(dst, &nodes)?;
                    }

                    // find, value mode: <1><1><token><nodes>
                    ResponseBody::FindValue { token, nodes } => {
                        dst.put_u8(TYPE_FIND);
                        dst.put_u8(MODE_VALUE);
                        put_short_bytes(dst, &token)?;
                        put_nodes(dst, &nodes)?;
                    }

                    ResponseBody::StoreAck => dst.put_u8(TYPE_STORE),
                }
            }

            // error: <2><tag><id><code varint><message len u16><message>
            Packet::Error { tag, id, code, message } => {
                dst.put_u8(PACKET_ERROR);
                put_short_bytes(dst, &tag)?;
                dst.extend_from_slice(id.as_bytes());
                put_varint(dst, code);
                if message.len() > u16::MAX as usize {
                    return Err(CodecError::FieldTooLong(message.len()));
                }
                dst.put_u16(message.len() as u16);
                dst.extend_from_slice(&message);
            }
        }

        Ok(())
    }
}

impl Decoder for PacketCodec {

    type Item = Packet;
    type Error = CodecError;

    // Packets arrive one per datagram, so a short buffer is a malformed
    // packet rather than a partial read. A failed decode clears the buffer;
    // it never carries over into the next packet.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.is_empty() {
            return Ok(None);
        }

        match decode_packet(src) {
            Ok(packet) => {
                if !src.is_empty() {
                    let extra = src.len();
                    src.clear();
                    return Err(CodecError::TrailingBytes(extra));
                }
                Ok(Some(packet))
            }
            Err(e) => {
                src.clear();
                Err(e)
            }
        }
    }
}

fn decode_packet(src: &mut BytesMut) -> Result<Packet, CodecError> {

    match get_u8(src)? {

        PACKET_QUERY => {
            let tag = get_short_bytes(src)?;
            let id = get_node_id(src)?;
            let body = match get_u8(src)? {
                TYPE_PING => QueryBody::Ping,
                TYPE_FIND => QueryBody::Find {
                    mode: get_find_mode(src)?,
                    target: get_node_id(src)?,
                },
                TYPE_STORE => QueryBody::Store {
                    token: get_short_bytes(src)?,
                    key: get_node_id(src)?,
                    port: get_u16(src)?,
                },
                subtype => {
                    tracing::warn!("invalid query type: {}", subtype);
                    return Err(CodecError::InvalidQuery(subtype));
                }
            };
            Ok(Packet::Query { tag, id, body })
        }

        PACKET_RESPONSE => {
            let tag = get_short_bytes(src)?;
            let id = get_node_id(src)?;
            let body = match get_u8(src)? {
                TYPE_PING => ResponseBody::Ping,
                TYPE_FIND => match get_find_mode(src)? {
                    FindMode::Node => ResponseBody::FindNode { nodes: get_nodes(src)? },
                    FindMode::Value => ResponseBody::FindValue {
                        token: get_short_bytes(src)?,
                        nodes: get_nodes(src)?,
                    },
                },
                TYPE_STORE => ResponseBody::StoreAck,
                subtype => {
                    tracing::warn!("invalid response type: {}", subtype);
                    return Err(CodecError::InvalidResponse(subtype));
                }
            };
            Ok(Packet::Response { tag, id, body })
        }

        PACKET_ERROR => {
            let tag = get_short_bytes(src)?;
            let id = get_node_id(src)?;
            let code = get_varint(src)?;
            let len = get_u16(src)? as usize;
            ensure(src, len)?;
            let mut message = vec![0; len];
            src.copy_to_slice(&mut message);
            Ok(Packet::Error { tag, id, code, message })
        }

        disc => {
            tracing::warn!("invalid packet discriminator: {}", disc);
            Err(CodecError::InvalidPacket(disc))
        }
    }
}

fn mode_byte(mode: FindMode) -> u8 {
    match mode {
        FindMode::Node => MODE_NODE,
        FindMode::Value => MODE_VALUE,
    }
}

// Tags and tokens are short opaque byte strings with a one-byte length.
fn put_short_bytes(dst: &mut BytesMut, bytes: &[u8]) -> Result<(), CodecError> {
    if bytes.len() > u8::MAX as usize {
        return Err(CodecError::FieldTooLong(bytes.len()));
    }
    dst.put_u8(bytes.len() as u8);
    dst.extend_from_slice(bytes);
    Ok(())
}

// node list: <count u16> then per node <id><family><address><port>
fn put_nodes(dst: &mut BytesMut, nodes: &[NodeInfo]) -> Result<(), CodecError> {
    if nodes.len() > u16::MAX as usize {
        return Err(CodecError::FieldTooLong(nodes.len()));
    }
    dst.put_u16(nodes.len() as u16);
    for node in nodes {
        dst.extend_from_slice(node.id.as_bytes());
        match node.addr.ip() {
            IpAddr::V4(ip) => {
                dst.put_u8(FAMILY_V4);
                dst.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                dst.put_u8(FAMILY_V6);
                dst.extend_from_slice(&ip.octets());
            }
        }
        dst.put_u16(node.addr.port());
    }
    Ok(())
}

// Unsigned LEB128: seven value bits per byte, high bit marks continuation.
fn put_varint(dst: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

fn get_varint(src: &mut BytesMut) -> Result<u64, CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if shift > 63 {
            return Err(CodecError::InvalidVarint);
        }
        let byte = get_u8(src)?;
        if shift == 63 && byte & 0x7f > 1 {
            return Err(CodecError::InvalidVarint);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn ensure(src: &BytesMut, len: usize) -> Result<(), CodecError> {
    if src.remaining() < len {
        Err(CodecError::Truncated)
    } else {
        Ok(())
    }
}

fn get_u8(src: &mut BytesMut) -> Result<u8, CodecError> {
    ensure(src, 1)?;
    Ok(src.get_u8())
}

fn get_u16(src: &mut BytesMut) -> Result<u16, CodecError> {
    ensure(src, 2)?;
    Ok(src.get_u16())
}

fn get_short_bytes(src: &mut BytesMut) -> Result<Vec<u8>, CodecError> {
    let len = get_u8(src)? as usize;
    ensure(src, len)?;
    let mut bytes = vec![0; len];
    src.copy_to_slice(&mut bytes);
    Ok(bytes)
}

fn get_node_id(src: &mut BytesMut) -> Result<NodeId, CodecError> {
    ensure(src, NODE_ID_LEN)?;
    let mut id = [0u8; NODE_ID_LEN];
    src.copy_to_slice(&mut id);
    Ok(NodeId::from(id))
}

fn get_find_mode(src: &mut BytesMut) -> Result<FindMode, CodecError> {
    match get_u8(src)? {
        MODE_NODE => Ok(FindMode::Node),
        MODE_VALUE => Ok(FindMode::Value),
        mode => Err(CodecError::InvalidFindMode(mode)),
    }
}

fn get_nodes(src: &mut BytesMut) -> Result<Vec<NodeInfo>, CodecError> {
    let count = get_u16(src)? as usize;
    let mut nodes = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let id = get_node_id(src)?;
        let ip: IpAddr = match get_u8(src)? {
            FAMILY_V4 => {
                ensure(src, 4)?;
                let mut octets = [0u8; 4];
                src.copy_to_slice(&mut octets);
                Ipv4Addr::from(octets).into()
            }
            FAMILY_V6 => {
                ensure(src, 16)?;
                let mut octets = [0u8; 16];
                src.copy_to_slice(&mut octets);
                Ipv6Addr::from(octets).into()
            }
            family => return Err(CodecError::InvalidFamily(family)),
        };
        let port = get_u16(src)?;
        nodes.push(NodeInfo { id, addr: SocketAddr::new(ip, port) });
    }
    Ok(nodes)
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Packet::Query { id, body, .. } => match body {
                QueryBody::Ping => write!(f, "ping query from {}", id),
                QueryBody::Find { mode: FindMode::Node, target } => {
                    write!(f, "find node query from {} for {}", id, target)
                }
                QueryBody::Find { mode: FindMode::Value, target } => {
                    write!(f, "find value query from {} for {}", id, target)
                }
                QueryBody::Store { port, .. } => write!(f, "store query from {} for port {}", id, port),
            },
            Packet::Response { id, body, .. } => match body {
                ResponseBody::Ping => write!(f, "ping response from {}", id),
                ResponseBody::FindNode { nodes } => {
                    write!(f, "find node response from {} with {} nodes", id, nodes.len())
                }
                ResponseBody::FindValue { nodes, .. } => {
                    write!(f, "find value response from {} with {} nodes", id, nodes.len())
                }
                ResponseBody::StoreAck => write!(f, "store ack from {}", id),
            },
            Packet::Error { id, code, .. } => write!(f, "error {} from {}", code, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let mut buf = BytesMut::new();
        PacketCodec.encode(packet.clone(), &mut buf).unwrap();
        let decoded = PacketCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet, "decoded packet does not match encoded");
        assert!(buf.is_empty(), "decode left bytes in the buffer");
    }

    fn sample_nodes() -> Vec<NodeInfo> {
        vec![
            NodeInfo {
                id: NodeId::from([0x22; NODE_ID_LEN]),
                addr: "10.0.0.7:6881".parse().unwrap(),
            },
            NodeInfo {
                id: NodeId::from([0x33; NODE_ID_LEN]),
                addr: "[2001:db8::1]:51413".parse().unwrap(),
            },
        ]
    }

    #[test]
    fn test_query_roundtrip() {
        let id = NodeId::from([0x11; NODE_ID_LEN]);
        roundtrip(Packet::Query { tag: b"aa".to_vec(), id, body: QueryBody::Ping });
        roundtrip(Packet::Query {
            tag: b"ab".to_vec(),
            id,
            body: QueryBody::Find { mode: FindMode::Node, target: NodeId::from([0x44; NODE_ID_LEN]) },
        });
        roundtrip(Packet::Query {
            tag: b"ac".to_vec(),
            id,
            body: QueryBody::Find { mode: FindMode::Value, target: NodeId::random() },
        });
        roundtrip(Packet::Query {
            tag: vec![],
            id,
            body: QueryBody::Store {
                token: b"opaque-token".to_vec(),
                key: NodeId::random(),
                port: 6881,
            },
        });
    }

    #[test]
    fn test_response_roundtrip() {
        let id = NodeId::random();
        roundtrip(Packet::Response { tag: b"aa".to_vec(), id, body: ResponseBody::Ping });
        roundtrip(Packet::Response {
            tag: b"ab".to_vec(),
            id,
            body: ResponseBody::FindNode { nodes: vec![] },
        });
        roundtrip(Packet::Response {
            tag: b"ab".to_vec(),
            id,
            body: ResponseBody::FindNode { nodes: sample_nodes() },
        });
        roundtrip(Packet::Response {
            tag: b"ac".to_vec(),
            id,
            body: ResponseBody::FindValue { token: b"tok".to_vec(), nodes: sample_nodes() },
        });
        roundtrip(Packet::Response { tag: b"ad".to_vec(), id, body: ResponseBody::StoreAck });
    }

    #[test]
    fn test_error_roundtrip() {
        let id = NodeId::random();
        for code in [0u64, 127, 128, 300, u64::MAX] {
            roundtrip(Packet::Error {
                tag: b"er".to_vec(),
                id,
                code,
                message: b"generic error".to_vec(),
            });
        }
        roundtrip(Packet::Error { tag: vec![], id, code: 201, message: vec![] });
    }

    #[test]
    fn test_wire_layout() {
        // Locks the byte schedule for a ping query.
        let mut buf = BytesMut::new();
        let packet = Packet::Query {
            tag: vec![0xab, 0xcd],
            id: NodeId::from([0x11; NODE_ID_LEN]),
            body: QueryBody::Ping,
        };
        PacketCodec.encode(packet, &mut buf).unwrap();

        let mut expected = vec![0x00, 0x02, 0xab, 0xcd];
        expected.extend_from_slice(&[0x11; NODE_ID_LEN]);
        expected.push(0x00);
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn test_varint_layout() {
        let cases: [(u64, &[u8]); 4] = [
            (0, &[0x00]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (300, &[0xac, 0x02]),
        ];
        for (value, bytes) in cases {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            assert_eq!(&buf[..], bytes, "encoding of {}", value);
            assert_eq!(get_varint(&mut buf).unwrap(), value);
        }
    }

    #[test]
    fn test_varint_overflow() {
        // Eleven continuation bytes push past 64 bits.
        let mut buf = BytesMut::from(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01][..]);
        assert!(matches!(get_varint(&mut buf), Err(CodecError::InvalidVarint)));
    }

    #[test]
    fn test_decode_empty() {
        let mut buf = BytesMut::new();
        assert!(PacketCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_truncated() {
        let mut full = BytesMut::new();
        let packet = Packet::Response {
            tag: b"tx".to_vec(),
            id: NodeId::from([0x55; NODE_ID_LEN]),
            body: ResponseBody::FindValue { token: b"tok".to_vec(), nodes: sample_nodes() },
        };
        PacketCodec.encode(packet, &mut full).unwrap();

        // Every proper prefix is a malformed packet, never a partial read.
        for len in 1..full.len() {
            let mut prefix = BytesMut::from(&full[..len]);
            let err = PacketCodec.decode(&mut prefix).unwrap_err();
            assert!(matches!(err, CodecError::Truncated), "prefix of {} bytes", len);
            assert!(prefix.is_empty(), "failed decode must clear the buffer");
        }
    }

    #[test]
    fn test_decode_invalid_discriminator() {
        let mut buf = BytesMut::from(&[0x07, 0x00][..]);
        let err = PacketCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::InvalidPacket(0x07)));
    }

    #[test]
    fn test_decode_invalid_subtype() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x00);
        buf.put_u8(0x00);
        buf.extend_from_slice(&[0x11; NODE_ID_LEN]);
        buf.put_u8(0x09);
        let err = PacketCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::InvalidQuery(0x09)));
    }

    #[test]
    fn test_decode_invalid_family() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x01);
        buf.put_u8(0x01);
        buf.put_u8(b't');
        buf.extend_from_slice(&[0x11; NODE_ID_LEN]);
        buf.put_u8(0x01);
        buf.put_u8(0x00);
        buf.put_u16(1);
        buf.extend_from_slice(&[0x22; NODE_ID_LEN]);
        buf.put_u8(0x09);
        let err = PacketCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFamily(0x09)));
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut buf = BytesMut::new();
        let packet = Packet::Query {
            tag: b"aa".to_vec(),
            id: NodeId::random(),
            body: QueryBody::Ping,
        };
        PacketCodec.encode(packet, &mut buf).unwrap();
        buf.put_u8(0xff);
        let err = PacketCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::TrailingBytes(1)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_oversized_tag() {
        let mut buf = BytesMut::new();
        let packet = Packet::Query {
            tag: vec![0; 300],
            id: NodeId::random(),
            body: QueryBody::Ping,
        };
        let err = PacketCodec.encode(packet, &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FieldTooLong(300)));
    }
}
