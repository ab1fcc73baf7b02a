//! 通道上传输的帧格式。
//!
//! 所有帧以一字节类型开头，整数一律大端。数据帧的负载位于帧尾，解码时以零拷贝切片取出。

use crate::address::{WorkerAddress, ensure};
use crate::config::Features;
use crate::error::{EndpointError, ErrorKind, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const CONN_REQUEST: u8 = 1;
const CONN_REPLY: u8 = 2;
const CONN_REJECT: u8 = 3;
const EAGER: u8 = 4;
const FRAG_FIRST: u8 = 5;
const FRAG_NEXT: u8 = 6;
const DISCONNECT: u8 = 7;

pub(crate) const EAGER_HEADER_LEN: usize = 1 + 8 + 8;
pub(crate) const FRAG_FIRST_HEADER_LEN: usize = 1 + 8 + 8 + 8 + 8;
pub(crate) const FRAG_NEXT_HEADER_LEN: usize = 1 + 8 + 8 + 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    ConnRequest {
        client_ep: u64,
        features: Features,
        address: WorkerAddress,
    },
    ConnReply {
        client_ep: u64,
        server_ep: u64,
        address: WorkerAddress,
    },
    ConnReject {
        client_ep: u64,
        kind: ErrorKind,
        reason: String,
    },
    Eager {
        sender: u64,
        tag: u64,
        payload: Bytes,
    },
    FragFirst {
        sender: u64,
        msg_id: u64,
        tag: u64,
        total: u64,
        chunk: Bytes,
    },
    FragNext {
        sender: u64,
        msg_id: u64,
        offset: u64,
        chunk: Bytes,
    },
    Disconnect {
        dest_ep: u64,
    },
}

impl Frame {
    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Frame::ConnRequest {
                client_ep,
                features,
                address,
            } => {
                buf.reserve(1 + 8 + 4 + address.encoded_len());
                buf.put_u8(CONN_REQUEST);
                buf.put_u64(*client_ep);
                buf.put_u32(features.bits());
                address.encode_into(&mut buf);
            }
            Frame::ConnReply {
                client_ep,
                server_ep,
                address,
            } => {
                buf.reserve(1 + 16 + address.encoded_len());
                buf.put_u8(CONN_REPLY);
                buf.put_u64(*client_ep);
                buf.put_u64(*server_ep);
                address.encode_into(&mut buf);
            }
            Frame::ConnReject {
                client_ep,
                kind,
                reason,
            } => {
                let reason = &reason.as_bytes()[..reason.len().min(u16::MAX as usize)];
                buf.put_u8(CONN_REJECT);
                buf.put_u64(*client_ep);
                buf.put_u8(kind.to_wire());
                buf.put_u16(reason.len() as u16);
                buf.put_slice(reason);
            }
            Frame::Eager {
                sender,
                tag,
                payload,
            } => {
                buf.reserve(EAGER_HEADER_LEN + payload.len());
                buf.put_u8(EAGER);
                buf.put_u64(*sender);
                buf.put_u64(*tag);
                buf.put_slice(payload);
            }
            Frame::FragFirst {
                sender,
                msg_id,
                tag,
                total,
                chunk,
            } => {
                buf.reserve(FRAG_FIRST_HEADER_LEN + chunk.len());
                buf.put_u8(FRAG_FIRST);
                buf.put_u64(*sender);
                buf.put_u64(*msg_id);
                buf.put_u64(*tag);
                buf.put_u64(*total);
                buf.put_slice(chunk);
            }
            Frame::FragNext {
                sender,
                msg_id,
                offset,
                chunk,
            } => {
                buf.reserve(FRAG_NEXT_HEADER_LEN + chunk.len());
                buf.put_u8(FRAG_NEXT);
                buf.put_u64(*sender);
                buf.put_u64(*msg_id);
                buf.put_u64(*offset);
                buf.put_slice(chunk);
            }
            Frame::Disconnect { dest_ep } => {
                buf.put_u8(DISCONNECT);
                buf.put_u64(*dest_ep);
            }
        }
        buf.freeze()
    }

    pub(crate) fn decode(mut buf: Bytes) -> Result<Frame> {
        ensure(&buf, 1, "frame type")?;
        let frame = match buf.get_u8() {
            CONN_REQUEST => {
                ensure(&buf, 12, "connection request")?;
                let client_ep = buf.get_u64();
                let features = Features::from_bits_truncate(buf.get_u32());
                let address = WorkerAddress::decode_from(&mut buf)?;
                Frame::ConnRequest {
                    client_ep,
                    features,
                    address,
                }
            }
            CONN_REPLY => {
                ensure(&buf, 16, "connection reply")?;
                let client_ep = buf.get_u64();
                let server_ep = buf.get_u64();
                let address = WorkerAddress::decode_from(&mut buf)?;
                Frame::ConnReply {
                    client_ep,
                    server_ep,
                    address,
                }
            }
            CONN_REJECT => {
                ensure(&buf, 11, "connection reject")?;
                let client_ep = buf.get_u64();
                let raw_kind = buf.get_u8();
                let kind = ErrorKind::from_wire(raw_kind).ok_or_else(|| {
                    EndpointError::protocol(format!("unknown reject kind {raw_kind}"))
                })?;
                let len = buf.get_u16() as usize;
                ensure(&buf, len, "reject reason")?;
                let reason = String::from_utf8_lossy(&buf.split_to(len)).into_owned();
                Frame::ConnReject {
                    client_ep,
                    kind,
                    reason,
                }
            }
            EAGER => {
                ensure(&buf, EAGER_HEADER_LEN - 1, "eager header")?;
                let sender = buf.get_u64();
                let tag = buf.get_u64();
                Frame::Eager {
                    sender,
                    tag,
                    payload: buf.split_off(0),
                }
            }
            FRAG_FIRST => {
                ensure(&buf, FRAG_FIRST_HEADER_LEN - 1, "first fragment header")?;
                let sender = buf.get_u64();
                let msg_id = buf.get_u64();
                let tag = buf.get_u64();
                let total = buf.get_u64();
                Frame::FragFirst {
                    sender,
                    msg_id,
                    tag,
                    total,
                    chunk: buf.split_off(0),
                }
            }
            FRAG_NEXT => {
                ensure(&buf, FRAG_NEXT_HEADER_LEN - 1, "fragment header")?;
                let sender = buf.get_u64();
                let msg_id = buf.get_u64();
                let offset = buf.get_u64();
                Frame::FragNext {
                    sender,
                    msg_id,
                    offset,
                    chunk: buf.split_off(0),
                }
            }
            DISCONNECT => {
                ensure(&buf, 8, "disconnect")?;
                Frame::Disconnect {
                    dest_ep: buf.get_u64(),
                }
            }
            other => {
                return Err(EndpointError::protocol(format!(
                    "unknown frame type {other}"
                )));
            }
        };
        if !matches!(
            frame,
            Frame::Eager { .. } | Frame::FragFirst { .. } | Frame::FragNext { .. }
        ) && buf.has_remaining()
        {
            return Err(EndpointError::protocol("trailing bytes after control frame"));
        }
        Ok(frame)
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Frame::ConnRequest { .. } => "conn_request",
            Frame::ConnReply { .. } => "conn_reply",
            Frame::ConnReject { .. } => "conn_reject",
            Frame::Eager { .. } => "eager",
            Frame::FragFirst { .. } => "frag_first",
            Frame::FragNext { .. } => "frag_next",
            Frame::Disconnect { .. } => "disconnect",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::IfaceAddress;
    use crate::transport::Capabilities;

    #[test]
    fn request_carries_features_and_address() {
        let address = WorkerAddress::new(
            42,
            vec![IfaceAddress {
                name: "mem".into(),
                caps: Capabilities::AM,
                addr: Bytes::from_static(b"0123456789abcdef"),
            }],
        );
        let frame = Frame::ConnRequest {
            client_ep: 9,
            features: Features::TAG | Features::RMA,
            address: address.clone(),
        };
        let decoded = Frame::decode(frame.encode()).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn payload_is_sliced_from_the_frame() {
        let frame = Frame::FragNext {
            sender: 1,
            msg_id: 2,
            offset: 4096,
            chunk: Bytes::from(vec![7u8; 100]),
        };
        let encoded = frame.encode();
        assert_eq!(encoded.len(), FRAG_NEXT_HEADER_LEN + 100);
        match Frame::decode(encoded).expect("decode") {
            Frame::FragNext { offset, chunk, .. } => {
                assert_eq!(offset, 4096);
                assert_eq!(chunk.len(), 100);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn empty_eager_payload_is_allowed() {
        let frame = Frame::Eager {
            sender: 3,
            tag: 1,
            payload: Bytes::new(),
        };
        assert_eq!(Frame::decode(frame.encode()).expect("decode"), frame);
    }

    #[test]
    fn malformed_frames_are_protocol_violations() {
        for raw in [
            Bytes::new(),
            Bytes::from_static(&[99]),
            Bytes::from_static(&[DISCONNECT, 0, 0]),
            Bytes::from_static(&[CONN_REJECT, 0, 0, 0, 0, 0, 0, 0, 1, 200, 0, 0]),
        ] {
            let err = Frame::decode(raw).expect_err("malformed");
            assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        }
    }

    #[test]
    fn reject_round_trips_kind() {
        let frame = Frame::ConnReject {
            client_ep: 5,
            kind: ErrorKind::AddressTooLarge,
            reason: "server address exceeds bootstrap capacity".into(),
        };
        assert_eq!(Frame::decode(frame.encode()).expect("decode"), frame);
    }
}
