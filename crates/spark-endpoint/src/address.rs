use crate::error::{EndpointError, Result};
use crate::transport::Capabilities;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const ADDRESS_VERSION: u8 = 1;

/// Worker 地址：描述一个 Worker 可被哪些传输接口直接到达。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 服务端与客户端在 wireup 中交换各自的 Worker 地址，据此在两端做同样的通道选择；
/// - 也可以带外传递（例如探测路径），直接据此建立端点而无需套接字地址引导。
///
/// ## 契约 (What)
/// - 仅包含有可寻址地址的接口条目；只支持套接字地址的传输不出现在地址中；
/// - 编码格式：`version:u8 | uuid:u64 | count:u8 | { name_len:u8 name caps:u32 addr_len:u16 addr }*`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerAddress {
    uuid: u64,
    ifaces: Vec<IfaceAddress>,
}

/// Worker 地址中的单个接口条目。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IfaceAddress {
    pub name: String,
    pub caps: Capabilities,
    pub addr: Bytes,
}

impl WorkerAddress {
    pub fn new(uuid: u64, ifaces: Vec<IfaceAddress>) -> Self {
        Self { uuid, ifaces }
    }

    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    pub fn ifaces(&self) -> &[IfaceAddress] {
        &self.ifaces
    }

    /// 编码后的字节数。
    pub fn encoded_len(&self) -> usize {
        1 + 8
            + 1
            + self
                .ifaces
                .iter()
                .map(|entry| 1 + entry.name.len() + 4 + 2 + entry.addr.len())
                .sum::<usize>()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(raw);
        let address = Self::decode_from(&mut buf)?;
        if buf.has_remaining() {
            return Err(EndpointError::protocol("trailing bytes after worker address"));
        }
        Ok(address)
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(ADDRESS_VERSION);
        buf.put_u64(self.uuid);
        buf.put_u8(self.ifaces.len() as u8);
        for entry in &self.ifaces {
            buf.put_u8(entry.name.len() as u8);
            buf.put_slice(entry.name.as_bytes());
            buf.put_u32(entry.caps.bits());
            buf.put_u16(entry.addr.len() as u16);
            buf.put_slice(&entry.addr);
        }
    }

    pub(crate) fn decode_from(buf: &mut Bytes) -> Result<Self> {
        ensure(buf, 10, "worker address header")?;
        let version = buf.get_u8();
        if version != ADDRESS_VERSION {
            return Err(EndpointError::protocol(format!(
                "unsupported worker address version {version}"
            )));
        }
        let uuid = buf.get_u64();
        let count = buf.get_u8() as usize;
        let mut ifaces = Vec::with_capacity(count);
        for _ in 0..count {
            ensure(buf, 1, "interface name length")?;
            let name_len = buf.get_u8() as usize;
            ensure(buf, name_len + 6, "interface entry")?;
            let name = String::from_utf8(buf.split_to(name_len).to_vec())
                .map_err(|_| EndpointError::protocol("interface name is not utf-8"))?;
            let caps = Capabilities::from_bits_truncate(buf.get_u32());
            let addr_len = buf.get_u16() as usize;
            ensure(buf, addr_len, "interface address")?;
            let addr = buf.split_to(addr_len);
            ifaces.push(IfaceAddress { name, caps, addr });
        }
        Ok(Self { uuid, ifaces })
    }
}

pub(crate) fn ensure(buf: &Bytes, needed: usize, what: &'static str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(EndpointError::protocol(format!(
            "truncated {what}: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}
