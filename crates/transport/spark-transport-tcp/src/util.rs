use crate::error::FRAME_TOO_LARGE_CODE;
use bytes::{Buf, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use spark_endpoint::{EndpointError, ErrorKind};
use std::io;
use std::net::SocketAddr;

/// 帧长度前缀的字节数（大端 `u32`）。
pub(crate) const HEADER_LEN: usize = 4;

/// 以 socket2 创建非阻塞监听套接字。
///
/// 先于 `bind` 设置 `SO_REUSEADDR`，使刚关闭的端口可以立即复用；IPv6 套接字只监听 IPv6，
/// 避免与同端口的 IPv4 通配监听冲突。
pub(crate) fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

pub(crate) fn frame_header(len: usize) -> Bytes {
    Bytes::copy_from_slice(&(len as u32).to_be_bytes())
}

/// 从字节流中切分长度前缀帧。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - `extend` 追加任意切分的读取结果；`next_frame` 每次至多返回一个完整帧，
///   不足一帧时返回 `Ok(None)` 并保留缓冲；
/// - 声明长度超过 `max_frame_len` 视为协议违规，通道应被关闭。
#[derive(Debug)]
pub(crate) struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub(crate) fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Bytes>, EndpointError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if declared > self.max_frame_len {
            return Err(EndpointError::new(
                ErrorKind::ProtocolViolation,
                FRAME_TOO_LARGE_CODE,
                format!(
                    "peer announced a {declared} byte frame, limit is {}",
                    self.max_frame_len
                ),
            ));
        }
        if self.buf.len() < HEADER_LEN + declared {
            self.buf.reserve(HEADER_LEN + declared - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(declared).freeze()))
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.buf.len()
    }
}
