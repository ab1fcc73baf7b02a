use crate::{
    backpressure::{BackpressureState, WriteReadiness},
    error::{self, CONFIGURE, map_io_error},
    util::{FrameDecoder, frame_header},
};
use bytes::{Buf, Bytes};
use mio::{Token, net::TcpStream};
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use spark_endpoint::EndpointError;
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
    time::Duration,
};

const READ_CHUNK: usize = 16 * 1024;

/// TCP 套接字级配置项，实现对内核行为的显式控制。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将“关闭时是否等待未发送数据”“是否禁用 Nagle”显式配置化，
///   避免调用方直接操作 `socket2` 或平台相关常量。
///
/// ## 核心逻辑（How）
/// - `linger_ms` 为 `Some(ms)` 时通过 `socket2::SockRef::set_linger` 设置 `SO_LINGER`，
///   `close` 在超时后未完成就发送 RST；`None` 遵循内核默认策略；
/// - `nodelay` 默认开启：控制帧与小消息不应等待合并。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - `SO_LINGER` 在不同平台的精度不同（Linux 取整到秒），测试与生产环境需选择合适超时。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpSocketConfig {
    pub linger_ms: Option<u64>,
    pub nodelay: bool,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            linger_ms: None,
            nodelay: true,
        }
    }
}

impl TcpSocketConfig {
    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger_ms = linger.map(|value| u64::try_from(value.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger_ms.map(Duration::from_millis)
    }

    fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        SockRef::from(stream).set_linger(self.linger())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChannelState {
    /// 非阻塞连接进行中，等待首个可写事件。
    Connecting,
    Open,
    /// 已被 Worker 释放，只剩写队列待发送。
    Draining,
}

/// 一次读事件的结果。
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    Open,
    /// 对端关闭；在此之前读到的帧已经交出。
    Closed,
}

/// 单条 TCP 连接：非阻塞读写、长度前缀分帧与背压统计。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 每条连接归所属接口独占，由 Worker 的 progress 线程驱动，无需任何锁；
/// - 写路径先入队再尽力写出，`WouldBlock` 后等待下一次可写事件继续。
///
/// ## 契约 (What)
/// - 连接以 `READABLE | WRITABLE` 边沿触发注册，因此读与写都必须推进到 `WouldBlock`；
/// - `enqueue` 接收整帧，帧头与负载作为两个 `Bytes` 入队，不复制负载。
#[derive(Debug)]
pub(crate) struct TcpChannel {
    pub stream: TcpStream,
    pub token: Option<Token>,
    pub state: ChannelState,
    pub peer_addr: SocketAddr,
    decoder: FrameDecoder,
    write_queue: VecDeque<Bytes>,
    queued_bytes: usize,
    backpressure: BackpressureState,
}

impl TcpChannel {
    /// 发起非阻塞连接。
    pub(crate) fn connect(
        addr: SocketAddr,
        max_frame_len: usize,
        high_watermark: usize,
    ) -> Result<Self, EndpointError> {
        let stream = TcpStream::connect(addr).map_err(|err| map_io_error(error::CONNECT, err))?;
        Ok(Self::with_state(
            stream,
            addr,
            ChannelState::Connecting,
            max_frame_len,
            high_watermark,
        ))
    }

    pub(crate) fn accepted(
        stream: TcpStream,
        peer_addr: SocketAddr,
        config: &TcpSocketConfig,
        max_frame_len: usize,
        high_watermark: usize,
    ) -> Result<Self, EndpointError> {
        config
            .apply(&stream)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        Ok(Self::with_state(
            stream,
            peer_addr,
            ChannelState::Open,
            max_frame_len,
            high_watermark,
        ))
    }

    fn with_state(
        stream: TcpStream,
        peer_addr: SocketAddr,
        state: ChannelState,
        max_frame_len: usize,
        high_watermark: usize,
    ) -> Self {
        Self {
            stream,
            token: None,
            state,
            peer_addr,
            decoder: FrameDecoder::new(max_frame_len),
            write_queue: VecDeque::new(),
            queued_bytes: 0,
            backpressure: BackpressureState::new(high_watermark),
        }
    }

    /// 检查非阻塞连接是否完成；`Ok(false)` 表示仍在进行中（伪唤醒）。
    pub(crate) fn finish_connect(
        &mut self,
        config: &TcpSocketConfig,
    ) -> Result<bool, EndpointError> {
        if let Some(err) = self
            .stream
            .take_error()
            .map_err(|err| map_io_error(error::CONNECT, err))?
        {
            return Err(map_io_error(error::CONNECT, err));
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                config
                    .apply(&self.stream)
                    .map_err(|err| map_io_error(CONFIGURE, err))?;
                self.state = ChannelState::Open;
                Ok(true)
            }
            Err(err)
                if err.kind() == io::ErrorKind::NotConnected
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(false)
            }
            Err(err) => Err(map_io_error(error::CONNECT, err)),
        }
    }

    pub(crate) fn readiness(&self) -> WriteReadiness {
        self.backpressure.readiness(self.queued_bytes)
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.write_queue.is_empty()
    }

    pub(crate) fn enqueue(&mut self, frame: Bytes) {
        self.queued_bytes += frame.len() + crate::util::HEADER_LEN;
        self.write_queue.push_back(frame_header(frame.len()));
        if !frame.is_empty() {
            self.write_queue.push_back(frame);
        }
    }

    /// 尽力写出队列，直到清空或 `WouldBlock`。
    pub(crate) fn flush(&mut self) -> Result<(), EndpointError> {
        while let Some(front) = self.write_queue.front_mut() {
            match self.stream.write(front) {
                Ok(0) => {
                    return Err(map_io_error(
                        error::WRITE,
                        io::Error::from(io::ErrorKind::WriteZero),
                    ));
                }
                Ok(written) => {
                    tracing::trace!(len = written, peer = %self.peer_addr, "wrote to socket");
                    self.queued_bytes -= written;
                    front.advance(written);
                    if front.is_empty() {
                        self.write_queue.pop_front();
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.backpressure.on_would_block();
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(map_io_error(error::WRITE, err)),
            }
        }
        self.backpressure.on_drained();
        Ok(())
    }

    /// 读到 `WouldBlock` 为止，把完整帧追加到 `frames`。
    pub(crate) fn read_frames(
        &mut self,
        frames: &mut Vec<Bytes>,
    ) -> Result<ReadOutcome, EndpointError> {
        let mut chunk = [0u8; READ_CHUNK];
        let outcome = loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => break ReadOutcome::Closed,
                Ok(read) => {
                    tracing::trace!(len = read, peer = %self.peer_addr, "read from socket");
                    self.decoder.extend(&chunk[..read]);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break ReadOutcome::Open,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.drain_decoder(frames)?;
                    return Err(map_io_error(error::READ, err));
                }
            }
        };
        self.drain_decoder(frames)?;
        Ok(outcome)
    }

    fn drain_decoder(&mut self, frames: &mut Vec<Bytes>) -> Result<(), EndpointError> {
        while let Some(frame) = self.decoder.next_frame()? {
            frames.push(frame);
        }
        Ok(())
    }

    /// 关闭写方向，通知对端不再有数据。
    pub(crate) fn shutdown_write(&self) {
        if let Err(err) = self.stream.shutdown(std::net::Shutdown::Write) {
            tracing::debug!(peer = %self.peer_addr, ?err, "tcp shutdown failed");
        }
    }
}
