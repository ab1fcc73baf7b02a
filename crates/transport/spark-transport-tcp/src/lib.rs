#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-transport-tcp: 基于 mio 的非阻塞 TCP 传输。"]
#![doc = ""]
#![doc = "== 能力 =="]
#![doc = "只提供主动消息与套接字地址能力：TCP 通道承载 wireup 引导与标签消息，不支持 RMA/原子操作，"]
#![doc = "也不在 Worker 地址中发布条目（对端只能经套接字地址到达）。"]
#![doc = ""]
#![doc = "== 分帧 =="]
#![doc = "每帧以 4 字节大端长度前缀开头；声明长度超过 `max_frame_len` 的帧视为协议违规并关闭连接。"]

mod backpressure;
mod channel;
mod error;
mod iface;
mod listener;
mod util;

pub use channel::TcpSocketConfig;

use serde::{Deserialize, Serialize};
use spark_endpoint::{Capabilities, EventRegistry, Iface, Result, Transport, TransportCaps};
use std::net::SocketAddr;

pub(crate) const TRANSPORT_NAME: &str = "tcp";

/// TCP 传输配置。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - `max_bootstrap_len`：连接请求/回复可携带的最大字节数，超过时端点以 `AddressTooLarge` 失败；
/// - `max_frame_len`：单帧上限，发送分片大小据此收敛；
/// - `send_high_watermark`：单连接用户态写队列的高水位，超过后通道不再接收新帧；
/// - `ipv4`/`ipv6`：可服务的地址族。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpConfig {
    pub max_bootstrap_len: usize,
    pub max_frame_len: usize,
    pub send_high_watermark: usize,
    pub backlog: i32,
    pub ipv4: bool,
    pub ipv6: bool,
    pub socket: TcpSocketConfig,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_bootstrap_len: 1024,
            max_frame_len: 64 * 1024,
            send_high_watermark: 4 * 1024 * 1024,
            backlog: 1024,
            ipv4: true,
            ipv6: true,
            socket: TcpSocketConfig::default(),
        }
    }
}

/// TCP 传输工厂。
#[derive(Clone, Debug, Default)]
pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TcpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn caps(&self) -> TransportCaps {
        TransportCaps {
            flags: Capabilities::AM | Capabilities::SOCKADDR,
            priority: 10,
            max_frame_len: self.config.max_frame_len,
            max_bootstrap_len: self.config.max_bootstrap_len,
        }
    }

    fn serves(&self, addr: &SocketAddr) -> bool {
        match addr {
            SocketAddr::V4(_) => self.config.ipv4,
            SocketAddr::V6(_) => self.config.ipv6,
        }
    }

    fn open(&self, _registry: &mut EventRegistry<'_>) -> Result<Box<dyn Iface>> {
        Ok(Box::new(iface::TcpIface::new(self.config.clone(), self.caps())))
    }
}
