#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-transport-mem: 进程内邮箱传输。"]
#![doc = ""]
#![doc = "== 能力 =="]
#![doc = "在 Worker 地址中发布 `fabric ‖ iface` 条目，对端据此直接开通道；同时声明主动消息与全部远程访问能力，"]
#![doc = "优先级高于网络传输，因此同一进程内的端点会在 wireup 后改走邮箱通道。"]
#![doc = ""]
#![doc = "== 唤醒 =="]
#![doc = "投递帧后通过接收方 Worker 的唤醒器通知其事件源，使阻塞在事件描述符上的线程返回。"]

mod fabric;
mod iface;

pub use fabric::Fabric;

use serde::{Deserialize, Serialize};
use spark_endpoint::{Capabilities, EventRegistry, Iface, Result, Transport, TransportCaps};
use std::sync::Arc;

pub(crate) const TRANSPORT_NAME: &str = "mem";

/// 进程内传输配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemConfig {
    /// 单个邮箱最多暂存的帧数，满时发送方收到背压。
    pub mailbox_capacity: usize,
    pub max_frame_len: usize,
    pub priority: u8,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 4096,
            max_frame_len: 256 * 1024,
            priority: 100,
        }
    }
}

/// 进程内传输工厂；同一 fabric 上打开的接口互相可达。
#[derive(Clone, Debug)]
pub struct MemTransport {
    fabric: Arc<Fabric>,
    config: MemConfig,
}

impl Default for MemTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTransport {
    /// 挂在进程共享 fabric 上的传输。
    pub fn new() -> Self {
        Self::with_fabric(Fabric::shared(), MemConfig::default())
    }

    pub fn with_fabric(fabric: Arc<Fabric>, config: MemConfig) -> Self {
        Self { fabric, config }
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn config(&self) -> &MemConfig {
        &self.config
    }
}

impl Transport for MemTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn caps(&self) -> TransportCaps {
        TransportCaps {
            flags: Capabilities::AM | Capabilities::RMA | Capabilities::AMO32 | Capabilities::AMO64,
            priority: self.config.priority,
            max_frame_len: self.config.max_frame_len,
            max_bootstrap_len: 0,
        }
    }

    fn open(&self, registry: &mut EventRegistry<'_>) -> Result<Box<dyn Iface>> {
        Ok(Box::new(iface::MemIface::open(
            Arc::clone(&self.fabric),
            &self.config,
            self.caps(),
            registry,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_partial_toml() {
        let config: MemConfig = toml::from_str("mailbox_capacity = 8\n").expect("valid mem config");
        assert_eq!(config.mailbox_capacity, 8);
        assert_eq!(config.priority, MemConfig::default().priority);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<MemConfig>("capacity = 8\n").is_err());
    }

    #[test]
    fn caps_cover_remote_access() {
        let caps = MemTransport::with_fabric(Fabric::isolated(), MemConfig::default()).caps();
        assert!(caps.flags.contains(Capabilities::RMA | Capabilities::AMO64));
        assert!(!caps.flags.contains(Capabilities::SOCKADDR));
        assert_eq!(caps.max_bootstrap_len, 0);
    }

    #[test]
    fn shared_fabric_is_a_singleton() {
        assert_eq!(Fabric::shared().id(), MemTransport::new().fabric().id());
    }
}
