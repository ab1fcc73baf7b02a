//! 传输协作者契约。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 端点引擎只关心“能否监听/连接某个套接字地址、能否向某个对端地址开通道、
//!   通道上能否收发一帧”，不关心底层是 TCP 还是进程内邮箱；
//! - 传输以两级对象出现：[`Transport`] 由 Context 共享，描述能力并为每个 Worker 打开一个
//!   [`Iface`]；`Iface` 归 Worker 独占，所有调用都发生在 Worker 的 progress 线程上。
//!
//! ## 契约 (What)
//! - 接口从不回调端点引擎，而是把结果写入 [`IfaceEvent`] 缓冲区，由 Worker 在 progress 中处理；
//! - `send` 对帧做整体接收：返回 [`SendStatus::Queued`] 表示帧已被接口接管，
//!   [`SendStatus::Busy`] 表示背压，调用方保留该帧稍后重试；
//! - 通道失败以 [`IfaceEvent::Failed`] 报告且每条通道最多一次，报告后通道已被接口回收。

use crate::config::Features;
use crate::error::Result;
use crate::wakeup::{EventRegistry, ReadyEvent};
use bitflags::bitflags;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

bitflags! {
    /// 传输的能力类别。
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        /// 主动消息：承载 wireup 控制帧与标签消息。
        const AM = 1 << 0;
        const RMA = 1 << 1;
        const AMO32 = 1 << 2;
        const AMO64 = 1 << 3;
        /// 可以按套接字地址监听与连接。
        const SOCKADDR = 1 << 4;
    }
}

impl Capabilities {
    /// 特性集合中需要专用通道的部分所对应的能力。
    pub fn for_remote_access(features: Features) -> Capabilities {
        let mut caps = Capabilities::empty();
        if features.contains(Features::RMA) {
            caps |= Capabilities::RMA;
        }
        if features.contains(Features::AMO32) {
            caps |= Capabilities::AMO32;
        }
        if features.contains(Features::AMO64) {
            caps |= Capabilities::AMO64;
        }
        caps
    }
}

/// 传输报告的能力描述。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportCaps {
    pub flags: Capabilities,
    /// 同一能力有多个候选时，优先级高者胜出。
    pub priority: u8,
    /// 单帧最大字节数。
    pub max_frame_len: usize,
    /// 引导阶段（连接请求）可携带的最大字节数；不支持套接字地址的传输为 0。
    pub max_bootstrap_len: usize,
}

/// 通道标识，仅在所属接口内唯一。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaneId(pub u64);

/// 监听者标识，仅在所属接口内唯一。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenId(pub u64);

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lane#{}", self.0)
    }
}

/// 发送结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    Queued,
    Busy,
}

/// 接口向 Worker 报告的事件。
#[derive(Debug)]
pub enum IfaceEvent {
    /// 监听者接受了一条新的引导连接。
    Accepted {
        listener: ListenId,
        lane: LaneId,
        peer: SocketAddr,
    },
    /// 主动发起的通道已可用。
    Connected { lane: LaneId },
    /// 收到一帧；无连接语义的传输（进程内邮箱）不提供 `lane`。
    Received { lane: Option<LaneId>, frame: Bytes },
    /// 通道失败，接口已回收该通道。
    Failed {
        lane: LaneId,
        error: crate::error::EndpointError,
    },
}

/// Context 级的传输工厂。
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// 稳定名称，同时用于配置选择与 Worker 地址中的条目匹配。
    fn name(&self) -> &'static str;

    fn caps(&self) -> TransportCaps;

    /// 是否能在给定套接字地址上监听或向其连接（地址族检查）。
    fn serves(&self, addr: &SocketAddr) -> bool {
        let _ = addr;
        false
    }

    /// 为一个 Worker 打开接口。
    fn open(&self, registry: &mut EventRegistry<'_>) -> Result<Box<dyn Iface>>;
}

/// Worker 独占的传输接口。
pub trait Iface: Send + fmt::Debug {
    fn name(&self) -> &'static str;

    fn caps(&self) -> &TransportCaps;

    /// 对端据以开通道的地址；仅支持套接字地址的接口返回 `None`。
    fn address(&self) -> Option<Bytes>;

    /// 对端地址是否可达。
    fn is_reachable(&self, peer: &[u8]) -> bool;

    /// 在套接字地址上监听，返回监听标识与实际绑定地址。
    fn listen(
        &mut self,
        addr: SocketAddr,
        registry: &mut EventRegistry<'_>,
    ) -> Result<(ListenId, SocketAddr)> {
        let _ = (addr, registry);
        Err(crate::error::EndpointError::unsupported(format!(
            "transport `{}` cannot listen on socket addresses",
            self.name()
        )))
    }

    fn close_listener(&mut self, id: ListenId, registry: &mut EventRegistry<'_>) {
        let _ = (id, registry);
    }

    /// 发起到套接字地址的引导连接；成功后以 [`IfaceEvent::Connected`] 通知。
    fn connect_sockaddr(
        &mut self,
        addr: SocketAddr,
        registry: &mut EventRegistry<'_>,
    ) -> Result<LaneId> {
        let _ = (addr, registry);
        Err(crate::error::EndpointError::unsupported(format!(
            "transport `{}` cannot connect to socket addresses",
            self.name()
        )))
    }

    /// 向对端接口地址开通道；成功后以 [`IfaceEvent::Connected`] 通知。
    fn connect_peer(&mut self, peer: &[u8], registry: &mut EventRegistry<'_>) -> Result<LaneId>;

    fn send(&mut self, lane: LaneId, frame: Bytes) -> Result<SendStatus>;

    /// 通道当前能否接收新帧而不触发背压。
    fn lane_ready(&self, lane: LaneId) -> bool;

    /// 关闭通道；`graceful` 时先发送完已排队的数据。
    fn close_lane(&mut self, lane: LaneId, graceful: bool, registry: &mut EventRegistry<'_>);

    /// 处理属于本接口的就绪事件。
    fn on_ready(
        &mut self,
        event: &ReadyEvent,
        registry: &mut EventRegistry<'_>,
        out: &mut Vec<IfaceEvent>,
    );

    /// 推进与就绪事件无关的内部工作（例如收取邮箱），返回处理的条目数。
    fn progress(
        &mut self,
        budget: usize,
        registry: &mut EventRegistry<'_>,
        out: &mut Vec<IfaceEvent>,
    ) -> usize;

    /// 是否有无需等待事件即可处理的工作。
    fn has_pending(&self) -> bool;
}
