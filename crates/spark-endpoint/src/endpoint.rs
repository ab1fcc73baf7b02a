use crate::address::WorkerAddress;
use crate::config::Features;
use crate::error::EndpointError;
use crate::listener::ListenerHandle;
use crate::request::RequestHandle;
use crate::transport::LaneId;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// 端点标识，在所属 Worker 内唯一且不复用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub(crate) u64);

impl EndpointId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}

/// 端点的 wireup 状态。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - 正常路径只前进：`Connecting → Wireup → Ready → Closing → Closed`；
/// - 任一非终态都可以无条件进入 `Failed`；
/// - `Failed` 与 `Closed` 为终态，不再迁移。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointState {
    /// 地址解析与引导连接进行中。
    Connecting,
    /// 已与对端交换能力/地址信息，正在开通数据通道。
    Wireup,
    /// 至少有一条可用于应用请求的通道。
    Ready,
    /// 终态，失败原因保存在端点错误中。
    Failed,
    /// 由所有者发起关闭，正在排空请求。
    Closing,
    Closed,
}

impl EndpointState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EndpointState::Failed | EndpointState::Closed)
    }

    fn rank(self) -> u8 {
        match self {
            EndpointState::Connecting => 0,
            EndpointState::Wireup => 1,
            EndpointState::Ready => 2,
            EndpointState::Closing => 3,
            EndpointState::Closed => 4,
            EndpointState::Failed => 5,
        }
    }

    /// 是否允许从当前状态迁移到 `next`。
    pub fn can_advance_to(self, next: EndpointState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            EndpointState::Failed => true,
            EndpointState::Wireup => self == EndpointState::Connecting,
            EndpointState::Ready => self == EndpointState::Wireup,
            EndpointState::Closing => self.rank() < EndpointState::Closing.rank(),
            EndpointState::Closed => self == EndpointState::Closing,
            EndpointState::Connecting => false,
        }
    }
}

/// 错误处理模式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorMode {
    /// 传输层故障对进程致命。
    #[default]
    None,
    /// 故障总是可恢复的，经由端点错误回调报告。
    Peer,
}

/// 连接选项标志。
bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct EndpointFlags: u32 {
        /// 以客户端身份经套接字地址引导连接。
        const CLIENT_SERVER = 1 << 0;
    }
}

/// 连接目标。
#[derive(Clone, Debug)]
pub enum ConnectTarget {
    /// 经监听者所在套接字地址引导。
    SockAddr(SocketAddr),
    /// 带外获得的 Worker 地址，直接开通道。
    Worker(WorkerAddress),
}

/// 端点错误回调：在驱动 `progress()` 的线程上、端点进入 `Failed` 时恰好调用一次。
pub type ErrorHandler<U> = Box<dyn FnMut(&mut U, EndpointId, &EndpointError) + Send>;

/// 监听者与其接受的所有端点共享同一个回调。
pub(crate) type SharedErrorHandler<U> = Arc<Mutex<ErrorHandler<U>>>;

pub(crate) fn share_handler<U, F>(handler: F) -> SharedErrorHandler<U>
where
    F: FnMut(&mut U, EndpointId, &EndpointError) + Send + 'static,
{
    Arc::new(Mutex::new(Box::new(handler)))
}

/// 连接参数。
///
/// ```
/// use spark_endpoint::{EndpointParams, ErrorMode};
///
/// struct Counters {
///     errors: usize,
/// }
///
/// let params = EndpointParams::<Counters>::sockaddr("127.0.0.1:1".parse().unwrap())
///     .err_mode(ErrorMode::Peer)
///     .on_error(|counters, _ep, _err| counters.errors += 1);
/// assert_eq!(params.mode(), ErrorMode::Peer);
/// ```
pub struct EndpointParams<U> {
    pub(crate) target: ConnectTarget,
    pub(crate) err_mode: ErrorMode,
    pub(crate) on_error: Option<SharedErrorHandler<U>>,
    pub(crate) flags: EndpointFlags,
}

impl<U> EndpointParams<U> {
    /// 以客户端身份连接监听中的套接字地址，自动设置 [`EndpointFlags::CLIENT_SERVER`]。
    pub fn sockaddr(addr: SocketAddr) -> Self {
        Self {
            target: ConnectTarget::SockAddr(addr),
            err_mode: ErrorMode::None,
            on_error: None,
            flags: EndpointFlags::CLIENT_SERVER,
        }
    }

    /// 直接连接带外获得的 Worker 地址。
    pub fn worker(address: WorkerAddress) -> Self {
        Self {
            target: ConnectTarget::Worker(address),
            err_mode: ErrorMode::None,
            on_error: None,
            flags: EndpointFlags::empty(),
        }
    }

    pub fn err_mode(mut self, mode: ErrorMode) -> Self {
        self.err_mode = mode;
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut U, EndpointId, &EndpointError) + Send + 'static,
    {
        self.on_error = Some(share_handler(handler));
        self
    }

    pub fn flags(mut self, flags: EndpointFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn mode(&self) -> ErrorMode {
        self.err_mode
    }

    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }
}

/// 关闭方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseMode {
    /// 排空已投递的发送，通知对端后关闭。
    Flush,
    /// 立即关闭，进行中的请求以 `Canceled` 结束。
    Force,
}

bitflags! {
    /// 通道用途。
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct LaneUsage: u8 {
        /// 控制与标签消息。
        const AM = 1 << 0;
        const RMA = 1 << 1;
        const AMO = 1 << 2;
    }
}

/// 对外暴露的通道摘要：只描述用途与传输，不暴露通道本身。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaneInfo {
    pub transport: &'static str,
    pub usage: LaneUsage,
    /// 是否复用了套接字地址引导连接。
    pub bootstrap: bool,
}

/// Worker 内全局唯一的通道键：接口下标 + 接口内通道标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct LaneKey {
    pub iface: usize,
    pub lane: LaneId,
}

#[derive(Clone, Debug)]
pub(crate) struct LaneSlot {
    pub key: LaneKey,
    pub usage: LaneUsage,
    pub connected: bool,
    pub transport: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server(ListenerHandle),
    Direct,
}

pub(crate) struct Endpoint<U> {
    pub id: EndpointId,
    pub state: EndpointState,
    pub role: Role,
    pub err_mode: ErrorMode,
    pub handler: Option<SharedErrorHandler<U>>,
    pub peer: Option<SocketAddr>,
    pub bootstrap: Option<LaneKey>,
    pub lanes: Vec<LaneSlot>,
    pub remote_ep: Option<u64>,
    pub features: Features,
    /// 按投递顺序排队的发送；只有队首在传输中。
    pub sends: VecDeque<RequestHandle>,
    pub error: Option<EndpointError>,
    /// 服务端端点是否已交给应用。
    pub announced: bool,
    pub close: Option<RequestHandle>,
}

impl<U> Endpoint<U> {
    pub(crate) fn new(id: EndpointId, role: Role, err_mode: ErrorMode, features: Features) -> Self {
        Self {
            id,
            state: EndpointState::Connecting,
            role,
            err_mode,
            handler: None,
            peer: None,
            bootstrap: None,
            lanes: Vec::new(),
            remote_ep: None,
            features,
            sends: VecDeque::new(),
            error: None,
            announced: false,
            close: None,
        }
    }

    /// 尝试迁移状态；非法迁移被拒绝并记录。
    pub(crate) fn advance(&mut self, next: EndpointState) -> bool {
        if !self.state.can_advance_to(next) {
            tracing::debug!(
                ep = self.id.0,
                from = ?self.state,
                to = ?next,
                "rejected endpoint state transition"
            );
            return false;
        }
        tracing::debug!(ep = self.id.0, from = ?self.state, to = ?next, "endpoint state");
        self.state = next;
        true
    }

    /// 承载控制帧与标签消息的通道。
    pub(crate) fn am_lane(&self) -> Option<LaneKey> {
        self.lanes
            .iter()
            .find(|slot| slot.usage.contains(LaneUsage::AM) && slot.connected)
            .map(|slot| slot.key)
    }

    pub(crate) fn lanes_connected(&self) -> bool {
        !self.lanes.is_empty() && self.lanes.iter().all(|slot| slot.connected)
    }

    pub(crate) fn uses_lane(&self, key: LaneKey) -> bool {
        self.lanes.iter().any(|slot| slot.key == key)
    }

    /// 服务端端点在交给应用之前对外不可见。
    pub(crate) fn is_visible(&self) -> bool {
        !matches!(self.role, Role::Server(_)) || self.announced
    }

    pub(crate) fn lane_infos(&self) -> Vec<LaneInfo> {
        self.lanes
            .iter()
            .map(|slot| LaneInfo {
                transport: slot.transport,
                usage: slot.usage,
                bootstrap: Some(slot.key) == self.bootstrap,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [EndpointState; 6] = [
        EndpointState::Connecting,
        EndpointState::Wireup,
        EndpointState::Ready,
        EndpointState::Failed,
        EndpointState::Closing,
        EndpointState::Closed,
    ];

    #[test]
    fn happy_path_is_allowed() {
        let mut ep: Endpoint<()> =
            Endpoint::new(EndpointId(1), Role::Client, ErrorMode::Peer, Features::TAG);
        for next in [
            EndpointState::Wireup,
            EndpointState::Ready,
            EndpointState::Closing,
            EndpointState::Closed,
        ] {
            assert!(ep.advance(next), "transition to {next:?} must be allowed");
        }
    }

    #[test]
    fn terminal_states_are_sticky() {
        for from in [EndpointState::Failed, EndpointState::Closed] {
            for to in ALL {
                assert!(!from.can_advance_to(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn failure_is_reachable_from_every_live_state() {
        for from in ALL.into_iter().filter(|state| !state.is_terminal()) {
            assert!(from.can_advance_to(EndpointState::Failed));
        }
    }

    #[test]
    fn ready_cannot_skip_wireup() {
        assert!(!EndpointState::Connecting.can_advance_to(EndpointState::Ready));
        assert!(!EndpointState::Ready.can_advance_to(EndpointState::Wireup));
    }

    fn state() -> impl Strategy<Value = EndpointState> {
        proptest::sample::select(ALL.to_vec())
    }

    proptest! {
        /// 任意请求序列下状态只前进，唯一的例外是进入 `Failed`。
        #[test]
        fn transitions_are_monotonic(requests in proptest::collection::vec(state(), 0..32)) {
            let mut ep: Endpoint<()> =
                Endpoint::new(EndpointId(7), Role::Direct, ErrorMode::Peer, Features::TAG);
            for next in requests {
                let before = ep.state;
                if ep.advance(next) {
                    prop_assert!(!before.is_terminal());
                    prop_assert!(next == EndpointState::Failed || next.rank() > before.rank());
                } else {
                    prop_assert_eq!(ep.state, before);
                }
            }
        }
    }
}
