use crate::endpoint::{EndpointId, ErrorMode, SharedErrorHandler, share_handler};
use crate::error::EndpointError;
use crate::transport::ListenId;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// 监听者句柄。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerHandle(pub(crate) u64);

/// 新端点就绪后的通知回调。
pub type AcceptHandler<U> = Box<dyn FnMut(&mut U, EndpointId) + Send>;

/// 监听参数：被接受端点的错误处理模式与回调。
///
/// 未设置 `on_accept` 时，就绪的服务端端点进入队列，由 `Worker::take_accepted` 取出。
pub struct ListenerParams<U> {
    pub(crate) err_mode: ErrorMode,
    pub(crate) on_error: Option<SharedErrorHandler<U>>,
    pub(crate) on_accept: Option<AcceptHandler<U>>,
}

impl<U> Default for ListenerParams<U> {
    fn default() -> Self {
        Self {
            err_mode: ErrorMode::None,
            on_error: None,
            on_accept: None,
        }
    }
}

impl<U> ListenerParams<U> {
    pub fn err_mode(mut self, mode: ErrorMode) -> Self {
        self.err_mode = mode;
        self
    }

    /// 所有被接受的端点共享此回调。
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut U, EndpointId, &EndpointError) + Send + 'static,
    {
        self.on_error = Some(share_handler(handler));
        self
    }

    pub fn on_accept<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut U, EndpointId) + Send + 'static,
    {
        self.on_accept = Some(Box::new(handler));
        self
    }
}

pub(crate) struct Listener<U> {
    pub iface: usize,
    pub listen_id: ListenId,
    pub addr: SocketAddr,
    pub err_mode: ErrorMode,
    pub on_error: Option<SharedErrorHandler<U>>,
    pub on_accept: Option<AcceptHandler<U>>,
    pub accepted: VecDeque<EndpointId>,
    /// 置位后，新的连接请求以 `Unreachable` 拒绝。
    pub rejecting: bool,
    pub attempts: u64,
}
