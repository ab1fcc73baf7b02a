//! Progress 引擎。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - Worker 是所有前进动作的唯一驱动者：传输 IO、wireup 状态机、发送分片推送、
//!   请求完成与回调都只发生在 `progress()` 与投递操作内部，且都在拥有 Worker 的线程上；
//! - 因为所有可变状态都只被 `&mut self` 访问，无需任何内部锁，回调也不可能并发执行。
//!
//! ## 逻辑 (How)
//! 一次 `progress()` 依次执行：
//! 1. 零超时轮询事件源，把有界数量的就绪事件交给对应接口，再让每个接口收取有界数量的帧；
//! 2. 处理接口事件：接受连接、通道连通、帧到达、通道失败；
//! 3. 应用排队的端点失败（失败一律延迟到此处，保证错误回调不会在投递操作内部触发）；
//! 4. 按预算推送发送分片，完成排空的关闭；
//! 5. 依次调用完成回调、错误回调与接受回调。
//!
//! ## 注意事项 (Trade-offs)
//! - 回调只拿到 `&mut U`，不能重入 Worker；需要在回调后继续投递的逻辑应记录在 `U` 中，
//!   由调用方在 `progress()` 返回后处理。

use crate::address::{IfaceAddress, WorkerAddress};
use crate::config::Features;
use crate::context::Context;
use crate::endpoint::{
    CloseMode, ConnectTarget, Endpoint, EndpointFlags, EndpointId, EndpointParams, EndpointState,
    ErrorMode, LaneInfo, LaneKey, Role, SharedErrorHandler,
};
use crate::error::{EndpointError, ErrorKind, Result, codes};
use crate::listener::{Listener, ListenerHandle, ListenerParams};
use crate::request::{
    Completion, CompletionCallback, Posted, RequestBody, RequestEntry, RequestHandle, RequestKind,
    RequestTable, SendState, Status,
};
use crate::tag::{Claimed, Tag, TagMatcher};
use crate::transport::{Capabilities, Iface, IfaceEvent, SendStatus};
use crate::wakeup::{EventSource, WorkerSignal};
use crate::wire::{FRAG_FIRST_HEADER_LEN, Frame};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

pub(crate) struct Failure {
    pub ep: EndpointId,
    pub error: EndpointError,
    /// 对端主动断开：`ErrorMode::None` 下不视为致命。
    pub graceful: bool,
}

pub(crate) enum Notice<U> {
    Failed {
        ep: EndpointId,
        error: EndpointError,
        handler: SharedErrorHandler<U>,
    },
    Accepted {
        listener: ListenerHandle,
        ep: EndpointId,
    },
}

enum Push {
    Sent { done: bool },
    Blocked,
}

/// 拥有端点、请求与传输接口的进度引擎。
///
/// `U` 是调用方上下文，所有回调都以 `&mut U` 的形式拿到它；例如错误计数可以是 `U`
/// 中的普通字段，无需原子类型。Worker 整体为 `Send`（当 `U: Send`），可以移交给
/// 其他线程，但同一时刻只能由一个线程驱动。
pub struct Worker<U = ()> {
    pub(crate) context: Context,
    pub(crate) uuid: u64,
    pub(crate) events: EventSource,
    pub(crate) ifaces: Vec<Box<dyn Iface>>,
    pub(crate) endpoints: BTreeMap<EndpointId, Endpoint<U>>,
    pub(crate) lanes: HashMap<LaneKey, EndpointId>,
    pub(crate) listeners: BTreeMap<ListenerHandle, Listener<U>>,
    pub(crate) requests: RequestTable<U>,
    pub(crate) matcher: TagMatcher,
    pub(crate) inbox: VecDeque<(usize, IfaceEvent)>,
    pub(crate) scratch: Vec<IfaceEvent>,
    pub(crate) failures: VecDeque<Failure>,
    pub(crate) completed: VecDeque<RequestHandle>,
    pub(crate) notices: VecDeque<Notice<U>>,
    pub(crate) next_ep: u64,
    pub(crate) next_listener: u64,
    pub(crate) next_msg: u64,
    pub(crate) user: U,
}

impl<U> Worker<U> {
    pub(crate) fn new(context: Context, user: U) -> Result<Self> {
        let max_events = context.config().progress.max_events;
        let mut events = EventSource::new(max_events).map_err(|err| {
            EndpointError::fatal("failed to create worker event source").with_cause(err)
        })?;
        let mut ifaces = Vec::with_capacity(context.transports().len());
        for (index, transport) in context.transports().iter().enumerate() {
            let mut registry = events.registry_for(index);
            ifaces.push(transport.open(&mut registry)?);
        }
        let max_message_len = context.config().max_message_len;
        let uuid = rand::random::<u64>();
        tracing::debug!(worker = uuid, ifaces = ifaces.len(), "worker created");
        Ok(Self {
            context,
            uuid,
            events,
            ifaces,
            endpoints: BTreeMap::new(),
            lanes: HashMap::new(),
            listeners: BTreeMap::new(),
            requests: RequestTable::default(),
            matcher: TagMatcher::new(max_message_len),
            inbox: VecDeque::new(),
            scratch: Vec::new(),
            failures: VecDeque::new(),
            completed: VecDeque::new(),
            notices: VecDeque::new(),
            next_ep: 1,
            next_listener: 1,
            next_msg: 1,
            user,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// 本 Worker 的随机标识，同时作为分片重组键的一部分。
    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    pub fn user(&self) -> &U {
        &self.user
    }

    pub fn user_mut(&mut self) -> &mut U {
        &mut self.user
    }

    /// 本 Worker 的地址，可带外交给对端用于直接连接。
    pub fn address(&self) -> WorkerAddress {
        WorkerAddress::new(
            self.uuid,
            self.ifaces
                .iter()
                .filter_map(|iface| {
                    iface.address().map(|addr| IfaceAddress {
                        name: iface.name().to_owned(),
                        caps: iface.caps().flags,
                        addr,
                    })
                })
                .collect(),
        )
    }

    // ------------------------------------------------------------------
    // 连接管理
    // ------------------------------------------------------------------

    /// 在套接字地址上监听。
    ///
    /// 没有任何传输能服务该地址族时返回 `Unreachable`，这是可预期的结果，调用方可以换一个
    /// 地址重试；地址被占用时返回 `Busy`。
    pub fn listen(
        &mut self,
        addr: SocketAddr,
        params: ListenerParams<U>,
    ) -> Result<ListenerHandle> {
        let mut last_error = None;
        for index in 0..self.ifaces.len() {
            let serves = self
                .context
                .transports()
                .get(index)
                .is_some_and(|transport| transport.serves(&addr));
            if !serves
                || !self.ifaces[index]
                    .caps()
                    .flags
                    .contains(Capabilities::SOCKADDR)
            {
                continue;
            }
            let mut registry = self.events.registry_for(index);
            match self.ifaces[index].listen(addr, &mut registry) {
                Ok((listen_id, bound)) => {
                    let handle = ListenerHandle(self.next_listener);
                    self.next_listener += 1;
                    tracing::info!(
                        listener = handle.0,
                        addr = %bound,
                        transport = self.ifaces[index].name(),
                        "listening"
                    );
                    self.listeners.insert(
                        handle,
                        Listener {
                            iface: index,
                            listen_id,
                            addr: bound,
                            err_mode: params.err_mode,
                            on_error: params.on_error,
                            on_accept: params.on_accept,
                            accepted: VecDeque::new(),
                            rejecting: false,
                            attempts: 0,
                        },
                    );
                    return Ok(handle);
                }
                Err(err) if err.kind() == ErrorKind::Busy => return Err(err),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            EndpointError::new(
                ErrorKind::Unreachable,
                codes::NO_TRANSPORT,
                format!("no transport can listen on {addr}"),
            )
        }))
    }

    /// 监听者实际绑定的地址（端口为 0 时可据此得知分配的端口）。
    pub fn listener_address(&self, listener: ListenerHandle) -> Result<SocketAddr> {
        self.listeners
            .get(&listener)
            .map(|entry| entry.addr)
            .ok_or_else(|| unknown_listener(listener))
    }

    /// 监听者接受过的引导连接数。
    pub fn listener_attempts(&self, listener: ListenerHandle) -> Result<u64> {
        self.listeners
            .get(&listener)
            .map(|entry| entry.attempts)
            .ok_or_else(|| unknown_listener(listener))
    }

    /// 设置监听者是否拒绝后续连接；被拒绝的客户端端点以 `Unreachable` 失败。
    pub fn reject_connections(&mut self, listener: ListenerHandle, reject: bool) -> Result<()> {
        let entry = self
            .listeners
            .get_mut(&listener)
            .ok_or_else(|| unknown_listener(listener))?;
        entry.rejecting = reject;
        Ok(())
    }

    /// 取出已就绪但未经 `on_accept` 回调交付的服务端端点。
    pub fn take_accepted(&mut self, listener: ListenerHandle) -> Vec<EndpointId> {
        self.listeners
            .get_mut(&listener)
            .map(|entry| entry.accepted.drain(..).collect())
            .unwrap_or_default()
    }

    /// 停止监听；已接受的端点不受影响。
    pub fn close_listener(&mut self, listener: ListenerHandle) -> Result<()> {
        let entry = self
            .listeners
            .remove(&listener)
            .ok_or_else(|| unknown_listener(listener))?;
        if let Some(iface) = self.ifaces.get_mut(entry.iface) {
            let mut registry = self.events.registry_for(entry.iface);
            iface.close_listener(entry.listen_id, &mut registry);
        }
        tracing::info!(listener = listener.0, addr = %entry.addr, "listener closed");
        Ok(())
    }

    /// 创建端点。
    ///
    /// 套接字地址连接总是立即返回端点标识，失败（对端不可达、地址信息过大等）经由
    /// `progress()` 以端点错误回调报告；Worker 地址连接在通道选择失败时直接返回错误，
    /// 不创建任何端点。
    pub fn connect(&mut self, params: EndpointParams<U>) -> Result<EndpointId> {
        let EndpointParams {
            target,
            err_mode,
            on_error,
            flags,
        } = params;
        match target {
            ConnectTarget::SockAddr(addr) => {
                if !flags.contains(EndpointFlags::CLIENT_SERVER) {
                    return Err(EndpointError::invalid_param(
                        "socket address connections require the client-server flag",
                    ));
                }
                Ok(self.connect_sockaddr(addr, err_mode, on_error))
            }
            ConnectTarget::Worker(address) => self.connect_worker(&address, err_mode, on_error),
        }
    }

    fn allocate_endpoint(
        &mut self,
        role: Role,
        err_mode: ErrorMode,
        handler: Option<SharedErrorHandler<U>>,
    ) -> EndpointId {
        let id = EndpointId(self.next_ep);
        self.next_ep += 1;
        let mut endpoint = Endpoint::new(id, role, err_mode, self.context.features());
        endpoint.handler = handler;
        self.endpoints.insert(id, endpoint);
        id
    }

    fn connect_sockaddr(
        &mut self,
        addr: SocketAddr,
        err_mode: ErrorMode,
        handler: Option<SharedErrorHandler<U>>,
    ) -> EndpointId {
        let id = self.allocate_endpoint(Role::Client, err_mode, handler);
        if let Some(endpoint) = self.endpoints.get_mut(&id) {
            endpoint.peer = Some(addr);
        }
        let mut last_error = None;
        for index in 0..self.ifaces.len() {
            let serves = self
                .context
                .transports()
                .get(index)
                .is_some_and(|transport| transport.serves(&addr));
            if !serves
                || !self.ifaces[index]
                    .caps()
                    .flags
                    .contains(Capabilities::SOCKADDR)
            {
                continue;
            }
            let mut registry = self.events.registry_for(index);
            match self.ifaces[index].connect_sockaddr(addr, &mut registry) {
                Ok(lane) => {
                    let key = LaneKey { iface: index, lane };
                    self.lanes.insert(key, id);
                    if let Some(endpoint) = self.endpoints.get_mut(&id) {
                        endpoint.bootstrap = Some(key);
                    }
                    tracing::info!(
                        ep = id.0,
                        addr = %addr,
                        transport = self.ifaces[index].name(),
                        "connecting"
                    );
                    return id;
                }
                Err(err) => last_error = Some(err),
            }
        }
        let error = last_error.unwrap_or_else(|| {
            EndpointError::new(
                ErrorKind::Unreachable,
                codes::NO_TRANSPORT,
                format!("no transport can connect to {addr}"),
            )
        });
        self.schedule_failure(id, error);
        id
    }

    fn connect_worker(
        &mut self,
        address: &WorkerAddress,
        err_mode: ErrorMode,
        handler: Option<SharedErrorHandler<U>>,
    ) -> Result<EndpointId> {
        let plans = crate::wireup::select_lanes(
            &self.ifaces,
            address,
            self.context.features(),
            None,
        )?;
        let id = self.allocate_endpoint(Role::Direct, err_mode, handler);
        if let Err(err) = self.open_lanes(id, plans, None) {
            self.close_endpoint_lanes(id, false);
            self.endpoints.remove(&id);
            return Err(err);
        }
        if let Some(endpoint) = self.endpoints.get_mut(&id) {
            endpoint.advance(EndpointState::Wireup);
        }
        tracing::info!(ep = id.0, peer = address.uuid(), "connecting to worker address");
        Ok(id)
    }

    /// 端点当前状态；已关闭并回收的端点报告 `Closed`。
    pub fn endpoint_state(&self, ep: EndpointId) -> Result<EndpointState> {
        match self.endpoints.get(&ep) {
            Some(endpoint) => Ok(endpoint.state),
            None if ep.0 > 0 && ep.0 < self.next_ep => Ok(EndpointState::Closed),
            None => Err(unknown_endpoint(ep)),
        }
    }

    /// 端点进入 `Failed` 时记录的原因。
    pub fn endpoint_error(&self, ep: EndpointId) -> Option<&EndpointError> {
        self.endpoints
            .get(&ep)
            .and_then(|endpoint| endpoint.error.as_ref())
    }

    /// 端点已选择的通道用途摘要。
    pub fn endpoint_lanes(&self, ep: EndpointId) -> Result<Vec<LaneInfo>> {
        self.endpoints
            .get(&ep)
            .map(Endpoint::lane_infos)
            .ok_or_else(|| unknown_endpoint(ep))
    }

    /// 对应用可见且未进入终态的端点数。
    pub fn endpoint_count(&self) -> usize {
        self.endpoints
            .values()
            .filter(|endpoint| endpoint.is_visible() && !endpoint.state.is_terminal())
            .count()
    }

    // ------------------------------------------------------------------
    // 请求
    // ------------------------------------------------------------------

    /// 投递带标签的发送。
    pub fn post_send(
        &mut self,
        ep: EndpointId,
        payload: impl Into<Bytes>,
        tag: Tag,
    ) -> Result<Posted> {
        self.submit_send(ep, payload.into(), tag, None)
    }

    /// 投递带标签的发送，并在请求以 `Pending` 返回时于完成后调用 `callback`。
    pub fn post_send_with<F>(
        &mut self,
        ep: EndpointId,
        payload: impl Into<Bytes>,
        tag: Tag,
        callback: F,
    ) -> Result<Posted>
    where
        F: FnOnce(&mut U, RequestHandle, &Completion) + Send + 'static,
    {
        self.submit_send(ep, payload.into(), tag, Some(Box::new(callback)))
    }

    fn submit_send(
        &mut self,
        ep: EndpointId,
        payload: Bytes,
        tag: Tag,
        callback: Option<CompletionCallback<U>>,
    ) -> Result<Posted> {
        self.require(Features::TAG, "tag matching")?;
        let endpoint = self.endpoints.get(&ep).ok_or_else(|| unknown_endpoint(ep))?;
        match endpoint.state {
            EndpointState::Failed => {
                return Err(endpoint.error.clone().unwrap_or_else(|| {
                    EndpointError::unreachable(format!("endpoint {ep} has failed"))
                }));
            }
            EndpointState::Closing | EndpointState::Closed => {
                return Err(EndpointError::canceled(format!("endpoint {ep} is closing")));
            }
            _ => {}
        }
        let length = payload.len();
        let limit = self.context.config().max_message_len;
        if length > limit {
            return Err(EndpointError::invalid_param(format!(
                "message of {length} bytes exceeds the limit of {limit} bytes"
            )));
        }
        let handle = self.requests.insert(RequestEntry::new(
            RequestBody::Send(SendState {
                ep,
                tag,
                payload,
                offset: 0,
                msg_id: None,
            }),
            callback,
        ));
        let Some(endpoint) = self.endpoints.get_mut(&ep) else {
            return Err(unknown_endpoint(ep));
        };
        endpoint.sends.push_back(handle);
        let immediate = endpoint.state == EndpointState::Ready && endpoint.sends.len() == 1;
        let lane = endpoint.am_lane();
        if let (true, Some(lane)) = (immediate, lane) {
            match self.push_fragment(handle, lane) {
                Ok(Push::Sent { done: true }) => {
                    if let Some(endpoint) = self.endpoints.get_mut(&ep) {
                        endpoint.sends.pop_front();
                    }
                    self.requests.remove(handle);
                    return Ok(Posted::Completed(Completion::sent(length)));
                }
                Ok(_) => {}
                Err(err) => self.schedule_failure(ep, err),
            }
        }
        Ok(Posted::Pending(handle))
    }

    /// 投递带标签的接收，`mask` 选择参与匹配的标签位，`capacity` 为可接收的最大字节数。
    pub fn post_receive(&mut self, tag: Tag, mask: Tag, capacity: usize) -> Result<Posted> {
        self.submit_receive(tag, mask, capacity, None)
    }

    pub fn post_receive_with<F>(
        &mut self,
        tag: Tag,
        mask: Tag,
        capacity: usize,
        callback: F,
    ) -> Result<Posted>
    where
        F: FnOnce(&mut U, RequestHandle, &Completion) + Send + 'static,
    {
        self.submit_receive(tag, mask, capacity, Some(Box::new(callback)))
    }

    fn submit_receive(
        &mut self,
        tag: Tag,
        mask: Tag,
        capacity: usize,
        callback: Option<CompletionCallback<U>>,
    ) -> Result<Posted> {
        self.require(Features::TAG, "tag matching")?;
        match self.matcher.claim_unexpected(tag, mask) {
            Some(Claimed::Complete { tag, data }) => {
                let completion = if data.len() > capacity {
                    Completion::truncated(tag, data.len(), capacity)
                } else {
                    Completion::received(tag, data)
                };
                Ok(Posted::Completed(completion))
            }
            Some(Claimed::Partial(key)) => {
                let handle = self
                    .requests
                    .insert(RequestEntry::new(RequestBody::Receive { capacity }, callback));
                if let Some(delivery) = self.matcher.bind(key, handle, capacity) {
                    self.complete_request(delivery.handle, delivery.completion);
                }
                Ok(Posted::Pending(handle))
            }
            None => {
                let handle = self
                    .requests
                    .insert(RequestEntry::new(RequestBody::Receive { capacity }, callback));
                self.matcher.expect(handle, tag, mask, capacity);
                Ok(Posted::Pending(handle))
            }
        }
    }

    /// 查询请求状态。
    pub fn request_status(&self, handle: RequestHandle) -> Result<Status> {
        self.requests
            .get(handle)
            .map(RequestEntry::status)
            .ok_or_else(|| stale_request(handle))
    }

    /// 释放终态请求并取得结果；请求仍在进行中返回 `Busy`，重复释放返回 `InvalidParam`。
    pub fn release(&mut self, handle: RequestHandle) -> Result<Completion> {
        self.requests.release(handle)
    }

    /// 取消请求：等待中的接收与尚未开始传输的发送以 `Canceled` 结束。
    pub fn cancel(&mut self, handle: RequestHandle) -> Result<()> {
        let entry = self
            .requests
            .get(handle)
            .ok_or_else(|| stale_request(handle))?;
        if entry.status().is_terminal() {
            return Ok(());
        }
        match &entry.body {
            RequestBody::Receive { .. } => {
                if !self.matcher.cancel(handle) {
                    return Err(EndpointError::fatal(format!(
                        "{handle:?} is pending but not tracked by the tag matcher"
                    )));
                }
                self.complete_request(
                    handle,
                    Completion::failed(
                        RequestKind::Receive,
                        EndpointError::canceled("receive canceled"),
                    ),
                );
                Ok(())
            }
            RequestBody::Send(state) => {
                if state.offset > 0 {
                    return Err(EndpointError::busy(format!(
                        "{handle:?} is already being transmitted"
                    )));
                }
                let ep = state.ep;
                if let Some(endpoint) = self.endpoints.get_mut(&ep) {
                    endpoint.sends.retain(|queued| *queued != handle);
                }
                self.complete_request(
                    handle,
                    Completion::failed(RequestKind::Send, EndpointError::canceled("send canceled")),
                );
                Ok(())
            }
            RequestBody::Close { .. } => Err(EndpointError::busy(
                "endpoint close requests cannot be canceled",
            )),
        }
    }

    /// 关闭端点。
    ///
    /// `Flush` 关闭返回进行中的请求，需继续驱动 `progress()`：已投递的发送排空后通知对端并
    /// 回收通道。`Force` 立即回收，未完成的请求以 `Canceled` 结束。尚未就绪的端点总是立即关闭。
    pub fn close_endpoint(&mut self, ep: EndpointId, mode: CloseMode) -> Result<Posted> {
        let endpoint = self
            .endpoints
            .get_mut(&ep)
            .ok_or_else(|| unknown_endpoint(ep))?;
        match (endpoint.state, mode) {
            (EndpointState::Failed, _) => {
                self.close_endpoint_lanes(ep, false);
                self.endpoints.remove(&ep);
                tracing::debug!(ep = ep.0, "failed endpoint released");
                return Ok(Posted::Completed(Completion::closed()));
            }
            (EndpointState::Closing, CloseMode::Flush) => {
                return Err(EndpointError::busy(format!(
                    "endpoint {ep} is already closing"
                )));
            }
            (EndpointState::Ready, CloseMode::Flush) => {}
            _ => {
                self.force_close(ep);
                return Ok(Posted::Completed(Completion::closed()));
            }
        }
        endpoint.advance(EndpointState::Closing);
        let handle = self
            .requests
            .insert(RequestEntry::new(RequestBody::Close { ep }, None));
        if let Some(endpoint) = self.endpoints.get_mut(&ep) {
            endpoint.close = Some(handle);
        }
        Ok(Posted::Pending(handle))
    }

    /// 强制关闭全部端点与监听者，所有未完成请求以 `Canceled` 结束并调用其回调。
    pub fn shutdown(&mut self) {
        let ids: Vec<EndpointId> = self.endpoints.keys().copied().collect();
        for id in ids {
            self.force_close(id);
        }
        for handle in self.matcher.drain_waiting() {
            self.complete_request(
                handle,
                Completion::failed(
                    RequestKind::Receive,
                    EndpointError::canceled("worker shut down"),
                ),
            );
        }
        let listeners: Vec<ListenerHandle> = self.listeners.keys().copied().collect();
        for listener in listeners {
            if let Err(err) = self.close_listener(listener) {
                tracing::debug!(
                    listener = listener.0,
                    ?err,
                    "failed to close listener on shutdown"
                );
            }
        }
        self.failures.clear();
        self.dispatch();
        tracing::debug!(worker = self.uuid, "worker shut down");
    }

    // ------------------------------------------------------------------
    // Progress 与唤醒
    // ------------------------------------------------------------------

    /// 执行一次有界的非阻塞推进，返回是否做了任何工作。
    ///
    /// # Panics
    ///
    /// `ErrorMode::None` 的端点遇到传输故障时，记录 "no peer failure handler" 错误日志后 panic。
    pub fn progress(&mut self) -> bool {
        let mut work = self.poll_ifaces();
        work += self.handle_inbox();
        work += self.apply_failures();
        work += self.pump_sends();
        work += self.finish_closes();
        work += self.apply_failures();
        work += self.dispatch();
        work > 0
    }

    /// 武装唤醒：没有待处理工作时返回 `Ok`，此后事件描述符可读即意味着 `progress()` 有事可做；
    /// 仍有未消费的工作时返回 `Busy`，调用方应先驱动 `progress()` 再重新武装。
    pub fn arm(&mut self) -> Result<()> {
        self.require(Features::WAKEUP, "wakeup")?;
        if self.has_pending_work() {
            return Err(wakeup_busy());
        }
        let observed = self.events.poll(Some(Duration::ZERO)).map_err(|err| {
            EndpointError::fatal("failed to poll worker event source").with_cause(err)
        })?;
        if observed || self.events.has_stashed() {
            return Err(wakeup_busy());
        }
        Ok(())
    }

    /// 便捷的阻塞等待：武装后在事件源上最多阻塞 `timeout`；已有待处理工作时立即返回。
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self.arm() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Busy => return Ok(()),
            Err(err) => return Err(err),
        }
        self.events.poll(timeout).map_err(|err| {
            EndpointError::fatal("failed to wait on worker event source").with_cause(err)
        })?;
        Ok(())
    }

    /// 可嵌入外部事件循环的描述符。
    #[cfg(unix)]
    pub fn event_fd(&self) -> Result<std::os::fd::RawFd> {
        self.require(Features::WAKEUP, "wakeup")?;
        Ok(self.events.raw_fd())
    }

    /// 可跨线程唤醒本 Worker 的句柄。
    pub fn signaller(&self) -> Result<WorkerSignal> {
        self.require(Features::WAKEUP, "wakeup")?;
        Ok(WorkerSignal::new(std::sync::Arc::clone(self.events.waker())))
    }

    fn require(&self, feature: Features, what: &'static str) -> Result<()> {
        if self.context.features().contains(feature) {
            Ok(())
        } else {
            Err(EndpointError::unsupported(format!(
                "{what} was not requested when the context was created"
            )))
        }
    }

    fn has_pending_work(&self) -> bool {
        if !self.inbox.is_empty()
            || !self.failures.is_empty()
            || !self.completed.is_empty()
            || !self.notices.is_empty()
            || self.events.has_stashed()
            || self.ifaces.iter().any(|iface| iface.has_pending())
        {
            return true;
        }
        self.endpoints
            .values()
            .any(|endpoint| self.endpoint_has_work(endpoint))
    }

    fn endpoint_has_work(&self, endpoint: &Endpoint<U>) -> bool {
        let lane = endpoint.am_lane();
        let lane_ready = lane.is_some_and(|lane| {
            self.ifaces
                .get(lane.iface)
                .is_some_and(|iface| iface.lane_ready(lane.lane))
        });
        match endpoint.state {
            EndpointState::Ready => !endpoint.sends.is_empty() && lane_ready,
            EndpointState::Closing => lane_ready || lane.is_none(),
            _ => false,
        }
    }

    fn poll_ifaces(&mut self) -> usize {
        let max_events = self.context.config().progress.max_events;
        let max_frames = self.context.config().progress.max_frames;
        if let Err(err) = self.events.poll(Some(Duration::ZERO)) {
            tracing::warn!(error = %err, "worker event poll failed");
        }
        let ready = self.events.take_stashed(max_events);
        let mut work = ready.len();
        for (owner, event) in ready {
            if let Some(iface) = self.ifaces.get_mut(owner) {
                let mut registry = self.events.registry_for(owner);
                iface.on_ready(&event, &mut registry, &mut self.scratch);
            }
            self.collect_scratch(owner);
        }
        for owner in 0..self.ifaces.len() {
            let mut registry = self.events.registry_for(owner);
            work += self.ifaces[owner].progress(max_frames, &mut registry, &mut self.scratch);
            self.collect_scratch(owner);
        }
        work
    }

    fn collect_scratch(&mut self, owner: usize) {
        for event in self.scratch.drain(..) {
            self.inbox.push_back((owner, event));
        }
    }

    fn handle_inbox(&mut self) -> usize {
        let mut handled = 0;
        while let Some((iface, event)) = self.inbox.pop_front() {
            handled += 1;
            match event {
                IfaceEvent::Accepted {
                    listener,
                    lane,
                    peer,
                } => self.on_accepted(iface, listener, lane, peer),
                IfaceEvent::Connected { lane } => self.on_lane_connected(LaneKey { iface, lane }),
                IfaceEvent::Received { lane, frame } => self.on_frame(iface, lane, frame),
                IfaceEvent::Failed { lane, error } => {
                    self.on_lane_failed(LaneKey { iface, lane }, error)
                }
            }
        }
        handled
    }

    pub(crate) fn schedule_failure(&mut self, ep: EndpointId, error: EndpointError) {
        self.failures.push_back(Failure {
            ep,
            error,
            graceful: false,
        });
    }

    fn apply_failures(&mut self) -> usize {
        let mut applied = 0;
        while let Some(failure) = self.failures.pop_front() {
            if self.fail_endpoint(failure) {
                applied += 1;
            }
        }
        applied
    }

    fn fail_endpoint(&mut self, failure: Failure) -> bool {
        let Failure {
            ep: id,
            error,
            graceful,
        } = failure;
        let Some(endpoint) = self.endpoints.get_mut(&id) else {
            return false;
        };
        if !endpoint.advance(EndpointState::Failed) {
            return false;
        }
        endpoint.error = Some(error.clone());
        let sends: Vec<RequestHandle> = endpoint.sends.drain(..).collect();
        let close = endpoint.close.take();
        let visible = endpoint.is_visible();
        let mode = endpoint.err_mode;
        let handler = endpoint.handler.clone();
        let peer = endpoint.peer;
        self.close_endpoint_lanes(id, false);
        for handle in sends {
            self.complete_request(handle, Completion::failed(RequestKind::Send, error.clone()));
        }
        if let Some(handle) = close {
            self.complete_request(handle, Completion::failed(RequestKind::Close, error.clone()));
        }
        if !visible {
            tracing::debug!(
                ep = id.0,
                code = error.code(),
                "dropping server endpoint that failed before it was accepted"
            );
            self.endpoints.remove(&id);
            return true;
        }
        tracing::warn!(
            ep = id.0,
            kind = ?error.kind(),
            code = error.code(),
            peer = ?peer,
            "endpoint failed: {}",
            error.message()
        );
        match (mode, handler) {
            (ErrorMode::Peer, Some(handler)) => self.notices.push_back(Notice::Failed {
                ep: id,
                error,
                handler,
            }),
            (ErrorMode::Peer, None) => {
                tracing::debug!(ep = id.0, "endpoint failed without an error callback")
            }
            (ErrorMode::None, _) if graceful => {
                tracing::info!(ep = id.0, "peer disconnected")
            }
            (ErrorMode::None, _) => {
                tracing::error!(
                    ep = id.0,
                    kind = ?error.kind(),
                    code = error.code(),
                    "no peer failure handler, endpoint failure is fatal"
                );
                panic!("endpoint {id} failed with no peer failure handler: {error}");
            }
        }
        true
    }

    pub(crate) fn close_endpoint_lanes(&mut self, id: EndpointId, graceful: bool) {
        let Some(endpoint) = self.endpoints.get_mut(&id) else {
            return;
        };
        let mut keys: Vec<LaneKey> = endpoint.lanes.drain(..).map(|slot| slot.key).collect();
        if let Some(bootstrap) = endpoint.bootstrap.take()
            && !keys.contains(&bootstrap)
        {
            keys.push(bootstrap);
        }
        for key in keys {
            self.release_lane(key, graceful);
        }
    }

    pub(crate) fn release_lane(&mut self, key: LaneKey, graceful: bool) {
        self.lanes.remove(&key);
        if let Some(iface) = self.ifaces.get_mut(key.iface) {
            let mut registry = self.events.registry_for(key.iface);
            iface.close_lane(key.lane, graceful, &mut registry);
        }
    }

    fn force_close(&mut self, id: EndpointId) {
        let Some(endpoint) = self.endpoints.get_mut(&id) else {
            return;
        };
        let sends: Vec<RequestHandle> = endpoint.sends.drain(..).collect();
        let close = endpoint.close.take();
        endpoint.advance(EndpointState::Closing);
        self.close_endpoint_lanes(id, false);
        let canceled = EndpointError::canceled(format!("endpoint {id} closed"));
        for handle in sends {
            self.complete_request(
                handle,
                Completion::failed(RequestKind::Send, canceled.clone()),
            );
        }
        if let Some(handle) = close {
            self.complete_request(handle, Completion::closed());
        }
        if let Some(mut endpoint) = self.endpoints.remove(&id) {
            endpoint.advance(EndpointState::Closed);
            tracing::info!(ep = id.0, "endpoint closed");
        }
    }

    pub(crate) fn complete_request(&mut self, handle: RequestHandle, completion: Completion) {
        if self.requests.complete(handle, completion) {
            self.completed.push_back(handle);
        }
    }

    fn segment_size(&self, iface: usize) -> usize {
        let frame_limit = self
            .ifaces
            .get(iface)
            .map_or(0, |iface| iface.caps().max_frame_len)
            .saturating_sub(FRAG_FIRST_HEADER_LEN);
        self.context.config().segment_size.min(frame_limit).max(1)
    }

    fn pump_sends(&mut self) -> usize {
        let mut budget = self.context.config().progress.max_fragments;
        let ready: Vec<EndpointId> = self
            .endpoints
            .values()
            .filter(|endpoint| {
                matches!(
                    endpoint.state,
                    EndpointState::Ready | EndpointState::Closing
                ) && !endpoint.sends.is_empty()
            })
            .map(|endpoint| endpoint.id)
            .collect();
        let mut pushed = 0;
        for id in ready {
            if budget == 0 {
                break;
            }
            let sent = self.pump_endpoint(id, budget);
            budget -= sent;
            pushed += sent;
        }
        pushed
    }

    fn pump_endpoint(&mut self, id: EndpointId, budget: usize) -> usize {
        let mut sent = 0;
        while sent < budget {
            let Some(endpoint) = self.endpoints.get(&id) else {
                break;
            };
            let (Some(&head), Some(lane)) = (endpoint.sends.front(), endpoint.am_lane()) else {
                break;
            };
            match self.push_fragment(head, lane) {
                Ok(Push::Sent { done }) => {
                    sent += 1;
                    if done {
                        self.finish_send(id, head);
                    }
                }
                Ok(Push::Blocked) => break,
                Err(err) => {
                    self.schedule_failure(id, err);
                    break;
                }
            }
        }
        sent
    }

    fn finish_send(&mut self, id: EndpointId, handle: RequestHandle) {
        if let Some(endpoint) = self.endpoints.get_mut(&id) {
            endpoint.sends.pop_front();
        }
        let length = match self.requests.get(handle).map(|entry| &entry.body) {
            Some(RequestBody::Send(state)) => state.payload.len(),
            _ => 0,
        };
        self.complete_request(handle, Completion::sent(length));
    }

    fn push_fragment(&mut self, handle: RequestHandle, lane: LaneKey) -> Result<Push> {
        let segment = self.segment_size(lane.iface);
        let sender = self.uuid;
        let next_msg = self.next_msg;
        let Some(iface) = self.ifaces.get_mut(lane.iface) else {
            return Err(EndpointError::fatal("lane refers to a missing interface"));
        };
        if !iface.lane_ready(lane.lane) {
            return Ok(Push::Blocked);
        }
        let Some(RequestEntry {
            body: RequestBody::Send(state),
            ..
        }) = self.requests.get_mut(handle)
        else {
            return Err(EndpointError::fatal(format!("{handle:?} is not a live send")));
        };
        let total = state.payload.len();
        let (frame, end, new_msg) = match state.msg_id {
            None if total <= segment => (
                Frame::Eager {
                    sender,
                    tag: state.tag,
                    payload: state.payload.clone(),
                },
                total,
                None,
            ),
            None => (
                Frame::FragFirst {
                    sender,
                    msg_id: next_msg,
                    tag: state.tag,
                    total: total as u64,
                    chunk: state.payload.slice(..segment),
                },
                segment,
                Some(next_msg),
            ),
            Some(msg_id) => {
                let end = (state.offset + segment).min(total);
                (
                    Frame::FragNext {
                        sender,
                        msg_id,
                        offset: state.offset as u64,
                        chunk: state.payload.slice(state.offset..end),
                    },
                    end,
                    None,
                )
            }
        };
        match iface.send(lane.lane, frame.encode())? {
            SendStatus::Busy => Ok(Push::Blocked),
            SendStatus::Queued => {
                state.offset = end;
                if let Some(msg_id) = new_msg {
                    state.msg_id = Some(msg_id);
                    self.next_msg += 1;
                }
                Ok(Push::Sent { done: end == total })
            }
        }
    }

    fn finish_closes(&mut self) -> usize {
        let closing: Vec<EndpointId> = self
            .endpoints
            .values()
            .filter(|endpoint| endpoint.state == EndpointState::Closing && endpoint.sends.is_empty())
            .map(|endpoint| endpoint.id)
            .collect();
        let mut finished = 0;
        for id in closing {
            let Some(endpoint) = self.endpoints.get(&id) else {
                continue;
            };
            if let (Some(remote), Some(lane)) = (endpoint.remote_ep, endpoint.am_lane()) {
                let Some(iface) = self.ifaces.get_mut(lane.iface) else {
                    continue;
                };
                if !iface.lane_ready(lane.lane) {
                    continue;
                }
                match iface.send(lane.lane, Frame::Disconnect { dest_ep: remote }.encode()) {
                    Ok(SendStatus::Queued) => {}
                    Ok(SendStatus::Busy) => continue,
                    Err(err) => {
                        tracing::debug!(ep = id.0, error = %err, "disconnect notification not delivered")
                    }
                }
            }
            self.close_endpoint_lanes(id, true);
            if let Some(mut endpoint) = self.endpoints.remove(&id) {
                endpoint.advance(EndpointState::Closed);
                if let Some(handle) = endpoint.close.take() {
                    self.complete_request(handle, Completion::closed());
                }
                tracing::info!(ep = id.0, "endpoint closed");
            }
            finished += 1;
        }
        finished
    }

    fn dispatch(&mut self) -> usize {
        let mut fired = 0;
        while let Some(handle) = self.completed.pop_front() {
            if let Some((callback, completion)) = self.requests.take_callback(handle) {
                callback(&mut self.user, handle, &completion);
                fired += 1;
            }
        }
        while let Some(notice) = self.notices.pop_front() {
            fired += 1;
            match notice {
                Notice::Failed { ep, error, handler } => {
                    let mut guard = handler.lock();
                    (&mut **guard)(&mut self.user, ep, &error);
                }
                Notice::Accepted { listener, ep } => match self.listeners.get_mut(&listener) {
                    Some(Listener {
                        on_accept: Some(on_accept),
                        ..
                    }) => on_accept(&mut self.user, ep),
                    Some(entry) => entry.accepted.push_back(ep),
                    None => tracing::debug!(
                        ep = ep.0,
                        "listener closed before its endpoint became ready"
                    ),
                },
            }
        }
        fired
    }

    pub(crate) fn send_control(&mut self, key: LaneKey, frame: &Frame) -> Result<()> {
        let iface = self
            .ifaces
            .get_mut(key.iface)
            .ok_or_else(|| EndpointError::fatal("lane refers to a missing interface"))?;
        match iface.send(key.lane, frame.encode())? {
            SendStatus::Queued => Ok(()),
            SendStatus::Busy => Err(EndpointError::busy(format!(
                "{} frame rejected by a congested lane",
                frame.name()
            ))),
        }
    }
}

fn unknown_endpoint(ep: EndpointId) -> EndpointError {
    EndpointError::invalid_param(format!("unknown endpoint {ep}"))
}

fn unknown_listener(listener: ListenerHandle) -> EndpointError {
    EndpointError::invalid_param(format!("unknown listener {}", listener.0))
}

fn stale_request(handle: RequestHandle) -> EndpointError {
    EndpointError::new(
        ErrorKind::InvalidParam,
        codes::REQUEST_STALE,
        format!("{handle:?} was already released or never issued"),
    )
}

fn wakeup_busy() -> EndpointError {
    EndpointError::new(
        ErrorKind::Busy,
        codes::WAKEUP_BUSY,
        "worker has unconsumed work; call progress() before arming",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LaneId, Transport, TransportCaps};
    use crate::wakeup::{EventRegistry, ReadyEvent};
    use tracing_test::traced_test;

    /// 服务 IPv4 地址、却从不连通的传输。
    #[derive(Debug)]
    struct Nowhere;

    #[derive(Debug)]
    struct NowhereIface {
        caps: TransportCaps,
    }

    impl Transport for Nowhere {
        fn name(&self) -> &'static str {
            "nowhere"
        }

        fn caps(&self) -> TransportCaps {
            TransportCaps {
                flags: Capabilities::AM | Capabilities::SOCKADDR,
                priority: 1,
                max_frame_len: 1024,
                max_bootstrap_len: 1024,
            }
        }

        fn serves(&self, addr: &SocketAddr) -> bool {
            addr.is_ipv4()
        }

        fn open(&self, _registry: &mut EventRegistry<'_>) -> Result<Box<dyn Iface>> {
            Ok(Box::new(NowhereIface { caps: self.caps() }))
        }
    }

    impl Iface for NowhereIface {
        fn name(&self) -> &'static str {
            "nowhere"
        }

        fn caps(&self) -> &TransportCaps {
            &self.caps
        }

        fn address(&self) -> Option<Bytes> {
            None
        }

        fn is_reachable(&self, _peer: &[u8]) -> bool {
            false
        }

        fn connect_sockaddr(
            &mut self,
            addr: SocketAddr,
            _registry: &mut EventRegistry<'_>,
        ) -> Result<LaneId> {
            Err(EndpointError::unreachable(format!("{addr} refused the connection")))
        }

        fn connect_peer(&mut self, _peer: &[u8], _registry: &mut EventRegistry<'_>) -> Result<LaneId> {
            Err(EndpointError::unreachable("no peers"))
        }

        fn send(&mut self, _lane: LaneId, _frame: Bytes) -> Result<SendStatus> {
            Ok(SendStatus::Busy)
        }

        fn lane_ready(&self, _lane: LaneId) -> bool {
            false
        }

        fn close_lane(&mut self, _lane: LaneId, _graceful: bool, _registry: &mut EventRegistry<'_>) {}

        fn on_ready(
            &mut self,
            _event: &ReadyEvent,
            _registry: &mut EventRegistry<'_>,
            _out: &mut Vec<IfaceEvent>,
        ) {
        }

        fn progress(
            &mut self,
            _budget: usize,
            _registry: &mut EventRegistry<'_>,
            _out: &mut Vec<IfaceEvent>,
        ) -> usize {
            0
        }

        fn has_pending(&self) -> bool {
            false
        }
    }

    fn worker(features: Features) -> Worker<Vec<ErrorKind>> {
        Context::builder()
            .features(features)
            .transport(Nowhere)
            .build()
            .expect("context")
            .create_worker(Vec::new())
            .expect("worker")
    }

    fn target() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9))
    }

    #[test]
    #[traced_test]
    fn peer_mode_failure_invokes_the_handler_once() {
        let mut worker = worker(Features::TAG);
        let ep = worker
            .connect(
                EndpointParams::sockaddr(target())
                    .err_mode(ErrorMode::Peer)
                    .on_error(|seen: &mut Vec<ErrorKind>, _, err| seen.push(err.kind())),
            )
            .expect("endpoint");
        // 失败延迟到 progress 中报告。
        assert!(worker.user().is_empty());
        assert!(worker.progress());
        for _ in 0..8 {
            worker.progress();
        }
        assert_eq!(worker.user(), &vec![ErrorKind::Unreachable]);
        assert_eq!(worker.endpoint_state(ep).expect("state"), EndpointState::Failed);
        assert!(logs_contain("endpoint failed"));
    }

    #[test]
    #[should_panic(expected = "no peer failure handler")]
    fn none_mode_failure_is_fatal() {
        let mut worker = worker(Features::TAG);
        worker
            .connect(EndpointParams::sockaddr(target()))
            .expect("endpoint");
        worker.progress();
    }

    #[test]
    fn listen_without_a_serving_transport_is_unreachable() {
        let mut worker = worker(Features::TAG);
        let err = worker
            .listen(SocketAddr::from(([0u16; 8], 0)), ListenerParams::default())
            .expect_err("no transport serves ipv6");
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert_eq!(err.code(), codes::NO_TRANSPORT);

        // 能服务该地址族的传输失败时，报告其自身的错误。
        let err = worker
            .listen(target(), ListenerParams::default())
            .expect_err("nowhere cannot listen");
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn wakeup_calls_require_the_feature() {
        let mut worker = worker(Features::TAG);
        assert_eq!(worker.arm().expect_err("no wakeup").kind(), ErrorKind::Unsupported);
        assert!(worker.wait(Some(Duration::ZERO)).is_err());
        let mut armed = self::worker(Features::TAG | Features::WAKEUP);
        armed.arm().expect("idle worker arms");
    }

    #[test]
    fn tag_operations_require_the_feature() {
        let mut worker = worker(Features::WAKEUP);
        let err = worker
            .post_receive(1, crate::tag::TAG_MASK_FULL, 8)
            .expect_err("tag matching disabled");
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn oversized_fragment_header_fails_the_endpoint() {
        let mut worker = worker(Features::TAG);
        let handler = crate::endpoint::share_handler(
            |seen: &mut Vec<ErrorKind>, _, err: &EndpointError| seen.push(err.kind()),
        );
        let ep = worker.allocate_endpoint(Role::Client, ErrorMode::Peer, Some(handler));
        worker.lanes.insert(
            LaneKey {
                iface: 0,
                lane: LaneId(1),
            },
            ep,
        );
        let frame = Frame::FragFirst {
            sender: 9,
            msg_id: 1,
            tag: 3,
            total: u64::MAX,
            chunk: Bytes::from_static(b"abc"),
        }
        .encode();

        worker.on_frame(0, Some(LaneId(1)), frame);
        while worker.progress() {}
        assert_eq!(worker.user(), &vec![ErrorKind::ProtocolViolation]);
        assert_eq!(worker.endpoint_state(ep).expect("state"), EndpointState::Failed);
    }

    #[test]
    fn sends_beyond_the_message_limit_are_refused() {
        let mut worker: Worker<Vec<ErrorKind>> = Context::builder()
            .config(crate::config::ContextConfig {
                max_message_len: 8,
                ..Default::default()
            })
            .features(Features::TAG)
            .transport(Nowhere)
            .build()
            .expect("context")
            .create_worker(Vec::new())
            .expect("worker");
        let ep = worker.allocate_endpoint(Role::Client, ErrorMode::Peer, None);
        let err = worker
            .post_send(ep, &b"nine byte"[..], 1)
            .expect_err("over the limit");
        assert_eq!(err.kind(), ErrorKind::InvalidParam);
        assert!(matches!(
            worker.post_send(ep, &b"eight by"[..], 1).expect("within the limit"),
            Posted::Pending(_)
        ));
    }

    #[test]
    fn unknown_ids_are_invalid() {
        let mut worker = worker(Features::TAG);
        assert_eq!(
            worker.endpoint_state(EndpointId(42)).expect_err("unknown").kind(),
            ErrorKind::InvalidParam
        );
        assert!(worker.close_endpoint(EndpointId(42), CloseMode::Force).is_err());
        assert!(worker.listener_address(ListenerHandle(7)).is_err());
        assert!(worker.take_accepted(ListenerHandle(7)).is_empty());
        assert!(!worker.progress());
    }
}
