//! 连接建立（wireup）：通道选择与控制帧处理。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 套接字地址连接只在引导通道上交换一次 Worker 地址，随后双方各自独立地为每种用途选择
//!   最合适的传输；选择规则对称，双方得到一致的结论；
//! - 直接连接（带外 Worker 地址）跳过交换，直接开通道。
//!
//! ## 逻辑 (How)
//! - 客户端：引导通道连通 → 发送 `ConnRequest`（本端地址，尺寸受传输引导容量限制）→ `Wireup`；
//!   收到 `ConnReply` 后选择并开通道，全部连通即 `Ready`；
//! - 服务端：接受引导连接 → 建立不可见的服务端端点；收到 `ConnRequest` 后选择通道、回复
//!   `ConnReply`，全部连通即 `Ready` 并交给监听者；拒绝时回复 `ConnReject`；
//! - 选择：主动消息通道必选，候选为引导接口与对端地址中同名、具备能力且可达的接口，
//!   优先级高者胜出，同级取先出现者（引导接口排在最前）；RMA/原子能力另需一条对端通道。
//!
//! ## 注意事项 (Trade-offs)
//! - 引导通道在不再被任何用途使用时由先就绪的一方优雅关闭；另一方随后看到的 EOF
//!   被安静地吸收，不计为端点失败。

use crate::address::WorkerAddress;
use crate::config::Features;
use crate::endpoint::{Endpoint, EndpointId, EndpointState, LaneKey, LaneSlot, LaneUsage, Role};
use crate::error::{EndpointError, ErrorKind, Result, codes};
use crate::request::{Completion, RequestKind};
use crate::tag::Delivery;
use crate::transport::{Capabilities, Iface, LaneId, ListenId};
use crate::wire::Frame;
use crate::worker::{Failure, Notice, Worker};
use bytes::Bytes;
use std::net::SocketAddr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LaneSource {
    /// 复用套接字地址引导通道。
    Bootstrap,
    /// 向对端接口地址新开通道。
    Peer(Bytes),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LanePlan {
    pub iface: usize,
    pub source: LaneSource,
    pub usage: LaneUsage,
}

#[derive(Debug)]
struct Candidate {
    iface: usize,
    source: LaneSource,
    priority: u8,
}

fn candidates(
    ifaces: &[Box<dyn Iface>],
    remote: &WorkerAddress,
    required: Capabilities,
    bootstrap: Option<usize>,
) -> Vec<Candidate> {
    let mut found = Vec::new();
    if let Some(index) = bootstrap
        && let Some(iface) = ifaces.get(index)
        && iface.caps().flags.contains(required)
    {
        found.push(Candidate {
            iface: index,
            source: LaneSource::Bootstrap,
            priority: iface.caps().priority,
        });
    }
    for entry in remote.ifaces() {
        if !entry.caps.contains(required) {
            continue;
        }
        for (index, iface) in ifaces.iter().enumerate() {
            if iface.name() == entry.name
                && iface.caps().flags.contains(required)
                && iface.is_reachable(&entry.addr)
            {
                found.push(Candidate {
                    iface: index,
                    source: LaneSource::Peer(entry.addr.clone()),
                    priority: iface.caps().priority,
                });
            }
        }
    }
    found
}

fn best(found: Vec<Candidate>) -> Option<Candidate> {
    found.into_iter().fold(None, |best, candidate| match best {
        Some(current) if current.priority >= candidate.priority => Some(current),
        _ => Some(candidate),
    })
}

fn no_transport(what: &str, remote: &WorkerAddress) -> EndpointError {
    EndpointError::new(
        ErrorKind::Unreachable,
        codes::NO_TRANSPORT,
        format!(
            "no transport reaches worker {:#x} for {what}",
            remote.uuid()
        ),
    )
}

/// 为到 `remote` 的端点选择通道。
pub(crate) fn select_lanes(
    ifaces: &[Box<dyn Iface>],
    remote: &WorkerAddress,
    features: Features,
    bootstrap: Option<usize>,
) -> Result<Vec<LanePlan>> {
    let am = best(candidates(ifaces, remote, Capabilities::AM, bootstrap))
        .ok_or_else(|| no_transport("active messages", remote))?;
    let mut plans = vec![LanePlan {
        iface: am.iface,
        source: am.source,
        usage: LaneUsage::AM,
    }];

    let remote_caps = Capabilities::for_remote_access(features);
    if !remote_caps.is_empty() {
        let chosen = best(candidates(ifaces, remote, remote_caps, None))
            .ok_or_else(|| no_transport("remote memory access", remote))?;
        let mut usage = LaneUsage::empty();
        if remote_caps.contains(Capabilities::RMA) {
            usage |= LaneUsage::RMA;
        }
        if remote_caps.intersects(Capabilities::AMO32 | Capabilities::AMO64) {
            usage |= LaneUsage::AMO;
        }
        match plans
            .iter_mut()
            .find(|plan| plan.iface == chosen.iface && plan.source == chosen.source)
        {
            Some(plan) => plan.usage |= usage,
            None => plans.push(LanePlan {
                iface: chosen.iface,
                source: chosen.source,
                usage,
            }),
        }
    }
    Ok(plans)
}

impl<U> Worker<U> {
    /// 按计划开通道并登记到端点；失败时已开的通道留在端点上，由调用方统一回收。
    pub(crate) fn open_lanes(
        &mut self,
        id: EndpointId,
        plans: Vec<LanePlan>,
        bootstrap: Option<LaneKey>,
    ) -> Result<()> {
        for plan in plans {
            let Some(iface) = self.ifaces.get_mut(plan.iface) else {
                return Err(EndpointError::fatal("lane plan refers to a missing interface"));
            };
            let transport = iface.name();
            let (key, connected) = match plan.source {
                LaneSource::Bootstrap => {
                    let key = bootstrap.ok_or_else(|| {
                        EndpointError::fatal("lane plan reuses a bootstrap lane that does not exist")
                    })?;
                    (key, true)
                }
                LaneSource::Peer(addr) => {
                    let mut registry = self.events.registry_for(plan.iface);
                    let lane = iface.connect_peer(&addr, &mut registry)?;
                    let key = LaneKey {
                        iface: plan.iface,
                        lane,
                    };
                    self.lanes.insert(key, id);
                    (key, false)
                }
            };
            let Some(endpoint) = self.endpoints.get_mut(&id) else {
                return Err(EndpointError::fatal(format!("endpoint {id} vanished during wireup")));
            };
            tracing::debug!(
                ep = id.0,
                transport,
                lane = %key.lane,
                usage = ?plan.usage,
                "lane selected"
            );
            endpoint.lanes.push(LaneSlot {
                key,
                usage: plan.usage,
                connected,
                transport,
            });
        }
        Ok(())
    }

    pub(crate) fn on_accepted(
        &mut self,
        iface: usize,
        listen_id: ListenId,
        lane: LaneId,
        peer: SocketAddr,
    ) {
        let key = LaneKey { iface, lane };
        let Some((&handle, listener)) = self
            .listeners
            .iter_mut()
            .find(|(_, listener)| listener.iface == iface && listener.listen_id == listen_id)
        else {
            tracing::debug!(peer = %peer, "connection accepted for a closed listener");
            self.release_lane(key, false);
            return;
        };
        listener.attempts += 1;
        let err_mode = listener.err_mode;
        let handler = listener.on_error.clone();
        let id = EndpointId(self.next_ep);
        self.next_ep += 1;
        let mut endpoint = Endpoint::new(
            id,
            Role::Server(handle),
            err_mode,
            self.context.features(),
        );
        endpoint.handler = handler;
        endpoint.peer = Some(peer);
        endpoint.bootstrap = Some(key);
        self.endpoints.insert(id, endpoint);
        self.lanes.insert(key, id);
        tracing::debug!(ep = id.0, listener = handle.0, peer = %peer, "connection accepted");
    }

    pub(crate) fn on_lane_connected(&mut self, key: LaneKey) {
        let Some(&id) = self.lanes.get(&key) else {
            return;
        };
        let Some(endpoint) = self.endpoints.get_mut(&id) else {
            return;
        };
        if endpoint.bootstrap == Some(key)
            && endpoint.role == Role::Client
            && endpoint.state == EndpointState::Connecting
        {
            self.send_conn_request(id, key);
            return;
        }
        if let Some(slot) = endpoint.lanes.iter_mut().find(|slot| slot.key == key) {
            slot.connected = true;
        }
        if endpoint.state == EndpointState::Wireup && endpoint.lanes_connected() {
            self.mark_ready(id);
        }
    }

    fn send_conn_request(&mut self, id: EndpointId, key: LaneKey) {
        let frame = Frame::ConnRequest {
            client_ep: id.0,
            features: self.context.features(),
            address: self.address(),
        };
        let encoded = frame.encode();
        let capacity = self
            .ifaces
            .get(key.iface)
            .map_or(0, |iface| iface.caps().max_bootstrap_len);
        if encoded.len() > capacity {
            tracing::error!(
                ep = id.0,
                length = encoded.len(),
                capacity,
                "worker address information ({} bytes) exceeds the bootstrap capacity ({capacity} bytes)",
                encoded.len()
            );
            self.schedule_failure(
                id,
                EndpointError::new(
                    ErrorKind::AddressTooLarge,
                    codes::ADDRESS_TOO_LARGE,
                    format!(
                        "connection request of {} bytes exceeds the bootstrap capacity of {capacity} bytes",
                        encoded.len()
                    ),
                ),
            );
            return;
        }
        match self.send_control(key, &frame) {
            Ok(()) => {
                if let Some(endpoint) = self.endpoints.get_mut(&id) {
                    endpoint.advance(EndpointState::Wireup);
                }
                tracing::debug!(ep = id.0, length = encoded.len(), "connection request sent");
            }
            Err(err) => self.schedule_failure(id, err),
        }
    }

    pub(crate) fn on_frame(&mut self, iface: usize, lane: Option<LaneId>, raw: Bytes) {
        let owner = lane.and_then(|lane| self.lanes.get(&LaneKey { iface, lane }).copied());
        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(err) => {
                self.protocol_failure(owner, err);
                return;
            }
        };
        match frame {
            Frame::ConnRequest {
                client_ep,
                features,
                address,
            } => match lane {
                Some(lane) => {
                    self.on_conn_request(LaneKey { iface, lane }, client_ep, features, address)
                }
                None => tracing::warn!(
                    transport = self.iface_name(iface),
                    "connection request arrived without a bootstrap lane"
                ),
            },
            Frame::ConnReply {
                client_ep,
                server_ep,
                address,
            } => self.on_conn_reply(EndpointId(client_ep), server_ep, address),
            Frame::ConnReject {
                client_ep,
                kind,
                reason,
            } => self.on_conn_reject(EndpointId(client_ep), kind, reason),
            Frame::Eager {
                sender: _,
                tag,
                payload,
            } => {
                let delivery = self.matcher.on_eager(tag, payload);
                self.deliver(delivery);
            }
            Frame::FragFirst {
                sender,
                msg_id,
                tag,
                total,
                chunk,
            } => {
                let result = usize::try_from(total)
                    .map_err(|_| EndpointError::protocol("fragmented message length overflows"))
                    .and_then(|total| self.matcher.on_first((sender, msg_id), tag, total, chunk));
                match result {
                    Ok(delivery) => self.deliver(delivery),
                    Err(err) => self.protocol_failure(owner, err),
                }
            }
            Frame::FragNext {
                sender,
                msg_id,
                offset,
                chunk,
            } => {
                let result = usize::try_from(offset)
                    .map_err(|_| EndpointError::protocol("fragment offset overflows"))
                    .and_then(|offset| self.matcher.on_next((sender, msg_id), offset, chunk));
                match result {
                    Ok(delivery) => self.deliver(delivery),
                    Err(err) => self.protocol_failure(owner, err),
                }
            }
            Frame::Disconnect { dest_ep } => self.on_disconnect(EndpointId(dest_ep)),
        }
    }

    fn iface_name(&self, iface: usize) -> &'static str {
        self.ifaces.get(iface).map_or("unknown", |iface| iface.name())
    }

    fn deliver(&mut self, delivery: Option<Delivery>) {
        if let Some(delivery) = delivery {
            self.complete_request(delivery.handle, delivery.completion);
        }
    }

    fn protocol_failure(&mut self, owner: Option<EndpointId>, err: EndpointError) {
        match owner {
            Some(id) => self.schedule_failure(id, err),
            None => tracing::warn!(code = err.code(), "dropping malformed frame: {}", err.message()),
        }
    }

    fn on_conn_request(
        &mut self,
        key: LaneKey,
        client_ep: u64,
        features: Features,
        address: WorkerAddress,
    ) {
        let Some(&id) = self.lanes.get(&key) else {
            return;
        };
        let Some(endpoint) = self.endpoints.get_mut(&id) else {
            return;
        };
        let Role::Server(listener) = endpoint.role else {
            self.schedule_failure(
                id,
                EndpointError::protocol("connection request on a client lane"),
            );
            return;
        };
        if !endpoint.advance(EndpointState::Wireup) {
            self.schedule_failure(id, EndpointError::protocol("duplicate connection request"));
            return;
        }
        endpoint.remote_ep = Some(client_ep);
        tracing::debug!(ep = id.0, client_ep, peer = address.uuid(), "connection request received");

        let rejecting = self
            .listeners
            .get(&listener)
            .is_none_or(|entry| entry.rejecting);
        if rejecting {
            self.reject_request(
                id,
                key,
                client_ep,
                ErrorKind::Unreachable,
                "listener is not accepting connections".to_owned(),
            );
            return;
        }
        let local = self.context.features();
        if !local.contains(features) {
            self.reject_request(
                id,
                key,
                client_ep,
                ErrorKind::Unsupported,
                format!("features {:?} are not enabled on the server", features - local),
            );
            return;
        }
        let opened = select_lanes(&self.ifaces, &address, local, Some(key.iface))
            .and_then(|plans| self.open_lanes(id, plans, Some(key)));
        if let Err(err) = opened {
            self.reject_request(id, key, client_ep, err.kind(), err.message().to_owned());
            return;
        }

        let reply = Frame::ConnReply {
            client_ep,
            server_ep: id.0,
            address: self.address(),
        };
        let capacity = self
            .ifaces
            .get(key.iface)
            .map_or(0, |iface| iface.caps().max_bootstrap_len);
        let length = reply.encode().len();
        if length > capacity {
            tracing::error!(
                ep = id.0,
                length,
                capacity,
                "worker address information ({length} bytes) exceeds the bootstrap capacity ({capacity} bytes)"
            );
            self.reject_request(
                id,
                key,
                client_ep,
                ErrorKind::AddressTooLarge,
                format!("server address of {length} bytes exceeds the bootstrap capacity"),
            );
            return;
        }
        if let Err(err) = self.send_control(key, &reply) {
            self.schedule_failure(id, err);
            return;
        }
        if self
            .endpoints
            .get(&id)
            .is_some_and(|endpoint| endpoint.lanes_connected())
        {
            self.mark_ready(id);
        }
    }

    fn reject_request(
        &mut self,
        id: EndpointId,
        key: LaneKey,
        client_ep: u64,
        kind: ErrorKind,
        reason: String,
    ) {
        tracing::info!(ep = id.0, ?kind, "rejecting connection request: {reason}");
        let frame = Frame::ConnReject {
            client_ep,
            kind,
            reason,
        };
        if let Err(err) = self.send_control(key, &frame) {
            tracing::debug!(ep = id.0, error = %err, "connection reject not delivered");
        }
        self.close_endpoint_lanes(id, true);
        self.endpoints.remove(&id);
    }

    fn on_conn_reply(&mut self, id: EndpointId, server_ep: u64, address: WorkerAddress) {
        let Some(endpoint) = self.endpoints.get_mut(&id) else {
            tracing::debug!(ep = id.0, "connection reply for an unknown endpoint");
            return;
        };
        if endpoint.role != Role::Client || endpoint.state != EndpointState::Wireup {
            tracing::debug!(ep = id.0, state = ?endpoint.state, "unexpected connection reply");
            return;
        }
        endpoint.remote_ep = Some(server_ep);
        let bootstrap = endpoint.bootstrap;
        tracing::debug!(ep = id.0, server_ep, peer = address.uuid(), "connection reply received");
        let opened = select_lanes(
            &self.ifaces,
            &address,
            self.context.features(),
            bootstrap.map(|key| key.iface),
        )
        .and_then(|plans| self.open_lanes(id, plans, bootstrap));
        match opened {
            Ok(()) => {
                if self
                    .endpoints
                    .get(&id)
                    .is_some_and(|endpoint| endpoint.lanes_connected())
                {
                    self.mark_ready(id);
                }
            }
            Err(err) => self.schedule_failure(id, err),
        }
    }

    fn on_conn_reject(&mut self, id: EndpointId, kind: ErrorKind, reason: String) {
        let is_client = self
            .endpoints
            .get(&id)
            .is_some_and(|endpoint| endpoint.role == Role::Client);
        if !is_client {
            tracing::debug!(ep = id.0, "connection reject for an unknown endpoint");
            return;
        }
        self.schedule_failure(
            id,
            EndpointError::new(
                kind,
                codes::WIREUP_REJECTED,
                format!("connection rejected by peer: {reason}"),
            ),
        );
    }

    fn on_disconnect(&mut self, id: EndpointId) {
        let Some(endpoint) = self.endpoints.get(&id) else {
            return;
        };
        if endpoint.state.is_terminal() || endpoint.state == EndpointState::Closing {
            return;
        }
        tracing::debug!(ep = id.0, "peer disconnected");
        self.failures.push_back(Failure {
            ep: id,
            error: EndpointError::new(
                ErrorKind::ConnectionReset,
                codes::PEER_DISCONNECTED,
                format!("peer closed endpoint {id}"),
            ),
            graceful: true,
        });
    }

    pub(crate) fn on_lane_failed(&mut self, key: LaneKey, error: EndpointError) {
        let Some(id) = self.lanes.remove(&key) else {
            return;
        };
        let Some(endpoint) = self.endpoints.get_mut(&id) else {
            return;
        };
        if endpoint.bootstrap == Some(key) && !endpoint.uses_lane(key) && endpoint.remote_ep.is_some()
        {
            endpoint.bootstrap = None;
            tracing::debug!(ep = id.0, "bootstrap lane closed by peer");
            return;
        }
        let state = endpoint.state;
        match state {
            EndpointState::Closing => {
                endpoint.lanes.retain(|slot| slot.key != key);
                if endpoint.bootstrap == Some(key) {
                    endpoint.bootstrap = None;
                }
                let sends: Vec<_> = endpoint.sends.drain(..).collect();
                for handle in sends {
                    self.complete_request(
                        handle,
                        Completion::failed(RequestKind::Send, error.clone()),
                    );
                }
            }
            EndpointState::Connecting | EndpointState::Wireup
                if error.kind() == ErrorKind::ConnectionReset =>
            {
                let message = format!("peer unreachable during wireup: {}", error.message());
                self.schedule_failure(
                    id,
                    EndpointError::new(ErrorKind::Unreachable, codes::UNREACHABLE, message)
                        .with_cause(error),
                );
            }
            _ => self.schedule_failure(id, error),
        }
    }

    /// 端点全部通道连通：迁移到 `Ready`，回收不再使用的引导通道，服务端端点交给监听者。
    fn mark_ready(&mut self, id: EndpointId) {
        let Some(endpoint) = self.endpoints.get_mut(&id) else {
            return;
        };
        if !endpoint.advance(EndpointState::Ready) {
            return;
        }
        let unused = endpoint
            .bootstrap
            .filter(|bootstrap| !endpoint.uses_lane(*bootstrap));
        if unused.is_some() {
            endpoint.bootstrap = None;
        }
        let role = endpoint.role;
        if let Role::Server(_) = role {
            endpoint.announced = true;
        }
        tracing::info!(
            ep = id.0,
            lanes = endpoint.lanes.len(),
            peer = ?endpoint.peer,
            "endpoint ready"
        );
        if let Some(key) = unused {
            self.release_lane(key, true);
        }
        if let Role::Server(listener) = role {
            self.notices.push_back(Notice::Accepted { listener, ep: id });
        }
    }
}
