use crate::{
    TcpConfig,
    backpressure::WriteReadiness,
    channel::{ChannelState, ReadOutcome, TcpChannel},
    error::{self, UNKNOWN_LANE_CODE, map_io_error, peer_closed},
    listener::TcpListener,
};
use bytes::Bytes;
use mio::{Interest, Token};
use spark_endpoint::{
    EndpointError, ErrorKind, EventRegistry, Iface, IfaceEvent, LaneId, ListenId, ReadyEvent,
    Result, SendStatus, TransportCaps,
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

#[derive(Clone, Copy, Debug)]
enum Source {
    Listener(ListenId),
    Channel(LaneId),
}

/// 一个 Worker 的 TCP 接口：监听者与连接都注册在 Worker 的事件源上。
///
/// 就绪事件产生的接口事件先进入 `pending`，由 `progress` 按预算交给 Worker，
/// 保证单次推进有界，同时保留同一连接上“先数据、后失败”的顺序。
#[derive(Debug)]
pub(crate) struct TcpIface {
    config: TcpConfig,
    caps: TransportCaps,
    listeners: HashMap<ListenId, TcpListener>,
    channels: HashMap<LaneId, TcpChannel>,
    sources: HashMap<Token, Source>,
    pending: VecDeque<IfaceEvent>,
    next_lane: u64,
    next_listen: u64,
}

impl TcpIface {
    pub(crate) fn new(config: TcpConfig, caps: TransportCaps) -> Self {
        Self {
            config,
            caps,
            listeners: HashMap::new(),
            channels: HashMap::new(),
            sources: HashMap::new(),
            pending: VecDeque::new(),
            next_lane: 1,
            next_listen: 1,
        }
    }

    fn allocate_lane(&mut self) -> LaneId {
        let lane = LaneId(self.next_lane);
        self.next_lane += 1;
        lane
    }

    fn install_channel(
        &mut self,
        lane: LaneId,
        mut channel: TcpChannel,
        registry: &mut EventRegistry<'_>,
    ) -> Result<()> {
        let token = registry
            .register(&mut channel.stream, Interest::READABLE | Interest::WRITABLE)
            .map_err(|err| map_io_error(error::REGISTER, err))?;
        channel.token = Some(token);
        self.sources.insert(token, Source::Channel(lane));
        self.channels.insert(lane, channel);
        Ok(())
    }

    fn drop_channel(&mut self, lane: LaneId, registry: &mut EventRegistry<'_>) {
        let Some(mut channel) = self.channels.remove(&lane) else {
            return;
        };
        if let Some(token) = channel.token.take() {
            self.sources.remove(&token);
            if let Err(err) = registry.deregister(&mut channel.stream, token) {
                tracing::debug!(%lane, ?err, "failed to deregister tcp connection");
            }
        }
        tracing::debug!(%lane, peer = %channel.peer_addr, "tcp connection closed");
    }

    fn fail_channel(&mut self, lane: LaneId, error: EndpointError, registry: &mut EventRegistry<'_>) {
        let draining = self
            .channels
            .get(&lane)
            .is_some_and(|channel| channel.state == ChannelState::Draining);
        self.drop_channel(lane, registry);
        if !draining {
            self.pending.push_back(IfaceEvent::Failed { lane, error });
        }
    }

    fn on_listener_ready(&mut self, id: ListenId, registry: &mut EventRegistry<'_>) {
        let Some(listener) = self.listeners.get_mut(&id) else {
            return;
        };
        let (accepted, failure) = listener.accept_all();
        let local_addr = listener.local_addr;
        for (stream, peer) in accepted {
            let lane = self.allocate_lane();
            let channel = TcpChannel::accepted(
                stream,
                peer,
                &self.config.socket,
                self.config.max_frame_len,
                self.config.send_high_watermark,
            )
            .and_then(|channel| self.install_channel(lane, channel, registry));
            match channel {
                Ok(()) => {
                    tracing::info!(%lane, %local_addr, peer_addr = %peer, "accepting connection");
                    self.pending.push_back(IfaceEvent::Accepted {
                        listener: id,
                        lane,
                        peer,
                    });
                }
                Err(err) => {
                    tracing::warn!(%local_addr, peer_addr = %peer, error = %err, "dropping accepted connection");
                }
            }
        }
        if failure.is_some() {
            self.remove_listener(id, registry);
        }
    }

    fn remove_listener(&mut self, id: ListenId, registry: &mut EventRegistry<'_>) {
        let Some(mut listener) = self.listeners.remove(&id) else {
            return;
        };
        if let Some(token) = listener.token.take() {
            self.sources.remove(&token);
            if let Err(err) = registry.deregister(&mut listener.inner, token) {
                tracing::debug!(?err, "failed to deregister tcp listener");
            }
        }
        tracing::info!(local_addr = %listener.local_addr, "closed listener");
    }

    fn on_channel_ready(
        &mut self,
        lane: LaneId,
        event: &ReadyEvent,
        registry: &mut EventRegistry<'_>,
    ) {
        let socket = self.config.socket.clone();
        let Some(channel) = self.channels.get_mut(&lane) else {
            return;
        };
        if channel.state == ChannelState::Connecting {
            match channel.finish_connect(&socket) {
                Ok(true) => {
                    tracing::info!(%lane, peer_addr = %channel.peer_addr, "connection established");
                    self.pending.push_back(IfaceEvent::Connected { lane });
                }
                Ok(false) => return,
                Err(err) => {
                    tracing::info!(%lane, peer_addr = %channel.peer_addr, error = %err, "connection failed");
                    self.fail_channel(lane, err, registry);
                    return;
                }
            }
        }

        let Some(channel) = self.channels.get_mut(&lane) else {
            return;
        };
        if event.writable
            && channel.has_queued()
            && let Err(err) = channel.flush()
        {
            self.fail_channel(lane, err, registry);
            return;
        }

        let Some(channel) = self.channels.get_mut(&lane) else {
            return;
        };
        if channel.state == ChannelState::Draining {
            self.progress_draining(lane, event, registry);
            return;
        }
        if !(event.readable || event.read_closed || event.error) {
            return;
        }
        let mut frames = Vec::new();
        let outcome = channel.read_frames(&mut frames);
        if !frames.is_empty() {
            tracing::debug!(%lane, frames = frames.len(), "received frames");
        }
        for frame in frames {
            self.pending.push_back(IfaceEvent::Received {
                lane: Some(lane),
                frame,
            });
        }
        match outcome {
            Ok(ReadOutcome::Open) => {}
            Ok(ReadOutcome::Closed) => self.fail_channel(lane, peer_closed(), registry),
            Err(err) => self.fail_channel(lane, err, registry),
        }
    }

    fn progress_draining(&mut self, lane: LaneId, event: &ReadyEvent, registry: &mut EventRegistry<'_>) {
        let Some(channel) = self.channels.get_mut(&lane) else {
            return;
        };
        let mut discarded = Vec::new();
        let closed = (event.readable || event.read_closed || event.error)
            && !matches!(channel.read_frames(&mut discarded), Ok(ReadOutcome::Open));
        if closed || !channel.has_queued() {
            channel.shutdown_write();
            self.drop_channel(lane, registry);
        }
    }
}

impl Iface for TcpIface {
    fn name(&self) -> &'static str {
        crate::TRANSPORT_NAME
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

    fn listen(
        &mut self,
        addr: SocketAddr,
        registry: &mut EventRegistry<'_>,
    ) -> Result<(ListenId, SocketAddr)> {
        let mut listener = TcpListener::bind(addr, self.config.backlog)?;
        let token = registry
            .register(&mut listener.inner, Interest::READABLE)
            .map_err(|err| map_io_error(error::REGISTER, err))?;
        listener.token = Some(token);
        let id = ListenId(self.next_listen);
        self.next_listen += 1;
        let local_addr = listener.local_addr;
        tracing::info!(local_addr = %local_addr, "listening for connections");
        self.sources.insert(token, Source::Listener(id));
        self.listeners.insert(id, listener);
        Ok((id, local_addr))
    }

    fn close_listener(&mut self, id: ListenId, registry: &mut EventRegistry<'_>) {
        self.remove_listener(id, registry);
    }

    fn connect_sockaddr(
        &mut self,
        addr: SocketAddr,
        registry: &mut EventRegistry<'_>,
    ) -> Result<LaneId> {
        let channel = TcpChannel::connect(
            addr,
            self.config.max_frame_len,
            self.config.send_high_watermark,
        )?;
        let lane = self.allocate_lane();
        self.install_channel(lane, channel, registry)?;
        tracing::info!(%lane, peer_addr = %addr, "initiating connection");
        Ok(lane)
    }

    fn connect_peer(&mut self, _peer: &[u8], _registry: &mut EventRegistry<'_>) -> Result<LaneId> {
        Err(EndpointError::unsupported(
            "tcp lanes are only created from socket addresses",
        ))
    }

    fn send(&mut self, lane: LaneId, frame: Bytes) -> Result<SendStatus> {
        let Some(channel) = self.channels.get_mut(&lane) else {
            return Err(EndpointError::new(
                ErrorKind::ConnectionReset,
                UNKNOWN_LANE_CODE,
                format!("tcp {lane} is closed"),
            ));
        };
        if frame.len() > self.config.max_frame_len {
            return Err(EndpointError::invalid_param(format!(
                "frame of {} bytes exceeds the tcp frame limit of {} bytes",
                frame.len(),
                self.config.max_frame_len
            )));
        }
        if channel.state != ChannelState::Open || channel.readiness() != WriteReadiness::Ready {
            return Ok(SendStatus::Busy);
        }
        channel.enqueue(frame);
        match channel.flush() {
            Ok(()) => Ok(SendStatus::Queued),
            Err(err) => {
                // 写错误同步返回给调用方，此后不再报告该通道的失败事件。
                if let Some(token) = self.channels.remove(&lane).and_then(|channel| channel.token) {
                    self.sources.remove(&token);
                }
                Err(err)
            }
        }
    }

    fn lane_ready(&self, lane: LaneId) -> bool {
        self.channels.get(&lane).is_some_and(|channel| {
            channel.state == ChannelState::Open && channel.readiness() == WriteReadiness::Ready
        })
    }

    fn close_lane(&mut self, lane: LaneId, graceful: bool, registry: &mut EventRegistry<'_>) {
        let Some(channel) = self.channels.get_mut(&lane) else {
            return;
        };
        if graceful && channel.state == ChannelState::Open && channel.has_queued() {
            tracing::debug!(%lane, "draining tcp connection before close");
            channel.state = ChannelState::Draining;
            return;
        }
        if graceful {
            channel.shutdown_write();
        }
        self.drop_channel(lane, registry);
    }

    fn on_ready(
        &mut self,
        event: &ReadyEvent,
        registry: &mut EventRegistry<'_>,
        _out: &mut Vec<IfaceEvent>,
    ) {
        match self.sources.get(&event.token).copied() {
            Some(Source::Listener(id)) => self.on_listener_ready(id, registry),
            Some(Source::Channel(lane)) => self.on_channel_ready(lane, event, registry),
            None => tracing::trace!(token = event.token.0, "event for a released tcp source"),
        }
    }

    fn progress(
        &mut self,
        budget: usize,
        _registry: &mut EventRegistry<'_>,
        out: &mut Vec<IfaceEvent>,
    ) -> usize {
        let count = budget.min(self.pending.len());
        out.extend(self.pending.drain(..count));
        count
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
