use crate::MemConfig;
use crate::fabric::{Delivery, Fabric, Mailbox};
use bytes::Bytes;
use mio::Waker;
use spark_endpoint::{
    EndpointError, ErrorKind, EventRegistry, Iface, IfaceEvent, LaneId, ReadyEvent, Result,
    SendStatus, TransportCaps, codes,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// 对端离开时的错误码。
pub(crate) const PEER_GONE_CODE: &str = "spark.transport.mem.peer_gone";

/// 一个 Worker 在 fabric 上的接口。
///
/// # 教案式注释
///
/// ## 逻辑 (How)
/// - 通道只是指向对端邮箱的引用：开通道即查找邮箱，`Connected` 在下一次 `progress` 中报告；
/// - 发送把帧压入对端邮箱并唤醒对端 Worker；邮箱满时返回 `Busy`，并登记自身 waker，
///   对端收取后唤醒本 Worker 重试；
/// - `progress` 先报告新通道，再检查对端是否离开，最后按预算收取自身邮箱；
/// - 开通道时在对端邮箱上登记自身 waker，对端离开会唤醒本 Worker 处理 `Failed`。
///
/// ## 契约 (What)
/// - 收到的帧不带通道标识，帧头中的端点标识负责路由；
/// - 对端接口销毁后，每条指向它的通道恰好报告一次 `Failed`。
#[derive(Debug)]
pub(crate) struct MemIface {
    fabric: Arc<Fabric>,
    caps: TransportCaps,
    id: u64,
    address: Bytes,
    inbox: Arc<Mailbox>,
    waker: Arc<Waker>,
    lanes: HashMap<LaneId, Arc<Mailbox>>,
    connected: VecDeque<LaneId>,
    next_lane: u64,
}

impl MemIface {
    pub(crate) fn open(
        fabric: Arc<Fabric>,
        config: &MemConfig,
        caps: TransportCaps,
        registry: &mut EventRegistry<'_>,
    ) -> Self {
        let waker = registry.waker();
        let inbox = Arc::new(Mailbox::new(Arc::clone(&waker), config.mailbox_capacity));
        let id = fabric.attach(Arc::clone(&inbox));
        let address = fabric.encode_address(id);
        tracing::debug!(fabric = fabric.id(), iface = id, "attached mem interface");
        Self {
            fabric,
            caps,
            id,
            address,
            inbox,
            waker,
            lanes: HashMap::new(),
            connected: VecDeque::new(),
            next_lane: 1,
        }
    }

    fn reap_departed(&mut self, out: &mut Vec<IfaceEvent>) -> usize {
        let departed: Vec<LaneId> = self
            .lanes
            .iter()
            .filter(|(_, mailbox)| !mailbox.is_alive())
            .map(|(lane, _)| *lane)
            .collect();
        for lane in &departed {
            self.lanes.remove(lane);
            self.connected.retain(|pending| pending != lane);
            tracing::debug!(%lane, "mem peer departed");
            out.push(IfaceEvent::Failed {
                lane: *lane,
                error: peer_gone(),
            });
        }
        departed.len()
    }
}

fn peer_gone() -> EndpointError {
    EndpointError::new(
        ErrorKind::ConnectionReset,
        PEER_GONE_CODE,
        "mem peer interface is gone",
    )
}

impl Iface for MemIface {
    fn name(&self) -> &'static str {
        crate::TRANSPORT_NAME
    }

    fn caps(&self) -> &TransportCaps {
        &self.caps
    }

    fn address(&self) -> Option<Bytes> {
        Some(self.address.clone())
    }

    fn is_reachable(&self, peer: &[u8]) -> bool {
        self.fabric
            .decode_address(peer)
            .and_then(|iface| self.fabric.lookup(iface))
            .is_some_and(|mailbox| mailbox.is_alive())
    }

    fn connect_peer(&mut self, peer: &[u8], _registry: &mut EventRegistry<'_>) -> Result<LaneId> {
        let mailbox = self
            .fabric
            .decode_address(peer)
            .and_then(|iface| self.fabric.lookup(iface))
            .ok_or_else(|| {
                EndpointError::new(
                    ErrorKind::Unreachable,
                    codes::NO_TRANSPORT,
                    "mem peer is not attached to this fabric",
                )
            })?;
        mailbox.watch(&self.waker);
        let lane = LaneId(self.next_lane);
        self.next_lane += 1;
        self.lanes.insert(lane, mailbox);
        self.connected.push_back(lane);
        tracing::debug!(%lane, iface = self.id, "opened mem lane");
        Ok(lane)
    }

    fn send(&mut self, lane: LaneId, frame: Bytes) -> Result<SendStatus> {
        let Some(mailbox) = self.lanes.get(&lane) else {
            return Err(peer_gone());
        };
        if frame.len() > self.caps.max_frame_len {
            return Err(EndpointError::invalid_param(format!(
                "frame of {} bytes exceeds the mem frame limit of {} bytes",
                frame.len(),
                self.caps.max_frame_len
            )));
        }
        match mailbox.push(frame) {
            Delivery::Queued => Ok(SendStatus::Queued),
            Delivery::Full => {
                mailbox.has_room(&self.waker);
                Ok(SendStatus::Busy)
            }
            Delivery::Gone => {
                self.lanes.remove(&lane);
                Err(peer_gone())
            }
        }
    }

    fn lane_ready(&self, lane: LaneId) -> bool {
        self.lanes
            .get(&lane)
            .is_some_and(|mailbox| mailbox.is_alive() && mailbox.has_room(&self.waker))
    }

    fn close_lane(&mut self, lane: LaneId, _graceful: bool, _registry: &mut EventRegistry<'_>) {
        // 帧在 send 时已进入对端邮箱，优雅关闭无需额外排空。
        if self.lanes.remove(&lane).is_some() {
            self.connected.retain(|pending| *pending != lane);
            tracing::debug!(%lane, "closed mem lane");
        }
    }

    fn on_ready(
        &mut self,
        _event: &ReadyEvent,
        _registry: &mut EventRegistry<'_>,
        _out: &mut Vec<IfaceEvent>,
    ) {
    }

    fn progress(
        &mut self,
        budget: usize,
        _registry: &mut EventRegistry<'_>,
        out: &mut Vec<IfaceEvent>,
    ) -> usize {
        let mut count = 0;
        while count < budget {
            let Some(lane) = self.connected.pop_front() else {
                break;
            };
            out.push(IfaceEvent::Connected { lane });
            count += 1;
        }
        count += self.reap_departed(out);

        let mut frames = Vec::new();
        self.inbox.pop_batch(budget.saturating_sub(count), &mut frames);
        count += frames.len();
        out.extend(
            frames
                .into_iter()
                .map(|frame| IfaceEvent::Received { lane: None, frame }),
        );
        count
    }

    fn has_pending(&self) -> bool {
        !self.connected.is_empty()
            || !self.inbox.is_empty()
            || self.lanes.values().any(|mailbox| !mailbox.is_alive())
    }
}

impl Drop for MemIface {
    fn drop(&mut self) {
        self.fabric.detach(self.id);
        tracing::debug!(fabric = self.fabric.id(), iface = self.id, "detached mem interface");
    }
}
