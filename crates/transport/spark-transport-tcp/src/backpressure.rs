use std::time::{Duration, Instant};

/// 通道写路径的背压判定结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteReadiness {
    /// 可以继续接收新帧。
    Ready,
    /// 排队字节超过高水位。
    Saturated,
    /// 内核发送缓冲连续拥塞，暂缓接收新帧直至下一次可写事件。
    Throttled,
}

/// 管理 TCP 写路径的背压统计。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 聚合最近一次 `WouldBlock` 的时间戳与计数，以及用户态写队列的排队字节数，
///   转化为通道是否还能接收新帧的判断，供 Worker 在推送分片前查询；
/// - 通过统一的节奏控制，避免在套接字暂时拥塞时把整条消息都堆进用户态队列。
///
/// ## 逻辑 (How)
/// - 使用 `consecutive_would_block` 记录连续 `WouldBlock` 次数；
/// - `readiness` 在事件间隔超过 `WOULD_BLOCK_DECAY` 时忽略旧计数，
///   保持历史数据不过度影响当前状态；
/// - `on_drained` 在写队列清空后清零状态。
///
/// ## 契约 (What)
/// - 所有方法都在拥有通道的 Worker 线程上调用；
/// - `Throttled` 只会在至少一次 `WouldBlock` 之后出现，而 `WouldBlock` 必然伴随后续的可写事件，
///   因此节流不会让通道永久停摆。
///
/// ## 注意事项 (Trade-offs)
/// - 由于使用 `Instant` 做时间窗口，若系统时钟发生跳变，可能导致
///   统计被提前或延后重置。
#[derive(Debug)]
pub(crate) struct BackpressureState {
    consecutive_would_block: u32,
    last_event: Option<Instant>,
    high_watermark: usize,
}

impl BackpressureState {
    pub(crate) fn new(high_watermark: usize) -> Self {
        Self {
            consecutive_would_block: 0,
            last_event: None,
            high_watermark,
        }
    }

    /// 写队列清空后重置统计。
    pub(crate) fn on_drained(&mut self) {
        self.consecutive_would_block = 0;
        self.last_event = None;
    }

    /// 记录一次 `WouldBlock`。
    pub(crate) fn on_would_block(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_event
            && now.duration_since(last) > WOULD_BLOCK_DECAY
        {
            self.consecutive_would_block = 0;
        }
        self.consecutive_would_block = self.consecutive_would_block.saturating_add(1);
        self.last_event = Some(now);
    }

    pub(crate) fn readiness(&self, queued_bytes: usize) -> WriteReadiness {
        if queued_bytes >= self.high_watermark {
            return WriteReadiness::Saturated;
        }
        let recent = self
            .last_event
            .is_some_and(|last| last.elapsed() <= WOULD_BLOCK_DECAY);
        if recent && self.consecutive_would_block >= THROTTLE_THRESHOLD && queued_bytes > 0 {
            WriteReadiness::Throttled
        } else {
            WriteReadiness::Ready
        }
    }
}

const WOULD_BLOCK_DECAY: Duration = Duration::from_millis(200);
const THROTTLE_THRESHOLD: u32 = 3;
