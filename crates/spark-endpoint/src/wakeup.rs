//! Worker 的事件源：就绪事件轮询、跨线程唤醒与可被外部轮询的描述符。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 每个 Worker 持有一个 [`mio::Poll`]；各传输接口通过 [`EventRegistry`] 把自己的套接字
//!   注册到同一个 Poll 上，因此 Poll 的描述符就是 Worker 唯一的“可轮询事件描述符”；
//! - 应用可以把该描述符嵌入自己的事件循环（epoll 支持嵌套），在 `arm` 返回成功后阻塞等待。
//!
//! ## 逻辑 (How)
//! - `Token(0)` 保留给 [`mio::Waker`]，其余令牌递增分配并记录归属接口下标；
//! - `arm` 与 `wait` 通过零超时轮询检查是否已有就绪事件：有则暂存到 `stashed`，
//!   由下一次 `progress()` 消费，保证事件不会因为检查而丢失。
//!
//! ## 注意事项 (Trade-offs)
//! - mio 的注册是边沿触发：暂存的事件必须全部交给接口处理，接口也必须把套接字读写到
//!   `WouldBlock`，否则后续不会再收到通知。

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const WAKER_TOKEN: Token = Token(0);

/// 一次就绪通知的快照，脱离 `mio::Events` 的借用后交给接口处理。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadyEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
    pub write_closed: bool,
}

impl ReadyEvent {
    fn from_mio(event: &mio::event::Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct TokenTable {
    owners: HashMap<Token, usize>,
    next: usize,
}

impl TokenTable {
    fn allocate(&mut self, owner: usize) -> Token {
        self.next += 1;
        let token = Token(self.next);
        self.owners.insert(token, owner);
        token
    }

    fn release(&mut self, token: Token) {
        self.owners.remove(&token);
    }

    fn owner(&self, token: Token) -> Option<usize> {
        self.owners.get(&token).copied()
    }
}

/// 传输接口注册可轮询资源的入口。
///
/// 每个接口拿到的注册器都绑定了自己的下标，分配出的令牌在事件分发时会路由回该接口。
pub struct EventRegistry<'a> {
    registry: &'a Registry,
    tokens: &'a mut TokenTable,
    waker: &'a Arc<Waker>,
    owner: usize,
}

impl EventRegistry<'_> {
    /// 注册资源并返回分配的令牌。
    pub fn register<S>(&mut self, source: &mut S, interest: Interest) -> io::Result<Token>
    where
        S: Source + ?Sized,
    {
        let token = self.tokens.allocate(self.owner);
        if let Err(err) = self.registry.register(source, token, interest) {
            self.tokens.release(token);
            return Err(err);
        }
        Ok(token)
    }

    /// 注销资源并回收令牌。
    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.tokens.release(token);
        self.registry.deregister(source)
    }

    /// 所属 Worker 的唤醒器；进程内传输投递消息后用它唤醒接收方。
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(self.waker)
    }
}

pub(crate) struct EventSource {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    tokens: TokenTable,
    stashed: VecDeque<(usize, ReadyEvent)>,
}

impl EventSource {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity),
            waker,
            tokens: TokenTable::default(),
            stashed: VecDeque::new(),
        })
    }

    pub(crate) fn registry_for(&mut self, owner: usize) -> EventRegistry<'_> {
        EventRegistry {
            registry: self.poll.registry(),
            tokens: &mut self.tokens,
            waker: &self.waker,
            owner,
        }
    }

    /// 轮询一次并把接口事件暂存，返回是否观察到任何通知（包括唤醒器）。
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(err) => return Err(err),
        }
        let mut observed = false;
        for event in self.events.iter() {
            observed = true;
            if event.token() == WAKER_TOKEN {
                continue;
            }
            match self.tokens.owner(event.token()) {
                Some(owner) => self
                    .stashed
                    .push_back((owner, ReadyEvent::from_mio(event))),
                None => tracing::trace!(token = event.token().0, "event for released token"),
            }
        }
        Ok(observed)
    }

    pub(crate) fn take_stashed(&mut self, max: usize) -> Vec<(usize, ReadyEvent)> {
        let count = max.min(self.stashed.len());
        self.stashed.drain(..count).collect()
    }

    pub(crate) fn has_stashed(&self) -> bool {
        !self.stashed.is_empty()
    }

    pub(crate) fn waker(&self) -> &Arc<Waker> {
        &self.waker
    }

    #[cfg(unix)]
    pub(crate) fn raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.poll.as_raw_fd()
    }
}

/// 可跨线程传递的唤醒句柄，等价于向 Worker 发出一次信号。
#[derive(Clone, Debug)]
pub struct WorkerSignal {
    waker: Arc<Waker>,
}

impl WorkerSignal {
    pub(crate) fn new(waker: Arc<Waker>) -> Self {
        Self { waker }
    }

    /// 唤醒阻塞在 `wait` 或外部轮询上的 Worker。
    pub fn signal(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_route_back_to_owner() {
        let mut table = TokenTable::default();
        let a = table.allocate(0);
        let b = table.allocate(3);
        assert_ne!(a, WAKER_TOKEN);
        assert_eq!(table.owner(a), Some(0));
        assert_eq!(table.owner(b), Some(3));
        table.release(a);
        assert_eq!(table.owner(a), None);
    }

    #[test]
    fn waker_notification_is_observed_without_stashing() {
        let mut source = EventSource::new(8).expect("poll");
        assert!(!source.poll(Some(Duration::ZERO)).expect("poll"));
        WorkerSignal::new(Arc::clone(source.waker()))
            .signal()
            .expect("wake");
        assert!(source.poll(Some(Duration::from_secs(1))).expect("poll"));
        assert!(!source.has_stashed(), "唤醒器事件不应进入接口暂存队列");
    }
}
