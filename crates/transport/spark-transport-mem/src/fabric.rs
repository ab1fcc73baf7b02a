use bytes::{BufMut, Bytes, BytesMut};
use mio::Waker;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// 接口地址长度：fabric 标识与接口标识各 8 字节，大端。
pub(crate) const ADDRESS_LEN: usize = 16;

static NEXT_FABRIC: AtomicU64 = AtomicU64::new(1);

/// 进程内的邮箱网络。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 同一 fabric 内的接口可以互相投递帧，不同 fabric 之间互不可达；
///   测试用独立 fabric 隔离彼此，默认的共享 fabric 则让同一进程内的所有 Worker 互通。
///
/// ## 契约 (What)
/// - 接口地址为 `fabric_id ‖ iface_id`，由 [`Fabric::attach`] 分配，接口销毁时 [`Fabric::detach`]；
/// - 邮箱在 detach 后标记为失效，仍持有引用的发送方会在下一次投递或推进时发现对端已离开。
#[derive(Debug)]
pub struct Fabric {
    id: u64,
    mailboxes: Mutex<HashMap<u64, Arc<Mailbox>>>,
    next_iface: AtomicU64,
}

impl Fabric {
    /// 进程级共享 fabric。
    pub fn shared() -> Arc<Fabric> {
        static SHARED: OnceLock<Arc<Fabric>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(Fabric::isolated))
    }

    /// 新建一个与其他 fabric 互不可达的 fabric。
    pub fn isolated() -> Arc<Fabric> {
        Arc::new(Fabric {
            id: NEXT_FABRIC.fetch_add(1, Ordering::Relaxed),
            mailboxes: Mutex::new(HashMap::new()),
            next_iface: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 当前挂载的接口数。
    pub fn attached(&self) -> usize {
        self.mailboxes.lock().len()
    }

    pub(crate) fn attach(&self, mailbox: Arc<Mailbox>) -> u64 {
        let iface = self.next_iface.fetch_add(1, Ordering::Relaxed);
        self.mailboxes.lock().insert(iface, mailbox);
        iface
    }

    pub(crate) fn detach(&self, iface: u64) {
        if let Some(mailbox) = self.mailboxes.lock().remove(&iface) {
            mailbox.alive.store(false, Ordering::Release);
            mailbox.wake_departure();
        }
    }

    pub(crate) fn encode_address(&self, iface: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(ADDRESS_LEN);
        buf.put_u64(self.id);
        buf.put_u64(iface);
        buf.freeze()
    }

    /// 解析属于本 fabric 的接口地址。
    pub(crate) fn decode_address(&self, addr: &[u8]) -> Option<u64> {
        let raw: [u8; ADDRESS_LEN] = addr.try_into().ok()?;
        let (fabric, iface) = raw.split_at(8);
        let fabric = u64::from_be_bytes(fabric.try_into().ok()?);
        let iface = u64::from_be_bytes(iface.try_into().ok()?);
        (fabric == self.id).then_some(iface)
    }

    pub(crate) fn lookup(&self, iface: u64) -> Option<Arc<Mailbox>> {
        self.mailboxes.lock().get(&iface).cloned()
    }
}

#[derive(Debug, Default)]
struct MailboxState {
    frames: VecDeque<Bytes>,
    /// 因邮箱满而停下的发送方 Worker，邮箱腾出空间后唤醒。
    blocked: Vec<Arc<Waker>>,
    /// 持有指向本邮箱通道的 Worker，邮箱失效时全部唤醒。
    watchers: Vec<Arc<Waker>>,
}

/// 单个接口的收件箱。
#[derive(Debug)]
pub(crate) struct Mailbox {
    state: Mutex<MailboxState>,
    waker: Arc<Waker>,
    capacity: usize,
    alive: AtomicBool,
}

/// 投递结果。
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Queued,
    Full,
    Gone,
}

impl Mailbox {
    pub(crate) fn new(waker: Arc<Waker>, capacity: usize) -> Self {
        Self {
            state: Mutex::new(MailboxState::default()),
            waker,
            capacity,
            alive: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn push(&self, frame: Bytes) -> Delivery {
        if !self.is_alive() {
            return Delivery::Gone;
        }
        {
            let mut state = self.state.lock();
            if state.frames.len() >= self.capacity {
                return Delivery::Full;
            }
            state.frames.push_back(frame);
        }
        if let Err(err) = self.waker.wake() {
            tracing::debug!(?err, "failed to wake receiving worker");
        }
        Delivery::Queued
    }

    /// 邮箱是否还有空间；没有时登记 `sender`，腾出空间后唤醒它。
    pub(crate) fn has_room(&self, sender: &Arc<Waker>) -> bool {
        let mut state = self.state.lock();
        if state.frames.len() < self.capacity {
            return true;
        }
        if !state.blocked.iter().any(|waker| Arc::ptr_eq(waker, sender)) {
            state.blocked.push(Arc::clone(sender));
        }
        false
    }

    pub(crate) fn pop_batch(&self, max: usize, out: &mut Vec<Bytes>) {
        let blocked = {
            let mut state = self.state.lock();
            let count = max.min(state.frames.len());
            out.extend(state.frames.drain(..count));
            if count > 0 && state.frames.len() < self.capacity {
                std::mem::take(&mut state.blocked)
            } else {
                Vec::new()
            }
        };
        wake_all(blocked);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }

    /// 登记一个持有通道的 Worker；邮箱已失效时立即唤醒它。
    pub(crate) fn watch(&self, watcher: &Arc<Waker>) {
        {
            let mut state = self.state.lock();
            if self.is_alive() {
                if !state.watchers.iter().any(|waker| Arc::ptr_eq(waker, watcher)) {
                    state.watchers.push(Arc::clone(watcher));
                }
                return;
            }
        }
        wake_all(vec![Arc::clone(watcher)]);
    }

    fn wake_departure(&self) {
        let wakers = {
            let mut state = self.state.lock();
            let mut wakers = std::mem::take(&mut state.blocked);
            for watcher in std::mem::take(&mut state.watchers) {
                if !wakers.iter().any(|waker| Arc::ptr_eq(waker, &watcher)) {
                    wakers.push(watcher);
                }
            }
            wakers
        };
        wake_all(wakers);
    }
}

fn wake_all(wakers: Vec<Arc<Waker>>) {
    for waker in wakers {
        if let Err(err) = waker.wake() {
            tracing::debug!(?err, "failed to wake peer worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Poll, Token};

    fn mailbox(capacity: usize) -> (Poll, Arc<Mailbox>) {
        let poll = Poll::new().expect("poll");
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).expect("waker"));
        (poll, Arc::new(Mailbox::new(waker, capacity)))
    }

    #[test]
    fn addresses_are_scoped_to_their_fabric() {
        let a = Fabric::isolated();
        let b = Fabric::isolated();
        let addr = a.encode_address(3);
        assert_eq!(a.decode_address(&addr), Some(3));
        assert_eq!(b.decode_address(&addr), None);
        assert_eq!(a.decode_address(&addr[..8]), None);
    }

    #[test]
    fn full_mailbox_reports_and_recovers() {
        let (_poll, mailbox) = mailbox(1);
        assert_eq!(mailbox.push(Bytes::from_static(b"a")), Delivery::Queued);
        assert_eq!(mailbox.push(Bytes::from_static(b"b")), Delivery::Full);
        let mut out = Vec::new();
        mailbox.pop_batch(8, &mut out);
        assert_eq!(out, vec![Bytes::from_static(b"a")]);
        assert_eq!(mailbox.push(Bytes::from_static(b"c")), Delivery::Queued);
    }

    #[test]
    fn detached_mailbox_is_gone() {
        let fabric = Fabric::isolated();
        let (_poll, mailbox) = mailbox(4);
        let iface = fabric.attach(Arc::clone(&mailbox));
        assert_eq!(fabric.attached(), 1);
        fabric.detach(iface);
        assert!(fabric.lookup(iface).is_none());
        assert_eq!(mailbox.push(Bytes::new()), Delivery::Gone);
    }

    #[test]
    fn detach_wakes_lane_holders() {
        let fabric = Fabric::isolated();
        let (_peer_poll, peer) = mailbox(4);
        let iface = fabric.attach(Arc::clone(&peer));

        let mut poll = Poll::new().expect("poll");
        let holder = Arc::new(Waker::new(poll.registry(), Token(0)).expect("waker"));
        peer.watch(&holder);
        peer.watch(&holder);
        fabric.detach(iface);

        let mut events = mio::Events::with_capacity(4);
        poll.poll(&mut events, Some(std::time::Duration::from_secs(5)))
            .expect("poll");
        assert!(events.iter().any(|event| event.token() == Token(0)));

        // 失效后才登记的 Worker 立即被唤醒。
        let mut late_poll = Poll::new().expect("poll");
        let late = Arc::new(Waker::new(late_poll.registry(), Token(0)).expect("waker"));
        peer.watch(&late);
        late_poll
            .poll(&mut events, Some(std::time::Duration::from_secs(5)))
            .expect("poll");
        assert!(events.iter().any(|event| event.token() == Token(0)));
    }
}
