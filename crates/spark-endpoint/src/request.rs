use crate::endpoint::EndpointId;
use crate::error::{EndpointError, ErrorKind, Result, codes};
use crate::tag::Tag;
use bytes::Bytes;
use std::fmt;

/// 请求句柄：槽位下标 + 代数。
///
/// 句柄可 `Copy`，释放后槽位代数递增，旧句柄的任何后续使用都会被识别为失效，
/// 重复释放因此返回错误而不是破坏其他请求。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    index: u32,
    generation: u32,
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestHandle({}v{})", self.index, self.generation)
    }
}

/// 请求状态：`Pending` 之后恰好进入一次终态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Pending,
    Ok,
    Error(ErrorKind),
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Send,
    Receive,
    Close,
}

/// 请求的终态结果。
///
/// 接收请求成功时携带消息标签与数据；失败时携带完整错误。
#[derive(Clone, Debug)]
pub struct Completion {
    kind: RequestKind,
    status: Status,
    error: Option<EndpointError>,
    tag: Option<Tag>,
    length: usize,
    data: Option<Bytes>,
}

impl Completion {
    pub(crate) fn sent(length: usize) -> Self {
        Self {
            kind: RequestKind::Send,
            status: Status::Ok,
            error: None,
            tag: None,
            length,
            data: None,
        }
    }

    pub(crate) fn received(tag: Tag, data: Bytes) -> Self {
        Self {
            kind: RequestKind::Receive,
            status: Status::Ok,
            error: None,
            tag: Some(tag),
            length: data.len(),
            data: Some(data),
        }
    }

    pub(crate) fn closed() -> Self {
        Self {
            kind: RequestKind::Close,
            status: Status::Ok,
            error: None,
            tag: None,
            length: 0,
            data: None,
        }
    }

    pub(crate) fn failed(kind: RequestKind, error: EndpointError) -> Self {
        Self {
            kind,
            status: Status::Error(error.kind()),
            error: Some(error),
            tag: None,
            length: 0,
            data: None,
        }
    }

    /// 截断的接收：报告消息原始标签与长度，不交付数据。
    pub(crate) fn truncated(tag: Tag, length: usize, capacity: usize) -> Self {
        let error = EndpointError::from_kind(
            ErrorKind::MessageTruncated,
            format!("message of {length} bytes exceeds receive capacity of {capacity} bytes"),
        );
        Self {
            kind: RequestKind::Receive,
            status: Status::Error(ErrorKind::MessageTruncated),
            error: Some(error),
            tag: Some(tag),
            length,
            data: None,
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn error(&self) -> Option<&EndpointError> {
        self.error.as_ref()
    }

    /// 接收到的消息标签。
    pub fn tag(&self) -> Option<Tag> {
        self.tag
    }

    /// 发送或接收的字节数。
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<Bytes> {
        self.data
    }
}

/// 完成回调：只对以 [`Posted::Pending`] 返回的请求调用，且恰好一次。
pub type CompletionCallback<U> = Box<dyn FnOnce(&mut U, RequestHandle, &Completion) + Send>;

/// 投递操作的结果。
#[must_use = "a pending request must be released after it completes"]
#[derive(Debug)]
pub enum Posted {
    /// 投递时已同步完成，不会再调用回调，也没有需要释放的句柄。
    Completed(Completion),
    /// 请求进行中，需驱动 `progress()` 直至终态后释放。
    Pending(RequestHandle),
}

impl Posted {
    pub fn handle(&self) -> Option<RequestHandle> {
        match self {
            Posted::Completed(_) => None,
            Posted::Pending(handle) => Some(*handle),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Posted::Completed(_))
    }
}

#[derive(Debug)]
pub(crate) struct SendState {
    pub ep: EndpointId,
    pub tag: Tag,
    pub payload: Bytes,
    /// 已交给通道的字节数。
    pub offset: usize,
    /// 分片发送时的消息序号；单帧发送为 `None`。
    pub msg_id: Option<u64>,
}

#[derive(Debug)]
pub(crate) enum RequestBody {
    Send(SendState),
    Receive { capacity: usize },
    Close { ep: EndpointId },
}

pub(crate) struct RequestEntry<U> {
    pub body: RequestBody,
    pub completion: Option<Completion>,
    pub callback: Option<CompletionCallback<U>>,
}

impl<U> RequestEntry<U> {
    pub(crate) fn new(body: RequestBody, callback: Option<CompletionCallback<U>>) -> Self {
        Self {
            body,
            completion: None,
            callback,
        }
    }

    pub(crate) fn status(&self) -> Status {
        self.completion
            .as_ref()
            .map_or(Status::Pending, Completion::status)
    }
}

struct Slot<U> {
    generation: u32,
    entry: Option<RequestEntry<U>>,
}

/// 请求槽位表。
pub(crate) struct RequestTable<U> {
    slots: Vec<Slot<U>>,
    free: Vec<u32>,
}

impl<U> Default for RequestTable<U> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<U> RequestTable<U> {
    pub(crate) fn insert(&mut self, entry: RequestEntry<U>) -> RequestHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return RequestHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        RequestHandle {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, handle: RequestHandle) -> Option<&RequestEntry<U>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub(crate) fn get_mut(&mut self, handle: RequestHandle) -> Option<&mut RequestEntry<U>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    /// 把进行中的请求推进到终态；返回该请求是否带有待调用的回调。
    ///
    /// 已处于终态或句柄失效时不做任何事，保证终态只写入一次。
    pub(crate) fn complete(&mut self, handle: RequestHandle, completion: Completion) -> bool {
        match self.get_mut(handle) {
            Some(entry) if entry.completion.is_none() => {
                entry.completion = Some(completion);
                entry.callback.is_some()
            }
            _ => false,
        }
    }

    /// 取出已完成请求的回调与结果快照。
    pub(crate) fn take_callback(
        &mut self,
        handle: RequestHandle,
    ) -> Option<(CompletionCallback<U>, Completion)> {
        let entry = self.get_mut(handle)?;
        let completion = entry.completion.clone()?;
        let callback = entry.callback.take()?;
        Some((callback, completion))
    }

    /// 释放终态请求并交出结果。
    pub(crate) fn release(&mut self, handle: RequestHandle) -> Result<Completion> {
        let Some(slot) = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.entry.is_some())
        else {
            return Err(EndpointError::new(
                ErrorKind::InvalidParam,
                codes::REQUEST_STALE,
                format!("{handle:?} was already released or never issued"),
            ));
        };
        if slot
            .entry
            .as_ref()
            .is_some_and(|entry| entry.completion.is_none())
        {
            return Err(EndpointError::new(
                ErrorKind::Busy,
                codes::REQUEST_PENDING,
                format!("{handle:?} is still pending"),
            ));
        }
        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        entry.and_then(|entry| entry.completion).ok_or_else(|| {
            EndpointError::fatal(format!("{handle:?} lost its completion"))
        })
    }

    /// 直接移除一个请求（用于同步完成路径回收刚分配的槽位）。
    pub(crate) fn remove(&mut self, handle: RequestHandle) -> Option<RequestEntry<U>> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(entry)
    }

    /// 所有仍处于进行中的请求句柄。
    #[cfg(test)]
    pub(crate) fn pending(&self) -> Vec<RequestHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.entry
                    .as_ref()
                    .filter(|entry| entry.completion.is_none())
                    .map(|_| RequestHandle {
                        index: index as u32,
                        generation: slot.generation,
                    })
            })
            .collect()
    }

    /// 尚未释放的请求数（含已完成未释放者）。
    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receive(table: &mut RequestTable<()>) -> RequestHandle {
        table.insert(RequestEntry::new(RequestBody::Receive { capacity: 8 }, None))
    }

    #[test]
    fn release_before_completion_is_rejected() {
        let mut table = RequestTable::default();
        let handle = receive(&mut table);
        let err = table.release(handle).expect_err("pending");
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(err.code(), codes::REQUEST_PENDING);
    }

    #[test]
    fn double_release_is_detected() {
        let mut table = RequestTable::default();
        let handle = receive(&mut table);
        table.complete(handle, Completion::received(1, Bytes::from_static(b"x")));
        let completion = table.release(handle).expect("first release");
        assert_eq!(completion.tag(), Some(1));
        let err = table.release(handle).expect_err("second release");
        assert_eq!(err.kind(), ErrorKind::InvalidParam);
    }

    #[test]
    fn stale_handle_does_not_alias_reused_slot() {
        let mut table = RequestTable::default();
        let first = receive(&mut table);
        table.complete(first, Completion::sent(0));
        table.release(first).expect("release");
        let second = receive(&mut table);
        assert_ne!(first, second);
        assert!(table.get(first).is_none());
        assert_eq!(table.get(second).map(RequestEntry::status), Some(Status::Pending));
    }

    #[test]
    fn terminal_status_is_written_once() {
        let mut table: RequestTable<()> = RequestTable::default();
        let handle = table.insert(RequestEntry::new(
            RequestBody::Receive { capacity: 4 },
            Some(Box::new(|_, _, _| {})),
        ));
        assert!(table.complete(handle, Completion::failed(
            RequestKind::Receive,
            EndpointError::canceled("receive canceled"),
        )));
        assert!(!table.complete(handle, Completion::received(1, Bytes::new())));
        assert_eq!(
            table.get(handle).map(RequestEntry::status),
            Some(Status::Error(ErrorKind::Canceled))
        );
        assert!(table.take_callback(handle).is_some());
        assert!(table.take_callback(handle).is_none(), "回调只能取出一次");
    }

    #[test]
    fn pending_lists_only_incomplete_requests() {
        let mut table = RequestTable::default();
        let done = receive(&mut table);
        let open = receive(&mut table);
        table.complete(done, Completion::sent(1));
        assert_eq!(table.pending(), vec![open]);
        assert_eq!(table.outstanding(), 2);
    }
}
