//! 标签匹配：期望队列、意外队列与分片重组。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 发送方可能在接收方投递接收之前就把消息送达（客户端可以在端点就绪前投递发送），
//!   因此到达但未匹配的消息必须按到达顺序缓存；
//! - 大消息以多个分片到达，接收可能在第一片与最后一片之间投递。
//!
//! ## 契约 (What)
//! - 接收 `(tag, mask)` 匹配消息标签 `t` 当且仅当 `t & mask == tag & mask`；
//! - 期望队列按投递顺序匹配，意外队列按到达顺序匹配，同一标签的消息按发送顺序交付；
//! - 消息长度超过接收容量时，该接收以 `MessageTruncated` 完成，其余分片被丢弃；
//! - 声明长度超过 `max_message_len` 的分片消息是协议错误，不会分配任何缓冲。

use crate::config::DEFAULT_MAX_MESSAGE_LEN;
use crate::error::{EndpointError, Result};
use crate::request::{Completion, RequestHandle};
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};

/// 消息标签。
pub type Tag = u64;

/// 要求所有标签位完全相等的掩码。
pub const TAG_MASK_FULL: Tag = u64::MAX;

/// 分片消息的全局键：发送方 Worker 标识 + 消息序号。
pub(crate) type MessageKey = (u64, u64);

pub(crate) fn tag_matches(message: Tag, tag: Tag, mask: Tag) -> bool {
    (message ^ tag) & mask == 0
}

#[derive(Debug)]
struct Expected {
    handle: RequestHandle,
    tag: Tag,
    mask: Tag,
    capacity: usize,
}

#[derive(Debug)]
enum Unexpected {
    Complete { tag: Tag, data: Bytes },
    Partial { tag: Tag, key: MessageKey },
}

impl Unexpected {
    fn tag(&self) -> Tag {
        match self {
            Unexpected::Complete { tag, .. } | Unexpected::Partial { tag, .. } => *tag,
        }
    }
}

#[derive(Debug)]
enum Owner {
    Request {
        handle: RequestHandle,
        capacity: usize,
    },
    Unexpected,
    Discard,
}

#[derive(Debug)]
struct Assembly {
    tag: Tag,
    total: usize,
    received: usize,
    buf: BytesMut,
    owner: Owner,
}

/// 一次匹配产生的完成结果。
#[derive(Debug)]
pub(crate) struct Delivery {
    pub handle: RequestHandle,
    pub completion: Completion,
}

/// 从意外队列认领到的消息。
#[derive(Debug)]
pub(crate) enum Claimed {
    Complete { tag: Tag, data: Bytes },
    Partial(MessageKey),
}

#[derive(Debug)]
pub(crate) struct TagMatcher {
    expected: VecDeque<Expected>,
    unexpected: VecDeque<Unexpected>,
    assembling: HashMap<MessageKey, Assembly>,
    /// 对端声明的消息长度上限；重组缓冲随分片增长，不按声明长度预留。
    max_message_len: usize,
}

impl Default for TagMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}

impl TagMatcher {
    pub(crate) fn new(max_message_len: usize) -> Self {
        Self {
            expected: VecDeque::new(),
            unexpected: VecDeque::new(),
            assembling: HashMap::new(),
            max_message_len,
        }
    }

    /// 认领第一条匹配的意外消息。
    pub(crate) fn claim_unexpected(&mut self, tag: Tag, mask: Tag) -> Option<Claimed> {
        let position = self
            .unexpected
            .iter()
            .position(|message| tag_matches(message.tag(), tag, mask))?;
        match self.unexpected.remove(position)? {
            Unexpected::Complete { tag, data } => Some(Claimed::Complete { tag, data }),
            Unexpected::Partial { key, .. } => Some(Claimed::Partial(key)),
        }
    }

    /// 把仍在重组中的意外消息绑定到接收请求。
    pub(crate) fn bind(
        &mut self,
        key: MessageKey,
        handle: RequestHandle,
        capacity: usize,
    ) -> Option<Delivery> {
        let assembly = self.assembling.get_mut(&key)?;
        if assembly.total > capacity {
            assembly.owner = Owner::Discard;
            assembly.buf = BytesMut::new();
            return Some(Delivery {
                handle,
                completion: Completion::truncated(assembly.tag, assembly.total, capacity),
            });
        }
        assembly.owner = Owner::Request { handle, capacity };
        None
    }

    pub(crate) fn expect(&mut self, handle: RequestHandle, tag: Tag, mask: Tag, capacity: usize) {
        self.expected.push_back(Expected {
            handle,
            tag,
            mask,
            capacity,
        });
    }

    fn take_expected(&mut self, tag: Tag) -> Option<Expected> {
        let position = self
            .expected
            .iter()
            .position(|expected| tag_matches(tag, expected.tag, expected.mask))?;
        self.expected.remove(position)
    }

    /// 单帧消息到达。
    pub(crate) fn on_eager(&mut self, tag: Tag, data: Bytes) -> Option<Delivery> {
        match self.take_expected(tag) {
            Some(expected) => Some(deliver(expected.handle, expected.capacity, tag, data)),
            None => {
                self.unexpected.push_back(Unexpected::Complete { tag, data });
                None
            }
        }
    }

    /// 分片消息的第一片到达。
    pub(crate) fn on_first(
        &mut self,
        key: MessageKey,
        tag: Tag,
        total: usize,
        chunk: Bytes,
    ) -> Result<Option<Delivery>> {
        if self.assembling.contains_key(&key) {
            return Err(EndpointError::protocol(format!(
                "duplicate first fragment for message {key:?}"
            )));
        }
        if chunk.len() > total {
            return Err(EndpointError::protocol(format!(
                "first fragment of {} bytes exceeds message length {total}",
                chunk.len()
            )));
        }
        if total > self.max_message_len {
            return Err(EndpointError::protocol(format!(
                "message length {total} exceeds the limit of {} bytes",
                self.max_message_len
            )));
        }
        let mut early = None;
        let owner = match self.take_expected(tag) {
            Some(expected) if total > expected.capacity => {
                early = Some(Delivery {
                    handle: expected.handle,
                    completion: Completion::truncated(tag, total, expected.capacity),
                });
                Owner::Discard
            }
            Some(expected) => Owner::Request {
                handle: expected.handle,
                capacity: expected.capacity,
            },
            None => {
                self.unexpected.push_back(Unexpected::Partial { tag, key });
                Owner::Unexpected
            }
        };
        let mut buf = BytesMut::new();
        if !matches!(owner, Owner::Discard) {
            buf.extend_from_slice(&chunk);
        }
        self.assembling.insert(
            key,
            Assembly {
                tag,
                total,
                received: chunk.len(),
                buf,
                owner,
            },
        );
        let finished = self.finish_if_complete(key);
        Ok(early.or(finished))
    }

    /// 后续分片到达；分片必须按偏移连续。
    pub(crate) fn on_next(
        &mut self,
        key: MessageKey,
        offset: usize,
        chunk: Bytes,
    ) -> Result<Option<Delivery>> {
        let Some(assembly) = self.assembling.get_mut(&key) else {
            return Err(EndpointError::protocol(format!(
                "fragment for unknown message {key:?}"
            )));
        };
        if offset != assembly.received || assembly.received + chunk.len() > assembly.total {
            return Err(EndpointError::protocol(format!(
                "fragment at offset {offset} does not continue message {key:?} ({} of {} bytes)",
                assembly.received, assembly.total
            )));
        }
        assembly.received += chunk.len();
        if !matches!(assembly.owner, Owner::Discard) {
            assembly.buf.extend_from_slice(&chunk);
        }
        Ok(self.finish_if_complete(key))
    }

    fn finish_if_complete(&mut self, key: MessageKey) -> Option<Delivery> {
        let complete = self
            .assembling
            .get(&key)
            .is_some_and(|assembly| assembly.received == assembly.total);
        if !complete {
            return None;
        }
        let assembly = self.assembling.remove(&key)?;
        let data = assembly.buf.freeze();
        match assembly.owner {
            Owner::Request { handle, capacity } => {
                Some(deliver(handle, capacity, assembly.tag, data))
            }
            Owner::Unexpected => {
                if let Some(slot) = self.unexpected.iter_mut().find(
                    |message| matches!(message, Unexpected::Partial { key: k, .. } if *k == key),
                ) {
                    *slot = Unexpected::Complete {
                        tag: assembly.tag,
                        data,
                    };
                }
                None
            }
            Owner::Discard => None,
        }
    }

    /// 取消一个尚未完成的接收；返回是否找到。
    pub(crate) fn cancel(&mut self, handle: RequestHandle) -> bool {
        if let Some(position) = self
            .expected
            .iter()
            .position(|expected| expected.handle == handle)
        {
            self.expected.remove(position);
            return true;
        }
        for assembly in self.assembling.values_mut() {
            if matches!(assembly.owner, Owner::Request { handle: h, .. } if h == handle) {
                assembly.owner = Owner::Discard;
                assembly.buf = BytesMut::new();
                return true;
            }
        }
        false
    }

    /// 移出全部等待中的接收（期望队列与已绑定的重组）。
    pub(crate) fn drain_waiting(&mut self) -> Vec<RequestHandle> {
        let mut handles: Vec<RequestHandle> =
            self.expected.drain(..).map(|expected| expected.handle).collect();
        for assembly in self.assembling.values_mut() {
            if let Owner::Request { handle, .. } = assembly.owner {
                handles.push(handle);
                assembly.owner = Owner::Discard;
                assembly.buf = BytesMut::new();
            }
        }
        handles
    }

    #[cfg(test)]
    pub(crate) fn unexpected_len(&self) -> usize {
        self.unexpected.len()
    }

    #[cfg(test)]
    pub(crate) fn expected_len(&self) -> usize {
        self.expected.len()
    }
}

fn deliver(handle: RequestHandle, capacity: usize, tag: Tag, data: Bytes) -> Delivery {
    let completion = if data.len() > capacity {
        Completion::truncated(tag, data.len(), capacity)
    } else {
        Completion::received(tag, data)
    };
    Delivery { handle, completion }
}
