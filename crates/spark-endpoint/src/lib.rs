#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-endpoint: 以 progress 驱动的点对点通信端点。"]
#![doc = ""]
#![doc = "== 模型 =="]
#![doc = "1. [`Context`] 固定特性集合与启用的传输，可被多个线程共享；"]
#![doc = "2. 每个线程独占一个 [`Worker`]，所有 IO、wireup 与回调都只在其 `progress()` 内发生；"]
#![doc = "3. 端点经套接字地址（客户端/服务端）或带外 Worker 地址建立，状态只前进；"]
#![doc = "4. 投递操作返回 [`Posted`]：要么已同步完成，要么是需要 `release` 的请求句柄。"]
#![doc = ""]
#![doc = "== 错误模型 =="]
#![doc = "所有失败以 [`EndpointError`] 报告，携带稳定的 [`ErrorKind`] 与 `spark.endpoint.*` 错误码。"]
#![doc = "`ErrorMode::Peer` 的端点在失败时恰好调用一次错误回调；`ErrorMode::None` 的端点遇到传输故障时 panic。"]

pub mod address;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod request;
pub mod tag;
pub mod transport;
pub mod wakeup;
mod wire;
mod wireup;
pub mod worker;

pub use address::{IfaceAddress, WorkerAddress};
pub use config::{ConfigError, ContextConfig, Features, ProgressConfig};
pub use context::{Context, ContextBuilder};
pub use endpoint::{
    CloseMode, ConnectTarget, EndpointFlags, EndpointId, EndpointParams, EndpointState,
    ErrorHandler, ErrorMode, LaneInfo, LaneUsage,
};
pub use error::{EndpointError, ErrorKind, Result, codes};
pub use listener::{AcceptHandler, ListenerHandle, ListenerParams};
pub use request::{Completion, CompletionCallback, Posted, RequestHandle, RequestKind, Status};
pub use tag::{TAG_MASK_FULL, Tag};
pub use transport::{
    Capabilities, Iface, IfaceEvent, LaneId, ListenId, SendStatus, Transport, TransportCaps,
};
pub use wakeup::{EventRegistry, ReadyEvent, WorkerSignal};
pub use worker::Worker;

/// 常用类型的一站式导入。
pub mod prelude {
    pub use crate::{
        CloseMode, Completion, Context, EndpointError, EndpointId, EndpointParams, EndpointState,
        ErrorKind, ErrorMode, Features, ListenerHandle, ListenerParams, Posted, RequestHandle,
        Status, TAG_MASK_FULL, Tag, Worker,
    };
}
