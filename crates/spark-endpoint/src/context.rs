use crate::config::{ContextConfig, Features};
use crate::error::{EndpointError, Result};
use crate::transport::{Capabilities, Transport};
use crate::worker::Worker;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// 进程级（或会话级）上下文：固定的特性集合与启用的传输。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 特性集合在创建时确定、此后只读，因此 `Context` 可以被多个线程同时读取，
///   每个线程各自创建并独占自己的 [`Worker`]；
/// - 传输以 `Arc<dyn Transport>` 共享，具体实现位于独立 crate，核心不依赖任何传输。
///
/// ## 契约 (What)
/// - `Clone` 只复制引用计数；所有派生出的 Worker 持有一份克隆，保证上下文先于它们存活；
/// - 传输按注册顺序排列，并按配置中的 `transports` 过滤。
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: ContextConfig,
    transports: Vec<Arc<dyn Transport>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("features", &self.inner.config.features)
            .field(
                "transports",
                &self
                    .inner
                    .transports
                    .iter()
                    .map(|transport| transport.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn features(&self) -> Features {
        self.inner.config.features
    }

    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.inner.transports
    }

    /// 能满足给定特性集合的传输名称。
    ///
    /// 标签消息需要主动消息能力；RMA/原子特性需要对应的能力类别。
    pub fn probe(&self, features: Features) -> Vec<&'static str> {
        let mut required = Capabilities::for_remote_access(features);
        if features.contains(Features::TAG) {
            required |= Capabilities::AM;
        }
        self.inner
            .transports
            .iter()
            .filter(|transport| transport.caps().flags.contains(required))
            .map(|transport| transport.name())
            .collect()
    }

    /// 创建一个 Worker，`user` 是错误/完成回调可以修改的调用方上下文。
    pub fn create_worker<U>(&self, user: U) -> Result<Worker<U>> {
        Worker::new(self.clone(), user)
    }
}

/// [`Context`] 构建器。
#[derive(Default)]
pub struct ContextBuilder {
    config: ContextConfig,
    transports: Vec<Arc<dyn Transport>>,
}

impl ContextBuilder {
    pub fn config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    pub fn features(mut self, features: Features) -> Self {
        self.config.features = features;
        self
    }

    pub fn transport<T: Transport>(self, transport: T) -> Self {
        self.shared_transport(Arc::new(transport))
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn build(self) -> Result<Context> {
        let mut seen = HashSet::new();
        for transport in &self.transports {
            if !seen.insert(transport.name()) {
                return Err(EndpointError::invalid_param(format!(
                    "transport `{}` registered twice",
                    transport.name()
                )));
            }
        }
        let unknown: Vec<&String> = self
            .config
            .transports
            .iter()
            .filter(|name| !seen.contains(name.as_str()))
            .collect();
        if !unknown.is_empty() {
            return Err(EndpointError::invalid_param(format!(
                "configuration enables unknown transports {unknown:?}"
            )));
        }
        let transports: Vec<Arc<dyn Transport>> = self
            .transports
            .into_iter()
            .filter(|transport| self.config.transport_enabled(transport.name()))
            .collect();
        if transports.is_empty() {
            return Err(EndpointError::invalid_param("no transport enabled"));
        }
        tracing::debug!(
            features = ?self.config.features,
            transports = ?transports.iter().map(|t| t.name()).collect::<Vec<_>>(),
            "context created"
        );
        Ok(Context {
            inner: Arc::new(ContextInner {
                config: self.config,
                transports,
            }),
        })
    }
}
