use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// 环境变量：启用的传输名称列表，逗号分隔；`all` 表示全部。
pub const ENV_TRANSPORTS: &str = "SPARK_ENDPOINT_TLS";
/// 环境变量：特性集合，使用 bitflags 文本格式，例如 `TAG | WAKEUP`。
pub const ENV_FEATURES: &str = "SPARK_ENDPOINT_FEATURES";
/// 环境变量：分片大小（字节）。
pub const ENV_SEGMENT_SIZE: &str = "SPARK_ENDPOINT_SEGMENT_SIZE";

/// 单条标签消息的默认长度上限：256 MiB。
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 256 * 1024 * 1024;

bitflags! {
    /// Context 创建时声明的能力集合。
    ///
    /// - `TAG`：带标签的双边消息；
    /// - `RMA`：远端内存访问，wireup 需要为其建立独立通道；
    /// - `AMO32` / `AMO64`：32/64 位原子操作，同样需要独立通道；
    /// - `WAKEUP`：允许 `arm`/事件描述符等唤醒接口。
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Features: u32 {
        const TAG = 1 << 0;
        const RMA = 1 << 1;
        const AMO32 = 1 << 2;
        const AMO64 = 1 << 3;
        const WAKEUP = 1 << 4;
    }
}

impl Features {
    /// 需要专用（非 AM）通道承载的特性子集。
    pub fn remote_access(self) -> Features {
        self & (Features::RMA | Features::AMO32 | Features::AMO64)
    }
}

impl Default for Features {
    fn default() -> Self {
        Features::TAG
    }
}

/// 每次 `progress()` 的工作上限，保证单次调用有界。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProgressConfig {
    /// 单次轮询处理的就绪事件上限。
    pub max_events: usize,
    /// 单次从各接口收取的帧数上限。
    pub max_frames: usize,
    /// 单次推送的发送分片上限。
    pub max_fragments: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            max_events: 64,
            max_frames: 128,
            max_fragments: 32,
        }
    }
}

/// Context 级配置。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“启用哪些特性、使用哪些传输、单次 progress 做多少事”集中为一份可序列化配置，
///   便于从 TOML 文件加载，也便于测试以环境变量覆盖传输组合；
///
/// ## 契约 (What)
/// - `transports` 为空表示启用全部已注册传输；
/// - `segment_size` 为单个发送分片的最大负载，实际取值还受通道 `max_frame_len` 约束；
/// - `max_message_len` 限制单条标签消息的总长度，收发两侧都据此拒绝超限消息；
/// - 未知字段会被拒绝，避免拼写错误静默生效。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
    pub features: Features,
    pub transports: Vec<String>,
    pub segment_size: usize,
    pub max_message_len: usize,
    pub progress: ProgressConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            features: Features::default(),
            transports: Vec::new(),
            segment_size: 8 * 1024,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            progress: ProgressConfig::default(),
        }
    }
}

/// 配置解析错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid endpoint configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid feature set `{input}`: {reason}")]
    Features { input: String, reason: String },
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

impl ContextConfig {
    /// 从 TOML 文本解析配置，缺省字段取默认值。
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: ContextConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// 以给定的查找函数应用环境变量覆盖。
    ///
    /// 查找函数通常是 `|key| std::env::var(key).ok()`；测试中可传入固定映射，
    /// 避免修改进程级环境。
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_TRANSPORTS) {
            self.transports = parse_transport_list(&raw);
        }
        if let Some(raw) = lookup(ENV_FEATURES) {
            self.features = bitflags::parser::from_str::<Features>(raw.trim()).map_err(|err| {
                ConfigError::Features {
                    input: raw.clone(),
                    reason: err.to_string(),
                }
            })?;
        }
        if let Some(raw) = lookup(ENV_SEGMENT_SIZE) {
            self.segment_size =
                raw.trim()
                    .parse()
                    .map_err(|err: std::num::ParseIntError| ConfigError::InvalidValue {
                        key: ENV_SEGMENT_SIZE,
                        reason: err.to_string(),
                    })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// 读取进程环境变量覆盖。
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// 判断某个传输是否被启用。
    pub fn transport_enabled(&self, name: &str) -> bool {
        self.transports.is_empty() || self.transports.iter().any(|enabled| enabled == name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "segment_size",
                reason: "must be greater than zero".into(),
            });
        }
        if self.max_message_len == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_message_len",
                reason: "must be greater than zero".into(),
            });
        }
        let progress = &self.progress;
        if progress.max_events == 0 || progress.max_frames == 0 || progress.max_fragments == 0 {
            return Err(ConfigError::InvalidValue {
                key: "progress",
                reason: "progress bounds must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

fn parse_transport_list(raw: &str) -> Vec<String> {
    let names: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect();
    if names.iter().any(|name| name == "all") {
        Vec::new()
    } else {
        names
    }
}
