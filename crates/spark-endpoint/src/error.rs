use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// 端点层统一的结果别名。
pub type Result<T, E = EndpointError> = std::result::Result<T, E>;

/// 错误分类：决定调用方的处置方式。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 通信故障分为“环境预期内”（对端不可达、地址过大、被取消、对端断开）与“缺陷/致命”两类，
///   场景测试需要据此把预期故障视为跳过而非失败；
/// - 用枚举而非字符串承载分类，避免调用方解析文案。
///
/// ## 契约 (What)
/// - [`ErrorKind::is_expected`] 对 `Unreachable`、`AddressTooLarge`、`Canceled`、
///   `ConnectionReset` 返回 `true`；
/// - 其余分类表示调用方误用（`Busy`、`InvalidParam`、`Unsupported`）、数据问题
///   （`MessageTruncated`、`ProtocolViolation`）或不可恢复故障（`Fatal`）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// 对端不可达：无监听者、无匹配传输，或 wireup 期间失联。
    Unreachable,
    /// 引导阶段需要交换的地址信息超过所选传输的容量。
    AddressTooLarge,
    /// 请求或端点被显式关闭/取消。
    Canceled,
    /// 资源暂时不可用，或操作前置条件不满足（例如唤醒时仍有待处理事件）。
    Busy,
    /// 不可恢复的故障。
    Fatal,
    /// 连接建立后被对端关闭或重置。
    ConnectionReset,
    /// 到达的消息长于接收缓冲容量。
    MessageTruncated,
    /// 参数非法或句柄已失效。
    InvalidParam,
    /// 当前配置未启用该能力。
    Unsupported,
    /// 对端发送了无法解析的帧。
    ProtocolViolation,
}

impl ErrorKind {
    /// 是否属于环境预期内的故障。
    pub fn is_expected(self) -> bool {
        matches!(
            self,
            ErrorKind::Unreachable
                | ErrorKind::AddressTooLarge
                | ErrorKind::Canceled
                | ErrorKind::ConnectionReset
        )
    }

    /// 分类对应的默认错误码。
    pub fn default_code(self) -> &'static str {
        match self {
            ErrorKind::Unreachable => codes::UNREACHABLE,
            ErrorKind::AddressTooLarge => codes::ADDRESS_TOO_LARGE,
            ErrorKind::Canceled => codes::CANCELED,
            ErrorKind::Busy => codes::BUSY,
            ErrorKind::Fatal => codes::FATAL,
            ErrorKind::ConnectionReset => codes::CONNECTION_RESET,
            ErrorKind::MessageTruncated => codes::MESSAGE_TRUNCATED,
            ErrorKind::InvalidParam => codes::INVALID_PARAM,
            ErrorKind::Unsupported => codes::UNSUPPORTED,
            ErrorKind::ProtocolViolation => codes::PROTOCOL_VIOLATION,
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            ErrorKind::Unreachable => 1,
            ErrorKind::AddressTooLarge => 2,
            ErrorKind::Canceled => 3,
            ErrorKind::Busy => 4,
            ErrorKind::Fatal => 5,
            ErrorKind::ConnectionReset => 6,
            ErrorKind::MessageTruncated => 7,
            ErrorKind::InvalidParam => 8,
            ErrorKind::Unsupported => 9,
            ErrorKind::ProtocolViolation => 10,
        }
    }

    pub(crate) fn from_wire(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => ErrorKind::Unreachable,
            2 => ErrorKind::AddressTooLarge,
            3 => ErrorKind::Canceled,
            4 => ErrorKind::Busy,
            5 => ErrorKind::Fatal,
            6 => ErrorKind::ConnectionReset,
            7 => ErrorKind::MessageTruncated,
            8 => ErrorKind::InvalidParam,
            9 => ErrorKind::Unsupported,
            10 => ErrorKind::ProtocolViolation,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::AddressTooLarge => "address too large",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Busy => "busy",
            ErrorKind::Fatal => "fatal",
            ErrorKind::ConnectionReset => "connection reset",
            ErrorKind::MessageTruncated => "message truncated",
            ErrorKind::InvalidParam => "invalid parameter",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::ProtocolViolation => "protocol violation",
        };
        f.write_str(text)
    }
}

/// 稳定错误码，遵循 `<域>.<语义>` 约定。
pub mod codes {
    pub const UNREACHABLE: &str = "spark.endpoint.unreachable";
    pub const ADDRESS_TOO_LARGE: &str = "spark.endpoint.address_too_large";
    pub const CANCELED: &str = "spark.endpoint.canceled";
    pub const BUSY: &str = "spark.endpoint.busy";
    pub const FATAL: &str = "spark.endpoint.fatal";
    pub const CONNECTION_RESET: &str = "spark.endpoint.connection_reset";
    pub const MESSAGE_TRUNCATED: &str = "spark.endpoint.message_truncated";
    pub const INVALID_PARAM: &str = "spark.endpoint.invalid_param";
    pub const UNSUPPORTED: &str = "spark.endpoint.unsupported";
    pub const PROTOCOL_VIOLATION: &str = "spark.endpoint.protocol_violation";
    /// 没有任何传输能够满足请求的特性集合或到达对端。
    pub const NO_TRANSPORT: &str = "spark.endpoint.wireup.no_transport";
    /// 服务端拒绝了连接请求。
    pub const WIREUP_REJECTED: &str = "spark.endpoint.wireup.rejected";
    /// 对端主动断开。
    pub const PEER_DISCONNECTED: &str = "spark.endpoint.peer_disconnected";
    /// 请求句柄仍在进行中。
    pub const REQUEST_PENDING: &str = "spark.endpoint.request.pending";
    /// 请求句柄已被释放或从未存在。
    pub const REQUEST_STALE: &str = "spark.endpoint.request.stale";
    /// 唤醒前仍有待处理工作。
    pub const WAKEUP_BUSY: &str = "spark.endpoint.wakeup.busy";
}

/// 端点层的错误对象：分类 + 稳定错误码 + 文案 + 可选底层原因。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 与框架核心错误保持同一形态：`code` 为 `'static` 稳定码供日志/告警聚合，`message`
///   面向排障人员；
/// - 额外携带 [`ErrorKind`]，让完成回调、错误回调与场景测试无需解析字符串即可分流。
///
/// ## 逻辑 (How)
/// - 底层原因以 `Arc` 持有，使错误可 `Clone`：同一故障需要同时写入端点记录、
///   完成所有挂起请求并交给错误回调。
///
/// ## 契约 (What)
/// - `Display` 输出 `[code] message`；
/// - `source()` 返回底层原因（若有）。
#[derive(Clone)]
pub struct EndpointError {
    kind: ErrorKind,
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<Arc<dyn Error + Send + Sync + 'static>>,
}

impl EndpointError {
    /// 以显式错误码构造错误。
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 使用分类的默认错误码构造错误。
    pub fn from_kind(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(kind, kind.default_code(), message)
    }

    pub fn unreachable(message: impl Into<Cow<'static, str>>) -> Self {
        Self::from_kind(ErrorKind::Unreachable, message)
    }

    pub fn canceled(message: impl Into<Cow<'static, str>>) -> Self {
        Self::from_kind(ErrorKind::Canceled, message)
    }

    pub fn busy(message: impl Into<Cow<'static, str>>) -> Self {
        Self::from_kind(ErrorKind::Busy, message)
    }

    pub fn invalid_param(message: impl Into<Cow<'static, str>>) -> Self {
        Self::from_kind(ErrorKind::InvalidParam, message)
    }

    pub fn unsupported(message: impl Into<Cow<'static, str>>) -> Self {
        Self::from_kind(ErrorKind::Unsupported, message)
    }

    pub fn protocol(message: impl Into<Cow<'static, str>>) -> Self {
        Self::from_kind(ErrorKind::ProtocolViolation, message)
    }

    pub fn fatal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::from_kind(ErrorKind::Fatal, message)
    }

    /// 附带底层原因。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// 是否属于环境预期内的故障，见 [`ErrorKind::is_expected`]。
    pub fn is_expected(&self) -> bool {
        self.kind.is_expected()
    }
}

impl fmt::Debug for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("EndpointError");
        debug
            .field("kind", &self.kind)
            .field("code", &self.code)
            .field("message", &self.message);
        if let Some(cause) = &self.cause {
            debug.field("cause", &format_args!("{cause}"));
        }
        debug.finish()
    }
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for EndpointError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn expected_kinds_are_environmental() {
        assert!(ErrorKind::Unreachable.is_expected());
        assert!(ErrorKind::AddressTooLarge.is_expected());
        assert!(ErrorKind::Canceled.is_expected());
        assert!(ErrorKind::ConnectionReset.is_expected());
        assert!(!ErrorKind::Busy.is_expected());
        assert!(!ErrorKind::Fatal.is_expected());
        assert!(!ErrorKind::ProtocolViolation.is_expected());
    }

    #[test]
    fn display_carries_code_and_source_chain() {
        let err = EndpointError::unreachable("tcp connect to 127.0.0.1:1")
            .with_cause(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(err.code(), codes::UNREACHABLE);
        assert_eq!(
            err.to_string(),
            "[spark.endpoint.unreachable] tcp connect to 127.0.0.1:1"
        );
        assert!(err.source().is_some(), "底层 io 错误应保留在 source 链上");
        let cloned = err.clone();
        assert_eq!(cloned.kind(), ErrorKind::Unreachable);
    }

    #[test]
    fn wire_representation_is_stable() {
        for kind in [
            ErrorKind::Unreachable,
            ErrorKind::AddressTooLarge,
            ErrorKind::Canceled,
            ErrorKind::Busy,
            ErrorKind::Fatal,
            ErrorKind::ConnectionReset,
            ErrorKind::MessageTruncated,
            ErrorKind::InvalidParam,
            ErrorKind::Unsupported,
            ErrorKind::ProtocolViolation,
        ] {
            assert_eq!(ErrorKind::from_wire(kind.to_wire()), Some(kind));
        }
        assert_eq!(ErrorKind::from_wire(0), None);
    }
}
