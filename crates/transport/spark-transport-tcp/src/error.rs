use spark_endpoint::{EndpointError, ErrorKind};
use std::io;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.tcp.configure_failed",
    message: "tcp configure",
};
pub(crate) const REGISTER: OperationKind = OperationKind {
    code: "spark.transport.tcp.register_failed",
    message: "tcp register",
};

pub(crate) const PEER_CLOSED_CODE: &str = "spark.transport.tcp.peer_closed";
pub(crate) const FRAME_TOO_LARGE_CODE: &str = "spark.transport.tcp.frame_too_large";
pub(crate) const UNKNOWN_LANE_CODE: &str = "spark.transport.tcp.unknown_lane";

/// 将 IO 错误映射为端点错误，并附带错误分类。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> EndpointError {
    let category = categorize_io_error(kind, &error);
    EndpointError::new(category, kind.code, format!("{}: {}", kind.message, error))
        .with_cause(error)
}

/// 对端正常关闭连接（读到 EOF）。
pub(crate) fn peer_closed() -> EndpointError {
    EndpointError::new(
        ErrorKind::ConnectionReset,
        PEER_CLOSED_CODE,
        "tcp peer closed the connection",
    )
}

fn categorize_io_error(kind: OperationKind, error: &io::Error) -> ErrorKind {
    use io::ErrorKind as Io;
    match error.kind() {
        Io::AddrInUse => ErrorKind::Busy,
        Io::WouldBlock | Io::Interrupted => ErrorKind::Busy,
        Io::ConnectionRefused
        | Io::AddrNotAvailable
        | Io::HostUnreachable
        | Io::NetworkUnreachable
        | Io::TimedOut => ErrorKind::Unreachable,
        Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::NotConnected
        | Io::BrokenPipe
        | Io::UnexpectedEof
        | Io::WriteZero => {
            if kind.code == CONNECT.code {
                ErrorKind::Unreachable
            } else {
                ErrorKind::ConnectionReset
            }
        }
        Io::InvalidInput | Io::PermissionDenied => ErrorKind::InvalidParam,
        Io::Unsupported => ErrorKind::Unsupported,
        _ => ErrorKind::Fatal,
    }
}
