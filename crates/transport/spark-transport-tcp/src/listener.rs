use crate::{
    error::{self, map_io_error},
    util::bind_listener,
};
use mio::{
    Token,
    net::{TcpListener as MioTcpListener, TcpStream},
};
use spark_endpoint::EndpointError;
use std::{io, net::SocketAddr};

/// 对 mio `TcpListener` 的语义封装。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 提供“监听 → 接受连接”的最小能力，接受到的连接交由接口包装为通道并上报 Worker；
/// - 绑定经由 socket2 完成，以便在 `listen` 之前设置 `SO_REUSEADDR` 与 backlog。
///
/// ## 逻辑 (How)
/// - `bind`：创建非阻塞监听套接字并读取实际绑定地址（端口 0 时由内核分配）；
/// - `accept_all`：边沿触发下必须接受到 `WouldBlock` 为止；瞬时错误
///   （`ConnectionAborted`/`ConnectionReset`）跳过该连接继续接受。
///
/// ## 契约 (What)
/// - 通配地址（`0.0.0.0`）绑定后，对同一端口任何本机地址的连接都会被接受；
/// - 绑定失败以 `map_io_error(BIND, ..)` 报告：端口占用为 `Busy`，地址不属于本机为 `Unreachable`。
#[derive(Debug)]
pub(crate) struct TcpListener {
    pub inner: MioTcpListener,
    pub token: Option<Token>,
    pub local_addr: SocketAddr,
}

impl TcpListener {
    pub(crate) fn bind(addr: SocketAddr, backlog: i32) -> Result<Self, EndpointError> {
        let std_listener =
            bind_listener(addr, backlog).map_err(|err| map_io_error(error::BIND, err))?;
        let local_addr = std_listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        Ok(Self {
            inner: MioTcpListener::from_std(std_listener),
            token: None,
            local_addr,
        })
    }

    /// 接受所有已排队的连接。
    ///
    /// 返回已接受的连接；遇到非瞬时错误时一并返回该错误，监听者应被关闭。
    pub(crate) fn accept_all(
        &mut self,
    ) -> (Vec<(TcpStream, SocketAddr)>, Option<EndpointError>) {
        let mut accepted = Vec::new();
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => accepted.push((stream, peer)),
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => return (accepted, None),
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
                        tracing::warn!(?err, local_addr = %self.local_addr, "transient accept error");
                        continue;
                    }
                    _ => {
                        tracing::error!(?err, local_addr = %self.local_addr, "error accepting connection");
                        return (accepted, Some(map_io_error(error::ACCEPT, err)));
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_endpoint::ErrorKind;

    #[test]
    fn port_zero_reports_assigned_port() {
        let listener = TcpListener::bind("127.0.0.1:0".parse().expect("addr"), 16).expect("bind");
        assert_ne!(listener.local_addr.port(), 0);
    }

    #[test]
    fn foreign_address_is_unreachable() {
        // TEST-NET-1 never belongs to a local interface.
        let err = TcpListener::bind("192.0.2.1:0".parse().expect("addr"), 16)
            .expect_err("address is not local");
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }

    #[test]
    fn accept_without_pending_connections_is_empty() {
        let mut listener =
            TcpListener::bind("127.0.0.1:0".parse().expect("addr"), 16).expect("bind");
        let (accepted, error) = listener.accept_all();
        assert!(accepted.is_empty());
        assert!(error.is_none());
    }
}
