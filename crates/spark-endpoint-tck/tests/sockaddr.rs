//! 套接字地址场景：监听、通配监听、无监听者、地址信息过大、拒绝连接。

use spark_endpoint::codes;
use spark_endpoint::prelude::*;
use spark_endpoint_tck::{
    Counters, Outcome, Setup, progress_pair_until, skip_expected, vacant_local_addr,
};
use spark_transport_tcp::TcpConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing_test::traced_test;

#[test]
fn listen_and_connect_reach_ready_on_both_sides() {
    let pair = Setup::tcp().connect_pair().expect("pair");
    assert_eq!(
        pair.client.endpoint_state(pair.client_ep).expect("client"),
        EndpointState::Ready
    );
    assert_eq!(
        pair.server.endpoint_state(pair.server_ep).expect("server"),
        EndpointState::Ready
    );
    assert_eq!(pair.server.user().accepted.len(), 1);
    assert_eq!(pair.server.listener_attempts(pair.listener).expect("attempts"), 1);
    assert_eq!(pair.client.endpoint_count(), 1);
    assert_eq!(pair.server.endpoint_count(), 1);
    assert_eq!(pair.client.user().errors + pair.server.user().errors, 0);
}

#[test]
fn tcp_only_pair_reuses_the_bootstrap_lane() {
    let pair = Setup::tcp().connect_pair().expect("pair");
    let lanes = pair.client.endpoint_lanes(pair.client_ep).expect("lanes");
    assert_eq!(lanes.len(), 1);
    assert_eq!(lanes[0].transport, "tcp");
    assert!(lanes[0].bootstrap);
}

#[test]
fn listen_on_wildcard_accepts_loopback_connections() {
    let wildcard = SocketAddr::from(([0, 0, 0, 0], 0));
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let pair = Setup::tcp()
        .connect_pair_via(wildcard, Some(loopback))
        .expect("wildcard pair");
    let bound = pair.server.listener_address(pair.listener).expect("bound");
    assert!(bound.ip().is_unspecified());
    assert_ne!(bound.port(), 0);
    assert_eq!(
        pair.server.endpoint_state(pair.server_ep).expect("server"),
        EndpointState::Ready
    );
}

#[test]
fn connecting_without_listener_fails_once_with_unreachable() {
    let setup = Setup::tcp();
    let context = setup.build_context().expect("context");
    let mut client = context.create_worker(Counters::default()).expect("worker");
    let mut idle = context.create_worker(Counters::default()).expect("worker");
    let addr = vacant_local_addr(&mut idle, setup.listener_params()).expect("vacant port");

    let ep = client.connect(setup.client_params(addr)).expect("connect returns an endpoint");
    progress_pair_until(&mut client, &mut idle, setup.timeout, |client, _| {
        client.user().errors > 0
    })
    .expect("failure reported");
    // 额外推进不会再次触发回调。
    for _ in 0..64 {
        client.progress();
    }

    assert_eq!(client.user().errors, 1);
    assert_eq!(client.user().failed, vec![(ep, ErrorKind::Unreachable)]);
    assert_eq!(client.endpoint_state(ep).expect("state"), EndpointState::Failed);
    let err = client.endpoint_error(ep).expect("recorded error");
    assert_eq!(err.kind(), ErrorKind::Unreachable);
    assert!(err.is_expected());

    let err = client
        .post_send(ep, &b"late"[..], 1)
        .expect_err("failed endpoint rejects sends");
    assert_eq!(err.kind(), ErrorKind::Unreachable);
    assert!(client.close_endpoint(ep, CloseMode::Force).expect("close").is_completed());
    assert_eq!(client.endpoint_state(ep).expect("state"), EndpointState::Closed);
}

#[test]
fn listening_on_a_foreign_address_is_unreachable() {
    let context = Setup::tcp().build_context().expect("context");
    let mut worker = context.create_worker(Counters::default()).expect("worker");
    // TEST-NET-1 never belongs to a local interface.
    let err = worker
        .listen(SocketAddr::from(([192, 0, 2, 1], 0)), ListenerParams::default())
        .expect_err("foreign address");
    assert_eq!(err.kind(), ErrorKind::Unreachable);
    let outcome = skip_expected(Err(err.into())).expect("expected outcome");
    assert!(outcome.is_skipped());
}

#[test]
fn listening_twice_on_one_port_is_busy() {
    let context = Setup::tcp().build_context().expect("context");
    let mut worker = context.create_worker(Counters::default()).expect("worker");
    let first = worker
        .listen(SocketAddr::from(([127, 0, 0, 1], 0)), ListenerParams::default())
        .expect("first listener");
    let addr = worker.listener_address(first).expect("bound");
    let err = worker
        .listen(addr, ListenerParams::default())
        .expect_err("port already taken");
    assert_eq!(err.kind(), ErrorKind::Busy);
}

#[test]
#[traced_test]
fn oversized_bootstrap_fails_with_address_too_large() {
    let setup = Setup::tcp_and_mem().tcp_config(TcpConfig {
        max_bootstrap_len: 8,
        ..TcpConfig::default()
    });
    let result = setup.connect_pair();
    let err = result.as_ref().err().and_then(|err| err.downcast_ref::<EndpointError>());
    assert_eq!(err.map(EndpointError::kind), Some(ErrorKind::AddressTooLarge));
    assert!(logs_contain("exceeds the bootstrap capacity"));
    let outcome = skip_expected(result.map(drop)).expect("expected outcome");
    assert!(matches!(outcome, Outcome::Skipped(_)));
}

#[test]
fn oversized_bootstrap_invokes_the_client_handler_once() {
    let setup = Setup::tcp().tcp_config(TcpConfig {
        max_bootstrap_len: 8,
        ..TcpConfig::default()
    });
    let context = setup.build_context().expect("context");
    let mut server = context.create_worker(Counters::default()).expect("server");
    let mut client = context.create_worker(Counters::default()).expect("client");
    let listener = server
        .listen(SocketAddr::from(([127, 0, 0, 1], 0)), setup.listener_params())
        .expect("listen");
    let addr = server.listener_address(listener).expect("bound");
    let ep = client.connect(setup.client_params(addr)).expect("connect");

    progress_pair_until(&mut client, &mut server, setup.timeout, |client, server| {
        client.user().errors > 0 && server.listener_attempts(listener).unwrap_or(0) > 0
    })
    .expect("client failure");
    for _ in 0..64 {
        client.progress();
        server.progress();
    }

    assert_eq!(client.user().failed, vec![(ep, ErrorKind::AddressTooLarge)]);
    // 服务端端点在就绪前失败，不会公告也不会触发回调。
    assert!(server.user().accepted.is_empty());
    assert_eq!(server.user().errors, 0);
    assert_eq!(server.endpoint_count(), 0);
}

#[test]
fn rejecting_listener_makes_clients_unreachable() {
    let setup = Setup::tcp();
    let context = setup.build_context().expect("context");
    let mut server = context.create_worker(Counters::default()).expect("server");
    let mut client = context.create_worker(Counters::default()).expect("client");
    let listener = server
        .listen(SocketAddr::from(([127, 0, 0, 1], 0)), setup.listener_params())
        .expect("listen");
    server.reject_connections(listener, true).expect("reject");
    let addr = server.listener_address(listener).expect("bound");
    let ep = client.connect(setup.client_params(addr)).expect("connect");

    progress_pair_until(&mut client, &mut server, setup.timeout, |client, _| {
        client.user().errors > 0
    })
    .expect("rejection reported");

    assert_eq!(client.user().failed, vec![(ep, ErrorKind::Unreachable)]);
    let err = client.endpoint_error(ep).expect("error");
    assert_eq!(err.code(), codes::WIREUP_REJECTED);
    assert!(server.user().accepted.is_empty());
    assert_eq!(server.listener_attempts(listener).expect("attempts"), 1);
}

#[test]
fn closed_listener_stops_accepting() {
    let setup = Setup::tcp();
    let context = setup.build_context().expect("context");
    let mut server = context.create_worker(Counters::default()).expect("server");
    let listener = server
        .listen(SocketAddr::from(([127, 0, 0, 1], 0)), setup.listener_params())
        .expect("listen");
    server.close_listener(listener).expect("close");
    let err = server.listener_address(listener).expect_err("listener is gone");
    assert_eq!(err.kind(), ErrorKind::InvalidParam);
    assert!(server.close_listener(listener).is_err());
    assert!(server.take_accepted(listener).is_empty());
}

#[test]
fn connect_without_client_server_flag_is_invalid() {
    let context = Setup::tcp().build_context().expect("context");
    let mut client = context.create_worker(Counters::default()).expect("client");
    let params = EndpointParams::<Counters>::sockaddr(SocketAddr::from(([127, 0, 0, 1], 1)))
        .flags(spark_endpoint::EndpointFlags::empty());
    let err = client.connect(params).expect_err("flag required");
    assert_eq!(err.kind(), ErrorKind::InvalidParam);
    assert_eq!(client.endpoint_count(), 0);
}
