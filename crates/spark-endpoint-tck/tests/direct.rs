//! 探测路径：以带外获得的 Worker 地址直连，收发后拆除。

use spark_endpoint::prelude::*;
use spark_endpoint::{LaneUsage, WorkerAddress};
use spark_endpoint_tck::{Counters, Setup, progress_pair_until};

fn direct_params(address: WorkerAddress) -> EndpointParams<Counters> {
    EndpointParams::worker(address)
        .err_mode(ErrorMode::Peer)
        .on_error(Counters::on_error)
}

#[test]
fn probe_reports_transports_per_feature_set() {
    let context = Setup::tcp_and_mem().build_context().expect("context");
    assert_eq!(context.probe(Features::TAG), vec!["tcp", "mem"]);
    assert_eq!(context.probe(Features::TAG | Features::AMO64), vec!["mem"]);
}

#[test]
fn worker_address_round_trips_through_its_encoding() {
    let context = Setup::mem().build_context().expect("context");
    let worker = context.create_worker(Counters::default()).expect("worker");
    let address = worker.address();
    assert_eq!(address.uuid(), worker.uuid());
    assert_eq!(address.ifaces().len(), 1);
    assert_eq!(address.ifaces()[0].name, "mem");
    let decoded = WorkerAddress::decode(&address.encode()).expect("decode");
    assert_eq!(decoded, address);
}

#[test]
fn direct_connect_sends_and_tears_down() {
    let setup = Setup::mem().features(Features::TAG | Features::RMA);
    let context = setup.build_context().expect("context");
    let mut server = context.create_worker(Counters::default()).expect("server");
    let mut client = context.create_worker(Counters::default()).expect("client");

    let ep = client
        .connect(direct_params(server.address()))
        .expect("direct connect");
    progress_pair_until(&mut client, &mut server, setup.timeout, |client, _| {
        client.endpoint_state(ep).is_ok_and(|state| state == EndpointState::Ready)
    })
    .expect("direct endpoint ready");
    let lanes = client.endpoint_lanes(ep).expect("lanes");
    assert!(lanes.iter().all(|lane| lane.transport == "mem" && !lane.bootstrap));
    assert!(lanes.iter().any(|lane| lane.usage.contains(LaneUsage::RMA)));

    let receive = server.post_receive(30, TAG_MASK_FULL, 32).expect("receive");
    let send = client.post_send(ep, &b"probe"[..], 30).expect("send");
    assert!(send.is_completed());
    let handle = receive.handle().expect("pending receive");
    progress_pair_until(&mut client, &mut server, setup.timeout, |_, server| {
        server
            .request_status(handle)
            .is_ok_and(|status| status.is_terminal())
    })
    .expect("probe delivered");
    let completion = server.release(handle).expect("release");
    assert_eq!(completion.data().map(|data| &data[..]), Some(&b"probe"[..]));

    assert!(client.close_endpoint(ep, CloseMode::Force).expect("close").is_completed());
    assert_eq!(client.endpoint_state(ep).expect("state"), EndpointState::Closed);
    assert_eq!(client.endpoint_count(), 0);
    client.shutdown();
    server.shutdown();
    assert_eq!(client.user().errors + server.user().errors, 0);
}

#[test]
fn peers_on_another_fabric_are_unreachable() {
    let setup = Setup::mem();
    let here = setup.build_context().expect("context");
    let elsewhere = setup.build_context().expect("context");
    let mut client = here.create_worker(Counters::default()).expect("client");
    let remote = elsewhere.create_worker(Counters::default()).expect("remote");

    let err = client
        .connect(direct_params(remote.address()))
        .expect_err("different fabric");
    assert_eq!(err.kind(), ErrorKind::Unreachable);
    assert_eq!(client.endpoint_count(), 0);
    assert_eq!(client.user().errors, 0);
}

#[test]
fn dropped_peer_fails_the_direct_endpoint_once() {
    let setup = Setup::mem();
    let context = setup.build_context().expect("context");
    let mut client = context.create_worker(Counters::default()).expect("client");
    let mut server = context.create_worker(Counters::default()).expect("server");
    let ep = client
        .connect(direct_params(server.address()))
        .expect("direct connect");
    progress_pair_until(&mut client, &mut server, setup.timeout, |client, _| {
        client.endpoint_state(ep).is_ok_and(|state| state == EndpointState::Ready)
    })
    .expect("ready");

    drop(server);
    let mut rounds = 0;
    while client.user().errors == 0 && rounds < 1_000 {
        client.progress();
        rounds += 1;
    }
    for _ in 0..16 {
        client.progress();
    }
    assert_eq!(client.user().failed, vec![(ep, ErrorKind::ConnectionReset)]);
    assert_eq!(client.endpoint_state(ep).expect("state"), EndpointState::Failed);
}
