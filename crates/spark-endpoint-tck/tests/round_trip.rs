//! 往返收发：从单个字到多分片缓冲区，覆盖仅 TCP 与 TCP 引导 + 进程内数据通道两种组合。

use bytes::Bytes;
use proptest::prelude::*;
use spark_endpoint::LaneUsage;
use spark_endpoint::prelude::*;
use spark_endpoint_tck::{Counters, Outcome, Setup, progress_pair_until, skip_expected};
use std::net::SocketAddr;

const SEGMENT: usize = 4 * 1024;

fn pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

fn sizes() -> [usize; 5] {
    [8, 1024, SEGMENT, SEGMENT * 3 + 17, 1024 * 1024]
}

fn round_trip_sizes(setup: Setup) {
    let mut pair = setup.segment_size(SEGMENT).connect_pair().expect("pair");
    for (index, len) in sizes().into_iter().enumerate() {
        let payload = pattern(len);
        let received = pair
            .round_trip(index as Tag, payload.clone())
            .unwrap_or_else(|err| panic!("{len} byte round trip: {err:#}"));
        assert_eq!(received, payload, "{len} byte payload differs");
    }
    assert_eq!(pair.client.user().errors + pair.server.user().errors, 0);
}

#[test]
fn tcp_round_trip_from_one_word_to_many_segments() {
    round_trip_sizes(Setup::tcp());
}

#[test]
fn mem_round_trip_from_one_word_to_many_segments() {
    round_trip_sizes(Setup::tcp_and_mem());
}

fn sends_posted_before_ready(setup: Setup) {
    let setup = setup.segment_size(SEGMENT);
    let context = setup.build_context().expect("context");
    let mut server = context.create_worker(Counters::default()).expect("server");
    let mut client = context.create_worker(Counters::default()).expect("client");
    let listener = server
        .listen(SocketAddr::from(([127, 0, 0, 1], 0)), setup.listener_params())
        .expect("listen");
    let addr = server.listener_address(listener).expect("address");

    let ep = client.connect(setup.client_params(addr)).expect("connect");
    assert_ne!(client.endpoint_state(ep).expect("state"), EndpointState::Ready);
    let large = pattern(SEGMENT * 3 + 5);
    let first = client
        .post_send(ep, &b"first"[..], 50)
        .expect("send before ready")
        .handle()
        .expect("queued until wireup completes");
    let second = client
        .post_send(ep, large.clone(), 50)
        .expect("send before ready")
        .handle()
        .expect("queued until wireup completes");
    let small = server.post_receive(50, TAG_MASK_FULL, 64).expect("receive");
    let big = server
        .post_receive(50, TAG_MASK_FULL, SEGMENT * 4)
        .expect("receive");
    let (small, big) = (
        small.handle().expect("pending"),
        big.handle().expect("pending"),
    );

    progress_pair_until(&mut client, &mut server, setup.timeout, |client, server| {
        let done = |worker: &Worker<Counters>, handle| {
            worker
                .request_status(handle)
                .is_ok_and(|status: Status| status.is_terminal())
        };
        // 同一端点上的发送按投递顺序完成。
        if done(client, second) {
            assert!(done(client, first), "second send completed before the first");
        }
        done(client, first) && done(client, second) && done(server, small) && done(server, big)
    })
    .expect("queued sends delivered");

    assert!(client.release(first).expect("first").is_ok());
    assert!(client.release(second).expect("second").is_ok());
    let small = server.release(small).expect("small");
    let big = server.release(big).expect("big");
    assert_eq!(small.data().map(|data| &data[..]), Some(&b"first"[..]));
    assert_eq!(big.data(), Some(&large));
    assert_eq!(client.endpoint_state(ep).expect("state"), EndpointState::Ready);
    assert_eq!(client.user().errors + server.user().errors, 0);
}

#[test]
fn tcp_sends_posted_before_ready_are_delivered_in_order() {
    sends_posted_before_ready(Setup::tcp());
}

#[test]
fn mem_sends_posted_before_ready_are_delivered_in_order() {
    sends_posted_before_ready(Setup::tcp_and_mem());
}

#[test]
fn mem_transport_replaces_the_bootstrap_lane() {
    let mut pair = Setup::tcp_and_mem().connect_pair().expect("pair");
    let lanes = pair.client.endpoint_lanes(pair.client_ep).expect("lanes");
    assert_eq!(lanes.len(), 1);
    assert_eq!(lanes[0].transport, "mem");
    assert!(!lanes[0].bootstrap);
    let server_lanes = pair.server.endpoint_lanes(pair.server_ep).expect("lanes");
    assert_eq!(server_lanes[0].transport, "mem");

    // 引导连接关闭后仍可收发。
    for _ in 0..32 {
        pair.progress();
    }
    let received = pair.round_trip(3, pattern(64)).expect("round trip");
    assert_eq!(received, pattern(64));
}

#[test]
fn server_can_send_back_to_the_client() {
    let mut pair = Setup::tcp().connect_pair().expect("pair");
    let receive = pair
        .client
        .post_receive(9, TAG_MASK_FULL, 16)
        .expect("client receive");
    let send = pair
        .server
        .post_send(pair.server_ep, &b"pong"[..], 9)
        .expect("server send");
    let (received, sent) = pair.settle(receive, send).expect("settled");
    assert!(sent.is_ok());
    assert_eq!(received.tag(), Some(9));
    assert_eq!(received.data().map(|data| &data[..]), Some(&b"pong"[..]));
}

#[test]
fn unexpected_messages_are_claimed_by_later_receives() {
    let mut pair = Setup::tcp().connect_pair().expect("pair");
    let early = pair
        .client
        .post_send(pair.client_ep, &b"early"[..], 42)
        .expect("send");
    assert!(early.is_completed(), "eager sends complete on post");
    // 同一通道有序：标记消息送达时，先发的消息已进入未预期队列。
    let marker_receive = pair.server.post_receive(43, TAG_MASK_FULL, 8).expect("receive");
    let marker_send = pair
        .client
        .post_send(pair.client_ep, &b"marker"[..], 43)
        .expect("send");
    pair.settle(marker_send, marker_receive).expect("marker delivered");

    let receive = pair.server.post_receive(42, TAG_MASK_FULL, 16).expect("receive");
    let Posted::Completed(completion) = receive else {
        panic!("buffered message should complete the receive on post");
    };
    assert_eq!(completion.data().map(|data| &data[..]), Some(&b"early"[..]));
}

#[test]
fn completion_callbacks_fire_for_pending_requests_only() {
    let mut pair = Setup::tcp().connect_pair().expect("pair");
    let receive = pair
        .server
        .post_receive_with(11, TAG_MASK_FULL, 8, Counters::on_complete)
        .expect("receive");
    assert!(!receive.is_completed());
    let send = pair
        .client
        .post_send_with(pair.client_ep, &b"cb"[..], 11, Counters::on_complete)
        .expect("send");
    assert!(send.is_completed());
    pair.settle(send, receive).expect("settled");
    assert_eq!(pair.server.user().completions, 1);
    assert_eq!(pair.client.user().completions, 0);
}

#[test]
fn masked_receive_matches_tag_bits() {
    let mut pair = Setup::tcp().connect_pair().expect("pair");
    let receive = pair
        .server
        .post_receive(0x1200, 0xff00, 8)
        .expect("masked receive");
    let send = pair
        .client
        .post_send(pair.client_ep, &b"masked"[..], 0x12ab)
        .expect("send");
    let (sent, received) = pair.settle(send, receive).expect("settled");
    assert!(sent.is_ok());
    assert_eq!(received.tag(), Some(0x12ab));
}

#[test]
fn longer_message_truncates_the_receive() {
    let mut pair = Setup::tcp().connect_pair().expect("pair");
    let receive = pair.server.post_receive(5, TAG_MASK_FULL, 4).expect("receive");
    let send = pair
        .client
        .post_send(pair.client_ep, pattern(32), 5)
        .expect("send");
    let (_, received) = pair.settle(send, receive).expect("settled");
    assert_eq!(received.status(), Status::Error(ErrorKind::MessageTruncated));
    assert_eq!(received.length(), 32);
}

#[test]
fn remote_access_without_capable_transport_is_skipped() {
    let outcome = skip_expected(
        Setup::tcp()
            .features(Features::TAG | Features::RMA)
            .connect_pair()
            .map(drop),
    )
    .expect("expected outcome");
    assert!(matches!(outcome, Outcome::Skipped(_)));
}

#[test]
fn remote_access_and_atomics_wire_up_over_mem() {
    for features in [
        Features::TAG | Features::RMA,
        Features::TAG | Features::AMO32,
        Features::TAG | Features::AMO64,
        Features::TAG | Features::RMA | Features::AMO32 | Features::AMO64,
    ] {
        let mut pair = Setup::tcp_and_mem()
            .features(features)
            .connect_pair()
            .unwrap_or_else(|err| panic!("{features:?}: {err:#}"));
        let lanes = pair.client.endpoint_lanes(pair.client_ep).expect("lanes");
        let usage = lanes
            .iter()
            .fold(LaneUsage::empty(), |usage, lane| usage | lane.usage);
        assert!(usage.contains(LaneUsage::AM));
        if features.contains(Features::RMA) {
            assert!(usage.contains(LaneUsage::RMA));
        }
        if features.intersects(Features::AMO32 | Features::AMO64) {
            assert!(usage.contains(LaneUsage::AMO));
        }
        let received = pair.round_trip(1, pattern(16)).expect("round trip");
        assert_eq!(received.len(), 16);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn arbitrary_payloads_survive_the_round_trip(
        payload in proptest::collection::vec(any::<u8>(), 1..(SEGMENT * 4)),
        tag in any::<u64>(),
    ) {
        let mut pair = Setup::tcp().segment_size(SEGMENT).connect_pair().expect("pair");
        let payload = Bytes::from(payload);
        let received = pair.round_trip(tag, payload.clone()).expect("round trip");
        prop_assert_eq!(received, payload);
    }
}
