//! 唤醒：arm 在有未消费工作时返回 Busy，排空后返回 Ok；事件描述符在消息到达时可读。

use spark_endpoint::codes;
use spark_endpoint::prelude::*;
use spark_endpoint_tck::{Counters, Setup, progress_pair_until, wait_for_wakeup};
use std::time::{Duration, Instant};

fn wakeup_setup() -> Setup {
    Setup::tcp().features(Features::TAG | Features::WAKEUP)
}

fn arm_until_ok(worker: &mut Worker<Counters>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        match worker.arm() {
            Ok(()) => return,
            Err(err) => assert_eq!(err.kind(), ErrorKind::Busy, "{err}"),
        }
        assert!(Instant::now() < deadline, "worker never became armable");
        while worker.progress() {}
    }
}

#[test]
fn arm_requires_the_wakeup_feature() {
    let context = Setup::tcp().build_context().expect("context");
    let mut worker = context.create_worker(Counters::default()).expect("worker");
    assert_eq!(worker.arm().expect_err("no wakeup").kind(), ErrorKind::Unsupported);
    assert!(worker.signaller().is_err());
}

#[test]
fn signal_makes_arm_busy_once() {
    let context = wakeup_setup().build_context().expect("context");
    let mut worker = context.create_worker(Counters::default()).expect("worker");
    worker.arm().expect("idle worker arms");
    worker.signaller().expect("signaller").signal().expect("signal");
    let err = worker.arm().expect_err("pending signal");
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert_eq!(err.code(), codes::WAKEUP_BUSY);
    worker.arm().expect("signal consumed by the previous arm");
}

#[test]
fn arm_is_busy_until_incoming_data_is_drained() {
    let mut pair = wakeup_setup().connect_pair().expect("pair");
    let timeout = pair.timeout;
    arm_until_ok(&mut pair.client, timeout);
    arm_until_ok(&mut pair.server, timeout);

    let send = pair
        .client
        .post_send(pair.client_ep, &b"wake"[..], 77)
        .expect("send");
    assert!(send.is_completed());

    let deadline = Instant::now() + timeout;
    loop {
        match pair.server.arm() {
            Err(err) if err.kind() == ErrorKind::Busy => break,
            Err(err) => panic!("unexpected arm failure: {err}"),
            Ok(()) => {
                assert!(Instant::now() < deadline, "data never reached the server");
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
    // 仍未消费：再次武装依旧 Busy。
    assert_eq!(pair.server.arm().expect_err("still pending").kind(), ErrorKind::Busy);

    arm_until_ok(&mut pair.server, timeout);
    let receive = pair.server.post_receive(77, TAG_MASK_FULL, 8).expect("receive");
    assert!(receive.is_completed(), "drained message waits in the unexpected queue");
}

#[test]
fn event_descriptors_wake_the_waiting_side() {
    let mut pair = wakeup_setup().connect_pair().expect("pair");
    let timeout = pair.timeout;
    arm_until_ok(&mut pair.client, timeout);
    arm_until_ok(&mut pair.server, timeout);

    let receive = pair.server.post_receive(5, TAG_MASK_FULL, 8).expect("receive");
    let send = pair
        .client
        .post_send(pair.client_ep, &b"fd"[..], 5)
        .expect("send");

    let deadline = Instant::now() + timeout;
    let handle = receive.handle().expect("pending receive");
    while pair.server.request_status(handle).expect("status") == Status::Pending {
        assert!(Instant::now() < deadline, "receive never completed");
        let woke = wait_for_wakeup(&mut pair.client, &mut pair.server, Duration::from_millis(100))
            .expect("wait");
        if woke {
            pair.progress();
        }
    }
    let (sent, received) = pair.settle(send, receive).expect("settled");
    assert!(sent.is_ok());
    assert_eq!(received.data().map(|data| &data[..]), Some(&b"fd"[..]));
}

#[test]
fn wait_returns_when_signalled_from_another_thread() {
    let context = wakeup_setup().build_context().expect("context");
    let mut worker = context.create_worker(Counters::default()).expect("worker");
    arm_until_ok(&mut worker, Duration::from_secs(1));
    let signal = worker.signaller().expect("signaller");
    let signaller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        signal.signal()
    });
    let started = Instant::now();
    worker.wait(Some(Duration::from_secs(10))).expect("wait");
    assert!(started.elapsed() < Duration::from_secs(10));
    signaller.join().expect("thread").expect("signal");
}

#[test]
fn wait_with_pending_work_returns_immediately() {
    let context = wakeup_setup().build_context().expect("context");
    let mut worker = context.create_worker(Counters::default()).expect("worker");
    worker.signaller().expect("signaller").signal().expect("signal");
    let started = Instant::now();
    worker.wait(Some(Duration::from_secs(10))).expect("wait");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn departed_mem_peer_wakes_an_armed_worker() {
    let setup = Setup::mem().features(Features::TAG | Features::WAKEUP);
    let context = setup.build_context().expect("context");
    let mut client = context.create_worker(Counters::default()).expect("client");
    let mut server = context.create_worker(Counters::default()).expect("server");
    let ep = client
        .connect(
            EndpointParams::worker(server.address())
                .err_mode(ErrorMode::Peer)
                .on_error(Counters::on_error),
        )
        .expect("direct connect");
    progress_pair_until(&mut client, &mut server, setup.timeout, |client, server| {
        client
            .endpoint_state(ep)
            .is_ok_and(|state| state == EndpointState::Ready)
            && server.endpoint_count() == 1
    })
    .expect("ready");
    for _ in 0..16 {
        client.progress();
        server.progress();
    }
    arm_until_ok(&mut client, setup.timeout);

    let dropper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        drop(server);
    });
    let started = Instant::now();
    while client.user().errors == 0 {
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "peer departure never woke the worker"
        );
        client.wait(Some(Duration::from_secs(10))).expect("wait");
        while client.progress() {}
    }
    dropper.join().expect("dropper thread");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.user().failed, vec![(ep, ErrorKind::ConnectionReset)]);
}
