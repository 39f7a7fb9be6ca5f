//! Best-effort cancellation of in-flight calls.

mod helpers;

use helpers::Feature;
use helpers::scheduling::{WAIT, mem_channel};
use rpc_reactor::{
    CallContext, ReadDecision, Reactor, StatusCode, StreamCallbacks, StreamReactor, UnaryChannel,
    UnaryReactor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

fn counting_reactor() -> (Arc<UnaryReactor<Feature>>, Arc<AtomicUsize>, mpsc::Receiver<()>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let (tx, rx) = mpsc::channel();
    let reactor = Arc::new(UnaryReactor::new(move |_: &Arc<UnaryReactor<Feature>>| {
        counter.fetch_add(1, Ordering::SeqCst);
        tx.send(()).unwrap();
    }));
    (reactor, calls, rx)
}

#[test]
fn cancel_right_after_start_completes_exactly_once() {
    let channel = mem_channel(20);
    let get_feature = channel.unary(|id: u32| Ok(Feature::new(id)));
    let (reactor, calls, done) = counting_reactor();

    reactor.start(&get_feature, 7).unwrap();
    reactor.try_cancel();

    done.recv_timeout(WAIT).expect("call never completed");
    let code = reactor.status().unwrap().code();
    assert!(
        matches!(code, StatusCode::Cancelled | StatusCode::Ok),
        "unexpected status {code}"
    );
    assert!(done.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_before_start_still_reports_completion() {
    let channel = mem_channel(0);
    let get_feature = channel.unary(|id: u32| Ok(Feature::new(id)));
    let (reactor, calls, done) = counting_reactor();

    reactor.try_cancel();
    reactor.start(&get_feature, 1).unwrap();

    done.recv_timeout(WAIT).expect("call never completed");
    assert_eq!(reactor.status().unwrap().code(), StatusCode::Cancelled);
    assert_eq!(reactor.take_response(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_cancels_are_idempotent() {
    const THREADS: usize = 8;
    let channel = mem_channel(5_000);
    let get_feature = channel.unary(|id: u32| Ok(Feature::new(id)));
    let (reactor, calls, done) = counting_reactor();
    reactor.start(&get_feature, 1).unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let cancellers: Vec<_> = (0..THREADS)
        .map(|_| {
            let reactor = reactor.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                reactor.try_cancel();
                reactor.try_cancel();
            })
        })
        .collect();
    for canceller in cancellers {
        canceller.join().unwrap();
    }

    done.recv_timeout(WAIT).expect("call never completed");
    assert!(done.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(reactor.status().unwrap().code(), StatusCode::Cancelled);
}

#[test]
fn cancelling_held_stream_ends_it() {
    let channel = mem_channel(0);
    let list_features =
        channel.stream(|n: u32| Ok((1..=n).map(Feature::new).collect::<Vec<_>>()));

    let (item_tx, item_rx) = mpsc::channel();
    let (end_tx, end_rx) = mpsc::channel();
    let callbacks = StreamCallbacks::new(
        move |_, _: &Feature| {
            item_tx.send(()).unwrap();
            ReadDecision::Hold
        },
        move |_| end_tx.send(()).unwrap(),
    );
    let reactor = Arc::new(StreamReactor::new(callbacks));
    reactor.start(&list_features, 10).unwrap();

    item_rx.recv_timeout(WAIT).unwrap();
    reactor.try_cancel();
    assert_eq!(reactor.take_response(), Some(Feature::new(1)));

    end_rx.recv_timeout(WAIT).expect("stream never ended");
    assert_eq!(reactor.status().unwrap().code(), StatusCode::Cancelled);
    assert_eq!(reactor.items_received(), 1);
}

/// Unary transport that keeps only the call context.
#[derive(Default)]
struct ContextOnlyChannel {
    context: Mutex<Option<CallContext>>,
}

impl UnaryChannel<u32, Feature> for ContextOnlyChannel {
    fn start_unary(&self, ctx: CallContext, _request: u32, _reactor: Arc<UnaryReactor<Feature>>) {
        *self.context.lock().unwrap() = Some(ctx);
    }
}

#[test]
fn dropping_the_last_reference_cancels_the_call() {
    let channel = ContextOnlyChannel::default();
    let reactor = Arc::new(UnaryReactor::new(|_: &Arc<UnaryReactor<Feature>>| {}));
    reactor.start(&channel, 1).unwrap();

    let ctx = channel.context.lock().unwrap().clone().unwrap();
    assert_eq!(ctx.call_id(), reactor.call_id());
    assert!(!ctx.is_cancelled());

    drop(reactor);
    assert!(ctx.is_cancelled());
}
