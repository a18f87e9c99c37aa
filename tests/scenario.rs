//! End-to-end behaviour of stores, strategies, queues, throttling and batches.
use parking_lot::Mutex;
use reflux::{
    Context, Delivery, Dispatcher, DispatcherConfig, QueueId, RecordingMiddleware, RunOptions,
    Store, StoreOptions, Strategy, Transaction, TransactionState, action, field_lens, mutate,
};
use serde::Serialize;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    time::Duration,
};

const PATIENCE: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn dispatcher(name: &str) -> Dispatcher {
    init_tracing();
    Dispatcher::with_config(DispatcherConfig::default().with_thread_name_prefix(name)).unwrap()
}

fn increase() -> impl reflux::Action<i64> {
    mutate("increase", |count: &mut i64| *count += 1)
}

fn decrease() -> impl reflux::Action<i64> {
    mutate("decrease", |count: &mut i64| *count -= 1)
}

#[test]
fn counter_with_throttled_decrease() {
    let dispatcher = dispatcher("counter");
    let store = Store::new(&dispatcher, "counter", 0i64);

    for _ in 0..3 {
        let tx = store.run(increase(), Strategy::Sync);
        assert_eq!(tx.state(), TransactionState::Completed);
    }
    assert_eq!(store.model(), 3);

    let throttled = RunOptions::new(Strategy::Sync).with_throttle(Duration::from_millis(500));
    let first = store.run_with(decrease(), throttled.clone());
    let second = store.run_with(decrease(), throttled);

    assert_eq!(second.wait_timeout(PATIENCE), Some(TransactionState::Completed));
    assert_eq!(first.wait_timeout(PATIENCE), Some(TransactionState::Canceled));
    assert_eq!(store.model(), 2);
    dispatcher.shutdown();
}

#[test]
fn throttled_bursts_run_only_the_latest() {
    let dispatcher = dispatcher("burst");
    let store = Store::new(&dispatcher, "log", Vec::<u32>::new());
    let canceled = Arc::new(AtomicUsize::new(0));

    let throttled = RunOptions::new(Strategy::Async(None)).with_throttle(Duration::from_millis(100));
    let transactions: Vec<Transaction> = (0..5)
        .map(|i| {
            let tx = store.run_with(
                mutate("append", move |log: &mut Vec<u32>| log.push(i)),
                throttled.clone(),
            );
            let canceled = Arc::clone(&canceled);
            tx.on_complete(move |tx| {
                if tx.state() == TransactionState::Canceled {
                    canceled.fetch_add(1, Ordering::SeqCst);
                }
            });
            tx
        })
        .collect();

    for tx in &transactions {
        assert!(tx.wait_timeout(PATIENCE).is_some());
    }
    assert_eq!(canceled.load(Ordering::SeqCst), 4);
    assert_eq!(store.model(), [4]);
    assert!(!dispatcher.throttler().is_pending(&"append".into()));
    dispatcher.shutdown();
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
struct Settings {
    theme: String,
    volume: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
struct App {
    settings: Settings,
    launches: u32,
}

#[test]
fn child_mutations_are_visible_everywhere() {
    let dispatcher = dispatcher("child");
    let root = Store::with_options(
        &dispatcher,
        "app",
        App::default(),
        StoreOptions::default().with_delivery(Delivery::Inline),
    );
    let settings = root.make_child("settings", field_lens!(App, settings));

    let diffs = Arc::new(Mutex::new(Vec::new()));
    {
        let diffs = Arc::clone(&diffs);
        root.observe_diff(move |event| diffs.lock().push(event.diff.to_string()));
    }

    let tx = settings.run(
        mutate("theme", |s: &mut Settings| s.theme = "dark".into()),
        Strategy::on_queue("settings"),
    );
    assert_eq!(tx.wait_timeout(PATIENCE), Some(TransactionState::Completed));

    assert_eq!(root.model().settings.theme, "dark");
    assert_eq!(settings.model().theme, "dark");
    assert_eq!(*diffs.lock(), [r#"~ settings/theme = "" -> "dark""#]);

    let found = dispatcher.store::<Settings>("settings").unwrap();
    assert_eq!(found.model(), settings.model());
    dispatcher.shutdown();
}

#[test]
fn cancel_all_stops_only_waiting_transactions() {
    let dispatcher = dispatcher("gated");
    let store = Store::new(&dispatcher, "gated", 0i64);
    let queue = QueueId::from("work");

    let (started_tx, started) = mpsc::channel();
    let (release, gate) = mpsc::channel::<()>();
    let gate = Mutex::new(gate);
    let blocking = action("blocking", move |ctx: Context<i64>| {
        started_tx.send(()).unwrap();
        gate.lock().recv().unwrap();
        ctx.reduce_model(|n| *n += 100).unwrap();
        ctx.fulfill();
    });

    let running = store.run(blocking, Strategy::Async(Some(queue.clone())));
    started.recv_timeout(PATIENCE).unwrap();

    let waiting: Vec<Transaction> = (0..3)
        .map(|_| store.run(increase(), Strategy::Async(Some(queue.clone()))))
        .collect();
    assert_eq!(dispatcher.pending(Some(&queue)), 3);
    assert_eq!(dispatcher.queue_ids(), [QueueId::from("default"), queue.clone()]);
    assert_eq!(dispatcher.cancel_all(Some(&queue)), 3);
    assert_eq!(dispatcher.pending(Some(&queue)), 0);
    release.send(()).unwrap();

    assert_eq!(running.wait_timeout(PATIENCE), Some(TransactionState::Completed));
    for tx in &waiting {
        assert_eq!(tx.state(), TransactionState::Canceled);
    }
    assert_eq!(store.model(), 100);
    dispatcher.shutdown();
}

#[test]
fn cooperative_cancellation_of_a_running_transaction() {
    let dispatcher = dispatcher("coop");
    let store = Store::new(&dispatcher, "coop", 0i64);
    let (started_tx, started) = mpsc::channel();

    let polling = action("polling", move |ctx: Context<i64>| {
        started_tx.send(()).unwrap();
        while !ctx.is_canceled() {
            std::thread::sleep(Duration::from_millis(1));
        }
        ctx.fulfill();
    });
    let tx = store.run(polling, Strategy::Async(None));
    started.recv_timeout(PATIENCE).unwrap();
    tx.cancel();

    assert_eq!(tx.wait_timeout(PATIENCE), Some(TransactionState::Canceled));
    assert_eq!(store.model(), 0);
    dispatcher.shutdown();
}

#[test]
fn batch_rejections_do_not_cancel_siblings() {
    let dispatcher = dispatcher("batch");
    let store = Store::new(&dispatcher, "batched", 0i64);
    let (done_tx, done) = mpsc::channel();

    let failing = action("failing", |ctx: Context<i64>| {
        ctx.reject("out of stock");
        ctx.fulfill();
    });
    let mut members = Vec::new();
    dispatcher.batch(
        |_| {
            members.push(store.run(failing, Strategy::Async(None)));
            members.push(store.run(increase(), Strategy::Async(None)));
        },
        move |batch| {
            let error = batch.last_error().map(|error| error.to_string());
            done_tx.send(error).unwrap();
        },
    );

    assert_eq!(
        done.recv_timeout(PATIENCE).unwrap().as_deref(),
        Some("out of stock")
    );
    for tx in &members {
        assert_eq!(tx.state(), TransactionState::Completed);
        assert!(tx.batch().is_some());
    }
    assert_eq!(store.model(), 1);
    dispatcher.shutdown();
}

#[test]
fn canceled_batches_skip_members_that_have_not_started() {
    let dispatcher = dispatcher("batch-cancel");
    let store = Store::new(&dispatcher, "batched", 0i64);
    let (started_tx, started) = mpsc::channel();
    let (release, gate) = mpsc::channel::<()>();
    let gate = Mutex::new(gate);

    // Occupies the default queue so the batch members have to wait.
    store.run(
        action("gate", move |ctx: Context<i64>| {
            started_tx.send(()).unwrap();
            gate.lock().recv().unwrap();
            ctx.fulfill();
        }),
        Strategy::Async(None),
    );
    started.recv_timeout(PATIENCE).unwrap();

    let (done_tx, done) = mpsc::channel();
    let mut members = Vec::new();
    let batch = dispatcher.batch(
        |_| {
            for _ in 0..2 {
                members.push(store.run(increase(), Strategy::Async(None)));
            }
        },
        move |_| done_tx.send(()).unwrap(),
    );
    batch.cancel();
    release.send(()).unwrap();

    done.recv_timeout(PATIENCE).unwrap();
    assert_eq!(batch.outstanding(), 0);
    for tx in &members {
        assert_eq!(tx.state(), TransactionState::Canceled);
    }
    assert_eq!(store.model(), 0);
    dispatcher.shutdown();
}

#[test]
fn async_completion_is_reported() {
    let dispatcher = dispatcher("async");
    let store = Store::new(&dispatcher, "async", 0i64);
    let (done_tx, done) = mpsc::channel();

    let tx = store.run(increase(), Strategy::Async(None));
    tx.on_complete(move |tx| done_tx.send(tx.state()).unwrap());

    assert_eq!(done.recv_timeout(PATIENCE).unwrap(), TransactionState::Completed);
    assert_eq!(store.model(), 1);
    dispatcher.shutdown();
}

#[test]
fn panicking_reducers_cancel_without_stalling_their_queue() {
    let dispatcher = dispatcher("panics");
    let store = Store::new(&dispatcher, "fragile", 0i64);
    let queue = QueueId::from("fragile");

    let exploding = |id: &'static str| {
        action(id, |ctx: Context<i64>| {
            ctx.reduce_model(|n| *n += 100).unwrap();
            panic!("reducer blew up");
        })
    };

    let (done_tx, done) = mpsc::channel();
    let mut members = Vec::new();
    dispatcher.batch(
        |_| members.push(store.run(exploding("async"), Strategy::Async(Some(queue.clone())))),
        move |_| done_tx.send(()).unwrap(),
    );
    done.recv_timeout(PATIENCE).unwrap();
    assert_eq!(members[0].wait_timeout(PATIENCE), Some(TransactionState::Canceled));

    let after = store.run(increase(), Strategy::Async(Some(queue)));
    assert_eq!(after.wait_timeout(PATIENCE), Some(TransactionState::Completed));

    let on_main = store.run(exploding("main"), Strategy::MainThread);
    assert_eq!(on_main.state(), TransactionState::Canceled);

    let after = store.run(increase(), Strategy::MainThread);
    assert_eq!(after.state(), TransactionState::Completed);

    // Mutations committed before each panic stay.
    assert_eq!(store.model(), 202);
    dispatcher.shutdown();
}

#[test]
fn main_thread_runs_nest_inline() {
    let dispatcher = dispatcher("main");
    let store = Store::new(&dispatcher, "main", 0i64);
    let nested_state = Arc::new(Mutex::new(None));

    let outer = {
        let nested_state = Arc::clone(&nested_state);
        action("outer", move |ctx: Context<i64>| {
            assert!(ctx.store().dispatcher().is_main_thread());
            // Would deadlock if it waited for the main context to free up.
            let nested = ctx.store().run(increase(), Strategy::MainThread);
            *nested_state.lock() = Some(nested.state());
            ctx.reduce_model(|n| *n *= 10).unwrap();
            ctx.fulfill();
        })
    };
    let tx = store.run(outer, Strategy::MainThread);

    assert_eq!(tx.state(), TransactionState::Completed);
    assert_eq!(*nested_state.lock(), Some(TransactionState::Completed));
    assert_eq!(store.model(), 10);
    assert!(!dispatcher.is_main_thread());
    dispatcher.shutdown();
}

#[test]
fn queues_run_in_submission_order() {
    let dispatcher = dispatcher("order");
    let store = Store::new(&dispatcher, "order", Vec::<u32>::new());
    let recorder = Arc::new(RecordingMiddleware::new());
    {
        let recorder = Arc::clone(&recorder);
        store.register_middleware(move |tx: &Transaction, state: TransactionState| {
            if state.is_terminal() {
                reflux::Middleware::on_transaction_state_change(&*recorder, tx, state);
            }
        });
    }

    let last = (0..20)
        .map(|i| {
            store.run(
                mutate(format!("push-{i}"), move |log: &mut Vec<u32>| log.push(i)),
                Strategy::on_queue("ordered"),
            )
        })
        .last()
        .unwrap();
    last.wait_timeout(PATIENCE).unwrap();

    assert_eq!(store.model(), (0..20).collect::<Vec<_>>());
    let seen = recorder.seen();
    assert_eq!(seen.len(), 20);
    assert_eq!(seen[0], "push-0: Completed");
    assert_eq!(seen[19], "push-19: Completed");
    dispatcher.shutdown();
}
