#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use serde_json::{Map, json};
use signalbox::{Observer, ObserverHandle, SignalOptions, SignalRegistry, StoreConfig, TaskQueue};

const PATHS: [&str; 5] = ["a", "b", "a.x", "b.y", "c"];

#[derive(Debug, Arbitrary)]
enum Op {
    ReadPath { observer: u8, path: u8 },
    ReadWhole { observer: u8 },
    SetPath { observer: u8, path: u8, value: i32 },
    Merge { key: u8, value: i32 },
    Detach { observer: u8 },
    Flush,
}

fuzz_target!(|ops: Vec<Op>| {
    let queue = TaskQueue::new();
    let registry = SignalRegistry::new(StoreConfig::default(), queue.clone());
    let signal = registry.create(
        "fuzz",
        json!({ "a": { "x": 0 }, "b": { "y": 0 }, "c": 0 }),
        SignalOptions::new().auto_destroy(false),
    );
    let observers: Vec<Observer> = (0..4).map(|_| Observer::new()).collect();
    let pick = |i: u8| &observers[usize::from(i) % observers.len()];
    let path = |i: u8| PATHS[usize::from(i) % PATHS.len()];

    for op in ops {
        match op {
            Op::ReadPath { observer, path: p } => {
                let _ = signal.read_path(pick(observer), path(p));
            }
            Op::ReadWhole { observer } => {
                let _ = signal.read(pick(observer));
            }
            Op::SetPath { observer, path: p, value } => {
                let read = signal.read_path(pick(observer), path(p));
                let _ = read.setter.set(json!(value));
            }
            Op::Merge { key, value } => {
                let mut patch = Map::new();
                patch.insert(path(key).to_owned(), json!(value));
                let _ = signal.set_whole(patch);
            }
            Op::Detach { observer } => {
                let observer = pick(observer);
                observer.detach();
                assert!(!signal.is_subscribed(observer.id()));
            }
            Op::Flush => {
                queue.run_until_idle();
            }
        }
    }

    queue.run_until_idle();
    assert!(!signal.has_pending_shallow());
    assert!(!signal.has_pending_deep());
    for observer in &observers {
        observer.detach();
    }
    assert_eq!(signal.subscriber_count(), 0);
    assert!(!signal.is_destroyed());
});
