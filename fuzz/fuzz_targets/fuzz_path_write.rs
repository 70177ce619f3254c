#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use serde_json::{Value, json};
use signalbox_path::{Path, get, read, write};

#[derive(Debug, Arbitrary)]
struct Input {
    raw_path: String,
    value: i64,
    seed: u8,
}

fn seed_state(seed: u8) -> Value {
    match seed % 4 {
        0 => json!({}),
        1 => json!({ "a": { "b": [1, 2, { "c": null }] } }),
        2 => json!({ "list": [], "n": 3, "s": "text" }),
        _ => json!([{ "x": 1 }, 2]),
    }
}

fuzz_target!(|input: Input| {
    let mut state = seed_state(input.seed);
    let Ok(path) = Path::parse(&input.raw_path) else {
        assert!(input.raw_path.is_empty());
        return;
    };
    assert_eq!(path.as_str(), input.raw_path);

    // Reads never panic and agree with each other.
    let fallback = Value::Null;
    let found = get(&state, &path).cloned();
    assert_eq!(read(&state, Some(&path), &fallback), found.as_ref().unwrap_or(&fallback));

    let before = state.clone();
    match write(&mut state, &path, json!(input.value)) {
        Ok(_) => assert_eq!(get(&state, &path), Some(&json!(input.value))),
        Err(_) => assert_eq!(state, before),
    }
});
