//! Field merge benchmarks.
//!
//! Measures `plan_merge` on a session-sized document and on a large
//! machine-storage document where only a handful of keys are selected.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench field_merge
//! ```

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::{Map, Value, json};

use hotswap::merge::{FieldOverride, OverrideValue, plan_merge};
use hotswap::registry::FieldPath;

const NOW: f64 = 1_735_732_800.0;

fn paths(raw: &[&str]) -> Vec<FieldPath> {
    raw.iter().map(|p| p.parse().expect("field path")).collect()
}

fn session_pair() -> (Vec<u8>, Vec<u8>) {
    let live = json!({
        "sid": "live-sid", "did": "live-did", "init": false,
        "started": 1.0, "timestamp": 2.0, "status": "exited",
        "errors": 0, "duration": 12.5,
        "attrs": {"release": "0.45.0", "environment": "production"}
    });
    let snapshot = json!({
        "sid": "snap-sid", "did": "snap-did", "init": true,
        "started": 3.0, "timestamp": 4.0, "status": "ok",
        "errors": 0, "duration": 0.0,
        "attrs": {"release": "0.44.0", "environment": "production"}
    });
    (
        serde_json::to_vec_pretty(&live).expect("encode"),
        serde_json::to_vec_pretty(&snapshot).expect("encode"),
    )
}

/// A flat storage document with `n` entries plus a few dotted identity keys.
fn storage_pair(n: usize) -> (Vec<u8>, Vec<u8>) {
    let build = |tag: &str| {
        let mut map = Map::new();
        for i in 0..n {
            map.insert(format!("workbench.view.{i}"), json!({"visible": i % 2 == 0, "size": i}));
        }
        map.insert("telemetry.machineId".into(), json!(format!("{tag}-machine")));
        map.insert("telemetry.devDeviceId".into(), json!(format!("{tag}-device")));
        map.insert("storage.serviceMachineId".into(), json!(format!("{tag}-service")));
        map.insert("lastActiveTime".into(), json!(0));
        serde_json::to_vec(&Value::Object(map)).expect("encode")
    };
    (build("live"), build("snap"))
}

fn bench_session(c: &mut Criterion) {
    let (live, snapshot) = session_pair();
    let fields = paths(&["sid", "did", "init", "started", "timestamp", "status"]);
    let overrides = [
        FieldOverride::new("timestamp", OverrideValue::Now).expect("override"),
        FieldOverride::new("status", OverrideValue::Literal(json!("ok"))).expect("override"),
    ];

    c.bench_function("plan_merge/session", |b| {
        b.iter(|| {
            plan_merge(
                black_box(&live),
                black_box(&snapshot),
                &fields,
                &overrides,
                NOW,
            )
            .expect("plan")
        });
    });
}

fn bench_storage(c: &mut Criterion) {
    let fields = paths(&[
        "telemetry.machineId",
        "telemetry.devDeviceId",
        "storage.serviceMachineId",
    ]);
    let overrides = [FieldOverride::new("lastActiveTime", OverrideValue::Now).expect("override")];

    let mut group = c.benchmark_group("plan_merge/storage");
    for n in [100usize, 1_000, 10_000] {
        let (live, snapshot) = storage_pair(n);
        group.throughput(Throughput::Bytes(live.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                plan_merge(
                    black_box(&live),
                    black_box(&snapshot),
                    &fields,
                    &overrides,
                    NOW,
                )
                .expect("plan")
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_session, bench_storage);
criterion_main!(benches);
