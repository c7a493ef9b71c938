use criterion::{Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;
use tether_core::checkpoint::Arguments;
use tether_core::pattern::Pattern;
use tether_core::permission::{PermissionConfig, PermissionEngine, Rule};

fn args(value: serde_json::Value) -> Arguments {
    value.as_object().cloned().unwrap_or_default()
}

fn engine_with_rules(n: usize) -> PermissionEngine {
    let config = PermissionConfig {
        default_secure: true,
        allow: (0..n).map(|i| format!("tool_{i}(path=/srv/{i}/*, *)")).collect(),
        deny: vec![
            "delete_record(table=users, *)".into(),
            "shell(cmd=rm *)".into(),
        ],
    };
    let learned = (0..n)
        .map(|i| Rule::learned_allow("write_file", &args(json!({"path": format!("/tmp/{i}")}))))
        .collect();
    PermissionEngine::new(&config, learned)
}

fn bench_decide(c: &mut Criterion) {
    let engine = engine_with_rules(100);
    let hit = args(json!({"path": "/srv/99/data.csv", "mode": "r"}));
    let miss = args(json!({"path": "/home/user/data.csv"}));
    let denied = args(json!({"table": "users", "id": 42}));

    c.bench_function("decide_allow_last_rule", |b| {
        b.iter(|| engine.decide(black_box("tool_99"), black_box(&hit)))
    });
    c.bench_function("decide_default_secure", |b| {
        b.iter(|| engine.decide(black_box("write_file"), black_box(&miss)))
    });
    c.bench_function("decide_deny", |b| {
        b.iter(|| engine.decide(black_box("delete_record"), black_box(&denied)))
    });
}

fn bench_parse(c: &mut Criterion) {
    c.bench_function("pattern_parse", |b| {
        b.iter(|| {
            black_box(r#"write_file(path="/tmp/a, b", mode=w*, *)"#)
                .parse::<Pattern>()
                .unwrap()
        })
    });
}

fn bench_reload(c: &mut Criterion) {
    let engine = engine_with_rules(10);
    let config = PermissionConfig {
        default_secure: true,
        allow: vec!["read_file".into(), "search(*)".into()],
        deny: vec![],
    };
    c.bench_function("reload_swap", |b| b.iter(|| engine.reload(black_box(&config)).unwrap()));
}

criterion_group!(benches, bench_decide, bench_parse, bench_reload);
criterion_main!(benches);
