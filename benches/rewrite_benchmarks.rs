//! Benchmark suite for flowgate's query rewrite pipeline.
//!
//! Benchmarks cover:
//! - identifier quoting for the reserved `user` table
//! - INSERT OR IGNORE conflict-clause translation
//! - placeholder renumbering (`?` → `$N`)
//! - the full rewrite for both dialects
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flowgate::db::{rewrite, Dialect};

// ---------------------------------------------------------------------------
// Query inputs organized by rewrite work involved
// ---------------------------------------------------------------------------

const NO_REWRITE_NEEDED: &str =
    "SELECT id, name, status FROM tunnel WHERE status = 1 ORDER BY id ASC";

const USER_TABLE_SELECT: &str = "SELECT id, user, role_id, exp_time, flow, in_flow, out_flow, \
    flow_reset_time, status FROM user WHERE id = ?";

const INSERT_OR_IGNORE: &str = "INSERT OR IGNORE INTO user_group_user(user_group_id, user_id, \
    created_time) VALUES(?, ?, ?)";

const MANY_PLACEHOLDERS: &str = "INSERT INTO node(name, secret, server_ip, port, http, tls, \
    socks, created_time, updated_time, status, tcp_listen_addr, udp_listen_addr, inx, \
    is_remote, remote_url, remote_token, remote_config) \
    VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const LITERAL_HEAVY: &str = "UPDATE forward SET remote_addr = 'user@10.0.0.1:9000', \
    strategy = 'it''s fifo?', updated_time = ? WHERE user_id = ? AND name = 'user'";

fn bench_single_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("rewrite");

    let cases = [
        ("identity", NO_REWRITE_NEEDED),
        ("user_table", USER_TABLE_SELECT),
        ("insert_or_ignore", INSERT_OR_IGNORE),
        ("many_placeholders", MANY_PLACEHOLDERS),
        ("literal_heavy", LITERAL_HEAVY),
    ];

    for (name, query) in cases {
        group.bench_with_input(BenchmarkId::new("postgres", name), query, |b, q| {
            b.iter(|| rewrite(Dialect::Postgres, black_box(q)));
        });
    }

    // Sqlite is the canonical dialect, so this measures the no-copy path.
    group.bench_function("sqlite_identity", |b| {
        b.iter(|| rewrite(Dialect::Sqlite, black_box(USER_TABLE_SELECT)));
    });

    group.finish();
}

fn bench_long_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("rewrite_long");

    // A long statement with sparse rewrite targets, as produced by report
    // queries that join many tables.
    let long = format!(
        "{} UNION ALL {} UNION ALL {}",
        USER_TABLE_SELECT, NO_REWRITE_NEEDED, LITERAL_HEAVY
    );
    group.bench_function("three_way_union", |b| {
        b.iter(|| rewrite(Dialect::Postgres, black_box(&long)));
    });

    let wide = MANY_PLACEHOLDERS.repeat(4);
    group.bench_function("68_placeholders", |b| {
        b.iter(|| rewrite(Dialect::Postgres, black_box(&wide)));
    });

    group.finish();
}

criterion_group!(benches, bench_single_queries, bench_long_queries);
criterion_main!(benches);
