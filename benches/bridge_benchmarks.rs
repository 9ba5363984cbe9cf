//! Host bridge performance benchmarks

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, Criterion};
use rbox::error::Result;
use rbox::subscription::Transport;
use rbox::tunnel::{Engine, EngineHandle, EventSink};
use rbox::{Bridge, Config, OutboundConfig};
use std::hint::black_box;
use std::sync::Arc;
use url::Url;

struct InstantEngine;

struct InstantHandle;

impl EngineHandle for InstantHandle {
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Engine for InstantEngine {
    fn launch(&self, _config: &OutboundConfig, events: EventSink) -> Result<Box<dyn EngineHandle>> {
        events.ready();
        Ok(Box::new(InstantHandle))
    }
}

struct StaticTransport;

#[async_trait]
impl Transport for StaticTransport {
    async fn get(&self, _url: &Url) -> Result<Vec<u8>> {
        Ok(b"ss://aes-256-gcm:pw@1.2.3.4:8388#a\ntrojan://pw@tj.example.com:443#b\n".to_vec())
    }
}

fn bridge() -> Bridge {
    Bridge::with_parts(
        Config::default(),
        Arc::new(InstantEngine),
        Arc::new(StaticTransport),
    )
    .unwrap()
}

fn bridge_create_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("bridge_create");
    let bridge = bridge();

    group.bench_function("create_shadowsocks_config", |b| {
        b.iter(|| {
            let response = bridge.create_shadowsocks_config(
                black_box("1.2.3.4"),
                black_box("8388"),
                "aes-256-gcm",
                "pw",
                "node1",
            );
            black_box(response.to_json())
        });
    });

    group.bench_function("create_trojan_config_error", |b| {
        b.iter(|| {
            let response = bridge.create_trojan_config(
                "tj.example.com",
                black_box("99999"),
                "pw",
                "",
                "",
                "",
                "",
                "tj",
            );
            black_box(response.to_json())
        });
    });

    group.finish();
}

fn bridge_lifecycle_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("bridge_lifecycle");
    let bridge = bridge();
    let config_json = bridge
        .create_shadowsocks_config("1.2.3.4", "8388", "aes-256-gcm", "pw", "node1")
        .data
        .unwrap()
        .to_string();

    group.bench_function("start_stop", |b| {
        b.iter(|| {
            black_box(bridge.start_vpn(black_box(&config_json)));
            black_box(bridge.stop_vpn());
        });
    });

    group.bench_function("vpn_status", |b| {
        b.iter(|| black_box(bridge.vpn_status()));
    });

    group.bench_function("fetch_subscription", |b| {
        b.iter(|| black_box(bridge.fetch_subscription("https://sub.example.com/list")));
    });

    group.bench_function("version", |b| {
        b.iter(|| black_box(bridge.version()));
    });

    group.finish();
}

criterion_group!(benches, bridge_create_benchmark, bridge_lifecycle_benchmark);
criterion_main!(benches);
