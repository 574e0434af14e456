//! End-to-end pipelining benchmarks against an in-process RESP server.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use respconn_client::{Client, Command, ConnectionConfig, RespValue};
use respconn_protocol::{encode_value, Decoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

/// Answers every command with `+OK`.
async fn serve_ok(listener: TcpListener) {
    while let Ok((mut socket, _)) = listener.accept().await {
        tokio::spawn(async move {
            let mut decoder = Decoder::new();
            let mut buf = vec![0u8; 64 * 1024];
            let ok = RespValue::simple("OK");
            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                let mut out = BytesMut::new();
                while let Ok(Some(_)) = decoder.decode_command() {
                    encode_value(&ok, &mut out);
                }
                if socket.write_all(&out).await.is_err() {
                    return;
                }
            }
        });
    }
}

fn setup_client(rt: &Runtime) -> Client {
    rt.block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_ok(listener));

        let client = Client::open(ConnectionConfig::new(addr.to_string())).unwrap();
        client.wait_connected().await.unwrap();
        client
    })
}

fn bench_single_request(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = setup_client(&rt);

    let mut group = c.benchmark_group("e2e_request");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ping", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(client.ping().await.unwrap()) });
    });

    group.finish();
}

fn bench_pipeline_depth(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = setup_client(&rt);

    let mut group = c.benchmark_group("e2e_pipeline");

    for depth in [10, 100, 1000] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.to_async(&rt).iter(|| async {
                let commands = (0..depth).map(|i| Command::new("SET").arg("k").arg(i.to_string()));
                let replies = client.pipeline(commands);
                for reply in replies {
                    black_box(reply.await.unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_concurrent_senders(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = std::sync::Arc::new(setup_client(&rt));

    let mut group = c.benchmark_group("e2e_concurrent");
    let senders = 16;
    group.throughput(Throughput::Elements(senders));

    group.bench_function("set", |b| {
        b.to_async(&rt).iter(|| {
            let client = client.clone();
            async move {
                let handles: Vec<_> = (0..senders)
                    .map(|i| {
                        let client = client.clone();
                        tokio::spawn(async move { client.set(format!("k{}", i), "v").await })
                    })
                    .collect();
                for handle in handles {
                    handle.await.unwrap().unwrap();
                }
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_single_request,
    bench_pipeline_depth,
    bench_concurrent_senders,
);

criterion_main!(benches);
