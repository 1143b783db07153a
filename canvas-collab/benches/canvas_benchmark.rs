use criterion::{criterion_group, criterion_main, Criterion};
use canvas_collab::canvas::Canvas;
use canvas_collab::cooldown::CooldownLimiter;
use canvas_collab::grid::{ColorValue, Grid, Palette};
use canvas_collab::protocol::{ClientMessage, ServerMessage, WireColor};
use canvas_collab::session::UserIdentity;
use canvas_collab::storage::{CanvasStore, StoreConfig, StoredPixel};
use std::hint::black_box;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn bench_grid_apply_write(c: &mut Criterion) {
    let mut grid = Grid::new(1000, 1000, Palette::default()).unwrap();
    let mut i = 0i64;

    c.bench_function("grid_apply_write_1000x1000", |b| {
        b.iter(|| {
            i = (i + 7919) % 1_000_000;
            black_box(grid.apply_write(black_box(i % 1000), black_box(i / 1000), ColorValue::Color(3)).unwrap());
        })
    });
}

fn bench_grid_snapshot(c: &mut Criterion) {
    let grid = Grid::new(1000, 1000, Palette::default()).unwrap();

    c.bench_function("grid_snapshot_1000x1000", |b| {
        b.iter(|| black_box(grid.snapshot()))
    });
}

fn bench_set_pixel_decode(c: &mut Criterion) {
    let text = r##"{"type":"set_pixel","x":512,"y":384,"color":"#ff0000"}"##;

    c.bench_function("set_pixel_decode", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(text)).unwrap()))
    });
}

fn bench_pixel_encode(c: &mut Criterion) {
    let msg = ServerMessage::Pixel { x: 512, y: 384, color: 5 };

    c.bench_function("pixel_encode", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_init_encode(c: &mut Criterion) {
    let grid = Grid::new(1000, 1000, Palette::default()).unwrap();
    let snapshot = grid.snapshot();

    c.bench_function("init_encode_1000x1000", |b| {
        b.iter(|| black_box(ServerMessage::init(black_box(&snapshot), grid.palette()).encode().unwrap()))
    });
}

fn bench_cooldown_admit(c: &mut Criterion) {
    let identities: Vec<UserIdentity> = (0..10_000).map(|i| UserIdentity::new(format!("user{i}"))).collect();
    let mut limiter = CooldownLimiter::new(Duration::from_secs(5));
    let mut i = 0usize;

    c.bench_function("cooldown_try_admit_10k_identities", |b| {
        b.iter(|| {
            i = (i + 1) % identities.len();
            black_box(limiter.try_admit(&identities[i], Instant::now()));
        })
    });
}

fn bench_submit_100_sessions(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("submit_1000_writes_100_sessions", |b| {
        b.iter(|| {
            rt.block_on(async {
                let grid = Grid::new(100, 100, Palette::default()).unwrap();
                let canvas = Canvas::new(grid, Duration::ZERO, 2048, true);

                let mut attached = Vec::new();
                for i in 0..100 {
                    attached.push(canvas.attach(UserIdentity::new(format!("peer{i}")), None).await);
                }

                let writer = &attached[0].session;
                let color = WireColor::Code(4);
                for i in 0..1000i64 {
                    black_box(canvas.submit(writer, i % 100, i / 100, &color, Instant::now()).await);
                }
            });
        })
    });
}

fn bench_store_append_pixel(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("canvas_bench_append_{}", Uuid::new_v4()));
    let store = CanvasStore::open(StoreConfig::for_testing(&dir)).unwrap();
    store.ensure_dimensions(1000, 1000).unwrap();

    c.bench_function("store_append_pixel", |b| {
        b.iter(|| {
            black_box(store.append_pixel(black_box(StoredPixel { x: 1, y: 2, color: 3 })).unwrap());
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_store_save_snapshot(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("canvas_bench_snapshot_{}", Uuid::new_v4()));
    let store = CanvasStore::open(StoreConfig::for_testing(&dir)).unwrap();
    store.ensure_dimensions(1000, 1000).unwrap();
    let cells: Vec<u8> = (0..1_000_000u32).map(|i| (i % 19) as u8).collect();

    c.bench_function("store_save_snapshot_1000x1000", |b| {
        b.iter(|| {
            black_box(store.save_snapshot(black_box(&cells), 0).unwrap());
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_grid_apply_write,
    bench_grid_snapshot,
    bench_set_pixel_decode,
    bench_pixel_encode,
    bench_init_encode,
    bench_cooldown_admit,
    bench_submit_100_sessions,
    bench_store_append_pixel,
    bench_store_save_snapshot,
);
criterion_main!(benches);
