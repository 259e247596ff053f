use criterion::{Criterion, black_box};
use pixel_buffer_cache::{BufferCache, BufferCacheConfig, HeapAllocator, ImageDescriptor, Rect};
use std::{env, sync::Arc, time::Duration};

/// 基准：对比缓存命中、储备复用与就地交换三条路径的开销。
///
/// # 设计背景（Why）
/// - 缓存存在的意义是让热路径避开分配器，基准用来确认三条复用路径都不触发分配；
/// - `--quick` 模式缩短采样，便于在 CI 中做冒烟检查。
fn bench_acquire_release(c: &mut Criterion) {
    let cache = BufferCache::new(BufferCacheConfig::default(), Arc::new(HeapAllocator::new()));
    let image = ImageDescriptor::new(4);

    let tile = cache
        .acquire_ref(&image, Rect::new(0, 0, 128, 128))
        .expect("分配失败");
    cache.publish(&tile);
    c.bench_function("acquire_ref_hit", |b| {
        b.iter(|| {
            let hit = cache
                .acquire_ref(&image, black_box(Rect::new(16, 16, 32, 32)))
                .expect("命中失败");
            black_box(hit.ref_count())
        });
    });

    c.bench_function("acquire_release_reserve", |b| {
        b.iter(|| {
            let fresh = cache
                .acquire(&image, black_box(Rect::new(0, 0, 64, 64)))
                .expect("分配失败");
            black_box(fresh.capacity())
        });
    });

    c.bench_function("swap_ref_scanline", |b| {
        let mut current = Some(
            cache
                .acquire(&image, Rect::new(0, 0, 256, 1))
                .expect("分配失败"),
        );
        let mut row = 0;
        b.iter(|| {
            row = (row + 1) % 1024;
            let next = cache
                .swap_ref(current.take(), &image, Rect::new(0, row, 256, 1))
                .expect("交换失败");
            current = Some(next);
        });
    });
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_acquire_release(&mut criterion);
    criterion.final_summary();
}
