//! `swap_contract` 集成测试：验证 `swap_ref` 四个分支的先后顺序与复用语义。
//!
//! # 测试目标（Why）
//! - `swap_ref` 是计算在同一图像上移动区域时的热路径，分支顺序决定了是否发生不必要的分配；
//! - 就地调整尺寸必须保持缓冲身份不变，只在容量不足时重新分配存储。
//!
//! # 结构安排（How）
//! - 快路径、命中他人、就地调整、回退获取各一个测试，外加分配失败时的释放语义。

use std::sync::Arc;

use pixel_buffer_cache::{
    AllocationError, BufferCache, BufferCacheConfig, HeapAllocator, Image, ImageDescriptor,
    Rect,
};

fn cache_with(allocator: HeapAllocator) -> (BufferCache, Arc<HeapAllocator>) {
    let allocator = Arc::new(allocator);
    let cache = BufferCache::new(BufferCacheConfig::default(), allocator.clone());
    (cache, allocator)
}

/// 旧缓冲已包围目标区域时原样返回：同一身份、同一引用计数。
#[test]
fn enclosing_old_buffer_is_returned_unchanged() {
    let (cache, allocator) = cache_with(HeapAllocator::new());
    let image = ImageDescriptor::new(1);
    let old = cache.acquire_ref(&image, Rect::new(0, 0, 10, 10)).expect("分配失败");
    cache.publish(&old);
    let witness = old.clone();

    let swapped = cache
        .swap_ref(Some(old), &image, Rect::new(1, 1, 3, 3))
        .expect("交换失败");
    assert!(swapped.ptr_eq(&witness));
    assert_eq!(swapped.ref_count(), 2);
    assert_eq!(swapped.area(), Rect::new(0, 0, 10, 10));
    assert!(swapped.is_done());
    assert_eq!(allocator.stats().allocations, 1);
}

/// 其它已发布缓冲包围目标区域时，释放旧缓冲并返回命中者。
#[test]
fn published_neighbour_is_preferred_over_resize() {
    let (cache, _allocator) = cache_with(HeapAllocator::new());
    let image = ImageDescriptor::new(1);
    let neighbour = cache.acquire_ref(&image, Rect::new(10, 0, 10, 10)).expect("分配失败");
    cache.publish(&neighbour);

    let old = cache.acquire_ref(&image, Rect::new(0, 0, 10, 10)).expect("分配失败");
    let swapped = cache
        .swap_ref(Some(old), &image, Rect::new(12, 2, 4, 4))
        .expect("交换失败");

    assert!(swapped.ptr_eq(&neighbour));
    assert_eq!(neighbour.ref_count(), 2);
    assert_eq!(cache.reserve_len(), 1, "旧缓冲归零后进入储备");
}

/// 独占的旧缓冲就地增长：身份不变，存储按更大容量重新分配。
#[test]
fn unshared_buffer_grows_in_place() {
    let (cache, allocator) = cache_with(HeapAllocator::new());
    let image = ImageDescriptor::new(4);
    let old = cache.acquire_ref(&image, Rect::new(0, 0, 5, 5)).expect("分配失败");
    cache.publish(&old);
    assert_eq!(old.capacity(), 100);
    let records_before = cache.stats().fresh_records;

    let swapped = cache
        .swap_ref(Some(old), &image, Rect::new(0, 0, 8, 8))
        .expect("交换失败");

    assert_eq!(swapped.ref_count(), 1);
    assert_eq!(swapped.area(), Rect::new(0, 0, 8, 8));
    assert_eq!(swapped.capacity(), 256);
    assert!(!swapped.is_done(), "调整尺寸前已撤销发布");
    assert!(cache.lookup_list(image.key()).expect("列表存在").is_empty());

    let stats = cache.stats();
    assert_eq!(stats.fresh_records, records_before, "没有新建缓冲记录");
    assert_eq!(stats.in_place_resizes, 1);
    assert_eq!(allocator.stats().frees, 1);
    assert_eq!(allocator.stats().allocations, 2);
}

/// 缩小时复用原存储，不触发分配。
#[test]
fn shrinking_in_place_keeps_storage() {
    let (cache, allocator) = cache_with(HeapAllocator::new());
    let image = ImageDescriptor::new(1);
    let old = cache.acquire_ref(&image, Rect::new(0, 0, 8, 8)).expect("分配失败");

    let swapped = cache
        .swap_ref(Some(old), &image, Rect::new(20, 20, 4, 4))
        .expect("交换失败");
    assert_eq!(swapped.capacity(), 64);
    assert_eq!(allocator.stats().allocations, 1);
}

/// 旧缓冲被共享时不能就地调整，只能释放一份引用并获取新缓冲。
#[test]
fn shared_old_buffer_falls_back_to_acquire() {
    let (cache, _allocator) = cache_with(HeapAllocator::new());
    let image = ImageDescriptor::new(1);
    let old = cache.acquire_ref(&image, Rect::new(0, 0, 4, 4)).expect("分配失败");
    let other_holder = old.clone();

    let swapped = cache
        .swap_ref(Some(old), &image, Rect::new(0, 0, 16, 16))
        .expect("交换失败");
    assert!(!swapped.ptr_eq(&other_holder));
    assert_eq!(other_holder.ref_count(), 1);
    assert_eq!(other_holder.area(), Rect::new(0, 0, 4, 4));
}

/// 没有旧缓冲时等价于 `acquire_ref`。
#[test]
fn none_old_buffer_behaves_like_acquire_ref() {
    let (cache, _allocator) = cache_with(HeapAllocator::new());
    let image = ImageDescriptor::new(1);
    let published = cache.acquire_ref(&image, Rect::new(0, 0, 8, 8)).expect("分配失败");
    cache.publish(&published);

    let hit = cache
        .swap_ref(None, &image, Rect::new(0, 0, 2, 2))
        .expect("交换失败");
    assert!(hit.ptr_eq(&published));

    let fresh = cache
        .swap_ref(None, &image, Rect::new(100, 100, 2, 2))
        .expect("交换失败");
    assert!(!fresh.ptr_eq(&published));
    assert_eq!(fresh.ref_count(), 1);
}

/// 就地调整时分配失败：旧缓冲被释放，错误透传。
#[test]
fn failed_in_place_resize_releases_old_buffer() {
    let (cache, allocator) = cache_with(HeapAllocator::with_limit(64));
    let image = ImageDescriptor::new(1);
    let old = cache.acquire_ref(&image, Rect::new(0, 0, 4, 4)).expect("分配失败");

    let err = cache
        .swap_ref(Some(old), &image, Rect::new(0, 0, 16, 16))
        .expect_err("超出配额应失败");
    assert!(matches!(err, AllocationError::LimitExceeded { requested: 256, .. }));
    assert_eq!(cache.reserve_len(), 1, "失败的缓冲以空闲状态回到储备");
    assert_eq!(allocator.stats().live_bytes, 0);

    let recovered = cache.acquire(&image, Rect::new(0, 0, 4, 4)).expect("配额内分配");
    assert_eq!(recovered.capacity(), 16);
}
