//! 基于线程局部缓存的便捷入口。
//!
//! 流水线阶段通常不显式传递缓存上下文：获取新缓冲的函数路由到 [`BufferCache::current`]，
//! 每个线程首次调用时惰性创建自己的缓存，线程退出时自动销毁。
//! 作用于已有句柄的函数则路由到句柄所属的缓存，因此在切换当前缓存或线程局部存储
//! 析构期间依然可用。需要显式上下文的工作者可以直接使用 [`BufferCache`] 的同名方法。

use tracing::trace;

use crate::{
    buffer::BufferRef,
    cache::BufferCache,
    error::Result,
    image::Image,
    rect::Rect,
};

/// 见 [`BufferCache::acquire_ref`]。
pub fn acquire_ref<I: Image + ?Sized>(image: &I, area: Rect) -> Result<BufferRef> {
    BufferCache::current().acquire_ref(image, area)
}

/// 见 [`BufferCache::publish`]；所属缓存已销毁时不做任何事。
pub fn publish(buffer: &BufferRef) {
    match buffer.owning_cache() {
        Some(cache) => cache.publish(buffer),
        None => trace!(image = ?buffer.image_key(), "publish on orphaned buffer ignored"),
    }
}

/// 见 [`BufferCache::unpublish`]；所属缓存已销毁时不做任何事。
pub fn unpublish(buffer: &BufferRef) {
    match buffer.owning_cache() {
        Some(cache) => cache.unpublish(buffer),
        None => trace!(image = ?buffer.image_key(), "unpublish on orphaned buffer ignored"),
    }
}

/// 见 [`BufferCache::release`]。
pub fn release(buffer: BufferRef) {
    drop(buffer);
}

/// 见 [`BufferCache::swap_ref`]。
///
/// 旧句柄的缓存仍存活时在该缓存内交换，否则退回当前线程的缓存。
pub fn swap_ref<I: Image + ?Sized>(
    old: Option<BufferRef>,
    image: &I,
    area: Rect,
) -> Result<BufferRef> {
    let cache = old.as_ref().and_then(BufferRef::owning_cache);
    match cache {
        Some(cache) => cache.swap_ref(old, image, area),
        None => {
            drop(old);
            BufferCache::current().swap_ref(None, image, area)
        }
    }
}
