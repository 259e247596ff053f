//! `pixel-buffer-cache` 为图像处理流水线提供线程内的像素缓冲缓存与复用池。
//!
//! # 模块定位（Why）
//! - 流水线各阶段会针对同一幅图像反复申请矩形像素区域，频繁的分配/释放会让分配器抖动；
//! - 同一线程上的独立阶段经常需要同一块已计算好的像素，复用已发布的缓冲可以避免重复计算。
//!
//! # 设计概要（How）
//! - [`BufferCache`] 是每个工作线程独占的上下文：持有“图像 → [`BufferCacheList`]”映射与有界的空闲缓冲储备；
//! - [`BufferRef`] 是调用方持有的句柄，每个句柄恰好占用一份引用计数，`Drop` 时归还；
//! - 引用计数归零的路径集中在缓存内部的单一例程中：先撤销发布，再放回储备或交还分配器；
//! - [`api`] 模块提供基于线程局部存储的便捷入口，线程退出时自动销毁该线程的缓存。
//!
//! # 契约说明（What）
//! - 所有缓冲与缓存均为 `!Send`，线程隔离由类型系统保证，无需加锁；
//! - 唯一的可恢复失败是 [`AllocationError`]；违反调用契约（重复发布、共享时调整尺寸等）直接断言失败。
//!
//! # 命名约定（Consistency）
//! - “发布（publish）/撤销发布（unpublish）”对应缓冲对同线程其它消费者是否可见；
//! - “储备（reserve）”指空闲缓冲组成的 LIFO 栈。

pub mod allocator;
pub mod api;
mod buffer;
mod cache;
mod cache_list;
pub mod config;
pub mod error;
mod image;
mod rect;
mod reserve;

pub use allocator::{AllocatorStats, HeapAllocator, TrackedAllocator};
pub use buffer::BufferRef;
pub use cache::{BufferCache, CacheId, CacheListSnapshot, CacheStats};
pub use config::{BufferCacheConfig, ConfigError, DEFAULT_RESERVE_CAP};
pub use error::{AllocationError, Result};
pub use image::{Image, ImageDescriptor, ImageKey};
pub use rect::Rect;
