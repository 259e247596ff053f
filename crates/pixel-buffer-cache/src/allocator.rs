//! 跟踪分配器：像素存储的唯一来源与归宿。
//!
//! # 模块定位（Why）
//! - 缓存本身不决定内存从哪里来，只通过 [`TrackedAllocator`] 申请与归还字节块，
//!   便于上层内存追踪器集中统计；
//! - [`HeapAllocator`] 是默认实现，附带原子计数与可选配额，测试也借助它观察 `free` 调用。
//!
//! # 契约说明（What）
//! - 分配器在多个线程之间共享，实现必须线程安全（`Send + Sync + 'static`）；
//! - `allocate(size)` 返回长度恰为 `size` 的块；`free` 接收此前由同一分配器交出的块。

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::{Bytes, BytesMut};
use spin::Once;

use crate::{config::ConfigError, error::AllocationError};

/// 像素存储的分配/释放入口。
pub trait TrackedAllocator: Send + Sync + 'static {
    /// 申请 `size` 字节的存储。
    fn allocate(&self, size: usize) -> Result<BytesMut, AllocationError>;

    /// 归还存储。
    fn free(&self, block: BytesMut);
}

/// 基于全局堆的默认分配器。
///
/// # 核心机制（How）
/// - 先以 `Vec::try_reserve_exact` 向堆申请，堆拒绝时返回 [`AllocationError::OutOfMemory`] 而不是终止进程；
///   申请成功后零初始化并零拷贝转换为 `BytesMut`；
/// - 原子计数跟踪分配/释放次数与存活字节，`stats` 提供快照；
/// - `with_limit` 设置存活字节上限，超限时返回 [`AllocationError::LimitExceeded`] 而不是触碰系统内存。
#[derive(Debug, Default)]
pub struct HeapAllocator {
    limit: Option<usize>,
    metrics: AllocatorMetrics,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建带存活字节上限的分配器。
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            metrics: AllocatorMetrics::default(),
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            allocations: self.metrics.allocations.load(Ordering::Relaxed),
            frees: self.metrics.frees.load(Ordering::Relaxed),
            failed_allocations: self.metrics.failed_allocations.load(Ordering::Relaxed),
            live_bytes: self.metrics.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.metrics.peak_bytes.load(Ordering::Relaxed),
        }
    }

    /// 原子地预占 `size` 字节配额，成功时返回预占后的存活量。
    fn reserve_quota(&self, size: usize) -> Result<usize, AllocationError> {
        let limit = self.limit.unwrap_or(usize::MAX);
        self.metrics
            .live_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |live| {
                live.checked_add(size).filter(|next| *next <= limit)
            })
            .map(|previous| previous + size)
            .map_err(|live| match self.limit {
                Some(limit) => AllocationError::LimitExceeded {
                    requested: size,
                    live,
                    limit,
                },
                None => AllocationError::OutOfMemory { requested: size },
            })
    }
}

impl TrackedAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<BytesMut, AllocationError> {
        if size > isize::MAX as usize {
            self.metrics.failed_allocations.fetch_add(1, Ordering::Relaxed);
            return Err(AllocationError::OutOfMemory { requested: size });
        }
        let live = match self.reserve_quota(size) {
            Ok(live) => live,
            Err(err) => {
                self.metrics.failed_allocations.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        let mut block = Vec::<u8>::new();
        if block.try_reserve_exact(size).is_err() {
            saturating_sub(&self.metrics.live_bytes, size);
            self.metrics.failed_allocations.fetch_add(1, Ordering::Relaxed);
            return Err(AllocationError::OutOfMemory { requested: size });
        }
        block.resize(size, 0);
        self.metrics.peak_bytes.fetch_max(live, Ordering::Relaxed);
        self.metrics.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(BytesMut::from(Bytes::from(block)))
    }

    fn free(&self, block: BytesMut) {
        self.metrics.frees.fetch_add(1, Ordering::Relaxed);
        saturating_sub(&self.metrics.live_bytes, block.len());
    }
}

/// [`HeapAllocator`] 的统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub allocations: u64,
    pub frees: u64,
    pub failed_allocations: u64,
    pub live_bytes: usize,
    pub peak_bytes: usize,
}

#[derive(Debug, Default)]
struct AllocatorMetrics {
    allocations: AtomicU64,
    frees: AtomicU64,
    failed_allocations: AtomicU64,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}

static GLOBAL_ALLOCATOR: Once<Arc<dyn TrackedAllocator>> = Once::new();

/// 安装进程级分配器，线程局部缓存在首次创建时使用它。
///
/// 只能在首次使用前调用一次；之后再调用返回 [`ConfigError::AlreadyInstalled`]。
pub fn install_global(allocator: Arc<dyn TrackedAllocator>) -> Result<(), ConfigError> {
    let mut installed = false;
    GLOBAL_ALLOCATOR.call_once(|| {
        installed = true;
        allocator
    });
    if installed {
        Ok(())
    } else {
        Err(ConfigError::AlreadyInstalled { what: "allocator" })
    }
}

/// 返回进程级分配器；未安装时冻结为默认的 [`HeapAllocator`]。
pub fn global() -> Arc<dyn TrackedAllocator> {
    Arc::clone(GLOBAL_ALLOCATOR.call_once(|| Arc::new(HeapAllocator::new())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_track_live_bytes() {
        let allocator = HeapAllocator::new();
        let block = allocator.allocate(64).expect("分配失败");
        assert_eq!(block.len(), 64);
        assert!(block.iter().all(|byte| *byte == 0));
        assert_eq!(allocator.stats().live_bytes, 64);

        allocator.free(block);
        let stats = allocator.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.peak_bytes, 64);
    }

    #[test]
    fn heap_refusal_is_reported_not_fatal() {
        let allocator = HeapAllocator::new();
        let requested = (isize::MAX as usize) / 2;
        let err = allocator.allocate(requested).expect_err("堆无法提供该容量");
        assert_eq!(err, AllocationError::OutOfMemory { requested });

        let stats = allocator.stats();
        assert_eq!(stats.failed_allocations, 1);
        assert_eq!(stats.allocations, 0);
        assert_eq!(stats.live_bytes, 0, "失败时归还预占的配额");
        assert_eq!(stats.peak_bytes, 0);
    }

    #[test]
    fn limit_rejects_oversized_requests() {
        let allocator = HeapAllocator::with_limit(100);
        let first = allocator.allocate(60).expect("配额内分配失败");
        let err = allocator.allocate(60).expect_err("超限分配应失败");
        assert_eq!(
            err,
            AllocationError::LimitExceeded {
                requested: 60,
                live: 60,
                limit: 100
            }
        );
        assert_eq!(allocator.stats().failed_allocations, 1);

        allocator.free(first);
        assert!(allocator.allocate(60).is_ok());
    }
}
