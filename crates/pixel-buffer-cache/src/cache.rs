use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt, ptr,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use tracing::{debug, trace, warn};

use crate::{
    allocator::{self, TrackedAllocator},
    buffer::{BufferRef, BufferSlot},
    cache_list::BufferCacheList,
    config::BufferCacheConfig,
    error::Result,
    image::{Image, ImageKey},
    rect::Rect,
    reserve::Reserve,
};

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // 线程退出时该值被析构，即每线程缓存的销毁钩子。
    static CURRENT: RefCell<Option<BufferCache>> = const { RefCell::new(None) };
}

/// 缓存实例的进程内唯一标识，缓冲以此记录所属缓存而不持有它。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheId(u64);

impl CacheId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// 每个工作线程独占的像素缓冲缓存。
///
/// # 模块角色（Why）
/// - 为同一线程上的流水线阶段提供“按图像 + 区域”复用已计算缓冲的能力；
/// - 维护有界的空闲缓冲储备，把释放的存储留给下一次获取，减少分配器往返。
///
/// # 核心机制（How）
/// - `lists`：图像键到 [`BufferCacheList`] 的映射，首次发布时惰性创建；
/// - `reserve`：固定上限的 LIFO 栈，保存空闲缓冲；
/// - 所有状态都只被创建它的线程访问（`Rc` 使该类型 `!Send`），因此全部使用 `RefCell`/`Cell`，不加锁；
/// - 引用计数归零统一走 `CacheInner::release_slot`：撤销发布，然后放回储备或交还分配器。
///
/// # 契约说明（What）
/// - [`BufferCache::current`] 为调用线程惰性创建唯一实例，线程退出时自动销毁；
/// - 也可以用 [`BufferCache::new`] 创建显式的工作者上下文，并通过 [`BufferCache::set_current`] 绑定到线程；
/// - 销毁时释放储备中全部空闲缓冲；仍处于发布状态的缓冲被标记为未完成，随最后一个句柄一起释放。
///
/// # 设计权衡（Trade-offs）
/// - 查找返回首个包围请求区域的缓冲而非最贴合者，扫描成本与列表长度线性相关；
/// - 储备上限在内存余量与分配压力之间取舍，由 [`BufferCacheConfig::reserve_cap`] 控制。
#[derive(Clone)]
pub struct BufferCache {
    inner: Rc<CacheInner>,
}

pub(crate) struct CacheInner {
    id: CacheId,
    thread: ThreadId,
    allocator: Arc<dyn TrackedAllocator>,
    lists: RefCell<HashMap<ImageKey, BufferCacheList>>,
    reserve: RefCell<Reserve>,
    stats: StatCells,
}

impl BufferCache {
    /// 使用指定配置与分配器创建独立的缓存上下文。
    pub fn new(config: BufferCacheConfig, allocator: Arc<dyn TrackedAllocator>) -> Self {
        let inner = CacheInner {
            id: CacheId::next(),
            thread: thread::current().id(),
            allocator,
            lists: RefCell::new(HashMap::new()),
            reserve: RefCell::new(Reserve::with_cap(config.reserve_cap)),
            stats: StatCells::default(),
        };
        debug!(
            cache = inner.id.0,
            thread = ?inner.thread,
            reserve_cap = config.reserve_cap,
            "buffer cache created"
        );
        Self {
            inner: Rc::new(inner),
        }
    }

    pub(crate) fn from_inner(inner: Rc<CacheInner>) -> Self {
        Self { inner }
    }

    /// 使用进程级分配器创建缓存。
    pub fn with_config(config: BufferCacheConfig) -> Self {
        Self::new(config, allocator::global())
    }

    /// 返回调用线程的缓存，不存在时按进程级配置惰性创建。
    ///
    /// 线程局部存储已在析构阶段时，每次调用都返回一个新的、不绑定线程的临时缓存；
    /// 此时不要把已有句柄交给它发布或释放，应使用句柄所属的缓存（[`api`](crate::api) 的入口即如此路由）。
    pub fn current() -> Self {
        CURRENT
            .try_with(|current| {
                current
                    .borrow_mut()
                    .get_or_insert_with(|| Self::with_config(BufferCacheConfig::process()))
                    .clone()
            })
            .unwrap_or_else(|_| {
                debug!("thread-local buffer cache unavailable, using a detached cache");
                Self::with_config(BufferCacheConfig::process())
            })
    }

    /// 把显式创建的缓存绑定为调用线程的当前缓存，返回此前绑定的缓存。
    pub fn set_current(cache: BufferCache) -> Option<BufferCache> {
        CURRENT.with(|current| current.borrow_mut().replace(cache))
    }

    /// 提前销毁调用线程的缓存；之后的 [`BufferCache::current`] 会重新创建。
    ///
    /// 返回线程此前是否绑定了缓存。其它持有该缓存克隆的地方会让实际销毁推迟到最后一个克隆释放。
    pub fn shutdown_current() -> bool {
        let previous = CURRENT
            .try_with(|current| current.borrow_mut().take())
            .ok()
            .flatten();
        previous.is_some()
    }

    pub fn id(&self) -> CacheId {
        self.inner.id
    }

    /// 创建该缓存的线程。
    pub fn owner_thread(&self) -> ThreadId {
        self.inner.thread
    }

    pub fn reserve_cap(&self) -> usize {
        self.inner.reserve.borrow().cap()
    }

    pub fn reserve_len(&self) -> usize {
        self.inner.reserve.borrow().len()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }

    /// 查看某幅图像在本缓存中的已发布列表。
    pub fn lookup_list(&self, image: ImageKey) -> Option<CacheListSnapshot> {
        self.inner
            .lists
            .borrow()
            .get(&image)
            .map(|list| CacheListSnapshot {
                image: list.image(),
                owner: list.owner(),
                areas: list.areas(),
            })
    }

    /// 仅查找：返回首个包围 `area` 的已发布缓冲的新引用。
    pub fn find<I: Image + ?Sized>(&self, image: &I, area: Rect) -> Option<BufferRef> {
        let slot = self
            .inner
            .lists
            .borrow()
            .get(&image.key())?
            .find_enclosing(&area)?;
        Some(BufferRef::adopt(slot, Rc::downgrade(&self.inner)))
    }

    /// 取得一块尺寸满足 `area` 的新缓冲（引用计数 1，未发布），从不命中已发布缓冲。
    ///
    /// # 实现策略
    /// 1. 优先弹出储备中最近释放的空闲缓冲，否则新建记录；
    /// 2. 绑定图像后调整到 `area`，容量足够时原样复用存储；
    /// 3. 分配失败时记录从未对外可见，直接丢弃并透传错误。
    pub fn acquire<I: Image + ?Sized>(&self, image: &I, area: Rect) -> Result<BufferRef> {
        let inner = &self.inner;
        let reused = inner.reserve.borrow_mut().pop();
        let slot = match reused {
            Some(slot) => {
                inner.stats.bump(&inner.stats.reserve_reuses);
                slot
            }
            None => {
                inner.stats.bump(&inner.stats.fresh_records);
                Rc::new(BufferSlot::new(Arc::clone(&inner.allocator)))
            }
        };
        slot.activate(image.key(), image.bytes_per_pixel());

        match slot.reshape(area) {
            Ok(reallocated) => {
                if reallocated {
                    inner.stats.bump(&inner.stats.reallocations);
                }
                trace!(image = ?image.key(), %area, capacity = slot.capacity(), "buffer acquired");
                Ok(BufferRef::adopt(slot, Rc::downgrade(inner)))
            }
            Err(err) => {
                inner.stats.bump(&inner.stats.failed_acquisitions);
                warn!(image = ?image.key(), %area, error = %err, "pixel buffer allocation failed");
                // 记录尚未交出，丢弃即可；残留存储由记录析构交还分配器。
                drop(slot);
                Err(err)
            }
        }
    }

    /// 返回包围 `area` 的缓冲引用：命中已发布缓冲则共享，否则取得新缓冲。
    ///
    /// 仅在分配失败时返回错误。
    pub fn acquire_ref<I: Image + ?Sized>(&self, image: &I, area: Rect) -> Result<BufferRef> {
        if let Some(found) = self.find(image, area) {
            self.inner.stats.bump(&self.inner.stats.hits);
            trace!(image = ?image.key(), %area, ref_count = found.ref_count(), "buffer cache hit");
            return Ok(found);
        }
        self.inner.stats.bump(&self.inner.stats.misses);
        self.acquire(image, area)
    }

    /// 发布缓冲：像素已写好，对本线程的后续查找可见。已发布时为空操作。
    ///
    /// # Panics
    /// 缓冲属于其它缓存时断言失败。
    pub fn publish(&self, buffer: &BufferRef) {
        self.assert_owns(buffer);
        let slot = buffer.slot();
        if slot.is_done() {
            return;
        }
        let image = buffer.image_key();
        let id = self.inner.id;
        self.inner
            .lists
            .borrow_mut()
            .entry(image)
            .or_insert_with(|| BufferCacheList::new(image, id))
            .add(Rc::clone(slot));
        slot.mark_done(id);
        self.inner.stats.bump(&self.inner.stats.publishes);
        trace!(image = ?image, area = %slot.area(), "buffer published");
    }

    /// 撤销发布：移出列表并把区域清零。未发布时为空操作。
    pub fn unpublish(&self, buffer: &BufferRef) {
        self.assert_owns(buffer);
        self.inner.unpublish_slot(buffer.slot());
    }

    /// 就地把独占的缓冲移动到 `area`，必要时重新分配存储。
    ///
    /// # Panics
    /// 引用计数不为 1 时断言失败：共享中的缓冲不能被改写。
    pub fn resize(&self, buffer: &BufferRef, area: Rect) -> Result<()> {
        self.assert_owns(buffer);
        let slot = buffer.slot();
        assert_eq!(slot.ref_count(), 1, "cannot resize a shared buffer");

        self.inner.unpublish_slot(slot);
        match slot.reshape(area) {
            Ok(reallocated) => {
                if reallocated {
                    self.inner.stats.bump(&self.inner.stats.reallocations);
                }
                Ok(())
            }
            Err(err) => {
                warn!(image = ?buffer.image_key(), %area, error = %err, "pixel buffer resize failed");
                Err(err)
            }
        }
    }

    /// 释放一份引用；等价于丢弃句柄。
    pub fn release(&self, buffer: BufferRef) {
        self.assert_owns(&buffer);
        drop(buffer);
    }

    /// 一次完成“释放旧缓冲 + 获取新区域”，尽量复用。
    ///
    /// # 实现策略（按成本从低到高）
    /// 1. 旧缓冲已包围 `area`：原样返回；
    /// 2. 已有其它已发布缓冲包围 `area`：释放旧缓冲，返回命中者；
    /// 3. 旧缓冲独占：就地调整尺寸后返回；失败时旧缓冲被释放，错误透传；
    /// 4. 否则释放旧缓冲并取得新缓冲。
    ///
    /// 返回的缓冲可能已发布，也可能未发布。
    pub fn swap_ref<I: Image + ?Sized>(
        &self,
        old: Option<BufferRef>,
        image: &I,
        area: Rect,
    ) -> Result<BufferRef> {
        if let Some(old) = &old {
            self.assert_owns(old);
            assert_eq!(
                old.image_key(),
                image.key(),
                "swap_ref must stay on the same image"
            );
        }

        let old = match old {
            Some(old) if old.area().encloses(&area) => return Ok(old),
            other => other,
        };

        if let Some(found) = self.find(image, area) {
            self.inner.stats.bump(&self.inner.stats.hits);
            drop(old);
            return Ok(found);
        }

        if let Some(old) = old {
            if old.ref_count() == 1 {
                self.resize(&old, area)?;
                self.inner.stats.bump(&self.inner.stats.in_place_resizes);
                return Ok(old);
            }
            drop(old);
        }

        self.inner.stats.bump(&self.inner.stats.misses);
        self.acquire(image, area)
    }

    /// 释放储备中的全部空闲缓冲，返回交还分配器的字节数。
    pub fn shrink_reserve(&self) -> usize {
        let freed = self.inner.reserve.borrow_mut().clear();
        debug!(cache = self.inner.id.0, freed, "buffer reserve shrunk");
        freed
    }

    fn assert_owns(&self, buffer: &BufferRef) {
        assert!(
            ptr::eq(buffer.cache_ptr(), Rc::as_ptr(&self.inner)),
            "buffer belongs to a different buffer cache"
        );
    }
}

impl CacheInner {
    /// 引用计数减一；归零时撤销发布，然后放回储备或释放记录。
    pub(crate) fn release_slot(&self, slot: &Rc<BufferSlot>) {
        if slot.drop_ref() > 0 {
            return;
        }
        self.unpublish_slot(slot);
        slot.retire();

        let rejected = self.reserve.borrow_mut().push(Rc::clone(slot));
        match rejected {
            Ok(()) => self.stats.bump(&self.stats.reserve_returns),
            Err(slot) => {
                self.stats.bump(&self.stats.freed_on_release);
                debug!(
                    cache = self.id.0,
                    capacity = slot.capacity(),
                    "buffer reserve full, freeing released buffer"
                );
            }
        }
    }

    fn unpublish_slot(&self, slot: &Rc<BufferSlot>) {
        if !slot.is_done() {
            return;
        }
        assert_eq!(
            slot.owner(),
            Some(self.id),
            "buffer was published on another cache"
        );
        let image = slot.image().expect("published buffers are active");
        let removed = self
            .lists
            .borrow_mut()
            .get_mut(&image)
            .is_some_and(|list| list.remove(slot));
        assert!(removed, "published buffer missing from its cache list");
        slot.mark_undone();
        slot.clear_area();
        trace!(image = ?image, "buffer unpublished");
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        let lists = self.lists.get_mut();
        let published: usize = lists.values().map(BufferCacheList::len).sum();
        for list in lists.values_mut() {
            list.detach_all();
        }
        lists.clear();
        let reserve_bytes = self.reserve.get_mut().clear();
        debug!(
            cache = self.id.0,
            thread = ?self.thread,
            published,
            reserve_bytes,
            "buffer cache torn down"
        );
    }
}

impl fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("id", &self.inner.id)
            .field("thread", &self.inner.thread)
            .field("images", &self.inner.lists.borrow().len())
            .field("reserve", &*self.inner.reserve.borrow())
            .finish()
    }
}

/// 某幅图像已发布列表的只读快照，`areas` 按查找顺序排列。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheListSnapshot {
    pub image: ImageKey,
    pub owner: CacheId,
    pub areas: Vec<Rect>,
}

impl CacheListSnapshot {
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }
}

/// 缓存累计计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// 查找命中已发布缓冲的次数。
    pub hits: u64,
    /// 查找未命中、转而取得新缓冲的次数。
    pub misses: u64,
    /// 新建缓冲记录的次数。
    pub fresh_records: u64,
    /// 从储备复用空闲缓冲的次数。
    pub reserve_reuses: u64,
    /// 归零后放回储备的次数。
    pub reserve_returns: u64,
    /// 归零时储备已满而直接释放的次数。
    pub freed_on_release: u64,
    /// `swap_ref` 就地调整尺寸的次数。
    pub in_place_resizes: u64,
    /// 调整尺寸时重新分配存储的次数。
    pub reallocations: u64,
    pub publishes: u64,
    pub failed_acquisitions: u64,
}

#[derive(Default)]
struct StatCells {
    hits: Cell<u64>,
    misses: Cell<u64>,
    fresh_records: Cell<u64>,
    reserve_reuses: Cell<u64>,
    reserve_returns: Cell<u64>,
    freed_on_release: Cell<u64>,
    in_place_resizes: Cell<u64>,
    reallocations: Cell<u64>,
    publishes: Cell<u64>,
    failed_acquisitions: Cell<u64>,
}

impl StatCells {
    fn bump(&self, counter: &Cell<u64>) {
        counter.set(counter.get() + 1);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.get(),
            misses: self.misses.get(),
            fresh_records: self.fresh_records.get(),
            reserve_reuses: self.reserve_reuses.get(),
            reserve_returns: self.reserve_returns.get(),
            freed_on_release: self.freed_on_release.get(),
            in_place_resizes: self.in_place_resizes.get(),
            reallocations: self.reallocations.get(),
            publishes: self.publishes.get(),
            failed_acquisitions: self.failed_acquisitions.get(),
        }
    }
}
