use std::{
    cell::{Cell, Ref, RefCell, RefMut},
    fmt,
    rc::{Rc, Weak},
    sync::Arc,
};

use bytes::BytesMut;
use tracing::trace;

use crate::{
    allocator::TrackedAllocator,
    cache::{BufferCache, CacheId, CacheInner},
    error::{Result, required_bytes},
    image::ImageKey,
    rect::Rect,
};

/// 一块可复用的像素存储及其簿记信息。
///
/// # 状态机（What）
/// - **空闲**：`image == None`、`ref_count == 0`、区域为零矩形，位于某个缓存的储备栈中；
/// - **活跃/未完成**：已绑定图像，`ref_count > 0`，不在任何列表中；
/// - **活跃/已完成**：同上，且恰好位于所属线程某个 [`BufferCacheList`](crate::cache_list::BufferCacheList) 中；
/// - **已释放**：记录本身被丢弃，此时 `Drop` 把存储交还分配器，这是存储归还的唯一出口。
///
/// # 设计概要（How）
/// - 槽位只在单线程内通过 `Rc` 共享，字段全部使用 `Cell`/`RefCell`；
/// - `cache` 只记录所属缓存的 [`CacheId`]，不持有缓存；图像同理只记录 [`ImageKey`]。
pub(crate) struct BufferSlot {
    image: Cell<Option<ImageKey>>,
    bytes_per_pixel: Cell<usize>,
    area: Cell<Rect>,
    ref_count: Cell<usize>,
    done: Cell<bool>,
    cache: Cell<Option<CacheId>>,
    storage: RefCell<Option<BytesMut>>,
    allocator: Arc<dyn TrackedAllocator>,
}

impl BufferSlot {
    /// 新建一个不含存储的空闲记录。
    pub(crate) fn new(allocator: Arc<dyn TrackedAllocator>) -> Self {
        Self {
            image: Cell::new(None),
            bytes_per_pixel: Cell::new(0),
            area: Cell::new(Rect::default()),
            ref_count: Cell::new(0),
            done: Cell::new(false),
            cache: Cell::new(None),
            storage: RefCell::new(None),
            allocator,
        }
    }

    /// 将空闲记录绑定到图像，引用计数置 1，状态为未完成。
    pub(crate) fn activate(&self, image: ImageKey, bytes_per_pixel: usize) {
        debug_assert!(self.is_idle(), "only idle buffers can be activated");
        self.image.set(Some(image));
        self.bytes_per_pixel.set(bytes_per_pixel);
        self.ref_count.set(1);
        self.done.set(false);
        self.cache.set(None);
    }

    /// 回到空闲状态；存储保持不动，供下次复用。
    pub(crate) fn retire(&self) {
        debug_assert_eq!(self.ref_count.get(), 0);
        debug_assert!(!self.done.get());
        self.image.set(None);
        self.area.set(Rect::default());
        self.cache.set(None);
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.image.get().is_none() && self.ref_count.get() == 0
    }

    pub(crate) fn add_ref(&self) {
        debug_assert!(self.image.get().is_some(), "idle buffers cannot be referenced");
        self.ref_count.set(self.ref_count.get() + 1);
    }

    /// 引用计数减一并返回剩余值。
    pub(crate) fn drop_ref(&self) -> usize {
        let count = self.ref_count.get();
        assert!(count > 0, "buffer released with ref_count already 0");
        self.ref_count.set(count - 1);
        count - 1
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.ref_count.get()
    }

    pub(crate) fn image(&self) -> Option<ImageKey> {
        self.image.get()
    }

    pub(crate) fn area(&self) -> Rect {
        self.area.get()
    }

    pub(crate) fn clear_area(&self) {
        self.area.set(Rect::default());
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.get()
    }

    pub(crate) fn owner(&self) -> Option<CacheId> {
        self.cache.get()
    }

    pub(crate) fn mark_done(&self, cache: CacheId) {
        self.done.set(true);
        self.cache.set(Some(cache));
    }

    pub(crate) fn mark_undone(&self) {
        self.done.set(false);
        self.cache.set(None);
    }

    pub(crate) fn capacity(&self) -> usize {
        self.storage.borrow().as_ref().map_or(0, BytesMut::len)
    }

    /// 把缓冲移动到新区域，并保证存储足够容纳该区域。
    ///
    /// # 契约说明（What）
    /// - **前置条件**：调用方已撤销发布；
    /// - **后置条件**：成功时 `capacity() >= width × height × bytes_per_pixel`；
    ///   返回 `true` 表示重新分配了存储，`false` 表示原样复用；
    /// - 区域无法表示为字节数时不做任何修改，区域与存储保持原样；
    /// - 分配失败时旧存储已经归还，区域清零，缓冲不再持有可用存储，错误原样透传。
    ///   区域只在存储足够时才会被写入，因此任何时刻区域都不会超出存储容量。
    pub(crate) fn reshape(&self, area: Rect) -> Result<bool> {
        debug_assert!(!self.done.get(), "reshaping a published buffer");
        let required = required_bytes(area, self.bytes_per_pixel.get())?;

        let mut storage = self.storage.borrow_mut();
        if storage.as_ref().is_some_and(|block| block.len() >= required) {
            self.area.set(area);
            return Ok(false);
        }
        self.area.set(Rect::default());
        if let Some(block) = storage.take() {
            self.allocator.free(block);
        }
        *storage = Some(self.allocator.allocate(required)?);
        self.area.set(area);
        Ok(true)
    }

    /// 区域所需的字节数；无法表示时为 0。
    fn content_len(&self) -> usize {
        required_bytes(self.area.get(), self.bytes_per_pixel.get()).unwrap_or(0)
    }
}

impl Drop for BufferSlot {
    fn drop(&mut self) {
        if let Some(block) = self.storage.get_mut().take() {
            self.allocator.free(block);
        }
    }
}

impl fmt::Debug for BufferSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSlot")
            .field("image", &self.image.get())
            .field("area", &self.area.get())
            .field("ref_count", &self.ref_count.get())
            .field("done", &self.done.get())
            .field("cache", &self.cache.get())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// 调用方持有的缓冲引用。
///
/// # 设计初衷（Why）
/// - 每个 `BufferRef` 恰好代表一份引用计数：`Clone` 加一，`release`/`Drop` 减一，
///   因此“对计数已为 0 的缓冲再次释放”在类型层面不可表达；
/// - 归零路径统一交给所属缓存处理（撤销发布、放回储备或释放），调用方无需关心回收细节。
///
/// # 契约说明（What）
/// - 句柄持有 `Rc`，因此是 `!Send + !Sync`，缓冲永远不会跨线程共享；
/// - 对所属缓存只保留弱引用；缓存先于句柄销毁时，句柄归零后直接释放存储；
/// - 像素视图（[`pixels`](Self::pixels)/[`pixels_mut`](Self::pixels_mut)）不可跨越对缓存的调用持有，
///   否则调整尺寸时会因重复借用而 panic。
pub struct BufferRef {
    slot: Rc<BufferSlot>,
    cache: Weak<CacheInner>,
    image: ImageKey,
}

impl BufferRef {
    /// 包装一个已经为本句柄计入引用的活跃槽位。
    pub(crate) fn adopt(slot: Rc<BufferSlot>, cache: Weak<CacheInner>) -> Self {
        let image = slot
            .image()
            .expect("only active buffers can be handed out");
        Self { slot, cache, image }
    }

    pub(crate) fn slot(&self) -> &Rc<BufferSlot> {
        &self.slot
    }

    /// 句柄所属的缓存；缓存已销毁时为 `None`。
    pub(crate) fn owning_cache(&self) -> Option<BufferCache> {
        self.cache.upgrade().map(BufferCache::from_inner)
    }

    pub(crate) fn cache_ptr(&self) -> *const CacheInner {
        self.cache.as_ptr()
    }

    /// 当前覆盖的像素区域；撤销发布后为零矩形。
    pub fn area(&self) -> Rect {
        self.slot.area()
    }

    pub fn ref_count(&self) -> usize {
        self.slot.ref_count()
    }

    /// 是否已发布、对同线程的查找可见。
    pub fn is_done(&self) -> bool {
        self.slot.is_done()
    }

    /// 存储容量（字节）；分配失败后可能为 0。
    pub fn capacity(&self) -> usize {
        self.slot.capacity()
    }

    pub fn image_key(&self) -> ImageKey {
        self.image
    }

    /// 两个句柄是否指向同一缓冲记录。
    pub fn ptr_eq(&self, other: &BufferRef) -> bool {
        Rc::ptr_eq(&self.slot, &other.slot)
    }

    /// 当前区域对应的像素字节（按行紧密排列）。
    pub fn pixels(&self) -> Option<Ref<'_, [u8]>> {
        let len = self.slot.content_len();
        Ref::filter_map(self.slot.storage.borrow(), |storage| {
            storage
                .as_deref()
                .and_then(|block| block.get(..len))
        })
        .ok()
    }

    /// 可写像素视图，仅在独占且未发布时可用。
    pub fn pixels_mut(&mut self) -> Option<RefMut<'_, [u8]>> {
        if self.slot.ref_count() != 1 || self.slot.is_done() {
            return None;
        }
        let len = self.slot.content_len();
        RefMut::filter_map(self.slot.storage.borrow_mut(), |storage| {
            storage
                .as_deref_mut()
                .and_then(|block| block.get_mut(..len))
        })
        .ok()
    }

    /// 释放本句柄占用的引用，等价于 `drop`。
    pub fn release(self) {}
}

impl Clone for BufferRef {
    fn clone(&self) -> Self {
        self.slot.add_ref();
        Self {
            slot: Rc::clone(&self.slot),
            cache: Weak::clone(&self.cache),
            image: self.image,
        }
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        match self.cache.upgrade() {
            Some(cache) => cache.release_slot(&self.slot),
            None => {
                // 所属缓存已销毁：归零后直接丢弃记录，存储随之交还分配器。
                if self.slot.drop_ref() == 0 {
                    self.slot.mark_undone();
                    self.slot.retire();
                    trace!(image = ?self.image, "released buffer outlived its cache");
                }
            }
        }
    }
}

impl fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRef")
            .field("image", &self.image)
            .field("slot", &*self.slot)
            .finish()
    }
}
