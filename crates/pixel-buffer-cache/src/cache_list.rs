use std::rc::Rc;

use crate::{buffer::BufferSlot, cache::CacheId, image::ImageKey, rect::Rect};

/// 某个线程上某幅图像的已发布缓冲集合。
///
/// # 契约说明（What）
/// - 顺序为“最近发布者在前”，查找按此顺序返回第一个包围请求区域的缓冲，
///   不保证是最贴合的那个；
/// - 成员数受流水线扇出约束而非图像尺寸，因此增删与查找都是线性扫描；
/// - 列表在首次发布时惰性创建，只随所属缓存一起销毁。
#[derive(Debug)]
pub(crate) struct BufferCacheList {
    image: ImageKey,
    owner: CacheId,
    buffers: Vec<Rc<BufferSlot>>,
}

impl BufferCacheList {
    pub(crate) fn new(image: ImageKey, owner: CacheId) -> Self {
        Self {
            image,
            owner,
            buffers: Vec::new(),
        }
    }

    pub(crate) fn image(&self) -> ImageKey {
        self.image
    }

    pub(crate) fn owner(&self) -> CacheId {
        self.owner
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }

    pub(crate) fn contains(&self, slot: &Rc<BufferSlot>) -> bool {
        self.buffers.iter().any(|member| Rc::ptr_eq(member, slot))
    }

    /// 按查找顺序返回各成员的区域。
    pub(crate) fn areas(&self) -> Vec<Rect> {
        self.iter().map(|slot| slot.area()).collect()
    }

    /// 返回第一个包围 `area` 的缓冲，并为调用方增加一份引用。
    pub(crate) fn find_enclosing(&self, area: &Rect) -> Option<Rc<BufferSlot>> {
        let found = self.iter().find(|slot| slot.area().encloses(area))?;
        found.add_ref();
        Some(Rc::clone(found))
    }

    /// 加入列表头部。
    pub(crate) fn add(&mut self, slot: Rc<BufferSlot>) {
        assert!(
            !self.contains(&slot),
            "buffer is already published for image {:?}",
            self.image
        );
        self.buffers.push(slot);
    }

    /// 移除成员，返回它是否在列表中。
    pub(crate) fn remove(&mut self, slot: &Rc<BufferSlot>) -> bool {
        match self.buffers.iter().position(|member| Rc::ptr_eq(member, slot)) {
            Some(index) => {
                self.buffers.remove(index);
                true
            }
            None => false,
        }
    }

    /// 清空列表，并把成员全部标记为未完成。
    pub(crate) fn detach_all(&mut self) {
        for slot in self.buffers.drain(..) {
            slot.mark_undone();
        }
    }

    // 内部以 Vec 尾部作为“头部”，迭代时倒序即为最近发布优先。
    fn iter(&self) -> impl Iterator<Item = &Rc<BufferSlot>> {
        self.buffers.iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::allocator::HeapAllocator;

    fn published(image: ImageKey, area: Rect) -> Rc<BufferSlot> {
        let slot = Rc::new(BufferSlot::new(Arc::new(HeapAllocator::new())));
        slot.activate(image, 1);
        slot.reshape(area).expect("分配失败");
        slot
    }

    #[test]
    fn first_enclosing_match_wins_most_recent_first() {
        let image = ImageKey::fresh();
        let mut list = BufferCacheList::new(image, CacheId::next());
        let wide = published(image, Rect::new(0, 0, 100, 100));
        let tight = published(image, Rect::new(0, 0, 10, 10));
        list.add(Rc::clone(&tight));
        list.add(Rc::clone(&wide));

        let found = list.find_enclosing(&Rect::new(1, 1, 2, 2)).expect("应命中");
        assert!(Rc::ptr_eq(&found, &wide), "返回的是首个匹配而非最贴合者");
        assert_eq!(wide.ref_count(), 2);
        assert_eq!(tight.ref_count(), 1);
        assert_eq!(list.areas(), vec![wide.area(), tight.area()]);
    }

    #[test]
    fn miss_leaves_ref_counts_untouched() {
        let image = ImageKey::fresh();
        let mut list = BufferCacheList::new(image, CacheId::next());
        let slot = published(image, Rect::new(0, 0, 4, 4));
        list.add(Rc::clone(&slot));

        assert!(list.find_enclosing(&Rect::new(2, 2, 4, 4)).is_none());
        assert_eq!(slot.ref_count(), 1);
    }

    #[test]
    fn remove_reports_membership() {
        let image = ImageKey::fresh();
        let mut list = BufferCacheList::new(image, CacheId::next());
        let slot = published(image, Rect::new(0, 0, 4, 4));
        list.add(Rc::clone(&slot));

        assert!(list.remove(&slot));
        assert!(!list.remove(&slot));
        assert_eq!(list.len(), 0);
    }

    #[test]
    #[should_panic(expected = "already published")]
    fn duplicate_add_is_fatal() {
        let image = ImageKey::fresh();
        let mut list = BufferCacheList::new(image, CacheId::next());
        let slot = published(image, Rect::new(0, 0, 4, 4));
        list.add(Rc::clone(&slot));
        list.add(slot);
    }
}
