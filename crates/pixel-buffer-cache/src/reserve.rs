use std::rc::Rc;

use crate::{buffer::BufferSlot, config::DEFAULT_RESERVE_CAP};

/// 有界的空闲缓冲 LIFO 栈。
///
/// 最近释放的缓冲最先被复用，以获得更好的局部性并减少分配器往返。
/// 底层 `Vec` 预留不超过默认上限的槽位；上限只在入栈时检查，配置得再大也不会在创建时占用内存。
#[derive(Debug)]
pub(crate) struct Reserve {
    slots: Vec<Rc<BufferSlot>>,
    cap: usize,
}

impl Reserve {
    pub(crate) fn with_cap(cap: usize) -> Self {
        Self {
            slots: Vec::with_capacity(cap.min(DEFAULT_RESERVE_CAP)),
            cap,
        }
    }

    pub(crate) fn cap(&self) -> usize {
        self.cap
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// 入栈；已满时原样交还，由调用方释放。
    pub(crate) fn push(&mut self, slot: Rc<BufferSlot>) -> Result<(), Rc<BufferSlot>> {
        if self.slots.len() >= self.cap {
            return Err(slot);
        }
        debug_assert!(slot.is_idle());
        self.slots.push(slot);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<Rc<BufferSlot>> {
        self.slots.pop()
    }

    /// 清空储备，返回被丢弃的存储总字节数。
    pub(crate) fn clear(&mut self) -> usize {
        let bytes = self.slots.iter().map(|slot| slot.capacity()).sum();
        self.slots.clear();
        bytes
    }
}
