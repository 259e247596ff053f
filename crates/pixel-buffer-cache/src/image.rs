use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_IMAGE_KEY: AtomicU64 = AtomicU64::new(1);

/// 图像在缓存中的身份键。
///
/// 缓冲只保存该键而非图像本身，因此永远不会延长图像的生命周期。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageKey(u64);

impl ImageKey {
    /// 分配一个进程内唯一的新键。
    pub fn fresh() -> Self {
        Self(NEXT_IMAGE_KEY.fetch_add(1, Ordering::Relaxed))
    }

    /// 由外部系统已有的标识构造键，调用方负责唯一性。
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// 缓存所需的图像最小视图。
///
/// # 契约说明（What）
/// - `key`：缓存键，同一幅图像在其生命周期内必须返回相同的值；
/// - `bytes_per_pixel`：单个像素的字节数，用于计算缓冲所需容量。
pub trait Image {
    fn key(&self) -> ImageKey;

    fn bytes_per_pixel(&self) -> usize;
}

/// 现成的 [`Image`] 实现，适合只需要身份与像素宽度的调用方。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDescriptor {
    key: ImageKey,
    bytes_per_pixel: usize,
}

impl ImageDescriptor {
    /// 以新分配的键创建描述符。
    pub fn new(bytes_per_pixel: usize) -> Self {
        Self::with_key(ImageKey::fresh(), bytes_per_pixel)
    }

    pub const fn with_key(key: ImageKey, bytes_per_pixel: usize) -> Self {
        Self {
            key,
            bytes_per_pixel,
        }
    }
}

impl Image for ImageDescriptor {
    fn key(&self) -> ImageKey {
        self.key
    }

    fn bytes_per_pixel(&self) -> usize {
        self.bytes_per_pixel
    }
}
