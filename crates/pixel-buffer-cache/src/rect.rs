use core::fmt;

/// 整数像素矩形。
///
/// # 契约说明（What）
/// - `left`/`top` 为左上角坐标，`width`/`height` 为尺寸；
/// - `Rect::default()` 是零矩形，空闲缓冲与撤销发布后的缓冲都以它表示“无有效区域”；
/// - 右/下边界按开区间计算：`right = left + width`。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    /// 构造矩形，不做任何校验。
    pub const fn new(left: i32, top: i32, width: i32, height: i32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// 右边界（开区间），溢出时饱和。
    pub fn right(&self) -> i32 {
        self.left.saturating_add(self.width)
    }

    /// 下边界（开区间），溢出时饱和。
    pub fn bottom(&self) -> i32 {
        self.top.saturating_add(self.height)
    }

    /// 宽或高不为正即视为空矩形。
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// 像素个数；空矩形为 0。
    pub fn pixel_count(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.width as u64 * self.height as u64
        }
    }

    /// 判断 `self` 是否包围 `other`。
    ///
    /// 与查找扫描保持一致：只比较四条边，因此位于角上的空请求同样被视为被包围。
    /// 边界使用 `i64` 计算，避免极端坐标下的溢出。
    #[inline]
    pub fn encloses(&self, other: &Rect) -> bool {
        let (left, top) = (i64::from(self.left), i64::from(self.top));
        let (other_left, other_top) = (i64::from(other.left), i64::from(other.top));
        left <= other_left
            && top <= other_top
            && left + i64::from(self.width) >= other_left + i64::from(other.width)
            && top + i64::from(self.height) >= other_top + i64::from(other.height)
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}+{}+{}",
            self.width, self.height, self.left, self.top
        )
    }
}
