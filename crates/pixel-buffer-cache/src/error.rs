//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 缓冲缓存只有一种可恢复失败：分配器无法满足调整尺寸/获取请求；
//! - 失败直接透传给 `acquire_ref`/`swap_ref` 的调用方，内部不做重试，重试策略属于分配器或更外层。
//!
//! ## 设计要求（What）
//! - 错误类型派生 `thiserror::Error`，可直接交给 `anyhow` 等上层框架；
//! - 契约违规（重复发布、共享缓冲上调整尺寸等）不属于此处，它们以断言失败终止。

use thiserror::Error;

use crate::rect::Rect;

/// 像素存储分配失败。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“系统内存不足”“超出跟踪分配器配额”“区域尺寸无法表示”三类来源，
///   便于上层决定是降级、缩小区块还是直接报错；
/// - **契约 (What)**：所有变体均为 `Clone + Send + Sync + 'static`；
/// - **风险 (Trade-offs)**：负尺寸区域也归入 `InvalidArea`，而不是在计算容量时 panic。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// 底层堆无法提供请求的字节数。
    #[error("out of memory while allocating {requested} bytes of pixel storage")]
    OutOfMemory { requested: usize },

    /// 跟踪分配器的配额不足。
    #[error(
        "tracked allocation of {requested} bytes exceeds limit ({live} of {limit} bytes live)"
    )]
    LimitExceeded {
        requested: usize,
        live: usize,
        limit: usize,
    },

    /// `width × height × bytes_per_pixel` 无法表示为合法字节数。
    #[error("pixel area {area} with {bytes_per_pixel} bytes per pixel has no valid byte size")]
    InvalidArea { area: Rect, bytes_per_pixel: usize },
}

pub type Result<T, E = AllocationError> = core::result::Result<T, E>;

/// 计算区域所需的字节数。
///
/// 负尺寸或乘法溢出返回 [`AllocationError::InvalidArea`]。
pub(crate) fn required_bytes(area: Rect, bytes_per_pixel: usize) -> Result<usize> {
    let invalid = || AllocationError::InvalidArea {
        area,
        bytes_per_pixel,
    };
    let width = usize::try_from(area.width).map_err(|_| invalid())?;
    let height = usize::try_from(area.height).map_err(|_| invalid())?;
    width
        .checked_mul(height)
        .and_then(|pixels| pixels.checked_mul(bytes_per_pixel))
        .filter(|bytes| *bytes <= isize::MAX as usize)
        .ok_or_else(invalid)
}
