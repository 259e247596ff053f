//! 进程级缓存配置。
//!
//! # 模块定位（Why）
//! - 唯一的调优项是每线程空闲缓冲储备的上限 `reserve_cap`：越大越能平抑分配抖动，越小越节省内存余量；
//! - 配置在进程启动时确定，之后所有线程的缓存都按同一份配置创建。
//!
//! # 设计概要（How）
//! - [`BufferCacheConfig`] 支持 `serde` 反序列化，可由 TOML 片段加载，缺省字段取默认值；
//! - 环境变量 `PIXEL_BUFFER_RESERVE_CAP` 覆盖默认值；
//! - [`BufferCacheConfig::install`] 将配置写入 `spin::Once`，首次读取后即冻结。

use std::env;

use serde::Deserialize;
use spin::Once;
use thiserror::Error;
use tracing::{debug, warn};

/// 默认每线程储备上限。
pub const DEFAULT_RESERVE_CAP: usize = 40;

/// 覆盖 `reserve_cap` 的环境变量名。
pub const RESERVE_CAP_ENV: &str = "PIXEL_BUFFER_RESERVE_CAP";

static PROCESS_CONFIG: Once<BufferCacheConfig> = Once::new();

/// 配置加载与安装过程中的错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 进程级配置或分配器已被安装（或已被读取而冻结）。
    #[error("process-wide {what} is already installed")]
    AlreadyInstalled { what: &'static str },

    /// TOML 文本解析失败。
    #[error("failed to parse buffer cache configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// 环境变量不是合法的非负整数。
    #[error("environment variable {name} has invalid value `{value}`")]
    InvalidEnv { name: &'static str, value: String },
}

/// 缓冲缓存配置。
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BufferCacheConfig {
    /// 每线程空闲缓冲储备上限；0 表示禁用储备，释放的缓冲立即交还分配器。
    pub reserve_cap: usize,
}

impl Default for BufferCacheConfig {
    fn default() -> Self {
        Self {
            reserve_cap: DEFAULT_RESERVE_CAP,
        }
    }
}

impl BufferCacheConfig {
    pub const fn with_reserve_cap(reserve_cap: usize) -> Self {
        Self { reserve_cap }
    }

    /// 从 TOML 文本加载，例如 `reserve_cap = 8`。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// 默认值叠加环境变量覆盖。
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_override(env::var(RESERVE_CAP_ENV).ok().as_deref())
    }

    /// 以给定的环境变量取值覆盖 `reserve_cap`，`None` 表示未设置。
    pub fn with_env_override(mut self, value: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(raw) = value {
            self.reserve_cap =
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnv {
                        name: RESERVE_CAP_ENV,
                        value: raw.to_owned(),
                    })?;
        }
        Ok(self)
    }

    /// 安装进程级配置；必须在任何线程创建缓存之前调用。
    pub fn install(self) -> Result<(), ConfigError> {
        let mut installed = false;
        PROCESS_CONFIG.call_once(|| {
            installed = true;
            self.announce();
            self
        });
        if installed {
            Ok(())
        } else {
            Err(ConfigError::AlreadyInstalled {
                what: "buffer cache configuration",
            })
        }
    }

    /// 返回进程级配置。
    ///
    /// 未显式安装时取 [`BufferCacheConfig::from_env`]，环境变量非法则退回默认值；结果随即冻结。
    pub fn process() -> Self {
        *PROCESS_CONFIG.call_once(|| {
            let config = Self::from_env().unwrap_or_else(|err| {
                warn!(error = %err, "ignoring invalid buffer cache override");
                Self::default()
            });
            config.announce();
            config
        })
    }

    fn announce(&self) {
        if self.reserve_cap == 0 {
            debug!("buffer reserve disabled");
        } else {
            debug!(reserve_cap = self.reserve_cap, "buffer cache configured");
        }
    }
}
