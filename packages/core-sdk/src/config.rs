use std::time::Duration;

use anyhow::{Context, Result};

use crate::vault::Vault;

pub const ENC_KEY_ENV: &str = "CONFIG_ENC_KEY";
pub const DB_PATH_ENV: &str = "SCHOLARANCHOR_DB";
pub const ADDR_ENV: &str = "SCHOLARANCHOR_ADDR";
pub const LOG_ENV: &str = "SCHOLARANCHOR_LOG";

pub const DEFAULT_DB_PATH: &str = "scholaranchor.db";
pub const DEFAULT_ADDR: &str = "127.0.0.1:5173";
pub const DEFAULT_LOG_FILTER: &str = "info,scholaranchor_core_sdk=debug";

/** \brief 单次补全的上游轮数上限（含首轮） */
pub const MAX_CONTINUATION_ROUNDS: u32 = 5;

/**
 * \brief 网关超时配置。纯提示词与带附件调用使用不同的硬超时。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayTimeouts {
    pub plain: Duration,
    pub attachment: Duration,
    pub probe: Duration,
}

impl Default for GatewayTimeouts {
    fn default() -> Self {
        Self {
            plain: Duration::from_secs(10 * 60),
            attachment: Duration::from_secs(30 * 60),
            probe: Duration::from_secs(5),
        }
    }
}

/**
 * \brief 进程级配置，启动时从环境变量加载一次。
 */
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub vault: Vault,
    pub db_path: String,
    pub addr: String,
    pub timeouts: GatewayTimeouts,
}

impl AppConfig {
    /**
     * \brief 从环境变量读取配置；密钥缺失或长度错误是启动期致命错误。
     */
    pub fn from_env() -> Result<Self> {
        let raw_key = std::env::var(ENC_KEY_ENV)
            .with_context(|| format!("{} is not set (run `scholaranchor keygen`)", ENC_KEY_ENV))?;
        let vault = Vault::from_encoded(&raw_key)?;
        let db_path = std::env::var(DB_PATH_ENV).unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
        let addr = std::env::var(ADDR_ENV).unwrap_or_else(|_| DEFAULT_ADDR.to_string());
        Ok(Self {
            vault,
            db_path,
            addr,
            timeouts: GatewayTimeouts::default(),
        })
    }
}

pub fn default_log_filter() -> String {
    std::env::var(LOG_ENV).unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_match_call_kinds() {
        let t = GatewayTimeouts::default();
        assert_eq!(t.plain, Duration::from_secs(600));
        assert_eq!(t.attachment, Duration::from_secs(1800));
        assert_eq!(t.probe, Duration::from_secs(5));
    }
}
