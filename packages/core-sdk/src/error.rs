use thiserror::Error;

use crate::vault::VaultError;

/**
 * \brief 网关的硬失败。业务层失败（缺少地址、网络错误、超时）不在此列，
 * 它们以 `CompletionResult` 的 `error` 状态返回。
 */
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("No config for apiName '{0}'")]
    UnknownApi(String),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("credential store failed: {0}")]
    Store(#[source] anyhow::Error),
}

/**
 * \brief 锚定前置条件校验失败，在任何网络调用之前同步返回。
 */
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("请至少选择{required}篇文献（当前 {selected} 篇）")]
    NotEnoughLiterature { selected: usize, required: usize },

    #[error("请至少选择一个文献网站")]
    NoSiteSelected,

    #[error("请选择AI-API")]
    NoApiSelected,
}

#[derive(Error, Debug)]
pub enum AnchorError {
    #[error("direction {0} already has an anchoring session in flight")]
    AlreadyRunning(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Error, Debug)]
pub enum AttachmentError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("file is not valid UTF-8 text")]
    NotUtf8,
}
