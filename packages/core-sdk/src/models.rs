use serde::{Deserialize, Serialize};

/**
 * \brief AI 接口配置类型：云端接口或本地模型。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigKind {
    Cloud,
    Local,
}

impl ConfigKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKind::Cloud => "cloud",
            ConfigKind::Local => "local",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "cloud" => Some(ConfigKind::Cloud),
            "local" => Some(ConfigKind::Local),
            _ => None,
        }
    }
}

/**
 * \brief 已加密存储的接口凭据，仅在单次调用期间于内存中解密。
 */
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    /** \brief 逻辑接口名 */
    pub api_name: String,
    /** \brief 接口类型 */
    pub kind: ConfigKind,
    /** \brief 加密后的接口地址 */
    pub endpoint_ciphertext: Option<String>,
    /** \brief 加密后的 API Key */
    pub api_key_ciphertext: Option<String>,
    /** \brief 本地模型路径（仅 local 类型） */
    pub model_path: Option<String>,
    /** \brief 模型参数 JSON，如 {"model": "deepseek-chat"} */
    pub params_json: Option<String>,
}

impl std::fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredential")
            .field("api_name", &self.api_name)
            .field("kind", &self.kind)
            .field("endpoint_ciphertext", &self.endpoint_ciphertext.is_some())
            .field("api_key_ciphertext", &self.api_key_ciphertext.is_some())
            .field("model_path", &self.model_path)
            .finish()
    }
}

/**
 * \brief 接口配置的脱敏视图，用于列表展示。
 */
#[derive(Debug, Clone, Serialize)]
pub struct AiConfigSummary {
    pub api_name: String,
    #[serde(rename = "type")]
    pub kind: ConfigKind,
    pub url_redacted: bool,
    pub model_path: Option<String>,
    pub params_json: Option<String>,
    pub updated_at: String,
}

/**
 * \brief 文献网站配置。
 */
#[derive(Debug, Clone)]
pub struct LiteratureSite {
    pub id: i64,
    pub site_name: String,
    pub url: String,
    /** \brief 加密后的 Authorization 头 */
    pub auth_ciphertext: Option<String>,
    pub updated_at: String,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/**
 * \brief 研究方向的综述状态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionStatus {
    ReviewPending,
    ReviewGenerated,
}

impl DirectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectionStatus::ReviewPending => "review_pending",
            DirectionStatus::ReviewGenerated => "review_generated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "review_pending" => Some(DirectionStatus::ReviewPending),
            "review_generated" => Some(DirectionStatus::ReviewGenerated),
            _ => None,
        }
    }
}
