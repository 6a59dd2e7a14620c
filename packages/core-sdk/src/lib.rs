pub mod anchoring;
pub mod attachments;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod literature;
pub mod llm;
pub mod models;
pub mod prompts;
pub mod server;
pub mod sites;
pub mod telemetry;
pub mod vault;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::anchoring::{AnchorRequest, AnchoringSession, Orchestrator, SessionStore, Stage};
    pub use crate::config::AppConfig;
    pub use crate::db::{self, SqliteStore};
    pub use crate::gateway::{CallOptions, CallStatus, CompletionResult, Gateway};
    pub use crate::literature::LiteratureRecord;
    pub use crate::server;
    pub use crate::telemetry;
    pub use crate::vault::Vault;
}
