use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use scholaranchor_core_sdk::anchoring::{AnchorRequest, CallerGateway, Orchestrator, SessionStore};
use scholaranchor_core_sdk::attachments::Attachment;
use scholaranchor_core_sdk::config::{self, AppConfig};
use scholaranchor_core_sdk::db::{self, SqliteStore};
use scholaranchor_core_sdk::gateway::{CallOptions, Gateway};
use scholaranchor_core_sdk::literature::LiteratureRecord;
use scholaranchor_core_sdk::models::{ConfigKind, StoredCredential};
use scholaranchor_core_sdk::prompts::PromptKind;
use scholaranchor_core_sdk::server::{self, DEFAULT_CALLER};
use scholaranchor_core_sdk::telemetry;
use scholaranchor_core_sdk::vault::Vault;

/**
 * \brief CLI 程序入口：服务启动、接口配置与本地锚定。
 */
#[derive(Parser, Debug)]
#[command(name = "scholaranchor", version, about = "ScholarAnchor literature anchoring")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动本地 HTTP 服务。
     */
    Serve {
        #[arg(long)]
        addr: Option<String>,
    },

    /**
     * \brief 生成 32 字节随机密钥（hex），用于 CONFIG_ENC_KEY。
     */
    Keygen,

    /**
     * \brief 保存一个 AI 接口配置，地址与密钥加密入库。
     */
    ConfigAi {
        #[arg(long)]
        api_name: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value = "cloud")]
        kind: String,
        #[arg(long)]
        model_path: Option<String>,
    },

    /**
     * \brief 保存一个文献网站。
     */
    ConfigSite {
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        auth: Option<String>,
    },

    /** \brief 开关遥测文件输出。 */
    Telemetry {
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },

    /**
     * \brief 通过网关发送一次提示词，可附带文件。
     */
    Prompt {
        #[arg(long)]
        api_name: String,
        #[arg(long)]
        prompt: String,
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        #[arg(long, default_value_t = false)]
        debug: bool,
    },

    /**
     * \brief 在本地执行一次完整的检索 → 综述锚定流程。
     * \param records 基础文献 JSON 文件（LiteratureRecord 数组）
     */
    Anchor {
        #[arg(long)]
        direction_id: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        keywords: String,
        #[arg(long)]
        api: String,
        #[arg(long)]
        review_api: Option<String>,
        #[arg(long = "site")]
        sites: Vec<String>,
        #[arg(long)]
        records: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Keygen = cli.command {
        println!("{}", Vault::generate_key_hex());
        return Ok(());
    }

    let mut cfg = AppConfig::from_env().context("load configuration failed")?;
    let store = SqliteStore::open(&cfg.db_path).context("open database failed")?;
    let conn = store.conn().context("open database failed")?;
    telemetry::set_enabled(db::get_telemetry_enabled(&conn).unwrap_or(false));

    match cli.command {
        Commands::Keygen => {}
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                cfg.addr = addr;
            }
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                    trigger.cancel();
                }
            });
            server::run(cfg, shutdown).await?;
        }
        Commands::ConfigAi {
            api_name,
            url,
            api_key,
            model,
            kind,
            model_path,
        } => {
            let kind = ConfigKind::parse(&kind).context("kind must be cloud or local")?;
            let params_json = model.map(|m| serde_json::json!({ "model": m }).to_string());
            let cred = StoredCredential {
                api_name: api_name.clone(),
                kind,
                endpoint_ciphertext: cfg.vault.encrypt(url.as_deref()).context("encrypt url failed")?,
                api_key_ciphertext: cfg.vault.encrypt(api_key.as_deref()).context("encrypt key failed")?,
                model_path,
                params_json,
            };
            db::upsert_ai_config(&conn, DEFAULT_CALLER, &cred).context("save ai config failed")?;
            println!("Saved ai config {} ({})", api_name, kind.as_str());
        }
        Commands::ConfigSite { name, url, auth } => {
            let auth_enc = cfg.vault.encrypt(auth.as_deref()).context("encrypt auth failed")?;
            let id = db::upsert_site(&conn, DEFAULT_CALLER, &name, &url, auth_enc.as_deref())
                .context("save site failed")?;
            println!("Saved site id={} ({} | {})", id, name, url);
        }
        Commands::Telemetry { enabled } => {
            db::set_telemetry_enabled(&conn, enabled).context("save telemetry failed")?;
            println!("Telemetry {}", if enabled { "enabled" } else { "disabled" });
        }
        Commands::Prompt {
            api_name,
            prompt,
            files,
            debug,
        } => {
            let mut attachments = Vec::with_capacity(files.len());
            for path in files {
                let bytes = std::fs::read(&path).with_context(|| format!("read {} failed", path.display()))?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "attachment".to_string());
                attachments.push(Attachment {
                    name,
                    content_type: None,
                    bytes,
                });
            }
            let gateway = Gateway::new(Arc::new(cfg.vault.clone()), Arc::new(store.clone())).with_timeouts(cfg.timeouts);
            let opts = CallOptions {
                debug,
                ..Default::default()
            };
            let result = gateway
                .complete(DEFAULT_CALLER, &api_name, &prompt, &attachments, &opts)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result.envelope())?);
        }
        Commands::Anchor {
            direction_id,
            name,
            keywords,
            api,
            review_api,
            sites,
            records,
        } => {
            let raw = std::fs::read_to_string(&records)
                .with_context(|| format!("read {} failed", records.display()))?;
            let base_records: Vec<LiteratureRecord> =
                serde_json::from_str(&raw).context("records file must be a JSON array of literature records")?;

            let req = AnchorRequest {
                direction_id: direction_id.clone(),
                direction_name: name,
                keywords,
                search_api: api,
                review_api,
                sites,
                base_records,
                search_template: db::get_prompt_template(&conn, DEFAULT_CALLER, PromptKind::Search)?,
                review_template: db::get_prompt_template(&conn, DEFAULT_CALLER, PromptKind::Review)?,
            };
            if let Err(err) = Orchestrator::validate(&req) {
                bail!("{}", err);
            }

            let gateway = Arc::new(
                Gateway::new(Arc::new(cfg.vault.clone()), Arc::new(store.clone())).with_timeouts(cfg.timeouts),
            );
            let orchestrator = Orchestrator::new(
                Arc::new(CallerGateway::new(gateway, DEFAULT_CALLER)),
                Arc::new(store.clone()),
            );
            let sessions = SessionStore::new();
            let (mut session, token) = sessions.begin(&direction_id)?;
            let trigger = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    trigger.cancel();
                }
            });

            orchestrator.run(&mut session, &req, &token, None).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
    }

    Ok(())
}
