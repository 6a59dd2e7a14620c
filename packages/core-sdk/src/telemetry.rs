use std::{fs::OpenOptions, io::Write, path::PathBuf};

use anyhow::Result;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

static TELEMETRY_ENABLED: Lazy<std::sync::RwLock<bool>> =
    Lazy::new(|| std::sync::RwLock::new(false));

const TRACE_FILE: &str = "scholaranchor-trace.log";

/**
 * \brief 更新遥测开关状态。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

/**
 * \brief 查询当前遥测开关状态。
 */
pub fn is_enabled() -> bool {
    TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief 锚定流程的追踪记录，仅用于事后排查，从不参与流程控制。
 */
#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    #[serde(rename = "traceId")]
    pub trace_id: String,
    pub step: String,
    pub at: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl TraceRecord {
    pub fn new(trace_id: &str, step: &str, detail: Value) -> Self {
        let at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        Self {
            trace_id: trace_id.to_string(),
            step: step.to_string(),
            at,
            detail,
        }
    }
}

/**
 * \brief 发出一条追踪记录：始终写入 tracing，开启遥测时追加到日志文件。
 */
pub fn emit(record: &TraceRecord) {
    tracing::info!(
        target: "scholaranchor::trace",
        trace_id = %record.trace_id,
        step = %record.step,
        detail = %record.detail,
    );
    if !is_enabled() {
        return;
    }
    if let Err(err) = append_json_line(record) {
        eprintln!("telemetry write failed: {}", err);
    }
}

fn append_json_line(record: &TraceRecord) -> Result<()> {
    let log_dir = PathBuf::from("logs");
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    let line = serde_json::to_string(record)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(TRACE_FILE))?;
    writeln!(file, "{}", line)?;
    Ok(())
}
