use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm;

static DOI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^10\.\d{4,9}/[-._;()/:A-Za-z0-9]+$").expect("DOI pattern compiles")
});

const CJK_PUNCTUATION: &str = "，。、；：！？（）【】《》〈〉「」『』“”‘’—…·～";

const DOI_PREFIXES: &[&str] = &[
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
    "doi:",
];

/**
 * \brief 从模型回答中解析出的文献条目（未去重）。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiteratureItem {
    pub title: String,
    pub author: Option<String>,
    pub source: Option<String>,
    pub year: Option<String>,
    pub doi: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginKind {
    #[default]
    Uploaded,
    Ai,
}

fn default_selected() -> bool {
    true
}

/**
 * \brief 会话中的文献记录。去重键由 DOI 或标题推导，从不单独存储。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiteratureRecord {
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub doi_valid: bool,
    #[serde(default = "default_selected")]
    pub selected: bool,
    #[serde(default)]
    pub origin_kind: OriginKind,
}

/**
 * \brief 写入提示词的文献元数据，只含 title/author/source/year/doi。
 */
#[derive(Debug, Clone, Serialize)]
pub struct LiteratureMeta<'a> {
    pub title: &'a str,
    pub author: Option<&'a str>,
    pub source: Option<&'a str>,
    pub year: Option<&'a str>,
    pub doi: Option<&'a str>,
}

/**
 * \brief 综述阶段使用的精简条目。
 */
#[derive(Debug, Clone, Serialize)]
pub struct LiteratureBrief<'a> {
    pub title: &'a str,
    pub author: Option<&'a str>,
    pub year: Option<&'a str>,
}

impl LiteratureRecord {
    pub fn from_item(item: LiteratureItem, origin_kind: OriginKind) -> Self {
        let doi = item.doi.as_deref().map(clean_doi).filter(|d| !d.is_empty());
        let doi_valid = doi.as_deref().map(is_valid_doi).unwrap_or(false);
        Self {
            title: item.title.trim().to_string(),
            author: item.author,
            source: item.source,
            year: item.year,
            doi,
            doi_valid,
            selected: true,
            origin_kind,
        }
    }

    pub fn uploaded(title: &str) -> Self {
        Self::from_item(
            LiteratureItem {
                title: title.to_string(),
                ..Default::default()
            },
            OriginKind::Uploaded,
        )
    }

    /**
     * \brief 去重键：DOI 合法时为 `doi:<小写 DOI>`，否则为 `t:<规范化标题>`。
     */
    pub fn dedupe_key(&self) -> String {
        match self.doi.as_deref().map(clean_doi) {
            Some(doi) if is_valid_doi(&doi) => format!("doi:{}", doi.to_lowercase()),
            _ => title_key(&self.title),
        }
    }

    pub fn meta(&self) -> LiteratureMeta<'_> {
        LiteratureMeta {
            title: &self.title,
            author: self.author.as_deref(),
            source: self.source.as_deref(),
            year: self.year.as_deref(),
            doi: self.doi.as_deref(),
        }
    }

    pub fn brief(&self) -> LiteratureBrief<'_> {
        LiteratureBrief {
            title: &self.title,
            author: self.author.as_deref(),
            year: self.year.as_deref(),
        }
    }
}

/**
 * \brief 标题规范化：小写、标点替换为空白、空白（含全角空格）折叠为单个 ASCII 空格。幂等。
 */
pub fn normalize_title(t: &str) -> String {
    let lowered = t.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut pending_space = false;
    for ch in lowered.chars() {
        if ch.is_whitespace() || ch.is_ascii_punctuation() || CJK_PUNCTUATION.contains(ch) {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(ch);
    }
    out
}

/**
 * \brief 标题去重键：在规范化标题基础上去掉分隔空格，"Deep-Learning X" 与 "DeepLearning X" 视为同一篇。
 */
pub fn title_key(title: &str) -> String {
    format!("t:{}", normalize_title(title).replace(' ', ""))
}

pub fn is_valid_doi(s: &str) -> bool {
    DOI_RE.is_match(s.trim())
}

/**
 * \brief 去掉 `doi:`、`https://doi.org/` 等前缀。
 */
pub fn clean_doi(raw: &str) -> String {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    for prefix in DOI_PREFIXES {
        if lower.starts_with(prefix) {
            return trimmed[prefix.len()..].trim().to_string();
        }
    }
    trimmed.to_string()
}

/**
 * \brief 按去重键过滤已有记录：同键只保留第一条，接受的键写入 `existing_keys`。
 */
pub fn dedupe_records(existing_keys: &mut HashSet<String>, records: &[LiteratureRecord]) -> Vec<LiteratureRecord> {
    records
        .iter()
        .filter(|r| existing_keys.insert(r.dedupe_key()))
        .cloned()
        .collect()
}

/**
 * \brief 过滤与已有集合或同批次前序条目冲突的候选；接受的键立即写入 `existing_keys`。
 */
pub fn dedupe(
    existing_keys: &mut HashSet<String>,
    candidates: Vec<LiteratureItem>,
) -> Vec<LiteratureRecord> {
    let mut accepted = Vec::new();
    for item in candidates {
        let record = LiteratureRecord::from_item(item, OriginKind::Ai);
        if record.title.is_empty() {
            continue;
        }
        if existing_keys.insert(record.dedupe_key()) {
            accepted.push(record);
        }
    }
    accepted
}

/**
 * \brief 从任意模型回答中解析文献列表。依次尝试：JSON 数组、包含数组属性的对象、
 * chat-completion 包络（内容可带代码块）、带代码块或前后说明文字的纯文本。
 * 任何阶段解析失败都只会得到空列表。
 */
pub fn parse_answer(raw: &str) -> Vec<LiteratureItem> {
    let text = raw.trim();
    parse_array(text)
        .or_else(|| parse_wrapped(text))
        .or_else(|| parse_envelope(text))
        .or_else(|| parse_unwrapped(text))
        .unwrap_or_default()
}

fn parse_array(text: &str) -> Option<Vec<LiteratureItem>> {
    match serde_json::from_str::<Value>(text).ok()? {
        Value::Array(items) => non_empty(items_from(&items)),
        _ => None,
    }
}

fn parse_wrapped(text: &str) -> Option<Vec<LiteratureItem>> {
    match serde_json::from_str::<Value>(text).ok()? {
        Value::Object(map) if !map.contains_key("choices") => {
            let items = map.values().find_map(|v| v.as_array())?;
            non_empty(items_from(items))
        }
        _ => None,
    }
}

fn parse_envelope(text: &str) -> Option<Vec<LiteratureItem>> {
    let value: Value = serde_json::from_str(text).ok()?;
    let content = llm::parse_choice(&value)?.content;
    if content.trim().is_empty() {
        return None;
    }
    parse_unwrapped(&content)
}

fn parse_unwrapped(text: &str) -> Option<Vec<LiteratureItem>> {
    let inner = strip_code_fence(text);
    parse_array(&inner)
        .or_else(|| parse_wrapped(&inner))
        .or_else(|| {
            let start = inner.find('[')?;
            let end = inner.rfind(']')?;
            if end <= start {
                return None;
            }
            parse_array(&inner[start..=end])
        })
}

fn non_empty(items: Vec<LiteratureItem>) -> Option<Vec<LiteratureItem>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn items_from(values: &[Value]) -> Vec<LiteratureItem> {
    values.iter().filter_map(item_from_value).collect()
}

fn item_from_value(v: &Value) -> Option<LiteratureItem> {
    let obj = v.as_object()?;
    let title = text_field(obj, &["title", "name"])?;
    Some(LiteratureItem {
        title,
        author: author_field(obj),
        source: text_field(obj, &["source", "journal", "venue", "publisher"]),
        year: text_field(obj, &["year", "published", "date"]),
        doi: text_field(obj, &["doi", "DOI"]),
    })
}

fn text_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn author_field(obj: &Map<String, Value>) -> Option<String> {
    let value = obj.get("author").or_else(|| obj.get("authors"))?;
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Array(list) => {
            let names: Vec<String> = list
                .iter()
                .filter_map(|a| match a {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Object(o) => o.get("name").and_then(|n| n.as_str()).map(|s| s.to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect();
            if names.is_empty() {
                None
            } else {
                Some(names.join(", "))
            }
        }
        _ => None,
    }
}

/**
 * \brief 提取文本中第一个 ``` 代码块的内容；没有代码块时返回原文。
 */
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim().to_string();
        }
    }
    trimmed.to_string()
}

/**
 * \brief 仅当整个回答被一个代码块包裹时去掉外层围栏，正文内部的代码块保持不变。
 */
pub fn unwrap_outer_fence(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") || !trimmed.ends_with("```") || trimmed.len() < 6 {
        return trimmed.to_string();
    }
    let inner = &trimmed[3..trimmed.len() - 3];
    let body = match inner.find('\n') {
        Some(i) => &inner[i + 1..],
        None => inner,
    };
    body.trim().to_string()
}
