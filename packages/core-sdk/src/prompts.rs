use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::literature::LiteratureRecord;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(\w+)\}\}").expect("placeholder pattern compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Search,
    Review,
    DeepResearch,
}

impl PromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::Search => "search",
            PromptKind::Review => "review",
            PromptKind::DeepResearch => "deep_research",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "search" => Some(PromptKind::Search),
            "review" => Some(PromptKind::Review),
            "deep_research" => Some(PromptKind::DeepResearch),
            _ => None,
        }
    }

    /**
     * \brief 内置默认模板，存储的模板为空白时使用。
     */
    pub fn default_template(&self) -> &'static str {
        match self {
            PromptKind::Search => DEFAULT_SEARCH_TEMPLATE,
            PromptKind::Review => DEFAULT_REVIEW_TEMPLATE,
            PromptKind::DeepResearch => DEFAULT_DEEP_RESEARCH_TEMPLATE,
        }
    }
}

const DEFAULT_SEARCH_TEMPLATE: &str = "研究方向：{{direction}}
关键词：{{keywords}}
文献网站：{{sites}}
已选基础文献（JSON）：
{{literature}}

请在上述文献网站中检索与该研究方向相关、且不在已选文献中的新文献。
只返回一个 JSON 数组，每个元素包含 title、author、source、year、doi 字段，不要输出其他说明。";

const DEFAULT_REVIEW_TEMPLATE: &str = "研究方向：{{direction}}
关键词：{{keywords}}
基础文献（JSON）：
{{literature}}
新检索文献（JSON）：
{{expanded}}

请基于以上全部文献撰写一篇 Markdown 格式的文献综述，包含：摘要、引言、方法、结果与讨论、结论、参考文献。";

const DEFAULT_DEEP_RESEARCH_TEMPLATE: &str = "研究方向：{{direction}}
关键词：{{keywords}}
文献网站：{{sites}}
参考文献（JSON）：
{{literature}}

请围绕该研究方向进行深入研究：梳理核心问题、主要方法流派、尚未解决的挑战与可能的创新点，并给出可验证的研究计划。";

/**
 * \brief 模板变量。基础文献只输出元数据字段，以控制提示词长度。
 */
#[derive(Debug, Clone, Default)]
pub struct PromptVars<'a> {
    pub direction: &'a str,
    pub keywords: &'a str,
    pub sites: &'a [String],
    pub literature: &'a [LiteratureRecord],
    pub expanded: &'a [LiteratureRecord],
}

/**
 * \brief 渲染提示词：简单插值，不是完整的模板语言。空白模板回退到内置默认值。
 */
pub fn render(kind: PromptKind, template: Option<&str>, vars: &PromptVars<'_>) -> String {
    let template = match template {
        Some(t) if !t.trim().is_empty() => t,
        _ => kind.default_template(),
    };

    let literature: Vec<_> = vars.literature.iter().map(|r| r.meta()).collect();
    let expanded: Vec<_> = vars.expanded.iter().map(|r| r.brief()).collect();

    // 单次从左到右替换，变量值里的占位符不会被再次展开
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures<'_>| match &caps[1] {
            "direction" => vars.direction.to_string(),
            "keywords" => vars.keywords.to_string(),
            "sites" => vars.sites.join(", "),
            "literature" => to_json(&literature),
            "expanded" => to_json(&expanded),
            _ => caps[0].to_string(),
        })
        .into_owned()
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "[]".to_string())
}
