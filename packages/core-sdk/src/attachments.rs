use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::AttachmentError;

const PDF_MAGIC: &[u8] = b"%PDF-";

/**
 * \brief 上传的附件。
 */
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn is_pdf(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.eq_ignore_ascii_case("application/pdf"))
            .unwrap_or(false)
            || self.name.to_ascii_lowercase().ends_with(".pdf")
            || self.bytes.starts_with(PDF_MAGIC)
    }
}

/**
 * \brief 提取附件纯文本：PDF 走二进制到文本的抽取，其余按 UTF-8 文本处理。
 */
pub fn extract_text(attachment: &Attachment) -> Result<String, AttachmentError> {
    if attachment.is_pdf() {
        extract_pdf(&attachment.bytes)
    } else {
        String::from_utf8(attachment.bytes.clone()).map_err(|_| AttachmentError::NotUtf8)
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, AttachmentError> {
    // pdf-extract can panic on malformed documents
    match catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(bytes))) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(AttachmentError::Pdf(e.to_string())),
        Err(_) => Err(AttachmentError::Pdf("malformed PDF".to_string())),
    }
}

/**
 * \brief 把所有附件文本以 `[File: name]` 标记拼接后追加到提示词。
 *
 * 单个附件抽取失败不会中断整批，改用占位文本；拼接前去掉 NUL 字节。
 */
pub fn append_to_prompt(prompt: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return prompt.to_string();
    }
    let mut blocks = String::new();
    for attachment in attachments {
        let text = match extract_text(attachment) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(file = %attachment.name, error = %err, "attachment extraction failed");
                format!("[extraction failed: {}]", err)
            }
        };
        let text = text.replace('\0', "");
        blocks.push_str(&format!("[File: {}]\n{}\n---\n", attachment.name, text.trim_end()));
    }
    format!("{}\n\n{}", prompt, blocks)
}
