//! 松散结构回复的解码流水线
//!
//! 围栏剥离 → 花括号定位 → JSON 解析 → 正则兜底，每一段都可单独调用与测试。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::dataset::{normalize_sentinel, NOT_AVAILABLE};

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("JSON value is not an object")]
    NotObject,
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("static regex")
    })
}

fn lead_in_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(I found|Here is|The email|Contact|Search results)").expect("static regex")
    })
}

fn page_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\{[^{}]*"business_name"[^{}]*\}"#).expect("static regex"))
}

/// 去掉 Markdown 代码围栏（```json / ```）并 trim
pub fn strip_fences(text: &str) -> String {
    text.replace("```json", "").replace("```", "").trim().to_string()
}

/// 第一个 `{` 到最后一个 `}`；找不到成对花括号时原样返回
pub fn locate_object(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

/// 解析为 JSON 对象
pub fn parse_object(text: &str) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        _ => Err(DecodeError::NotObject),
    }
}

/// 完整流水线：围栏剥离 → 花括号定位 → 解析
pub fn decode_object(raw: &str) -> Result<Map<String, Value>, DecodeError> {
    let cleaned = strip_fences(raw);
    parse_object(locate_object(&cleaned))
}

/// 读取字符串字段：缺失或 null 为 "N/A"，非字符串取其 JSON 文本；结果经过哨兵归一
pub fn string_field(map: &Map<String, Value>, key: &str) -> String {
    match map.get(key) {
        None | Some(Value::Null) => NOT_AVAILABLE.to_string(),
        Some(Value::String(s)) => normalize_sentinel(s),
        Some(other) => normalize_sentinel(&other.to_string()),
    }
}

/// 文本中的第一个 e-mail 地址
pub fn find_email(text: &str) -> Option<String> {
    email_re().find(text).map(|m| m.as_str().to_string())
}

/// 按字符截取前 n 个
pub fn take_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

/// 叙述性回复的背景摘要：超过 100 字符时去掉引导语取前 200 字符，否则 "N/A"
pub fn trim_background(text: &str) -> String {
    if text.chars().count() <= 100 {
        return NOT_AVAILABLE.to_string();
    }
    let cleaned = lead_in_re().replace_all(text, "");
    let summary = take_chars(&cleaned, 200);
    let summary = summary.trim();
    if summary.is_empty() {
        NOT_AVAILABLE.to_string()
    } else {
        summary.to_string()
    }
}

/// 在整页文本中寻找包含 business_name 的 JSON 片段（长度需超过 50 字符）；取最靠后的一个
pub fn page_json_candidate(page_text: &str) -> Option<String> {
    page_json_re()
        .find_iter(page_text)
        .map(|m| m.as_str())
        .filter(|s| s.len() > 50)
        .last()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_json_decodes() {
        let raw = "```json\n{\"Email\":\"a@b.com\",\"Background\":\"N/A\"}\n```";
        let map = decode_object(raw).unwrap();
        assert_eq!(string_field(&map, "Email"), "a@b.com");
        assert_eq!(string_field(&map, "Background"), "N/A");
        assert_eq!(string_field(&map, "Missing"), "N/A");
    }

    #[test]
    fn test_locate_object_with_surrounding_prose() {
        let text = "Sure! Here you go: {\"a\": {\"b\": 1}} hope that helps";
        assert_eq!(locate_object(text), "{\"a\": {\"b\": 1}}");
        assert_eq!(locate_object("no braces"), "no braces");
        assert_eq!(locate_object("} backwards {"), "} backwards {");
    }

    #[test]
    fn test_non_object_json_rejected() {
        assert!(matches!(parse_object("[1,2]"), Err(DecodeError::NotObject)));
        assert!(matches!(parse_object("{oops"), Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_sentinel_phrases_normalized_in_fields() {
        let map = decode_object(r#"{"email": " Not Found ", "background": "", "n": 5}"#).unwrap();
        assert_eq!(string_field(&map, "email"), "N/A");
        assert_eq!(string_field(&map, "background"), "N/A");
        assert_eq!(string_field(&map, "n"), "5");
    }

    #[test]
    fn test_find_email() {
        assert_eq!(
            find_email("reach them at info@joes-cafe.com or call").as_deref(),
            Some("info@joes-cafe.com")
        );
        assert_eq!(find_email("nothing here"), None);
    }

    #[test]
    fn test_trim_background() {
        assert_eq!(trim_background("short reply"), "N/A");
        let long = format!("I found that {}", "x".repeat(300));
        let bg = trim_background(&long);
        assert!(!bg.contains("I found"));
        assert!(bg.chars().count() <= 200);
        assert!(bg.starts_with("that"));
    }

    #[test]
    fn test_page_json_candidate_requires_length() {
        let short = r#"{"business_name":"A"}"#;
        assert_eq!(page_json_candidate(short), None);
        let page = format!(
            "Copilot\n{}\nmore text {{\"business_name\": \"Joe's Cafe\", \"email\": \"joe@cafe.com\", \"search_status\": \"success\"}}",
            short
        );
        let found = page_json_candidate(&page).unwrap();
        assert!(found.contains("joe@cafe.com"));

        // 页面上先出现的提示词模板不会盖过后出现的回复
        let template = r#"{"business_name": "X", "email": "found-email@example.com", "search_status": "success"}"#;
        let page = format!("{}\n{}", template, found);
        assert!(page_json_candidate(&page).unwrap().contains("joe@cafe.com"));
    }
}
