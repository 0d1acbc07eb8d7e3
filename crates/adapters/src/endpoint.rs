use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::AdapterError;

static VERSION_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/v\d+$").expect("valid regex for version suffix"));

/// Appends `/v1` unless a version segment is present. A trailing `#` keeps
/// the URL as written, minus the `#`.
pub fn check_base_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if trimmed.ends_with('#') {
        return trimmed.trim_end_matches('#').to_string();
    }

    if !VERSION_SUFFIX_RE.is_match(trimmed.trim_end_matches('/')) && !trimmed.contains("/v1") {
        let without_slash = trimmed.trim_end_matches('/');
        format!("{}/v1", without_slash)
    } else {
        trimmed.trim_end_matches('/').to_string()
    }
}

/// Default endpoint for a known interface format; `None` for formats that
/// always need an explicit base URL.
pub fn default_base_url(interface_format: &str) -> Option<&'static str> {
    match interface_format.trim().to_lowercase().as_str() {
        "openai" => Some("https://api.openai.com/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "ollama" => Some("http://localhost:11434/v1"),
        "lm studio" | "ml studio" => Some("http://localhost:1234/v1"),
        "grok" => Some("https://api.x.ai/v1"),
        "阿里云百炼" => Some("https://dashscope.aliyuncs.com/compatible-mode/v1"),
        "火山引擎" => Some("https://ark.cn-beijing.volces.com/api/v3"),
        "硅基流动" => Some("https://api.siliconflow.cn/v1"),
        _ => None,
    }
}

pub fn is_supported_format(interface_format: &str) -> bool {
    let normalized = interface_format.trim().to_lowercase();
    default_base_url(&normalized).is_some()
        || matches!(
            normalized.as_str(),
            "" | "default" | "openai-compatible" | "openai compatible" | "中转"
        )
}

/// The configured base URL, or the format's default, normalised.
pub fn resolve_base_url(base_url: &str, interface_format: &str) -> Result<String, AdapterError> {
    if !is_supported_format(interface_format) {
        return Err(AdapterError::InvalidConfig(format!(
            "unknown interface_format: {}",
            interface_format
        )));
    }
    let raw = if base_url.trim().is_empty() {
        default_base_url(interface_format).unwrap_or_default()
    } else {
        base_url
    };
    let resolved = check_base_url(raw);
    if resolved.is_empty() {
        return Err(AdapterError::InvalidConfig(
            "base_url must not be empty".to_string(),
        ));
    }
    Ok(resolved)
}

pub fn chat_completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_base_url_appends_v1_when_missing() {
        assert_eq!(
            check_base_url("https://example.com"),
            "https://example.com/v1"
        );
        assert_eq!(
            check_base_url("https://example.com/"),
            "https://example.com/v1"
        );
    }

    #[test]
    fn check_base_url_keeps_existing_version() {
        assert_eq!(
            check_base_url("https://example.com/v2"),
            "https://example.com/v2"
        );
        assert_eq!(
            check_base_url("https://relay.example.com/v1/"),
            "https://relay.example.com/v1"
        );
    }

    #[test]
    fn check_base_url_respects_hash_suffix() {
        assert_eq!(
            check_base_url("https://example.com/api/#"),
            "https://example.com/api/"
        );
    }

    #[test]
    fn formats_fall_back_to_default_urls() {
        assert_eq!(
            resolve_base_url("", "DeepSeek").unwrap(),
            "https://api.deepseek.com/v1"
        );
        assert_eq!(
            resolve_base_url("http://10.0.0.2:8000", "openai").unwrap(),
            "http://10.0.0.2:8000/v1"
        );
        assert_eq!(
            resolve_base_url("", "火山引擎").unwrap(),
            "https://ark.cn-beijing.volces.com/api/v3"
        );
    }

    #[test]
    fn relay_format_requires_url() {
        assert!(matches!(
            resolve_base_url(" ", "中转"),
            Err(AdapterError::InvalidConfig(_))
        ));
        assert!(matches!(
            resolve_base_url("https://x.test", "gemini"),
            Err(AdapterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn chat_url_joins_path() {
        assert_eq!(
            chat_completions_url("https://api.openai.com/v1/"),
            "https://api.openai.com/v1/chat/completions"
        );
    }
}
