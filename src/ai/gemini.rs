/// Gemini 摘要客户端
///
/// 一次请求同时生成要点摘要和回复草稿。返回的是自由文本，
/// 约定包含 **SUMMARY** 与 **DRAFT REPLY** 两段，但不做结构校验。
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;

use crate::config::Settings;
use crate::utils::http_client;

/// 邮件正文为空时的固定回复
pub const EMPTY_BODY_REPLY: &str = "No email content to summarize.";

/// 最多尝试次数（含首次）
const MAX_ATTEMPTS: u32 = 3;

/// 首次重试前的等待时间，之后每次翻倍
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// 摘要失败原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SummarizeError {
    #[error("未配置 Gemini API 密钥")]
    MissingApiKey,

    #[error("网络错误: {0}")]
    Network(String),

    #[error("Gemini API 返回错误 {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Gemini 响应格式异常: {0}")]
    Malformed(String),
}

impl SummarizeError {
    /// 网络错误、429 和 5xx 可以重试
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// 摘要服务
pub trait Summarizer: Send + Sync + 'static {
    fn summarize(&self, body: &str) -> impl Future<Output = Result<String, SummarizeError>> + Send;
}

/// Gemini `generateContent` 客户端（无状态，可在多个任务间共享）
#[derive(Debug, Clone)]
pub struct GeminiClient {
    api_key: String,
    endpoint: String,
    retry_delay: Duration,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: endpoint.into(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.api_key.clone(), settings.gemini_endpoint.clone())
    }

    #[cfg(test)]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn request_once(&self, prompt: &str) -> Result<String, SummarizeError> {
        let payload = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": 0.2,
                "maxOutputTokens": 2048
            }
        });

        let response = http_client::get_client()
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(|e| SummarizeError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SummarizeError::Network(e.to_string()))?;
        let body: Value = serde_json::from_str(&text).map_err(|e| {
            if status.is_success() {
                SummarizeError::Malformed(e.to_string())
            } else {
                SummarizeError::Api {
                    status: status.as_u16(),
                    message: text.chars().take(200).collect(),
                }
            }
        })?;

        if !status.is_success() || body.get("error").is_some() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("Unknown Error")
                .to_string();
            return Err(SummarizeError::Api {
                status: status.as_u16(),
                message,
            });
        }

        extract_text(&body)
    }
}

impl Summarizer for GeminiClient {
    async fn summarize(&self, body: &str) -> Result<String, SummarizeError> {
        if body.trim().is_empty() {
            return Ok(EMPTY_BODY_REPLY.to_string());
        }
        if self.api_key.trim().is_empty() {
            return Err(SummarizeError::MissingApiKey);
        }

        let prompt = build_prompt(body);
        let mut delay = self.retry_delay;
        let mut attempt = 1;

        loop {
            match self.request_once(&prompt).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(
                        "Gemini 请求失败（第 {} 次）: {}，{:?} 后重试",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("❌ Gemini 摘要失败: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

fn build_prompt(body: &str) -> String {
    format!(
        "You are an AI assistant.
Please:
1. Summarize the following email in concise bullet points using markdown formatting.
2. Draft a professional reply email based on the summary.

Formatting requirements:
- Use **bold** for important points and for section headings (e.g. **SUMMARY**, **DRAFT REPLY**).
- Use * for bullet lists.
- Use inline Markdown bold (`**...**`) for the section headers rather than markdown heading markers like `##`.
- Format your response for readability and clarity.

Email:
{}
",
        body
    )
}

/// `candidates[0].content.parts[0].text`，兼容 `content.text`
fn extract_text(body: &Value) -> Result<String, SummarizeError> {
    let content = body["candidates"]
        .get(0)
        .map(|c| &c["content"])
        .ok_or_else(|| SummarizeError::Malformed("响应中没有 candidates".to_string()))?;

    content["parts"][0]["text"]
        .as_str()
        .or_else(|| content["text"].as_str())
        .map(str::to_string)
        .ok_or_else(|| SummarizeError::Malformed("candidate 中没有文本".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const REPLY: &str = r#"{"candidates":[{"content":{"parts":[{"text":"**SUMMARY**\n* hi\n\n**DRAFT REPLY**\nThanks"}]}}]}"#;

    fn client(server: &mockito::ServerGuard) -> GeminiClient {
        GeminiClient::new("test-key", format!("{}/generate", server.url()))
            .with_retry_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_summarize_posts_prompt_with_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/generate")
            .match_query(Matcher::UrlEncoded("key".into(), "test-key".into()))
            .match_body(Matcher::Regex("Quarterly numbers".into()))
            .with_header("content-type", "application/json")
            .with_body(REPLY)
            .create_async()
            .await;

        let text = client(&server).summarize("Quarterly numbers attached").await.unwrap();
        mock.assert_async().await;
        assert!(text.contains("**SUMMARY**"));
        assert!(text.contains("**DRAFT REPLY**"));
    }

    #[tokio::test]
    async fn test_empty_body_skips_request() {
        let server = mockito::Server::new_async().await;
        let text = client(&server).summarize("   \n").await.unwrap();
        assert_eq!(text, EMPTY_BODY_REPLY);

        let no_key = GeminiClient::new("", "http://127.0.0.1:9/");
        assert_eq!(no_key.summarize("").await.unwrap(), EMPTY_BODY_REPLY);
        assert_eq!(
            no_key.summarize("body").await,
            Err(SummarizeError::MissingApiKey)
        );
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/generate")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body(r#"{"error":{"message":"overloaded"}}"#)
            .expect(MAX_ATTEMPTS as usize)
            .create_async()
            .await;

        let err = client(&server).summarize("body").await.unwrap_err();
        failing.assert_async().await;
        assert_eq!(
            err,
            SummarizeError::Api {
                status: 503,
                message: "overloaded".into()
            }
        );
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/generate")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error":{"message":"API key not valid"}}"#)
            .expect(1)
            .create_async()
            .await;

        let err = client(&server).summarize("body").await.unwrap_err();
        mock.assert_async().await;
        assert!(!err.is_transient());
        assert!(err.to_string().contains("API key not valid"));
    }

    #[test]
    fn test_extract_text_variants() {
        let nested = serde_json::json!({"candidates":[{"content":{"parts":[{"text":"a"}]}}]});
        let flat = serde_json::json!({"candidates":[{"content":{"text":"b"}}]});
        let empty = serde_json::json!({"candidates":[]});

        assert_eq!(extract_text(&nested).unwrap(), "a");
        assert_eq!(extract_text(&flat).unwrap(), "b");
        assert!(matches!(extract_text(&empty), Err(SummarizeError::Malformed(_))));
    }

    #[test]
    fn test_prompt_requests_both_sections() {
        let prompt = build_prompt("hello");
        assert!(prompt.contains("**SUMMARY**"));
        assert!(prompt.contains("**DRAFT REPLY**"));
        assert!(prompt.ends_with("hello\n"));
    }
}
