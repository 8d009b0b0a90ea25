/// Gmail API 调用模块
///
/// 列出收件箱主要分类下的最近邮件，并读取主题、发件人与正文。
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use std::future::Future;

use crate::config::oauth_config::OAuthConfig;
use crate::config::storage::CredentialStore;
use crate::mail::gmail::token::TokenManager;
use crate::mail::gmail::types::{EmailRecord, EmailStore, FetchedMessage, MessageId};
use crate::utils::http_client;

/// Gmail API 根地址
const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// HTML 转纯文本时的行宽
const HTML_TEXT_WIDTH: usize = 100;

const NO_SUBJECT: &str = "(无主题)";
const UNKNOWN_SENDER: &str = "(未知发件人)";

/// 收件箱获取层
pub trait Mailbox: Send + Sync {
    /// 最近 `n` 封邮件的 ID（按收件箱顺序）
    fn list_recent(&self, n: u32) -> impl Future<Output = Result<Vec<MessageId>>> + Send;

    fn fetch(&self, id: &MessageId) -> impl Future<Output = Result<FetchedMessage>> + Send;
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    payload: Option<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct PartBody {
    data: Option<String>,
}

/// Gmail API 客户端
pub struct GmailApiClient {
    access_token: String,
    base_url: String,
}

impl GmailApiClient {
    /// 创建新的 Gmail API 客户端
    pub fn new(access_token: String) -> Self {
        Self {
            access_token,
            base_url: GMAIL_API_BASE.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// 读取已保存的凭据（必要时刷新）并创建客户端
    pub async fn connect(store: CredentialStore, oauth_config: OAuthConfig) -> Result<Self> {
        let mut manager = TokenManager::new(store, oauth_config)?;
        let token = manager.get_valid_token().await?;
        Ok(Self::new(token))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = http_client::get_client()
            .get(url)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await
            .context("请求 Gmail API 失败")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();

            if status == 401 {
                anyhow::bail!("Token 已过期或被撤销，请重新登录");
            }
            anyhow::bail!("Gmail API 返回错误 {}: {}", status, error_text);
        }

        response.json().await.context("解析 Gmail API 响应失败")
    }
}

impl Mailbox for GmailApiClient {
    async fn list_recent(&self, n: u32) -> Result<Vec<MessageId>> {
        tracing::debug!("正在获取最近 {} 封邮件...", n);

        let url = format!("{}/messages", self.base_url);
        let list: MessageList = self
            .get_json(
                &url,
                &[
                    ("labelIds", "INBOX".to_string()),
                    ("q", "category:primary".to_string()),
                    ("maxResults", n.to_string()),
                ],
            )
            .await?;

        Ok(list.messages.into_iter().map(|m| MessageId(m.id)).collect())
    }

    async fn fetch(&self, id: &MessageId) -> Result<FetchedMessage> {
        let url = format!("{}/messages/{}", self.base_url, id);
        let message: Message = self
            .get_json(&url, &[("format", "full".to_string())])
            .await
            .with_context(|| format!("读取邮件 {} 失败", id))?;

        let payload = message.payload.unwrap_or_default();
        Ok(FetchedMessage {
            subject: header(&payload, "Subject").unwrap_or(NO_SUBJECT).to_string(),
            sender: header(&payload, "From").unwrap_or(UNKNOWN_SENDER).to_string(),
            body: extract_body(&payload),
        })
    }
}

/// 加载收件箱：列出最近邮件并逐封读取
pub async fn load_inbox<M: Mailbox>(mailbox: &M, n: u32) -> Result<EmailStore> {
    let ids = mailbox.list_recent(n).await?;

    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        let message = mailbox.fetch(&id).await?;
        records.push(EmailRecord::new(id, message));
    }

    tracing::info!("✅ 已加载 {} 封邮件", records.len());
    Ok(EmailStore::new(records))
}

fn header<'a>(part: &'a MessagePart, name: &str) -> Option<&'a str> {
    part.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// 正文优先级：text/plain → text/html（转纯文本）→ payload 自身的 body
fn extract_body(payload: &MessagePart) -> String {
    if let Some(text) = find_part(payload, "text/plain").and_then(decode_part) {
        return text;
    }
    if let Some(html) = find_part(payload, "text/html").and_then(decode_part) {
        return html2text::from_read(html.as_bytes(), HTML_TEXT_WIDTH);
    }
    decode_part(payload).unwrap_or_default()
}

/// 深度优先查找第一个指定类型且有数据的子部分
fn find_part<'a>(part: &'a MessagePart, mime_type: &str) -> Option<&'a MessagePart> {
    part.parts.iter().find_map(|child| {
        let has_data = child.body.as_ref().is_some_and(|b| b.data.is_some());
        if child.mime_type == mime_type && has_data {
            Some(child)
        } else {
            find_part(child, mime_type)
        }
    })
}

fn decode_part(part: &MessagePart) -> Option<String> {
    let data = part.body.as_ref()?.data.as_deref()?;
    decode_base64url(data)
}

/// Gmail 使用 URL-safe base64，可能带也可能不带填充
fn decode_base64url(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn encode(text: &str) -> String {
        URL_SAFE_NO_PAD.encode(text)
    }

    fn part(json: serde_json::Value) -> MessagePart {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_plain_text_preferred_in_nested_parts() {
        let payload = part(serde_json::json!({
            "mimeType": "multipart/mixed",
            "parts": [{
                "mimeType": "multipart/alternative",
                "parts": [
                    {"mimeType": "text/html", "body": {"data": encode("<p>html</p>")}},
                    {"mimeType": "text/plain", "body": {"data": encode("plain body")}}
                ]
            }]
        }));
        assert_eq!(extract_body(&payload), "plain body");
    }

    #[test]
    fn test_html_is_converted_to_text() {
        let payload = part(serde_json::json!({
            "mimeType": "multipart/alternative",
            "parts": [{"mimeType": "text/html", "body": {"data": encode("<p>Hello <b>there</b></p>")}}]
        }));
        let body = extract_body(&payload);
        assert!(body.contains("Hello"));
        assert!(!body.contains("<p>"));
    }

    #[test]
    fn test_payload_body_fallback() {
        let payload = part(serde_json::json!({
            "mimeType": "text/plain",
            "body": {"data": format!("{}==", encode("single part"))}
        }));
        assert_eq!(extract_body(&payload), "single part");
        assert_eq!(extract_body(&MessagePart::default()), "");
    }

    struct StaticMailbox(Vec<(&'static str, &'static str)>);

    impl Mailbox for StaticMailbox {
        async fn list_recent(&self, n: u32) -> Result<Vec<MessageId>> {
            Ok(self.0.iter().take(n as usize).map(|(id, _)| MessageId::from(*id)).collect())
        }

        async fn fetch(&self, id: &MessageId) -> Result<FetchedMessage> {
            let (_, body) = self
                .0
                .iter()
                .find(|(i, _)| *i == id.as_str())
                .ok_or_else(|| anyhow::anyhow!("not found"))?;
            Ok(FetchedMessage {
                subject: format!("subject {}", id),
                sender: "bob@example.com".to_string(),
                body: body.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_load_inbox_keeps_order_and_limit() {
        let mailbox = StaticMailbox(vec![("a", "1"), ("b", "2"), ("c", "3")]);
        let store = load_inbox(&mailbox, 2).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get_index(0).unwrap().id.as_str(), "a");
        assert_eq!(store.get_index(1).unwrap().subject, "subject b");
        assert_eq!(store.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_gmail_client_lists_and_fetches() {
        let mut server = mockito::Server::new_async().await;
        let list = server
            .mock("GET", "/messages")
            .match_header("authorization", "Bearer token-1")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("labelIds".into(), "INBOX".into()),
                Matcher::UrlEncoded("q".into(), "category:primary".into()),
                Matcher::UrlEncoded("maxResults".into(), "5".into()),
            ]))
            .with_header("content-type", "application/json")
            .with_body(r#"{"messages":[{"id":"m1","threadId":"t1"}],"resultSizeEstimate":1}"#)
            .create_async()
            .await;
        let body = serde_json::json!({
            "id": "m1",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "Subject", "value": "Quarterly report"},
                    {"name": "From", "value": "Alice <alice@example.com>"}
                ],
                "parts": [{"mimeType": "text/plain", "body": {"data": encode("Numbers attached.")}}]
            }
        });
        let get = server
            .mock("GET", "/messages/m1")
            .match_query(Matcher::UrlEncoded("format".into(), "full".into()))
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let client = GmailApiClient::new("token-1".into()).with_base_url(server.url());
        let store = load_inbox(&client, 5).await.unwrap();

        list.assert_async().await;
        get.assert_async().await;
        let record = store.get(&"m1".into()).unwrap();
        assert_eq!(record.subject, "Quarterly report");
        assert_eq!(record.sender, "Alice <alice@example.com>");
        assert_eq!(record.body, "Numbers attached.");
    }

    #[tokio::test]
    async fn test_missing_headers_use_placeholders() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/messages/m2")
            .match_query(Matcher::Any)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"m2","payload":{"mimeType":"text/plain","headers":[]}}"#)
            .create_async()
            .await;

        let client = GmailApiClient::new("t".into()).with_base_url(server.url());
        let message = client.fetch(&"m2".into()).await.unwrap();
        assert_eq!(message.subject, NO_SUBJECT);
        assert_eq!(message.sender, UNKNOWN_SENDER);
        assert!(message.body.is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_asks_for_login() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/messages")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let client = GmailApiClient::new("expired".into()).with_base_url(server.url());
        let err = client.list_recent(3).await.unwrap_err();
        assert!(err.to_string().contains("重新登录"));
    }
}
