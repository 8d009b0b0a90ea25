/// Gmail 相关数据结构
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

/// 邮件正文最大保留字符数
pub const MAX_BODY_CHARS: usize = 2000;

/// 持久化的 Token 包
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// 访问令牌
    pub access_token: String,

    /// 刷新令牌
    pub refresh_token: String,

    /// Token 过期时间（UTC）
    pub expires_at: DateTime<Utc>,

    /// 授权范围
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Credentials {
    pub fn new(
        access_token: String,
        refresh_token: String,
        expires_in_seconds: i64,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_seconds),
            scopes,
        }
    }

    /// 检查 Token 是否即将过期
    ///
    /// # Arguments
    /// * `threshold_minutes` - 提前多少分钟算作"即将过期"
    pub fn is_token_expiring(&self, threshold_minutes: i64) -> bool {
        let threshold = Utc::now() + chrono::Duration::minutes(threshold_minutes);
        self.expires_at <= threshold
    }

    /// 更新访问令牌
    pub fn update_access_token(&mut self, new_token: String, expires_in_seconds: i64) {
        self.access_token = new_token;
        self.expires_at = Utc::now() + chrono::Duration::seconds(expires_in_seconds);
    }
}

/// Gmail 邮件 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 收件箱获取层返回的单封邮件
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMessage {
    pub subject: String,
    pub sender: String,
    pub body: String,
}

/// 一封邮件及其（可选）摘要
///
/// 摘要只能写入一次：先完成的线程胜出，之后的写入被忽略。
#[derive(Debug)]
pub struct EmailRecord {
    pub id: MessageId,
    pub subject: String,
    pub sender: String,
    pub body: String,
    summary: OnceLock<String>,
}

impl EmailRecord {
    /// 创建记录，正文截断到 [`MAX_BODY_CHARS`] 个字符
    pub fn new(id: MessageId, message: FetchedMessage) -> Self {
        Self {
            id,
            subject: message.subject,
            sender: message.sender,
            body: truncate_chars(&message.body, MAX_BODY_CHARS),
            summary: OnceLock::new(),
        }
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.get().map(String::as_str)
    }

    /// 写入摘要，返回是否由本次调用写入
    pub fn set_summary(&self, summary: String) -> bool {
        self.summary.set(summary).is_ok()
    }
}

/// 按收件箱顺序排列的邮件集合
#[derive(Debug, Clone, Default)]
pub struct EmailStore {
    records: Vec<Arc<EmailRecord>>,
}

impl EmailStore {
    pub fn new(records: Vec<EmailRecord>) -> Self {
        Self {
            records: records.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<&Arc<EmailRecord>> {
        self.records.iter().find(|r| &r.id == id)
    }

    pub fn get_index(&self, index: usize) -> Option<&Arc<EmailRecord>> {
        self.records.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EmailRecord>> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 尚无摘要的邮件数量
    pub fn pending_count(&self) -> usize {
        self.records.iter().filter(|r| r.summary().is_none()).count()
    }
}

/// 按字符（而非字节）截断，避免切断多字节字符
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
