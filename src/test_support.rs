// 测试辅助：假的浏览器、Token 交换、摘要服务与界面

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::ai::Summarizer;
use crate::ai::gemini::SummarizeError;
use crate::config::oauth_config::{GMAIL_READONLY_SCOPE, OAuthConfig};
use crate::mail::gmail::oauth::{BrowserOpener, ExchangeRequest, LoginError, TokenExchanger};
use crate::mail::gmail::types::{Credentials, EmailRecord, EmailStore, MessageId};
use crate::ui::{NoticeLevel, View};

pub const CLIENT_SECRETS_JSON: &str = r#"{
    "installed": {
        "client_id": "test-client-id",
        "client_secret": "test-client-secret",
        "auth_uri": "https://accounts.google.com/o/oauth2/auth",
        "token_uri": "https://oauth2.googleapis.com/token",
        "redirect_uris": ["http://localhost"]
    }
}"#;

pub fn sample_credentials(refresh_token: &str) -> Credentials {
    Credentials::new(
        "access-token".to_string(),
        refresh_token.to_string(),
        3600,
        vec![GMAIL_READONLY_SCOPE.to_string()],
    )
}

pub fn sample_oauth_config(token_uri: &str) -> OAuthConfig {
    OAuthConfig {
        client_id: "test-client-id".to_string(),
        client_secret: "test-client-secret".to_string(),
        auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
        token_uri: token_uri.to_string(),
        scopes: vec![GMAIL_READONLY_SCOPE.to_string()],
    }
}

/// 模拟浏览器跳转：向回调端口发一个 GET，返回读到的原始响应
pub fn simulate_redirect(port: u16, query: &str) -> JoinHandle<String> {
    let target = if query.is_empty() {
        "/".to_string()
    } else {
        format!("/?{}", query)
    };

    std::thread::spawn(move || {
        let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)) else {
            return String::new();
        };
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n\r\n",
            target, port
        );
        if stream.write_all(request.as_bytes()).is_err() {
            return String::new();
        }

        let mut response = String::new();
        let _ = stream.read_to_string(&mut response);
        response
    })
}

/// 只记录打开过的 URL
#[derive(Default)]
pub struct RecordingBrowser {
    opened: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingBrowser {
    pub fn failing() -> Self {
        Self {
            opened: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

impl BrowserOpener for RecordingBrowser {
    fn open(&self, url: &str) -> anyhow::Result<()> {
        self.opened.lock().unwrap().push(url.to_string());
        if self.fail {
            anyhow::bail!("no browser available");
        }
        Ok(())
    }
}

/// 像用户在浏览器中完成（或拒绝）授权一样，立刻向 redirect_uri 发回调
pub struct RedirectingBrowser {
    reply: String,
    echo_state: bool,
}

impl RedirectingBrowser {
    pub fn code(code: &str) -> Self {
        Self {
            reply: format!("code={}", code),
            echo_state: true,
        }
    }

    pub fn error(error: &str) -> Self {
        Self {
            reply: format!("error={}", error),
            echo_state: false,
        }
    }
}

impl BrowserOpener for RedirectingBrowser {
    fn open(&self, url: &str) -> anyhow::Result<()> {
        let parsed = url::Url::parse(url)?;
        let param = |key: &str| {
            parsed
                .query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
        };

        let redirect = param("redirect_uri").ok_or_else(|| anyhow::anyhow!("no redirect_uri"))?;
        let port = url::Url::parse(&redirect)?
            .port()
            .ok_or_else(|| anyhow::anyhow!("no port"))?;

        let mut query = self.reply.clone();
        if self.echo_state {
            if let Some(state) = param("state") {
                query.push_str(&format!("&state={}", state));
            }
        }
        simulate_redirect(port, &query);
        Ok(())
    }
}

/// 记录收到的交换请求，返回固定凭据或固定错误
#[derive(Clone, Default)]
pub struct FakeExchanger {
    requests: Arc<Mutex<Vec<ExchangeRequest>>>,
    failure: Option<String>,
    delay: Duration,
}

impl FakeExchanger {
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// 模拟缓慢的 Token 端点
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<ExchangeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl TokenExchanger for FakeExchanger {
    async fn exchange(&self, request: ExchangeRequest) -> Result<Credentials, LoginError> {
        self.requests.lock().unwrap().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(message) => Err(LoginError::ExchangeFailed(message.clone())),
            None => Ok(sample_credentials("refresh-from-fake")),
        }
    }
}

/// 返回 "summary of {body}"，记录调用次数和最大并发
#[derive(Default)]
pub struct FakeSummarizer {
    delay: Duration,
    fail_on: Option<String>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_on(mut self, body: &str) -> Self {
        self.fail_on = Some(body.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl Summarizer for FakeSummarizer {
    async fn summarize(&self, body: &str) -> Result<String, SummarizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail_on.as_deref() == Some(body) {
            return Err(SummarizeError::Api {
                status: 500,
                message: "boom".to_string(),
            });
        }
        Ok(format!("summary of {}", body))
    }
}

/// 把界面调用记录下来供断言
#[derive(Debug, Default)]
pub struct RecordingView {
    pub login_enabled: bool,
    pub status: String,
    pub progress_text: String,
    pub monitor_open: bool,
    pub monitor_was_shown: bool,
    pub monitor_status: String,
    pub notices: Vec<(NoticeLevel, String, String)>,
    pub email_count: usize,
    pub shown: Vec<(MessageId, Option<String>)>,
}

impl View for RecordingView {
    fn set_login_enabled(&mut self, enabled: bool) {
        self.login_enabled = enabled;
    }

    fn set_status(&mut self, text: &str) {
        self.status = text.to_string();
    }

    fn set_progress_text(&mut self, text: &str) {
        self.progress_text = text.to_string();
    }

    fn show_monitor(&mut self, _authorization_url: &str) {
        self.monitor_open = true;
        self.monitor_was_shown = true;
    }

    fn monitor_progress(&mut self, _progress: f32, status: &str) {
        self.monitor_status = status.to_string();
    }

    fn close_monitor(&mut self) {
        self.monitor_open = false;
    }

    fn notify(&mut self, level: NoticeLevel, title: &str, message: &str) {
        self.notices
            .push((level, title.to_string(), message.to_string()));
    }

    fn show_emails(&mut self, emails: &EmailStore) {
        self.email_count = emails.len();
    }

    fn show_email(&mut self, record: &EmailRecord) {
        self.shown
            .push((record.id.clone(), record.summary().map(str::to_string)));
    }
}
