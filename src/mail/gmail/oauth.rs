/// Gmail OAuth2 登录流程
///
/// 授权码流程（PKCE + state 校验）的显式状态机：
///
/// ```text
/// Idle → Listening → AwaitingUser → CodeReceived → Exchanging → Success
///                         │                │             └──→ Failed
///                         ├──→ Cancelled   └──→ Failed（拒绝 / state 不匹配）
///                         └──→ retry() 回到 AwaitingUser
/// ```
///
/// 回调捕获（[`LoginFlow::poll_callback`]）在 UI 线程上执行；
/// Token 交换拆成 [`LoginFlow::begin_exchange`] / [`LoginFlow::finish_exchange`]，
/// 网络请求期间不必持有流程锁。
use anyhow::Context;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RequestTokenError, Scope, TokenResponse, TokenUrl,
    basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType, BasicTokenResponse},
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::oauth_config::OAuthConfig;
use crate::config::storage::CredentialStore;
use crate::mail::gmail::callback::{CallbackListener, QueryParams, first_param};
use crate::mail::gmail::types::Credentials;

/// 默认 Token 有效期（响应未给出 expires_in 时）
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// 登录失败原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoginError {
    #[error("OAuth 客户端配置不可用: {0}")]
    ClientSecretsMissing(String),

    #[error("无法启动本地回调服务器: {0}")]
    ListenerUnavailable(String),

    #[error("用户取消了登录")]
    UserCancelled,

    #[error("授权被拒绝: {0}")]
    AuthorizationDenied(String),

    #[error("CSRF 验证失败：回调 state 不匹配")]
    StateMismatch,

    #[error("Token 交换失败: {0}")]
    ExchangeFailed(String),

    #[error("已有登录流程正在进行")]
    AttemptInProgress,

    #[error("当前状态 {state} 不允许执行 {action}")]
    InvalidTransition {
        state: &'static str,
        action: &'static str,
    },
}

impl LoginError {
    /// 用户能否重新发起一次登录来恢复
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AuthorizationDenied(_) | Self::StateMismatch | Self::ExchangeFailed(_)
        )
    }
}

/// 登录流程状态
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoginState {
    #[default]
    Idle,
    Listening,
    AwaitingUser,
    CodeReceived,
    Exchanging,
    Success,
    Cancelled,
    Failed(LoginError),
}

impl LoginState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Listening => "Listening",
            Self::AwaitingUser => "AwaitingUser",
            Self::CodeReceived => "CodeReceived",
            Self::Exchanging => "Exchanging",
            Self::Success => "Success",
            Self::Cancelled => "Cancelled",
            Self::Failed(_) => "Failed",
        }
    }

    /// 是否有一次登录尚未结束
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::Listening | Self::AwaitingUser | Self::CodeReceived | Self::Exchanging
        )
    }
}

/// 一次登录尝试的临时数据
#[derive(Debug)]
pub struct PendingAuthorization {
    pub authorization_url: String,
    pub redirect_uri: String,
    pub redirect_port: u16,
    /// 已捕获的回调参数，每次捕获写入一次
    pub callback_params: Option<QueryParams>,
    state: String,
    pkce_verifier: String,
}

impl PendingAuthorization {
    pub fn state(&self) -> &str {
        &self.state
    }
}

/// Token 交换请求
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub code: String,
    /// 与授权 URL 中完全一致的重定向地址
    pub redirect_uri: String,
    pub pkce_verifier: String,
    pub client: OAuthConfig,
}

/// 用授权码换取 Token
pub trait TokenExchanger: Send + Sync + 'static {
    fn exchange(
        &self,
        request: ExchangeRequest,
    ) -> impl Future<Output = Result<Credentials, LoginError>> + Send;
}

/// 打开授权页面
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> anyhow::Result<()>;
}

/// 使用系统默认浏览器
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> anyhow::Result<()> {
        webbrowser::open(url).context("无法打开浏览器，请手动复制授权 URL")?;
        Ok(())
    }
}

/// 登录流程驱动器
///
/// 同一时刻最多持有一个回调监听器。
pub struct LoginFlow<X> {
    exchanger: Arc<X>,
    browser: Arc<dyn BrowserOpener>,
    store: CredentialStore,
    client: Option<OAuthConfig>,
    state: LoginState,
    listener: Option<CallbackListener>,
    pending: Option<PendingAuthorization>,
}

impl<X: TokenExchanger> LoginFlow<X> {
    pub fn new(exchanger: X, browser: Arc<dyn BrowserOpener>, store: CredentialStore) -> Self {
        Self {
            exchanger: Arc::new(exchanger),
            browser,
            store,
            client: None,
            state: LoginState::Idle,
            listener: None,
            pending: None,
        }
    }

    /// 设置（或在重新加载设置后替换）OAuth 客户端配置
    pub fn set_client(&mut self, client: Option<OAuthConfig>) {
        self.client = client;
    }

    pub fn set_store(&mut self, store: CredentialStore) {
        self.store = store;
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn state(&self) -> &LoginState {
        &self.state
    }

    pub fn pending(&self) -> Option<&PendingAuthorization> {
        self.pending.as_ref()
    }

    pub fn exchanger(&self) -> Arc<X> {
        Arc::clone(&self.exchanger)
    }

    /// 当前监听器端口（监听器存活时）
    pub fn listener_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .filter(|l| l.is_alive())
            .map(CallbackListener::port)
    }

    /// 开始一次新的登录，返回授权 URL
    ///
    /// 在上一次尝试尚未结束时返回 [`LoginError::AttemptInProgress`]；
    /// 上一次尝试已结束（含失败后保留的监听器）时先将其释放。
    pub fn start_login(&mut self) -> Result<String, LoginError> {
        if self.state.is_in_progress() {
            return Err(LoginError::AttemptInProgress);
        }

        let Some(client) = self.client.clone() else {
            return Err(self.fail(LoginError::ClientSecretsMissing(
                "未找到 OAuth 客户端文件".to_string(),
            )));
        };

        self.teardown();
        tracing::info!("🔐 开始 Gmail OAuth2 认证流程");

        let listener = match CallbackListener::start() {
            Ok(listener) => listener,
            Err(e) => return Err(self.fail(LoginError::ListenerUnavailable(e.0))),
        };
        self.state = LoginState::Listening;

        let pending = match build_authorization(&client, &listener.redirect_uri()) {
            Ok(pending) => pending,
            Err(e) => {
                drop(listener);
                return Err(self.fail(e));
            }
        };
        tracing::info!("✅ 授权 URL 生成成功（回调端口 {}）", pending.redirect_port);
        tracing::debug!("授权 URL: {}", pending.authorization_url);

        let url = pending.authorization_url.clone();
        self.listener = Some(listener);
        self.pending = Some(pending);
        self.open_browser(&url);
        self.state = LoginState::AwaitingUser;

        Ok(url)
    }

    /// 轮询一次回调，返回是否捕获到了重定向
    ///
    /// 捕获到授权码时进入 `CodeReceived`；
    /// 捕获到 `error` 或 state 不匹配时进入 `Failed` 并返回对应错误，不会发起交换。
    pub fn poll_callback(&mut self, timeout: Duration) -> Result<bool, LoginError> {
        if self.state != LoginState::AwaitingUser {
            return Err(self.invalid("poll_callback"));
        }

        let invalid = self.invalid("poll_callback");
        let (Some(listener), Some(pending)) = (self.listener.as_mut(), self.pending.as_mut())
        else {
            return Err(invalid);
        };

        if !listener.poll_once(timeout) {
            return Ok(false);
        }

        let params = listener.params().cloned().unwrap_or_default();
        let expected_state = pending.state.clone();
        pending.callback_params = Some(params.clone());
        self.state = LoginState::CodeReceived;

        if first_param(&params, "code").is_none() {
            let reason = first_param(&params, "error").unwrap_or("unknown").to_string();
            tracing::warn!("⚠️ 用户拒绝授权: {}", reason);
            return Err(self.fail(LoginError::AuthorizationDenied(reason)));
        }

        if first_param(&params, "state") != Some(expected_state.as_str()) {
            tracing::error!("❌ CSRF 验证失败：state 不匹配");
            return Err(self.fail(LoginError::StateMismatch));
        }

        tracing::info!("✅ CSRF 验证通过");
        Ok(true)
    }

    /// 进入 `Exchanging`，取出交换所需的数据
    ///
    /// 如果捕获阶段已经失败，直接返回那次失败的原因。
    pub fn begin_exchange(&mut self) -> Result<ExchangeRequest, LoginError> {
        match &self.state {
            LoginState::CodeReceived => {}
            LoginState::Failed(e) => return Err(e.clone()),
            _ => return Err(self.invalid("exchange")),
        }

        let request = match (&self.pending, &self.client) {
            (Some(pending), Some(client)) => pending
                .callback_params
                .as_ref()
                .and_then(|p| first_param(p, "code"))
                .map(|code| ExchangeRequest {
                    code: code.to_string(),
                    redirect_uri: pending.redirect_uri.clone(),
                    pkce_verifier: pending.pkce_verifier.clone(),
                    client: client.clone(),
                }),
            _ => None,
        };

        let Some(request) = request else {
            return Err(self.invalid("exchange"));
        };

        tracing::debug!("开始交换 Token，redirect_uri: {}", request.redirect_uri);
        self.state = LoginState::Exchanging;
        Ok(request)
    }

    /// 记录交换结果：成功则保存凭据并释放监听器
    pub fn finish_exchange(
        &mut self,
        result: Result<Credentials, LoginError>,
    ) -> Result<(), LoginError> {
        if self.state != LoginState::Exchanging {
            return Err(self.invalid("finish_exchange"));
        }

        let saved = result.and_then(|credentials| {
            self.store
                .save(&credentials)
                .map_err(|e| LoginError::ExchangeFailed(format!("保存凭据失败: {:#}", e)))
        });

        match saved {
            Ok(()) => {
                self.teardown();
                self.state = LoginState::Success;
                tracing::info!("🎉 OAuth2 认证流程完成");
                Ok(())
            }
            Err(e) => {
                tracing::error!("❌ {}", e);
                Err(self.fail(e))
            }
        }
    }

    /// 交换授权码并保存凭据（界面线程使用拆开的 begin/finish 两步）
    #[allow(dead_code)]
    pub async fn exchange_code(&mut self) -> Result<(), LoginError> {
        let request = self.begin_exchange()?;
        let result = self.exchanger.exchange(request).await;
        self.finish_exchange(result)
    }

    /// 轮询回调；捕获到授权码后立即完成交换
    #[allow(dead_code)]
    pub async fn check_for_code(&mut self, timeout: Duration) -> Result<bool, LoginError> {
        if !self.poll_callback(timeout)? {
            return Ok(false);
        }
        self.exchange_code().await?;
        Ok(true)
    }

    /// 取消等待中的登录并释放监听器
    ///
    /// 交换一旦开始就不能取消。
    pub fn cancel(&mut self) -> Result<(), LoginError> {
        match self.state {
            LoginState::Listening | LoginState::AwaitingUser => {
                self.teardown();
                self.state = LoginState::Cancelled;
                tracing::info!("🚫 用户取消了登录");
                Ok(())
            }
            _ => Err(self.invalid("cancel")),
        }
    }

    /// 重新在浏览器中打开授权页面
    ///
    /// 监听器仍然存活时复用同一端口和同一授权 URL；否则开始一次全新的尝试。
    pub fn retry(&mut self) -> Result<String, LoginError> {
        if !matches!(self.state, LoginState::AwaitingUser | LoginState::Failed(_)) {
            return Err(self.invalid("retry"));
        }

        let reusable = self.pending.is_some()
            && self.listener.as_ref().is_some_and(CallbackListener::is_alive);
        if !reusable {
            tracing::info!("🔁 监听器已失效，重新开始登录");
            self.teardown();
            self.state = LoginState::Idle;
            return self.start_login();
        }

        if let Some(listener) = self.listener.as_mut() {
            listener.rearm();
        }
        let invalid = self.invalid("retry");
        let Some(pending) = self.pending.as_mut() else {
            return Err(invalid);
        };
        pending.callback_params = None;
        let url = pending.authorization_url.clone();
        tracing::info!("🔁 重新打开授权页面（端口 {}）", pending.redirect_port);

        self.open_browser(&url);
        self.state = LoginState::AwaitingUser;
        Ok(url)
    }

    /// 释放监听器和未完成的授权（退出或登出时调用）
    pub fn shutdown(&mut self) {
        if self.state.is_in_progress() && self.state != LoginState::Exchanging {
            self.state = LoginState::Cancelled;
        }
        self.teardown();
    }

    fn open_browser(&self, url: &str) {
        match self.browser.open(url) {
            Ok(()) => tracing::info!("✅ 浏览器已打开，等待用户授权..."),
            Err(e) => tracing::warn!("⚠️ {:#}\n{}", e, url),
        }
    }

    fn teardown(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        self.pending = None;
    }

    fn fail(&mut self, error: LoginError) -> LoginError {
        self.state = LoginState::Failed(error.clone());
        error
    }

    fn invalid(&self, action: &'static str) -> LoginError {
        LoginError::InvalidTransition {
            state: self.state.name(),
            action,
        }
    }
}

/// 生成授权 URL（强制 consent 以确保返回 refresh_token）
fn build_authorization(
    config: &OAuthConfig,
    redirect_uri: &str,
) -> Result<PendingAuthorization, LoginError> {
    let client = build_client(config, redirect_uri, true)?;
    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

    let (auth_url, csrf_state) = client
        .authorize_url(CsrfToken::new_random)
        .add_scopes(config.scopes.iter().map(|s| Scope::new(s.clone())))
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent")
        .set_pkce_challenge(pkce_challenge)
        .url();

    let redirect_port = url::Url::parse(redirect_uri)
        .ok()
        .and_then(|u| u.port())
        .unwrap_or_default();

    Ok(PendingAuthorization {
        authorization_url: auth_url.to_string(),
        redirect_uri: redirect_uri.to_string(),
        redirect_port,
        callback_params: None,
        state: csrf_state.secret().to_string(),
        pkce_verifier: pkce_verifier.secret().to_string(),
    })
}

fn build_client(
    config: &OAuthConfig,
    redirect_uri: &str,
    with_secret: bool,
) -> Result<BasicClient, LoginError> {
    let invalid = |e: url::ParseError| LoginError::ClientSecretsMissing(format!("URL 无效: {}", e));

    let secret = with_secret.then(|| ClientSecret::new(config.client_secret.clone()));
    let client = BasicClient::new(
        ClientId::new(config.client_id.clone()),
        secret,
        AuthUrl::new(config.auth_uri.clone()).map_err(invalid)?,
        Some(TokenUrl::new(config.token_uri.clone()).map_err(invalid)?),
    )
    .set_redirect_uri(RedirectUrl::new(redirect_uri.to_string()).map_err(invalid)?);

    Ok(client)
}

/// 单次交换请求的失败
enum AttemptError {
    /// 服务端拒绝了客户端凭据（可改用公共客户端重试）
    InvalidClient(String),
    Other(String),
}

impl AttemptError {
    fn into_message(self) -> String {
        match self {
            Self::InvalidClient(message) | Self::Other(message) => message,
        }
    }
}

/// 通过 Google Token 端点交换
pub struct GoogleTokenExchanger;

impl GoogleTokenExchanger {
    async fn request(
        request: &ExchangeRequest,
        with_secret: bool,
    ) -> Result<BasicTokenResponse, AttemptError> {
        let client = build_client(&request.client, &request.redirect_uri, with_secret)
            .map_err(|e| AttemptError::Other(e.to_string()))?;

        client
            .exchange_code(AuthorizationCode::new(request.code.clone()))
            .set_pkce_verifier(PkceCodeVerifier::new(request.pkce_verifier.clone()))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|e| {
                tracing::error!("Token 交换详细错误: {:?}", e);
                let message = describe_token_error(&e);
                match e {
                    RequestTokenError::ServerResponse(r)
                        if *r.error() == BasicErrorResponseType::InvalidClient =>
                    {
                        AttemptError::InvalidClient(message)
                    }
                    _ => AttemptError::Other(message),
                }
            })
    }
}

impl TokenExchanger for GoogleTokenExchanger {
    async fn exchange(&self, request: ExchangeRequest) -> Result<Credentials, LoginError> {
        let response = match Self::request(&request, true).await {
            Ok(response) => response,
            Err(AttemptError::InvalidClient(_)) => {
                // 部分桌面客户端只接受 PKCE，不带 client_secret 再试一次
                tracing::warn!("首次交换返回 invalid_client，尝试使用公共客户端（PKCE-only）重试");
                Self::request(&request, false)
                    .await
                    .map_err(|e| LoginError::ExchangeFailed(e.into_message()))?
            }
            Err(e) => return Err(LoginError::ExchangeFailed(e.into_message())),
        };

        let access_token = response.access_token().secret().to_string();
        let refresh_token = response
            .refresh_token()
            .map(|t| t.secret().to_string())
            .ok_or_else(|| LoginError::ExchangeFailed("未收到 refresh_token".to_string()))?;
        let expires_in = response
            .expires_in()
            .unwrap_or(Duration::from_secs(DEFAULT_EXPIRES_IN_SECS))
            .as_secs() as i64;
        let scopes = response
            .scopes()
            .map(|s| s.iter().map(|scope| scope.to_string()).collect())
            .unwrap_or_else(|| request.client.scopes.clone());

        tracing::info!("✅ Token 交换成功（有效期: {} 秒）", expires_in);
        Ok(Credentials::new(access_token, refresh_token, expires_in, scopes))
    }
}

/// 把 oauth2 的请求错误整理成一行可读的描述
pub(crate) fn describe_token_error<RE>(
    error: &RequestTokenError<RE, BasicErrorResponse>,
) -> String
where
    RE: std::error::Error + 'static,
{
    match error {
        RequestTokenError::ServerResponse(e) => match e.error_description() {
            Some(description) => format!("{}: {}", e.error(), description),
            None => e.error().to_string(),
        },
        RequestTokenError::Request(e) => format!("网络错误: {}", e),
        RequestTokenError::Parse(e, _) => format!("响应解析失败: {}", e),
        RequestTokenError::Other(message) => message.clone(),
    }
}
