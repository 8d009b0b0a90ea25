/// OAuth2 客户端配置读取模块
///
/// 读取 Google Cloud Console 下载的客户端文件（`installed` 或 `web` 段），
/// 支持环境变量覆盖客户端 ID / 密钥。
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Gmail 只读权限
pub const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// OAuth2 客户端配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Google OAuth2 客户端 ID
    pub client_id: String,

    /// Google OAuth2 客户端密钥
    pub client_secret: String,

    /// 授权端点
    pub auth_uri: String,

    /// Token 端点
    pub token_uri: String,

    /// 请求的 API 权限范围
    pub scopes: Vec<String>,
}

/// 客户端文件中 `installed` / `web` 段的内容
#[derive(Debug, Deserialize)]
struct ClientSecretEntry {
    client_id: Option<String>,
    client_secret: Option<String>,
    auth_uri: Option<String>,
    token_uri: Option<String>,
    redirect_uris: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecretEntry>,
    web: Option<ClientSecretEntry>,
}

impl OAuthConfig {
    /// 加载 OAuth2 配置
    ///
    /// 优先级（从高到低）：
    /// 1. 环境变量：`GMAIL_CLIENT_ID`, `GMAIL_CLIENT_SECRET`
    /// 2. 指定的客户端文件
    /// 3. 客户端文件所在目录中任意包含 `installed`/`web` 段的 `*.json`
    ///
    /// # Errors
    /// 找不到任何可用的客户端文件，或文件缺少必需字段
    pub fn load(path: &Path) -> Result<Self> {
        if let (Ok(client_id), Ok(client_secret)) = (
            std::env::var("GMAIL_CLIENT_ID"),
            std::env::var("GMAIL_CLIENT_SECRET"),
        ) {
            tracing::info!("✅ 从环境变量加载 OAuth2 配置");
            return Ok(Self {
                client_id,
                client_secret,
                auth_uri: DEFAULT_AUTH_URI.to_string(),
                token_uri: DEFAULT_TOKEN_URI.to_string(),
                scopes: vec![GMAIL_READONLY_SCOPE.to_string()],
            });
        }

        let resolved = if path.exists() {
            path.to_path_buf()
        } else {
            let dir = path.parent().unwrap_or(Path::new("."));
            find_client_secrets(dir).ok_or_else(|| {
                anyhow::anyhow!("未找到 OAuth 客户端文件: {}", path.display())
            })?
        };

        let content = std::fs::read_to_string(&resolved)
            .with_context(|| format!("读取客户端文件失败: {}", resolved.display()))?;
        let config = Self::from_json(&content)
            .with_context(|| format!("客户端文件无效: {}", resolved.display()))?;

        tracing::info!("✅ 从客户端文件加载 OAuth2 配置: {}", resolved.display());
        Ok(config)
    }

    /// 解析 Google 客户端文件内容并校验必需字段
    pub fn from_json(content: &str) -> Result<Self> {
        let file: ClientSecretsFile =
            serde_json::from_str(content).context("客户端文件不是有效的 JSON")?;

        let entry = file
            .installed
            .or(file.web)
            .ok_or_else(|| anyhow::anyhow!("客户端文件缺少 installed 或 web 段"))?;

        let mut missing = Vec::new();
        if entry.client_id.as_deref().is_none_or(str::is_empty) {
            missing.push("client_id");
        }
        if entry.client_secret.as_deref().is_none_or(str::is_empty) {
            missing.push("client_secret");
        }
        if entry.auth_uri.is_none() {
            missing.push("auth_uri");
        }
        if entry.token_uri.is_none() {
            missing.push("token_uri");
        }
        if !missing.is_empty() {
            anyhow::bail!("客户端文件缺少字段: {}", missing.join(", "));
        }

        if entry.redirect_uris.as_ref().is_none_or(|uris| uris.is_empty()) {
            anyhow::bail!("客户端文件缺少 redirect_uris（需要桌面应用类型的客户端）");
        }

        Ok(Self {
            client_id: entry.client_id.unwrap_or_default(),
            client_secret: entry.client_secret.unwrap_or_default(),
            auth_uri: entry.auth_uri.unwrap_or_default(),
            token_uri: entry.token_uri.unwrap_or_default(),
            scopes: vec![GMAIL_READONLY_SCOPE.to_string()],
        })
    }

    /// 验证配置是否为占位符
    pub fn is_placeholder(&self) -> bool {
        self.client_id.contains("YOUR_CLIENT_ID")
            || self.client_secret.contains("YOUR_CLIENT_SECRET")
    }
}

/// 在目录中查找第一个包含 `installed`/`web` 段的 JSON 文件
pub fn find_client_secrets(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;

    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    candidates.sort();

    candidates.into_iter().find(|p| {
        std::fs::read_to_string(p)
            .ok()
            .and_then(|c| serde_json::from_str::<serde_json::Value>(&c).ok())
            .is_some_and(|v| v.get("installed").is_some() || v.get("web").is_some())
    })
}
