use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod oauth_config;
pub mod storage;

/// 配置目录名
const APP_DIR_NAME: &str = "MailBrief";

/// 配置文件名
const CONFIG_FILE_NAME: &str = "config.toml";

/// 本地密钥文件名（dotenv 格式）
pub const SECRETS_FILE_NAME: &str = "secrets.env";

/// Gemini API 密钥的环境变量 / 键名
pub const API_KEY_VAR: &str = "GEMINI_API_KEY";

/// 默认 Gemini 端点
const DEFAULT_GEMINI_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent";

/// `config.toml` 的完整结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gmail: GmailConfig,
    pub gemini: GeminiConfig,
    pub login: LoginTiming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailConfig {
    /// Google OAuth 客户端文件（相对路径基于配置目录）
    pub client_secrets_file: PathBuf,

    /// Token 缓存文件（相对路径基于配置目录）
    pub token_cache: PathBuf,

    /// 每次加载的邮件数量上限
    pub max_emails: u32,

    /// 加载后是否立即批量生成摘要
    pub summarize_on_load: bool,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            client_secrets_file: PathBuf::from("credentials.json"),
            token_cache: PathBuf::from("token.toml"),
            max_emails: 10,
            summarize_on_load: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub endpoint: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_GEMINI_ENDPOINT.to_string(),
        }
    }
}

/// 登录流程的节奏参数
///
/// 动画节拍、检查频率、accept 超时和看门狗期限都在这里，测试可以把它们调到毫秒级。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginTiming {
    /// 进度动画节拍（毫秒）
    pub animation_interval_ms: u64,

    /// 每隔多少个节拍检查一次回调
    pub check_every_ticks: u32,

    /// 单次 accept 的超时（毫秒），同时也是取消操作的最大响应延迟
    pub accept_timeout_ms: u64,

    /// 检测成功后关闭监视窗口前的停留时间（毫秒）
    pub close_delay_ms: u64,

    /// 看门狗主期限（秒）
    pub watchdog_primary_secs: u64,

    /// 看门狗兜底期限（秒）
    pub watchdog_fallback_secs: u64,
}

impl Default for LoginTiming {
    fn default() -> Self {
        Self {
            animation_interval_ms: 500,
            check_every_ticks: 4,
            accept_timeout_ms: 500,
            close_delay_ms: 500,
            watchdog_primary_secs: 30,
            watchdog_fallback_secs: 60,
        }
    }
}

impl LoginTiming {
    pub fn animation_interval(&self) -> Duration {
        Duration::from_millis(self.animation_interval_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn close_delay(&self) -> Duration {
        Duration::from_millis(self.close_delay_ms)
    }

    /// 看门狗的全部期限，按触发顺序排列
    pub fn watchdog_deadlines(&self) -> Vec<Duration> {
        vec![
            Duration::from_secs(self.watchdog_primary_secs),
            Duration::from_secs(self.watchdog_fallback_secs),
        ]
    }
}

/// 运行时设置快照
///
/// 由 [`load`] / [`load_from`] 构造，创建后不可变；设置变更后通过
/// [`Settings::reload`] 取得新的快照，而不是原地修改。
#[derive(Debug, Clone)]
pub struct Settings {
    /// Gemini API 密钥（可能为空，调用方负责提示用户）
    pub api_key: String,

    /// Google OAuth 客户端文件路径
    pub oauth_client_file_path: PathBuf,

    /// Token 缓存文件路径
    pub token_cache_path: PathBuf,

    pub gemini_endpoint: String,
    pub max_emails: u32,
    pub summarize_on_load: bool,
    pub login: LoginTiming,

    config_dir: PathBuf,
}

impl Settings {
    /// 从同一个配置目录重新读取，返回新的快照
    pub fn reload(&self) -> Result<Settings> {
        tracing::info!("🔄 重新加载设置: {}", self.config_dir.display());
        load_from(&self.config_dir)
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.config_dir.join(SECRETS_FILE_NAME)
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    fn from_config(config: Config, dir: &Path, api_key: String) -> Self {
        Self {
            api_key,
            oauth_client_file_path: dir.join(&config.gmail.client_secrets_file),
            token_cache_path: dir.join(&config.gmail.token_cache),
            gemini_endpoint: config.gemini.endpoint,
            max_emails: config.gmail.max_emails,
            summarize_on_load: config.gmail.summarize_on_load,
            login: config.login,
            config_dir: dir.to_path_buf(),
        }
    }
}

/// 获取默认配置目录：`<系统配置目录>/MailBrief`
pub fn default_config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("无法获取配置目录"))?
        .join(APP_DIR_NAME);
    Ok(dir)
}

/// 从默认配置目录加载设置
pub fn load() -> Result<Settings> {
    load_from(&default_config_dir()?)
}

/// 从指定配置目录加载设置
///
/// 配置文件不存在时写入默认配置。
pub fn load_from(dir: &Path) -> Result<Settings> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("创建配置目录失败: {}", dir.display()))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        toml::from_str::<Config>(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?
    } else {
        tracing::info!("📝 配置文件不存在，写入默认配置: {}", path.display());
        let config = Config::default();
        save_to(dir, &config)?;
        config
    };

    let file_key = storage::load_api_key(&dir.join(SECRETS_FILE_NAME))?;
    let api_key = resolve_api_key(std::env::var(API_KEY_VAR).ok(), file_key);

    Ok(Settings::from_config(config, dir, api_key))
}

/// 保存配置
pub fn save_to(dir: &Path, config: &Config) -> Result<()> {
    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(config).context("序列化配置失败")?;
    std::fs::write(&path, content)
        .with_context(|| format!("写入配置文件失败: {}", path.display()))?;
    Ok(())
}

/// 环境变量优先，其次本地密钥文件
fn resolve_api_key(env_value: Option<String>, file_value: Option<String>) -> String {
    env_value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| file_value.map(|v| v.trim().to_string()))
        .unwrap_or_default()
}
