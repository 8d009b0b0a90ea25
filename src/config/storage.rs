/// 本地凭据存储模块
///
/// Token 包以 TOML 保存到可配置路径；Gemini API 密钥单独保存在 dotenv 格式的键值文件中。
/// 两者都视为不透明的本地密钥，除文件权限外不做额外加密。
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::API_KEY_VAR;
use crate::mail::gmail::types::Credentials;

/// Token 存储文件版本号
const STORAGE_VERSION: &str = "1.0";

/// Token 文件容器
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct TokenFile {
    /// 文件格式版本
    version: String,

    #[serde(flatten)]
    credentials: Credentials,
}

/// Token 文件的读写入口
///
/// 同一时刻至多一个写入方（登录流程的 Token 交换步骤），读取方把“文件不存在”当作合法的未登录状态。
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 是否已登录（仅检查文件是否存在）
    pub fn is_logged_in(&self) -> bool {
        self.path.exists()
    }

    /// 加载凭据，文件不存在时返回 `None`
    pub fn load(&self) -> Result<Option<Credentials>> {
        if !self.path.exists() {
            tracing::debug!("Token 文件不存在: {}", self.path.display());
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("读取 Token 文件失败: {}", self.path.display()))?;

        let file: TokenFile =
            toml::from_str(&content).context("解析 Token 文件失败（文件可能损坏）")?;

        if file.version != STORAGE_VERSION {
            tracing::warn!(
                "Token 文件版本不匹配（期望: {}, 实际: {}），尝试兼容加载",
                STORAGE_VERSION,
                file.version
            );
        }

        Ok(Some(file.credentials))
    }

    /// 覆盖式保存凭据
    pub fn save(&self, credentials: &Credentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("创建 Token 目录失败")?;
        }

        let file = TokenFile {
            version: STORAGE_VERSION.to_string(),
            credentials: credentials.clone(),
        };
        let content = toml::to_string_pretty(&file).context("序列化 Token 失败")?;

        write_private(&self.path, content.as_bytes())
            .with_context(|| format!("写入 Token 文件失败: {}", self.path.display()))?;

        tracing::debug!("Token 已保存到: {}", self.path.display());
        Ok(())
    }

    /// 删除凭据（退出登录），返回是否真的删除了文件
    pub fn delete(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&self.path)
            .with_context(|| format!("删除 Token 文件失败: {}", self.path.display()))?;
        tracing::info!("🗑️ Token 文件已删除");
        Ok(true)
    }
}

/// 从密钥文件读取 `GEMINI_API_KEY`，文件不存在或没有该键时返回 `None`
pub fn load_api_key(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }

    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("读取密钥文件失败: {}", path.display()))?;

    for item in iter {
        let (key, value) = item.context("解析密钥文件失败")?;
        if key == API_KEY_VAR {
            let value = value.trim().to_string();
            return Ok((!value.is_empty()).then_some(value));
        }
    }

    Ok(None)
}

/// 以仅所有者可读写的权限写入文件
///
/// 新文件创建时即为 0600；已存在的文件先收紧权限再截断写入。
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        options.mode(0o600);
        if path.exists() {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
    }

    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()
}
