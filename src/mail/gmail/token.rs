/// Token 自动刷新管理模块
use anyhow::{Context, Result};
use oauth2::{
    AuthUrl, ClientId, ClientSecret, RefreshToken, TokenResponse, TokenUrl, basic::BasicClient,
};

use crate::config::oauth_config::OAuthConfig;
use crate::config::storage::CredentialStore;
use crate::mail::gmail::oauth::describe_token_error;
use crate::mail::gmail::types::Credentials;

/// Token 刷新阈值（提前多少分钟刷新）
const REFRESH_THRESHOLD_MINUTES: i64 = 5;

/// Token 管理器
///
/// 负责在访问令牌过期前用 Refresh Token 换取新令牌，并写回凭据文件。
pub struct TokenManager {
    store: CredentialStore,
    oauth_config: OAuthConfig,
    credentials: Credentials,
}

impl TokenManager {
    /// 从凭据文件创建
    ///
    /// # Errors
    /// - 尚未登录（凭据文件不存在）
    /// - 凭据文件损坏
    pub fn new(store: CredentialStore, oauth_config: OAuthConfig) -> Result<Self> {
        let credentials = store
            .load()?
            .ok_or_else(|| anyhow::anyhow!("尚未登录 Gmail，请先执行 login"))?;

        Ok(Self {
            store,
            oauth_config,
            credentials,
        })
    }

    /// 获取有效的 Access Token
    ///
    /// 如果 Token 即将过期（提前 5 分钟），则自动刷新
    pub async fn get_valid_token(&mut self) -> Result<String> {
        if self.credentials.is_token_expiring(REFRESH_THRESHOLD_MINUTES) {
            tracing::info!(
                "Access Token 即将过期（{}），自动刷新",
                self.credentials.expires_at
            );
            self.refresh_access_token().await?;
        }

        Ok(self.credentials.access_token.clone())
    }

    async fn refresh_access_token(&mut self) -> Result<()> {
        tracing::debug!("开始刷新 Access Token");

        let client = BasicClient::new(
            ClientId::new(self.oauth_config.client_id.clone()),
            Some(ClientSecret::new(self.oauth_config.client_secret.clone())),
            AuthUrl::new(self.oauth_config.auth_uri.clone()).context("auth_uri 无效")?,
            Some(TokenUrl::new(self.oauth_config.token_uri.clone()).context("token_uri 无效")?),
        );

        let token_response = client
            .exchange_refresh_token(&RefreshToken::new(self.credentials.refresh_token.clone()))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|e| {
                let error_msg = describe_token_error(&e);

                if error_msg.contains("invalid_grant") {
                    tracing::error!("❌ Token 刷新失败 [授权被拒绝/已过期]: {}", error_msg);
                    tracing::error!(
                        "   💡 可能原因:\n   \
                         - Refresh Token 已过期或被撤销\n   \
                         - 用户撤销了应用授权\n   \
                         - 需要执行 logout 后重新 login"
                    );
                    anyhow::anyhow!(
                        "Refresh Token 交换失败（可能已过期或被撤销）：{}",
                        error_msg
                    )
                } else {
                    anyhow::anyhow!("Refresh Token 交换失败: {}", error_msg)
                }
            })?;

        let expires_in = token_response
            .expires_in()
            .unwrap_or(std::time::Duration::from_secs(3600))
            .as_secs() as i64;
        self.credentials
            .update_access_token(token_response.access_token().secret().to_string(), expires_in);

        // Google 可能轮换 Refresh Token
        if let Some(rotated) = token_response.refresh_token() {
            self.credentials.refresh_token = rotated.secret().to_string();
        }

        self.store.save(&self.credentials).context("保存凭据失败")?;

        tracing::info!(
            "✅ Access Token 刷新成功（新的过期时间: {}）",
            self.credentials.expires_at
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_credentials, sample_oauth_config};
    use chrono::Utc;
    use mockito::Matcher;

    #[test]
    fn test_requires_login() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("token.toml"));

        let result = TokenManager::new(store, sample_oauth_config("https://example.com/token"));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fresh_token_is_returned_without_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("token.toml"));
        store.save(&sample_credentials("refresh")).unwrap();

        let mut manager =
            TokenManager::new(store, sample_oauth_config("http://127.0.0.1:9/token")).unwrap();
        assert_eq!(manager.get_valid_token().await.unwrap(), "access-token");
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_and_saved() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "refresh".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"fresh","expires_in":3600,"token_type":"Bearer"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("token.toml"));
        let mut expired = sample_credentials("refresh");
        expired.expires_at = Utc::now() - chrono::Duration::hours(1);
        store.save(&expired).unwrap();

        let config = sample_oauth_config(&format!("{}/token", server.url()));
        let mut manager = TokenManager::new(store.clone(), config).unwrap();

        assert_eq!(manager.get_valid_token().await.unwrap(), "fresh");
        mock.assert_async().await;

        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.access_token, "fresh");
        assert_eq!(saved.refresh_token, "refresh");
    }

    #[tokio::test]
    async fn test_revoked_refresh_token_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("token.toml"));
        let mut expired = sample_credentials("revoked");
        expired.expires_at = Utc::now() - chrono::Duration::hours(1);
        store.save(&expired).unwrap();

        let config = sample_oauth_config(&format!("{}/token", server.url()));
        let mut manager = TokenManager::new(store, config).unwrap();

        let err = manager.get_valid_token().await.unwrap_err();
        assert!(err.to_string().contains("可能已过期或被撤销"));
    }
}
