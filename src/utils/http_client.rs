/// 全局共享的 HTTP 客户端
///
/// Gmail API 与 Gemini 请求共用同一个连接池。
use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

/// 全局 HTTP 客户端实例（使用懒初始化）
pub static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(300))
        // Gemini 生成较长回复时可能需要数十秒
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::limited(5))
        .user_agent(concat!("MailBrief/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("构建全局 HTTP 客户端失败")
});

/// 获取全局 HTTP 客户端
pub fn get_client() -> &'static Client {
    &HTTP_CLIENT
}
