/// OAuth2 本地回调服务器
///
/// 绑定在系统分配的本地端口上，只捕获一次浏览器重定向请求的查询参数。
/// 所有方法都是同步的，由 UI 线程的轮询循环调用。
use std::collections::HashMap;
use std::time::Duration;
use tiny_http::{Header, Request, Response, Server};
use url::Url;

/// 回调查询参数（参数名 → 全部取值）
pub type QueryParams = HashMap<String, Vec<String>>;

/// 默认绑定地址（端口 0 由系统分配）
///
/// 只监听 IPv4 回环；redirect_uri 写作 `localhost` 以符合 Google 桌面客户端的回环规则，
/// 浏览器把 `localhost` 解析到 127.0.0.1 时即可送达。
const LOOPBACK_ADDR: &str = "127.0.0.1:0";

/// 授权成功页面
const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>授权成功 - MailBrief</title>
    <style>
        body { font-family: -apple-system, "Segoe UI", Arial, sans-serif; text-align: center; padding-top: 15vh; background: #f4f6fb; }
        .checkmark { font-size: 64px; color: #4caf50; }
        h1 { color: #667eea; }
        p { color: #666; }
    </style>
</head>
<body>
    <div class="checkmark">✓</div>
    <h1>授权成功</h1>
    <p>MailBrief 已收到授权，现在可以关闭此页面并返回应用程序。</p>
</body>
</html>"#;

/// 授权失败页面
const ERROR_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>授权失败 - MailBrief</title>
    <style>
        body { font-family: -apple-system, "Segoe UI", Arial, sans-serif; text-align: center; padding-top: 15vh; background: #fbf4f6; }
        .cross { font-size: 64px; color: #f44336; }
        h1 { color: #f5576c; }
        p { color: #666; }
    </style>
</head>
<body>
    <div class="cross">✗</div>
    <h1>授权未完成</h1>
    <p>Gmail 授权被拒绝或已取消，可以关闭此页面并在应用程序中重试。</p>
</body>
</html>"#;

/// 无法绑定本地端口（例如沙箱环境）
#[derive(Debug, Clone, thiserror::Error)]
#[error("无法启动本地回调服务器: {0}")]
pub struct ListenerUnavailable(pub String);

/// 一次性回调监听器
pub struct CallbackListener {
    server: Option<Server>,
    port: u16,
    captured: Option<QueryParams>,
}

impl CallbackListener {
    /// 在 `127.0.0.1` 的系统分配端口上启动
    pub fn start() -> Result<Self, ListenerUnavailable> {
        Self::start_on(LOOPBACK_ADDR)
    }

    pub fn start_on(addr: &str) -> Result<Self, ListenerUnavailable> {
        let server = Server::http(addr).map_err(|e| ListenerUnavailable(e.to_string()))?;

        let port = server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .ok_or_else(|| ListenerUnavailable(format!("{} 不是 TCP 地址", addr)))?;

        tracing::debug!("本地回调服务器监听: 127.0.0.1:{}", port);

        Ok(Self {
            server: Some(server),
            port,
            captured: None,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 与该监听器对应的重定向地址
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/", self.port)
    }

    /// 等待至多 `timeout` 接收一个请求
    ///
    /// 携带 `code` 或 `error` 的请求会被保存并返回 `true`；
    /// 其他请求（如 `/favicon.ico`）返回 404，不算捕获。
    /// 已捕获过一次后，后续请求只会被应答而不会被保存，始终返回 `false`。
    pub fn poll_once(&mut self, timeout: Duration) -> bool {
        let Some(server) = &self.server else {
            return false;
        };

        if self.captured.is_some() {
            while let Ok(Some(stray)) = server.try_recv() {
                tracing::debug!("忽略重复回调: {}", stray.url());
                respond(stray, not_found());
            }
            return false;
        }

        let request = match server.recv_timeout(timeout) {
            Ok(Some(request)) => request,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!("⚠️ 接收回调请求失败: {}", e);
                return false;
            }
        };

        let params = parse_query(request.url());
        if !params.contains_key("code") && !params.contains_key("error") {
            tracing::debug!("忽略非回调请求: {}", request.url());
            respond(request, not_found());
            return false;
        }

        let page = if params.contains_key("code") {
            SUCCESS_HTML
        } else {
            ERROR_HTML
        };
        respond(request, html(page));

        tracing::info!("✅ 收到授权回调");
        self.captured = Some(params);
        true
    }

    /// 已捕获的查询参数
    pub fn params(&self) -> Option<&QueryParams> {
        self.captured.as_ref()
    }

    /// 清除已捕获的参数，同一端口可以再接收一次回调
    pub fn rearm(&mut self) {
        self.captured = None;
    }

    pub fn is_alive(&self) -> bool {
        self.server.is_some()
    }

    /// 释放端口，重复调用无副作用
    pub fn stop(&mut self) {
        if self.server.take().is_some() {
            tracing::debug!("本地回调服务器已关闭: {}", self.port);
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CallbackListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackListener")
            .field("port", &self.port)
            .field("alive", &self.is_alive())
            .field("captured", &self.captured.is_some())
            .finish()
    }
}

/// 取某个参数的第一个值
pub fn first_param<'a>(params: &'a QueryParams, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.first()).map(String::as_str)
}

fn parse_query(path: &str) -> QueryParams {
    let mut params = QueryParams::new();

    let Ok(url) = Url::parse(&format!("http://localhost{}", path)) else {
        return params;
    };
    for (key, value) in url.query_pairs().into_owned() {
        params.entry(key).or_default().push(value);
    }
    params
}

fn html(page: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    let response = Response::from_string(page);
    match Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..]) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

fn not_found() -> Response<std::io::Cursor<Vec<u8>>> {
    Response::from_string("Not Found").with_status_code(404)
}

/// 写响应失败不影响授权流程（浏览器可能已经关闭）
fn respond(request: Request, response: Response<std::io::Cursor<Vec<u8>>>) {
    if let Err(e) = request.respond(response) {
        tracing::debug!("写回调响应失败（忽略）: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::simulate_redirect;

    const POLL: Duration = Duration::from_millis(50);

    fn poll_until_captured(listener: &mut CallbackListener) -> bool {
        (0..40).any(|_| listener.poll_once(POLL))
    }

    #[test]
    fn test_poll_without_request_returns_false() {
        let mut listener = CallbackListener::start().unwrap();
        assert_ne!(listener.port(), 0);
        assert!(!listener.poll_once(Duration::from_millis(20)));
        assert!(listener.params().is_none());
    }

    #[test]
    fn test_localhost_redirect_reaches_ipv4_listener() {
        let mut listener = CallbackListener::start().unwrap();

        let redirect = Url::parse(&listener.redirect_uri()).unwrap();
        assert_eq!(redirect.host_str(), Some("localhost"));
        assert_eq!(redirect.port(), Some(listener.port()));

        // 浏览器对 localhost 的请求落在 127.0.0.1 上
        let reply = simulate_redirect(redirect.port().unwrap(), "code=C&state=s");
        assert!(poll_until_captured(&mut listener));
        assert!(reply.join().unwrap().contains("授权成功"));
    }

    #[test]
    fn test_capture_is_single_shot() {
        let mut listener = CallbackListener::start().unwrap();

        let first = simulate_redirect(listener.port(), "code=FIRST&state=s1");
        assert!(poll_until_captured(&mut listener));
        assert!(first.join().unwrap().contains("授权成功"));

        let second = simulate_redirect(listener.port(), "code=SECOND&state=s2");
        for _ in 0..10 {
            assert!(!listener.poll_once(POLL));
        }

        let params = listener.params().unwrap();
        assert_eq!(first_param(params, "code"), Some("FIRST"));
        assert_eq!(first_param(params, "state"), Some("s1"));

        listener.stop();
        let _ = second.join();
    }

    #[test]
    fn test_error_redirect_is_captured() {
        let mut listener = CallbackListener::start().unwrap();
        let browser = simulate_redirect(listener.port(), "error=access_denied");

        assert!(poll_until_captured(&mut listener));
        assert_eq!(
            first_param(listener.params().unwrap(), "error"),
            Some("access_denied")
        );
        assert!(browser.join().unwrap().contains("授权未完成"));
    }

    #[test]
    fn test_unrelated_request_is_not_a_capture() {
        let mut listener = CallbackListener::start().unwrap();
        let favicon = simulate_redirect(listener.port(), "");

        for _ in 0..10 {
            assert!(!listener.poll_once(POLL));
        }
        assert!(favicon.join().unwrap().contains("404"));
        assert!(listener.params().is_none());
    }

    #[test]
    fn test_repeated_params_are_kept() {
        let params = parse_query("/?scope=a&scope=b&code=x%20y");
        assert_eq!(params["scope"], vec!["a", "b"]);
        assert_eq!(first_param(&params, "code"), Some("x y"));
        assert!(parse_query("/").is_empty());
    }

    #[test]
    fn test_rearm_accepts_another_callback() {
        let mut listener = CallbackListener::start().unwrap();

        let first = simulate_redirect(listener.port(), "error=access_denied");
        assert!(poll_until_captured(&mut listener));
        let _ = first.join();

        listener.rearm();
        let second = simulate_redirect(listener.port(), "code=AGAIN");
        assert!(poll_until_captured(&mut listener));
        assert_eq!(first_param(listener.params().unwrap(), "code"), Some("AGAIN"));
        let _ = second.join();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut listener = CallbackListener::start().unwrap();
        listener.stop();
        listener.stop();

        assert!(!listener.is_alive());
        assert!(!listener.poll_once(Duration::from_millis(10)));
    }
}
