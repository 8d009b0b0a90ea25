/// Gmail 模块 - OAuth2 登录、回调捕获与 API 调用
pub mod api;
pub mod callback;
pub mod oauth;
pub mod token;
pub mod types;

// 重新导出常用类型
pub use oauth::{GoogleTokenExchanger, LoginFlow, SystemBrowser};
