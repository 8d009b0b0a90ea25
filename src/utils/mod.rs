/// 工具模块
pub mod http_client;
