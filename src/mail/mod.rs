/// 邮件模块
pub mod gmail;
