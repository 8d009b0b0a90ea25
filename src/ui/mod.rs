// UI 模块 - 事件循环、登录监视与界面抽象

pub mod app;
pub mod console;
pub mod event_loop;
pub mod monitor;
pub mod watchdog;

use crate::mail::gmail::types::{EmailRecord, EmailStore};

/// 提示级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// 界面层
///
/// 所有方法都只在 UI 线程上调用。
pub trait View {
    /// 登录按钮是否可用
    fn set_login_enabled(&mut self, enabled: bool);

    /// 状态栏文本（登录状态）
    fn set_status(&mut self, text: &str);

    /// 进度提示文本
    fn set_progress_text(&mut self, text: &str);

    /// 显示登录监视窗口
    fn show_monitor(&mut self, authorization_url: &str);

    fn monitor_progress(&mut self, progress: f32, status: &str);

    fn close_monitor(&mut self);

    /// 可关闭的提示框
    fn notify(&mut self, level: NoticeLevel, title: &str, message: &str);

    fn show_emails(&mut self, emails: &EmailStore);

    /// 显示一封邮件；摘要为空表示仍在生成中
    fn show_email(&mut self, record: &EmailRecord);
}
