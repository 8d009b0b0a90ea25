// 终端界面 - 命令行输入与文本输出

use std::io::BufRead;

use crate::mail::gmail::types::{EmailRecord, EmailStore, truncate_chars};
use crate::ui::app::AppEvent;
use crate::ui::event_loop::LoopHandle;
use crate::ui::{NoticeLevel, View};

pub const HELP: &str = "命令:
  login        登录 Gmail（在浏览器中完成授权）
  cancel       取消正在进行的登录
  retry        重新打开授权页面
  logout       退出登录并删除本地 Token
  load         加载主要收件箱中的最新邮件
  show <n>     查看第 n 封邮件及其摘要
  summarize    为全部邮件生成摘要
  reload       重新加载设置
  help         显示帮助
  quit         退出";

/// 终端命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Login,
    Cancel,
    Retry,
    Logout,
    Load,
    /// 从 1 开始编号
    Show(usize),
    Summarize,
    Reload,
    Help,
    Quit,
}

impl Command {
    /// 空行返回 `Ok(None)`
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };

        let command = match name.to_ascii_lowercase().as_str() {
            "login" => Self::Login,
            "cancel" => Self::Cancel,
            "retry" => Self::Retry,
            "logout" => Self::Logout,
            "load" | "refresh" => Self::Load,
            "show" | "open" => {
                let n = words
                    .next()
                    .and_then(|w| w.parse::<usize>().ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(|| "用法: show <n>（n 从 1 开始）".to_string())?;
                Self::Show(n)
            }
            "summarize" | "sum" => Self::Summarize,
            "reload" => Self::Reload,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => return Err(format!("未知命令: {}（输入 help 查看帮助）", other)),
        };
        Ok(Some(command))
    }

    /// `Help` 在本地处理，不产生事件
    pub fn into_event(self) -> Option<AppEvent> {
        let event = match self {
            Self::Login => AppEvent::LoginRequested,
            Self::Cancel => AppEvent::MonitorCancel,
            Self::Retry => AppEvent::MonitorRetry,
            Self::Logout => AppEvent::LogoutRequested,
            Self::Load => AppEvent::LoadRequested,
            Self::Show(n) => AppEvent::SelectIndex(n - 1),
            Self::Summarize => AppEvent::SummarizeAll,
            Self::Reload => AppEvent::ReloadSettings,
            Self::Help => return None,
            Self::Quit => AppEvent::Quit,
        };
        Some(event)
    }
}

/// 读取标准输入（在独立线程中运行），把命令投递到 UI 循环
pub fn spawn_input_reader(ui: LoopHandle<AppEvent>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("读取输入失败: {}", e);
                    break;
                }
            };

            match Command::parse(&line) {
                Ok(None) => {}
                Ok(Some(command)) => {
                    tracing::debug!("收到命令: {:?}", command);
                    let quit = command == Command::Quit;
                    match command.into_event() {
                        Some(event) => {
                            if !ui.post(event) {
                                return;
                            }
                        }
                        None => println!("{}", HELP),
                    }
                    if quit {
                        return;
                    }
                }
                Err(message) => println!("{}", message),
            }
        }

        // 输入结束（Ctrl-D）视为退出
        ui.post(AppEvent::Quit);
    })
}

/// 直接打印到终端的界面
#[derive(Debug, Default)]
pub struct ConsoleView {
    login_enabled: bool,
    last_status: Option<String>,
}

impl ConsoleView {
    pub fn new() -> Self {
        Self::default()
    }
}

impl View for ConsoleView {
    fn set_login_enabled(&mut self, enabled: bool) {
        if enabled && !self.login_enabled {
            println!("（可以执行 login）");
        }
        self.login_enabled = enabled;
    }

    fn set_status(&mut self, text: &str) {
        println!("[状态] {}", text);
    }

    fn set_progress_text(&mut self, text: &str) {
        println!("{}", text);
    }

    fn show_monitor(&mut self, authorization_url: &str) {
        self.last_status = None;
        println!("🔐 已在浏览器中打开 Google 登录页面。");
        println!("   如果浏览器没有自动打开，请手动访问:");
        println!("   {}", authorization_url);
        println!("   完成后会自动继续；输入 cancel 取消，retry 重新打开页面。");
    }

    fn monitor_progress(&mut self, _progress: f32, status: &str) {
        // 终端里只在状态变化时打印
        if self.last_status.as_deref() != Some(status) {
            println!("   {}", status);
            self.last_status = Some(status.to_string());
        }
    }

    fn close_monitor(&mut self) {
        self.last_status = None;
    }

    fn notify(&mut self, level: NoticeLevel, title: &str, message: &str) {
        let icon = match level {
            NoticeLevel::Info => "ℹ️",
            NoticeLevel::Warning => "⚠️",
            NoticeLevel::Error => "❌",
        };
        println!("{} {}: {}", icon, title, message);
    }

    fn show_emails(&mut self, emails: &EmailStore) {
        if emails.is_empty() {
            println!("（没有邮件）");
            return;
        }
        for (i, record) in emails.iter().enumerate() {
            let marker = if record.summary().is_some() { "✓" } else { " " };
            println!(
                "{:>3}. {} {}  <{}>",
                i + 1,
                marker,
                truncate_chars(&record.subject, 60),
                truncate_chars(&record.sender, 40)
            );
        }
    }

    fn show_email(&mut self, record: &EmailRecord) {
        println!("────────────────────────────────────────");
        println!("主题: {}", record.subject);
        println!("发件人: {}", record.sender);
        println!();
        match record.summary() {
            Some(summary) => println!("{}", summary),
            None => println!("⏳ 正在生成摘要..."),
        }
        println!("────────────────────────────────────────");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("login"), Ok(Some(Command::Login)));
        assert_eq!(Command::parse("  SHOW 3 "), Ok(Some(Command::Show(3))));
        assert_eq!(Command::parse("exit"), Ok(Some(Command::Quit)));
        assert_eq!(Command::parse("   "), Ok(None));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Command::parse("show").is_err());
        assert!(Command::parse("show 0").is_err());
        assert!(Command::parse("frobnicate").is_err());
    }

    #[test]
    fn test_show_is_one_based() {
        assert!(matches!(
            Command::Show(1).into_event(),
            Some(AppEvent::SelectIndex(0))
        ));
        assert!(Command::Help.into_event().is_none());
    }
}
