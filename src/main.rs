use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

mod ai;
mod config;
mod mail;
mod tasks;
#[cfg(test)]
mod test_support;
mod ui;
mod utils;

use ai::GeminiClient;
use config::storage::CredentialStore;
use mail::gmail::{GoogleTokenExchanger, LoginFlow, SystemBrowser};
use tasks::TaskRunner;
use ui::app::App;
use ui::console::{self, ConsoleView};
use ui::event_loop::EventLoop;

/// Gmail 收件箱 AI 摘要与回复草稿
#[derive(Debug, Parser)]
#[command(name = "mailbrief", version, about)]
struct Cli {
    /// 配置目录（默认：<系统配置目录>/MailBrief）
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// 覆盖每次加载的邮件数量
    #[arg(long, value_name = "N")]
    max_emails: Option<u32>,
}

fn main() -> Result<()> {
    // 1. 初始化日志
    init_logger()?;
    let cli = Cli::parse();

    // 2. 加载设置
    let mut settings = match &cli.config_dir {
        Some(dir) => config::load_from(dir)?,
        None => config::load()?,
    };
    if let Some(n) = cli.max_emails {
        settings.max_emails = n;
    }
    tracing::info!("📁 配置目录: {}", settings.config_dir().display());

    // 3. 创建 Tokio 运行时（登录交换、邮件加载、摘要都在这里执行）
    let rt = tokio::runtime::Runtime::new()?;

    // 4. UI 事件循环与后台任务
    let event_loop = EventLoop::new();
    let tasks = TaskRunner::new(rt.handle().clone(), event_loop.handle());

    let flow = LoginFlow::new(
        GoogleTokenExchanger,
        Arc::new(SystemBrowser),
        CredentialStore::new(&settings.token_cache_path),
    );
    let mut app = App::new(
        settings,
        ConsoleView::new(),
        tasks,
        flow,
        Box::new(GeminiClient::from_settings),
    );

    // 5. 终端输入线程
    println!("MailBrief v{} 已启动，输入 help 查看命令。", env!("CARGO_PKG_VERSION"));
    let _input = console::spawn_input_reader(event_loop.handle());

    // 6. 运行事件循环直到退出
    event_loop.run(|event_loop, event| app.handle(event_loop, event));

    tracing::info!("👋 事件循环已退出");
    // 输入线程可能仍阻塞在 stdin 上，运行时里也可能有未完成的请求
    rt.shutdown_background();
    std::process::exit(0)
}

fn init_logger() -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailbrief=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
