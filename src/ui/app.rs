/// 应用控制器
///
/// 在 UI 线程上处理全部 [`AppEvent`]。登录流程的外层包装、Token 交换、
/// 邮件加载和摘要都交给 [`TaskRunner`]，结果以事件形式回到这里。
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};

use crate::ai::{DEFAULT_WORKERS, SummaryReport, Summarizer, summarize_all};
use crate::config::Settings;
use crate::config::oauth_config::OAuthConfig;
use crate::config::storage::CredentialStore;
use crate::mail::gmail::api::{GmailApiClient, load_inbox};
use crate::mail::gmail::oauth::{LoginError, LoginFlow, LoginState, TokenExchanger};
use crate::mail::gmail::types::{EmailRecord, EmailStore, MessageId, truncate_chars};
use crate::tasks::{TaskError, TaskRunner};
use crate::ui::event_loop::{EventLoop, LoopHandle};
use crate::ui::monitor::{CompletionMonitor, MonitorOutcome, MonitorStep};
use crate::ui::watchdog::Watchdog;
use crate::ui::{NoticeLevel, View};

pub const STATUS_LOGGED_IN: &str = "✓ 已登录";
pub const STATUS_LOGGED_OUT: &str = "✗ 未登录";
pub const STATUS_LOGGING_IN: &str = "⏳ 正在登录...";
pub const STATUS_PENDING_IN_BROWSER: &str = "✗ 浏览器中登录待完成";

const MONITOR_FAILED: &str = "✗ 授权未完成";

/// 应用事件
#[derive(Debug)]
pub enum AppEvent {
    LoginRequested,
    LogoutRequested,
    LoadRequested,
    /// 选中第 n 封邮件（从 0 开始）
    SelectIndex(usize),
    SummarizeAll,
    ReloadSettings,
    Quit,

    /// 登录包装任务请求显示监视窗口；窗口关闭时通过 `outcome` 返回结局
    ShowMonitor {
        attempt: u64,
        url: String,
        outcome: oneshot::Sender<MonitorOutcome>,
    },
    MonitorTick(u64),
    MonitorClose(u64),
    MonitorCancel,
    MonitorRetry,
    WatchdogFired(u64),
    LoginFinished {
        attempt: u64,
        result: Result<Result<(), LoginError>, TaskError>,
    },

    EmailsLoaded(Result<EmailStore, String>),
    SummaryReady {
        id: MessageId,
        result: Result<String, String>,
    },
    SummaryProgress {
        done: usize,
        total: usize,
    },
    AllSummariesReady(Result<SummaryReport, String>),
}

/// 当前显示中的监视窗口
struct ActiveMonitor {
    attempt: u64,
    monitor: CompletionMonitor,
    outcome: Option<oneshot::Sender<MonitorOutcome>>,
}

pub type SummarizerFactory<S> = Box<dyn Fn(&Settings) -> S>;

pub struct App<X, S, V> {
    settings: Settings,
    view: V,
    tasks: TaskRunner<AppEvent>,
    flow: Arc<Mutex<LoginFlow<X>>>,
    store: CredentialStore,
    oauth: Option<OAuthConfig>,
    make_summarizer: SummarizerFactory<S>,
    summarizer: Arc<S>,

    attempt: u64,
    /// 登录按钮被禁用（有登录尝试在进行且看门狗尚未触发）
    login_busy: bool,
    monitor: Option<ActiveMonitor>,
    watchdog: Watchdog,

    emails: EmailStore,
    selected: Option<MessageId>,
    in_flight: HashSet<MessageId>,
    loading: bool,
    summarizing_all: bool,
}

impl<X, S, V> App<X, S, V>
where
    X: TokenExchanger,
    S: Summarizer,
    V: View,
{
    pub fn new(
        settings: Settings,
        view: V,
        tasks: TaskRunner<AppEvent>,
        mut flow: LoginFlow<X>,
        make_summarizer: SummarizerFactory<S>,
    ) -> Self {
        let oauth = load_oauth_client(&settings);
        let store = CredentialStore::new(&settings.token_cache_path);
        flow.set_client(oauth.clone());
        flow.set_store(store.clone());
        let summarizer = Arc::new(make_summarizer(&settings));

        let mut app = Self {
            settings,
            view,
            tasks,
            flow: Arc::new(Mutex::new(flow)),
            store,
            oauth,
            make_summarizer,
            summarizer,
            attempt: 0,
            login_busy: false,
            monitor: None,
            watchdog: Watchdog::new(),
            emails: EmailStore::default(),
            selected: None,
            in_flight: HashSet::new(),
            loading: false,
            summarizing_all: false,
        };
        app.view.set_login_enabled(true);
        app.refresh_login_status();
        app
    }

    pub fn handle(&mut self, event_loop: &EventLoop<AppEvent>, event: AppEvent) -> ControlFlow<()> {
        match event {
            AppEvent::LoginRequested => self.on_login_requested(event_loop),
            AppEvent::LogoutRequested => self.on_logout(),
            AppEvent::LoadRequested => self.on_load(),
            AppEvent::SelectIndex(index) => self.on_select(index),
            AppEvent::SummarizeAll => self.on_summarize_all(),
            AppEvent::ReloadSettings => self.on_reload(),
            AppEvent::Quit => {
                self.shutdown(event_loop);
                return ControlFlow::Break(());
            }

            AppEvent::ShowMonitor {
                attempt,
                url,
                outcome,
            } => self.on_show_monitor(event_loop, attempt, &url, outcome),
            AppEvent::MonitorTick(attempt) => self.on_monitor_tick(event_loop, attempt),
            AppEvent::MonitorClose(attempt) => {
                if self.monitor.as_ref().is_some_and(|m| m.attempt == attempt) {
                    self.end_monitor(MonitorOutcome::Detected);
                }
            }
            AppEvent::MonitorCancel => self.on_monitor_cancel(),
            AppEvent::MonitorRetry => self.on_monitor_retry(),
            AppEvent::WatchdogFired(attempt) => self.on_watchdog_fired(attempt),
            AppEvent::LoginFinished { attempt, result } => {
                self.on_login_finished(event_loop, attempt, result)
            }

            AppEvent::EmailsLoaded(result) => self.on_emails_loaded(result),
            AppEvent::SummaryReady { id, result } => self.on_summary_ready(id, result),
            AppEvent::SummaryProgress { done, total } => {
                self.view
                    .set_progress_text(&format!("⏳ 正在生成摘要 {}/{}", done, total));
            }
            AppEvent::AllSummariesReady(result) => self.on_all_summaries_ready(result),
        }
        ControlFlow::Continue(())
    }

    // ---------------------------------------------------------------- 登录

    fn on_login_requested(&mut self, event_loop: &EventLoop<AppEvent>) {
        if self.login_busy {
            self.view.notify(
                NoticeLevel::Warning,
                "登录",
                "已有登录流程正在进行，请在浏览器中完成或取消。",
            );
            return;
        }

        // 授权码已到手、正在换取 Token：不能再取消，也不能开启新尝试
        let state = self.flow.blocking_lock().state().clone();
        if matches!(state, LoginState::CodeReceived | LoginState::Exchanging) {
            tracing::info!("上一次登录正在换取 Token（{}），忽略新的登录请求", state.name());
            self.view.notify(
                NoticeLevel::Warning,
                "登录",
                "已收到授权，正在完成上一次登录，请稍候。",
            );
            return;
        }

        // 看门狗已重新启用按钮：先结束上一次尝试，保证只有一个监听器
        if self.monitor.is_some() {
            tracing::info!("结束上一次未完成的登录尝试");
            self.end_monitor(MonitorOutcome::Cancelled);
            if let Err(e) = self.flow.blocking_lock().cancel() {
                tracing::debug!("上一次登录无法取消: {}", e);
            }
        }

        self.attempt += 1;
        let attempt = self.attempt;
        self.login_busy = true;
        self.view.set_login_enabled(false);
        self.view.set_status(STATUS_LOGGING_IN);
        self.view.set_progress_text("🔐 请在浏览器中完成 Google 登录");

        let deadlines = self.settings.login.watchdog_deadlines();
        self.watchdog
            .arm(event_loop, &deadlines, || AppEvent::WatchdogFired(attempt));

        let flow = Arc::clone(&self.flow);
        let ui = self.tasks.ui().clone();
        self.tasks.submit(
            "login",
            run_login_attempt(flow, ui, attempt),
            move |result| AppEvent::LoginFinished { attempt, result },
        );
    }

    fn on_show_monitor(
        &mut self,
        event_loop: &EventLoop<AppEvent>,
        attempt: u64,
        url: &str,
        outcome: oneshot::Sender<MonitorOutcome>,
    ) {
        if attempt != self.attempt {
            let _ = outcome.send(MonitorOutcome::Cancelled);
            return;
        }

        self.view.show_monitor(url);
        self.monitor = Some(ActiveMonitor {
            attempt,
            monitor: CompletionMonitor::new(self.settings.login.check_every_ticks),
            outcome: Some(outcome),
        });
        event_loop.after(Duration::ZERO, AppEvent::MonitorTick(attempt));
    }

    fn on_monitor_tick(&mut self, event_loop: &EventLoop<AppEvent>, attempt: u64) {
        let timeout = self.settings.login.accept_timeout();
        let flow = &self.flow;
        let Some(active) = self.monitor.as_mut().filter(|m| m.attempt == attempt) else {
            return;
        };

        let mut failure = None;
        let step = active.monitor.tick(|| {
            match flow.blocking_lock().poll_callback(timeout) {
                Ok(captured) => captured,
                Err(e) => {
                    failure = Some(e);
                    true
                }
            }
        });

        let status = match &failure {
            Some(e) => {
                tracing::warn!("⚠️ 回调未带回授权码: {}", e);
                MONITOR_FAILED
            }
            None => active.monitor.status(),
        };
        self.view.monitor_progress(active.monitor.progress(), status);

        match step {
            MonitorStep::Waiting => {
                event_loop.after(
                    self.settings.login.animation_interval(),
                    AppEvent::MonitorTick(attempt),
                );
            }
            MonitorStep::Detected => {
                event_loop.after(self.settings.login.close_delay(), AppEvent::MonitorClose(attempt));
            }
            MonitorStep::Finished => {}
        }
    }

    fn on_monitor_cancel(&mut self) {
        let Some(active) = self.monitor.as_mut() else {
            return;
        };
        if !active.monitor.cancel() {
            return;
        }
        self.view
            .monitor_progress(active.monitor.progress(), active.monitor.status());

        if let Err(e) = self.flow.blocking_lock().cancel() {
            tracing::warn!("取消登录失败: {}", e);
        }
        self.end_monitor(MonitorOutcome::Cancelled);
    }

    fn on_monitor_retry(&mut self) {
        let Some(active) = self.monitor.as_mut() else {
            return;
        };
        if !active.monitor.retry() {
            return;
        }
        let (progress, status) = (active.monitor.progress(), active.monitor.status());

        match self.flow.blocking_lock().retry() {
            Ok(_) => self.view.monitor_progress(progress, status),
            Err(e) => self.view.notify(NoticeLevel::Warning, "重试失败", &e.to_string()),
        }
    }

    fn on_watchdog_fired(&mut self, attempt: u64) {
        self.watchdog.fired();
        if attempt != self.attempt || !self.login_busy {
            return;
        }
        if *self.flow.blocking_lock().state() == LoginState::Success {
            return;
        }

        tracing::warn!("⏰ 登录超时，恢复登录按钮");
        self.login_busy = false;
        self.view.set_login_enabled(true);
        self.view.set_status(STATUS_PENDING_IN_BROWSER);
        self.view
            .set_progress_text("⚠️ 登录仍在进行，等待浏览器完成。");
    }

    fn on_login_finished(
        &mut self,
        event_loop: &EventLoop<AppEvent>,
        attempt: u64,
        result: Result<Result<(), LoginError>, TaskError>,
    ) {
        if attempt != self.attempt {
            tracing::debug!("忽略过期的登录结果（尝试 #{}）", attempt);
            return;
        }

        self.watchdog.disarm(event_loop);
        self.login_busy = false;
        self.view.set_login_enabled(true);
        if self.monitor.as_ref().is_some_and(|m| m.attempt == attempt) {
            self.end_monitor(MonitorOutcome::Cancelled);
        }

        match result {
            Ok(Ok(())) => {
                self.view
                    .set_progress_text("✓ 已连接 Gmail，可以加载邮件");
                self.view
                    .notify(NoticeLevel::Info, "登录", "✓ 登录成功！");
            }
            Ok(Err(LoginError::UserCancelled)) => {
                self.view.set_progress_text("登录已取消");
            }
            Ok(Err(e @ LoginError::ClientSecretsMissing(_))) => {
                let message = format!(
                    "{}\n请从 Google Cloud Console 下载“桌面应用”类型的 OAuth 客户端文件，保存为 {}，然后执行 reload。",
                    e,
                    self.settings.oauth_client_file_path.display()
                );
                self.view.notify(NoticeLevel::Error, "缺少 OAuth 客户端", &message);
            }
            Ok(Err(e)) if e.is_retryable() => {
                self.view.notify(
                    NoticeLevel::Warning,
                    "登录未完成",
                    &format!("{}\n可以再次执行 login 重试。", e),
                );
            }
            Ok(Err(e)) => {
                self.view
                    .notify(NoticeLevel::Error, "登录失败", &e.to_string());
            }
            Err(e) => {
                self.flow.blocking_lock().shutdown();
                self.view
                    .notify(NoticeLevel::Error, "登录失败", &e.to_string());
            }
        }
        self.refresh_login_status();
    }

    /// 关闭监视窗口并把结局交给等待中的登录任务
    fn end_monitor(&mut self, outcome: MonitorOutcome) {
        if let Some(mut active) = self.monitor.take() {
            if let Some(tx) = active.outcome.take() {
                let _ = tx.send(outcome);
            }
            self.view.close_monitor();
        }
    }

    fn on_logout(&mut self) {
        if self.login_busy {
            self.view
                .notify(NoticeLevel::Warning, "退出登录", "登录流程进行中，请稍后再试。");
            return;
        }

        self.end_monitor(MonitorOutcome::Cancelled);
        self.flow.blocking_lock().shutdown();

        match self.store.delete() {
            Ok(_) => {
                self.emails = EmailStore::default();
                self.selected = None;
                self.in_flight.clear();
                self.view.show_emails(&self.emails);
                self.view
                    .notify(NoticeLevel::Info, "退出登录", "✓ 已退出登录");
            }
            Err(e) => {
                self.view
                    .notify(NoticeLevel::Error, "退出登录失败", &format!("{:#}", e));
            }
        }
        self.refresh_login_status();
    }

    fn refresh_login_status(&mut self) {
        let status = if self.store.is_logged_in() {
            STATUS_LOGGED_IN
        } else {
            STATUS_LOGGED_OUT
        };
        self.view.set_status(status);
    }

    // ---------------------------------------------------------------- 邮件

    fn on_load(&mut self) {
        if self.loading {
            return;
        }
        if !self.store.is_logged_in() {
            self.view
                .notify(NoticeLevel::Warning, "加载邮件", "请先执行 login 登录 Gmail。");
            return;
        }
        let Some(oauth) = self.oauth.clone() else {
            self.view.notify(
                NoticeLevel::Error,
                "缺少 OAuth 客户端",
                &format!(
                    "未找到有效的客户端文件: {}",
                    self.settings.oauth_client_file_path.display()
                ),
            );
            return;
        };
        if !self.settings.has_api_key() {
            self.view.notify(
                NoticeLevel::Warning,
                "未配置 Gemini API 密钥",
                &format!(
                    "邮件仍会加载，但无法生成摘要。请在 {} 中设置 GEMINI_API_KEY 后执行 reload。",
                    self.settings.secrets_path().display()
                ),
            );
        }

        self.loading = true;
        self.view.set_progress_text("⏳ 正在从 Gmail 获取邮件...");

        let store = self.store.clone();
        let max_emails = self.settings.max_emails;
        self.tasks.submit(
            "load_inbox",
            async move {
                let client = GmailApiClient::connect(store, oauth).await?;
                load_inbox(&client, max_emails).await
            },
            |result| {
                AppEvent::EmailsLoaded(
                    result
                        .map_err(|e| e.to_string())
                        .and_then(|inner| inner.map_err(|e| format!("{:#}", e))),
                )
            },
        );
    }

    fn on_emails_loaded(&mut self, result: Result<EmailStore, String>) {
        self.loading = false;

        let emails = match result {
            Ok(emails) => emails,
            Err(e) => {
                self.view
                    .set_progress_text(&format!("✗ 错误: {}", truncate_chars(&e, 40)));
                self.view
                    .notify(NoticeLevel::Error, "加载邮件失败", &e);
                return;
            }
        };

        self.emails = emails;
        self.selected = None;
        self.in_flight.clear();
        self.view.show_emails(&self.emails);

        if self.emails.is_empty() {
            self.view.set_progress_text("✓ 主要收件箱中没有邮件");
            self.view
                .notify(NoticeLevel::Info, "加载邮件", "主要收件箱中没有邮件");
            return;
        }

        self.view.notify(
            NoticeLevel::Info,
            "加载邮件",
            &format!("✓ 已加载 {} 封邮件", self.emails.len()),
        );
        if self.settings.summarize_on_load {
            self.on_summarize_all();
        } else {
            self.view
                .set_progress_text("✓ 邮件已加载，选择邮件以生成摘要");
        }
        self.on_select(0);
    }

    fn on_select(&mut self, index: usize) {
        let Some(record) = self.emails.get_index(index).cloned() else {
            self.view.notify(
                NoticeLevel::Warning,
                "选择邮件",
                &format!("没有第 {} 封邮件", index + 1),
            );
            return;
        };

        self.selected = Some(record.id.clone());
        self.view.show_email(&record);

        let waiting = self.summarizing_all || self.in_flight.contains(&record.id);
        if record.summary().is_none() && !waiting {
            self.request_summary(record);
        }
    }

    /// 为单封邮件提交一次摘要任务
    fn request_summary(&mut self, record: Arc<EmailRecord>) {
        let id = record.id.clone();
        self.in_flight.insert(id.clone());

        let summarizer = Arc::clone(&self.summarizer);
        self.tasks.submit(
            "summarize",
            async move { summarizer.summarize(&record.body).await },
            move |result| AppEvent::SummaryReady {
                id,
                result: result
                    .map_err(|e| e.to_string())
                    .and_then(|inner| inner.map_err(|e| e.to_string())),
            },
        );
    }

    fn on_summary_ready(&mut self, id: MessageId, result: Result<String, String>) {
        self.in_flight.remove(&id);

        // 邮件列表可能已经重新加载
        let Some(record) = self.emails.get(&id).cloned() else {
            return;
        };
        let selected = self.selected.as_ref() == Some(&id);

        match result {
            Ok(summary) => {
                if !record.set_summary(summary) {
                    tracing::debug!("邮件 {} 已有摘要，忽略重复结果", id);
                }
                if selected {
                    self.view.show_email(&record);
                }
            }
            Err(e) if selected => {
                self.view.notify(
                    NoticeLevel::Warning,
                    "生成摘要失败",
                    &format!("{}\n重新选择该邮件可以重试。", e),
                );
            }
            Err(e) => tracing::warn!("⚠️ 邮件 {} 摘要失败: {}", id, e),
        }
    }

    fn on_summarize_all(&mut self) {
        if self.summarizing_all {
            return;
        }
        if self.emails.is_empty() {
            self.view
                .notify(NoticeLevel::Info, "批量摘要", "请先执行 load 加载邮件。");
            return;
        }

        self.summarizing_all = true;
        self.view.set_progress_text(&format!(
            "⏳ 正在为 {} 封邮件生成摘要...",
            self.emails.pending_count()
        ));

        let emails = self.emails.clone();
        let summarizer = Arc::clone(&self.summarizer);
        let ui = self.tasks.ui().clone();
        self.tasks.submit(
            "summarize_all",
            async move {
                summarize_all(&emails, summarizer, DEFAULT_WORKERS, move |done, total| {
                    ui.post(AppEvent::SummaryProgress { done, total });
                })
                .await
            },
            |result| AppEvent::AllSummariesReady(result.map_err(|e| e.to_string())),
        );
    }

    fn on_all_summaries_ready(&mut self, result: Result<SummaryReport, String>) {
        self.summarizing_all = false;

        match result {
            Ok(report) => {
                self.view.set_progress_text(&format!(
                    "✓ 摘要完成：新增 {}，已有 {}，失败 {}",
                    report.summarized, report.skipped, report.failed
                ));
                if report.failed > 0 {
                    self.view.notify(
                        NoticeLevel::Warning,
                        "批量摘要",
                        &format!("{} 封邮件摘要失败，可以选择邮件单独重试。", report.failed),
                    );
                }
            }
            Err(e) => self
                .view
                .notify(NoticeLevel::Error, "批量摘要失败", &e),
        }

        if let Some(record) = self.selected.as_ref().and_then(|id| self.emails.get(id)) {
            self.view.show_email(record);
        }
    }

    // ---------------------------------------------------------------- 设置

    fn on_reload(&mut self) {
        if self.login_busy || self.monitor.is_some() {
            self.view.notify(
                NoticeLevel::Warning,
                "重新加载设置",
                "登录流程进行中，请稍后再重新加载设置。",
            );
            return;
        }

        let settings = match self.settings.reload() {
            Ok(settings) => settings,
            Err(e) => {
                self.view
                    .notify(NoticeLevel::Error, "重新加载设置失败", &format!("{:#}", e));
                return;
            }
        };

        self.oauth = load_oauth_client(&settings);
        self.store = CredentialStore::new(&settings.token_cache_path);
        {
            let mut flow = self.flow.blocking_lock();
            flow.set_client(self.oauth.clone());
            flow.set_store(self.store.clone());
        }
        self.summarizer = Arc::new((self.make_summarizer)(&settings));
        self.settings = settings;

        self.view
            .notify(NoticeLevel::Info, "重新加载设置", "✓ 设置已重新加载");
        self.refresh_login_status();
    }

    fn shutdown(&mut self, event_loop: &EventLoop<AppEvent>) {
        self.watchdog.disarm(event_loop);
        self.end_monitor(MonitorOutcome::Cancelled);
        self.flow.blocking_lock().shutdown();
    }

    #[cfg(test)]
    pub fn view(&self) -> &V {
        &self.view
    }

    #[cfg(test)]
    pub fn login_state(&self) -> LoginState {
        self.flow.blocking_lock().state().clone()
    }

    #[cfg(test)]
    pub fn listener_port(&self) -> Option<u16> {
        self.flow.blocking_lock().listener_port()
    }

    #[cfg(test)]
    pub fn watchdog_armed(&self) -> bool {
        self.watchdog.is_armed()
    }

    #[cfg(test)]
    pub fn emails(&self) -> &EmailStore {
        &self.emails
    }
}

/// 一次登录尝试的外层包装（在后台任务中运行）
///
/// 启动监听器并打开浏览器，然后等待监视窗口关闭；检测到回调后完成 Token 交换。
async fn run_login_attempt<X: TokenExchanger>(
    flow: Arc<Mutex<LoginFlow<X>>>,
    ui: LoopHandle<AppEvent>,
    attempt: u64,
) -> Result<(), LoginError> {
    let url = flow.lock().await.start_login()?;

    let (tx, rx) = oneshot::channel();
    if !ui.post(AppEvent::ShowMonitor {
        attempt,
        url,
        outcome: tx,
    }) {
        return Err(LoginError::UserCancelled);
    }

    match rx.await {
        Ok(MonitorOutcome::Detected) => {}
        Ok(MonitorOutcome::Cancelled) | Err(_) => return Err(LoginError::UserCancelled),
    }

    let (request, exchanger) = {
        let mut guard = flow.lock().await;
        (guard.begin_exchange()?, guard.exchanger())
    };
    let result = exchanger.exchange(request).await;
    flow.lock().await.finish_exchange(result)
}

/// 读取 OAuth 客户端配置；不可用时记录警告并返回 `None`
fn load_oauth_client(settings: &Settings) -> Option<OAuthConfig> {
    match OAuthConfig::load(&settings.oauth_client_file_path) {
        Ok(config) if config.is_placeholder() => {
            tracing::warn!("⚠️ OAuth 客户端配置仍是占位符");
            None
        }
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!("⚠️ OAuth 客户端配置不可用: {:#}", e);
            None
        }
    }
}
