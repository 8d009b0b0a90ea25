/// 登录完成监视器
///
/// 由事件循环的动画节拍驱动，每隔若干节拍检查一次回调是否到达。
/// 本身不持有定时器，也不接触监听器，只记录进度与结局。

/// 每个节拍进度条前进的比例
const PROGRESS_STEP: f32 = 0.05;

pub const STATUS_WAITING: &str = "⏳ 等待浏览器完成登录...";
pub const STATUS_SUCCESS: &str = "✓ 登录成功！";
pub const STATUS_CANCELLED: &str = "✓ 已取消登录";

/// 一个节拍的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStep {
    /// 继续等待
    Waiting,
    /// 本节拍检测到回调
    Detected,
    /// 监视器已经结束，不应再调度节拍
    Finished,
}

/// 监视窗口关闭时的结局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    Detected,
    Cancelled,
}

#[derive(Debug)]
pub struct CompletionMonitor {
    ticks: u32,
    check_every: u32,
    progress: f32,
    outcome: Option<MonitorOutcome>,
    status: &'static str,
}

impl CompletionMonitor {
    pub fn new(check_every: u32) -> Self {
        Self {
            ticks: 0,
            check_every: check_every.max(1),
            progress: 0.0,
            outcome: None,
            status: STATUS_WAITING,
        }
    }

    /// 推进一个动画节拍；每 `check_every` 个节拍调用一次 `check`（第一个节拍即检查）
    pub fn tick(&mut self, check: impl FnOnce() -> bool) -> MonitorStep {
        if self.outcome.is_some() {
            return MonitorStep::Finished;
        }

        self.progress = (self.progress + PROGRESS_STEP) % 1.0;

        let due = self.ticks % self.check_every == 0;
        self.ticks += 1;

        if due && check() {
            self.outcome = Some(MonitorOutcome::Detected);
            self.progress = 1.0;
            self.status = STATUS_SUCCESS;
            return MonitorStep::Detected;
        }
        MonitorStep::Waiting
    }

    /// 用户取消：结束监视但不算检测成功。已结束时返回 `false`
    pub fn cancel(&mut self) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(MonitorOutcome::Cancelled);
        self.status = STATUS_CANCELLED;
        true
    }

    /// 用户重试：不结束监视，节拍计数归零
    pub fn retry(&mut self) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.ticks = 0;
        self.status = STATUS_WAITING;
        true
    }

    #[cfg(test)]
    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn status(&self) -> &'static str {
        self.status
    }

    #[cfg(test)]
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// 结束后的结局；仍在等待时为 `None`
    #[cfg(test)]
    pub fn outcome(&self) -> Option<MonitorOutcome> {
        self.outcome
    }
}
