/// 登录看门狗
///
/// 独立于监视器的粗粒度期限。到期后只负责恢复界面（重新启用登录按钮、
/// 更新状态文本），不会停止监听器或监视器。
use std::time::Duration;

use crate::ui::event_loop::{EventLoop, TimerId};

#[derive(Debug, Default)]
pub struct Watchdog {
    /// 尚未触发的期限，按到期先后排列
    timers: Vec<TimerId>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按每个期限各安排一次 `event()`；已布防的旧期限先被撤销
    pub fn arm<E>(
        &mut self,
        event_loop: &EventLoop<E>,
        deadlines: &[Duration],
        event: impl Fn() -> E,
    ) {
        self.disarm(event_loop);

        let mut sorted = deadlines.to_vec();
        sorted.sort();
        self.timers = sorted
            .iter()
            .map(|deadline| event_loop.after(*deadline, event()))
            .collect();
        tracing::debug!("看门狗已布防: {:?}", sorted);
    }

    /// 撤销全部尚未触发的期限
    pub fn disarm<E>(&mut self, event_loop: &EventLoop<E>) {
        for id in self.timers.drain(..) {
            event_loop.cancel(id);
        }
    }

    /// 记录最早的一个期限已经触发
    pub fn fired(&mut self) {
        if !self.timers.is_empty() {
            self.timers.remove(0);
        }
    }

    pub fn is_armed(&self) -> bool {
        !self.timers.is_empty()
    }
}
