/// 后台任务提交
///
/// 把 future 交给 Tokio 运行时执行，完成后将结果转换成事件投递回 UI 循环。
/// 任务中的 panic 在这里被捕获，以 [`TaskError`] 的形式交给 UI 线程处理。
use std::any::Any;
use std::future::Future;
use tokio::runtime::Handle;
use tokio::task::JoinError;

use crate::ui::event_loop::LoopHandle;

/// 任务没有正常返回
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("后台任务异常退出: {0}")]
    Panicked(String),

    #[error("后台任务被取消")]
    Cancelled,
}

impl From<JoinError> for TaskError {
    fn from(error: JoinError) -> Self {
        if error.is_panic() {
            Self::Panicked(panic_message(error.into_panic()))
        } else {
            Self::Cancelled
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知错误".to_string()
    }
}

pub struct TaskRunner<E> {
    rt: Handle,
    ui: LoopHandle<E>,
}

impl<E> Clone for TaskRunner<E> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            ui: self.ui.clone(),
        }
    }
}

impl<E: Send + 'static> TaskRunner<E> {
    pub fn new(rt: Handle, ui: LoopHandle<E>) -> Self {
        Self { rt, ui }
    }

    pub fn ui(&self) -> &LoopHandle<E> {
        &self.ui
    }

    /// 在运行时上执行 `future`，结束后把 `on_done(result)` 投递回 UI 循环
    pub fn submit<T, Fut, D>(&self, name: &'static str, future: Fut, on_done: D)
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        D: FnOnce(Result<T, TaskError>) -> E + Send + 'static,
    {
        let task = self.rt.spawn(future);
        self.deliver(name, task, on_done);
    }

    fn deliver<T, D>(&self, name: &'static str, task: tokio::task::JoinHandle<T>, on_done: D)
    where
        T: Send + 'static,
        D: FnOnce(Result<T, TaskError>) -> E + Send + 'static,
    {
        let ui = self.ui.clone();
        tracing::debug!("提交后台任务: {}", name);

        self.rt.spawn(async move {
            let result = task.await.map_err(TaskError::from);
            if let Err(e) = &result {
                tracing::error!("❌ 后台任务 {} 失败: {}", name, e);
            }
            if !ui.post(on_done(result)) {
                tracing::debug!("UI 循环已退出，丢弃任务 {} 的结果", name);
            }
        });
    }
}
