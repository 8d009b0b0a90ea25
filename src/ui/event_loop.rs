/// 单线程协作式事件循环
///
/// 所有界面状态只在运行 [`EventLoop::run`] 的线程上被访问。
/// 其他线程通过 [`LoopHandle`] 投递事件；定时器只能在循环线程上创建和取消。
use std::cell::{Cell, RefCell};
use std::ops::ControlFlow;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

/// 定时器标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

enum Message<E> {
    Event(E),
    Quit,
}

struct Timer<E> {
    id: TimerId,
    due: Instant,
    event: E,
}

/// 跨线程投递事件的句柄
pub struct LoopHandle<E> {
    tx: mpsc::Sender<Message<E>>,
}

impl<E> Clone for LoopHandle<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> LoopHandle<E> {
    /// 投递事件，循环已退出时返回 `false`
    pub fn post(&self, event: E) -> bool {
        self.tx.send(Message::Event(event)).is_ok()
    }

    /// 请求循环退出
    pub fn quit(&self) {
        let _ = self.tx.send(Message::Quit);
    }
}

pub struct EventLoop<E> {
    tx: mpsc::Sender<Message<E>>,
    rx: mpsc::Receiver<Message<E>>,
    timers: RefCell<Vec<Timer<E>>>,
    next_id: Cell<u64>,
}

impl<E> Default for EventLoop<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventLoop<E> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            timers: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }

    pub fn handle(&self) -> LoopHandle<E> {
        LoopHandle {
            tx: self.tx.clone(),
        }
    }

    /// `delay` 之后在循环线程上投递一次 `event`
    pub fn after(&self, delay: Duration, event: E) -> TimerId {
        let id = TimerId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        self.timers.borrow_mut().push(Timer {
            id,
            due: Instant::now() + delay,
            event,
        });
        id
    }

    /// 取消尚未触发的定时器，返回是否真的取消了
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut timers = self.timers.borrow_mut();
        let before = timers.len();
        timers.retain(|t| t.id != id);
        timers.len() != before
    }

    #[cfg(test)]
    pub fn pending_timers(&self) -> usize {
        self.timers.borrow().len()
    }

    /// 运行直到处理函数返回 `Break` 或收到退出请求
    pub fn run<F>(&self, mut handler: F)
    where
        F: FnMut(&EventLoop<E>, E) -> ControlFlow<()>,
    {
        loop {
            if let Some(event) = self.pop_due() {
                if handler(self, event).is_break() {
                    return;
                }
                continue;
            }

            let received = match self.next_due() {
                Some(due) => {
                    let wait = due.saturating_duration_since(Instant::now());
                    match self.rx.recv_timeout(wait) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                None => match self.rx.recv() {
                    Ok(message) => message,
                    Err(_) => return,
                },
            };

            match received {
                Message::Event(event) => {
                    if handler(self, event).is_break() {
                        return;
                    }
                }
                Message::Quit => return,
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.timers.borrow().iter().map(|t| t.due).min()
    }

    /// 取出最早到期的定时器（同时到期时按创建顺序）
    fn pop_due(&self) -> Option<E> {
        let now = Instant::now();
        let mut timers = self.timers.borrow_mut();

        let index = timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due <= now)
            .min_by_key(|(_, t)| (t.due, t.id.0))
            .map(|(i, _)| i)?;

        Some(timers.remove(index).event)
    }
}
