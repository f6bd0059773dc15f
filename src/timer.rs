use crate::executor::{get_timers, EX};
use std::{
    collections::BTreeMap,
    future::Future,
    mem,
    pin::Pin,
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

/// 定时器队列
///
/// 按`(到期时间, 序号)`排序，序号单调递增，让同一到期时间的定时器保持先来后到。
/// Event Loop在定时器阶段调用`fire_due`，最早到期的最先被唤醒。
pub(crate) struct TimerQueue {
    entries: BTreeMap<(Instant, u64), Waker>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// 登记一个定时器，返回用于改签/取消的序号
    pub fn insert(&mut self, deadline: Instant, waker: Waker) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert((deadline, id), waker);
        id
    }

    /// 替换已登记定时器的`Waker`（任务被移动后重新poll时发生）
    pub fn update(&mut self, deadline: Instant, id: u64, waker: &Waker) {
        if let Some(slot) = self.entries.get_mut(&(deadline, id)) {
            if !slot.will_wake(waker) {
                *slot = waker.clone();
            }
        }
    }

    /// 取消一个定时器。对已触发的定时器是空操作。
    pub fn cancel(&mut self, deadline: Instant, id: u64) {
        self.entries.remove(&(deadline, id));
    }

    /// 最近一个到期时间
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// 距最近一个到期时间还有多久，作为`reactor.wait()`的超时
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// 唤醒所有到期的定时器，返回触发个数
    pub fn fire_due(&mut self, now: Instant) -> usize {
        let later = self.entries.split_off(&(now, u64::MAX));
        let due = mem::replace(&mut self.entries, later);
        let fired = due.len();
        for ((deadline, id), waker) in due {
            tracing::trace!(?deadline, id, "timer fired");
            waker.wake();
        }
        fired
    }
}

/// 在当前Event Loop上睡`duration`，到期后在定时器阶段被唤醒
///
/// 只能在`block_on`内部`await`。
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        deadline: Instant::now() + duration,
        key: None,
    }
}

/// `sleep`返回的`Future`。提前drop会把定时器从队列里摘掉。
pub struct Sleep {
    deadline: Instant,
    key: Option<u64>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if Instant::now() >= self.deadline {
            if let Some(id) = self.key.take() {
                get_timers().borrow_mut().cancel(self.deadline, id);
            }
            return Poll::Ready(());
        }
        let timers = get_timers();
        let mut timers = timers.borrow_mut();
        match self.key {
            Some(id) => timers.update(self.deadline, id, cx.waker()),
            None => self.key = Some(timers.insert(self.deadline, cx.waker().clone())),
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.key.take() {
            if EX.is_set() {
                get_timers().borrow_mut().cancel(self.deadline, id);
            }
        }
    }
}
