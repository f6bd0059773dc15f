use crate::reactor::Reactor;
use crate::timer::TimerQueue;
use futures::{future::LocalBoxFuture, Future, FutureExt};
use std::{
    cell::RefCell,
    collections::VecDeque,
    marker::PhantomData,
    mem,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
    time::Instant,
};

scoped_tls::scoped_thread_local!(pub(crate) static EX: Executor);

/// 取当前线程Event Loop的`Reactor`。只能在`block_on`内部调用。
pub(crate) fn get_reactor() -> Rc<RefCell<Reactor>> {
    EX.with(|ex| ex.reactor.clone())
}

/// 取当前线程Event Loop的定时器队列。只能在`block_on`内部调用。
pub(crate) fn get_timers() -> Rc<RefCell<TimerQueue>> {
    EX.with(|ex| ex.timers.clone())
}

/// `Executor`负责`Task`的调度和执行
///
/// 两条队列对应两类回调：`run_queue`里是宏任务，一次取一个执行；
/// `micro_queue`里是微任务，每执行完一个宏任务（或主`Future`）就被完整清空。
pub struct Executor {
    /// 等待调度的宏任务队列
    run_queue: TaskQueue,
    /// 微任务队列，取下一个宏任务之前必须为空
    micro_queue: TaskQueue,
    pub(crate) reactor: Rc<RefCell<Reactor>>,
    pub(crate) timers: Rc<RefCell<TimerQueue>>,

    /// Make sure the type is `!Send` and `!Sync`.
    _marker: PhantomData<Rc<()>>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// 创建一个新的`Executor`
    pub fn new() -> Self {
        Self {
            run_queue: TaskQueue::default(),
            micro_queue: TaskQueue::default(),
            reactor: Rc::new(RefCell::new(Reactor::default())),
            timers: Rc::new(RefCell::new(TimerQueue::new())),

            _marker: PhantomData,
        }
    }

    /// 把`Future`作为宏任务加入调度队列
    pub fn spawn(fut: impl Future<Output = ()> + 'static) {
        let t = Rc::new(Task {
            future: RefCell::new(Some(fut.boxed_local())),
            kind: QueueKind::Task,
        });
        EX.with(|ex| ex.run_queue.push(t));
    }

    /// 把`Future`作为微任务加入调度队列
    ///
    /// 微任务会在当前宏任务结束后、下一个宏任务开始前执行；
    /// 微任务里再`spawn_micro`的微任务也在同一次清空中执行完。
    /// 一个不断产生微任务的微任务会饿死宏任务队列，这里不做保护。
    pub fn spawn_micro(fut: impl Future<Output = ()> + 'static) {
        let t = Rc::new(Task {
            future: RefCell::new(Some(fut.boxed_local())),
            kind: QueueKind::Micro,
        });
        EX.with(|ex| ex.micro_queue.push(t));
    }

    /// 驱动主`Future`直到完成。每一轮循环按阶段推进：
    /// (in loop)轮询主`Future`，完成就返回；它就是"脚本"，执行完清空一次微任务队列。
    /// (in loop)定时器阶段：触发所有到期的定时器，最早到期的最先触发。
    /// (in loop)宏任务阶段：逐个取出宏任务执行，每执行完一个就把微任务队列清空。
    /// (in loop)再次轮询主`Future`，可能已被刚才的任务唤醒。
    /// (in loop)都没有活干了，就阻塞在`reactor.wait()`上等I/O，
    ///          超时时间取最近一个定时器的到期时间，醒来后回到循环开头。
    pub fn block_on<F, T, O>(&self, f: F) -> O
    where
        F: Fn() -> T,
        T: Future<Output = O> + 'static,
    {
        let _waker = waker_fn::waker_fn(|| {});
        let cx = &mut Context::from_waker(&_waker);

        EX.set(self, || {
            let fut = f();
            pin_utils::pin_mut!(fut);
            loop {
                // script: poll the outer future, then drain its microtasks
                if let Poll::Ready(t) = fut.as_mut().poll(cx) {
                    break t;
                }
                self.drain_micro();

                // timer phase
                self.timers.borrow_mut().fire_due(Instant::now());

                // task phase: one task at a time, microtasks drained after each
                while let Some(t) = self.run_queue.pop() {
                    t.run();
                    self.drain_micro();
                }

                // no task to execute now, it may ready
                if let Poll::Ready(t) = fut.as_mut().poll(cx) {
                    break t;
                }
                self.drain_micro();

                // block for io, but wake up in time for the next timer
                let timeout = self.timers.borrow().next_timeout(Instant::now());
                if let Err(err) = self.reactor.borrow_mut().wait(timeout) {
                    tracing::error!(error = %err, "reactor wait failed");
                }
            }
        })
    }

    /// 清空微任务队列，包括清空过程中新入队的微任务
    fn drain_micro(&self) {
        while let Some(t) = self.micro_queue.pop() {
            t.run();
        }
    }
}

/// 让出执行权：把当前任务重新排到所属队列的末尾，下一次轮到它时恢复
pub async fn yield_now() {
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                return Poll::Ready(());
            }
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    YieldNow { yielded: false }.await
}

/// `Task`属于哪条队列，被唤醒时回到同一条队列
#[derive(Clone, Copy)]
enum QueueKind {
    Task,
    Micro,
}

/// 存储`Task`的队列
pub struct TaskQueue {
    queue: RefCell<VecDeque<Rc<Task>>>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// 创建一个新的`TaskQueue`
    pub fn new() -> Self {
        const DEFAULT_TASK_QUEUE_SIZE: usize = 4096;
        Self::new_with_capacity(DEFAULT_TASK_QUEUE_SIZE)
    }

    /// 创建一个新的`TaskQueue`
    pub fn new_with_capacity(capacity: usize) -> Self {
        Self {
            queue: RefCell::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// 添加一个`Task`
    pub(crate) fn push(&self, runnable: Rc<Task>) {
        tracing::trace!("push task");
        self.queue.borrow_mut().push_back(runnable);
    }

    /// 删除第一个`Task`
    pub(crate) fn pop(&self) -> Option<Rc<Task>> {
        self.queue.borrow_mut().pop_front()
    }
}

/// `Task`是对`Future`的一个简单封装
///
/// `Future`完成后槽位置`None`，之后的虚假唤醒只会空转一次，不会重复轮询。
pub struct Task {
    future: RefCell<Option<LocalBoxFuture<'static, ()>>>,
    kind: QueueKind,
}

impl Task {
    /// 轮询一次`Task`持有的`Future`，完成则丢弃它
    fn run(self: &Rc<Self>) {
        let w = waker(self.clone());
        let mut context = Context::from_waker(&w);
        let mut slot = self.future.borrow_mut();
        if let Some(future) = slot.as_mut() {
            if future.as_mut().poll(&mut context).is_ready() {
                *slot = None;
            }
        }
    }

    /// 唤醒`Task`, 添加到所属队列中等待调度
    fn wake_(self: Rc<Self>) {
        Self::wake_by_ref_(&self)
    }

    /// 唤醒`Task`, 添加到所属队列中等待调度
    fn wake_by_ref_(self: &Rc<Self>) {
        let t = self.clone();
        EX.with(|ex| match t.kind {
            QueueKind::Task => ex.run_queue.push(t),
            QueueKind::Micro => ex.micro_queue.push(t),
        });
    }
}

/// 创建一个和`Task`关联的`Waker`, 当`Task`准备好执行的时候, 调用`Waker`提供的`wake`和`wake_by_ref`方法
fn waker(wake: Rc<Task>) -> Waker {
    let ptr = Rc::into_raw(wake) as *const ();
    let vtable = &Helper::VTABLE;
    unsafe { Waker::from_raw(RawWaker::new(ptr, vtable)) }
}

struct Helper;

impl Helper {
    const VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::clone_waker,
        Self::wake,
        Self::wake_by_ref,
        Self::drop_waker,
    );

    unsafe fn clone_waker(data: *const ()) -> RawWaker {
        increase_refcount(data);
        let vtable = &Self::VTABLE;
        RawWaker::new(data, vtable)
    }

    unsafe fn wake(ptr: *const ()) {
        let rc = Rc::from_raw(ptr as *const Task);
        rc.wake_();
    }

    unsafe fn wake_by_ref(ptr: *const ()) {
        let rc = mem::ManuallyDrop::new(Rc::from_raw(ptr as *const Task));
        rc.wake_by_ref_();
    }

    unsafe fn drop_waker(ptr: *const ()) {
        drop(Rc::from_raw(ptr as *const Task));
    }
}

#[allow(clippy::redundant_clone)] // The clone here isn't actually redundant.
unsafe fn increase_refcount(data: *const ()) {
    // Retain Rc, but don't touch refcount by wrapping in ManuallyDrop
    let rc = mem::ManuallyDrop::new(Rc::<Task>::from_raw(data as *const Task));
    // Now increase refcount, but don't drop new refcount either
    let _rc_clone: mem::ManuallyDrop<_> = rc.clone();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(log: &Rc<RefCell<Vec<&'static str>>>, marker: &'static str) {
        log.borrow_mut().push(marker);
    }

    #[test]
    fn block_on_returns_the_future_output() {
        let ex = Executor::new();
        let out = ex.block_on(|| async { 40 + 2 });
        assert_eq!(out, 42);
    }

    #[test]
    fn spawned_task_runs_before_block_on_returns() {
        let ex = Executor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let seen = log.clone();
        ex.block_on(|| {
            let log = log.clone();
            async move {
                Executor::spawn(async move { record(&log, "task") });
                yield_now().await;
            }
        });
        assert_eq!(*seen.borrow(), vec!["task"]);
    }

    #[test]
    fn microtasks_drain_before_the_next_task() {
        let ex = Executor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let seen = log.clone();
        ex.block_on(|| {
            let log = log.clone();
            async move {
                record(&log, "script start");
                {
                    let log = log.clone();
                    Executor::spawn(async move { record(&log, "task") });
                }
                {
                    let log = log.clone();
                    Executor::spawn_micro(async move {
                        record(&log, "micro 1");
                        let log = log.clone();
                        Executor::spawn_micro(async move { record(&log, "micro 2") });
                    });
                }
                record(&log, "script end");
                yield_now().await;
                record(&log, "done");
            }
        });
        assert_eq!(
            *seen.borrow(),
            vec!["script start", "script end", "micro 1", "micro 2", "task", "done"]
        );
    }

    #[test]
    fn microtask_scheduled_by_a_task_runs_before_the_next_task() {
        let ex = Executor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let seen = log.clone();
        ex.block_on(|| {
            let log = log.clone();
            async move {
                {
                    let log = log.clone();
                    Executor::spawn(async move {
                        record(&log, "task 1");
                        let log = log.clone();
                        Executor::spawn_micro(async move { record(&log, "micro") });
                    });
                }
                {
                    let log = log.clone();
                    Executor::spawn(async move { record(&log, "task 2") });
                }
                yield_now().await;
            }
        });
        assert_eq!(*seen.borrow(), vec!["task 1", "micro", "task 2"]);
    }

    #[test]
    fn yield_now_requeues_at_the_back() {
        let ex = Executor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let seen = log.clone();
        ex.block_on(|| {
            let log = log.clone();
            async move {
                {
                    let log = log.clone();
                    Executor::spawn(async move {
                        record(&log, "a before yield");
                        yield_now().await;
                        record(&log, "a after yield");
                    });
                }
                {
                    let log = log.clone();
                    Executor::spawn(async move { record(&log, "b") });
                }
                yield_now().await;
            }
        });
        assert_eq!(
            *seen.borrow(),
            vec!["a before yield", "b", "a after yield"]
        );
    }
}
