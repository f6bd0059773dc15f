use crate::executor::{get_reactor, EX};
use crate::reactor::errno_to_io;
use std::{
    any::Any,
    future::Future,
    io,
    os::unix::io::RawFd,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::mpsc,
    task::{Context, Poll},
    thread,
};
use thiserror::Error;

/// `Worker`的失败方式
#[derive(Debug, Error)]
pub enum WorkerError {
    /// 收件箱已关闭，消息发不进去
    #[error("worker is gone")]
    Disconnected,
    /// `Worker`没有回复就退出了
    #[error("worker exited without replying")]
    Failed,
    /// `Worker`线程在处理消息时panic，附带panic消息
    #[error("worker panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

type Envelope<Req, Resp> = (Req, mpsc::Sender<Result<Resp, String>>);

/// 一次性卸载用的`Worker`线程
///
/// 拥有独立的调用栈和状态，和Event Loop线程只通过消息传递通信：
/// 请求走`mpsc`收件箱，每条请求带一个专属的回复通道。
/// 回复发出后`Worker`向管道写一个字节，`Reactor`收到可读事件就唤醒等待的任务，
/// 这样Event Loop线程从头到尾不会阻塞在`Worker`上。
///
/// 没有池化、复用和重试：演示的用法是每个请求起一个`Worker`，用完就`terminate`。
pub struct Worker<Req, Resp> {
    tx: Option<mpsc::Sender<Envelope<Req, Resp>>>,
    notify_rd: RawFd,
    handle: Option<thread::JoinHandle<()>>,
}

impl<Req, Resp> Worker<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// 起一个`Worker`线程。通知管道要注册进`Reactor`，
    /// 所以必须在`block_on`内部调用。
    pub fn spawn<F>(handler: F) -> Result<Self, WorkerError>
    where
        F: FnMut(Req) -> Resp + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Envelope<Req, Resp>>();
        let (notify_rd, notify_wr) = nix::unistd::pipe().map_err(errno_to_io)?;
        get_reactor().borrow_mut().add(notify_rd)?;
        let handle = thread::Builder::new()
            .name("offload-worker".into())
            .spawn(move || worker_loop(rx, notify_wr, handler))?;
        tracing::debug!(notify_rd, "worker spawned");
        Ok(Self {
            tx: Some(tx),
            notify_rd,
            handle: Some(handle),
        })
    }
}

impl<Req, Resp> Worker<Req, Resp> {
    /// 发一条消息并等待回复。不阻塞Event Loop线程。
    pub async fn call(&self, req: Req) -> Result<Resp, WorkerError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .as_ref()
            .ok_or(WorkerError::Disconnected)?
            .send((req, reply_tx))
            .map_err(|_| WorkerError::Disconnected)?;
        Reply {
            rx: reply_rx,
            notify_rd: self.notify_rd,
        }
        .await
    }

    /// 关闭收件箱并等`Worker`线程退出
    pub fn terminate(mut self) -> thread::Result<()> {
        self.tx.take();
        let result = match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        };
        self.close_notify();
        result
    }

    fn close_notify(&mut self) {
        if self.notify_rd >= 0 {
            if EX.is_set() {
                get_reactor().borrow_mut().delete(self.notify_rd);
            }
            let _ = nix::unistd::close(self.notify_rd);
            self.notify_rd = -1;
        }
    }
}

impl<Req, Resp> Drop for Worker<Req, Resp> {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.close_notify();
    }
}

fn worker_loop<Req, Resp, F>(
    rx: mpsc::Receiver<Envelope<Req, Resp>>,
    notify_wr: RawFd,
    mut handler: F,
) where
    F: FnMut(Req) -> Resp,
{
    while let Ok((req, reply_tx)) = rx.recv() {
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(req))).map_err(panic_message);
        let failed = outcome.is_err();
        let _ = reply_tx.send(outcome);
        let _ = nix::unistd::write(notify_wr, &[1u8]);
        // panic过的handler不再信任，结束线程
        if failed {
            break;
        }
    }
    let _ = nix::unistd::close(notify_wr);
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// `call`返回的`Future`：回复没到就挂在通知管道的可读事件上
struct Reply<Resp> {
    rx: mpsc::Receiver<Result<Resp, String>>,
    notify_rd: RawFd,
}

impl<Resp> Future for Reply<Resp> {
    type Output = Result<Resp, WorkerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.rx.try_recv() {
            Ok(outcome) => return Poll::Ready(outcome.map_err(WorkerError::Panicked)),
            Err(mpsc::TryRecvError::Disconnected) => return Poll::Ready(Err(WorkerError::Failed)),
            Err(mpsc::TryRecvError::Empty) => {}
        }

        drain_notify(this.notify_rd);
        if let Err(err) = get_reactor()
            .borrow_mut()
            .modify_readable(this.notify_rd, cx)
        {
            return Poll::Ready(Err(WorkerError::Io(err)));
        }

        // 排掉"清空管道和挂Waker之间回复刚好到达"的竞争
        match this.rx.try_recv() {
            Ok(outcome) => Poll::Ready(outcome.map_err(WorkerError::Panicked)),
            Err(mpsc::TryRecvError::Disconnected) => Poll::Ready(Err(WorkerError::Failed)),
            Err(mpsc::TryRecvError::Empty) => Poll::Pending,
        }
    }
}

/// 把通知管道里积压的字节读干净（fd已被`Reactor`设为非阻塞）
fn drain_notify(fd: RawFd) {
    let mut buf = [0u8; 8];
    while let Ok(n) = nix::unistd::read(fd, &mut buf) {
        if n == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use assert_matches::assert_matches;

    #[test]
    fn call_round_trips_through_the_worker() {
        let ex = Executor::new();
        let doubled = ex.block_on(|| async {
            let worker = Worker::spawn(|n: u64| n * 2).unwrap();
            let reply = worker.call(21).await;
            worker.terminate().unwrap();
            reply
        });
        assert_eq!(doubled.unwrap(), 42);
    }

    #[test]
    fn sequential_calls_reuse_the_same_worker() {
        let ex = Executor::new();
        let replies = ex.block_on(|| async {
            let worker = Worker::spawn(|s: String| s.to_uppercase()).unwrap();
            let first = worker.call("ping".to_string()).await;
            let second = worker.call("pong".to_string()).await;
            worker.terminate().unwrap();
            (first, second)
        });
        assert_eq!(replies.0.unwrap(), "PING");
        assert_eq!(replies.1.unwrap(), "PONG");
    }

    #[test]
    fn a_panicking_worker_reports_the_panic_message() {
        let ex = Executor::new();
        let reply = ex.block_on(|| async {
            let worker = Worker::spawn(|_: u64| -> u64 { panic!("boom") }).unwrap();
            let reply = worker.call(1).await;
            worker.terminate().unwrap();
            reply
        });
        assert_matches!(reply, Err(WorkerError::Panicked(msg)) if msg.contains("boom"));
    }
}
