use nix::fcntl::{fcntl, FcntlArg, OFlag};
use polling::{Event, Poller};
use rustc_hash::FxHashMap;
use std::{
    io,
    os::unix::io::RawFd,
    task::{Context, Waker},
    time::Duration,
};

/// `Reactor`负责封装I/O多路复用
///
/// 每个fd有读、写两个兴趣方向，各自最多挂一个`Waker`（token为`fd*2`和`fd*2+1`）。
/// `wait()`陷入syscall等待，事件就绪后取出对应`Waker`唤醒，向调度队列里推任务。
pub(crate) struct Reactor {
    poller: Poller,
    waker_mapping: FxHashMap<u64, Waker>,
    buffer: Vec<Event>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new().expect("failed to create I/O poller")
    }
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            waker_mapping: FxHashMap::default(),
            buffer: Vec::with_capacity(2048),
        })
    }

    /// 注册一个fd：设置O_NONBLOCK，加入poller（初始不关心任何事件）
    pub fn add(&mut self, fd: RawFd) -> io::Result<()> {
        tracing::trace!(fd, "reactor: add source");
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(errno_to_io)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(errno_to_io)?;
        self.poller.add(fd, Event::none(fd as usize))
    }

    /// 注销一个fd，丢弃它挂着的`Waker`
    pub fn delete(&mut self, fd: RawFd) {
        tracing::trace!(fd, "reactor: delete source");
        self.waker_mapping.remove(&read_token(fd));
        self.waker_mapping.remove(&write_token(fd));
        let _ = self.poller.delete(fd);
    }

    /// 挂上读方向的`Waker`并重新装载兴趣。重复挂载会替换旧的`Waker`。
    pub fn modify_readable(&mut self, fd: RawFd, cx: &mut Context<'_>) -> io::Result<()> {
        self.waker_mapping.insert(read_token(fd), cx.waker().clone());
        self.arm(fd)
    }

    /// 挂上写方向的`Waker`并重新装载兴趣
    pub fn modify_writable(&mut self, fd: RawFd, cx: &mut Context<'_>) -> io::Result<()> {
        self.waker_mapping.insert(write_token(fd), cx.waker().clone());
        self.arm(fd)
    }

    // poller是oneshot语义，每次事件之后兴趣要重新装载；
    // 装载时把两个方向当前挂着的Waker都算进去，避免覆盖另一个方向。
    fn arm(&mut self, fd: RawFd) -> io::Result<()> {
        let mut event = Event::none(fd as usize);
        event.readable = self.waker_mapping.contains_key(&read_token(fd));
        event.writable = self.waker_mapping.contains_key(&write_token(fd));
        self.poller.modify(fd, event)
    }

    /// 阻塞等待I/O事件，然后唤醒所有就绪方向上挂着的`Waker`
    ///
    /// `timeout`为`None`时一直等；定时器存在时由调用方传入最近的到期间隔。
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.buffer.clear();
        let n = self.poller.wait(&mut self.buffer, timeout)?;
        for event in self.buffer.drain(..) {
            let fd = event.key as RawFd;
            if event.readable {
                if let Some(waker) = self.waker_mapping.remove(&read_token(fd)) {
                    waker.wake();
                }
            }
            if event.writable {
                if let Some(waker) = self.waker_mapping.remove(&write_token(fd)) {
                    waker.wake();
                }
            }
        }
        Ok(n)
    }
}

fn read_token(fd: RawFd) -> u64 {
    fd as u64 * 2
}

fn write_token(fd: RawFd) -> u64 {
    fd as u64 * 2 + 1
}

pub(crate) fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}
