use crate::executor::{get_reactor, EX};
use futures::future::poll_fn;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io::{self, Read, Write},
    net::{self, Shutdown, SocketAddr, ToSocketAddrs},
    os::unix::io::{AsRawFd, RawFd},
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// 注册在`Reactor`上的监听套接字
pub struct TcpListener {
    inner: net::TcpListener,
}

impl TcpListener {
    /// 建立监听。套接字注册进`Reactor`并被设为非阻塞，
    /// 所以必须在`block_on`内部调用。
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address to bind"))?;
        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let sk = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sk.set_reuse_address(true)?;
        sk.bind(&addr.into())?;
        sk.listen(libc::SOMAXCONN)?;
        let inner: net::TcpListener = sk.into();
        get_reactor().borrow_mut().add(inner.as_raw_fd())?;
        tracing::debug!(%addr, "listener bound");
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// 等待一个入站连接。accept线程不会被连接处理阻塞。
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        poll_fn(|cx| self.poll_accept(cx)).await
    }

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        match self.inner.accept() {
            Ok((stream, addr)) => Poll::Ready(TcpStream::from_std(stream).map(|s| (s, addr))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                match get_reactor()
                    .borrow_mut()
                    .modify_readable(self.inner.as_raw_fd(), cx)
                {
                    Ok(()) => Poll::Pending,
                    Err(err) => Poll::Ready(Err(err)),
                }
            }
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        if EX.is_set() {
            get_reactor().borrow_mut().delete(self.inner.as_raw_fd());
        }
    }
}

/// 注册在`Reactor`上的连接。实现了tokio的`AsyncRead`/`AsyncWrite`，
/// 可以直接用`AsyncReadExt`/`AsyncWriteExt`读写。
pub struct TcpStream {
    inner: net::TcpStream,
}

impl TcpStream {
    pub(crate) fn from_std(inner: net::TcpStream) -> io::Result<Self> {
        get_reactor().borrow_mut().add(inner.as_raw_fd())?;
        Ok(Self { inner })
    }

    fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match (&this.inner).read(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return match get_reactor().borrow_mut().modify_readable(this.fd(), cx) {
                        Ok(()) => Poll::Pending,
                        Err(err) => Poll::Ready(Err(err)),
                    };
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match (&this.inner).write(buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return match get_reactor().borrow_mut().modify_writable(this.fd(), cx) {
                        Ok(()) => Poll::Pending,
                        Err(err) => Poll::Ready(Err(err)),
                    };
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // TCP套接字没有用户态缓冲
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.inner.shutdown(Shutdown::Write))
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        if EX.is_set() {
            get_reactor().borrow_mut().delete(self.fd());
        }
    }
}
