//! Streaming adapters for send and receive. The kernel moves stream bytes
//! through a file descriptor rather than the control call, so each
//! operation gets a pipe plus one auxiliary task that blocks inside the
//! ioctl and reports the final status over a one-shot channel. The caller
//! keeps the other pipe end, wrapped in an `AsyncFd` and polled from a
//! byte-stream trait.

use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use log::trace;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, Interest, ReadBuf};
use tokio::sync::oneshot;
use tokio::task;

use crate::error::{Error, Result};
use crate::nvlist::{NvList, ToNvlist};
use crate::ops::{check_partial, ReceiveOptions, SendOptions};
use crate::sys::{Ioc, ZfsCmd};
use crate::Handle;

/// Size of a send stream's begin record, which the receive operation wants
/// inside the request nvlist instead of down the pipe.
pub const BEGIN_RECORD_SIZE: usize = 312;

impl Handle {
    /// Starts a send of `name` and returns the stream to read from.
    ///
    /// At least one byte is peeked off the pipe before this returns, so a
    /// send that cannot start (bad snapshot name, missing bookmark) fails
    /// here instead of on the first read. Dropping the stream closes the
    /// pipe and thereby cancels the producer.
    pub async fn send(&self, name: &str, options: &SendOptions) -> Result<SendStream> {
        let (read_end, write_end) = pipe().map_err(Error::Pipe)?;

        let mut req = options.to_nvlist()?;
        req.insert("fd", write_end.as_raw_fd());

        let (status_tx, status_rx) = oneshot::channel();
        let handle = self.clone();
        let target = name.to_owned();
        task::spawn_blocking(move || {
            let mut cmd = ZfsCmd::default();
            let mut reply = NvList::new();
            let res = handle.call(Ioc::SendNew, &target, &mut cmd, Some(&req), Some(&mut reply), None);
            trace!("send producer for {target:?} finished: {res:?}");
            // Close our write end first so the reader sees end-of-pipe,
            // then publish the verdict it will block on.
            drop(write_end);
            let _ = status_tx.send(res);
        });

        set_nonblocking(read_end.as_raw_fd()).map_err(Error::Pipe)?;
        let mut stream = SendStream {
            pipe: AsyncFd::with_interest(read_end, Interest::READABLE).map_err(Error::Pipe)?,
            peeked: Vec::new(),
            status: Some(status_rx),
            at_eof: false,
        };
        stream.peek_one().await?;
        Ok(stream)
    }

    /// Starts a receive into `name` and returns the stream to write into.
    ///
    /// The first [`BEGIN_RECORD_SIZE`] bytes written are buffered into the
    /// request; the kernel is not invoked until they are complete. Call
    /// [`ReceiveStream::finish`] to synchronize on the result; dropping
    /// the stream instead tears the pipe down and cancels the consumer.
    pub async fn receive(&self, name: &str, options: &ReceiveOptions) -> Result<ReceiveStream> {
        let (read_end, write_end) = pipe().map_err(Error::Pipe)?;

        let req = options.to_nvlist()?;
        let (begin_tx, begin_rx) = oneshot::channel::<Vec<u8>>();
        let (status_tx, status_rx) = oneshot::channel();
        let handle = self.clone();
        let target = name.to_owned();
        task::spawn_blocking(move || {
            let begin = match begin_rx.blocking_recv() {
                Ok(begin) if begin.len() == BEGIN_RECORD_SIZE => begin,
                _ => {
                    let _ = status_tx.send(Err(Error::InvalidValue(
                        "stream ended before the begin record completed",
                    )));
                    return;
                }
            };
            let mut req = req;
            req.insert("input_fd", read_end.as_raw_fd());
            req.insert("begin_record", begin);
            let mut cmd = ZfsCmd::default();
            let mut reply = NvList::new();
            let res = handle
                .call(Ioc::RecvNew, &target, &mut cmd, Some(&req), Some(&mut reply), None)
                .and_then(|_| receive_verdict(&reply));
            trace!("receive consumer for {target:?} finished: {res:?}");
            drop(read_end);
            let _ = status_tx.send(res);
        });

        set_nonblocking(write_end.as_raw_fd()).map_err(Error::Pipe)?;
        Ok(ReceiveStream {
            pipe: AsyncFd::with_interest(write_end, Interest::WRITABLE).map_err(Error::Pipe)?,
            begin: Vec::with_capacity(BEGIN_RECORD_SIZE),
            begin_tx: Some(begin_tx),
            status: Some(status_rx),
            failed: false,
        })
    }
}

/// A successful control call can still report structured per-property
/// failures in its output nvlist.
fn receive_verdict(reply: &NvList) -> Result<()> {
    if reply.get_u64("error_flags").unwrap_or(0) == 0 {
        return Ok(());
    }
    match reply.get_list("errors") {
        Some(errors) => check_partial(errors),
        None => Err(Error::StreamFailed),
    }
}

/// The read side of an in-flight send.
///
/// Stream bytes come first; once the pipe drains, the reader blocks on the
/// producer's final status and surfaces a failure in place of the clean
/// end-of-stream.
#[derive(Debug)]
pub struct SendStream {
    pipe: AsyncFd<OwnedFd>,
    // Bytes taken off the pipe before the stream was handed out, replayed
    // ahead of everything else.
    peeked: Vec<u8>,
    status: Option<oneshot::Receiver<Result<()>>>,
    at_eof: bool,
}

impl SendStream {
    async fn peek_one(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        loop {
            let mut guard = self.pipe.readable().await.map_err(Error::Pipe)?;
            match guard.try_io(|fd| raw_read(fd.get_ref().as_raw_fd(), &mut byte)) {
                Ok(Ok(0)) => {
                    // The producer quit without a single byte; its status
                    // tells whether that was a failure or an empty stream.
                    self.at_eof = true;
                    return self.take_status().await;
                }
                Ok(Ok(_)) => {
                    self.peeked.push(byte[0]);
                    return Ok(());
                }
                Ok(Err(err)) => return Err(Error::Pipe(err)),
                Err(_would_block) => continue,
            }
        }
    }

    async fn take_status(&mut self) -> Result<()> {
        match self.status.take() {
            Some(rx) => rx.await.unwrap_or(Err(Error::StreamFailed)),
            None => Ok(()),
        }
    }
}

impl AsyncRead for SendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.peeked.is_empty() {
            let n = this.peeked.len().min(buf.remaining());
            buf.put_slice(&this.peeked[..n]);
            this.peeked.drain(..n);
            return Poll::Ready(Ok(()));
        }

        loop {
            if this.at_eof {
                // End-of-pipe observed; the final status gets delivered
                // exactly once, after which reads are plain EOF.
                return match this.status.as_mut() {
                    Some(rx) => {
                        let res = ready!(Pin::new(rx).poll(cx));
                        this.status = None;
                        match res {
                            Ok(Ok(())) => Poll::Ready(Ok(())),
                            Ok(Err(err)) => Poll::Ready(Err(err.into())),
                            Err(_) => Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::BrokenPipe,
                                Error::StreamFailed,
                            ))),
                        }
                    }
                    None => Poll::Ready(Ok(())),
                };
            }

            let mut guard = ready!(this.pipe.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|fd| raw_read(fd.get_ref().as_raw_fd(), unfilled)) {
                Ok(Ok(0)) => this.at_eof = true,
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// The write side of an in-flight receive.
pub struct ReceiveStream {
    pipe: AsyncFd<OwnedFd>,
    begin: Vec<u8>,
    begin_tx: Option<oneshot::Sender<Vec<u8>>>,
    status: Option<oneshot::Receiver<Result<()>>>,
    failed: bool,
}

impl ReceiveStream {
    /// Waits for the kernel to finish applying the stream and returns its
    /// verdict, then closes the pipe.
    pub async fn finish(mut self) -> Result<()> {
        // If the begin record never completed, waking the consumer with a
        // dropped channel makes it report that instead of blocking.
        self.begin_tx.take();
        match self.status.take() {
            Some(rx) => rx.await.unwrap_or(Err(Error::StreamFailed)),
            None => Ok(()),
        }
    }
}

impl AsyncWrite for ReceiveStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.failed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                Error::StreamFailed,
            )));
        }

        // The begin record is siphoned off into the request; only what
        // follows goes down the pipe.
        if this.begin_tx.is_some() {
            let want = BEGIN_RECORD_SIZE - this.begin.len();
            let take = want.min(buf.len());
            this.begin.extend_from_slice(&buf[..take]);
            if this.begin.len() == BEGIN_RECORD_SIZE {
                let tx = this.begin_tx.take().expect("begin channel present");
                let _ = tx.send(std::mem::take(&mut this.begin));
            }
            if take > 0 {
                return Poll::Ready(Ok(take));
            }
        }

        loop {
            let mut guard = ready!(this.pipe.poll_write_ready(cx))?;
            match guard.try_io(|fd| raw_write(fd.get_ref().as_raw_fd(), buf)) {
                Ok(Ok(n)) => return Poll::Ready(Ok(n)),
                Ok(Err(err)) if err.kind() == io::ErrorKind::BrokenPipe => {
                    this.failed = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        Error::StreamFailed,
                    )));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Pipe writes are not buffered here.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Marks only our end non-blocking; the end handed to the kernel has to
/// stay blocking.
fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Drives the pipe plumbing of SendStream without a kernel: a plain
    // thread plays the producer.
    fn fake_send(payload: &'static [u8], result: crate::Result<()>) -> SendStream {
        let (read_end, write_end) = pipe().unwrap();
        let (tx, rx) = oneshot::channel();
        std::thread::spawn(move || {
            let mut written = 0;
            while written < payload.len() {
                written += raw_write(write_end.as_raw_fd(), &payload[written..]).unwrap();
            }
            drop(write_end);
            let _ = tx.send(result);
        });
        set_nonblocking(read_end.as_raw_fd()).unwrap();
        SendStream {
            pipe: AsyncFd::with_interest(read_end, Interest::READABLE).unwrap(),
            peeked: Vec::new(),
            status: Some(rx),
            at_eof: false,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_stream_replays_peeked_bytes_in_order() {
        let mut stream = fake_send(b"abcdefgh", Ok(()));
        stream.peek_one().await.unwrap();
        assert_eq!(stream.peeked, b"a");

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdefgh");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_stream_surfaces_late_failure_after_the_bytes() {
        let mut stream = fake_send(b"abc", Err(Error::from_errno(libc::EIO)));
        stream.peek_one().await.unwrap();

        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(out, b"abc");
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_stream_fails_synchronously_when_nothing_was_produced() {
        let mut stream = fake_send(b"", Err(Error::from_errno(libc::ENOENT)));
        let err = stream.peek_one().await.unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn receive_stream_splits_off_the_begin_record() {
        let (read_end, write_end) = pipe().unwrap();
        let (begin_tx, begin_rx) = oneshot::channel::<Vec<u8>>();
        let (status_tx, status_rx) = oneshot::channel();

        set_nonblocking(write_end.as_raw_fd()).unwrap();
        let mut stream = ReceiveStream {
            pipe: AsyncFd::with_interest(write_end, Interest::WRITABLE).unwrap(),
            begin: Vec::with_capacity(BEGIN_RECORD_SIZE),
            begin_tx: Some(begin_tx),
            status: Some(status_rx),
            failed: false,
        };

        // The consumer reads a known amount of tail, like the kernel
        // stopping at the stream's end record, then reports its verdict.
        let tail = b"streamed-tail";
        let consumer = std::thread::spawn(move || {
            let begin = begin_rx.blocking_recv().unwrap();
            let mut rest = Vec::new();
            let mut buf = [0u8; 64];
            while rest.len() < tail.len() {
                let n = raw_read(read_end.as_raw_fd(), &mut buf).unwrap();
                assert_ne!(n, 0, "pipe closed before the tail arrived");
                rest.extend_from_slice(&buf[..n]);
            }
            let _ = status_tx.send(Ok(()));
            (begin, rest)
        });

        let mut payload = vec![7u8; BEGIN_RECORD_SIZE];
        payload.extend_from_slice(tail);
        stream.write_all(&payload).await.unwrap();
        stream.finish().await.unwrap();

        let (begin, rest) = consumer.join().unwrap();
        assert_eq!(begin, vec![7u8; BEGIN_RECORD_SIZE]);
        assert_eq!(rest, b"streamed-tail");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn receive_stream_reports_a_short_begin_record() {
        let (_read_end, write_end) = pipe().unwrap();
        let (begin_tx, begin_rx) = oneshot::channel::<Vec<u8>>();
        let (status_tx, status_rx) = oneshot::channel();

        let consumer = std::thread::spawn(move || {
            if begin_rx.blocking_recv().is_err() {
                let _ = status_tx.send(Err(Error::InvalidValue(
                    "stream ended before the begin record completed",
                )));
            }
        });

        set_nonblocking(write_end.as_raw_fd()).unwrap();
        let mut stream = ReceiveStream {
            pipe: AsyncFd::with_interest(write_end, Interest::WRITABLE).unwrap(),
            begin: Vec::with_capacity(BEGIN_RECORD_SIZE),
            begin_tx: Some(begin_tx),
            status: Some(status_rx),
            failed: false,
        };

        stream.write_all(&[0u8; 17]).await.unwrap();
        let err = stream.finish().await.unwrap_err();
        assert!(matches!(err, Error::InvalidValue(_)));
        consumer.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn receive_verdict_maps_property_errors() {
        let mut errors = NvList::new();
        errors.insert("atime", libc::EINVAL);
        let mut reply = NvList::new();
        reply.insert("read_bytes", 100u64);
        reply.insert("error_flags", 1u64);
        reply.insert("errors", errors);

        match receive_verdict(&reply).unwrap_err() {
            Error::Partial(map) => assert_eq!(map.get("atime"), Some(&libc::EINVAL)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(receive_verdict(&NvList::new()).is_ok());
    }
}
