//! Streaming reader for the DATA phase.
//!
//! Yields the message bytes with dot-stuffing removed and reports EOF once
//! the `<CRLF>.<CRLF>` terminator has been consumed. Line endings are passed
//! through untouched.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DotState {
    /// At the start of a line.
    BeginLine,
    /// Saw a leading `.` on a line.
    Dot,
    /// Saw `.\r` at the start of a line.
    DotCr,
    /// Saw `\r` inside a line.
    Cr,
    /// Emitted the `\r` of a `\r\n` pair; the `\n` is next.
    Lf,
    /// Inside a line.
    Data,
    /// Terminator consumed.
    Eof,
}

pub struct DotReader<'a, R> {
    inner: &'a mut R,
    state: DotState,
    read_timeout: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl<'a, R> DotReader<'a, R>
where
    R: AsyncBufRead + Unpin,
{
    /// Wraps `inner`, failing any read that makes no progress for `read_timeout`.
    pub fn new(inner: &'a mut R, read_timeout: Duration) -> Self {
        DotReader {
            inner,
            state: DotState::BeginLine,
            read_timeout,
            deadline: Box::pin(tokio::time::sleep(read_timeout)),
        }
    }

    /// True once the end-of-data marker has been read.
    pub fn is_finished(&self) -> bool {
        self.state == DotState::Eof
    }
}

impl<R> AsyncRead for DotReader<'_, R>
where
    R: AsyncBufRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let start_len = buf.filled().len();

        loop {
            if this.state == DotState::Eof || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            let available = match Pin::new(&mut *this.inner).poll_fill_buf(cx) {
                Poll::Ready(Ok(bytes)) => bytes,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {
                    if buf.filled().len() > start_len {
                        return Poll::Ready(Ok(()));
                    }
                    if this.deadline.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "timed out reading message data",
                        )));
                    }
                    return Poll::Pending;
                }
            };

            if available.is_empty() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before end of message data",
                )));
            }

            let mut consumed = 0;
            while consumed < available.len() && buf.remaining() > 0 {
                let c = available[consumed];
                match this.state {
                    DotState::BeginLine => {
                        if c == b'.' {
                            this.state = DotState::Dot;
                            consumed += 1;
                        } else {
                            this.state = DotState::Data;
                        }
                    }
                    DotState::Dot => {
                        if c == b'\r' {
                            this.state = DotState::DotCr;
                            consumed += 1;
                        } else if c == b'\n' {
                            this.state = DotState::Eof;
                            consumed += 1;
                            break;
                        } else {
                            // Stuffed dot: drop it, keep the rest of the line.
                            this.state = DotState::Data;
                        }
                    }
                    DotState::DotCr => {
                        if c == b'\n' {
                            this.state = DotState::Eof;
                            consumed += 1;
                            break;
                        }
                        buf.put_slice(b"\r");
                        this.state = DotState::Data;
                    }
                    DotState::Cr => {
                        buf.put_slice(b"\r");
                        this.state = if c == b'\n' {
                            DotState::Lf
                        } else {
                            DotState::Data
                        };
                    }
                    DotState::Lf => {
                        buf.put_slice(b"\n");
                        this.state = DotState::BeginLine;
                        consumed += 1;
                    }
                    DotState::Data => {
                        consumed += 1;
                        match c {
                            b'\r' => this.state = DotState::Cr,
                            b'\n' => {
                                buf.put_slice(b"\n");
                                this.state = DotState::BeginLine;
                            }
                            _ => buf.put_slice(&[c]),
                        }
                    }
                    DotState::Eof => break,
                }
            }

            Pin::new(&mut *this.inner).consume(consumed);
            let deadline = Instant::now() + this.read_timeout;
            this.deadline.as_mut().reset(deadline);

            if buf.filled().len() > start_len || this.state == DotState::Eof {
                return Poll::Ready(Ok(()));
            }
        }
    }
}
