//! Shared access to a poll-based message stream from `&self`.
//!
//! The stream sits behind a sync mutex that is only taken inside a single
//! `poll` call, never across an await point, so one task can wait on a read
//! while another writes. Writers are additionally serialized so a message and
//! its flush are not interleaved with another writer's.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures::future::poll_fn;
use log::debug;
use parking_lot::Mutex;
use tokio::io::ReadBuf;
use tokio_util::sync::CancellationToken;

use crate::async_stream::{AsyncFlushMessage, AsyncShutdownMessage};
use crate::buffer_pool::{BufferPool, PooledBuf};
use crate::endpoint::{closed_error, with_idle_timeout};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) struct StreamCell<S> {
    stream: Mutex<S>,
    write_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
    idle_timeout: Option<Duration>,
    pool: Arc<BufferPool>,
}

impl<S> StreamCell<S>
where
    S: AsyncFlushMessage + AsyncShutdownMessage + Unpin + Send,
{
    pub fn new(stream: S, idle_timeout: Option<Duration>, pool: Arc<BufferPool>) -> Self {
        Self {
            stream: Mutex::new(stream),
            write_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
            idle_timeout,
            pool,
        }
    }

    pub fn set_idle_timeout(&mut self, idle_timeout: Option<Duration>) {
        self.idle_timeout = idle_timeout;
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Reads one message into a pooled buffer using `poll_read`, returning the
    /// buffer and whatever address the stream reported alongside it.
    pub async fn read_with<T, F>(&self, what: &str, mut poll_read: F) -> std::io::Result<(PooledBuf, T)>
    where
        F: FnMut(Pin<&mut S>, &mut Context<'_>, &mut ReadBuf<'_>) -> Poll<std::io::Result<T>>
            + Send,
        T: Send,
    {
        if self.is_closed() {
            return Err(closed_error());
        }

        let mut buf = self.pool.acquire();
        let (n, value) = {
            let read = poll_fn(|cx| {
                let mut stream = self.stream.lock();
                let mut read_buf = ReadBuf::new(buf.spare_mut());
                let value = ready!(poll_read(Pin::new(&mut *stream), cx, &mut read_buf))?;
                Poll::Ready(Ok((read_buf.filled().len(), value)))
            });
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(closed_error()),
                result = self.deadline(what, read) => result?,
            }
        };
        buf.set_len(n);
        Ok((buf, value))
    }

    /// Writes one message using `poll_write`, then flushes.
    pub async fn write_with<F>(&self, mut poll_write: F) -> std::io::Result<()>
    where
        F: FnMut(Pin<&mut S>, &mut Context<'_>) -> Poll<std::io::Result<()>> + Send,
    {
        if self.is_closed() {
            return Err(closed_error());
        }
        let _guard = self.write_lock.lock().await;
        let write = async {
            poll_fn(|cx| poll_write(Pin::new(&mut *self.stream.lock()), cx)).await?;
            poll_fn(|cx| Pin::new(&mut *self.stream.lock()).poll_flush_message(cx)).await
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(closed_error()),
            result = write => result,
        }
    }

    /// Unblocks pending reads and writes and shuts the stream down once.
    pub async fn close(&self) {
        self.cancel.cancel();
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let shutdown = poll_fn(|cx| Pin::new(&mut *self.stream.lock()).poll_shutdown_message(cx));
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("[StreamCell] shutdown failed: {e}"),
            Err(_) => debug!("[StreamCell] shutdown timed out"),
        }
    }

    async fn deadline<T, F>(&self, what: &str, future: F) -> std::io::Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match self.idle_timeout {
            Some(timeout) => with_idle_timeout(what, timeout, future).await,
            None => future.await,
        }
    }
}

impl<S> Drop for StreamCell<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
