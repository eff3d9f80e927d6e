#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};

use dusk::{ChanData, ChanNum, ChannelOpenType, ChannelReqType, ClientAuth, DisconnectReason};
use dusk::{Completion, Error, Event, Outcome, ReqId, Result, Runner, Stats};

/// Work for the connection task
pub(crate) type Command = Box<dyn FnOnce(&mut Runner) + Send>;

/// Controls a connection running on its own task.
///
/// Clones all refer to the same connection. Operations queue a command
/// for the connection task and wait for its result, failing with
/// [`Error::Disconnected`] once the task has finished.
#[derive(Clone)]
pub struct SshHandle {
    cmds: mpsc::Sender<Command>,
    /// Notified after the connection task handles input
    progress: Arc<Notify>,
}

impl core::fmt::Debug for SshHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SshHandle").field("connected", &self.is_connected()).finish()
    }
}

impl SshHandle {
    pub(crate) fn new(cmds: mpsc::Sender<Command>, progress: Arc<Notify>) -> Self {
        Self { cmds, progress }
    }

    /// Whether the connection task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmds.is_closed()
    }

    /// Runs `f` with the [`Runner`] on the connection task
    pub async fn with_runner<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Runner) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let cmd: Command = Box::new(move |r| {
            // the caller may have gone away
            let _ = tx.send(f(r));
        });
        self.cmds.send(cmd).await.map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)
    }

    /// Runs `f` until it returns `Some`, waiting for input between tries
    async fn poll_runner<F, R>(&self, f: F) -> Result<R>
    where
        F: Fn(&mut Runner) -> Result<Option<R>> + Send + Sync + 'static,
        R: Send + 'static,
    {
        let f = Arc::new(f);
        loop {
            // registered before trying, so progress in between isn't missed
            let notified = self.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let g = f.clone();
            if let Some(r) = self.with_runner(move |r| (*g)(r)).await?? {
                return Ok(r);
            }
            if !self.is_connected() {
                return Err(Error::Disconnected);
            }
            notified.await;
        }
    }

    /// Client only. Completes once the method has succeeded, including
    /// partial success.
    pub async fn add_auth_method(&self, method: ClientAuth) -> Result<()> {
        let done = self.with_runner(move |r| r.add_auth_method(method)).await??;
        done.await.into_result()
    }

    pub async fn authenticated(&self) -> Result<bool> {
        self.with_runner(|r| r.authenticated()).await
    }

    pub async fn session_id(&self) -> Result<Option<Vec<u8>>> {
        self.with_runner(|r| r.session_id().map(|s| s.to_vec())).await
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.with_runner(|r| r.stats().clone()).await
    }

    /// Opens a channel, waiting for the peer to confirm
    pub async fn open_channel(&self, ty: ChannelOpenType) -> Result<ChanNum> {
        let (chan, done) = self.with_runner(move |r| r.open_channel(ty)).await??;
        done.await.into_result()?;
        Ok(chan)
    }

    /// Sends a request. With `want_reply` this waits for the peer's answer,
    /// a refusal is [`Error::RequestFailed`].
    pub async fn channel_request(&self, chan: ChanNum, req: ChannelReqType, want_reply: bool) -> Result<()> {
        let done = self.with_runner(move |r| r.channel_request(chan, req, want_reply)).await??;
        done.await.into_result()
    }

    /// Answers an [`Event::ChannelRequest`]
    pub async fn channel_reply(&self, chan: ChanNum, id: ReqId, success: bool) -> Result<()> {
        self.with_runner(move |r| r.channel_reply(chan, id, success)).await?
    }

    /// Writes some of `data`, waiting for window space. Returns the length written.
    pub async fn channel_write(&self, chan: ChanNum, dt: ChanData, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let data: Arc<[u8]> = data.into();
        self.poll_runner(move |r| {
            let n = r.channel_send(chan, dt, &data)?;
            Ok((n > 0).then_some(n))
        })
        .await
    }

    pub async fn channel_write_all(&self, chan: ChanNum, dt: ChanData, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.channel_write(chan, dt, data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Reads up to `max` bytes, waiting until some arrive.
    /// An empty result means end of file.
    pub async fn channel_read(&self, chan: ChanNum, dt: ChanData, max: usize) -> Result<Vec<u8>> {
        self.poll_runner(move |r| {
            let mut buf = vec![0u8; max];
            match r.channel_read(chan, dt, &mut buf) {
                Ok(0) => Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    Ok(Some(buf))
                }
                Err(Error::ChannelEOF) => Ok(Some(Vec::new())),
                Err(e) => Err(e),
            }
        })
        .await
    }

    pub async fn channel_eof(&self, chan: ChanNum) -> Result<()> {
        self.with_runner(move |r| r.channel_eof(chan)).await?
    }

    pub async fn channel_close(&self, chan: ChanNum) -> Result<()> {
        self.with_runner(move |r| r.channel_close(chan)).await?
    }

    /// Client only. Returns the port bound by the server.
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32> {
        let address = address.to_string();
        let done = self.with_runner(move |r| r.tcpip_forward(&address, port)).await??;
        done.await.into_result()
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<()> {
        let address = address.to_string();
        let done = self.with_runner(move |r| r.cancel_tcpip_forward(&address, port)).await??;
        done.await.into_result()
    }

    pub async fn rekey(&self) -> Result<()> {
        self.with_runner(|r| r.rekey()).await?
    }

    /// Sends a DISCONNECT. The connection task then finishes.
    pub async fn disconnect(&self, reason: DisconnectReason, desc: &str) -> Result<()> {
        let desc = desc.to_string();
        self.with_runner(move |r| r.disconnect(reason, &desc)).await
    }
}

/// A [`SshHandle`] for threads outside the tokio runtime.
///
/// Each call blocks until the async operation completes. Calling from
/// within the runtime panics, as with [`tokio::runtime::Handle::block_on()`].
#[derive(Debug, Clone)]
pub struct BlockingHandle {
    inner: SshHandle,
    rt: tokio::runtime::Handle,
}

impl BlockingHandle {
    pub fn new(inner: SshHandle, rt: tokio::runtime::Handle) -> Self {
        Self { inner, rt }
    }

    pub fn handle(&self) -> &SshHandle {
        &self.inner
    }

    pub fn with_runner<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Runner) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.rt.block_on(self.inner.with_runner(f))
    }

    pub fn add_auth_method(&self, method: ClientAuth) -> Result<()> {
        self.rt.block_on(self.inner.add_auth_method(method))
    }

    pub fn open_channel(&self, ty: ChannelOpenType) -> Result<ChanNum> {
        self.rt.block_on(self.inner.open_channel(ty))
    }

    pub fn channel_request(&self, chan: ChanNum, req: ChannelReqType, want_reply: bool) -> Result<()> {
        self.rt.block_on(self.inner.channel_request(chan, req, want_reply))
    }

    pub fn channel_write_all(&self, chan: ChanNum, dt: ChanData, data: &[u8]) -> Result<()> {
        self.rt.block_on(self.inner.channel_write_all(chan, dt, data))
    }

    pub fn channel_read(&self, chan: ChanNum, dt: ChanData, max: usize) -> Result<Vec<u8>> {
        self.rt.block_on(self.inner.channel_read(chan, dt, max))
    }

    pub fn channel_eof(&self, chan: ChanNum) -> Result<()> {
        self.rt.block_on(self.inner.channel_eof(chan))
    }

    pub fn channel_close(&self, chan: ChanNum) -> Result<()> {
        self.rt.block_on(self.inner.channel_close(chan))
    }

    pub fn disconnect(&self, reason: DisconnectReason, desc: &str) -> Result<()> {
        self.rt.block_on(self.inner.disconnect(reason, desc))
    }

    /// Waits for a [`Completion`] obtained through [`with_runner()`](Self::with_runner),
    /// handing it back if `timeout` passes first
    pub fn wait_timeout<T>(&self, mut done: Completion<T>, timeout: Duration) -> Result<Outcome<T>, Completion<T>> {
        match self.rt.block_on(tokio::time::timeout(timeout, &mut done)) {
            Ok(o) => Ok(o),
            Err(_) => {
                trace!("wait timed out after {timeout:?}");
                Err(done)
            }
        }
    }
}

/// Connection events, in the order the engine produced them
#[derive(Debug)]
pub struct Events {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Events {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Event>) -> Self {
        Self { rx }
    }

    /// Returns `None` once the connection task has finished and every
    /// event has been taken
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// For threads outside the runtime
    pub fn blocking_next(&mut self) -> Option<Event> {
        self.rx.blocking_recv()
    }
}
