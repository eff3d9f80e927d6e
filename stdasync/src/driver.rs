//! The connection task. It owns the [`Runner`] and the socket, everything
//! else reaches the runner through the command queue.

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use dusk::{ClientSetup, Config, DisconnectReason, Error, Event, Result, Runner};

use crate::handle::{Command, Events, SshHandle};

/// Commands queued before senders wait
const COMMAND_QUEUE: usize = 64;

const RX_BUF: usize = 4096;
const TX_BUF: usize = 16 * 1024;

/// Runs `runner` over `stream` on a new task.
///
/// The task finishes when the connection closes, with the fatal error if
/// there was one. Dropping every [`SshHandle`] disconnects.
pub fn spawn<S>(stream: S, runner: Runner) -> (SshHandle, Events, JoinHandle<Result<()>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let progress = Arc::new(Notify::new());
    let handle = SshHandle::new(cmd_tx, progress.clone());

    let task = tokio::spawn(async move {
        let r = run(stream, runner, cmd_rx, ev_tx, &progress).await;
        // wake anything still waiting, it will find the queue closed
        progress.notify_waiters();
        if let Err(e) = &r {
            info!("Connection ended: {e}");
        }
        r
    });
    (handle, Events::new(ev_rx), task)
}

/// Connects to a server over TCP
pub async fn connect(
    addr: impl ToSocketAddrs,
    conf: Config,
    setup: ClientSetup,
) -> Result<(SshHandle, Events, JoinHandle<Result<()>>)> {
    let runner = Runner::new_client(conf, setup)?;
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    if let Ok(peer) = stream.peer_addr() {
        debug!("Connected to {peer}");
    }
    Ok(spawn(stream, runner))
}

async fn write_output<S: AsyncWrite>(
    runner: &mut Runner,
    wsock: &mut WriteHalf<S>,
    buf: &mut [u8],
) -> std::io::Result<()> {
    loop {
        // output() only fails for an error that has already closed the runner
        let l = match runner.output(buf) {
            Ok(l) => l,
            Err(e) => {
                debug!("Output failed: {e}");
                0
            }
        };
        if l == 0 {
            break;
        }
        wsock.write_all(&buf[..l]).await?;
    }
    wsock.flush().await
}

fn forward_events(runner: &mut Runner, events: &mpsc::UnboundedSender<Event>) {
    while let Some(ev) = runner.next_event() {
        trace!("Event {ev:?}");
        // the application may have dropped its Events
        let _ = events.send(ev);
    }
}

async fn run<S>(
    stream: S,
    mut runner: Runner,
    mut cmds: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<Event>,
    progress: &Notify,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut rsock, mut wsock) = tokio::io::split(stream);
    let mut rxbuf = vec![0u8; RX_BUF];
    let mut txbuf = vec![0u8; TX_BUF];
    let mut fatal = None;

    loop {
        // includes a final DISCONNECT
        if let Err(e) = write_output(&mut runner, &mut wsock, &mut txbuf).await {
            if runner.is_closed() {
                debug!("Write after close failed: {e}");
            } else {
                info!("Socket write error: {e}");
                runner.disconnect(DisconnectReason::ConnectionLost, "Write failed");
                forward_events(&mut runner, &events);
                return Err(e.into());
            }
        }
        forward_events(&mut runner, &events);

        if runner.is_closed() {
            let _ = wsock.shutdown().await;
            return fatal.map_or(Ok(()), Err);
        }

        let timeout = runner.next_timeout();
        let sleep = async {
            match timeout {
                Some(t) => tokio::time::sleep_until(t.into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            r = rsock.read(&mut rxbuf) => {
                let l = match r {
                    Ok(l) => l,
                    Err(e) => {
                        info!("Socket read error: {e}");
                        0
                    }
                };
                if l == 0 {
                    debug!("net EOF");
                    runner.disconnect(DisconnectReason::ConnectionLost, "Connection lost");
                    forward_events(&mut runner, &events);
                    progress.notify_waiters();
                    return Err(Error::Disconnected);
                }
                if let Err(e) = runner.input(&rxbuf[..l]) {
                    fatal = Some(e);
                }
                progress.notify_waiters();
            }

            cmd = cmds.recv() => match cmd {
                Some(cmd) => cmd(&mut runner),
                None => {
                    debug!("All handles dropped");
                    runner.disconnect(DisconnectReason::ByApplication, "Closed");
                }
            },

            _ = sleep => {
                if let Err(e) = runner.handle_timeouts(Instant::now()) {
                    fatal = Some(e);
                }
                progress.notify_waiters();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    use dusk::{ChanData, ChannelOpenType, ClientAuth};

    #[tokio::test]
    async fn peer_disconnect_ends_both() -> anyhow::Result<()> {
        init_test_log();
        let mut p = Pair::new(Config::default());
        p.cli.add_auth_method(ClientAuth::password(PASSWORD)).await?;
        p.cli.disconnect(DisconnectReason::ByApplication, "bye").await?;

        p.cli_task.await??;
        p.serv_task.await??;
        let reason = disconnect_reason(&mut p.serv_ev).await;
        assert_eq!(reason, Some(DisconnectReason::ByApplication as u32));
        Ok(())
    }

    #[tokio::test]
    async fn dropped_handles_disconnect() -> anyhow::Result<()> {
        init_test_log();
        let mut p = Pair::new(Config::default());
        p.cli.add_auth_method(ClientAuth::password(PASSWORD)).await?;
        drop(p.cli);
        p.cli_task.await??;
        assert_eq!(disconnect_reason(&mut p.serv_ev).await, Some(DisconnectReason::ByApplication as u32));
        Ok(())
    }

    #[tokio::test]
    async fn socket_eof() -> anyhow::Result<()> {
        init_test_log();
        let (a, b) = tokio::io::duplex(1024);
        let runner = Runner::new_client(Config::default(), client_setup())?;
        let (handle, mut events, task) = spawn(a, runner);
        drop(b);
        // either the write or the read notices first
        assert!(task.await?.is_err());
        assert_eq!(disconnect_reason(&mut events).await, Some(DisconnectReason::ConnectionLost as u32));
        assert!(!handle.is_connected());
        assert!(matches!(handle.open_channel(ChannelOpenType::Session).await, Err(Error::Disconnected)));
        assert!(matches!(
            handle.channel_read(dusk::ChanNum(0), ChanData::Normal, 10).await,
            Err(Error::Disconnected)
        ));
        Ok(())
    }
}
