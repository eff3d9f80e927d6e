//! Global requests for remote TCP forwarding, RFC4254 section 7.1

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;

use crate::*;
use behaviour::ForwardingHandler;
use completion::{Completer, Completion};
use packets::{GlobalRequest, GlobalRequestMethod, Packet, RequestFailure, RequestSuccess};
use packets::{TcpPort, TcpipForward};
use traffic::TrafSend;

/// One of our global requests awaiting a reply
enum Pending {
    /// The requested port, 0 lets the server choose
    Forward { port: u32, done: Completer<u32> },
    Cancel(Completer<()>),
}

/// Tracks global requests in both directions.
///
/// Replies to our requests arrive in the order they were sent.
pub(crate) struct GlobalRequests {
    pending: VecDeque<Pending>,
}

impl GlobalRequests {
    pub fn new() -> Self {
        Self { pending: VecDeque::new() }
    }

    /// Whether a REQUEST_SUCCESS arriving now will carry a port number
    pub fn expects_port(&self) -> bool {
        matches!(self.pending.front(), Some(Pending::Forward { port: 0, .. }))
    }

    /// Asks the server to listen. Completes with the bound port.
    pub fn tcpip_forward(&mut self, address: &str, port: u32, s: &mut TrafSend) -> Result<Completion<u32>> {
        let req = GlobalRequestMethod::TcpipForward(TcpipForward { address: address.into(), port });
        s.send(GlobalRequest { want_reply: true, req })?;
        let (done, completion) = completion::pair();
        self.pending.push_back(Pending::Forward { port, done });
        Ok(completion)
    }

    pub fn cancel_tcpip_forward(&mut self, address: &str, port: u32, s: &mut TrafSend) -> Result<Completion<()>> {
        let req = GlobalRequestMethod::CancelTcpipForward(TcpipForward { address: address.into(), port });
        s.send(GlobalRequest { want_reply: true, req })?;
        let (done, completion) = completion::pair();
        self.pending.push_back(Pending::Cancel(done));
        Ok(completion)
    }

    /// Handles global request packets. Servers pass a `forwarding` handler,
    /// clients refuse any request from the server.
    pub fn dispatch(
        &mut self,
        packet: Packet,
        forwarding: Option<&mut dyn ForwardingHandler>,
        s: &mut TrafSend,
    ) -> Result<()> {
        match packet {
            Packet::GlobalRequest(p) => {
                let port = match (forwarding, &p.req) {
                    (Some(f), GlobalRequestMethod::TcpipForward(t)) => {
                        let address = t.address.as_str()?;
                        f.tcpip_forward(address, t.port).map(|bound| {
                            info!("Forwarding {address}:{bound}");
                            // the reply only has a port when one was allocated
                            (t.port == 0).then_some(bound)
                        })
                    }
                    (Some(f), GlobalRequestMethod::CancelTcpipForward(t)) => {
                        f.cancel_tcpip_forward(t.address.as_str()?, t.port).then_some(None)
                    }
                    (_, req) => {
                        debug!("Refusing global request {req:?}");
                        None
                    }
                };
                if p.want_reply {
                    match port {
                        Some(Some(port)) => s.send(RequestSuccess::TcpPort(TcpPort { port }))?,
                        Some(None) => s.send(RequestSuccess::SuccessEmpty)?,
                        None => s.send(RequestFailure {})?,
                    }
                }
                Ok(())
            }

            Packet::RequestSuccess(r) => {
                match self.pop()? {
                    Pending::Forward { port, done } => {
                        let bound = match r {
                            RequestSuccess::TcpPort(p) => p.port,
                            RequestSuccess::SuccessEmpty => port,
                        };
                        done.success(bound)
                    }
                    Pending::Cancel(done) => done.success(()),
                }
                Ok(())
            }

            Packet::RequestFailure(_) => {
                match self.pop()? {
                    Pending::Forward { done, .. } => done.fail(Error::RequestFailed),
                    Pending::Cancel(done) => done.fail(Error::RequestFailed),
                }
                Ok(())
            }

            _ => Error::bug_msg("unreachable"),
        }
    }

    fn pop(&mut self) -> Result<Pending> {
        self.pending.pop_front().ok_or_else(|| {
            debug!("Global reply with nothing outstanding");
            Error::SSHProtoError
        })
    }

    /// Fails everything outstanding
    pub fn disconnected(&mut self) {
        for p in self.pending.drain(..) {
            match p {
                Pending::Forward { done, .. } => done.fail(Error::Disconnected),
                Pending::Cancel(done) => done.fail(Error::Disconnected),
            }
        }
    }
}
