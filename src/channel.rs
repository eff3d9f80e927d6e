//! Channel multiplexing, RFC4254 sections 5 and 6

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;
use std::collections::{BTreeMap, VecDeque};

use crate::*;
use behaviour::{ChannelFactory, ChannelHandler, ReqReply};
use completion::{Completer, Completion, Outcome};
use config::{Config, MAX_TX_PAYLOAD};
use error::BadChannel;
use event::Event;
use packets::{ChannelClose, ChannelData, ChannelDataExt, ChannelEof, ChannelFailure};
use packets::{ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenType};
use packets::{ChannelReqType, ChannelRequest, ChannelSuccess, ChannelWindowAdjust, Packet};
use sshnames::*;
use traffic::TrafSend;
use window::{LocalWindow, RemoteWindow};

/// A local channel number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChanNum(pub u32);

impl fmt::Display for ChanNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies an incoming channel request awaiting our reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqId(pub(crate) u32);

/// The lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanState {
    /// We sent CHANNEL_OPEN, awaiting confirmation
    Opening,
    Open,
    /// One side has sent CLOSE
    Closing,
    /// Both sides have closed. The channel is removed once its received
    /// data has been read.
    Closed,
}

/// Normal or stderr data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanData {
    Normal,
    /// `SSH_EXTENDED_DATA_STDERR`
    Stderr,
}

impl ChanData {
    pub fn is_ext(self) -> bool {
        self == ChanData::Stderr
    }

    /// Only servers send stderr
    pub(crate) fn validate_send(self, is_client: bool) -> Result<()> {
        if self == ChanData::Stderr && is_client {
            Err(Error::BadChannelData)
        } else {
            Ok(())
        }
    }

    /// Whether received data of this kind is buffered for the application
    fn accepted_receive(self, is_client: bool) -> bool {
        self == ChanData::Normal || is_client
    }
}

/// An incoming want-reply request. Replies must go out in the order
/// requests arrived, so a deferred request blocks later ones.
#[derive(Debug)]
struct ReplySlot {
    id: ReqId,
    ok: Option<bool>,
}

pub(crate) struct Channel {
    num: ChanNum,
    /// The peer's number, unknown while opening
    peer_num: Option<u32>,
    ty: ChannelOpenType,
    state: ChanState,

    recv: LocalWindow,
    send: Option<RemoteWindow>,

    sent_eof: bool,
    recv_eof: bool,
    sent_close: bool,
    recv_close: bool,

    rx: VecDeque<u8>,
    rx_ext: VecDeque<u8>,

    pending_open: Option<Completer<()>>,
    /// Our want-reply requests, answered in order by the peer
    pending_reqs: VecDeque<Completer<()>>,
    replies: VecDeque<ReplySlot>,
    next_req: u32,

    handler: Box<dyn ChannelHandler>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("num", &self.num)
            .field("peer_num", &self.peer_num)
            .field("ty", &self.ty)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Channel {
    fn new(num: ChanNum, ty: ChannelOpenType, conf: &ChanConfig, handler: Box<dyn ChannelHandler>) -> Self {
        Channel {
            num,
            peer_num: None,
            ty,
            state: ChanState::Opening,
            recv: LocalWindow::new(conf.window, conf.max_packet, conf.low_water),
            send: None,
            sent_eof: false,
            recv_eof: false,
            sent_close: false,
            recv_close: false,
            rx: VecDeque::new(),
            rx_ext: VecDeque::new(),
            pending_open: None,
            pending_reqs: VecDeque::new(),
            replies: VecDeque::new(),
            next_req: 0,
            handler,
        }
    }

    fn peer(&self) -> Result<u32> {
        self.peer_num.trap()
    }

    fn send_window(&mut self) -> Result<&mut RemoteWindow> {
        self.send.as_mut().trap()
    }

    /// Whether we may still send requests or data
    fn can_send(&self) -> Result<()> {
        match self.state {
            ChanState::Open if !self.sent_close => Ok(()),
            ChanState::Opening => Err(Error::bad_usage("Channel is not open yet")),
            _ => Err(Error::ChannelClosed),
        }
    }

    fn buf(&mut self, dt: ChanData) -> &mut VecDeque<u8> {
        match dt {
            ChanData::Normal => &mut self.rx,
            ChanData::Stderr => &mut self.rx_ext,
        }
    }

    fn drained(&self) -> bool {
        self.rx.is_empty() && self.rx_ext.is_empty()
    }

    /// Sends replies that have been decided, in arrival order
    fn flush_replies(&mut self, s: &mut TrafSend) -> Result<()> {
        while let Some(ok) = self.replies.front().and_then(|r| r.ok) {
            self.replies.pop_front();
            if self.sent_close {
                continue;
            }
            let num = self.peer()?;
            if ok {
                s.send(ChannelSuccess { num })?;
            } else {
                s.send(ChannelFailure { num })?;
            }
        }
        Ok(())
    }

    /// Both sides have sent CLOSE
    fn finish(&mut self, events: &mut VecDeque<Event>) {
        debug!("Channel {} closed", self.num);
        self.state = ChanState::Closed;
        for c in self.pending_reqs.drain(..) {
            c.fail(Error::ChannelClosed);
        }
        self.replies.clear();
        self.handler.closed(self.num);
        events.push_back(Event::ChannelClosed { chan: self.num });
    }
}

/// Window settings for new channels
#[derive(Debug, Clone)]
struct ChanConfig {
    window: u32,
    max_packet: u32,
    low_water: u32,
}

pub(crate) struct Channels {
    ch: BTreeMap<ChanNum, Channel>,
    next_num: u32,
    max_channels: usize,
    conf: ChanConfig,
    is_client: bool,
}

impl Channels {
    pub fn new(conf: &Config, is_client: bool) -> Self {
        Channels {
            ch: BTreeMap::new(),
            next_num: 0,
            max_channels: conf.max_channels,
            conf: ChanConfig {
                window: conf.window,
                max_packet: conf.max_packet,
                low_water: conf.window_low_water,
            },
            is_client,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.ch.len()
    }

    fn get(&self, num: ChanNum) -> Result<&Channel> {
        self.ch.get(&num).ok_or(BadChannel { num }.build())
    }

    fn get_mut(&mut self, num: ChanNum) -> Result<&mut Channel> {
        self.ch.get_mut(&num).ok_or(BadChannel { num }.build())
    }

    /// A channel number named by the peer. Unknown numbers are a
    /// protocol error, numbers are never reused while a channel exists.
    fn peer_get(&mut self, num: u32) -> Result<&mut Channel> {
        self.ch.get_mut(&ChanNum(num)).ok_or_else(|| {
            debug!("Peer referenced unknown channel {num}");
            Error::SSHProtoError
        })
    }

    fn alloc_num(&mut self) -> Result<ChanNum> {
        if self.ch.len() >= self.max_channels {
            return Err(Error::NoChannels);
        }
        // occupied numbers are fewer than max_channels, so this terminates
        loop {
            let n = ChanNum(self.next_num);
            self.next_num = self.next_num.wrapping_add(1);
            if !self.ch.contains_key(&n) {
                return Ok(n);
            }
        }
    }

    fn remove_if_done(&mut self, num: ChanNum) {
        if let Some(c) = self.ch.get(&num) {
            if c.state == ChanState::Closed && c.drained() {
                trace!("Removing channel {num}");
                self.ch.remove(&num);
            }
        }
    }

    /// Opens a channel. The completion finishes when the peer confirms or refuses.
    pub fn open(
        &mut self,
        ty: ChannelOpenType,
        factory: &mut dyn ChannelFactory,
        s: &mut TrafSend,
    ) -> Result<(ChanNum, Completion<()>)> {
        if let ChannelOpenType::Unknown(_) = ty {
            return Err(Error::bad_usage("Can't open unknown channel type"));
        }
        let num = self.alloc_num()?;
        let handler = factory
            .create(&ty, true)
            .map_err(|reason| Error::ChannelOpenFailed { reason, desc: "Refused locally".into() })?;

        let mut ch = Channel::new(num, ty.clone(), &self.conf, handler);
        let (done, completion) = completion::pair();
        ch.pending_open = Some(done);

        s.send(ChannelOpen {
            num: num.0,
            initial_window: self.conf.window,
            max_packet: self.conf.max_packet,
            ty,
        })?;
        debug!("Opening channel {num}");
        self.ch.insert(num, ch);
        Ok((num, completion))
    }

    pub fn state(&self, num: ChanNum) -> Result<ChanState> {
        Ok(self.get(num)?.state)
    }

    /// Sends a channel request. Without `want_reply` the returned
    /// completion has already succeeded.
    pub fn request(
        &mut self,
        num: ChanNum,
        req: ChannelReqType,
        want_reply: bool,
        s: &mut TrafSend,
    ) -> Result<Completion<()>> {
        let ch = self.get_mut(num)?;
        ch.can_send()?;
        if let ChannelReqType::Unknown(_) = req {
            return Err(Error::bad_usage("Can't send unknown request"));
        }
        trace!("Channel {num} request {}", req.name());
        s.send(ChannelRequest { num: ch.peer()?, want_reply, req })?;
        if want_reply {
            let (done, completion) = completion::pair();
            ch.pending_reqs.push_back(done);
            Ok(completion)
        } else {
            Ok(Completion::ready(Outcome::Success(())))
        }
    }

    /// Answers a request left for the application
    pub fn reply(&mut self, num: ChanNum, id: ReqId, success: bool, s: &mut TrafSend) -> Result<()> {
        let ch = self.get_mut(num)?;
        let slot = ch
            .replies
            .iter_mut()
            .find(|r| r.id == id && r.ok.is_none())
            .ok_or(Error::bad_usage("No such pending request"))?;
        slot.ok = Some(success);
        ch.flush_replies(s)
    }

    /// Sends data, returning the length consumed which may be less than
    /// `data.len()`, including zero when the peer's window is full.
    pub fn send_data(&mut self, num: ChanNum, dt: ChanData, data: &[u8], s: &mut TrafSend) -> Result<usize> {
        dt.validate_send(self.is_client)?;
        let ch = self.get_mut(num)?;
        ch.can_send()?;
        if ch.sent_eof {
            return Err(Error::ChannelEOF);
        }
        let overhead = if dt.is_ext() { ChannelDataExt::DATA_OFFSET } else { ChannelData::DATA_OFFSET };
        let len = ch.send_window()?.sendable(data.len()).min(MAX_TX_PAYLOAD - overhead);
        if len == 0 {
            return Ok(0);
        }
        ch.send_window()?.consume(len)?;
        let num = ch.peer()?;
        let data = data[..len].into();
        match dt {
            ChanData::Normal => s.send(ChannelData { num, data })?,
            ChanData::Stderr => s.send(ChannelDataExt { num, code: SSH_EXTENDED_DATA_STDERR, data })?,
        }
        Ok(len)
    }

    /// How much data could be sent now
    pub fn send_space(&self, num: ChanNum) -> Result<usize> {
        let ch = self.get(num)?;
        if ch.can_send().is_err() || ch.sent_eof {
            return Ok(0);
        }
        Ok(ch.send.as_ref().trap()?.sendable(MAX_TX_PAYLOAD))
    }

    /// Reads buffered data into `buf`.
    ///
    /// Returns `Ok(0)` when nothing is buffered, or [`Error::ChannelEOF`]
    /// once nothing more will arrive. Reading frees window space, which may
    /// send a WINDOW_ADJUST.
    pub fn read(&mut self, num: ChanNum, dt: ChanData, buf: &mut [u8], s: &mut TrafSend) -> Result<usize> {
        let ch = self.get_mut(num)?;
        let rx = ch.buf(dt);
        let len = buf.len().min(rx.len());
        for (b, r) in buf.iter_mut().zip(rx.drain(..len)) {
            *b = r;
        }

        if len == 0 {
            return if ch.recv_eof || ch.recv_close { Err(Error::ChannelEOF) } else { Ok(0) };
        }

        if let Some(adjust) = ch.recv.consumed(len) {
            if !ch.sent_close && !ch.recv_close && !ch.recv_eof {
                trace!("Channel {num} window adjust {adjust}");
                s.send(ChannelWindowAdjust { num: ch.peer()?, adjust })?;
            }
        }
        self.remove_if_done(num);
        Ok(len)
    }

    /// Buffered received data
    pub fn readable(&self, num: ChanNum, dt: ChanData) -> Result<usize> {
        let ch = self.get(num)?;
        Ok(match dt {
            ChanData::Normal => ch.rx.len(),
            ChanData::Stderr => ch.rx_ext.len(),
        })
    }

    pub fn send_eof(&mut self, num: ChanNum, s: &mut TrafSend) -> Result<()> {
        let ch = self.get_mut(num)?;
        ch.can_send()?;
        if !ch.sent_eof {
            ch.sent_eof = true;
            s.send(ChannelEof { num: ch.peer()? })?;
        }
        Ok(())
    }

    /// Sends CLOSE. The channel remains until the peer's CLOSE arrives.
    pub fn close(&mut self, num: ChanNum, events: &mut VecDeque<Event>, s: &mut TrafSend) -> Result<()> {
        let ch = self.get_mut(num)?;
        match ch.state {
            ChanState::Opening => return Err(Error::bad_usage("Channel is not open yet")),
            ChanState::Closed => return Ok(()),
            _ => (),
        }
        if ch.sent_close {
            return Ok(());
        }
        ch.sent_close = true;
        s.send(ChannelClose { num: ch.peer()? })?;
        if ch.recv_close {
            ch.finish(events);
        } else {
            ch.state = ChanState::Closing;
        }
        self.remove_if_done(num);
        Ok(())
    }

    /// Fails everything outstanding when the connection ends
    pub fn disconnected(&mut self) {
        for (_, mut ch) in core::mem::take(&mut self.ch) {
            if let Some(c) = ch.pending_open.take() {
                c.fail(Error::Disconnected);
            }
            for c in ch.pending_reqs.drain(..) {
                c.fail(Error::Disconnected);
            }
        }
    }

    /// Incoming channel packets
    pub fn dispatch(&mut self, packet: Packet, factory: &mut dyn ChannelFactory, events: &mut VecDeque<Event>, s: &mut TrafSend) -> Result<()> {
        trace!("chan dispatch");
        match packet {
            Packet::ChannelOpen(p) => self.dispatch_open(p, factory, events, s),

            Packet::ChannelOpenConfirmation(p) => {
                let ch = self.peer_get(p.num)?;
                if ch.state != ChanState::Opening {
                    debug!("Confirmation for channel {} in {:?}", ch.num, ch.state);
                    return Err(Error::SSHProtoError);
                }
                ch.peer_num = Some(p.sender_num);
                ch.send = Some(RemoteWindow::new(p.initial_window, p.max_packet));
                ch.state = ChanState::Open;
                debug!("Channel {} open, peer {}", ch.num, p.sender_num);
                ch.handler.opened(ch.num);
                if let Some(c) = ch.pending_open.take() {
                    c.success(())
                }
                Ok(())
            }

            Packet::ChannelOpenFailure(p) => {
                let ch = self.peer_get(p.num)?;
                if ch.state != ChanState::Opening {
                    return Err(Error::SSHProtoError);
                }
                let num = ch.num;
                let reason = ChanFail::from_code(p.reason);
                let desc = p.desc.as_str().unwrap_or("").to_string();
                debug!("Channel {num} open failed {reason:?} {desc:?}");
                if let Some(mut ch) = self.ch.remove(&num) {
                    if let Some(c) = ch.pending_open.take() {
                        c.fail(Error::ChannelOpenFailed { reason, desc })
                    }
                }
                Ok(())
            }

            Packet::ChannelWindowAdjust(p) => {
                let ch = self.peer_get(p.num)?;
                match ch.state {
                    ChanState::Open | ChanState::Closing if !ch.recv_close => ch.send_window()?.adjust(p.adjust),
                    _ => Err(Error::SSHProtoError),
                }
            }

            Packet::ChannelData(p) => {
                self.dispatch_data(p.num, Some(ChanData::Normal), &p.data.0, events, s)
            }

            Packet::ChannelDataExt(p) => {
                let dt = if p.code == SSH_EXTENDED_DATA_STDERR {
                    Some(ChanData::Stderr)
                } else {
                    debug!("Discarding extended data type {}", p.code);
                    None
                };
                self.dispatch_data(p.num, dt, &p.data.0, events, s)
            }

            Packet::ChannelEof(p) => {
                let ch = self.peer_get(p.num)?;
                if ch.state == ChanState::Opening || ch.recv_close {
                    return Err(Error::SSHProtoError);
                }
                if !ch.recv_eof {
                    ch.recv_eof = true;
                    ch.handler.eof(ch.num);
                    events.push_back(Event::ChannelEof { chan: ch.num });
                }
                Ok(())
            }

            Packet::ChannelClose(p) => {
                let ch = self.peer_get(p.num)?;
                if ch.state == ChanState::Opening || ch.recv_close {
                    return Err(Error::SSHProtoError);
                }
                let num = ch.num;
                ch.recv_close = true;
                if !ch.sent_close {
                    ch.sent_close = true;
                    s.send(ChannelClose { num: ch.peer()? })?;
                }
                ch.finish(events);
                self.remove_if_done(num);
                Ok(())
            }

            Packet::ChannelRequest(p) => self.dispatch_request(p, events, s),

            Packet::ChannelSuccess(p) => self.dispatch_reply(p.num, true),

            Packet::ChannelFailure(p) => self.dispatch_reply(p.num, false),

            _ => Error::bug_msg("unreachable"),
        }
    }

    fn dispatch_open(
        &mut self,
        p: ChannelOpen,
        factory: &mut dyn ChannelFactory,
        events: &mut VecDeque<Event>,
        s: &mut TrafSend,
    ) -> Result<()> {
        match self.dispatch_open_inner(&p, factory, events, s) {
            Err(DispatchOpenError::Failure(f)) => {
                debug!("Refusing {:?} channel: {f:?}", p.ty);
                s.send(ChannelOpenFailure {
                    num: p.num,
                    reason: f as u32,
                    desc: "".into(),
                    lang: "".into(),
                })?;
                Ok(())
            }
            Err(DispatchOpenError::Error(e)) => Err(e),
            Ok(()) => Ok(()),
        }
    }

    fn dispatch_open_inner(
        &mut self,
        p: &ChannelOpen,
        factory: &mut dyn ChannelFactory,
        events: &mut VecDeque<Event>,
        s: &mut TrafSend,
    ) -> Result<(), DispatchOpenError> {
        let num = self.alloc_num()?;
        let handler = factory.create(&p.ty, false)?;

        let mut ch = Channel::new(num, p.ty.clone(), &self.conf, handler);
        ch.peer_num = Some(p.num);
        ch.send = Some(RemoteWindow::new(p.initial_window, p.max_packet));
        ch.state = ChanState::Open;

        s.send(ChannelOpenConfirmation {
            num: p.num,
            sender_num: num.0,
            initial_window: self.conf.window,
            max_packet: self.conf.max_packet,
        })?;
        debug!("Peer opened channel {num}, {:?}", p.ty);
        ch.handler.opened(num);
        events.push_back(Event::ChannelOpened { chan: num, ty: p.ty.clone() });
        self.ch.insert(num, ch);
        Ok(())
    }

    fn dispatch_data(
        &mut self,
        num: u32,
        dt: Option<ChanData>,
        data: &[u8],
        events: &mut VecDeque<Event>,
        s: &mut TrafSend,
    ) -> Result<()> {
        let is_client = self.is_client;
        let ch = self.peer_get(num)?;
        if ch.state == ChanState::Opening || ch.recv_eof || ch.recv_close {
            debug!("Data on channel {} after eof or close", ch.num);
            return Err(Error::SSHProtoError);
        }
        ch.recv.receive(data.len())?;

        let dt = dt.filter(|dt| !ch.sent_close && dt.accepted_receive(is_client));
        let Some(dt) = dt else {
            // nobody will read it
            trace!("Discarding {} bytes on channel {}", data.len(), ch.num);
            if let Some(adjust) = ch.recv.consumed(data.len()) {
                if !ch.sent_close {
                    s.send(ChannelWindowAdjust { num: ch.peer()?, adjust })?;
                }
            }
            return Ok(());
        };

        let chan = ch.num;
        let rx = ch.buf(dt);
        let was_empty = rx.is_empty();
        rx.extend(data);
        ch.handler.data(chan, dt.is_ext(), data.len());
        if was_empty && !data.is_empty() {
            events.push_back(Event::ChannelData { chan, ext: dt.is_ext() });
        }
        Ok(())
    }

    fn dispatch_request(&mut self, p: ChannelRequest, events: &mut VecDeque<Event>, s: &mut TrafSend) -> Result<()> {
        let is_client = self.is_client;
        let ch = self.peer_get(p.num)?;
        if ch.state == ChanState::Opening || ch.recv_close {
            return Err(Error::SSHProtoError);
        }
        let chan = ch.num;
        trace!("Channel {chan} request {}", p.req.name());

        let reply = if ch.sent_close {
            // no reply is possible after our CLOSE
            return Ok(());
        } else if is_client {
            match &p.req {
                ChannelReqType::ExitStatus(e) => {
                    events.push_back(Event::ExitStatus { chan, status: e.status });
                    ReqReply::Failure
                }
                ChannelReqType::ExitSignal(e) => {
                    events.push_back(Event::ExitSignal { chan, signal: e.signal.clone(), core: e.core });
                    ReqReply::Failure
                }
                req => ch.handler.request(chan, req, p.want_reply),
            }
        } else {
            ch.handler.request(chan, &p.req, p.want_reply)
        };

        let id = ReqId(ch.next_req);
        ch.next_req = ch.next_req.wrapping_add(1);

        if p.want_reply {
            let ok = match reply {
                ReqReply::Success => Some(true),
                ReqReply::Failure => Some(false),
                ReqReply::Deferred => None,
            };
            ch.replies.push_back(ReplySlot { id, ok });
        }
        if reply == ReqReply::Deferred {
            events.push_back(Event::ChannelRequest { chan, id, req: p.req, want_reply: p.want_reply });
        }
        ch.flush_replies(s)
    }

    fn dispatch_reply(&mut self, num: u32, success: bool) -> Result<()> {
        let ch = self.peer_get(num)?;
        if ch.state == ChanState::Opening {
            return Err(Error::SSHProtoError);
        }
        let c = ch.pending_reqs.pop_front().ok_or_else(|| {
            debug!("Unexpected channel reply for {}", ch.num);
            Error::SSHProtoError
        })?;
        if success {
            c.success(())
        } else {
            c.fail(Error::RequestFailed)
        }
        Ok(())
    }
}

/// Refusing an incoming open is not a connection error
enum DispatchOpenError {
    /// A program error
    Error(Error),
    /// A SSH failure response
    Failure(ChanFail),
}

impl From<Error> for DispatchOpenError {
    fn from(e: Error) -> Self {
        match e {
            Error::NoChannels => Self::Failure(ChanFail::SSH_OPEN_RESOURCE_SHORTAGE),
            e => Self::Error(e),
        }
    }
}

impl From<ChanFail> for DispatchOpenError {
    fn from(f: ChanFail) -> Self {
        Self::Failure(f)
    }
}

#[cfg(test)]
mod tests {
    use crate::behaviour::DefaultChannels;
    use crate::channel::*;
    use crate::dusklog::init_test_log;
    use crate::encrypt::KeyState;
    use crate::packets::{Exec, ExitStatus};
    use crate::traffic::{Stats, TrafOut};

    /// Captures what the channel layer sends
    struct Wire {
        out: TrafOut,
        keys: KeyState,
        stats: Stats,
    }

    impl Wire {
        fn new() -> Self {
            let mut w = Wire { out: TrafOut::new(), keys: KeyState::new_cleartext(), stats: Stats::default() };
            // session packets are held rather than sent in cleartext
            w.s().start_hold();
            w
        }

        fn s(&mut self) -> TrafSend<'_> {
            self.out.sender(&mut self.keys, &mut self.stats)
        }

        fn sent(&mut self) -> Vec<Packet> {
            self.out.take_held(&packets::ParseContext::new())
        }
    }

    struct Side {
        chans: Channels,
        factory: DefaultChannels,
        events: VecDeque<Event>,
        wire: Wire,
    }

    impl Side {
        fn new(is_client: bool, conf: &Config) -> Self {
            let factory = if is_client { DefaultChannels::client() } else { DefaultChannels::server() };
            Side { chans: Channels::new(conf, is_client), factory, events: VecDeque::new(), wire: Wire::new() }
        }

        fn deliver(&mut self, packets: Vec<Packet>) -> Result<()> {
            for p in packets {
                let mut s = self.wire.out.sender(&mut self.wire.keys, &mut self.wire.stats);
                self.chans.dispatch(p, &mut self.factory, &mut self.events, &mut s)?;
            }
            Ok(())
        }
    }

    /// Passes packets back and forth until both sides are quiet
    fn exchange(a: &mut Side, b: &mut Side) {
        loop {
            let pa = a.wire.sent();
            let pb = b.wire.sent();
            if pa.is_empty() && pb.is_empty() {
                break;
            }
            b.deliver(pa).unwrap();
            a.deliver(pb).unwrap();
        }
    }

    fn open_session(conf: &Config) -> (Side, Side, ChanNum, ChanNum) {
        let mut cli = Side::new(true, conf);
        let mut serv = Side::new(false, conf);
        let (cnum, done) = {
            let mut s = cli.wire.s();
            cli.chans.open(ChannelOpenType::Session, &mut cli.factory, &mut s).unwrap()
        };
        assert_eq!(cli.chans.state(cnum).unwrap(), ChanState::Opening);
        exchange(&mut cli, &mut serv);
        assert!(done.wait().is_success());
        let snum = match serv.events.pop_front() {
            Some(Event::ChannelOpened { chan, ty: ChannelOpenType::Session }) => chan,
            e => panic!("{e:?}"),
        };
        (cli, serv, cnum, snum)
    }

    #[test]
    fn open_and_close() {
        init_test_log();
        let (mut cli, mut serv, cnum, snum) = open_session(&Config::default());
        assert_eq!(cli.chans.state(cnum).unwrap(), ChanState::Open);

        cli.chans.close(cnum, &mut cli.events, &mut cli.wire.s()).unwrap();
        assert_eq!(cli.chans.state(cnum).unwrap(), ChanState::Closing);
        // closing twice sends nothing more
        cli.chans.close(cnum, &mut cli.events, &mut cli.wire.s()).unwrap();
        let p = cli.wire.sent();
        assert_eq!(p.len(), 1);
        serv.deliver(p).unwrap();
        // the server replied with its own close and forgot the channel
        assert!(matches!(serv.events.pop_front(), Some(Event::ChannelClosed { chan }) if chan == snum));
        assert!(serv.chans.state(snum).is_err());
        exchange(&mut cli, &mut serv);
        assert!(matches!(cli.events.pop_front(), Some(Event::ChannelClosed { .. })));
        assert_eq!(cli.chans.len(), 0);
    }

    #[test]
    fn refused_open() {
        init_test_log();
        let conf = Config::default();
        let mut cli = Side::new(true, &conf);
        let mut serv = Side::new(false, &conf);
        serv.factory.sessions = false;
        let (_, done) = cli.chans.open(ChannelOpenType::Session, &mut cli.factory, &mut cli.wire.s()).unwrap();
        exchange(&mut cli, &mut serv);
        match done.wait() {
            Outcome::Failure(Error::ChannelOpenFailed { reason, .. }) => {
                assert_eq!(reason, ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED)
            }
            o => panic!("{o:?}"),
        }
        assert_eq!(cli.chans.len(), 0);
        assert_eq!(serv.chans.len(), 0);
    }

    #[test]
    fn channel_limit() {
        init_test_log();
        let conf = Config { max_channels: 2, ..Default::default() };
        let mut cli = Side::new(true, &conf);
        for _ in 0..2 {
            cli.chans.open(ChannelOpenType::Session, &mut cli.factory, &mut cli.wire.s()).unwrap();
        }
        let r = cli.chans.open(ChannelOpenType::Session, &mut cli.factory, &mut cli.wire.s());
        assert!(matches!(r, Err(Error::NoChannels)));
    }

    #[test]
    fn data_and_window() {
        init_test_log();
        let conf = Config { window: 1000, max_packet: 400, window_low_water: 500, ..Default::default() };
        let (mut cli, mut serv, cnum, snum) = open_session(&conf);

        let data = [7u8; 2000];
        let mut sent = 0;
        loop {
            let n = cli.chans.send_data(cnum, ChanData::Normal, &data[sent..], &mut cli.wire.s()).unwrap();
            if n == 0 {
                break;
            }
            assert!(n <= 400);
            sent += n;
        }
        assert_eq!(sent, 1000);
        assert_eq!(cli.chans.send_space(cnum).unwrap(), 0);
        exchange(&mut cli, &mut serv);

        // one event until the buffer is drained
        let evs: Vec<_> = serv.events.drain(..).collect();
        assert_eq!(evs.len(), 1);
        assert_eq!(serv.chans.readable(snum, ChanData::Normal).unwrap(), 1000);

        let mut buf = [0u8; 600];
        assert_eq!(serv.chans.read(snum, ChanData::Normal, &mut buf, &mut serv.wire.s()).unwrap(), 600);
        exchange(&mut cli, &mut serv);
        assert_eq!(cli.chans.send_space(cnum).unwrap(), 400);
        assert_eq!(serv.chans.read(snum, ChanData::Normal, &mut buf, &mut serv.wire.s()).unwrap(), 400);
        assert_eq!(serv.chans.read(snum, ChanData::Normal, &mut buf, &mut serv.wire.s()).unwrap(), 0);
    }

    #[test]
    fn window_exceeded_is_fatal() {
        init_test_log();
        let conf = Config { window: 100, max_packet: 100, window_low_water: 50, ..Default::default() };
        let (_cli, mut serv, _cnum, snum) = open_session(&conf);
        let peer_sent = |n: usize| Packet::ChannelData(ChannelData { num: snum.0, data: vec![0u8; n].into() });
        serv.deliver(vec![peer_sent(100)]).unwrap();
        assert!(matches!(serv.deliver(vec![peer_sent(1)]), Err(Error::WindowExceeded)));
    }

    #[test]
    fn client_stderr_refused() {
        init_test_log();
        let (mut cli, mut serv, cnum, snum) = open_session(&Config::default());
        let r = cli.chans.send_data(cnum, ChanData::Stderr, b"err", &mut cli.wire.s());
        assert!(matches!(r, Err(Error::BadChannelData)));

        serv.chans.send_data(snum, ChanData::Stderr, b"err", &mut serv.wire.s()).unwrap();
        exchange(&mut cli, &mut serv);
        assert_eq!(cli.chans.readable(cnum, ChanData::Stderr).unwrap(), 3);
    }

    #[test]
    fn eof_then_read() {
        init_test_log();
        let (mut cli, mut serv, cnum, snum) = open_session(&Config::default());
        serv.chans.send_data(snum, ChanData::Normal, b"bye", &mut serv.wire.s()).unwrap();
        serv.chans.send_eof(snum, &mut serv.wire.s()).unwrap();
        assert!(matches!(
            serv.chans.send_data(snum, ChanData::Normal, b"more", &mut serv.wire.s()),
            Err(Error::ChannelEOF)
        ));
        exchange(&mut cli, &mut serv);
        let mut buf = [0u8; 10];
        assert_eq!(cli.chans.read(cnum, ChanData::Normal, &mut buf, &mut cli.wire.s()).unwrap(), 3);
        assert!(matches!(
            cli.chans.read(cnum, ChanData::Normal, &mut buf, &mut cli.wire.s()),
            Err(Error::ChannelEOF)
        ));
    }

    #[test]
    fn requests_reply_in_order() {
        init_test_log();
        let (mut cli, mut serv, cnum, snum) = open_session(&Config::default());
        let mut shell = cli.chans.request(cnum, ChannelReqType::Shell, true, &mut cli.wire.s()).unwrap();
        let mut exec = cli
            .chans
            .request(cnum, ChannelReqType::Exec(Exec { command: "ls".into() }), true, &mut cli.wire.s())
            .unwrap();
        exchange(&mut cli, &mut serv);

        let ids: Vec<ReqId> = serv
            .events
            .drain(..)
            .map(|e| match e {
                Event::ChannelRequest { chan, id, want_reply: true, .. } if chan == snum => id,
                e => panic!("{e:?}"),
            })
            .collect();
        assert_eq!(ids.len(), 2);

        // answering the second first holds it back
        serv.chans.reply(snum, ids[1], false, &mut serv.wire.s()).unwrap();
        exchange(&mut cli, &mut serv);
        assert!(shell.try_take().is_none() && exec.try_take().is_none());

        serv.chans.reply(snum, ids[0], true, &mut serv.wire.s()).unwrap();
        exchange(&mut cli, &mut serv);
        assert!(shell.wait().is_success());
        assert!(matches!(exec.wait(), Outcome::Failure(Error::RequestFailed)));

        // no second reply for the same request
        assert!(serv.chans.reply(snum, ids[0], true, &mut serv.wire.s()).is_err());
    }

    #[test]
    fn close_fails_pending_requests() {
        init_test_log();
        let (mut cli, mut serv, cnum, snum) = open_session(&Config::default());
        let r = cli.chans.request(cnum, ChannelReqType::Shell, true, &mut cli.wire.s()).unwrap();
        exchange(&mut cli, &mut serv);
        serv.chans.close(snum, &mut serv.events, &mut serv.wire.s()).unwrap();
        exchange(&mut cli, &mut serv);
        assert!(matches!(r.wait(), Outcome::Failure(Error::ChannelClosed)));
        assert!(cli.chans.request(cnum, ChannelReqType::Shell, true, &mut cli.wire.s()).is_err());
    }

    #[test]
    fn exit_status_event() {
        init_test_log();
        let (mut cli, mut serv, cnum, snum) = open_session(&Config::default());
        serv.chans
            .request(snum, ChannelReqType::ExitStatus(ExitStatus { status: 3 }), false, &mut serv.wire.s())
            .unwrap();
        exchange(&mut cli, &mut serv);
        assert!(matches!(cli.events.pop_front(), Some(Event::ExitStatus { chan, status: 3 }) if chan == cnum));
    }

    #[test]
    fn unknown_channel_is_fatal() {
        init_test_log();
        let mut serv = Side::new(false, &Config::default());
        let p = Packet::ChannelData(ChannelData { num: 9, data: b"x".as_slice().into() });
        assert!(matches!(serv.deliver(vec![p]), Err(Error::SSHProtoError)));
    }

    #[test]
    fn ext_data_after_close_refused() {
        init_test_log();
        let (mut cli, mut serv, cnum, snum) = open_session(&Config::default());
        serv.chans.send_data(snum, ChanData::Normal, b"bye", &mut serv.wire.s()).unwrap();
        serv.chans.close(snum, &mut serv.events, &mut serv.wire.s()).unwrap();
        exchange(&mut cli, &mut serv);
        // undrained, so still present
        assert_eq!(cli.chans.state(cnum).unwrap(), ChanState::Closed);
        assert!(cli.wire.sent().is_empty());

        let ext = |code| Packet::ChannelDataExt(ChannelDataExt { num: cnum.0, code, data: vec![0u8; 50].into() });
        assert!(matches!(cli.deliver(vec![ext(2)]), Err(Error::SSHProtoError)));
        assert!(matches!(cli.deliver(vec![ext(SSH_EXTENDED_DATA_STDERR)]), Err(Error::SSHProtoError)));
        assert!(cli.wire.sent().is_empty());
    }

    #[test]
    fn unknown_ext_data_discarded() {
        init_test_log();
        let conf = Config { window: 100, max_packet: 100, window_low_water: 50, ..Default::default() };
        let (mut cli, _serv, cnum, _snum) = open_session(&conf);
        cli.events.clear();
        let p = Packet::ChannelDataExt(ChannelDataExt { num: cnum.0, code: 2, data: vec![0u8; 60].into() });
        cli.deliver(vec![p]).unwrap();
        assert!(cli.events.is_empty());
        assert_eq!(cli.chans.readable(cnum, ChanData::Stderr).unwrap(), 0);
        // the window is handed straight back
        match cli.wire.sent().as_slice() {
            [Packet::ChannelWindowAdjust(a)] => assert_eq!(a.adjust, 60),
            p => panic!("{p:?}"),
        }
    }
}
