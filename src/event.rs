//! Notifications for the application, drained with
//! [`Runner::next_event()`](crate::Runner::next_event).

use crate::channel::{ChanNum, ReqId};
use crate::packets::{ChannelOpenType, ChannelReqType};

#[derive(Debug, Clone)]
pub enum Event {
    /// Authentication completed. Emitted once.
    Authenticated,

    /// A userauth banner from the server.
    ///
    /// Sent by the peer so could be hazardous, it should be escaped before
    /// displaying.
    Banner { message: String },

    /// The peer opened a channel which the [`ChannelFactory`](crate::ChannelFactory)
    /// accepted
    ChannelOpened { chan: ChanNum, ty: ChannelOpenType },

    /// Data is available with [`Runner::channel_read()`](crate::Runner::channel_read)
    ChannelData { chan: ChanNum, ext: bool },

    ChannelEof { chan: ChanNum },

    /// Both sides have closed the channel. Data already received can
    /// still be read.
    ChannelClosed { chan: ChanNum },

    /// A request left for the application. Reply with
    /// [`Runner::channel_reply()`](crate::Runner::channel_reply) if `want_reply` is set.
    ChannelRequest { chan: ChanNum, id: ReqId, req: ChannelReqType, want_reply: bool },

    ExitStatus { chan: ChanNum, status: u32 },

    ExitSignal { chan: ChanNum, signal: String, core: bool },

    /// The connection closed. `reason` is the SSH disconnect reason code.
    Disconnected { reason: u32, desc: String },
}
