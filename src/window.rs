//! Channel flow control windows, RFC4254 section 5.2

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

/// Our receive window, advertised to the peer
#[derive(Debug, Clone)]
pub(crate) struct LocalWindow {
    /// Space the peer may still send into
    space: u32,
    max: u32,
    /// Consumed bytes before an adjustment is sent
    low_water: u32,
    pub max_packet: u32,
    /// Consumed by the application but not yet advertised
    unacked: u32,
}

impl LocalWindow {
    pub fn new(max: u32, max_packet: u32, low_water: u32) -> Self {
        Self { space: max, max, low_water: low_water.min(max), max_packet, unacked: 0 }
    }

    #[cfg(test)]
    pub fn space(&self) -> u32 {
        self.space
    }

    /// Data arrived from the peer
    pub fn receive(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| Error::WindowExceeded)?;
        if len > self.space {
            debug!("Peer sent {len} with window {}", self.space);
            return Err(Error::WindowExceeded);
        }
        if len > self.max_packet {
            debug!("Peer sent {len} over max packet {}", self.max_packet);
            return Err(Error::SSHProtoError);
        }
        self.space -= len;
        Ok(())
    }

    /// The application has read `len` bytes.
    ///
    /// Returns an adjustment to send once enough has been consumed.
    pub fn consumed(&mut self, len: usize) -> Option<u32> {
        // can't exceed what was received
        let len = u32::try_from(len).unwrap_or(u32::MAX).min(self.max - self.space - self.unacked);
        self.unacked += len;
        if self.unacked > 0 && self.unacked >= self.low_water {
            let adj = core::mem::take(&mut self.unacked);
            self.space += adj;
            Some(adj)
        } else {
            None
        }
    }
}

/// The peer's receive window, limits what we send
#[derive(Debug, Clone)]
pub(crate) struct RemoteWindow {
    space: u32,
    pub max_packet: u32,
}

impl RemoteWindow {
    pub fn new(space: u32, max_packet: u32) -> Self {
        Self { space, max_packet }
    }

    /// How much of `len` can be sent now
    pub fn sendable(&self, len: usize) -> usize {
        len.min(self.space as usize).min(self.max_packet as usize)
    }

    pub fn consume(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| Error::bug())?;
        self.space = self.space.checked_sub(len).ok_or_else(Error::bug)?;
        Ok(())
    }

    /// A WINDOW_ADJUST from the peer
    pub fn adjust(&mut self, adj: u32) -> Result<()> {
        self.space = self.space.checked_add(adj).ok_or_else(|| {
            debug!("Window adjust {adj} overflows {}", self.space);
            Error::WindowOverflow
        })?;
        Ok(())
    }
}
