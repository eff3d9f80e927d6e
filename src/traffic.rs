//! Packet framing between the byte stream and decrypted payloads.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;

use pretty_hex::PrettyHex;
use zeroize::Zeroize;

use crate::encrypt::{DecKeys, EncKeys, KeyState};
use crate::encrypt::SSH_PAYLOAD_START;
use crate::ident::RemoteVersion;
use crate::packets::{Category, NewKeys, Packet};
use crate::*;

/// Byte and packet counters for a connection
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Stats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    /// Completed key exchanges, including the first
    pub rekeys: u64,
}

/// A decrypted packet payload, starting with the message number
pub(crate) struct Payload {
    pub data: Vec<u8>,
    pub seq: u32,
}

impl Drop for Payload {
    fn drop(&mut self) {
        // may hold passwords
        self.data.zeroize()
    }
}

#[derive(Debug)]
enum RxState {
    /// Waiting for the peer's identification line
    Ident,
    /// Reading the first cipher block, which has the length
    Header,
    /// First block is decrypted, reading the remainder
    Body { total_len: usize },
}

pub(crate) struct TrafIn {
    /// Contains one partial packet, ciphertext until complete
    buf: Vec<u8>,
    state: RxState,
    remote_version: RemoteVersion,
}

impl TrafIn {
    pub fn new() -> Self {
        Self { buf: Vec::new(), state: RxState::Ident, remote_version: RemoteVersion::new() }
    }

    /// The peer's identification string, once it has arrived
    pub fn remote_version(&self) -> Option<&str> {
        self.remote_version.version()
    }

    /// Consumes input until a single packet is complete.
    ///
    /// Returns the number of bytes consumed and the payload if one finished.
    /// Partial packets are kept for the next call.
    pub fn input(&mut self, keys: &mut KeyState, data: &[u8]) -> Result<(usize, Option<Payload>)> {
        let mut r = data;

        if let RxState::Ident = self.state {
            let (taken, done) = self.remote_version.consume(r)?;
            r = &r[taken..];
            if !done {
                return Ok((taken, None));
            }
            debug!("Remote version {:?}", self.remote_version.version());
            self.state = RxState::Header;
        }

        if let RxState::Header = self.state {
            let size_block = keys.size_block_dec();
            let need = (size_block - self.buf.len()).min(r.len());
            self.buf.extend_from_slice(&r[..need]);
            r = &r[need..];
            if self.buf.len() < size_block {
                return Ok((data.len() - r.len(), None));
            }

            let total_len = keys.decrypt_first_block(&mut self.buf[..size_block])?;
            if total_len < size_block {
                debug!("Packet length {total_len} is shorter than a block");
                return Err(Error::SSHProtoError);
            }
            self.state = RxState::Body { total_len };
        }

        if let RxState::Body { total_len } = self.state {
            let need = (total_len - self.buf.len()).min(r.len());
            self.buf.extend_from_slice(&r[..need]);
            r = &r[need..];
            if self.buf.len() < total_len {
                return Ok((data.len() - r.len(), None));
            }

            let seq = keys.recv_seq();
            let payload_len = keys.decrypt(&mut self.buf)?;
            let data_range = SSH_PAYLOAD_START..SSH_PAYLOAD_START + payload_len;
            let payload = Payload { data: self.buf[data_range].to_vec(), seq };
            trace!("Received seq {seq} {:?}", payload.data.hex_dump());
            self.buf.zeroize();
            self.buf.clear();
            self.state = RxState::Header;
            return Ok((data.len() - r.len(), Some(payload)));
        }

        Ok((data.len() - r.len(), None))
    }
}

pub(crate) struct TrafOut {
    /// Encrypted packets ready for the socket
    buf: Vec<u8>,
    /// Bytes of `buf` already handed out
    sent: usize,
    /// Set from our KexInit until our NewKeys
    hold: bool,
    /// Payloads waiting for the key exchange to complete
    held: VecDeque<Vec<u8>>,
}

impl TrafOut {
    pub fn new() -> Self {
        Self { buf: Vec::new(), sent: 0, hold: false, held: VecDeque::new() }
    }

    pub fn send_version(&mut self, ident: &str) {
        ident::write_version(ident, &mut self.buf)
    }

    /// Copies pending output into `buf`, returning the length written.
    pub fn output(&mut self, buf: &mut [u8]) -> usize {
        let pending = &self.buf[self.sent..];
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        self.sent += n;
        if self.sent == self.buf.len() {
            self.buf.clear();
            self.sent = 0;
        }
        n
    }

    pub fn output_pending(&self) -> bool {
        self.sent < self.buf.len()
    }

    /// Queued bytes, including payloads held for a key exchange
    pub fn queued_len(&self) -> usize {
        self.buf.len() - self.sent + self.held.iter().map(|h| h.len()).sum::<usize>()
    }

    pub fn is_holding(&self) -> bool {
        self.hold
    }

    /// Drops everything unsent except already encrypted output
    pub fn discard_held(&mut self) {
        self.held.clear();
        self.hold = false;
    }

    /// Decodes and removes held packets, for inspecting what a module sent
    #[cfg(test)]
    pub(crate) fn take_held(&mut self, ctx: &packets::ParseContext) -> Vec<Packet> {
        self.held.drain(..).map(|p| sshwire::packet_from_bytes(&p, ctx).unwrap()).collect()
    }

    pub fn sender<'a>(&'a mut self, keys: &'a mut KeyState, stats: &'a mut Stats) -> TrafSend<'a> {
        TrafSend { out: self, keys, stats }
    }
}

/// Convenience to pass TrafOut with keys
pub(crate) struct TrafSend<'a> {
    out: &'a mut TrafOut,
    keys: &'a mut KeyState,
    stats: &'a mut Stats,
}

impl TrafSend<'_> {
    /// Encodes and encrypts a packet.
    ///
    /// During a key exchange, packets other than transport and kex
    /// messages are queued until our NewKeys has been sent.
    pub fn send(&mut self, p: impl Into<Packet>) -> Result<()> {
        let p = p.into();
        let cat = p.category();
        let payload = sshwire::ssh_vec(&p, None)?;
        trace!("Sending {p:?}");

        if self.out.hold && !matches!(cat, Category::All | Category::Kex) {
            trace!("Holding {:?} during kex", p.message_num());
            self.out.held.push_back(payload);
            return Ok(());
        }

        if !matches!(cat, Category::All | Category::Kex) && self.keys.is_cleartext() {
            return Error::bug_msg("send cleartext");
        }
        self.send_payload(&payload)
    }

    fn send_payload(&mut self, payload: &[u8]) -> Result<()> {
        let n = self.keys.encrypt(payload, &mut self.out.buf)?;
        self.stats.packets_out += 1;
        self.stats.bytes_out += n as u64;
        Ok(())
    }

    /// Holds outbound non-kex packets until [`send_newkeys()`](Self::send_newkeys)
    pub fn start_hold(&mut self) {
        self.out.hold = true;
    }

    /// Sends NewKeys with the old keys and switches outgoing keys.
    /// Packets held during the exchange follow with the new keys.
    pub fn send_newkeys(&mut self, enc: EncKeys, strict: bool) -> Result<()> {
        self.send(NewKeys {})?;
        self.keys.rekey_enc(enc);
        if strict {
            self.keys.reset_seq_enc();
        }
        self.out.hold = false;
        let held = core::mem::take(&mut self.out.held);
        if !held.is_empty() {
            debug!("Sending {} packets held for kex", held.len());
        }
        for mut h in held {
            let r = self.send_payload(&h);
            h.zeroize();
            r?;
        }
        Ok(())
    }

    /// Switches incoming keys after the peer's NewKeys
    pub fn rekey_dec(&mut self, dec: DecKeys, strict: bool) {
        self.keys.rekey_dec(dec);
        if strict {
            self.keys.reset_seq_dec();
        }
    }

    /// Whether output is above the high water mark
    pub fn is_full(&self) -> bool {
        self.out.queued_len() >= config::OUTPUT_HIGH_WATER
    }
}
