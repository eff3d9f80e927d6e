//! SSH identification string exchange, RFC4253 section 4.2

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

pub const OUR_VERSION: &str = concat!("SSH-2.0-dusk_", env!("CARGO_PKG_VERSION"));

const SSH_PREFIX: &[u8] = b"SSH-2.0-";
// Servers that also speak protocol 1 use this. Treated as 2.0.
const SSH_PREFIX_COMPAT: &[u8] = b"SSH-1.99-";

/// RFC4253 4.2 says max length 255 incl CR LF.
pub const MAX_IDENT_LEN: usize = 253;
// Lines a server may send before its identification
const MAX_LINES: usize = 50;

pub const CR: u8 = 0x0d;
pub const LF: u8 = 0x0a;

/// Parses and stores the remote SSH version string
#[derive(Debug)]
pub struct RemoteVersion {
    line: Vec<u8>,
    st: VersPars,
    num_lines: usize,
}

/// Version parsing state.
/// We need to match
/// `SSH-2.0-softwareversion SP comments CR LF`
/// at the start of a line. The server may first send other lines
/// which are discarded.
#[derive(Debug, PartialEq)]
enum VersPars {
    /// Reading start of a line, before receiving a full SSH-2.0- prefix
    Start,
    /// Have a line that didn't start with SSH-2.0-, discarding until LF
    Discarding,
    /// Currently reading a SSH-2.0- string, waiting for ending CR
    FillSSH,
    /// Have ending CR after a version, Waiting for ending LF
    HaveCR,
    /// Completed string.
    Done,
}

fn is_prefix_of(line: &[u8], prefix: &[u8]) -> bool {
    let l = line.len().min(prefix.len());
    line[..l] == prefix[..l]
}

impl Default for RemoteVersion {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteVersion {
    pub fn new() -> Self {
        RemoteVersion { line: Vec::new(), st: VersPars::Start, num_lines: 0 }
    }

    /// Returns the parsed version if complete, without CR LF.
    pub fn version(&self) -> Option<&str> {
        match self.st {
            // checked to be ascii when CR was reached
            VersPars::Done => core::str::from_utf8(&self.line).ok(),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.st == VersPars::Done
    }

    /// Reads the initial SSH stream to find the version string.
    ///
    /// Returns the number of bytes consumed, and whether the version is complete.
    /// Input following the version line is left unconsumed.
    pub fn consume(&mut self, buf: &[u8]) -> Result<(usize, bool)> {
        let mut taken = 0;
        for &b in buf {
            if self.st == VersPars::Done {
                break;
            }
            taken += 1;

            match self.st {
                VersPars::Start => {
                    self.line.push(b);
                    if self.line == SSH_PREFIX || self.line == SSH_PREFIX_COMPAT {
                        self.st = VersPars::FillSSH
                    } else if !is_prefix_of(&self.line, SSH_PREFIX)
                        && !is_prefix_of(&self.line, SSH_PREFIX_COMPAT)
                    {
                        self.line.clear();
                        self.st = if b == LF { self.next_line()? } else { VersPars::Discarding };
                    }
                }

                VersPars::Discarding => {
                    if b == LF {
                        self.st = self.next_line()?;
                    }
                }

                VersPars::FillSSH => match b {
                    CR => {
                        if !self.line.is_ascii() {
                            return Err(Error::msg("bad remote version"));
                        }
                        self.st = VersPars::HaveCR;
                    }
                    LF => {
                        return Err(Error::msg("bad remote version"));
                    }
                    _ => {
                        if self.line.len() >= MAX_IDENT_LEN {
                            return Err(Error::NotSSH);
                        }
                        self.line.push(b);
                    }
                },

                VersPars::HaveCR => {
                    match b {
                        LF => self.st = VersPars::Done,
                        _ => return Err(Error::msg("bad remote version")),
                    };
                }

                VersPars::Done => (),
            }
        }
        Ok((taken, self.is_done()))
    }

    fn next_line(&mut self) -> Result<VersPars> {
        self.num_lines += 1;
        if self.num_lines > MAX_LINES {
            return Err(Error::NotSSH);
        }
        Ok(VersPars::Start)
    }
}

/// Appends our identification line with CR LF
pub(crate) fn write_version(ident: &str, buf: &mut Vec<u8>) {
    buf.extend_from_slice(ident.as_bytes());
    buf.extend_from_slice(&[CR, LF]);
}
