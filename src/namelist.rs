//! SSH comma separated algorithm lists.
//!
//! Used when implementing protocol encoding/decoding, not
//! required for general SSH session use.
#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use ascii::AsciiStr;

use heapless::Vec;

use crate::sshwire::{SSHDecode, SSHEncode, SSHSink, SSHSource, WireResult};
use crate::sshwire;

// Used for lists of:
// - algorithm names
// - key types
// - signature types
// - auth types

/// Max count of LocalNames entries
///
/// Current max is for kex: (curve25519, curve25519@libssh, dh-group14, strictkex)
/// plus room for a caller's own ordering.
pub const MAX_LOCAL_NAMES: usize = 6;

/// A comma separated string, received from a peer.
///
/// Wire format is described in [RFC4251](https://tools.ietf.org/html/rfc4251) SSH Architecture "name-list"
#[derive(Debug, Clone, PartialEq)]
pub struct StringNames(pub String);

/// A list of names from local fixed lists, in preference order.
///
/// Deliberately `'static` since it should only come from hardcoded local strings
/// `SSH_NAME_*` in [`crate::sshnames`]. We don't validate string contents.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LocalNames(pub Vec<&'static str, MAX_LOCAL_NAMES>);

/// The general form that can store either representation
#[derive(Debug, Clone, PartialEq)]
pub enum NameList {
    String(StringNames),
    Local(LocalNames),
}

impl SSHDecode for NameList {
    fn dec<S>(s: &mut S) -> WireResult<NameList>
    where
        S: SSHSource,
    {
        let b = sshwire::BinString::dec(s)?;
        let n = sshwire::try_as_ascii_str(&b.0)?;
        Ok(NameList::String(StringNames(n.to_string())))
    }
}

impl SSHEncode for NameList {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        match self {
            NameList::String(n) => n.0.enc(s),
            NameList::Local(l) => l.enc(s),
        }
    }
}

/// Serialize the list of names with comma separators
impl SSHEncode for LocalNames {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        let names = self.0.as_slice();
        // space for names and commas
        let strlen = names.iter().map(|n| n.len()).sum::<usize>() + names.len().saturating_sub(1);
        (strlen as u32).enc(s)?;
        for (i, n) in names.iter().enumerate() {
            if i > 0 {
                b','.enc(s)?;
            }
            n.as_bytes().enc(s)?;
        }
        Ok(())
    }
}

impl TryFrom<&str> for StringNames {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self> {
        AsciiStr::from_ascii(s).map_err(|_| Error::BadName)?;
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<&str> for NameList {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self> {
        Ok(NameList::String(s.try_into()?))
    }
}

impl TryFrom<&[&'static str]> for LocalNames {
    type Error = Error;
    fn try_from(s: &[&'static str]) -> Result<Self, Error> {
        Ok(Self(Vec::from_slice(s).map_err(|_| Error::NoRoom)?))
    }
}

impl From<&LocalNames> for NameList {
    fn from(s: &LocalNames) -> Self {
        NameList::Local(s.clone())
    }
}

impl NameList {
    /// Returns the first name in this namelist that matches, based on SSH priority.
    ///
    /// The SSH client's list (which could be either remote or ours) is used
    /// to determine priority.
    /// `self` is a remote list, `our_options` are our own allowed options in preference
    /// order.
    /// Must only be called on [`StringNames`], will fail if called with self as [`LocalNames`].
    pub fn first_match(
        &self,
        is_client: bool,
        our_options: &LocalNames,
    ) -> Result<Option<&'static str>> {
        match self {
            NameList::String(s) => Ok(if is_client {
                s.first_options_match(our_options)
            } else {
                s.first_string_match(our_options)
            }),
            // we only expect to call first_match() on a packet deserialized
            // as a NameList::String
            NameList::Local(_) => Err(Error::bug()),
        }
    }

    /// Returns whether the `algo` is contained in this list
    ///
    /// Fails iff given a Local variant
    pub fn has_algo(&self, algo: &str) -> Result<bool> {
        match self {
            NameList::String(s) => Ok(s.has_algo(algo)),
            // only expected to be called on remote lists
            NameList::Local(_) => Err(Error::bug()),
        }
    }

    /// Returns the first algorithm in the list, or `""` if the list is empty.
    pub fn first(&self) -> &str {
        match self {
            NameList::String(s) => s.first(),
            NameList::Local(s) => s.first(),
        }
    }

    pub fn empty() -> Self {
        Self::Local(LocalNames::new())
    }

    /// Iterates the names of a remote list.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let v: std::vec::Vec<&str> = match self {
            NameList::String(s) => s.0.split(',').filter(|n| !n.is_empty()).collect(),
            NameList::Local(l) => l.0.iter().copied().collect(),
        };
        v.into_iter()
    }
}

impl StringNames {
    fn names(&self) -> impl Iterator<Item = &str> {
        self.0.split(',')
    }

    /// Returns the first name in this namelist that matches one of the provided options
    fn first_string_match(&self, options: &LocalNames) -> Option<&'static str> {
        for n in self.names() {
            for o in options.0.iter() {
                if n == *o {
                    return Some(*o);
                }
            }
        }
        None
    }

    /// Returns the first of "options" that is in this namelist
    fn first_options_match(&self, options: &LocalNames) -> Option<&'static str> {
        options.0.iter().find(|o| self.names().any(|n| n == **o)).copied()
    }

    fn first(&self) -> &str {
        self.names().next().unwrap_or("")
    }

    fn has_algo(&self, algo: &str) -> bool {
        self.names().any(|a| a == algo)
    }
}

impl LocalNames {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn first(&self) -> &str {
        self.0.first().copied().unwrap_or("")
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| *n == name)
    }
}
