//! Tokio driver for the dusk SSH engine.
//!
//! [`spawn()`] runs a [`Runner`](dusk::Runner) over any tokio stream on its
//! own task. The application talks to it through a cloneable [`SshHandle`],
//! or a [`BlockingHandle`] from non-async threads, and receives
//! [`Event`](dusk::Event)s from [`Events`].
//!
//! [`ConnectionManager`] keeps a registry of running connections.

// avoid mysterious missing awaits
#![deny(unused_must_use)]
#![forbid(unsafe_code)]

mod driver;
mod handle;
mod manager;

#[cfg(test)]
mod testutil;

pub use driver::{connect, spawn};
pub use handle::{BlockingHandle, Events, SshHandle};
pub use manager::{ConnId, ConnectionManager};
