//! This module contains utilities that are useful for testing code based on sessions. They are
//!  used for testing the session functionality itself, but they are also exported for
//!  application testing, e.g. to run a host and its joiners against a
//!  [crate::substrate::memory::MemoryNetwork].

pub mod event;
pub mod handler;
pub mod identity;
pub mod session;
