//! This module contains utilities for testing code that uses network channels. They are used
//!  for testing the channel itself, but they are also exported for application testing, which
//!  is why they are part of the crate's regular (non-#[cfg(test)]) code.

pub mod compact_header;
pub mod duplex_transport;
pub mod message;
