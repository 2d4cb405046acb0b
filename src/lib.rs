//! A recursive DNS relay: answers from a static host table or an in-memory
//! cache where it can, and forwards everything else to a single upstream
//! resolver, correlating replies by a relay-assigned transaction ID.

pub mod cache;
pub mod cli;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod hosts;
pub mod macros;
pub mod pending;
pub mod util;
