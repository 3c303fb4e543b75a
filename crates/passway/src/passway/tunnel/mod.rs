//! Client-side tunnel engine.
//!
//! One TLS control channel carries newline-delimited signals
//! (`remote://<port>`, `tcp://<id>`, `udp://<id>`). Each session signal claims a
//! pre-dialed data connection from the pool by id and bridges it to the local
//! target.

pub mod channel;
pub mod client;
pub mod dispatch;
pub mod exchange;
pub mod forward;
pub mod pool;
pub mod signal;
pub mod tasks;
pub mod tls;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;
