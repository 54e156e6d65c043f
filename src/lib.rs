//! anonircd — an anonymous IRC relay.
//!
//! Every participant in a channel is presented to every other
//! participant as `Anonymous` (numbered beyond the first), while the
//! server tracks real per-connection state for moderation, access
//! control, and logging under opaque short tags.

pub mod config;
pub mod db;
pub mod debug;
pub mod irc;
pub mod narrative;
pub mod util;
