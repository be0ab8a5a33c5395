//! An HTTP reverse proxy for HLS streams, running alongside the player.
//!
//! The proxy forwards everything to the origin, but learns the stream's renditions from the
//! first playlist it sees and can then serve each media segment from a rendition of its own
//! choosing.  See [`proxy::ProxyServer`] for the entry point.

pub mod fetch;
pub mod hls;
pub mod metric;
pub mod policy;
pub mod proxy;
pub mod upstream;
