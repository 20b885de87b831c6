//! Low-Latency HLS publisher core.
//!
//! Converts a live sequence of encoded samples into the LL-HLS artifact
//! tree: per-track CMAF init sections, partial segments ("parts"), closed
//! media segments, media chunklists with blocking-reload support, and the
//! multivariant master playlist. The HTTP surface and the sample source
//! live elsewhere; this crate owns everything between them.

mod chunklist;
mod codec;
mod config;
mod dump;
mod error;
mod frame;
mod master;
mod packager;
mod storage;
mod stream;
mod track;

pub use chunklist::*;
pub use codec::*;
pub use config::*;
pub use dump::*;
pub use error::*;
pub use frame::*;
pub use master::*;
pub use packager::*;
pub use storage::*;
pub use stream::*;
pub use track::*;
