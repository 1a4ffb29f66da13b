//! Process table snapshots and the cache that keeps them fresh
//!
//! - `source`: enumerating processes (`/proc` on Linux, `ps` elsewhere)
//! - `snapshot`: immutable pid table with parent/child adjacency
//! - `cache`: published snapshot, dirty tracking and the background refresher

mod cache;
mod info;
mod snapshot;
mod source;

pub use cache::ProcessCache;
pub use info::ProcessInfo;
pub use snapshot::ProcessSnapshot;
pub use source::{parse_proc_stat, parse_ps_line, ProcessSource, SystemProcessSource};
