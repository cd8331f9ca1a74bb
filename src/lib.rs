//! Core library of the directed graph shell tools.
//!
//! Processes arranged by the shell into an arbitrary directed pipeline
//! call [`negotiate`] before exchanging any data. The call runs a
//! distributed negotiation that discovers the graph, solves each
//! participant's I/O-channel constraints and hands back the exact read
//! and write descriptors to use afterwards. The companion binaries
//! build on the same library: `dgsh-conc` relays negotiation blocks at
//! multi-way junctions and `dgsh-tee` moves the data once the graph
//! runs.

pub mod codec;
pub mod conc;
pub mod fdpass;
pub mod graph;
pub mod negotiate;
pub mod solver;
pub mod tee;

pub use codec::ProtocolError;
pub use negotiate::{negotiate, NegotiateFlags, Outcome, Session, EX_DRAW_EXIT, EX_PROTOCOL};

use log::LevelFilter;

/// Initialise diagnostics from `DGSH_DEBUG_LEVEL` (0–4); without it,
/// fall back to the default `env_logger` behaviour.
pub fn init_diagnostics() {
    let level = std::env::var("DGSH_DEBUG_LEVEL")
        .ok()
        .and_then(|v| v.parse::<u8>().ok());
    match level {
        Some(level) => {
            let filter = match level {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 | 3 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            };
            env_logger::Builder::new().filter_level(filter).init();
        }
        None => env_logger::init(),
    }
}
