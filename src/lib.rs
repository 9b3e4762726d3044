//! Cycle-level functional model of a tiled vector processor: a grid of
//! compute tiles (kamlets) built from lanes (jamlets), memory tiles
//! (memlets) on the edges, a packet-switched mesh between them, and the
//! message protocols implementing vector memory operations.

#[macro_use]
extern crate log;

pub mod addresses;
pub mod cache;
mod cli;
pub mod clock;
pub mod jamlet;
pub mod kamlet;
pub mod kinstr;
pub mod lamlet;
pub mod memlet;
pub mod message;
pub mod monitor;
pub mod params;
pub mod queue;
pub mod rf;
pub mod router;
pub mod scalar;
pub mod sync;
pub mod txn;
pub mod utils;
pub mod witem;

pub use crate::addresses::{GlobalAddress, MemoryType, Ordering, Tlb, WordOrder};
pub use crate::clock::Clock;
pub use crate::cli::*;
pub use crate::lamlet::{Lamlet, VectorOpResult};
pub use crate::params::LamletParams;
