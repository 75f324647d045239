//! External, multi-threaded, multi-round radix sort for run-length encoded
//! symbol sequences.
//!
//! The sequence lives on disk as `(symbol, length)` runs spread over several
//! streams. Each round partitions a symbol range by one digit of the projected
//! key into per-thread bucket streams, laid out bucket-major for the next round.
//! The digit width follows from the open-file budget, so the number of rounds is
//! the minimum the budget allows.
//!
//! Optionally the sort records per-round key streams ([`UnsortInfo`]) from which
//! the original position of any sorted symbol can be recovered later.
//!
//! See `rl` for the on-disk stream format.

mod plan;
mod radix;
pub mod rl;
mod sorter;
mod temp;
mod unsort;

pub use plan::{FileLayout, RoundPlan, bits_needed, plan_layout};
pub use radix::{LocalTally, RoundTally, split_range};
pub use rl::{InitMode, Run, RunDecoder, RunWriter, StreamSet, StreamSummary, decode_all, write_stream};
pub use sorter::{Projector, SortConfig, SortError, SortOutcome, SymbolProjector, radix_sort_runs};
pub use temp::{TempDirNamer, TempFileNamer};
pub use unsort::{UnsortInfo, UnsortLevel};

pub use std::ops::Range;
