//! Round planning: how many threads and bucket files a file budget allows,
//! and how the remaining key bits are spread over the minimum number of rounds.

use crate::sorter::SortError;

/// Number of bits needed to represent `v` (0 for 0).
#[inline]
pub fn bits_needed(v: u64) -> u32 {
    64 - v.leading_zeros()
}

/// Low `bits` bits set.
#[inline]
pub fn low_bits(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

/// Per-thread file allocation derived from the file budget.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileLayout {
    /// Usable worker threads, `min(requested, budget / min files per thread)`.
    pub threads: usize,
    /// Output (bucket) files one thread may hold open.
    pub ofiles_per_thread: u64,
    /// Largest digit width with `2^bits <= ofiles_per_thread`.
    pub max_digit_bits: u32,
}

/// Derive the file layout. Every thread needs one input, two outputs and,
/// when key bits are stored, one key stream.
pub fn plan_layout(
    threads: usize,
    file_budget: u64,
    store_key_bits: bool,
) -> Result<FileLayout, SortError> {
    let key_files = u64::from(store_key_bits);
    let min_files = 3 + key_files;
    let max_threads = file_budget / min_files;
    let threads = (threads.max(1) as u64).min(max_threads);
    if threads == 0 {
        return Err(SortError::Config(format!(
            "file budget {file_budget} is too small (needs at least {min_files})"
        )));
    }

    let files_per_thread = file_budget / threads;
    let ofiles_per_thread = files_per_thread - 1 - key_files;

    let mut max_digit_bits = 1u32;
    let mut ofilecnt = 2u64;
    while max_digit_bits < 63 && ofilecnt * 2 <= ofiles_per_thread {
        ofilecnt *= 2;
        max_digit_bits += 1;
    }
    debug_assert!(ofilecnt <= ofiles_per_thread);

    Ok(FileLayout {
        threads: threads as usize,
        ofiles_per_thread,
        max_digit_bits,
    })
}

/// Digit selection for one radix pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RoundPlan {
    pub shift: u32,
    pub digit_bits: u32,
    pub buckets: usize,
    pub mask: u64,
    /// Rounds still needed including this one.
    pub min_rounds: u32,
}

impl RoundPlan {
    /// Plan the round starting at `shift`. The remaining bits are spread evenly
    /// over `ceil(remaining / max_digit_bits)` rounds.
    ///
    /// With nothing left to sort (`shift >= total_bits`) this still yields a
    /// single 1-bit round, which only copies the range.
    pub fn next(total_bits: u32, shift: u32, max_digit_bits: u32) -> Self {
        let rest = total_bits.saturating_sub(shift).max(1);
        let min_rounds = rest.div_ceil(max_digit_bits);
        let digit_bits = rest.div_ceil(min_rounds);
        debug_assert!(digit_bits <= max_digit_bits);
        RoundPlan {
            shift,
            digit_bits,
            buckets: 1usize << digit_bits,
            mask: low_bits(digit_bits),
            min_rounds,
        }
    }

    /// Bucket of a projected key.
    #[inline]
    pub fn bucket(&self, key: u64) -> usize {
        if self.shift >= 64 {
            0
        } else {
            ((key >> self.shift) & self.mask) as usize
        }
    }
}
