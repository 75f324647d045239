//! Inversion data recorded by a sort with key bits stored.
//!
//! Every round leaves one [`UnsortLevel`]: the per-thread key streams (bucket
//! of every input run, in pre-round order) plus an offset table giving, for each
//! unsort thread and bucket, where that thread's share of the bucket starts in
//! the bucket-major output. Walking the levels backwards maps a sorted position
//! to its position before the sort, without one stored index per symbol.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use rayon::prelude::*;
use std::fmt;
use std::io::{Read, Write};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::rl::{InitMode, RunDecoder, StreamSet};
use crate::sorter::SortError;

pub const UNSORT_MAGIC: u32 = 0x52_4C_55_31; // "RLU1"
pub const UNSORT_VERSION: u32 = 1;

/// Inversion data of one radix round.
pub struct UnsortLevel {
    /// Key streams, one per sort thread, in thread order.
    pub key_files: Vec<PathBuf>,
    pub digit_bits: u32,
    /// Symbol mass per bucket over the whole round.
    pub bucket_mass: Vec<u64>,
    /// Symbol sub-ranges of the unsort threads.
    pub thread_ranges: Vec<Range<u64>>,
    // offsets[j * buckets + b]: output start of thread j's share of bucket b
    offsets: Vec<u64>,
    bucket_starts: Vec<u64>,
    streams: OnceLock<StreamSet>,
}

impl fmt::Debug for UnsortLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsortLevel")
            .field("key_files", &self.key_files)
            .field("digit_bits", &self.digit_bits)
            .field("bucket_mass", &self.bucket_mass)
            .field("thread_ranges", &self.thread_ranges)
            .finish_non_exhaustive()
    }
}

impl UnsortLevel {
    /// Build the level of a finished round: a parallel histogram pass over the
    /// key streams, split into `unsort_threads` symbol ranges, followed by the
    /// prefix sums combining per-thread and per-bucket offsets.
    pub fn build(
        key_files: Vec<PathBuf>,
        digit_bits: u32,
        bucket_mass: Vec<u64>,
        unsort_threads: usize,
        pool: &rayon::ThreadPool,
    ) -> Result<Self, SortError> {
        let buckets = bucket_mass.len();
        let total: u64 = bucket_mass.iter().sum();
        let threads = unsort_threads.max(1);
        let per = total.div_ceil(threads as u64);
        let thread_ranges: Vec<Range<u64>> = (0..threads as u64)
            .map(|i| {
                let low = (i * per).min(total);
                low..(low + per).min(total)
            })
            .collect();

        let set = StreamSet::open(&key_files)?;
        let hists = pool.install(|| {
            thread_ranges
                .par_iter()
                .map(|r| key_histogram(&set, r.clone(), buckets))
                .collect::<Result<Vec<_>, SortError>>()
        })?;

        for (r, h) in thread_ranges.iter().zip(&hists) {
            assert_eq!(
                h.iter().sum::<u64>(),
                r.end - r.start,
                "key histogram of unsort range {r:?} does not match its length"
            );
        }

        let mut bucket_starts = Vec::with_capacity(buckets + 1);
        let mut s = 0u64;
        for &m in &bucket_mass {
            bucket_starts.push(s);
            s += m;
        }
        bucket_starts.push(s);
        assert_eq!(s, total);

        let mut offsets = vec![0u64; threads * buckets];
        for b in 0..buckets {
            let mut s = bucket_starts[b];
            for (j, h) in hists.iter().enumerate() {
                offsets[j * buckets + b] = s;
                s += h[b];
            }
            assert_eq!(
                s - bucket_starts[b],
                bucket_mass[b],
                "per-thread mass of bucket {b} does not match the round histogram"
            );
        }

        let streams = OnceLock::new();
        let _ = streams.set(set);
        Ok(UnsortLevel {
            key_files,
            digit_bits,
            bucket_mass,
            thread_ranges,
            offsets,
            bucket_starts,
            streams,
        })
    }

    pub fn buckets(&self) -> usize {
        self.bucket_mass.len()
    }

    /// Output start of unsort thread `j`'s share of bucket `b`.
    pub fn thread_offset(&self, j: usize, b: usize) -> u64 {
        self.offsets[j * self.buckets() + b]
    }

    /// First output position of bucket `b` (`b == buckets` gives the total).
    pub fn bucket_start(&self, b: usize) -> u64 {
        self.bucket_starts[b]
    }

    fn streams(&self) -> Result<&StreamSet, SortError> {
        if let Some(s) = self.streams.get() {
            return Ok(s);
        }
        let set = StreamSet::open(&self.key_files)?;
        Ok(self.streams.get_or_init(|| set))
    }

    /// Check the invariants `build` establishes. Levels read back from disk
    /// must pass before positions are mapped through them.
    fn validate(&self, total: u64) -> Result<(), SortError> {
        let buckets = self.buckets();
        let threads = self.thread_ranges.len();
        let bad = |what: String| Err(SortError::Format(format!("unsort level: {what}")));
        if buckets == 0 || threads == 0 || self.key_files.is_empty() {
            return bad(format!(
                "{buckets} buckets, {threads} threads, {} key streams",
                self.key_files.len()
            ));
        }
        if self.offsets.len() != threads * buckets || self.bucket_starts.len() != buckets + 1 {
            return bad("table sizes do not match bucket and thread counts".into());
        }
        if self.bucket_starts[0] != 0 || self.bucket_starts[buckets] != total {
            return bad(format!("bucket starts do not span 0..{total}"));
        }
        for b in 0..buckets {
            let (lo, hi) = (self.bucket_starts[b], self.bucket_starts[b + 1]);
            if lo.checked_add(self.bucket_mass[b]) != Some(hi) {
                return bad(format!("bucket {b} start does not follow its mass"));
            }
            if self.thread_offset(0, b) != lo {
                return bad(format!("bucket {b} does not start with unsort thread 0"));
            }
            let mut prev = lo;
            for j in 0..threads {
                let o = self.thread_offset(j, b);
                if o < prev || o > hi {
                    return bad(format!("unsort thread {j} offset out of order in bucket {b}"));
                }
                prev = o;
            }
        }
        if self.thread_ranges.iter().any(|r| r.start > r.end || r.end > total) {
            return bad("unsort thread range outside the round".into());
        }
        Ok(())
    }

    /// Map a position in this round's output to its position in the round's input.
    pub fn pre_round_position(&self, p: u64) -> Result<u64, SortError> {
        let buckets = self.buckets();
        let total = self.bucket_starts[buckets];
        if p >= total {
            return Err(SortError::OutOfRange { pos: p, total });
        }
        let b = self.bucket_starts[..buckets].partition_point(|&s| s <= p) - 1;
        let j = (0..self.thread_ranges.len())
            .rev()
            .find(|&j| self.thread_offset(j, b) <= p)
            .unwrap_or(0);
        let mut rank = p - self.thread_offset(j, b);
        let range = self.thread_ranges[j].clone();

        let mut dec = RunDecoder::new(self.streams()?, range.start, InitMode::Original)?;
        let mut pos = range.start;
        while pos < range.end {
            let Some(run) = dec.decode_run()? else {
                break;
            };
            let len = run.len.min(range.end - pos);
            if run.sym == b as u64 {
                if rank < len {
                    return Ok(pos + rank);
                }
                rank -= len;
            }
            pos += len;
        }
        Err(SortError::Format(format!(
            "key streams do not hold output position {p} (bucket {b}, unsort thread {j})"
        )))
    }
}

fn key_histogram(set: &StreamSet, range: Range<u64>, buckets: usize) -> Result<Vec<u64>, SortError> {
    let mut hist = vec![0u64; buckets];
    if range.is_empty() {
        return Ok(hist);
    }
    let mut dec = RunDecoder::new(set, range.start, InitMode::Original)?;
    let mut todo = range.end - range.start;
    while todo > 0 {
        let Some(run) = dec.decode_run()? else {
            return Err(SortError::Format(format!(
                "key streams end with {todo} symbols of {range:?} left"
            )));
        };
        let av = run.len.min(todo);
        let slot = hist
            .get_mut(run.sym as usize)
            .ok_or_else(|| SortError::Format(format!("key {} out of range", run.sym)))?;
        *slot += av;
        todo -= av;
    }
    Ok(hist)
}

/// Stack of unsort levels of one sort, in round order.
#[derive(Debug)]
pub struct UnsortInfo {
    /// Start of the sorted range in the original input.
    pub low: u64,
    pub total_symbols: u64,
    pub unsort_threads: usize,
    pub levels: Vec<UnsortLevel>,
}

impl UnsortInfo {
    pub fn new(low: u64, total_symbols: u64, unsort_threads: usize) -> Self {
        UnsortInfo {
            low,
            total_symbols,
            unsort_threads,
            levels: Vec::new(),
        }
    }

    /// Original (absolute) position of the symbol at `sorted_pos` in the sorted output.
    pub fn original_position(&self, sorted_pos: u64) -> Result<u64, SortError> {
        if sorted_pos >= self.total_symbols {
            return Err(SortError::OutOfRange {
                pos: sorted_pos,
                total: self.total_symbols,
            });
        }
        let mut p = sorted_pos;
        for level in self.levels.iter().rev() {
            p = level.pre_round_position(p)?;
        }
        Ok(self.low + p)
    }

    /// Delete the key streams of every level.
    pub fn remove_files(&self) -> std::io::Result<()> {
        for level in &self.levels {
            for p in &level.key_files {
                std::fs::remove_file(p)?;
            }
        }
        Ok(())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), SortError> {
        w.write_u32::<LE>(UNSORT_MAGIC)?;
        w.write_u32::<LE>(UNSORT_VERSION)?;
        w.write_u64::<LE>(self.low)?;
        w.write_u64::<LE>(self.total_symbols)?;
        w.write_u64::<LE>(self.unsort_threads as u64)?;
        w.write_u64::<LE>(self.levels.len() as u64)?;
        for l in &self.levels {
            w.write_u32::<LE>(l.digit_bits)?;
            w.write_u64::<LE>(l.buckets() as u64)?;
            w.write_u64::<LE>(l.thread_ranges.len() as u64)?;
            w.write_u64::<LE>(l.key_files.len() as u64)?;
            for p in &l.key_files {
                let s = p.to_str().ok_or_else(|| {
                    SortError::Format(format!("{}: path is not UTF-8", p.display()))
                })?;
                w.write_u64::<LE>(s.len() as u64)?;
                w.write_all(s.as_bytes())?;
            }
            for &m in &l.bucket_mass {
                w.write_u64::<LE>(m)?;
            }
            for r in &l.thread_ranges {
                w.write_u64::<LE>(r.start)?;
                w.write_u64::<LE>(r.end)?;
            }
            for &o in &l.offsets {
                w.write_u64::<LE>(o)?;
            }
            for &s in &l.bucket_starts {
                w.write_u64::<LE>(s)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, SortError> {
        let magic = r.read_u32::<LE>()?;
        let version = r.read_u32::<LE>()?;
        if magic != UNSORT_MAGIC {
            return Err(SortError::Format("bad unsort magic".into()));
        }
        if version != UNSORT_VERSION {
            return Err(SortError::Format("unsupported unsort version".into()));
        }
        let low = r.read_u64::<LE>()?;
        let total_symbols = r.read_u64::<LE>()?;
        let unsort_threads = r.read_u64::<LE>()? as usize;
        let nlevels = r.read_u64::<LE>()?;
        let too_large = || SortError::Format("unsort table size overflows".into());

        let mut levels = Vec::new();
        for _ in 0..nlevels {
            let digit_bits = r.read_u32::<LE>()?;
            let buckets = r.read_u64::<LE>()? as usize;
            let threads = r.read_u64::<LE>()? as usize;
            let nfiles = r.read_u64::<LE>()?;
            let mut key_files = Vec::new();
            for _ in 0..nfiles {
                let len = r.read_u64::<LE>()?;
                let mut buf = Vec::new();
                r.by_ref().take(len).read_to_end(&mut buf)?;
                if buf.len() as u64 != len {
                    return Err(SortError::Format("truncated key path".into()));
                }
                let s = String::from_utf8(buf)
                    .map_err(|e| SortError::Format(format!("key path: {e}")))?;
                key_files.push(PathBuf::from(s));
            }
            let bucket_mass = read_u64s(r, buckets)?;
            let mut thread_ranges = Vec::new();
            for _ in 0..threads {
                let start = r.read_u64::<LE>()?;
                let end = r.read_u64::<LE>()?;
                thread_ranges.push(start..end);
            }
            let offsets = read_u64s(r, threads.checked_mul(buckets).ok_or_else(too_large)?)?;
            let bucket_starts = read_u64s(r, buckets.checked_add(1).ok_or_else(too_large)?)?;
            let level = UnsortLevel {
                key_files,
                digit_bits,
                bucket_mass,
                thread_ranges,
                offsets,
                bucket_starts,
                streams: OnceLock::new(),
            };
            level.validate(total_symbols)?;
            levels.push(level);
        }
        Ok(UnsortInfo {
            low,
            total_symbols,
            unsort_threads,
            levels,
        })
    }
}

// Counts come from the file, so the vector grows with what is actually read.
fn read_u64s<R: Read>(r: &mut R, n: usize) -> std::io::Result<Vec<u64>> {
    let mut v = Vec::new();
    for _ in 0..n {
        v.push(r.read_u64::<LE>()?);
    }
    Ok(v)
}
