//! Round coordinator: repeated LSD radix passes over run-length streams on disk.
//!
//! Each round splits the input range over a fixed pool of workers, lets every
//! worker partition its share into one stream per bucket and concatenates the
//! per-thread pieces bucket-major, which becomes the next round's input. Rounds
//! repeat until every key bit has been consumed.

use log::{debug, info};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::ops::Range;
use std::path::PathBuf;
use thiserror::Error;

use crate::plan::{FileLayout, RoundPlan, bits_needed, plan_layout};
use crate::radix::{PartitionJob, RoundTally, partition_range, split_range};
use crate::rl::{InitMode, Run, RunWriter, StreamSet};
use crate::temp::TempFileNamer;
use crate::unsort::{UnsortInfo, UnsortLevel};

#[derive(Debug, Error)]
/// Errors returned by the sorter.
pub enum SortError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Unusable configuration, detected before any work starts.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Malformed or inconsistent stream data.
    #[error("invalid stream data: {0}")]
    Format(String),
    /// Worker pool could not be created.
    #[error("thread pool: {0}")]
    ThreadPool(String),
    /// Position outside of the sorted range.
    #[error("position {pos} out of range (total {total})")]
    OutOfRange { pos: u64, total: u64 },
}

/// Maps a run to the unsigned key it is sorted by.
pub trait Projector: Sync {
    fn project(&self, run: &Run) -> u64;
}

/// Sorts by the symbol itself.
#[derive(Copy, Clone, Debug, Default)]
pub struct SymbolProjector;

impl Projector for SymbolProjector {
    #[inline]
    fn project(&self, run: &Run) -> u64 {
        run.sym
    }
}

impl<F> Projector for F
where
    F: Fn(&Run) -> u64 + Sync,
{
    #[inline]
    fn project(&self, run: &Run) -> u64 {
        self(run)
    }
}

/// Sort configuration.
#[derive(Clone, Debug)]
pub struct SortConfig {
    threads: usize,
    file_budget: u64,
    block_size: usize,
    key_block_size: usize,
    delete_input: bool,
    store_key_bits: bool,
    unsort_threads: usize,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            file_budget: 256,
            block_size: 4096,
            key_block_size: 4096,
            delete_input: false,
            store_key_bits: false,
            unsort_threads: 1,
        }
    }
}

impl SortConfig {
    /// Desired number of worker threads (capped by the file budget).
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n.max(1);
        self
    }
    /// Maximum number of simultaneously open files.
    pub fn file_budget(mut self, n: u64) -> Self {
        self.file_budget = n;
        self
    }
    /// Runs per indexed block of bucket streams.
    pub fn block_size(mut self, n: usize) -> Self {
        self.block_size = n.max(1);
        self
    }
    /// Runs per indexed block of key streams.
    pub fn key_block_size(mut self, n: usize) -> Self {
        self.key_block_size = n.max(1);
        self
    }
    /// Remove the caller's input streams once the first round has consumed them.
    pub fn delete_input(mut self, yes: bool) -> Self {
        self.delete_input = yes;
        self
    }
    /// Record key streams and offset tables so sorted positions can be inverted.
    pub fn store_key_bits(mut self, yes: bool) -> Self {
        self.store_key_bits = yes;
        self
    }
    /// Parallelism of the histogram pass over key streams.
    pub fn unsort_threads(mut self, n: usize) -> Self {
        self.unsort_threads = n.max(1);
        self
    }
}

/// Result of a sort.
#[derive(Debug)]
pub struct SortOutcome {
    /// Streams whose concatenation, in order, is the sorted range.
    pub files: Vec<PathBuf>,
    /// Largest symbol, as supplied or as discovered by the first round.
    pub max_sym: u64,
    pub rounds: u32,
    pub total_symbols: u64,
    /// Present when key bits were stored.
    pub unsort: Option<UnsortInfo>,
}

/// Files created by a round; removed on drop unless the round commits.
struct RoundFiles {
    paths: Vec<PathBuf>,
    armed: bool,
}

impl RoundFiles {
    fn new() -> Self {
        RoundFiles {
            paths: Vec::new(),
            armed: true,
        }
    }

    fn track(&mut self, p: PathBuf) -> PathBuf {
        self.paths.push(p.clone());
        p
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for RoundFiles {
    fn drop(&mut self) {
        if self.armed {
            for p in &self.paths {
                let _ = std::fs::remove_file(p);
            }
        }
    }
}

/// State carried from round to round.
struct SortContext {
    inputs: Vec<PathBuf>,
    /// Whether `inputs` may be deleted after they have been consumed.
    inputs_disposable: bool,
    range: Range<u64>,
    mode: InitMode,
    shift: u32,
    max_sym: Option<u64>,
    total_bits: u32,
    rounds: u32,
    total_symbols: u64,
    unsort: Option<UnsortInfo>,
}

/// Output of the partitioning phase, not yet checked.
struct RoundOutput {
    files: Vec<PathBuf>,
    key_files: Vec<PathBuf>,
    tally: RoundTally,
    guard: RoundFiles,
}

enum Phase {
    Planning,
    Partitioning(RoundPlan),
    Merging(RoundPlan, RoundOutput),
    Retiring(RoundPlan, RoundOutput),
    Done,
}

/// Sort the symbols at positions `range` of the concatenated `inputs` by
/// `projector`, using at most `cfg`'s file budget of open files.
///
/// `max_sym` bounds the symbol alphabet; when `None` it is discovered by the
/// first round. Projected keys must fit in `bits_needed(max_sym)` bits.
///
/// Caller-owned inputs are only removed when [`SortConfig::delete_input`] is
/// set. A failing round removes everything it created and leaves its inputs
/// in place.
pub fn radix_sort_runs<P, N>(
    inputs: Vec<PathBuf>,
    range: Range<u64>,
    max_sym: Option<u64>,
    projector: &P,
    namer: &N,
    cfg: &SortConfig,
) -> Result<SortOutcome, SortError>
where
    P: Projector + ?Sized,
    N: TempFileNamer + ?Sized,
{
    let layout = plan_layout(cfg.threads, cfg.file_budget, cfg.store_key_bits)?;
    debug!(
        "file budget {}: {} threads, {} output files per thread, digits of up to {} bits",
        cfg.file_budget, layout.threads, layout.ofiles_per_thread, layout.max_digit_bits
    );

    let total_symbols = range.end.saturating_sub(range.start);
    info!(
        "Sorting {} symbols from {} streams with {} threads",
        total_symbols,
        inputs.len(),
        layout.threads
    );

    let unsort = cfg
        .store_key_bits
        .then(|| UnsortInfo::new(range.start, total_symbols, cfg.unsort_threads));

    if total_symbols == 0 {
        if cfg.delete_input {
            for p in &inputs {
                std::fs::remove_file(p)?;
            }
        }
        return Ok(SortOutcome {
            files: Vec::new(),
            max_sym: max_sym.unwrap_or(0),
            rounds: 0,
            total_symbols,
            unsort,
        });
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(layout.threads)
        .build()
        .map_err(|e| SortError::ThreadPool(e.to_string()))?;
    let unsort_pool = if cfg.store_key_bits {
        Some(
            rayon::ThreadPoolBuilder::new()
                .num_threads(cfg.unsort_threads)
                .build()
                .map_err(|e| SortError::ThreadPool(e.to_string()))?,
        )
    } else {
        None
    };

    let mut ctx = SortContext {
        inputs,
        inputs_disposable: cfg.delete_input,
        range,
        mode: InitMode::Original,
        shift: 0,
        max_sym,
        total_bits: max_sym.map_or(64, bits_needed),
        rounds: 0,
        total_symbols,
        unsort,
    };

    let mut phase = Phase::Planning;
    loop {
        phase = match phase {
            Phase::Planning => {
                if ctx.rounds > 0 && ctx.shift >= ctx.total_bits {
                    Phase::Done
                } else {
                    Phase::Partitioning(RoundPlan::next(
                        ctx.total_bits,
                        ctx.shift,
                        layout.max_digit_bits,
                    ))
                }
            }
            Phase::Partitioning(plan) => {
                info!(
                    "Round {}: shift={} digit_bits={} buckets={} ({} rounds left)",
                    ctx.rounds + 1,
                    plan.shift,
                    plan.digit_bits,
                    plan.buckets,
                    plan.min_rounds
                );
                let out = run_round(&ctx, &plan, &layout, projector, namer, cfg, &pool)?;
                Phase::Merging(plan, out)
            }
            Phase::Merging(plan, out) => {
                let mass = out.tally.mass();
                assert_eq!(
                    mass,
                    ctx.total_symbols,
                    "round {} routed {} symbols, expected {}",
                    ctx.rounds + 1,
                    mass,
                    ctx.total_symbols
                );
                if ctx.max_sym.is_none() {
                    ctx.max_sym = Some(out.tally.max_sym);
                    ctx.total_bits = bits_needed(out.tally.max_sym);
                    debug!(
                        "discovered max symbol {} ({} bits)",
                        out.tally.max_sym, ctx.total_bits
                    );
                }
                if let (Some(info), Some(upool)) = (ctx.unsort.as_mut(), unsort_pool.as_ref()) {
                    // a first round planned for 64 bits may be wider than the keys
                    let key_bits = plan.digit_bits.min(ctx.total_bits.saturating_sub(plan.shift));
                    let level = UnsortLevel::build(
                        out.key_files.clone(),
                        key_bits,
                        out.tally.hist.clone(),
                        info.unsort_threads,
                        upool,
                    )?;
                    info.levels.push(level);
                }
                Phase::Retiring(plan, out)
            }
            Phase::Retiring(plan, out) => {
                let RoundOutput {
                    files, tally, guard, ..
                } = out;
                guard.commit();
                let consumed = std::mem::replace(&mut ctx.inputs, files);
                if ctx.inputs_disposable {
                    debug!("removing {} consumed streams", consumed.len());
                    for p in &consumed {
                        std::fs::remove_file(p)?;
                    }
                }
                ctx.inputs_disposable = true;
                ctx.mode = InitMode::KnownCount;
                ctx.range = 0..tally.runs_out;
                ctx.shift += plan.digit_bits;
                ctx.rounds += 1;
                Phase::Planning
            }
            Phase::Done => break,
        };
    }

    let max_sym = ctx.max_sym.unwrap_or(0);
    info!(
        "Sort complete: {} symbols in {} rounds, {} streams, max symbol {}",
        ctx.total_symbols,
        ctx.rounds,
        ctx.inputs.len(),
        max_sym
    );
    Ok(SortOutcome {
        files: ctx.inputs,
        max_sym,
        rounds: ctx.rounds,
        total_symbols: ctx.total_symbols,
        unsort: ctx.unsort,
    })
}

/// Allocate bucket (and key) streams and run every worker of one round.
fn run_round<P, N>(
    ctx: &SortContext,
    plan: &RoundPlan,
    layout: &FileLayout,
    projector: &P,
    namer: &N,
    cfg: &SortConfig,
    pool: &rayon::ThreadPool,
) -> Result<RoundOutput, SortError>
where
    P: Projector + ?Sized,
    N: TempFileNamer + ?Sized,
{
    let streams = StreamSet::open(&ctx.inputs)?;
    let ranges = split_range(ctx.range.clone(), layout.threads);
    let run_threads = ranges.len();
    let mut guard = RoundFiles::new();

    // bucket-major file list, thread-major writers
    let mut files = vec![PathBuf::new(); run_threads * plan.buckets];
    let mut writers: Vec<Vec<Option<RunWriter>>> = (0..run_threads)
        .map(|_| (0..plan.buckets).map(|_| None).collect())
        .collect();
    for b in 0..plan.buckets {
        for (t, row) in writers.iter_mut().enumerate() {
            let p = guard.track(namer.next_path());
            row[b] = Some(RunWriter::create(&p, cfg.block_size)?);
            files[b * run_threads + t] = p;
        }
    }
    let mut key_files = Vec::new();
    let mut key_writers = Vec::new();
    for _ in 0..run_threads {
        if cfg.store_key_bits {
            let p = guard.track(namer.next_path());
            key_writers.push(Some(RunWriter::create(&p, cfg.key_block_size)?));
            key_files.push(p);
        } else {
            key_writers.push(None);
        }
    }

    let jobs: Vec<PartitionJob<'_, P>> = ranges
        .into_iter()
        .zip(writers)
        .zip(key_writers)
        .map(|((range, outputs), keys)| PartitionJob {
            streams: &streams,
            range,
            mode: ctx.mode,
            plan: *plan,
            projector,
            track_max: ctx.max_sym.is_none(),
            outputs: outputs.into_iter().flatten().collect(),
            keys,
        })
        .collect();

    let tally = Mutex::new(RoundTally::new(plan.buckets));
    pool.install(|| {
        jobs.into_par_iter()
            .enumerate()
            .try_for_each(|(t, job)| -> Result<(), SortError> {
                let range = job.range.clone();
                let (local, summaries) = partition_range(job)?;
                let runs_out: u64 = summaries[..plan.buckets].iter().map(|s| s.runs).sum();
                debug!("thread {t}: {range:?} -> {} runs in, {runs_out} runs out", local.runs_in);
                tally.lock().merge(&local, runs_out);
                Ok(())
            })
    })?;

    Ok(RoundOutput {
        files,
        key_files,
        tally: tally.into_inner(),
        guard,
    })
}
