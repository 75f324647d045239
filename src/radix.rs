//! One radix pass over a thread's sub-range: decode runs, bucket them by the
//! current digit of the projected key, append each run to its bucket stream
//! and count the routed symbol mass.

use std::ops::Range;

use crate::plan::RoundPlan;
use crate::rl::{InitMode, Run, RunDecoder, RunWriter, StreamSet, StreamSummary};
use crate::sorter::{Projector, SortError};

/// Counts of one worker, merged into the round tally at the end of its pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalTally {
    /// Symbol mass routed to each bucket.
    pub hist: Vec<u64>,
    /// Largest symbol seen (only tracked while the alphabet is unknown).
    pub max_sym: u64,
    /// Runs decoded from the input sub-range.
    pub runs_in: u64,
}

/// Round-wide totals over all workers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoundTally {
    pub hist: Vec<u64>,
    pub max_sym: u64,
    pub runs_in: u64,
    /// Runs written to bucket streams (after merging equal neighbours).
    pub runs_out: u64,
}

impl RoundTally {
    pub fn new(buckets: usize) -> Self {
        RoundTally {
            hist: vec![0; buckets],
            ..Default::default()
        }
    }

    pub fn merge(&mut self, local: &LocalTally, runs_out: u64) {
        for (g, l) in self.hist.iter_mut().zip(&local.hist) {
            *g += *l;
        }
        self.max_sym = self.max_sym.max(local.max_sym);
        self.runs_in += local.runs_in;
        self.runs_out += runs_out;
    }

    pub fn mass(&self) -> u64 {
        self.hist.iter().sum()
    }
}

/// Split `range` into at most `threads` contiguous pieces of `ceil(len/threads)`;
/// the last piece may be shorter.
pub fn split_range(range: Range<u64>, threads: usize) -> Vec<Range<u64>> {
    let len = range.end.saturating_sub(range.start);
    if len == 0 {
        return Vec::new();
    }
    let pack = len.div_ceil(threads.max(1) as u64);
    let pieces = len.div_ceil(pack);
    (0..pieces)
        .map(|t| {
            let lo = range.start + t * pack;
            lo..(lo + pack).min(range.end)
        })
        .collect()
}

/// Everything one worker needs for its pass. The worker owns its writers and
/// closes them before returning.
pub struct PartitionJob<'a, P: ?Sized> {
    pub streams: &'a StreamSet,
    pub range: Range<u64>,
    pub mode: InitMode,
    pub plan: RoundPlan,
    pub projector: &'a P,
    pub track_max: bool,
    pub outputs: Vec<RunWriter>,
    pub keys: Option<RunWriter>,
}

/// Partition one sub-range. In [`InitMode::KnownCount`] the range counts runs;
/// in [`InitMode::Original`] it counts symbols and the last run is truncated so
/// no symbol past `range.end` is read.
pub fn partition_range<P: Projector + ?Sized>(
    job: PartitionJob<'_, P>,
) -> Result<(LocalTally, Vec<StreamSummary>), SortError> {
    let PartitionJob {
        streams,
        range,
        mode,
        plan,
        projector,
        track_max,
        mut outputs,
        mut keys,
    } = job;
    debug_assert_eq!(outputs.len(), plan.buckets);

    let mut dec = RunDecoder::new(streams, range.start, mode)?;
    let mut tally = LocalTally {
        hist: vec![0; plan.buckets],
        ..Default::default()
    };
    let mut todo = range.end - range.start;

    while todo > 0 {
        let Some(mut run) = dec.decode_run()? else {
            return Err(SortError::Format(format!(
                "input ended with {todo} {} of range {range:?} left",
                match mode {
                    InitMode::Original => "symbols",
                    InitMode::KnownCount => "runs",
                }
            )));
        };
        let key = plan.bucket(projector.project(&run));
        match mode {
            InitMode::Original => {
                run.len = run.len.min(todo);
                todo -= run.len;
            }
            InitMode::KnownCount => todo -= 1,
        }
        outputs[key].encode_run(run)?;
        if let Some(k) = keys.as_mut() {
            k.encode_run(Run::new(key as u64, run.len))?;
        }
        tally.hist[key] += run.len;
        tally.runs_in += 1;
        if track_max {
            tally.max_sym = tally.max_sym.max(run.sym);
        }
    }

    let mut summaries = Vec::with_capacity(outputs.len() + 1);
    for w in outputs {
        summaries.push(w.finish()?);
    }
    if let Some(k) = keys {
        summaries.push(k.finish()?);
    }
    Ok((tally, summaries))
}
