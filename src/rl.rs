//! Run-length symbol streams: header + varint payload + block index + trailer.
//! All fixed-width integers are little-endian.
//!
//! Payload runs are LEB128 `(symbol, length)` pairs. Every `block_runs` runs a
//! block index entry records the byte offset, the first run index and the first
//! symbol position of the block, so a decoder can be positioned either by symbol
//! (original encoding) or by run (known-count encoding) without a full scan.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::sorter::SortError;

pub const RL_MAGIC: u32 = 0x52_4C_53_31; // "RLS1"
pub const RL_VERSION: u32 = 1;

const HEADER_LEN: u64 = 8;
const TRAILER_LEN: u64 = 48;
const BLOCK_ENTRY_LEN: u64 = 24;
const WRITE_BUFFER_SIZE: usize = 64 * 1024;
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A block of `len` copies of `sym`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Run {
    pub sym: u64,
    pub len: u64,
}

impl Run {
    #[inline]
    pub fn new(sym: u64, len: u64) -> Self {
        Run { sym, len }
    }
}

/// How offsets and ranges handed to a [`RunDecoder`] are interpreted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InitMode {
    /// Offsets are symbol positions. Used on caller-supplied streams.
    Original,
    /// Offsets are run indices. Used on streams written by the sorter.
    KnownCount,
}

/// Totals of a finished stream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub runs: u64,
    pub symbols: u64,
}

#[derive(Copy, Clone, Debug, Default)]
struct BlockEntry {
    byte_offset: u64,
    first_run: u64,
    first_sym: u64,
}

#[derive(Clone, Copy, Default)]
struct Trailer {
    runs: u64,
    symbols: u64,
    index_offset: u64,
    blocks: u64,
    block_runs: u64,
    version: u32,
    magic: u32,
}

impl Trailer {
    fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u64::<LE>(self.runs)?;
        w.write_u64::<LE>(self.symbols)?;
        w.write_u64::<LE>(self.index_offset)?;
        w.write_u64::<LE>(self.blocks)?;
        w.write_u64::<LE>(self.block_runs)?;
        w.write_u32::<LE>(self.version)?;
        w.write_u32::<LE>(self.magic)?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(Trailer {
            runs: r.read_u64::<LE>()?,
            symbols: r.read_u64::<LE>()?,
            index_offset: r.read_u64::<LE>()?,
            blocks: r.read_u64::<LE>()?,
            block_runs: r.read_u64::<LE>()?,
            version: r.read_u32::<LE>()?,
            magic: r.read_u32::<LE>()?,
        })
    }
}

// ---------------- Varint (LEB128) utils ----------------

#[inline]
fn write_varu64<W: Write>(mut x: u64, w: &mut W) -> std::io::Result<u64> {
    let mut n = 0u64;
    while x >= 0x80 {
        w.write_u8((x as u8) | 0x80)?;
        x >>= 7;
        n += 1;
    }
    w.write_u8(x as u8)?;
    Ok(n + 1)
}

#[inline]
fn read_varu64<R: Read>(r: &mut R) -> std::io::Result<u64> {
    let mut x: u64 = 0;
    let mut s = 0u32;
    loop {
        let b = r.read_u8()?;
        if s >= 64 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "varint overflows u64",
            ));
        }
        x |= ((b & 0x7F) as u64) << s;
        if (b & 0x80) == 0 {
            break;
        }
        s += 7;
    }
    Ok(x)
}

/// Buffered run encoder writing one stream file.
pub struct RunWriter {
    out: BufWriter<File>,
    block_runs: u64,
    pending: Option<Run>,
    index: Vec<BlockEntry>,
    pos: u64,
    runs: u64,
    symbols: u64,
}

impl RunWriter {
    /// Create (truncate) `path`; an index entry is emitted every `block_runs` runs.
    pub fn create(path: &Path, block_runs: usize) -> Result<Self, SortError> {
        let file = File::create(path)?;
        let mut out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        out.write_u32::<LE>(RL_MAGIC)?;
        out.write_u32::<LE>(RL_VERSION)?;
        Ok(RunWriter {
            out,
            block_runs: block_runs.max(1) as u64,
            pending: None,
            index: Vec::new(),
            pos: HEADER_LEN,
            runs: 0,
            symbols: 0,
        })
    }

    /// Append a run. Adjacent runs of the same symbol are merged, empty runs dropped.
    pub fn encode_run(&mut self, run: Run) -> std::io::Result<()> {
        if run.len == 0 {
            return Ok(());
        }
        if let Some(p) = self.pending.as_mut() {
            if p.sym == run.sym {
                p.len += run.len;
                return Ok(());
            }
        }
        if let Some(prev) = self.pending.replace(run) {
            self.emit(prev)?;
        }
        Ok(())
    }

    fn emit(&mut self, run: Run) -> std::io::Result<()> {
        if self.runs % self.block_runs == 0 {
            self.index.push(BlockEntry {
                byte_offset: self.pos,
                first_run: self.runs,
                first_sym: self.symbols,
            });
        }
        self.pos += write_varu64(run.sym, &mut self.out)?;
        self.pos += write_varu64(run.len, &mut self.out)?;
        self.runs += 1;
        self.symbols += run.len;
        Ok(())
    }

    /// Flush the pending run, write block index and trailer, and close the file.
    pub fn finish(mut self) -> std::io::Result<StreamSummary> {
        if let Some(prev) = self.pending.take() {
            self.emit(prev)?;
        }
        let index_offset = self.pos;
        for e in &self.index {
            self.out.write_u64::<LE>(e.byte_offset)?;
            self.out.write_u64::<LE>(e.first_run)?;
            self.out.write_u64::<LE>(e.first_sym)?;
        }
        Trailer {
            runs: self.runs,
            symbols: self.symbols,
            index_offset,
            blocks: self.index.len() as u64,
            block_runs: self.block_runs,
            version: RL_VERSION,
            magic: RL_MAGIC,
        }
        .write_to(&mut self.out)?;
        self.out.flush()?;
        Ok(StreamSummary {
            runs: self.runs,
            symbols: self.symbols,
        })
    }
}

struct StreamMeta {
    path: PathBuf,
    runs: u64,
    symbols: u64,
    index: Vec<BlockEntry>,
}

/// Trailers and block indexes of an ordered list of streams, read once and
/// shared read-only by all decoders of a round.
pub struct StreamSet {
    streams: Vec<StreamMeta>,
    run_starts: Vec<u64>,
    sym_starts: Vec<u64>,
}

impl StreamSet {
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self, SortError> {
        let mut streams = Vec::with_capacity(paths.len());
        let mut run_starts = Vec::with_capacity(paths.len() + 1);
        let mut sym_starts = Vec::with_capacity(paths.len() + 1);
        let (mut runs, mut syms) = (0u64, 0u64);
        for p in paths {
            let meta = read_meta(p.as_ref())?;
            run_starts.push(runs);
            sym_starts.push(syms);
            runs = runs
                .checked_add(meta.runs)
                .ok_or_else(|| corrupt(&meta.path, "run count overflows"))?;
            syms = syms
                .checked_add(meta.symbols)
                .ok_or_else(|| corrupt(&meta.path, "symbol count overflows"))?;
            streams.push(meta);
        }
        run_starts.push(runs);
        sym_starts.push(syms);
        Ok(StreamSet {
            streams,
            run_starts,
            sym_starts,
        })
    }

    /// Number of runs over all streams (the known-count length).
    pub fn total_runs(&self) -> u64 {
        self.run_starts.last().copied().unwrap_or(0)
    }

    pub fn total_symbols(&self) -> u64 {
        self.sym_starts.last().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

fn corrupt(path: &Path, what: &str) -> SortError {
    SortError::Format(format!("{}: {what}", path.display()))
}

fn read_meta(path: &Path) -> Result<StreamMeta, SortError> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    if file_len < HEADER_LEN + TRAILER_LEN {
        return Err(corrupt(path, "not a run-length stream"));
    }
    let mut r = BufReader::new(file);
    let magic = r.read_u32::<LE>()?;
    let version = r.read_u32::<LE>()?;
    if magic != RL_MAGIC || version != RL_VERSION {
        return Err(corrupt(path, "not a run-length stream"));
    }
    r.seek(SeekFrom::Start(file_len - TRAILER_LEN))?;
    let t = Trailer::read_from(&mut r)?;
    if t.magic != RL_MAGIC || t.version != RL_VERSION || t.block_runs == 0 {
        return Err(corrupt(path, "bad trailer"));
    }
    // header | payload | index | trailer must tile the file exactly
    let tiled = t
        .blocks
        .checked_mul(BLOCK_ENTRY_LEN)
        .and_then(|n| n.checked_add(t.index_offset))
        .and_then(|n| n.checked_add(TRAILER_LEN));
    if t.index_offset < HEADER_LEN || tiled != Some(file_len) {
        return Err(corrupt(path, "trailer does not match file length"));
    }
    // every run takes at least two payload bytes
    if t.runs > (t.index_offset - HEADER_LEN) / 2 || t.blocks != t.runs.div_ceil(t.block_runs) {
        return Err(corrupt(path, "run count does not match payload"));
    }
    r.seek(SeekFrom::Start(t.index_offset))?;
    let mut index = Vec::with_capacity(t.blocks as usize);
    for _ in 0..t.blocks {
        let e = BlockEntry {
            byte_offset: r.read_u64::<LE>()?,
            first_run: r.read_u64::<LE>()?,
            first_sym: r.read_u64::<LE>()?,
        };
        if e.byte_offset < HEADER_LEN || e.byte_offset >= t.index_offset || e.first_run >= t.runs {
            return Err(corrupt(path, "block index entry out of range"));
        }
        index.push(e);
    }
    Ok(StreamMeta {
        path: path.to_path_buf(),
        runs: t.runs,
        symbols: t.symbols,
        index,
    })
}

/// Lazy run decoder over a [`StreamSet`], starting at a given offset.
///
/// Holds at most one open file at a time.
pub struct RunDecoder<'a> {
    set: &'a StreamSet,
    next_stream: usize,
    reader: Option<BufReader<File>>,
    runs_left: u64,
    lookahead: Option<Run>,
}

impl<'a> RunDecoder<'a> {
    /// Position a decoder at `offset`, a symbol position for
    /// [`InitMode::Original`] or a run index for [`InitMode::KnownCount`].
    ///
    /// In original mode an offset inside a run yields the remainder of that run first.
    pub fn new(set: &'a StreamSet, offset: u64, mode: InitMode) -> Result<Self, SortError> {
        let starts = match mode {
            InitMode::Original => &set.sym_starts,
            InitMode::KnownCount => &set.run_starts,
        };
        let mut dec = RunDecoder {
            set,
            next_stream: set.streams.len(),
            reader: None,
            runs_left: 0,
            lookahead: None,
        };
        // first stream whose extent reaches past `offset`; empty streams are skipped
        let Some(s) = (0..set.streams.len()).find(|&i| starts[i + 1] > offset) else {
            return Ok(dec);
        };
        let local = offset - starts[s];
        let meta = &set.streams[s];
        let blk = match mode {
            InitMode::Original => meta.index.partition_point(|e| e.first_sym <= local),
            InitMode::KnownCount => meta.index.partition_point(|e| e.first_run <= local),
        }
        .saturating_sub(1);
        let entry = meta
            .index
            .get(blk)
            .copied()
            .ok_or_else(|| corrupt(&meta.path, "missing block index"))?;

        let mut reader = open_at(&meta.path, entry.byte_offset)?;
        // the trailer's run count bounds how far positioning may read
        let mut runs_left = meta.runs - entry.first_run;
        let mut take_run = |reader: &mut BufReader<File>| -> Result<Run, SortError> {
            runs_left = runs_left
                .checked_sub(1)
                .ok_or_else(|| corrupt(&meta.path, "offset lies past the recorded runs"))?;
            read_run(reader, &meta.path)
        };
        match mode {
            InitMode::Original => {
                let mut cur = entry.first_sym;
                loop {
                    let run = take_run(&mut reader)?;
                    let end = cur
                        .checked_add(run.len)
                        .ok_or_else(|| corrupt(&meta.path, "symbol position overflows"))?;
                    if end > local {
                        dec.lookahead = Some(Run::new(run.sym, end - local));
                        break;
                    }
                    cur = end;
                }
            }
            InitMode::KnownCount => {
                for _ in entry.first_run..local {
                    take_run(&mut reader)?;
                }
            }
        }
        dec.reader = Some(reader);
        dec.runs_left = runs_left;
        dec.next_stream = s + 1;
        Ok(dec)
    }

    /// Next run, or `None` once every stream of the set is exhausted.
    pub fn decode_run(&mut self) -> Result<Option<Run>, SortError> {
        if let Some(run) = self.lookahead.take() {
            return Ok(Some(run));
        }
        while self.runs_left == 0 {
            self.reader = None;
            let Some(meta) = self.set.streams.get(self.next_stream) else {
                return Ok(None);
            };
            self.next_stream += 1;
            if meta.runs > 0 {
                self.reader = Some(open_at(&meta.path, HEADER_LEN)?);
                self.runs_left = meta.runs;
            }
        }
        let path = &self.set.streams[self.next_stream - 1].path;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| SortError::Format("decoder has no open stream".into()))?;
        let run = read_run(reader, path)?;
        self.runs_left -= 1;
        Ok(Some(run))
    }
}

fn open_at(path: &Path, byte_offset: u64) -> Result<BufReader<File>, SortError> {
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, File::open(path)?);
    reader.seek(SeekFrom::Start(byte_offset))?;
    Ok(reader)
}

fn read_run<R: Read>(r: &mut R, path: &Path) -> Result<Run, SortError> {
    let sym = read_varu64(r);
    let len = read_varu64(r);
    match (sym, len) {
        (Ok(sym), Ok(len)) => Ok(Run { sym, len }),
        (Err(e), _) | (_, Err(e)) => Err(SortError::Format(format!(
            "{}: truncated run record: {e}",
            path.display()
        ))),
    }
}

/// Write `runs` as a single stream.
pub fn write_stream(path: &Path, runs: &[Run], block_runs: usize) -> Result<StreamSummary, SortError> {
    let mut w = RunWriter::create(path, block_runs)?;
    for &r in runs {
        w.encode_run(r)?;
    }
    Ok(w.finish()?)
}

/// Decode the concatenation of `paths` into memory.
pub fn decode_all<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Run>, SortError> {
    let set = StreamSet::open(paths)?;
    let mut dec = RunDecoder::new(&set, 0, InitMode::KnownCount)?;
    let mut out = Vec::with_capacity(set.total_runs() as usize);
    while let Some(run) = dec.decode_run()? {
        out.push(run);
    }
    Ok(out)
}
