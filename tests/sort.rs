use runlength_radix_sort::*;
use std::path::{Path, PathBuf};

fn runs(v: &[(u64, u64)]) -> Vec<Run> {
    v.iter().map(|&(s, l)| Run::new(s, l)).collect()
}

fn singles(syms: &[u64]) -> Vec<Run> {
    syms.iter().map(|&s| Run::new(s, 1)).collect()
}

fn expand(runs: &[Run]) -> Vec<u64> {
    runs.iter()
        .flat_map(|r| std::iter::repeat_n(r.sym, r.len as usize))
        .collect()
}

fn write(dir: &Path, name: &str, r: &[Run]) -> PathBuf {
    let p = dir.join(name);
    write_stream(&p, r, 3).unwrap();
    p
}

/// Deterministic pseudo-random symbols (64-bit LCG).
fn lcg_symbols(n: usize, modulo: u64, mut state: u64) -> Vec<u64> {
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) % modulo
        })
        .collect()
}

#[test]
fn sorts_single_stream_of_singletons() {
    let dir = tempfile::tempdir().unwrap();
    let input = write(dir.path(), "in.rls", &singles(&[3, 1, 4, 1, 5, 9, 2, 6]));
    let namer = TempDirNamer::new_in(dir.path()).unwrap();
    let cfg = SortConfig::default().threads(1).file_budget(4);

    let out = radix_sort_runs(vec![input.clone()], 0..8, Some(9), &SymbolProjector, &namer, &cfg)
        .unwrap();
    assert_eq!(expand(&decode_all(&out.files).unwrap()), vec![1, 1, 2, 3, 4, 5, 6, 9]);
    assert_eq!(out.max_sym, 9);
    // 4 key bits, one bit per round with a budget of 4 files
    assert_eq!(out.rounds, 4);
    assert!(input.exists());
    assert!(out.unsort.is_none());
}

#[test]
fn runs_split_between_threads_keep_their_mass() {
    let dir = tempfile::tempdir().unwrap();
    let input = write(dir.path(), "in.rls", &runs(&[(0, 5), (1, 3)]));
    let namer = TempDirNamer::new_in(dir.path()).unwrap();
    let cfg = SortConfig::default()
        .threads(2)
        .file_budget(8)
        .store_key_bits(true);

    let out = radix_sort_runs(vec![input], 0..8, Some(1), &SymbolProjector, &namer, &cfg).unwrap();
    assert_eq!(out.rounds, 1);
    assert_eq!(expand(&decode_all(&out.files).unwrap()), vec![0, 0, 0, 0, 0, 1, 1, 1]);

    let unsort = out.unsort.unwrap();
    assert_eq!(unsort.levels.len(), 1);
    assert_eq!(unsort.levels[0].bucket_mass, vec![5, 3]);
    // thread 0 routed (0,4), thread 1 routed (0,1),(1,3)
    let keys: Vec<Vec<Run>> = unsort.levels[0]
        .key_files
        .iter()
        .map(|p| decode_all(&[p]).unwrap())
        .collect();
    assert_eq!(keys, vec![runs(&[(0, 4)]), runs(&[(0, 1), (1, 3)])]);
}

#[test]
fn file_budget_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let input = write(dir.path(), "in.rls", &singles(&[2, 0, 1]));
    let namer = TempDirNamer::new_in(dir.path()).unwrap();

    let ok = SortConfig::default().threads(1).file_budget(3);
    let out = radix_sort_runs(vec![input.clone()], 0..3, Some(2), &SymbolProjector, &namer, &ok)
        .unwrap();
    assert_eq!(expand(&decode_all(&out.files).unwrap()), vec![0, 1, 2]);

    let too_small = SortConfig::default().threads(1).file_budget(2);
    let err = radix_sort_runs(vec![input.clone()], 0..3, Some(2), &SymbolProjector, &namer, &too_small)
        .unwrap_err();
    assert!(matches!(err, SortError::Config(_)));

    // key streams need a fourth file per thread
    let keyed = SortConfig::default().threads(1).file_budget(3).store_key_bits(true);
    let err = radix_sort_runs(vec![input], 0..3, Some(2), &SymbolProjector, &namer, &keyed)
        .unwrap_err();
    assert!(matches!(err, SortError::Config(_)));
}

#[test]
fn discovered_alphabet_matches_explicit_one() {
    let dir = tempfile::tempdir().unwrap();
    let mut syms = lcg_symbols(300, 200, 7);
    syms[5] = 199;
    let input = write(dir.path(), "in.rls", &singles(&syms));
    let mut expected = syms.clone();
    expected.sort();

    for budget in [4u64, 20] {
        let namer = TempDirNamer::new_in(dir.path()).unwrap();
        let cfg = SortConfig::default().threads(1).file_budget(budget);
        let known = radix_sort_runs(vec![input.clone()], 0..300, Some(199), &SymbolProjector, &namer, &cfg)
            .unwrap();
        let found = radix_sort_runs(vec![input.clone()], 0..300, None, &SymbolProjector, &namer, &cfg)
            .unwrap();
        assert_eq!(found.max_sym, 199);
        assert_eq!(known.rounds, found.rounds);
        assert_eq!(expand(&decode_all(&known.files).unwrap()), expected);
        assert_eq!(expand(&decode_all(&found.files).unwrap()), expected);
    }
}

#[test]
fn multithreaded_sort_over_several_inputs_and_subrange() {
    let dir = tempfile::tempdir().unwrap();
    let a = lcg_symbols(40, 256, 1);
    let b = lcg_symbols(25, 256, 2);
    let lens_a: Vec<Run> = a.iter().enumerate().map(|(i, &s)| Run::new(s, 1 + i as u64 % 3)).collect();
    let lens_b: Vec<Run> = b.iter().enumerate().map(|(i, &s)| Run::new(s, 1 + i as u64 % 4)).collect();
    let pa = write(dir.path(), "a.rls", &lens_a);
    let pb = write(dir.path(), "b.rls", &lens_b);

    let mut all = expand(&lens_a);
    all.extend(expand(&lens_b));
    let range = 7..(all.len() as u64 - 5);
    let mut expected = all[range.start as usize..range.end as usize].to_vec();
    expected.sort();

    let namer = TempDirNamer::new_in(dir.path()).unwrap();
    let cfg = SortConfig::default().threads(4).file_budget(12).block_size(4);
    let out = radix_sort_runs(vec![pa, pb], range.clone(), Some(255), &SymbolProjector, &namer, &cfg)
        .unwrap();
    // 12 files / 4 threads leaves two outputs each: one bit per round
    assert_eq!(out.rounds, 8);
    assert_eq!(out.total_symbols, range.end - range.start);
    assert_eq!(expand(&decode_all(&out.files).unwrap()), expected);
}

#[test]
fn intermediate_and_input_streams_are_retired() {
    let dir = tempfile::tempdir().unwrap();
    let input = write(dir.path(), "in.rls", &singles(&[5, 3, 7, 1, 0, 6]));
    let namer = TempDirNamer::new_in(&dir.path().join("tmp")).unwrap();
    let cfg = SortConfig::default().file_budget(3).delete_input(true);

    let out = radix_sort_runs(vec![input.clone()], 0..6, Some(7), &SymbolProjector, &namer, &cfg)
        .unwrap();
    assert!(!input.exists());
    assert_eq!(out.rounds, 3);
    // only the last round's bucket streams are left
    let mut left: Vec<PathBuf> = std::fs::read_dir(namer.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    left.sort();
    let mut files = out.files.clone();
    files.sort();
    assert_eq!(left, files);
    assert_eq!(expand(&decode_all(&out.files).unwrap()), vec![0, 1, 3, 5, 6, 7]);
}

#[test]
fn empty_range_yields_no_streams() {
    let dir = tempfile::tempdir().unwrap();
    let input = write(dir.path(), "in.rls", &singles(&[1, 2]));
    let namer = TempDirNamer::new_in(dir.path()).unwrap();
    let out = radix_sort_runs(vec![input], 1..1, None, &SymbolProjector, &namer, &SortConfig::default())
        .unwrap();
    assert!(out.files.is_empty());
    assert_eq!(out.rounds, 0);
    assert_eq!(out.max_sym, 0);
}

#[test]
fn tagged_positions_are_recovered_after_sort() {
    const TAG_BITS: u32 = 12;
    let dir = tempfile::tempdir().unwrap();
    let values = lcg_symbols(500, 16, 11);
    let tagged: Vec<u64> = values
        .iter()
        .enumerate()
        .map(|(i, &v)| (v << TAG_BITS) | i as u64)
        .collect();
    let input = write(dir.path(), "in.rls", &singles(&tagged));
    let namer = TempDirNamer::new_in(dir.path()).unwrap();
    let cfg = SortConfig::default()
        .threads(3)
        .file_budget(15)
        .store_key_bits(true)
        .unsort_threads(2)
        .key_block_size(8);
    let by_value = |r: &Run| r.sym >> TAG_BITS;

    let out = radix_sort_runs(vec![input], 0..500, None, &by_value, &namer, &cfg).unwrap();
    let sorted = expand(&decode_all(&out.files).unwrap());
    assert!(sorted.windows(2).all(|w| (w[0] >> TAG_BITS) <= (w[1] >> TAG_BITS)));

    let unsort = out.unsort.unwrap();
    assert_eq!(unsort.levels.len() as u32, out.rounds);
    for (p, &s) in sorted.iter().enumerate() {
        let tag = s & ((1 << TAG_BITS) - 1);
        assert_eq!(unsort.original_position(p as u64).unwrap(), tag);
    }

    // a later process can reload the levels and do the same
    let saved = dir.path().join("unsort.bin");
    let mut f = std::fs::File::create(&saved).unwrap();
    unsort.write_to(&mut f).unwrap();
    drop(f);
    let reloaded = UnsortInfo::read_from(&mut std::fs::File::open(&saved).unwrap()).unwrap();
    for p in [0u64, 17, 250, 499] {
        let tag = sorted[p as usize] & ((1 << TAG_BITS) - 1);
        assert_eq!(reloaded.original_position(p).unwrap(), tag);
    }

    unsort.remove_files().unwrap();
    assert!(unsort.levels.iter().flat_map(|l| &l.key_files).all(|p| !p.exists()));
}
