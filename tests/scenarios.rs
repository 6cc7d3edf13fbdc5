//! The six literal scenarios from spec §8, run against the public API as
//! an external crate would use it. Grounded on `jafreck-lz4r`'s
//! `tests/e2e/*.rs` split between scenario-level integration tests and
//! the inline unit tests colocated with the logic they exercise.

use std::fs;
use std::sync::Arc;

use seriesdb::{Error, Series, VarlenSeries};
use tempfile::tempdir;

#[test]
fn scenario_2_range_queries_over_a_block_size_one_series() {
    let dir = tempdir().unwrap();
    let series = Arc::new(Series::create(&dir.path().join("test"), 1, 10, None, 0).unwrap());
    for i in 0..20u64 {
        let ts = 100 * (i + 1);
        series.append(ts, &[(127 - i) as u8]).unwrap();
    }

    let all: Vec<_> = series
        .iterate_range(0, 2000)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(all.len(), 20);

    let tail: Vec<_> = series
        .iterate_range(1500, 2000)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(tail.len(), 6);
    assert_eq!(tail[0].0, 1500);

    let head: Vec<_> = series
        .iterate_range(0, 500)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(head.len(), 5);
    assert_eq!(head.last().unwrap().0, 500);
}

#[test]
fn scenario_3_trim_leaves_exactly_two_chunks() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test3");
    let series = Arc::new(Series::create(&path, 10, 4096, None, 0).unwrap());
    for i in 0..8000u64 {
        series.append(i, &[0u8; 10]).unwrap();
    }
    series.trim(4100).unwrap();

    let chunk_files = fs::read_dir(&path)
        .unwrap()
        .filter(|e| e.as_ref().unwrap().file_name() != "metadata.txt")
        .count();
    assert_eq!(chunk_files, 1);

    let only: Vec<_> = series
        .iterate_range(7999, 7999)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(only, vec![(7999, vec![0u8; 10])]);
}

#[test]
fn scenario_4_close_reopen_preserves_continuity() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test6");
    {
        let series = Arc::new(Series::create(&path, 1, 2048, None, 0).unwrap());
        for i in 0..8000u64 {
            series.append(i, &[(i % 256) as u8]).unwrap();
        }
        series.close().unwrap();
    }
    let series = Arc::new(Series::open(&path).unwrap());
    for i in 8000..16000u64 {
        series.append(i, &[(i % 256) as u8]).unwrap();
    }

    let all: Vec<_> = series
        .iterate_range(0, 17000)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(all.len(), 16000);
    for (i, (ts, payload)) in all.iter().enumerate() {
        assert_eq!(*ts, i as u64);
        assert_eq!(payload, &vec![(i % 256) as u8]);
    }
}

#[test]
fn scenario_5_corrupt_metadata_opens_as_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken");
    fs::create_dir_all(&path).unwrap();
    fs::write(path.join("metadata.txt"), b"{}").unwrap();
    let err = Series::open(&path).unwrap_err();
    assert!(matches!(err, Error::Corruption(_)));
}

#[test]
fn scenario_6_varlen_cascade_directories_and_byte_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("varlen");
    let varlen = Arc::new(VarlenSeries::create(&path, vec![10, 20, 10], 2, 4096, 0).unwrap());

    let dir_count = |p: &std::path::Path| {
        fs::read_dir(p)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name() != "metadata.txt")
            .count()
    };

    varlen.append(0, b"test skarabeusza").unwrap();
    assert_eq!(dir_count(&path), 2);

    varlen
        .append(10, b"test skarabeuszatest skarabeusza")
        .unwrap();
    assert_eq!(dir_count(&path), 3);

    let all: Vec<_> = varlen
        .iterate_range(0, 20)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].1.to_bytes(), b"test skarabeusza".to_vec());
    assert_eq!(
        all[1].1.to_bytes(),
        b"test skarabeuszatest skarabeusza".to_vec()
    );
}

#[test]
fn varlen_single_tier_repeats_as_a_tail_series() {
    // With only one configured tier, a payload longer than its budget must
    // keep writing repeat records into that same tier instead of failing.
    let dir = tempdir().unwrap();
    let path = dir.path().join("varlen_small");
    let varlen = Arc::new(VarlenSeries::create(&path, vec![4], 10, 4096, 0).unwrap());
    varlen.append(0, b"twelve bytes").unwrap();

    let all: Vec<_> = varlen
        .iterate_range(0, 0)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].1.to_bytes(), b"twelve bytes".to_vec());
}
