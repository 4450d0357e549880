//! End-to-end tests over sample files in the chunked array store

use kwip::array::CHUNKSIZE;
use kwip::counts::{CountSource, MemorySource, StoreSource, write_sample};
use kwip::entropy::EntropyVector;
use kwip::kernel::{KernelEngine, Metric, WeightedInnerProduct};
use kwip::matrix::KernelMatrix;
use kwip::popstats::PopulationStats;
use std::path::Path;
use tempfile::TempDir;

const TABLE_SIZES: [usize; 2] = [CHUNKSIZE + 500, 1000];

fn synthetic_tables(seed: u32) -> Vec<Vec<u32>> {
    TABLE_SIZES
        .iter()
        .enumerate()
        .map(|(t, &size)| {
            (0..size as u32)
                .map(|i| {
                    let h = (i ^ (seed * 7919 + t as u32 * 104729)).wrapping_mul(2654435761);
                    if h % 4 == 0 { h >> 28 } else { 0 }
                })
                .collect()
        })
        .collect()
}

/// Writes `n` samples, alternating u16 and u32 element types.
fn write_cohort(dir: &Path, n: u32) -> (Vec<String>, MemorySource) {
    let mut names = Vec::new();
    let mut memory = MemorySource::new();
    for s in 0..n {
        let tables = synthetic_tables(s);
        let path = dir.join(format!("sample{}.kwa", s));
        if s % 2 == 0 {
            let narrow: Vec<Vec<u16>> = tables
                .iter()
                .map(|t| t.iter().map(|&c| c as u16).collect())
                .collect();
            write_sample(&path, &narrow).unwrap();
        } else {
            write_sample(&path, &tables).unwrap();
        }
        let name = path.to_string_lossy().into_owned();
        memory.insert(name.clone(), tables);
        names.push(name);
    }
    (names, memory)
}

fn run(metric: Metric, source: &dyn CountSource, names: &[String], threads: usize) -> KernelMatrix {
    KernelEngine::new(metric.build(false), threads)
        .calculate_pairwise(source, names)
        .unwrap()
}

#[test]
fn test_store_matches_memory() {
    let dir = TempDir::new().unwrap();
    let (names, memory) = write_cohort(dir.path(), 5);
    let store = StoreSource::new();

    assert_eq!(store.dimensions(&names[0]).unwrap(), TABLE_SIZES.to_vec());
    assert_eq!(store.load(&names[1]).unwrap(), memory.load(&names[1]).unwrap());

    for metric in [Metric::D2, Metric::D2pop, Metric::Js, Metric::Wip] {
        let from_store = run(metric, &store, &names, 4);
        let from_memory = run(metric, &memory, &names, 1);
        assert_eq!(from_store, from_memory, "{} differs between sources", metric);
        assert!(from_store.is_symmetric());
    }
}

#[test]
fn test_streamed_aggregation_matches_whole_tables() {
    let dir = TempDir::new().unwrap();
    let (names, memory) = write_cohort(dir.path(), 6);
    let pool = KernelEngine::thread_pool(3).unwrap();

    let streamed = PopulationStats::aggregate(&StoreSource::new(), &names, &pool).unwrap();
    let whole = PopulationStats::aggregate(&memory, &names, &pool).unwrap();
    assert_eq!(streamed.population_counts(), whole.population_counts());
    assert_eq!(streamed.table_sums(), whole.table_sums());
    assert_eq!(streamed.samples_seen(), 6);
}

#[test]
fn test_saved_weights_reproduce_kernel() {
    let dir = TempDir::new().unwrap();
    let (names, _) = write_cohort(dir.path(), 4);
    let store = StoreSource::new();
    let pool = KernelEngine::thread_pool(2).unwrap();

    let mut wip = WeightedInnerProduct::new();
    let entropy = wip.calculate_entropy_vector(&store, &names, &pool).unwrap().clone();
    assert_eq!(entropy.len(), TABLE_SIZES.iter().sum::<usize>());
    assert!(entropy.values().iter().all(|&e| (0.0..=1.0).contains(&e)));

    let weights = dir.path().join("weights.txt");
    entropy.save_to_path(&weights).unwrap();
    let reloaded = EntropyVector::load_from_path(&weights).unwrap();
    assert_eq!(reloaded, entropy);

    let computed = KernelEngine::new(Box::new(wip), 2)
        .calculate_pairwise(&store, &names)
        .unwrap();
    let from_file = KernelEngine::new(Box::new(WeightedInnerProduct::with_entropy(reloaded)), 2)
        .calculate_pairwise(&store, &names)
        .unwrap();
    assert_eq!(computed, from_file);
}

#[test]
fn test_distance_properties() {
    let dir = TempDir::new().unwrap();
    let (names, _) = write_cohort(dir.path(), 4);
    let kernel = run(Metric::Wip, &StoreSource::new(), &names, 2);
    let distance = kernel.to_distance();

    for i in 0..names.len() {
        assert_eq!(distance.get(i, i), 0.0);
        for j in 0..names.len() {
            let d = distance.get(i, j);
            assert!((0.0..=2.0).contains(&d), "distance {} out of range", d);
            assert_eq!(d, distance.get(j, i));
        }
    }
}

#[test]
fn test_missing_sample_file_fails() {
    let dir = TempDir::new().unwrap();
    let (mut names, _) = write_cohort(dir.path(), 2);
    names.push(dir.path().join("absent.kwa").to_string_lossy().into_owned());

    for metric in [Metric::D2, Metric::Wip] {
        let result = KernelEngine::new(metric.build(false), 2).calculate_pairwise(&StoreSource::new(), &names);
        assert!(result.is_err(), "{} should fail on a missing sample", metric);
    }
}
