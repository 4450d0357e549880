//! Counting table adapter
//!
//! The engine never parses k-mer counting tables itself. It asks a
//! [`CountSource`] to load a sample by name, report its table layout, or
//! stream one table block by block. [`StoreSource`] reads sample files kept
//! in the chunked array store; [`MemorySource`] serves samples held in memory.

use crate::array::{self, BlockIter, DType, Element};
use crate::error::{KwipError, Result};
use std::collections::HashMap;
use std::path::Path;

/// Key prefix of count tables inside a sample file (`counts/0`, `counts/1`, ...)
pub const TABLE_KEY_PREFIX: &str = "counts/";

/// One fixed-size table of non-negative counts, indexed by bin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountTable {
    counts: Vec<u32>,
}

impl CountTable {
    pub fn new(counts: Vec<u32>) -> Self {
        Self { counts }
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.counts
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sum of all raw counts
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }
}

impl From<Vec<u32>> for CountTable {
    fn from(counts: Vec<u32>) -> Self {
        Self::new(counts)
    }
}

/// A named sample with one or more count tables.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    name: String,
    tables: Vec<CountTable>,
}

impl Sample {
    pub fn new(name: impl Into<String>, tables: Vec<CountTable>) -> Self {
        Self {
            name: name.into(),
            tables,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tables(&self) -> &[CountTable] {
        &self.tables
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    /// Element count of every table, in table order
    pub fn dimensions(&self) -> Vec<usize> {
        self.tables.iter().map(CountTable::len).collect()
    }

    /// Fail unless `other` has exactly the same table layout.
    pub fn check_dimensions(&self, other: &Sample) -> Result<()> {
        let left = self.dimensions();
        let right = other.dimensions();
        if left != right {
            return Err(KwipError::dimension_mismatch(
                &self.name, &left, &other.name, &right,
            ));
        }
        Ok(())
    }
}

/// Callback receiving `(offset, block)` pieces of one table during a scan
pub type BlockVisitor<'a> = dyn FnMut(usize, &[u32]) -> Result<()> + 'a;

/// Provider of per-sample count tables.
pub trait CountSource: Send + Sync {
    /// Load every table of a sample.
    fn load(&self, name: &str) -> Result<Sample>;

    /// Table count and per-table element counts of a sample.
    fn dimensions(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self.load(name)?.dimensions())
    }

    /// Visit one table in order as `(offset, block)` pieces.
    fn scan_table(&self, name: &str, table: usize, visit: &mut BlockVisitor<'_>) -> Result<()> {
        let sample = self.load(name)?;
        let table = sample.tables().get(table).ok_or_else(|| {
            KwipError::format(format!("sample '{}' has no table {}", name, table))
        })?;
        visit(0, table.as_slice())
    }
}

/// Unsigned element types accepted as stored counts.
pub trait CountElement: Element {
    fn to_count(self) -> Option<u32>;
}

impl CountElement for u8 {
    fn to_count(self) -> Option<u32> {
        Some(self as u32)
    }
}

impl CountElement for u16 {
    fn to_count(self) -> Option<u32> {
        Some(self as u32)
    }
}

impl CountElement for u32 {
    fn to_count(self) -> Option<u32> {
        Some(self)
    }
}

impl CountElement for u64 {
    fn to_count(self) -> Option<u32> {
        u32::try_from(self).ok()
    }
}

/// Write a sample file with one stored array per table.
pub fn write_sample<T: CountElement, P: AsRef<Path>>(path: P, tables: &[Vec<T>]) -> Result<()> {
    let path = path.as_ref();
    for (i, table) in tables.iter().enumerate() {
        array::save(path, &format!("{}{}", TABLE_KEY_PREFIX, i), table)?;
    }
    Ok(())
}

fn stream_widened<T: CountElement>(
    path: &str,
    key: &str,
    visit: &mut BlockVisitor<'_>,
) -> Result<()> {
    let mut iter = BlockIter::<T>::open(path, key)?;
    let mut block = Vec::new();
    let mut widened = Vec::new();
    let mut offset = 0;
    while !iter.is_done() {
        iter.next_block_into(&mut block)?;
        widened.clear();
        for &value in &block {
            let count = value.to_count().ok_or_else(|| {
                KwipError::format(format!("count in '{}' of {} exceeds u32", key, path))
            })?;
            widened.push(count);
        }
        visit(offset, &widened)?;
        offset += widened.len();
    }
    Ok(())
}

/// Sample files stored as chunked array containers; names are file paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreSource;

impl StoreSource {
    pub fn new() -> Self {
        Self
    }

    /// Table arrays of a sample file ordered by table index
    fn tables(&self, path: &str) -> Result<Vec<array::ArrayInfo>> {
        let mut tables: Vec<(usize, array::ArrayInfo)> = Vec::new();
        for entry in array::list(path)? {
            if let Some(index) = entry.key.strip_prefix(TABLE_KEY_PREFIX) {
                let index: usize = index.parse().map_err(|_| {
                    KwipError::format(format!("bad table key '{}' in {}", entry.key, path))
                })?;
                tables.push((index, entry));
            }
        }
        if tables.is_empty() {
            return Err(KwipError::format(format!("{} holds no count tables", path)));
        }
        tables.sort_by_key(|(index, _)| *index);
        for (expected, (index, _)) in tables.iter().enumerate() {
            if *index != expected {
                return Err(KwipError::format(format!(
                    "{} is missing count table {}",
                    path, expected
                )));
            }
        }
        Ok(tables.into_iter().map(|(_, entry)| entry).collect())
    }

    fn stream(&self, path: &str, entry: &array::ArrayInfo, visit: &mut BlockVisitor<'_>) -> Result<()> {
        match entry.dtype {
            DType::U8 => stream_widened::<u8>(path, &entry.key, visit),
            DType::U16 => stream_widened::<u16>(path, &entry.key, visit),
            DType::U32 => stream_widened::<u32>(path, &entry.key, visit),
            DType::U64 => stream_widened::<u64>(path, &entry.key, visit),
            other => Err(KwipError::format(format!(
                "count table '{}' in {} has non-integer type {}",
                entry.key, path, other
            ))),
        }
    }
}

impl CountSource for StoreSource {
    fn load(&self, name: &str) -> Result<Sample> {
        let mut tables = Vec::new();
        for entry in self.tables(name)? {
            let mut counts = Vec::with_capacity(entry.len);
            self.stream(name, &entry, &mut |_, block| {
                counts.extend_from_slice(block);
                Ok(())
            })?;
            tables.push(CountTable::new(counts));
        }
        Ok(Sample::new(name, tables))
    }

    fn dimensions(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self.tables(name)?.iter().map(|entry| entry.len).collect())
    }

    fn scan_table(&self, name: &str, table: usize, visit: &mut BlockVisitor<'_>) -> Result<()> {
        let tables = self.tables(name)?;
        let entry = tables.get(table).ok_or_else(|| {
            KwipError::format(format!("sample '{}' has no table {}", name, table))
        })?;
        self.stream(name, entry, visit)
    }
}

/// Samples held in memory, keyed by name.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    samples: HashMap<String, Sample>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sample, replacing any previous sample of the same name.
    pub fn insert(&mut self, name: impl Into<String>, tables: Vec<Vec<u32>>) {
        let name = name.into();
        let tables = tables.into_iter().map(CountTable::new).collect();
        self.samples.insert(name.clone(), Sample::new(name, tables));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl CountSource for MemorySource {
    fn load(&self, name: &str) -> Result<Sample> {
        self.samples
            .get(name)
            .cloned()
            .ok_or_else(|| KwipError::SampleNotFound(name.to_string()))
    }

    fn dimensions(&self, name: &str) -> Result<Vec<usize>> {
        self.samples
            .get(name)
            .map(Sample::dimensions)
            .ok_or_else(|| KwipError::SampleNotFound(name.to_string()))
    }

    fn scan_table(&self, name: &str, table: usize, visit: &mut BlockVisitor<'_>) -> Result<()> {
        let sample = self
            .samples
            .get(name)
            .ok_or_else(|| KwipError::SampleNotFound(name.to_string()))?;
        let table = sample.tables().get(table).ok_or_else(|| {
            KwipError::format(format!("sample '{}' has no table {}", name, table))
        })?;
        visit(0, table.as_slice())
    }
}
