//! Chunked persistent array store
//!
//! A container file holds any number of named, typed, flat arrays. Each array
//! is written in physical chunks of [`CHUNKSIZE`] elements so that arrays far
//! larger than memory can be produced and consumed in bounded windows:
//!
//! ```text
//! magic "KWIPARR1"
//! per array: u32 header length | bincode header | data (little endian)
//! ```
//!
//! Whole arrays are read with [`read`]; large ones are streamed with
//! [`BlockIter`]. Saving a key rewrites the container into a uniquely named
//! sibling temporary file and renames it over the original, so an array is
//! never partially overwritten in place. Saves to one file are serialised
//! within the process; a reader keeps the handle it scanned, so a concurrent
//! save never shifts the offsets under it.

use crate::error::{KwipError, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;
use tracing::debug;

/// Number of elements per physical chunk.
pub const CHUNKSIZE: usize = 1 << 16;

const MAGIC: &[u8; 8] = b"KWIPARR1";

/// Upper bound on a serialized entry header; anything larger is corruption.
const MAX_HEADER_LEN: u32 = 64 * 1024;

/// Element type tag stored with every array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::U16 => 2,
            DType::U32 | DType::F32 => 4,
            DType::U64 | DType::F64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::U64 => "u64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// A fixed-width numeric type that can be stored in a container.
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    /// Append the little-endian encoding of `values` to `out`.
    fn encode(values: &[Self], out: &mut Vec<u8>);

    /// Decode little-endian `bytes` (a whole number of elements) into `out`.
    fn decode(bytes: &[u8], out: &mut Vec<Self>);
}

macro_rules! impl_element {
    ($t:ty, $dtype:expr, $width:expr) => {
        impl Element for $t {
            const DTYPE: DType = $dtype;

            fn encode(values: &[Self], out: &mut Vec<u8>) {
                out.reserve(values.len() * $width);
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }

            fn decode(bytes: &[u8], out: &mut Vec<Self>) {
                out.reserve(bytes.len() / $width);
                out.extend(bytes.chunks_exact($width).map(|c| {
                    let mut raw = [0u8; $width];
                    raw.copy_from_slice(c);
                    <$t>::from_le_bytes(raw)
                }));
            }
        }
    };
}

impl_element!(u8, DType::U8, 1);
impl_element!(u16, DType::U16, 2);
impl_element!(u32, DType::U32, 4);
impl_element!(u64, DType::U64, 8);
impl_element!(f32, DType::F32, 4);
impl_element!(f64, DType::F64, 8);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryHeader {
    key: String,
    dtype: DType,
    len: u64,
    chunk_size: u64,
}

/// Metadata of one stored array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayInfo {
    pub key: String,
    pub dtype: DType,
    pub len: usize,
    pub num_chunks: usize,
    data_offset: u64,
}

impl ArrayInfo {
    fn data_bytes(&self) -> Result<u64> {
        self.len
            .checked_mul(self.dtype.size())
            .map(|bytes| bytes as u64)
            .ok_or_else(|| KwipError::format(format!("array '{}' too large", self.key)))
    }
}

fn num_chunks(len: usize) -> usize {
    len.div_ceil(CHUNKSIZE)
}

fn read_header_len<R: Read>(reader: &mut R) -> Result<Option<u32>> {
    let mut raw = [0u8; 4];
    let mut filled = 0;
    while filled < raw.len() {
        match reader.read(&mut raw[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(KwipError::format("truncated array header")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(u32::from_le_bytes(raw)))
}

/// Scan every entry header of an open container without touching array data.
///
/// The reader is handed back so callers can read data through the same
/// handle the offsets were taken from.
fn scan_file(file: File, path: &Path) -> Result<(BufReader<File>, Vec<ArrayInfo>)> {
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    reader
        .read_exact(&mut magic)
        .map_err(|_| KwipError::format(format!("{} is not a kwip array file", path.display())))?;
    if &magic != MAGIC {
        return Err(KwipError::format(format!(
            "{} is not a kwip array file",
            path.display()
        )));
    }

    let mut entries = Vec::new();
    let mut offset = MAGIC.len() as u64;
    while let Some(header_len) = read_header_len(&mut reader)? {
        if header_len == 0 || header_len > MAX_HEADER_LEN {
            return Err(KwipError::format(format!(
                "corrupt array header length {} in {}",
                header_len,
                path.display()
            )));
        }
        let mut raw = vec![0u8; header_len as usize];
        reader
            .read_exact(&mut raw)
            .map_err(|_| KwipError::format("truncated array header"))?;
        let header: EntryHeader = bincode::deserialize(&raw)
            .map_err(|e| KwipError::format(format!("corrupt array header: {}", e)))?;

        let len = usize::try_from(header.len)
            .map_err(|_| KwipError::format(format!("array '{}' too large", header.key)))?;
        if header.chunk_size as usize != CHUNKSIZE {
            return Err(KwipError::format(format!(
                "array '{}' uses chunk size {}, expected {}",
                header.key, header.chunk_size, CHUNKSIZE
            )));
        }

        offset += 4 + header_len as u64;
        let info = ArrayInfo {
            key: header.key,
            dtype: header.dtype,
            len,
            num_chunks: num_chunks(len),
            data_offset: offset,
        };
        offset = offset
            .checked_add(info.data_bytes()?)
            .filter(|&end| end <= file_len)
            .ok_or_else(|| {
                KwipError::format(format!(
                    "array '{}' in {} is truncated",
                    info.key,
                    path.display()
                ))
            })?;
        reader.seek(SeekFrom::Start(offset))?;
        entries.push(info);
    }

    Ok((reader, entries))
}

fn scan(path: &Path) -> Result<Vec<ArrayInfo>> {
    let (_, entries) = scan_file(File::open(path)?, path)?;
    Ok(entries)
}

/// List all arrays stored in a container file.
pub fn list<P: AsRef<Path>>(path: P) -> Result<Vec<ArrayInfo>> {
    scan(path.as_ref())
}

/// Metadata of the array stored under `key`.
pub fn info<P: AsRef<Path>>(path: P, key: &str) -> Result<ArrayInfo> {
    let path = path.as_ref();
    scan(path)?
        .into_iter()
        .find(|entry| entry.key == key)
        .ok_or_else(|| KwipError::key_not_found(path.display().to_string(), key))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Per-file writer lock shared by every `save` in this process.
///
/// Locks are keyed by the canonical parent directory joined with the file
/// name, so different spellings of one path serialise against each other.
fn writer_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

    let dir = parent_dir(path);
    let dir = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let key = match path.file_name() {
        Some(name) => dir.join(name),
        None => dir,
    };

    let mut locks = LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(key).or_default())
}

fn write_header<W: Write>(writer: &mut W, key: &str, dtype: DType, len: usize) -> Result<()> {
    let header = EntryHeader {
        key: key.to_string(),
        dtype,
        len: len as u64,
        chunk_size: CHUNKSIZE as u64,
    };
    let raw = bincode::serialize(&header)
        .map_err(|e| KwipError::format(format!("failed to encode array header: {}", e)))?;
    writer.write_all(&(raw.len() as u32).to_le_bytes())?;
    writer.write_all(&raw)?;
    Ok(())
}

fn write_container<T: Element>(
    tmp: &mut NamedTempFile,
    source: Option<(BufReader<File>, Vec<ArrayInfo>)>,
    key: &str,
    data: &[T],
) -> Result<()> {
    let mut writer = BufWriter::new(tmp.as_file_mut());
    writer.write_all(MAGIC)?;

    if let Some((mut reader, entries)) = source {
        for entry in entries.iter().filter(|e| e.key != key) {
            let bytes = entry.data_bytes()?;
            write_header(&mut writer, &entry.key, entry.dtype, entry.len)?;
            reader.seek(SeekFrom::Start(entry.data_offset))?;
            let copied = io::copy(&mut (&mut reader).take(bytes), &mut writer)?;
            if copied != bytes {
                return Err(KwipError::format(format!("array '{}' is truncated", entry.key)));
            }
        }
    }

    write_header(&mut writer, key, T::DTYPE, data.len())?;
    let mut buf = Vec::with_capacity(CHUNKSIZE.min(data.len()) * T::DTYPE.size());
    for chunk in data.chunks(CHUNKSIZE) {
        buf.clear();
        T::encode(chunk, &mut buf);
        writer.write_all(&buf)?;
    }

    writer.flush()?;
    drop(writer);
    tmp.as_file().sync_all()?;
    Ok(())
}

/// Save `data` under `key`, replacing any array previously stored there.
///
/// Other arrays in the file are preserved. The file is created if missing.
/// Saves to one file from several threads are serialised, so concurrent
/// saves of different keys all land.
pub fn save<T: Element, P: AsRef<Path>>(path: P, key: &str, data: &[T]) -> Result<()> {
    let path = path.as_ref();
    let lock = writer_lock(path);
    let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

    let source = match File::open(path) {
        Ok(file) => Some(scan_file(file, path)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    // Dropping an unpersisted temp file removes it.
    let mut tmp = NamedTempFile::new_in(parent_dir(path))?;
    write_container(&mut tmp, source, key, data)?;
    tmp.persist(path).map_err(|e| KwipError::Io(e.error))?;

    debug!(
        path = %path.display(),
        key = key,
        dtype = %T::DTYPE,
        len = data.len(),
        chunks = num_chunks(data.len()),
        "Saved array"
    );
    Ok(())
}

/// Read the whole array stored under `key`.
pub fn read<T: Element, P: AsRef<Path>>(path: P, key: &str) -> Result<Vec<T>> {
    let mut iter = BlockIter::<T>::open(path, key)?;
    let mut out = Vec::with_capacity(iter.len());
    let mut block = Vec::new();
    while !iter.is_done() {
        iter.next_block_into(&mut block)?;
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// Forward-only, restartable iterator over the chunks of one stored array.
pub struct BlockIter<T: Element> {
    reader: BufReader<File>,
    info: ArrayInfo,
    next_chunk: usize,
    buf: Vec<u8>,
    _marker: PhantomData<T>,
}

impl<T: Element> BlockIter<T> {
    /// Open `key` for streaming. Fails if the key is absent or holds another type.
    pub fn open<P: AsRef<Path>>(path: P, key: &str) -> Result<Self> {
        let path = path.as_ref();
        let (reader, entries) = scan_file(File::open(path)?, path)?;
        let info = entries
            .into_iter()
            .find(|entry| entry.key == key)
            .ok_or_else(|| KwipError::key_not_found(path.display().to_string(), key))?;
        if info.dtype != T::DTYPE {
            return Err(KwipError::TypeMismatch {
                key: key.to_string(),
                stored: info.dtype,
                requested: T::DTYPE,
            });
        }
        Ok(Self {
            reader,
            info,
            next_chunk: 0,
            buf: Vec::new(),
            _marker: PhantomData,
        })
    }

    /// Total number of elements in the array
    pub fn len(&self) -> usize {
        self.info.len
    }

    pub fn is_empty(&self) -> bool {
        self.info.len == 0
    }

    /// `ceil(len / CHUNKSIZE)`
    pub fn num_chunks(&self) -> usize {
        self.info.num_chunks
    }

    /// True once every chunk has been returned.
    pub fn is_done(&self) -> bool {
        self.next_chunk >= self.info.num_chunks
    }

    /// Restart from the first chunk.
    pub fn rewind(&mut self) {
        self.next_chunk = 0;
    }

    /// Read the next chunk into `out` (cleared first) and return its length.
    pub fn next_block_into(&mut self, out: &mut Vec<T>) -> Result<usize> {
        if self.is_done() {
            return Err(KwipError::IteratorExhausted {
                key: self.info.key.clone(),
            });
        }

        let start = self.next_chunk * CHUNKSIZE;
        let count = CHUNKSIZE.min(self.info.len - start);
        let width = self.info.dtype.size();

        self.reader.seek(SeekFrom::Start(
            self.info.data_offset + (start * width) as u64,
        ))?;
        self.buf.resize(count * width, 0);
        self.reader.read_exact(&mut self.buf)?;

        out.clear();
        T::decode(&self.buf, out);
        self.next_chunk += 1;
        Ok(count)
    }

    /// Read the next chunk into a fresh vector.
    pub fn next_block(&mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        self.next_block_into(&mut out)?;
        Ok(out)
    }
}

impl<T: Element> Iterator for BlockIter<T> {
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_done() {
            None
        } else {
            Some(self.next_block())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[test]
    fn test_round_trip_lengths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arrays.kwa");

        for len in [0, 1, 17, CHUNKSIZE - 1, CHUNKSIZE, CHUNKSIZE + 1, 3 * CHUNKSIZE + 123] {
            let data = pattern(len);
            save(&path, "test", &data).unwrap();
            let back: Vec<u8> = read(&path, "test").unwrap();
            assert_eq!(back, data, "round trip failed for length {}", len);
        }
    }

    #[test]
    fn test_round_trip_wide_types() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arrays.kwa");

        let ints: Vec<u64> = (0..1000).map(|i| i * 0x1_0000_0001).collect();
        let floats: Vec<f32> = (0..CHUNKSIZE + 5).map(|i| i as f32 / 7.0).collect();
        save(&path, "ints", &ints).unwrap();
        save(&path, "floats", &floats).unwrap();

        assert_eq!(read::<u64, _>(&path, "ints").unwrap(), ints);
        assert_eq!(read::<f32, _>(&path, "floats").unwrap(), floats);
    }

    #[test]
    fn test_block_iteration_completeness() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arrays.kwa");
        let len = 2 * CHUNKSIZE + 1000;
        let data = pattern(len);
        save(&path, "test", &data).unwrap();

        let mut iter = BlockIter::<u8>::open(&path, "test").unwrap();
        assert_eq!(iter.num_chunks(), 3);
        assert_eq!(iter.len(), len);

        let mut collected = Vec::new();
        let mut sizes = Vec::new();
        while !iter.is_done() {
            let block = iter.next_block().unwrap();
            sizes.push(block.len());
            collected.extend(block);
        }
        assert_eq!(sizes, vec![CHUNKSIZE, CHUNKSIZE, 1000]);
        assert_eq!(collected, data);
        assert!(iter.is_done());
    }

    #[test]
    fn test_next_after_done_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arrays.kwa");
        save(&path, "small", &[1u16, 2, 3]).unwrap();

        let mut iter = BlockIter::<u16>::open(&path, "small").unwrap();
        assert_eq!(iter.next_block().unwrap(), vec![1, 2, 3]);
        assert!(iter.is_done());
        match iter.next_block() {
            Err(KwipError::IteratorExhausted { key }) => assert_eq!(key, "small"),
            other => panic!("Expected IteratorExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_rewind_restarts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arrays.kwa");
        let data = pattern(CHUNKSIZE + 10);
        save(&path, "test", &data).unwrap();

        let mut iter = BlockIter::<u8>::open(&path, "test").unwrap();
        let first: Vec<u8> = iter.by_ref().map(|b| b.unwrap()).flatten().collect();
        assert!(iter.is_done());
        iter.rewind();
        let second: Vec<u8> = iter.map(|b| b.unwrap()).flatten().collect();
        assert_eq!(first, data);
        assert_eq!(second, data);
    }

    #[test]
    fn test_empty_array_has_no_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arrays.kwa");
        save::<u32, _>(&path, "empty", &[]).unwrap();

        let iter = BlockIter::<u32>::open(&path, "empty").unwrap();
        assert_eq!(iter.num_chunks(), 0);
        assert!(iter.is_done());
        assert!(read::<u32, _>(&path, "empty").unwrap().is_empty());
    }

    #[test]
    fn test_save_replaces_key_and_keeps_others() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arrays.kwa");
        save(&path, "a", &[1u32, 2, 3]).unwrap();
        save(&path, "b", &pattern(CHUNKSIZE + 3)).unwrap();
        save(&path, "a", &[9.5f64]).unwrap();

        let keys: Vec<String> = list(&path).unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(read::<f64, _>(&path, "a").unwrap(), vec![9.5]);
        assert_eq!(read::<u8, _>(&path, "b").unwrap(), pattern(CHUNKSIZE + 3));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_missing_key_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arrays.kwa");
        save(&path, "present", &[1u8]).unwrap();

        match read::<u8, _>(&path, "absent") {
            Err(KwipError::KeyNotFound { key, .. }) => assert_eq!(key, "absent"),
            other => panic!("Expected KeyNotFound, got {:?}", other),
        }
        assert!(BlockIter::<u8>::open(&path, "absent").is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let result = read::<u8, _>(dir.path().join("nope.kwa"), "x");
        assert!(matches!(result, Err(KwipError::Io(_))));
    }

    #[test]
    fn test_type_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arrays.kwa");
        save(&path, "counts", &[1u16, 2]).unwrap();

        match read::<u32, _>(&path, "counts") {
            Err(KwipError::TypeMismatch { stored, requested, .. }) => {
                assert_eq!(stored, DType::U16);
                assert_eq!(requested, DType::U32);
            }
            other => panic!("Expected TypeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_foreign_and_truncated_files() {
        let dir = TempDir::new().unwrap();

        let foreign = dir.path().join("foreign.kwa");
        fs::write(&foreign, b"not an array container").unwrap();
        assert!(matches!(list(&foreign), Err(KwipError::Format(_))));
        assert!(save(&foreign, "x", &[1u8]).is_err());
        assert_eq!(fs::read(&foreign).unwrap(), b"not an array container");

        let truncated = dir.path().join("truncated.kwa");
        save(&truncated, "x", &pattern(1000)).unwrap();
        let bytes = fs::read(&truncated).unwrap();
        fs::write(&truncated, &bytes[..bytes.len() - 10]).unwrap();
        assert!(matches!(info(&truncated, "x"), Err(KwipError::Format(_))));

        let oversized = dir.path().join("oversized.kwa");
        let header = bincode::serialize(&EntryHeader {
            key: "counts/0".to_string(),
            dtype: DType::U64,
            len: 1 << 61,
            chunk_size: CHUNKSIZE as u64,
        })
        .unwrap();
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&[0u8; 64]);
        fs::write(&oversized, &bytes).unwrap();
        match list(&oversized) {
            Err(KwipError::Format(message)) => assert!(message.contains("too large"), "{}", message),
            other => panic!("Expected Format error, got {:?}", other),
        }
        assert!(matches!(read::<u64, _>(&oversized, "counts/0"), Err(KwipError::Format(_))));
        assert!(save(&oversized, "x", &[1u8]).is_err());
    }

    #[test]
    fn test_concurrent_saves_of_different_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.kwa");

        for round in 0..20u32 {
            std::thread::scope(|scope| {
                let handles: Vec<_> = (0..4u32)
                    .map(|t| {
                        let path = &path;
                        scope.spawn(move || save(path, &format!("k{}", t), &[round, t]))
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap().unwrap();
                }
            });

            let mut keys: Vec<String> = list(&path).unwrap().into_iter().map(|e| e.key).collect();
            keys.sort();
            assert_eq!(keys, vec!["k0", "k1", "k2", "k3"], "round {}", round);
            for t in 0..4u32 {
                assert_eq!(read::<u32, _>(&path, &format!("k{}", t)).unwrap(), vec![round, t]);
            }
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_open_iterator_survives_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arrays.kwa");
        let data = pattern(CHUNKSIZE + 7);
        save(&path, "z", &[1u8; 3]).unwrap();
        save(&path, "data", &data).unwrap();

        let mut iter = BlockIter::<u8>::open(&path, "data").unwrap();
        // The new file stores a shorter "data" at the same offset.
        save(&path, "data", &pattern(10)).unwrap();
        let mut streamed = Vec::new();
        while !iter.is_done() {
            streamed.extend(iter.next_block().unwrap());
        }
        assert_eq!(streamed, data);
    }
}
