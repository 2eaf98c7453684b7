use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::tags::{TagRecord, TagSlot, TAG_SLOTS};

/// Format written by `persist`. Version 1 (no watermark section) is still
/// accepted by the loader.
const CACHE_VERSION: i32 = 2;

/// Upper bound for any single encoded string; anything larger means the
/// blob is garbage, not a tag value.
const MAX_STRING_LEN: u32 = 1 << 20;

/// Outcome of loading the on-disk blob. `Empty` and `Corrupt` both mean
/// cold start; they differ only in what gets logged.
#[derive(Debug)]
pub enum CacheLoad {
    Loaded {
        records: Vec<TagRecord>,
        watermarks: HashMap<String, u64>,
    },
    Empty,
    Corrupt,
}

enum ParseError {
    Truncated,
    Malformed(String),
}

impl From<io::Error> for ParseError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ParseError::Truncated
        } else {
            ParseError::Malformed(err.to_string())
        }
    }
}

/// The persisted, flattened list of tag records plus the watermark table,
/// stored as one versioned little-endian blob. Replaced wholesale on every
/// refresh; never mutated in place.
pub struct FileRecordCache {
    path: PathBuf,
}

impl FileRecordCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the blob. Missing, zero-length and truncated files are all
    /// recoverable (`Empty`); a structurally invalid blob is `Corrupt`.
    /// Neither aborts anything; the caller re-enumerates.
    pub fn load(&self) -> CacheLoad {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() > 0 => {}
            _ => return CacheLoad::Empty,
        }
        let _lock = self.shared_lock();
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), %err, "cache unreadable");
                return CacheLoad::Empty;
            }
        };
        match parse(&mut BufReader::new(file)) {
            Ok((records, watermarks)) => {
                tracing::info!(count = records.len(), "loaded file record cache");
                CacheLoad::Loaded {
                    records,
                    watermarks,
                }
            }
            Err(ParseError::Truncated) => {
                tracing::warn!(path = %self.path.display(), "cache truncated, ignoring");
                CacheLoad::Empty
            }
            Err(ParseError::Malformed(reason)) => {
                tracing::warn!(path = %self.path.display(), reason, "cache corrupt, ignoring");
                CacheLoad::Corrupt
            }
        }
    }

    /// Write a new generation of the blob. The content goes to a temp file
    /// first and replaces the destination by rename, so a reader never sees
    /// a half-written cache.
    pub fn persist(
        &self,
        records: &[TagRecord],
        watermarks: &HashMap<String, u64>,
    ) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let lock = self.exclusive_lock()?;

        let tmp = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            encode(&mut writer, records, watermarks, CACHE_VERSION)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        let _ = lock.unlock();
        tracing::debug!(count = records.len(), path = %self.path.display(), "persisted cache");
        Ok(())
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn exclusive_lock(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.lock_path())
            .context("Failed to open cache lock file")?;
        file.lock_exclusive().context("Failed to lock cache file")?;
        Ok(file)
    }

    fn shared_lock(&self) -> Option<File> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.lock_path())
            .ok()?;
        file.lock_shared().ok()?;
        Some(file)
    }
}

/// Exact positional comparison: true when the counts differ or any slot of
/// any record differs in order. A pure reordering therefore counts as a
/// change.
pub fn diff(old: &[TagRecord], new: &[TagRecord]) -> bool {
    if old.len() != new.len() {
        return true;
    }
    old.iter().zip(new).any(|(a, b)| a.slots() != b.slots())
}

// --- wire helpers, little-endian throughout ---

fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_i32(r: &mut impl Read) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string(r: &mut impl Read) -> Result<String, ParseError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    let len = u32::from_le_bytes(buf);
    if len > MAX_STRING_LEN {
        return Err(ParseError::Malformed(format!(
            "string length {} out of range",
            len
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| ParseError::Malformed("invalid utf-8".to_string()))
}

fn write_i32(w: &mut impl Write, value: i32) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

fn write_u64(w: &mut impl Write, value: u64) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

fn write_string(w: &mut impl Write, value: &str) -> io::Result<()> {
    w.write_all(&(value.len() as u32).to_le_bytes())?;
    w.write_all(value.as_bytes())
}

fn parse(
    r: &mut impl Read,
) -> Result<(Vec<TagRecord>, HashMap<String, u64>), ParseError> {
    let version = read_i32(r)?;
    if version != 1 && version != 2 {
        return Err(ParseError::Malformed(format!(
            "unknown cache version {}",
            version
        )));
    }
    let count = read_i32(r)?;
    if count < 0 {
        return Err(ParseError::Malformed(format!(
            "negative record count {}",
            count
        )));
    }

    let mut records = Vec::with_capacity((count as usize).min(4096));
    for _ in 0..count {
        let mut slots: [String; TAG_SLOTS] = std::array::from_fn(|_| String::new());
        for _ in 0..TAG_SLOTS {
            let index = read_u8(r)?;
            let value = read_string(r)?;
            let Some(slot) = TagSlot::from_index(index) else {
                return Err(ParseError::Malformed(format!(
                    "slot index {} out of range",
                    index
                )));
            };
            slots[slot as usize] = value;
        }
        records.push(TagRecord::from_slots(slots));
    }

    let mut watermarks = HashMap::new();
    if version == 2 {
        let count = read_i32(r)?;
        if count < 0 {
            return Err(ParseError::Malformed(format!(
                "negative watermark count {}",
                count
            )));
        }
        for _ in 0..count {
            let name = read_string(r)?;
            let value = read_u64(r)?;
            watermarks.insert(name, value);
        }
    }
    Ok((records, watermarks))
}

fn encode(
    w: &mut impl Write,
    records: &[TagRecord],
    watermarks: &HashMap<String, u64>,
    version: i32,
) -> io::Result<()> {
    write_i32(w, version)?;
    write_i32(w, records.len() as i32)?;
    for record in records {
        for (index, value) in record.slots().iter().enumerate() {
            w.write_all(&[index as u8])?;
            write_string(w, value)?;
        }
    }
    if version == 2 {
        write_i32(w, watermarks.len() as i32)?;
        // Stable order keeps persisted bytes reproducible for a given table.
        let mut entries: Vec<_> = watermarks.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in entries {
            write_string(w, name)?;
            write_u64(w, *value)?;
        }
    }
    Ok(())
}
