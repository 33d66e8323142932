//! Macro persistence: binary timelines + JSON index.
//!
//! Binary format (MAC3, little-endian):
//!   Header (16 bytes):
//!     [0..4]   Magic "MAC3"
//!     [4..6]   Version (u16) = 3
//!     [6..8]   Frame size (u16) = 36
//!     [8..12]  Frame count (u32)
//!     [12..16] Duration milliseconds (u32)
//!
//!   Per frame (36 bytes):
//!     [0..8]   Offset microseconds (u64)
//!     [8..12]  Button bitset (u32)
//!     [12..36] lx, ly, rx, ry, lt, rt (f32)
//!
//! Every file is written to a `.tmp` sibling, fsynced, then renamed over the
//! target, so a crash leaves either the old or the new version.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Frame, MacroId};
use crate::input::{Buttons, InputSnapshot, Stick};

pub const MAGIC: &[u8; 4] = b"MAC3";
pub const FORMAT_VERSION: u16 = 3;
pub const HEADER_SIZE: usize = 16;
pub const FRAME_SIZE: usize = 8 + 4 + 6 * 4; // 36

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("file too small for header ({0} bytes)")]
    TooShort(usize),

    #[error("invalid magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),

    #[error("unexpected frame size {0}")]
    FrameSize(u16),

    #[error("header promises {expected} frames, file holds {actual}")]
    Truncated { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Index entry for one macro.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: MacroId,
    pub name: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub slot: Option<usize>,
    pub filename: String,
    pub frame_count: u32,
    pub duration_ms: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub next_id: u32,
    pub macros: Vec<IndexEntry>,
}

pub fn timeline_filename(id: MacroId) -> String {
    format!("{:03}.mac", id.0)
}

fn index_path(macros_dir: &Path) -> PathBuf {
    macros_dir.join(INDEX_FILE)
}

fn sat_u32(v: u128) -> u32 {
    v.min(u32::MAX as u128) as u32
}

pub fn encode_timeline(frames: &[Frame]) -> Vec<u8> {
    let duration_ms = frames.last().map_or(0, |f| sat_u32(f.offset.as_millis()));

    let mut data = Vec::with_capacity(HEADER_SIZE + frames.len() * FRAME_SIZE);

    // Header
    data.extend_from_slice(MAGIC);
    data.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    data.extend_from_slice(&(FRAME_SIZE as u16).to_le_bytes());
    data.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    data.extend_from_slice(&duration_ms.to_le_bytes());

    // Frames
    for frame in frames {
        let s = &frame.snapshot;
        let offset_us = frame.offset.as_micros().min(u64::MAX as u128) as u64;
        data.extend_from_slice(&offset_us.to_le_bytes());
        data.extend_from_slice(&s.buttons.bits().to_le_bytes());
        for v in [
            s.left.x,
            s.left.y,
            s.right.x,
            s.right.y,
            s.left_trigger,
            s.right_trigger,
        ] {
            data.extend_from_slice(&v.to_le_bytes());
        }
    }
    data
}

fn le_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le_f32(b: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le_u64(b: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(bytes)
}

pub fn decode_timeline(data: &[u8]) -> Result<Vec<Frame>, FormatError> {
    if data.len() < HEADER_SIZE {
        return Err(FormatError::TooShort(data.len()));
    }
    let magic = [data[0], data[1], data[2], data[3]];
    if &magic != MAGIC {
        return Err(FormatError::BadMagic(magic));
    }
    let version = le_u16(data, 4);
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    let frame_size = le_u16(data, 6);
    if frame_size as usize != FRAME_SIZE {
        return Err(FormatError::FrameSize(frame_size));
    }

    let expected = le_u32(data, 8) as usize;
    let actual = (data.len() - HEADER_SIZE) / FRAME_SIZE;
    if actual < expected {
        return Err(FormatError::Truncated { expected, actual });
    }

    let frames = data[HEADER_SIZE..]
        .chunks_exact(FRAME_SIZE)
        .take(expected)
        .map(|f| {
            let offset = Duration::from_micros(le_u64(f, 0));
            let snapshot = InputSnapshot {
                buttons: Buttons::from_bits(le_u32(f, 8)),
                left: Stick {
                    x: le_f32(f, 12),
                    y: le_f32(f, 16),
                },
                right: Stick {
                    x: le_f32(f, 20),
                    y: le_f32(f, 24),
                },
                left_trigger: le_f32(f, 28),
                right_trigger: le_f32(f, 32),
                timestamp: offset,
            };
            Frame { offset, snapshot }
        })
        .collect();
    Ok(frames)
}

/// Write `bytes` to `path` via a fsynced temporary sibling and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Missing index means an empty store.
pub fn load_index(macros_dir: &Path) -> io::Result<Index> {
    let path = index_path(macros_dir);
    let data = match fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Index::default()),
        Err(e) => return Err(e),
    };
    serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn save_index(macros_dir: &Path, index: &Index) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(index).map_err(io::Error::other)?;
    write_atomic(&index_path(macros_dir), &data)
}

pub fn write_timeline(macros_dir: &Path, filename: &str, frames: &[Frame]) -> io::Result<()> {
    write_atomic(&macros_dir.join(filename), &encode_timeline(frames))
}

/// Memory-map and decode a timeline file.
pub fn map_timeline(path: &Path) -> Result<Vec<Frame>, LoadError> {
    let file = File::open(path)?;
    // SAFETY: timelines are only ever replaced by rename, never written in
    // place, so the mapped file does not change under us.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(decode_timeline(&mmap)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Button;

    fn sample_frames() -> Vec<Frame> {
        let mut a = InputSnapshot::neutral();
        a.buttons = Buttons::of(&[Button::A, Button::ZR]);
        a.left = Stick { x: 0.25, y: -1.0 };
        a.right_trigger = 0.75;
        let mut b = InputSnapshot::neutral();
        b.right = Stick { x: -0.333, y: 0.9 };
        b.left_trigger = 1.0;
        vec![
            Frame::new(Duration::ZERO, InputSnapshot::neutral()),
            Frame::new(Duration::from_micros(8_123), a),
            Frame::new(Duration::from_millis(1_500), b),
        ]
    }

    #[test]
    fn test_header_layout() {
        let data = encode_timeline(&sample_frames());
        assert_eq!(&data[0..4], b"MAC3");
        assert_eq!(le_u16(&data, 4), 3);
        assert_eq!(le_u16(&data, 6), 36);
        assert_eq!(le_u32(&data, 8), 3);
        assert_eq!(le_u32(&data, 12), 1500);
        assert_eq!(data.len(), HEADER_SIZE + 3 * FRAME_SIZE);
    }

    #[test]
    fn test_timeline_roundtrip_exact() {
        let frames = sample_frames();
        assert_eq!(decode_timeline(&encode_timeline(&frames)).unwrap(), frames);
    }

    #[test]
    fn test_rejects_bad_header() {
        assert_eq!(decode_timeline(&[0; 4]), Err(FormatError::TooShort(4)));

        let mut data = encode_timeline(&sample_frames());
        data[0] = b'X';
        assert!(matches!(decode_timeline(&data), Err(FormatError::BadMagic(_))));

        let mut data = encode_timeline(&sample_frames());
        data[4] = 2;
        assert_eq!(decode_timeline(&data), Err(FormatError::UnsupportedVersion(2)));

        let data = encode_timeline(&sample_frames());
        assert_eq!(
            decode_timeline(&data[..data.len() - 1]),
            Err(FormatError::Truncated {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_write_atomic_replaces_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        write_atomic(&path, b"old").unwrap();
        write_atomic(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert!(!dir.path().join("f.bin.tmp").exists());
    }

    #[test]
    fn test_write_atomic_failure_keeps_old() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        write_atomic(&path, b"old").unwrap();
        // A directory squatting on the tmp name makes the create fail
        fs::create_dir(dir.path().join("f.bin.tmp")).unwrap();
        assert!(write_atomic(&path, b"new").is_err());
        assert_eq!(fs::read(&path).unwrap(), b"old");
    }

    #[test]
    fn test_missing_index_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_index(dir.path()).unwrap(), Index::default());
    }

    #[test]
    fn test_map_timeline() {
        let dir = tempfile::tempdir().unwrap();
        let frames = sample_frames();
        write_timeline(dir.path(), "001.mac", &frames).unwrap();
        assert_eq!(map_timeline(&dir.path().join("001.mac")).unwrap(), frames);
    }
}
