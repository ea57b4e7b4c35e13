//! The append-only transaction log: a LevelDB-compatible framed log file
//! (Transaction log format (bit-exact)).
//!
//! Layout:
//! ```text
//! [ident: 4][magic: u16 LE][version: u8]   <- 7-byte file header
//! [block]*                                  <- 32 KiB blocks, zero-padded trailers
//! ```
//! Each block holds one or more length-prefixed, CRC-32 (IEEE) checked
//! fragments of `FULL`/`FIRST`/`MIDDLE`/`LAST` type. A record larger than the
//! remaining space in a block is split across fragments in consecutive
//! blocks; a record that fits is written as a single `FULL` fragment.
//!
//! Record bodies are serialized with `serde_json` rather than a wire
//! protobuf codec (no `protoc`/build-script toolchain is assumed available
//! to this workspace); the framing above is otherwise bit-exact with the
//! LevelDB log format so external tooling that understands that layout can
//! still walk the file.

use std::{
  fs::{File, OpenOptions},
  io::{Read, Seek, SeekFrom, Write},
  path::Path,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub const IDENT: [u8; 4] = *b":W&B";
pub const MAGIC: u16 = 0xBEE1;
pub const VERSION: u8 = 0x00;
pub const FILE_HEADER_SIZE: u64 = 7;
pub const BLOCK_SIZE: usize = 32 * 1024;
const FRAME_HEADER_SIZE: usize = 4 + 2 + 1;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("not a transaction log: bad ident/magic/version")]
  BadHeader,
  #[error("corrupt log: {0}")]
  Corrupt(&'static str),
  #[error("checksum mismatch at fragment")]
  ChecksumMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FragType {
  Full = 1,
  First = 2,
  Middle = 3,
  Last = 4,
}

impl FragType {
  fn from_u8(b: u8) -> Option<Self> {
    match b {
      1 => Some(Self::Full),
      2 => Some(Self::First),
      3 => Some(Self::Middle),
      4 => Some(Self::Last),
      _ => None,
    }
  }
}

fn fragment_crc(frag_type: FragType, payload: &[u8]) -> u32 {
  let mut hasher = crc32fast::Hasher::new();
  hasher.update(&[frag_type as u8]);
  hasher.update(payload);
  hasher.finalize()
}

fn write_file_header<W: Write>(w: &mut W) -> Result<(), LogError> {
  w.write_all(&IDENT)?;
  w.write_u16::<LittleEndian>(MAGIC)?;
  w.write_u8(VERSION)?;
  Ok(())
}

fn check_file_header(buf: &[u8]) -> Result<(), LogError> {
  if buf.len() < FILE_HEADER_SIZE as usize {
    return Err(LogError::BadHeader);
  }
  if buf[0..4] != IDENT {
    return Err(LogError::BadHeader);
  }
  let magic = u16::from_le_bytes([buf[4], buf[5]]);
  if magic != MAGIC || buf[6] != VERSION {
    return Err(LogError::BadHeader);
  }
  Ok(())
}

/// Appends framed records to a transaction log file.
pub struct LogWriter {
  file: File,
  /// Absolute byte offset of the next byte to be written.
  position: u64,
  /// Bytes already used in the current 32 KiB block.
  block_offset: usize,
}

impl LogWriter {
  /// Create a brand-new log file, writing the 7-byte header.
  pub fn create(path: &Path) -> Result<Self, LogError> {
    let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
    write_file_header(&mut file)?;
    Ok(Self {
      file,
      position: FILE_HEADER_SIZE,
      block_offset: 0,
    })
  }

  /// Append one record's serialized payload, returning the absolute byte
  /// offset of its first fragment (the value FlowControl later replays
  /// from, saved_offset).
  pub fn append(&mut self, payload: &[u8]) -> Result<u64, LogError> {
    let record_offset = self.position;
    let mut data = payload;
    let mut started = false;

    loop {
      let remaining_in_block = BLOCK_SIZE - self.block_offset;
      if remaining_in_block < FRAME_HEADER_SIZE {
        if remaining_in_block > 0 {
          let zeros = vec![0u8; remaining_in_block];
          self.file.write_all(&zeros)?;
          self.position += remaining_in_block as u64;
        }
        self.block_offset = 0;
        continue;
      }

      let avail = remaining_in_block - FRAME_HEADER_SIZE;
      let take = avail.min(data.len());
      let is_first_fragment = !started;
      let is_last_fragment = take == data.len();
      let frag_type = match (is_first_fragment, is_last_fragment) {
        (true, true) => FragType::Full,
        (true, false) => FragType::First,
        (false, true) => FragType::Last,
        (false, false) => FragType::Middle,
      };

      let fragment = &data[..take];
      let crc = fragment_crc(frag_type, fragment);
      self.file.write_u32::<LittleEndian>(crc)?;
      self.file.write_u16::<LittleEndian>(take as u16)?;
      self.file.write_u8(frag_type as u8)?;
      self.file.write_all(fragment)?;

      self.block_offset += FRAME_HEADER_SIZE + take;
      self.position += (FRAME_HEADER_SIZE + take) as u64;
      data = &data[take..];
      started = true;

      if data.is_empty() {
        break;
      }
    }

    Ok(record_offset)
  }

  /// Forces everything written so far to reach the file.
  pub fn flush(&mut self) -> Result<(), LogError> {
    self.file.flush()?;
    self.file.sync_data()?;
    Ok(())
  }
}

/// Sequential (and seekable) reader over a transaction log file.
pub struct LogReader {
  file: File,
  block: Vec<u8>,
  block_valid_len: usize,
  block_pos: usize,
  block_abs_start: u64,
}

impl LogReader {
  /// Opens a log file read-only, validating the 7-byte header; an invalid
  /// header aborts with an error rather than replaying garbage.
  pub fn open(path: &Path) -> Result<Self, LogError> {
    let mut file = File::open(path)?;
    let mut header = [0u8; FILE_HEADER_SIZE as usize];
    file.read_exact(&mut header)?;
    check_file_header(&header)?;
    Ok(Self {
      file,
      block: vec![0u8; BLOCK_SIZE],
      block_valid_len: 0,
      block_pos: 0,
      block_abs_start: FILE_HEADER_SIZE,
    })
  }

  fn fill_block(&mut self) -> Result<bool, LogError> {
    self.block_abs_start = self.file.stream_position()?;
    let mut total = 0usize;
    loop {
      let n = self.file.read(&mut self.block[total..])?;
      if n == 0 {
        break;
      }
      total += n;
      if total == BLOCK_SIZE {
        break;
      }
    }
    self.block_valid_len = total;
    self.block_pos = 0;
    Ok(total > 0)
  }

  /// Reposition to an absolute byte offset previously returned by
  /// [`LogWriter::append`].
  pub fn seek(&mut self, offset: u64) -> Result<(), LogError> {
    let rel = offset.saturating_sub(FILE_HEADER_SIZE);
    let block_index = rel / BLOCK_SIZE as u64;
    let block_abs = FILE_HEADER_SIZE + block_index * BLOCK_SIZE as u64;
    self.file.seek(SeekFrom::Start(block_abs))?;
    self.fill_block()?;
    self.block_pos = (offset - block_abs) as usize;
    Ok(())
  }

  fn read_fragment(&mut self) -> Result<Option<(FragType, Vec<u8>)>, LogError> {
    loop {
      if self.block_pos + FRAME_HEADER_SIZE > self.block_valid_len {
        if !self.fill_block()? {
          return Ok(None);
        }
        continue;
      }
      let crc_bytes = &self.block[self.block_pos..self.block_pos + 4];
      let crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
      let len = u16::from_le_bytes([self.block[self.block_pos + 4], self.block[self.block_pos + 5]]) as usize;
      let type_byte = self.block[self.block_pos + 6];

      if type_byte == 0 && crc == 0 && len == 0 {
        // Zero-padded trailer: skip to next block.
        if !self.fill_block()? {
          return Ok(None);
        }
        continue;
      }

      let Some(frag_type) = FragType::from_u8(type_byte) else {
        return Err(LogError::Corrupt("unknown fragment type"));
      };

      if self.block_pos + FRAME_HEADER_SIZE + len > self.block_valid_len {
        return Err(LogError::Corrupt("fragment length exceeds block"));
      }

      let payload = self.block[self.block_pos + FRAME_HEADER_SIZE..self.block_pos + FRAME_HEADER_SIZE + len].to_vec();
      if fragment_crc(frag_type, &payload) != crc {
        return Err(LogError::ChecksumMismatch);
      }

      self.block_pos += FRAME_HEADER_SIZE + len;
      return Ok(Some((frag_type, payload)));
    }
  }

  /// Absolute byte offset of whatever record `next_record` will return
  /// next (the start of its first fragment). Callers that need to
  /// remember a record's own offset must read this before calling
  /// `next_record`, since the reader has already moved past it afterward.
  pub fn position(&self) -> u64 {
    self.block_abs_start + self.block_pos as u64
  }

  /// Read the next fully-reassembled record, or `Ok(None)` at a clean
  /// end-of-log (no fragment pending).
  pub fn next_record(&mut self) -> Result<Option<Vec<u8>>, LogError> {
    let mut acc: Option<Vec<u8>> = None;
    loop {
      match self.read_fragment()? {
        None => {
          return if acc.is_none() {
            Ok(None)
          } else {
            Err(LogError::Corrupt("EOF mid-record"))
          };
        }
        Some((FragType::Full, payload)) => {
          if acc.is_some() {
            return Err(LogError::Corrupt("FULL fragment after partial record"));
          }
          return Ok(Some(payload));
        }
        Some((FragType::First, payload)) => {
          if acc.is_some() {
            return Err(LogError::Corrupt("FIRST fragment after partial record"));
          }
          acc = Some(payload);
        }
        Some((FragType::Middle, payload)) => match acc.as_mut() {
          Some(buf) => buf.extend_from_slice(&payload),
          None => return Err(LogError::Corrupt("MIDDLE fragment with no open record")),
        },
        Some((FragType::Last, payload)) => match acc.take() {
          Some(mut buf) => {
            buf.extend_from_slice(&payload);
            return Ok(Some(buf));
          }
          None => return Err(LogError::Corrupt("LAST fragment with no open record")),
        },
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trips_small_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.bin");

    let mut w = LogWriter::create(&path).unwrap();
    let offsets: Vec<u64> = (0..50)
      .map(|i| w.append(format!("record-{i}").as_bytes()).unwrap())
      .collect();
    w.flush().unwrap();

    let mut r = LogReader::open(&path).unwrap();
    for i in 0..50 {
      let payload = r.next_record().unwrap().unwrap();
      assert_eq!(payload, format!("record-{i}").as_bytes());
    }
    assert!(r.next_record().unwrap().is_none());

    // Seek to the 10th record directly.
    let mut r2 = LogReader::open(&path).unwrap();
    r2.seek(offsets[10]).unwrap();
    assert_eq!(r2.next_record().unwrap().unwrap(), b"record-10");
  }

  #[test]
  fn round_trips_records_spanning_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.bin");
    let big = vec![42u8; BLOCK_SIZE * 3 + 117];

    let mut w = LogWriter::create(&path).unwrap();
    w.append(b"small").unwrap();
    w.append(&big).unwrap();
    w.append(b"after-big").unwrap();
    w.flush().unwrap();

    let mut r = LogReader::open(&path).unwrap();
    assert_eq!(r.next_record().unwrap().unwrap(), b"small");
    assert_eq!(r.next_record().unwrap().unwrap(), big);
    assert_eq!(r.next_record().unwrap().unwrap(), b"after-big");
    assert!(r.next_record().unwrap().is_none());
  }

  #[test]
  fn rejects_bad_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.bin");
    std::fs::write(&path, b"not-a-log-file").unwrap();
    assert!(matches!(LogReader::open(&path), Err(LogError::BadHeader)));
  }

  #[test]
  fn detects_corrupted_fragment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.bin");
    let mut w = LogWriter::create(&path).unwrap();
    w.append(b"hello").unwrap();
    w.flush().unwrap();
    drop(w);

    // Flip a byte in the payload region (after the 7-byte frame header).
    let mut bytes = std::fs::read(&path).unwrap();
    let payload_idx = FILE_HEADER_SIZE as usize + FRAME_HEADER_SIZE;
    bytes[payload_idx] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    let mut r = LogReader::open(&path).unwrap();
    assert!(matches!(r.next_record(), Err(LogError::ChecksumMismatch)));
  }
}
