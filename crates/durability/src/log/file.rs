//! File-backed recovery log.
//!
//! Every mutation is an rmp-encoded [`LogOp`] wrapped in a CRC frame (see
//! [`frame`](super::frame)). Frames are buffered until `force`, which writes
//! and fsyncs them. Opening the file replays the frames; a torn or corrupt
//! tail is truncated at the last good frame. `keypoint` rewrites the file
//! with only the live records.

use super::frame::{check_header, decode_frame, encode_frame, header_bytes, FrameError, LOG_HEADER_SIZE};
use super::RecordTable;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use txcoord_core::{LogError, LogRecord, RecordId, RecoveryLog};

#[derive(Debug, Serialize, Deserialize)]
enum LogOp {
    Section {
        record: RecordId,
        kind: u16,
        single_valued: bool,
        data: Vec<u8>,
    },
    Remove {
        record: RecordId,
    },
}

impl LogOp {
    fn to_frame(&self) -> Result<Vec<u8>, LogError> {
        let payload = rmp_serde::to_vec(self).map_err(|e| LogError::codec(e.to_string()))?;
        Ok(encode_frame(&payload))
    }

    fn apply(self, table: &mut RecordTable) {
        match self {
            LogOp::Section {
                record,
                kind,
                single_valued,
                data,
            } => table.write(record, kind, &data, single_valued),
            LogOp::Remove { record } => {
                table.remove(record);
            }
        }
    }
}

struct FileInner {
    file: File,
    pending: Vec<u8>,
    table: RecordTable,
    next_record: RecordId,
    closed: bool,
}

/// Recovery log stored in a single append-only file.
pub struct FileLog {
    name: String,
    path: PathBuf,
    inner: Mutex<FileInner>,
}

impl FileLog {
    /// Open (or create) the log file at `path`.
    pub fn open(path: impl AsRef<Path>, name: impl Into<String>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let name = name.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut table = RecordTable::default();
        if bytes.is_empty() {
            file.write_all(&header_bytes())?;
            file.sync_all()?;
            info!(target: "txcoord::log", log = %name, path = ?path, "Created log file");
        } else {
            check_header(&bytes).map_err(|e| {
                LogError::Corrupted(format!("{}: bad header: {}", path.display(), e))
            })?;

            let valid_end = replay_frames(&bytes, &mut table)?;
            if valid_end < bytes.len() {
                warn!(
                    target: "txcoord::log",
                    log = %name,
                    offset = valid_end,
                    discarded = bytes.len() - valid_end,
                    "Truncating torn log tail"
                );
                file.set_len(valid_end as u64)?;
                file.sync_all()?;
            }
            debug!(target: "txcoord::log", log = %name, records = table.len(), "Replayed log file");
        }
        file.seek(SeekFrom::End(0))?;

        let next_record = table.max_id().map_or(1, |id| id + 1);
        Ok(FileLog {
            name,
            path,
            inner: Mutex::new(FileInner {
                file,
                pending: Vec::new(),
                table,
                next_record,
                closed: false,
            }),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force outstanding writes and close the log.
    pub fn close(&self) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        flush(&mut inner)?;
        inner.closed = true;
        Ok(())
    }
}

/// Apply frames after the header. Returns the offset just past the last
/// good frame.
fn replay_frames(bytes: &[u8], table: &mut RecordTable) -> Result<usize, LogError> {
    let mut offset = LOG_HEADER_SIZE;
    while offset < bytes.len() {
        match decode_frame(&bytes[offset..]) {
            Ok((payload, consumed)) => {
                let op: LogOp = rmp_serde::from_slice(payload).map_err(|e| {
                    LogError::Corrupted(format!("undecodable operation at {}: {}", offset, e))
                })?;
                op.apply(table);
                offset += consumed;
            }
            Err(FrameError::UnsupportedVersion(v)) => {
                return Err(LogError::Corrupted(format!(
                    "unsupported frame version {} at {}",
                    v, offset
                )));
            }
            Err(_) => break,
        }
    }
    Ok(offset)
}

fn flush(inner: &mut FileInner) -> Result<(), LogError> {
    if inner.pending.is_empty() {
        return Ok(());
    }
    let pending = std::mem::take(&mut inner.pending);
    inner.file.write_all(&pending)?;
    inner.file.sync_data()?;
    Ok(())
}

impl RecoveryLog for FileLog {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_record(&self) -> Result<RecordId, LogError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(LogError::Closed);
        }
        let id = inner.next_record;
        inner.next_record += 1;
        Ok(id)
    }

    fn write_section(
        &self,
        record: RecordId,
        kind: u16,
        data: &[u8],
        single_valued: bool,
    ) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(LogError::Closed);
        }
        if record >= inner.next_record {
            return Err(LogError::UnknownRecord(record));
        }
        let frame = LogOp::Section {
            record,
            kind,
            single_valued,
            data: data.to_vec(),
        }
        .to_frame()?;
        inner.pending.extend_from_slice(&frame);
        inner.table.write(record, kind, data, single_valued);
        Ok(())
    }

    fn force(&self) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(LogError::Closed);
        }
        flush(&mut inner)
    }

    fn remove_record(&self, record: RecordId) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(LogError::Closed);
        }
        if !inner.table.contains(record) {
            if record >= inner.next_record {
                return Err(LogError::UnknownRecord(record));
            }
            return Ok(());
        }
        let frame = LogOp::Remove { record }.to_frame()?;
        inner.pending.extend_from_slice(&frame);
        inner.table.remove(record);
        Ok(())
    }

    fn records(&self) -> Result<Vec<LogRecord>, LogError> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(LogError::Closed);
        }
        Ok(inner.table.snapshot())
    }

    fn keypoint(&self) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(LogError::Closed);
        }
        flush(&mut inner)?;

        let tmp = self.path.with_extension("keypoint");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(&header_bytes())?;
            for record in inner.table.snapshot() {
                for section in record.sections {
                    for data in section.data {
                        let frame = LogOp::Section {
                            record: record.id,
                            kind: section.kind,
                            single_valued: false,
                            data,
                        }
                        .to_frame()?;
                        out.write_all(&frame)?;
                    }
                }
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        inner.file = file;

        debug!(target: "txcoord::log", log = %self.name, records = inner.table.len(), "Log keypointed");
        Ok(())
    }
}
