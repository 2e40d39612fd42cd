//! Frame consumers: the preview sink and the raw recording writer.

use super::capture::CaptureCounters;
use super::dispatch::Internal;
use crate::buffer::FrameBuffer;
use crate::errors::RigError;
use crate::types::FrameRecord;
use bytes::{BufMut, BytesMut};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Leading bytes of every recording file.
pub const RECORDING_MAGIC: &[u8; 8] = b"CRIGRAW1";

/// Marks a frame without a sensor timestamp.
const NO_SENSOR_TIMESTAMP: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSummary {
    pub path: PathBuf,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub first_frame: Option<u64>,
    pub last_frame: Option<u64>,
}

pub(super) struct ConsumerTask {
    pub output_id: u64,
    pub buffer: Arc<FrameBuffer>,
    pub join: JoinHandle<()>,
}

impl ConsumerTask {
    pub async fn finish(mut self, grace: Duration) {
        self.buffer.close();
        if tokio::time::timeout(grace, &mut self.join).await.is_err() {
            log::warn!("Preview consumer did not drain within {:?}, aborting", grace);
            self.join.abort();
        }
    }
}

pub(super) struct RecordTask {
    pub output_id: u64,
    pub path: PathBuf,
    pub buffer: Arc<FrameBuffer>,
    pub join: JoinHandle<Result<RecordSummary, RigError>>,
}

impl RecordTask {
    /// Close the buffer, let the writer drain and flush, abort after `grace`.
    pub async fn finish(mut self, grace: Duration) -> Result<RecordSummary, RigError> {
        self.buffer.close();
        match tokio::time::timeout(grace, &mut self.join).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(RigError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("recording task failed: {}", e),
            ))),
            Err(_) => {
                self.join.abort();
                Err(RigError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("recording {:?} did not flush within {:?}", self.path, grace),
                )))
            }
        }
    }
}

pub(super) fn spawn_preview(
    buffer: Arc<FrameBuffer>,
    output_id: u64,
    latest: Arc<Mutex<Option<FrameRecord>>>,
) -> ConsumerTask {
    let join = tokio::spawn({
        let buffer = buffer.clone();
        async move {
            let mut last_number = 0u64;
            while let Some(frame) = buffer.recv().await {
                crate::assert_invariant!(
                    frame.frame_number() > last_number,
                    "consumers see strictly increasing frame numbers",
                    "preview"
                );
                last_number = frame.frame_number();
                *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
            }
        }
    });
    ConsumerTask {
        output_id,
        buffer,
        join,
    }
}

fn frame_header(frame: &FrameRecord) -> BytesMut {
    let mut header = BytesMut::with_capacity(28);
    header.put_u64_le(frame.frame_number());
    header.put_u64_le(frame.capture_timestamp().as_micros() as u64);
    header.put_u64_le(frame.sensor_timestamp().unwrap_or(NO_SENSOR_TIMESTAMP));
    header.put_u32_le(frame.len() as u32);
    header
}

/// Who to tell when a recording fails on its own (disk full, I/O error).
pub(super) struct RecordOrigin {
    pub stable_id: String,
    pub generation: u64,
    pub internal: mpsc::UnboundedSender<Internal>,
}

pub(super) fn spawn_record(
    buffer: Arc<FrameBuffer>,
    output_id: u64,
    path: PathBuf,
    counters: Arc<CaptureCounters>,
    origin: Option<RecordOrigin>,
) -> RecordTask {
    let join = tokio::spawn({
        let buffer = buffer.clone();
        let path = path.clone();
        async move {
            let result = write_recording(&buffer, &path, &counters).await;
            if let (Err(e), Some(origin)) = (&result, origin) {
                log::error!("{}: recording {:?} failed: {}", origin.stable_id, path, e);
                // stop accepting frames so the capture side sees drops, not stalls
                buffer.close();
                let _ = origin.internal.send(Internal::RecordingFailed {
                    stable_id: origin.stable_id,
                    generation: origin.generation,
                    output_id,
                    message: e.to_string(),
                });
            }
            result
        }
    });
    RecordTask {
        output_id,
        path,
        buffer,
        join,
    }
}

async fn write_recording(
    buffer: &FrameBuffer,
    path: &Path,
    counters: &CaptureCounters,
) -> Result<RecordSummary, RigError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut writer = BufWriter::new(File::create(path).await?);
    writer.write_all(RECORDING_MAGIC).await?;

    let mut summary = RecordSummary {
        path: path.to_path_buf(),
        frames_written: 0,
        bytes_written: RECORDING_MAGIC.len() as u64,
        first_frame: None,
        last_frame: None,
    };

    while let Some(frame) = buffer.recv().await {
        let header = frame_header(&frame);
        writer.write_all(&header).await?;
        writer.write_all(frame.payload()).await?;
        summary.frames_written += 1;
        summary.bytes_written += (header.len() + frame.len()) as u64;
        summary.first_frame.get_or_insert(frame.frame_number());
        summary.last_frame = Some(frame.frame_number());
        counters.recorded();
    }

    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    log::info!(
        "Recording {:?} closed: {} frames, {} bytes",
        path,
        summary.frames_written,
        summary.bytes_written
    );
    Ok(summary)
}

/// Write one frame's payload as a snapshot file.
pub(super) async fn write_snapshot(
    directory: &Path,
    stable_id: &str,
    frame: &FrameRecord,
) -> Result<PathBuf, RigError> {
    tokio::fs::create_dir_all(directory).await?;
    let path = directory.join(format!(
        "{}-{:08}.raw",
        file_stem(stable_id),
        frame.frame_number()
    ));
    tokio::fs::write(&path, frame.payload()).await?;
    Ok(path)
}

/// File-name-safe form of a stable id.
pub(super) fn file_stem(stable_id: &str) -> String {
    stable_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(n: u64, payload: &'static [u8]) -> FrameRecord {
        FrameRecord::new(Bytes::from_static(payload), n, Duration::from_millis(n * 33), None)
    }

    #[tokio::test]
    async fn test_recording_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec").join("cam.rawrec");
        let buffer = Arc::new(FrameBuffer::new(8));
        let counters = Arc::new(CaptureCounters::default());
        let task = spawn_record(buffer.clone(), 0, path.clone(), counters.clone(), None);

        buffer.try_put(frame(1, b"abc"));
        buffer.try_put(frame(2, b"defgh"));
        let summary = task.finish(Duration::from_secs(2)).await.unwrap();

        assert_eq!(summary.frames_written, 2);
        assert_eq!(summary.first_frame, Some(1));
        assert_eq!(summary.last_frame, Some(2));
        assert_eq!(counters.metrics(0).frames_recorded, 2);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, summary.bytes_written);
        assert_eq!(&bytes[..8], RECORDING_MAGIC);
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 1);
        assert_eq!(u64::from_le_bytes(bytes[24..32].try_into().unwrap()), u64::MAX);
        assert_eq!(u32::from_le_bytes(bytes[32..36].try_into().unwrap()), 3);
        assert_eq!(&bytes[36..39], b"abc");
    }

    #[tokio::test]
    async fn test_preview_keeps_latest() {
        let buffer = Arc::new(FrameBuffer::new(4));
        let latest = Arc::new(Mutex::new(None));
        let task = spawn_preview(buffer.clone(), 0, latest.clone());
        buffer.put_overwrite(frame(1, b"a"));
        buffer.put_overwrite(frame(2, b"b"));
        task.finish(Duration::from_secs(1)).await;
        let latest = latest.lock().unwrap().clone().unwrap();
        assert_eq!(latest.frame_number(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_snapshot(dir.path(), "v4l2:usb-1:Cam", &frame(7, b"pixels"))
            .await
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "v4l2_usb-1_Cam-00000007.raw");
        assert_eq!(std::fs::read(path).unwrap(), b"pixels");
    }
}
