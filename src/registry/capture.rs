//! Capture task: owns the backend handle and fans frames out to buffers.

use super::dispatch::Internal;
use crate::backend::{CaptureBackend, FrameRead, HandleGuard};
use crate::buffer::{AdmissionPolicy, FrameBuffer};
use crate::timing::CaptureClock;
use crate::types::{CapabilityMode, DeviceIdentity, FrameMetrics, FrameRecord};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Transient read errors tolerated in a row before the device is faulted.
const MAX_TRANSIENT_ERRORS: u32 = 25;
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Per-registration frame counters, shared with consumers and snapshots.
#[derive(Debug, Default)]
pub(crate) struct CaptureCounters {
    captured: AtomicU64,
    skipped: AtomicU64,
    recorded: AtomicU64,
    last_number: AtomicU64,
    session: Mutex<Option<(Instant, u64)>>,
}

impl CaptureCounters {
    /// Numbers start at 1 and keep increasing across preview sessions.
    pub fn next_frame_number(&self) -> u64 {
        let number = self.last_number.fetch_add(1, Ordering::SeqCst) + 1;
        self.captured.fetch_add(1, Ordering::Relaxed);
        number
    }

    pub fn skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recorded(&self) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    fn begin_session(&self) {
        let captured = self.captured.load(Ordering::Relaxed);
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((Instant::now(), captured));
    }

    fn end_session(&self) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn metrics(&self, frames_dropped: u64) -> FrameMetrics {
        let captured = self.captured.load(Ordering::Relaxed);
        let last = self.last_number.load(Ordering::SeqCst);
        let measured_fps = match *self.session.lock().unwrap_or_else(PoisonError::into_inner) {
            Some((started, at_start)) => {
                let elapsed = started.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    (captured - at_start) as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        FrameMetrics {
            frames_captured: captured,
            frames_dropped,
            frames_skipped: self.skipped.load(Ordering::Relaxed),
            frames_recorded: self.recorded.load(Ordering::Relaxed),
            last_frame_number: (last > 0).then_some(last),
            measured_fps,
        }
    }
}

struct TapOutput {
    id: u64,
    buffer: Arc<FrameBuffer>,
    policy: AdmissionPolicy,
    external: bool,
}

/// The set of buffers a capture task feeds. Outputs can come and go while
/// the capture runs (recording starts and stops, external taps attach).
#[derive(Default)]
pub(crate) struct FrameTap {
    outputs: RwLock<Vec<TapOutput>>,
    next_id: AtomicU64,
    retired_drops: AtomicU64,
}

impl FrameTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, buffer: Arc<FrameBuffer>, policy: AdmissionPolicy, external: bool) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.outputs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TapOutput {
                id,
                buffer,
                policy,
                external,
            });
        id
    }

    /// Detach and close one output. Queued frames stay readable.
    pub fn detach(&self, id: u64) {
        let mut outputs = self.outputs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = outputs.iter().position(|o| o.id == id) {
            let output = outputs.remove(pos);
            output.buffer.close();
            self.retired_drops
                .fetch_add(output.buffer.dropped(), Ordering::Relaxed);
        }
    }

    /// Close every output, external taps included.
    pub fn close_all(&self) {
        let drained: Vec<TapOutput> = self
            .outputs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for output in drained {
            output.buffer.close();
            self.retired_drops
                .fetch_add(output.buffer.dropped(), Ordering::Relaxed);
        }
    }

    /// Hand a frame to every output without waiting.
    pub fn offer(&self, frame: &FrameRecord) {
        let outputs = self.outputs.read().unwrap_or_else(PoisonError::into_inner);
        for output in outputs.iter() {
            output.buffer.offer(frame.clone(), output.policy);
        }
    }

    pub fn external_outputs(&self) -> usize {
        self.outputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|o| o.external)
            .count()
    }

    pub fn dropped_total(&self) -> u64 {
        let live: u64 = self
            .outputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|o| o.buffer.dropped())
            .sum();
        live + self.retired_drops.load(Ordering::Relaxed)
    }
}

pub(super) struct CaptureContext {
    pub identity: DeviceIdentity,
    pub generation: u64,
    pub backend: Arc<dyn CaptureBackend>,
    pub mode: CapabilityMode,
    pub fps_cap: Option<f64>,
    pub tap: Arc<FrameTap>,
    pub counters: Arc<CaptureCounters>,
    pub clock: CaptureClock,
    pub internal: mpsc::UnboundedSender<Internal>,
}

pub(super) struct CaptureTask {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl CaptureTask {
    /// Signal the task and wait up to `grace`; abort it after that. The
    /// handle guard closes the backend handle either way.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        let _ = self.stop.send(true);
        match tokio::time::timeout(grace, &mut self.join).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::error!("Capture task ended abnormally: {}", e);
                true
            }
            Err(_) => {
                log::warn!("Capture task ignored stop for {:?}, aborting", grace);
                self.join.abort();
                let _ = self.join.await;
                false
            }
        }
    }
}

pub(super) fn spawn_capture(ctx: CaptureContext) -> CaptureTask {
    let (stop, stop_rx) = watch::channel(false);
    let join = tokio::spawn(run_capture(ctx, stop_rx));
    CaptureTask { stop, join }
}

async fn run_capture(ctx: CaptureContext, mut stop: watch::Receiver<bool>) {
    let stable_id = ctx.identity.stable_id.clone();

    let opened = tokio::select! {
        biased;
        _ = stop.changed() => return,
        opened = ctx.backend.open(&ctx.identity, &ctx.mode) => opened,
    };
    let mut guard = match opened {
        Ok(handle) => HandleGuard::new(handle),
        Err(e) => {
            report_fault(&ctx, format!("open failed: {}", e));
            return;
        }
    };

    ctx.counters.begin_session();
    log::info!("{}: capturing {}", stable_id, ctx.mode.key());

    // 10% slack so jitter around the cap does not halve the rate
    let min_spacing = ctx
        .fps_cap
        .filter(|cap| *cap > 0.0)
        .map(|cap| Duration::from_secs_f64(0.9 / cap));
    let mut last_emitted: Option<Instant> = None;
    let mut transient_errors = 0u32;

    let fault = loop {
        let read = tokio::select! {
            biased;
            _ = stop.changed() => break None,
            read = guard.read_frame() => read,
        };
        match read {
            Ok(FrameRead::Frame(raw)) => {
                transient_errors = 0;
                if let (Some(spacing), Some(last)) = (min_spacing, last_emitted) {
                    if last.elapsed() < spacing {
                        ctx.counters.skip();
                        continue;
                    }
                }
                last_emitted = Some(Instant::now());
                let number = ctx.counters.next_frame_number();
                let frame = FrameRecord::new(raw.payload, number, ctx.clock.now(), raw.sensor_timestamp);
                ctx.tap.offer(&frame);
            }
            Ok(FrameRead::EndOfStream) => break Some("end of stream".to_string()),
            Err(e) if e.is_fatal() => break Some(e.to_string()),
            Err(e) => {
                transient_errors += 1;
                if transient_errors >= MAX_TRANSIENT_ERRORS {
                    break Some(format!("{} consecutive read errors, last: {}", transient_errors, e));
                }
                log::debug!("{}: transient read error: {}", stable_id, e);
                tokio::select! {
                    biased;
                    _ = stop.changed() => break None,
                    _ = tokio::time::sleep(TRANSIENT_RETRY_DELAY) => {}
                }
            }
        }
    };

    guard.release();
    ctx.counters.end_session();
    match fault {
        Some(message) => report_fault(&ctx, message),
        None => log::info!("{}: capture stopped", stable_id),
    }
}

fn report_fault(ctx: &CaptureContext, message: String) {
    log::error!("{}: capture fault: {}", ctx.identity.stable_id, message);
    let _ = ctx.internal.send(Internal::CaptureFault {
        stable_id: ctx.identity.stable_id.clone(),
        generation: ctx.generation,
        message,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(n: u64) -> FrameRecord {
        FrameRecord::new(Bytes::from_static(b"frame"), n, Duration::ZERO, None)
    }

    #[test]
    fn test_tap_fans_out_with_policies() {
        let tap = FrameTap::new();
        let preview = Arc::new(FrameBuffer::new(2));
        let record = Arc::new(FrameBuffer::new(2));
        tap.attach(preview.clone(), AdmissionPolicy::Overwrite, false);
        let record_id = tap.attach(record.clone(), AdmissionPolicy::Reject, false);

        for n in 1..=3 {
            tap.offer(&frame(n));
        }
        assert_eq!(preview.drain().iter().map(|f| f.frame_number()).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(record.drain().iter().map(|f| f.frame_number()).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(tap.dropped_total(), 2);

        tap.detach(record_id);
        assert!(record.is_closed());
        tap.offer(&frame(4));
        assert!(record.is_empty());
        assert_eq!(tap.dropped_total(), 2);

        tap.close_all();
        assert!(preview.is_closed());
    }

    #[test]
    fn test_counters_continue_across_sessions() {
        let counters = CaptureCounters::default();
        assert_eq!(counters.metrics(0).last_frame_number, None);
        counters.begin_session();
        assert_eq!(counters.next_frame_number(), 1);
        assert_eq!(counters.next_frame_number(), 2);
        counters.end_session();
        counters.begin_session();
        assert_eq!(counters.next_frame_number(), 3);
        let metrics = counters.metrics(5);
        assert_eq!(metrics.frames_captured, 3);
        assert_eq!(metrics.frames_dropped, 5);
        assert_eq!(metrics.last_frame_number, Some(3));
    }
}
