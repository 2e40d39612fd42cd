//! The dispatcher task: sole owner of every device's runtime state.
//!
//! Commands from [`DeviceRegistry`](super::DeviceRegistry) handles and
//! internal events (enumeration rounds, probe results, capture faults, retry
//! timers, debounce deadlines) are handled one at a time, so no state here
//! needs a lock.

use super::capture::{spawn_capture, CaptureContext, FrameTap};
use super::consumers::{self, RecordOrigin, RecordSummary};
use super::discovery::{self, RoundResult};
use super::hotplug::{FlapFilter, LossReport, Reappearance};
use super::state::{DeviceRuntimeState, LifecycleEvent, ProbeState, StreamingTasks};
use super::{RegistryEvent, RegistrySettings};
use crate::backend::{BackendSet, ProbeReport};
use crate::buffer::{AdmissionPolicy, FrameBuffer};
use crate::cache::{merge, reconcile_selection, CachedDevice, CapabilityCache};
use crate::errors::{BackendError, RigError, TransitionFailure};
use crate::selection::{resolve_config, ConfigRequest, Selection};
use crate::timing::CaptureClock;
use crate::types::{
    CapabilitySource, DeviceCapabilities, DeviceIdentity, DeviceSnapshot, Lifecycle,
    SelectedConfig,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub(super) type Reply<T> = oneshot::Sender<Result<T, TransitionFailure>>;

pub(super) enum Request {
    Discover {
        reply: Reply<()>,
    },
    Select {
        stable_id: String,
        request: ConfigRequest,
        reply: Reply<Selection>,
    },
    EnablePreview {
        stable_id: String,
        reply: Reply<()>,
    },
    DisablePreview {
        stable_id: String,
        reply: Reply<()>,
    },
    StartRecord {
        stable_id: String,
        reply: Reply<PathBuf>,
    },
    StopRecord {
        stable_id: String,
        reply: Reply<RecordSummary>,
    },
    TakeSnapshot {
        stable_id: String,
        reply: Reply<PathBuf>,
    },
    Reset {
        stable_id: String,
        reply: Reply<()>,
    },
    Reprobe {
        stable_id: String,
        reply: Reply<()>,
    },
    AttachConsumer {
        stable_id: String,
        capacity: usize,
        policy: AdmissionPolicy,
        reply: Reply<Arc<FrameBuffer>>,
    },
    Devices {
        reply: Reply<Vec<DeviceSnapshot>>,
    },
    Device {
        stable_id: String,
        reply: Reply<DeviceSnapshot>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

pub(super) enum Internal {
    Enumerated {
        results: RoundResult,
        done: Option<Reply<()>>,
    },
    CacheLoaded {
        stable_id: String,
        generation: u64,
        cached: Option<CachedDevice>,
    },
    ProbeFinished {
        stable_id: String,
        generation: u64,
        result: Result<ProbeReport, BackendError>,
    },
    ProbeRetry {
        stable_id: String,
        generation: u64,
    },
    CaptureFault {
        stable_id: String,
        generation: u64,
        message: String,
    },
    RecordingFailed {
        stable_id: String,
        generation: u64,
        output_id: u64,
        message: String,
    },
}

struct ParkedSelect {
    request: ConfigRequest,
    reply: Reply<Selection>,
}

struct PersistJob {
    stable_id: String,
    capabilities: Option<DeviceCapabilities>,
    selected_config: Option<SelectedConfig>,
}

/// Writes cache records one after another so a later save for a key never
/// lands before an earlier one.
fn spawn_persister(cache: Arc<CapabilityCache>) -> (mpsc::UnboundedSender<PersistJob>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PersistJob>();
    let join = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let cache = cache.clone();
            let stable_id = job.stable_id.clone();
            let saved = tokio::task::spawn_blocking(move || {
                cache.save(
                    &job.stable_id,
                    job.capabilities.as_ref(),
                    job.selected_config.as_ref(),
                )
            })
            .await;
            match saved {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("{}: cache write failed: {}", stable_id, e),
                Err(e) => log::error!("{}: cache writer panicked: {}", stable_id, e),
            }
        }
    });
    (tx, join)
}

/// Stop everything streaming for one device, in order: capture first (the
/// backend handle is closed when this returns), then the tap outputs, then
/// the recorder drains and flushes, then the preview consumer.
async fn stop_streaming(
    tasks: StreamingTasks,
    tap: Arc<FrameTap>,
    grace: Duration,
    close_all: bool,
) -> Option<Result<RecordSummary, RigError>> {
    let StreamingTasks {
        capture,
        preview,
        record,
    } = tasks;

    if let Some(capture) = capture {
        capture.shutdown(grace).await;
    }
    if let Some(record) = &record {
        tap.detach(record.output_id);
    }
    if let Some(preview) = &preview {
        tap.detach(preview.output_id);
    }
    if close_all {
        tap.close_all();
    }

    let summary = match record {
        Some(record) => Some(record.finish(grace).await),
        None => None,
    };
    if let Some(preview) = preview {
        preview.finish(grace).await;
    }
    summary
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub(super) struct Dispatcher {
    settings: RegistrySettings,
    backends: BackendSet,
    cache: Arc<CapabilityCache>,
    clock: CaptureClock,
    devices: HashMap<String, DeviceRuntimeState>,
    teardowns: HashMap<String, Vec<JoinHandle<()>>>,
    parked: HashMap<String, Vec<ParkedSelect>>,
    flaps: FlapFilter,
    events: mpsc::UnboundedSender<RegistryEvent>,
    internal: mpsc::UnboundedSender<Internal>,
    persist: Option<mpsc::UnboundedSender<PersistJob>>,
    persister: Option<JoinHandle<()>>,
    discovery: Option<(watch::Sender<bool>, JoinHandle<()>)>,
    next_generation: u64,
    last_round_empty: Option<bool>,
}

impl Dispatcher {
    pub fn new(
        settings: RegistrySettings,
        backends: BackendSet,
        cache: Arc<CapabilityCache>,
        events: mpsc::UnboundedSender<RegistryEvent>,
        internal: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        let (persist, persister) = spawn_persister(cache.clone());
        let flaps = FlapFilter::new(settings.flapping_threshold);
        Self {
            settings,
            backends,
            cache,
            clock: CaptureClock::new(),
            devices: HashMap::new(),
            teardowns: HashMap::new(),
            parked: HashMap::new(),
            flaps,
            events,
            internal,
            persist: Some(persist),
            persister: Some(persister),
            discovery: None,
            next_generation: 0,
            last_round_empty: None,
        }
    }

    pub async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        self.emit(RegistryEvent::Searching);
        if let Some(interval) = self.settings.poll_interval {
            let (stop, stop_rx) = watch::channel(false);
            let join = discovery::spawn_loop(
                self.backends.clone(),
                interval,
                self.settings.enumerate_timeout,
                self.internal.clone(),
                stop_rx,
            );
            self.discovery = Some((stop, join));
        }

        loop {
            let deadline = self.flaps.next_deadline();
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(request) => self.handle_request(request).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = internal.recv() => self.handle_internal(event).await,
                _ = sleep_until_opt(deadline) => self.flush_losses(),
            }
        }
        log::debug!("Registry dispatcher exited");
    }

    fn emit(&self, event: RegistryEvent) {
        log::debug!("registry event: {:?}", event);
        let _ = self.events.send(event);
    }

    fn persist(
        &self,
        stable_id: &str,
        capabilities: Option<DeviceCapabilities>,
        selected_config: Option<SelectedConfig>,
    ) {
        if capabilities.is_none() && selected_config.is_none() {
            return;
        }
        if let Some(persist) = &self.persist {
            let _ = persist.send(PersistJob {
                stable_id: stable_id.to_string(),
                capabilities,
                selected_config,
            });
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Discover { reply } => discovery::spawn_round(
                self.backends.clone(),
                self.settings.enumerate_timeout,
                self.internal.clone(),
                reply,
            ),
            Request::Select {
                stable_id,
                request,
                reply,
            } => self.select(stable_id, request, reply),
            Request::EnablePreview { stable_id, reply } => {
                let result = self.enable_preview(&stable_id).await;
                let _ = reply.send(result);
            }
            Request::DisablePreview { stable_id, reply } => {
                let result = self.disable_preview(&stable_id).await;
                let _ = reply.send(result);
            }
            Request::StartRecord { stable_id, reply } => {
                let result = self.start_record(&stable_id);
                let _ = reply.send(result);
            }
            Request::StopRecord { stable_id, reply } => {
                let result = self.stop_record(&stable_id).await;
                let _ = reply.send(result);
            }
            Request::TakeSnapshot { stable_id, reply } => {
                let result = self.take_snapshot(&stable_id).await;
                let _ = reply.send(result);
            }
            Request::Reset { stable_id, reply } => {
                let result = self.reset(&stable_id);
                let _ = reply.send(result);
            }
            Request::Reprobe { stable_id, reply } => {
                let result = self.reprobe(&stable_id);
                let _ = reply.send(result);
            }
            Request::AttachConsumer {
                stable_id,
                capacity,
                policy,
                reply,
            } => {
                let result = self.attach_consumer(&stable_id, capacity, policy);
                let _ = reply.send(result);
            }
            Request::Devices { reply } => {
                let mut snapshots: Vec<DeviceSnapshot> =
                    self.devices.values().map(|d| d.snapshot()).collect();
                snapshots.sort_by(|a, b| a.identity.stable_id.cmp(&b.identity.stable_id));
                let _ = reply.send(Ok(snapshots));
            }
            Request::Device { stable_id, reply } => {
                let result = self
                    .devices
                    .get(&stable_id)
                    .map(|d| d.snapshot())
                    .ok_or_else(|| TransitionFailure::not_found(&stable_id));
                let _ = reply.send(result);
            }
            Request::Shutdown { reply } => {
                // handled by the run loop
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Enumerated { results, done } => {
                self.apply_round(results);
                if let Some(done) = done {
                    let _ = done.send(Ok(()));
                }
            }
            Internal::CacheLoaded {
                stable_id,
                generation,
                cached,
            } => self.on_cache_loaded(&stable_id, generation, cached),
            Internal::ProbeFinished {
                stable_id,
                generation,
                result,
            } => self.on_probe_finished(&stable_id, generation, result),
            Internal::ProbeRetry {
                stable_id,
                generation,
            } => {
                let due = self.devices.get_mut(&stable_id).is_some_and(|state| {
                    let due = state.generation == generation && state.probe.retry_scheduled;
                    if due {
                        state.probe.retry_scheduled = false;
                    }
                    due
                });
                if due {
                    self.start_probe(&stable_id);
                }
            }
            Internal::CaptureFault {
                stable_id,
                generation,
                message,
            } => self.on_capture_fault(&stable_id, generation, message).await,
            Internal::RecordingFailed {
                stable_id,
                generation,
                output_id,
                message,
            } => {
                self.on_recording_failed(&stable_id, generation, output_id, message)
                    .await
            }
        }
    }

    // ---- discovery ----------------------------------------------------

    fn apply_round(&mut self, results: RoundResult) {
        self.flush_losses();

        for (source, result) in results {
            let found = match result {
                Ok(found) => found,
                Err(e) => {
                    let name = self.backends.get(source).map(|b| b.name()).unwrap_or("?");
                    log::warn!("Enumeration on {} backend failed: {}", name, e);
                    continue;
                }
            };

            let present: HashSet<&str> = found.iter().map(|d| d.stable_id.as_str()).collect();
            let lost: Vec<String> = self
                .devices
                .values()
                .filter(|d| d.source == source && !present.contains(d.stable_id()))
                .map(|d| d.identity.stable_id.clone())
                .collect();
            for stable_id in lost {
                self.on_device_lost(&stable_id);
            }

            for identity in found {
                match self.devices.get(&identity.stable_id) {
                    Some(existing) if existing.source != source => log::debug!(
                        "{} also reported by backend #{}, keeping #{}",
                        identity.stable_id,
                        source,
                        existing.source
                    ),
                    Some(_) => {}
                    None => self.on_device_found(identity, source),
                }
            }
        }

        let empty = self.devices.is_empty() && self.flaps.next_deadline().is_none();
        if empty && self.last_round_empty != Some(true) {
            self.emit(RegistryEvent::DeviceNotFound);
        }
        self.last_round_empty = Some(empty);
    }

    fn flush_losses(&mut self) {
        for identity in self.flaps.due(Instant::now()) {
            log::info!("Device {} did not come back", identity.stable_id);
            self.emit(RegistryEvent::DeviceLost {
                stable_id: identity.stable_id,
            });
        }
    }

    fn on_device_found(&mut self, identity: DeviceIdentity, source: usize) {
        let stable_id = identity.stable_id.clone();
        self.next_generation += 1;
        let mut state = DeviceRuntimeState::new(identity, self.next_generation, source);

        match self.flaps.on_found(&stable_id, Instant::now()) {
            Reappearance::Restored(prior) => {
                log::info!("Device {} reconnected inside the flapping window", stable_id);
                state.capabilities = prior.capabilities;
                if let (Some(caps), Some(selected)) =
                    (state.capabilities.as_ref(), prior.selected_config.as_ref())
                {
                    let (config, _) = reconcile_selection(selected, caps);
                    state.preferred_config = Some(config.clone());
                    if prior.lifecycle == Lifecycle::Selected
                        && state.transition(LifecycleEvent::Select).is_ok()
                    {
                        state.selected_config = Some(config);
                    }
                }
                let needs_capabilities = state.capabilities.is_none();
                self.devices.insert(stable_id.clone(), state);
                if needs_capabilities {
                    self.load_or_probe(&stable_id);
                }
                return;
            }
            Reappearance::Expired(lost) => self.emit(RegistryEvent::DeviceLost {
                stable_id: lost.stable_id,
            }),
            Reappearance::Fresh => {}
        }

        log::info!(
            "Device connected: {} ({})",
            state.identity.display_name(),
            stable_id
        );
        let snapshot = state.snapshot();
        self.devices.insert(stable_id.clone(), state);
        self.emit(RegistryEvent::DeviceDiscovered { device: snapshot });
        self.load_or_probe(&stable_id);
    }

    fn on_device_lost(&mut self, stable_id: &str) {
        let Some(mut state) = self.devices.remove(stable_id) else {
            return;
        };
        let prior = state.lifecycle;
        let _ = state.transition(LifecycleEvent::Unplug);
        log::info!("Device disconnected: {} (was {})", stable_id, prior);

        let tasks = std::mem::take(&mut state.tasks);
        let tap = state.tap.clone();
        if tasks.is_empty() {
            tap.close_all();
        } else {
            let grace = self.settings.grace_period;
            let id = stable_id.to_string();
            let teardown = tokio::spawn(async move {
                match stop_streaming(tasks, tap, grace, true).await {
                    Some(Ok(summary)) => log::info!(
                        "{}: recording closed after unplug, {} frames",
                        id,
                        summary.frames_written
                    ),
                    Some(Err(e)) => log::warn!("{}: recording lost on unplug: {}", id, e),
                    None => {}
                }
                log::debug!("{}: teardown complete", id);
            });
            let pending = self.teardowns.entry(stable_id.to_string()).or_default();
            pending.retain(|handle| !handle.is_finished());
            pending.push(teardown);
        }

        let selected = state
            .selected_config
            .clone()
            .or_else(|| state.preferred_config.clone());
        self.persist(stable_id, state.capabilities.clone(), selected);
        self.fail_parked(stable_id, TransitionFailure::not_found(stable_id));

        let report = self.flaps.on_lost(
            state.identity.clone(),
            prior,
            state.capabilities.take(),
            state.selected_config.take(),
            Instant::now(),
        );
        match report {
            LossReport::Now => self.emit(RegistryEvent::DeviceLost {
                stable_id: stable_id.to_string(),
            }),
            LossReport::Deferred => {
                log::debug!("{}: loss held for the flapping window", stable_id)
            }
        }
    }

    /// Wait for teardowns of an earlier registration of the same device, so
    /// a new capture never overlaps the old handle.
    async fn settle_teardowns(&mut self, stable_id: &str) {
        let Some(handles) = self.teardowns.remove(stable_id) else {
            return;
        };
        let limit = self.settings.grace_period * 3;
        for mut handle in handles {
            if tokio::time::timeout(limit, &mut handle).await.is_err() {
                log::warn!("{}: teardown overran {:?}, aborting", stable_id, limit);
                handle.abort();
            }
        }
    }

    // ---- capabilities -------------------------------------------------

    /// Look the device up in the cache off the dispatcher. Counts as a
    /// running probe until the answer arrives, so selections park.
    fn load_or_probe(&mut self, stable_id: &str) {
        let Some(state) = self.devices.get_mut(stable_id) else {
            return;
        };
        if state.probe.in_flight || state.probe.disabled {
            return;
        }
        state.probe.in_flight = true;

        let generation = state.generation;
        let cache = self.cache.clone();
        let internal = self.internal.clone();
        let id = stable_id.to_string();
        tokio::spawn(async move {
            let lookup = {
                let id = id.clone();
                tokio::task::spawn_blocking(move || cache.load(&id))
            };
            let cached = match lookup.await {
                Ok(cached) => cached,
                Err(e) => {
                    log::error!("{}: cache lookup panicked: {}", id, e);
                    None
                }
            };
            let _ = internal.send(Internal::CacheLoaded {
                stable_id: id,
                generation,
                cached,
            });
        });
    }

    /// Prefill from the cache when the policy allows, otherwise probe.
    fn on_cache_loaded(&mut self, stable_id: &str, generation: u64, cached: Option<CachedDevice>) {
        let now = Utc::now();
        let Some(state) = self.devices.get_mut(stable_id) else {
            return;
        };
        if state.generation != generation {
            log::debug!("{}: dropping cache lookup for an old registration", stable_id);
            return;
        }
        state.probe.in_flight = false;

        match cached {
            Some(CachedDevice {
                capabilities: Some(caps),
                selected_config,
                saved_at,
            }) if !self
                .settings
                .policy
                .should_probe(Some(caps.probed_at), Some(saved_at), now) =>
            {
                log::info!("{}: using cached capabilities from {}", stable_id, saved_at);
                state.preferred_config = selected_config.map(|s| reconcile_selection(&s, &caps).0);
                state.probe.last_probe = Some(caps.probed_at);
                let modes = caps.modes.len();
                state.capabilities = Some(caps);
                self.emit(RegistryEvent::CapabilitiesReady {
                    stable_id: stable_id.to_string(),
                    source: CapabilitySource::Cache,
                    modes,
                });
                self.resume_parked(stable_id);
            }
            other => {
                state.cached = other;
                self.start_probe(stable_id);
            }
        }
    }

    fn start_probe(&mut self, stable_id: &str) {
        let Some(state) = self.devices.get_mut(stable_id) else {
            return;
        };
        if state.probe.in_flight || state.probe.disabled {
            return;
        }
        state.probe.in_flight = true;
        state.probe.retry_scheduled = false;

        let identity = state.identity.clone();
        let generation = state.generation;
        let backend = self.backends.resolve(identity.backend);
        let internal = self.internal.clone();
        let timeout = self.settings.probe_timeout;
        log::debug!("{}: probing", stable_id);

        tokio::spawn(async move {
            let result = match backend {
                Some(backend) => match tokio::time::timeout(timeout, backend.probe(&identity)).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::unreachable(format!(
                        "probe timed out after {:?}",
                        timeout
                    ))),
                },
                None => Err(BackendError::unsupported(format!(
                    "no backend serves {} devices",
                    identity.backend
                ))),
            };
            let _ = internal.send(Internal::ProbeFinished {
                stable_id: identity.stable_id,
                generation,
                result,
            });
        });
    }

    fn on_probe_finished(
        &mut self,
        stable_id: &str,
        generation: u64,
        result: Result<ProbeReport, BackendError>,
    ) {
        let now = Utc::now();
        let Some(state) = self.devices.get_mut(stable_id) else {
            return;
        };
        if state.generation != generation {
            log::debug!("{}: dropping probe result for an old registration", stable_id);
            return;
        }
        state.probe.in_flight = false;
        state.probe.last_probe = Some(now);

        let outcome = result.and_then(|report| {
            report
                .into_capabilities(now)
                .ok_or_else(|| BackendError::misconfigured("probe reported no usable modes"))
        });

        match outcome {
            Ok(probed) => {
                state.probe.failures = 0;
                let cached = state.cached.take();
                let caps = match cached.as_ref().and_then(|c| c.capabilities.as_ref()) {
                    Some(previous) => merge(&probed, previous),
                    None => probed,
                };

                if let Some(selected) = state.selected_config.take() {
                    state.selected_config = Some(reconcile_selection(&selected, &caps).0);
                }
                let prior = state
                    .selected_config
                    .clone()
                    .or_else(|| state.preferred_config.take())
                    .or_else(|| cached.and_then(|c| c.selected_config));
                state.preferred_config = prior.map(|s| reconcile_selection(&s, &caps).0);
                state.capabilities = Some(caps.clone());

                let preferred = state.preferred_config.clone();
                log::info!("{}: {} modes probed", stable_id, caps.modes.len());
                let modes = caps.modes.len();
                self.persist(stable_id, Some(caps), preferred);
                self.emit(RegistryEvent::CapabilitiesReady {
                    stable_id: stable_id.to_string(),
                    source: CapabilitySource::Probe,
                    modes,
                });
                self.resume_parked(stable_id);
            }
            Err(e) => {
                state.probe.failures += 1;
                let failures = state.probe.failures;
                log::warn!("{}: probe failed ({} in a row): {}", stable_id, failures, e);

                if self.settings.policy.should_disable(failures) {
                    state.probe.disabled = true;
                    log::warn!(
                        "{}: probing disabled after {} failures until an explicit reprobe",
                        stable_id,
                        failures
                    );
                } else {
                    state.probe.retry_scheduled = true;
                    let delay = self.settings.policy.next_probe_delay(failures);
                    let internal = self.internal.clone();
                    let id = stable_id.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = internal.send(Internal::ProbeRetry {
                            stable_id: id,
                            generation,
                        });
                    });
                }

                let mut fallback = None;
                if state.capabilities.is_none() {
                    if let Some(cached) = state.cached.as_ref() {
                        if let Some(caps) = cached.capabilities.clone() {
                            log::info!("{}: falling back to cached capabilities", stable_id);
                            state.preferred_config = cached
                                .selected_config
                                .as_ref()
                                .map(|s| reconcile_selection(s, &caps).0);
                            fallback = Some(caps.modes.len());
                            state.capabilities = Some(caps);
                        }
                    }
                }
                let has_capabilities = state.capabilities.is_some();
                let disabled = state.probe.disabled;

                if let Some(modes) = fallback {
                    self.emit(RegistryEvent::CapabilitiesReady {
                        stable_id: stable_id.to_string(),
                        source: CapabilitySource::Cache,
                        modes,
                    });
                }
                if has_capabilities {
                    self.resume_parked(stable_id);
                } else if disabled {
                    self.fail_parked(
                        stable_id,
                        TransitionFailure::unavailable(format!(
                            "capabilities of {} unknown, probing disabled",
                            stable_id
                        )),
                    );
                }
            }
        }
    }

    fn resume_parked(&mut self, stable_id: &str) {
        let Some(parked) = self.parked.remove(stable_id) else {
            return;
        };
        for ParkedSelect { request, reply } in parked {
            if reply.is_closed() {
                log::debug!("{}: dropping abandoned selection", stable_id);
                continue;
            }
            let result = self.apply_select(stable_id, &request);
            let _ = reply.send(result);
        }
    }

    fn fail_parked(&mut self, stable_id: &str, failure: TransitionFailure) {
        if let Some(parked) = self.parked.remove(stable_id) {
            for select in parked {
                let _ = select.reply.send(Err(failure.clone()));
            }
        }
    }

    // ---- operations ---------------------------------------------------

    fn select(&mut self, stable_id: String, request: ConfigRequest, reply: Reply<Selection>) {
        let Some(state) = self.devices.get(&stable_id) else {
            let _ = reply.send(Err(TransitionFailure::not_found(&stable_id)));
            return;
        };
        if let Err(failure) = state.check(LifecycleEvent::Select) {
            let _ = reply.send(Err(failure));
            return;
        }
        if state.capabilities.is_none() {
            if state.probe.in_flight || state.probe.retry_scheduled {
                log::info!("{}: selection waits for the running probe", stable_id);
                self.parked
                    .entry(stable_id)
                    .or_default()
                    .push(ParkedSelect { request, reply });
            } else {
                let _ = reply.send(Err(TransitionFailure::unavailable(format!(
                    "capabilities of {} unknown, probing disabled",
                    stable_id
                ))));
            }
            return;
        }
        let result = self.apply_select(&stable_id, &request);
        let _ = reply.send(result);
    }

    fn apply_select(
        &mut self,
        stable_id: &str,
        request: &ConfigRequest,
    ) -> Result<Selection, TransitionFailure> {
        let state = self
            .devices
            .get_mut(stable_id)
            .ok_or_else(|| TransitionFailure::not_found(stable_id))?;
        state.check(LifecycleEvent::Select)?;
        let caps = state.capabilities.as_ref().ok_or_else(|| {
            TransitionFailure::unavailable(format!("capabilities of {} unknown", stable_id))
        })?;

        let previous = state
            .selected_config
            .as_ref()
            .or(state.preferred_config.as_ref());
        let selection = resolve_config(caps, request, previous);
        for warning in &selection.warnings {
            log::warn!(
                "{}: {:?} mode {} resolved to {} ({})",
                stable_id,
                warning.role,
                warning.requested,
                warning.resolved,
                warning.reason
            );
        }

        state.transition(LifecycleEvent::Select)?;
        state.selected_config = Some(selection.config.clone());
        state.preferred_config = Some(selection.config.clone());
        let caps = state.capabilities.clone();

        self.persist(stable_id, caps, Some(selection.config.clone()));
        self.emit(RegistryEvent::DeviceSelected {
            stable_id: stable_id.to_string(),
            selection: selection.clone(),
        });
        Ok(selection)
    }

    async fn enable_preview(&mut self, stable_id: &str) -> Result<(), TransitionFailure> {
        self.devices
            .get(stable_id)
            .ok_or_else(|| TransitionFailure::not_found(stable_id))?
            .check(LifecycleEvent::EnablePreview)?;
        self.settle_teardowns(stable_id).await;

        let state = self
            .devices
            .get_mut(stable_id)
            .ok_or_else(|| TransitionFailure::not_found(stable_id))?;
        let config = state
            .selected_config
            .clone()
            .ok_or_else(|| TransitionFailure::unavailable("no configuration selected"))?;
        let mode = state
            .capabilities
            .as_ref()
            .and_then(|caps| caps.mode(&config.preview_mode))
            .cloned()
            .ok_or_else(|| {
                TransitionFailure::unavailable(format!(
                    "preview mode {} is not supported",
                    config.preview_mode
                ))
            })?;
        let backend = self.backends.resolve(state.identity.backend).ok_or_else(|| {
            TransitionFailure::unavailable(format!(
                "no backend serves {} devices",
                state.identity.backend
            ))
        })?;

        crate::assert_invariant!(
            state.tasks.is_empty(),
            "at most one capture task per device",
            "registry"
        );
        state.transition(LifecycleEvent::EnablePreview)?;

        let preview_buffer = Arc::new(FrameBuffer::new(self.settings.buffer_capacity));
        let output_id = state
            .tap
            .attach(preview_buffer.clone(), AdmissionPolicy::Overwrite, false);
        state.tasks.preview = Some(consumers::spawn_preview(
            preview_buffer,
            output_id,
            state.latest_frame.clone(),
        ));
        state.tasks.capture = Some(spawn_capture(CaptureContext {
            identity: state.identity.clone(),
            generation: state.generation,
            backend,
            mode,
            fps_cap: config.target_fps_cap,
            tap: state.tap.clone(),
            counters: state.counters.clone(),
            clock: self.clock.clone(),
            internal: self.internal.clone(),
        }));

        self.emit(RegistryEvent::PreviewStarted {
            stable_id: stable_id.to_string(),
        });
        Ok(())
    }

    async fn disable_preview(&mut self, stable_id: &str) -> Result<(), TransitionFailure> {
        let grace = self.settings.grace_period;
        let state = self
            .devices
            .get_mut(stable_id)
            .ok_or_else(|| TransitionFailure::not_found(stable_id))?;
        state.check(LifecycleEvent::DisablePreview)?;

        let tasks = std::mem::take(&mut state.tasks);
        stop_streaming(tasks, state.tap.clone(), grace, false).await;
        state.transition(LifecycleEvent::DisablePreview)?;

        self.emit(RegistryEvent::PreviewStopped {
            stable_id: stable_id.to_string(),
        });
        Ok(())
    }

    fn start_record(&mut self, stable_id: &str) -> Result<PathBuf, TransitionFailure> {
        let state = self
            .devices
            .get_mut(stable_id)
            .ok_or_else(|| TransitionFailure::not_found(stable_id))?;
        state.check(LifecycleEvent::StartRecord)?;

        let path = self.settings.recording_dir.join(format!(
            "{}-{}.rawrec",
            consumers::file_stem(stable_id),
            Utc::now().format("%Y%m%dT%H%M%S%3f")
        ));
        let buffer = Arc::new(FrameBuffer::new(self.settings.record_capacity));
        let output_id = state
            .tap
            .attach(buffer.clone(), AdmissionPolicy::Reject, false);
        state.tasks.record = Some(consumers::spawn_record(
            buffer,
            output_id,
            path.clone(),
            state.counters.clone(),
            Some(RecordOrigin {
                stable_id: stable_id.to_string(),
                generation: state.generation,
                internal: self.internal.clone(),
            }),
        ));
        state.transition(LifecycleEvent::StartRecord)?;
        log::info!("{}: recording to {:?}", stable_id, path);

        self.emit(RegistryEvent::RecordingStarted {
            stable_id: stable_id.to_string(),
            path: path.clone(),
        });
        Ok(path)
    }

    async fn stop_record(&mut self, stable_id: &str) -> Result<RecordSummary, TransitionFailure> {
        let grace = self.settings.grace_period;
        let state = self
            .devices
            .get_mut(stable_id)
            .ok_or_else(|| TransitionFailure::not_found(stable_id))?;
        state.check(LifecycleEvent::StopRecord)?;

        let record = state
            .tasks
            .record
            .take()
            .ok_or_else(|| TransitionFailure::unavailable("no recording in progress"))?;
        state.tap.detach(record.output_id);
        let result = record.finish(grace).await;
        state.transition(LifecycleEvent::StopRecord)?;

        match result {
            Ok(summary) => {
                self.emit(RegistryEvent::RecordingStopped {
                    stable_id: stable_id.to_string(),
                    summary: summary.clone(),
                });
                Ok(summary)
            }
            Err(e) => {
                let message = e.to_string();
                self.emit(RegistryEvent::RecordingFailed {
                    stable_id: stable_id.to_string(),
                    message: message.clone(),
                });
                Err(TransitionFailure::unavailable(format!(
                    "recording failed: {}",
                    message
                )))
            }
        }
    }

    async fn take_snapshot(&mut self, stable_id: &str) -> Result<PathBuf, TransitionFailure> {
        let state = self
            .devices
            .get(stable_id)
            .ok_or_else(|| TransitionFailure::not_found(stable_id))?;
        if !state.lifecycle.is_streaming() {
            return Err(TransitionFailure::invalid_transition(
                state.lifecycle,
                "take_snapshot",
            ));
        }
        let frame = state
            .latest_frame()
            .ok_or_else(|| TransitionFailure::unavailable("no frame captured yet"))?;

        let path = consumers::write_snapshot(&self.settings.snapshot_dir, stable_id, &frame)
            .await
            .map_err(|e| TransitionFailure::unavailable(format!("snapshot failed: {}", e)))?;
        log::info!("{}: snapshot of frame {} at {:?}", stable_id, frame.frame_number(), path);

        self.emit(RegistryEvent::SnapshotTaken {
            stable_id: stable_id.to_string(),
            path: path.clone(),
            frame_number: frame.frame_number(),
        });
        Ok(path)
    }

    fn reset(&mut self, stable_id: &str) -> Result<(), TransitionFailure> {
        let state = self
            .devices
            .get_mut(stable_id)
            .ok_or_else(|| TransitionFailure::not_found(stable_id))?;
        state.transition(LifecycleEvent::Reset)?;
        state.last_error = None;
        if let Some(selected) = state.selected_config.take() {
            state.preferred_config = Some(selected);
        }
        state.probe = ProbeState {
            last_probe: state.probe.last_probe,
            ..ProbeState::default()
        };
        let needs_probe = state.capabilities.is_none();

        self.emit(RegistryEvent::DeviceReset {
            stable_id: stable_id.to_string(),
        });
        if needs_probe {
            self.start_probe(stable_id);
        }
        Ok(())
    }

    fn reprobe(&mut self, stable_id: &str) -> Result<(), TransitionFailure> {
        let state = self
            .devices
            .get_mut(stable_id)
            .ok_or_else(|| TransitionFailure::not_found(stable_id))?;
        if state.lifecycle.is_streaming() {
            return Err(TransitionFailure::invalid_transition(state.lifecycle, "reprobe"));
        }
        state.probe.disabled = false;
        state.probe.failures = 0;
        if state.probe.in_flight {
            return Ok(());
        }
        // keep the current capabilities as the merge base
        if let Some(caps) = state.capabilities.clone() {
            let saved_at = caps.probed_at;
            state.cached = Some(CachedDevice {
                capabilities: Some(caps),
                selected_config: state.preferred_config.clone(),
                saved_at,
            });
        }
        self.start_probe(stable_id);
        Ok(())
    }

    fn attach_consumer(
        &mut self,
        stable_id: &str,
        capacity: usize,
        policy: AdmissionPolicy,
    ) -> Result<Arc<FrameBuffer>, TransitionFailure> {
        let state = self
            .devices
            .get(stable_id)
            .ok_or_else(|| TransitionFailure::not_found(stable_id))?;
        if state.lifecycle == Lifecycle::Error {
            return Err(TransitionFailure::invalid_transition(
                state.lifecycle,
                "attach_consumer",
            ));
        }
        let buffer = Arc::new(FrameBuffer::new(capacity));
        state.tap.attach(buffer.clone(), policy, true);
        log::debug!("{}: external consumer attached ({:?})", stable_id, policy);
        Ok(buffer)
    }

    // ---- faults -------------------------------------------------------

    async fn on_capture_fault(&mut self, stable_id: &str, generation: u64, message: String) {
        let grace = self.settings.grace_period;
        let Some(state) = self.devices.get_mut(stable_id) else {
            return;
        };
        if state.generation != generation || !state.lifecycle.is_streaming() {
            log::debug!("{}: stale capture fault ignored: {}", stable_id, message);
            return;
        }

        let tasks = std::mem::take(&mut state.tasks);
        let summary = stop_streaming(tasks, state.tap.clone(), grace, true).await;
        if state.transition(LifecycleEvent::Fault).is_err() {
            return;
        }
        state.last_error = Some(message.clone());

        if let Some(Ok(summary)) = summary {
            self.emit(RegistryEvent::RecordingStopped {
                stable_id: stable_id.to_string(),
                summary,
            });
        }
        self.emit(RegistryEvent::DeviceError {
            stable_id: stable_id.to_string(),
            message,
        });
    }

    async fn on_recording_failed(
        &mut self,
        stable_id: &str,
        generation: u64,
        output_id: u64,
        message: String,
    ) {
        let grace = self.settings.grace_period;
        let Some(state) = self.devices.get_mut(stable_id) else {
            return;
        };
        let current = state.generation == generation
            && state.lifecycle == Lifecycle::Recording
            && state
                .tasks
                .record
                .as_ref()
                .is_some_and(|r| r.output_id == output_id);
        if !current {
            return;
        }
        if let Some(record) = state.tasks.record.take() {
            state.tap.detach(record.output_id);
            let _ = record.finish(grace).await;
        }
        let _ = state.transition(LifecycleEvent::StopRecord);

        self.emit(RegistryEvent::RecordingFailed {
            stable_id: stable_id.to_string(),
            message,
        });
    }

    // ---- shutdown -----------------------------------------------------

    async fn shutdown(&mut self) {
        log::info!("Shutting down device registry ({} devices)", self.devices.len());
        let grace = self.settings.grace_period;

        if let Some((stop, mut join)) = self.discovery.take() {
            let _ = stop.send(true);
            if tokio::time::timeout(grace, &mut join).await.is_err() {
                join.abort();
            }
        }

        let mut stops = Vec::new();
        let mut saves = Vec::new();
        for (stable_id, state) in self.devices.iter_mut() {
            let tasks = std::mem::take(&mut state.tasks);
            let tap = state.tap.clone();
            let id = stable_id.clone();
            stops.push(async move { (id, stop_streaming(tasks, tap, grace, true).await) });
            saves.push((
                stable_id.clone(),
                state.capabilities.clone(),
                state
                    .selected_config
                    .clone()
                    .or_else(|| state.preferred_config.clone()),
            ));
        }
        for (stable_id, summary) in futures::future::join_all(stops).await {
            match summary {
                Some(Ok(summary)) => self.emit(RegistryEvent::RecordingStopped {
                    stable_id,
                    summary,
                }),
                Some(Err(e)) => log::warn!("{}: recording lost on shutdown: {}", stable_id, e),
                None => {}
            }
        }

        let teardowns: Vec<(String, Vec<JoinHandle<()>>)> = self.teardowns.drain().collect();
        for (stable_id, handles) in teardowns {
            for mut handle in handles {
                if tokio::time::timeout(grace * 3, &mut handle).await.is_err() {
                    log::warn!("{}: teardown overran shutdown, aborting", stable_id);
                    handle.abort();
                }
            }
        }

        let parked: Vec<String> = self.parked.keys().cloned().collect();
        for stable_id in parked {
            self.fail_parked(&stable_id, TransitionFailure::closed());
        }
        self.flaps.clear();

        for (stable_id, caps, selected) in saves {
            self.persist(&stable_id, caps, selected);
        }
        self.persist = None;
        if let Some(mut persister) = self.persister.take() {
            if tokio::time::timeout(grace, &mut persister).await.is_err() {
                log::warn!("Cache writes did not finish within {:?}", grace);
                persister.abort();
            }
        }
        log::info!("Device registry stopped");
    }
}
