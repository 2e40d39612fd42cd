//! The command loop: protocol lines in, status lines out.

use super::message::{parse_command, Command, ParseError, StatusKind, StatusMessage};
use super::sink::StatusSink;
use crate::config::RigConfig;
use crate::errors::{RigError, TransitionFailure};
use crate::registry::{DeviceRegistry, RegistryEvent};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Upper bound on every registry call; elapsed means `busy`.
    pub command_timeout: Duration,
    /// `None` disables telemetry.
    pub telemetry_interval: Option<Duration>,
}

impl ChannelSettings {
    pub fn from_config(config: &RigConfig) -> Self {
        Self {
            command_timeout: config.runtime.command_timeout(),
            telemetry_interval: config.telemetry.interval(),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from_config(&RigConfig::default())
    }
}

enum Outcome<T> {
    Done(T),
    Failed(TransitionFailure),
    TimedOut,
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, TransitionFailure>>,
) -> Outcome<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Outcome::Done(value),
        Ok(Err(failure)) => Outcome::Failed(failure),
        Err(_) => Outcome::TimedOut,
    }
}

async fn tick(telemetry: &mut Option<Interval>) {
    match telemetry {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub struct CommandChannel<S: StatusSink> {
    registry: DeviceRegistry,
    events: mpsc::UnboundedReceiver<RegistryEvent>,
    sink: S,
    settings: ChannelSettings,
    session_id: Uuid,
    backends: Vec<String>,
    /// Last successfully selected device, the default command target.
    current: Option<String>,
    interrupt: Arc<Notify>,
}

impl<S: StatusSink> CommandChannel<S> {
    pub fn new(
        registry: DeviceRegistry,
        events: mpsc::UnboundedReceiver<RegistryEvent>,
        sink: S,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            registry,
            events,
            sink,
            settings,
            session_id: Uuid::new_v4(),
            backends: Vec::new(),
            current: None,
            interrupt: Arc::new(Notify::new()),
        }
    }

    /// Backend names reported in the `initialized` status.
    pub fn with_backends(mut self, backends: Vec<String>) -> Self {
        self.backends = backends;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Notifying this handle ends the loop like `quit` does (Ctrl-C).
    pub fn interrupt_handle(&self) -> Arc<Notify> {
        self.interrupt.clone()
    }

    /// Serve `input` until `quit`, end of input or an interrupt, then tear
    /// the registry down and flush its remaining events.
    pub async fn run<R: AsyncBufRead + Unpin>(mut self, input: R) -> Result<(), RigError> {
        self.emit(StatusMessage::new(
            StatusKind::Initialized,
            json!({
                "version": crate::VERSION,
                "session_id": self.session_id.to_string(),
                "backends": self.backends,
            }),
        ))?;
        log::info!("Command channel ready (session {})", self.session_id);

        let mut lines = input.split(b'\n');
        let mut telemetry = self.settings.telemetry_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        let interrupt = self.interrupt.clone();

        loop {
            tokio::select! {
                biased;
                _ = interrupt.notified() => {
                    log::info!("Interrupted, shutting down");
                    break;
                }
                Some(event) = self.events.recv() => self.forward(event)?,
                line = lines.next_segment() => match line {
                    Ok(Some(raw)) => {
                        let line = match String::from_utf8(raw) {
                            Ok(line) => line,
                            Err(e) => {
                                log::warn!("Ignoring command line that is not UTF-8: {}", e);
                                continue;
                            }
                        };
                        if self.handle_line(&line).await? == Flow::Quit {
                            break;
                        }
                    }
                    Ok(None) => {
                        log::info!("Command input closed");
                        break;
                    }
                    Err(e) => {
                        log::error!("Failed to read command input: {}", e);
                        break;
                    }
                },
                _ = tick(&mut telemetry) => self.telemetry().await?,
            }
        }

        self.finish().await
    }

    fn emit(&mut self, message: StatusMessage) -> Result<(), RigError> {
        self.sink.emit(&message)
    }

    fn forward(&mut self, event: RegistryEvent) -> Result<(), RigError> {
        if let RegistryEvent::DeviceLost { stable_id } = &event {
            if self.current.as_deref() == Some(stable_id.as_str()) {
                self.current = None;
            }
        }
        self.emit(StatusMessage::from(&event))
    }

    async fn handle_line(&mut self, line: &str) -> Result<Flow, RigError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Flow::Continue);
        }
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(ParseError::Malformed(reason)) => {
                log::warn!("Ignoring malformed command line ({}): {}", reason, line);
                return Ok(Flow::Continue);
            }
            Err(error @ ParseError::Unsupported(_)) => {
                log::warn!("{}", error);
                self.emit(StatusMessage::error("unsupported_command", error.to_string(), None))?;
                return Ok(Flow::Continue);
            }
            Err(error @ ParseError::InvalidArguments { .. }) => {
                log::warn!("{}", error);
                self.emit(StatusMessage::error("invalid_arguments", error.to_string(), None))?;
                return Ok(Flow::Continue);
            }
        };

        log::debug!("Command: {}", command.verb());
        if command == Command::Quit {
            return Ok(Flow::Quit);
        }
        self.execute(command).await?;
        Ok(Flow::Continue)
    }

    /// Report a finished call; `None` when a status already told the caller
    /// why nothing happened.
    fn settle<T>(
        &mut self,
        verb: &str,
        device_id: Option<&str>,
        outcome: Outcome<T>,
    ) -> Result<Option<T>, RigError> {
        match outcome {
            Outcome::Done(value) => Ok(Some(value)),
            Outcome::Failed(failure) => {
                log::warn!("{} failed: {}", verb, failure);
                self.emit(StatusMessage::failure(&failure, device_id))?;
                Ok(None)
            }
            Outcome::TimedOut => {
                log::warn!(
                    "{} did not complete within {:?}",
                    verb,
                    self.settings.command_timeout
                );
                self.emit(StatusMessage::new(
                    StatusKind::Busy,
                    json!({
                        "command": verb,
                        "device_id": device_id,
                        "timeout_ms": self.settings.command_timeout.as_millis() as u64,
                    }),
                ))?;
                Ok(None)
            }
        }
    }

    /// Pick the device a command applies to.
    async fn resolve_target(
        &mut self,
        verb: &str,
        requested: Option<String>,
    ) -> Result<Option<String>, RigError> {
        if let Some(id) = requested.or_else(|| self.current.clone()) {
            return Ok(Some(id));
        }
        let outcome = bounded(self.settings.command_timeout, self.registry.devices()).await;
        let Some(devices) = self.settle(verb, None, outcome)? else {
            return Ok(None);
        };
        match devices.as_slice() {
            [] => {
                self.emit(StatusMessage::new(
                    StatusKind::DeviceNotFound,
                    json!({ "command": verb }),
                ))?;
                Ok(None)
            }
            [only] => Ok(Some(only.identity.stable_id.clone())),
            _ => {
                self.emit(StatusMessage::error(
                    "invalid_arguments",
                    format!("{} devices known, pass device_id", devices.len()),
                    None,
                ))?;
                Ok(None)
            }
        }
    }

    async fn execute(&mut self, command: Command) -> Result<(), RigError> {
        let verb = command.verb();
        let limit = self.settings.command_timeout;
        let registry = self.registry.clone();

        match command {
            Command::GetStatus { device_id: Some(id) } => {
                let outcome = bounded(limit, registry.device(&id)).await;
                if let Some(device) = self.settle(verb, Some(&id), outcome)? {
                    self.emit(StatusMessage::new(
                        StatusKind::Status,
                        json!({ "device": device }),
                    ))?;
                }
            }
            Command::GetStatus { device_id: None } => {
                let outcome = bounded(limit, registry.devices()).await;
                if let Some(devices) = self.settle(verb, None, outcome)? {
                    self.emit(StatusMessage::new(
                        StatusKind::Status,
                        json!({ "devices": devices, "selected": self.current }),
                    ))?;
                }
            }
            Command::SelectDevice { device_id, request } => {
                let Some(id) = self.resolve_target(verb, device_id).await? else {
                    return Ok(());
                };
                let outcome = bounded(limit, registry.select_device(&id, request)).await;
                if self.settle(verb, Some(&id), outcome)?.is_some() {
                    self.current = Some(id);
                }
            }
            Command::EnablePreview { device_id } => {
                if let Some(id) = self.resolve_target(verb, device_id).await? {
                    let outcome = bounded(limit, registry.enable_preview(&id)).await;
                    self.settle(verb, Some(&id), outcome)?;
                }
            }
            Command::DisablePreview { device_id } => {
                if let Some(id) = self.resolve_target(verb, device_id).await? {
                    let outcome = bounded(limit, registry.disable_preview(&id)).await;
                    self.settle(verb, Some(&id), outcome)?;
                }
            }
            Command::StartRecording { device_id } => {
                if let Some(id) = self.resolve_target(verb, device_id).await? {
                    let outcome = bounded(limit, registry.start_record(&id)).await;
                    self.settle(verb, Some(&id), outcome)?;
                }
            }
            Command::StopRecording { device_id } => {
                if let Some(id) = self.resolve_target(verb, device_id).await? {
                    let outcome = bounded(limit, registry.stop_record(&id)).await;
                    self.settle(verb, Some(&id), outcome)?;
                }
            }
            Command::TakeSnapshot { device_id } => {
                if let Some(id) = self.resolve_target(verb, device_id).await? {
                    let outcome = bounded(limit, registry.take_snapshot(&id)).await;
                    self.settle(verb, Some(&id), outcome)?;
                }
            }
            Command::ResetDevice { device_id } => {
                if let Some(id) = self.resolve_target(verb, device_id).await? {
                    let outcome = bounded(limit, registry.reset_device(&id)).await;
                    self.settle(verb, Some(&id), outcome)?;
                }
            }
            Command::Reprobe { device_id } => {
                if let Some(id) = self.resolve_target(verb, device_id).await? {
                    let outcome = bounded(limit, registry.reprobe(&id)).await;
                    self.settle(verb, Some(&id), outcome)?;
                }
            }
            Command::Quit => {}
        }
        Ok(())
    }

    async fn telemetry(&mut self) -> Result<(), RigError> {
        let outcome = bounded(self.settings.command_timeout, self.registry.devices()).await;
        let Outcome::Done(devices) = outcome else {
            log::debug!("Skipping telemetry, registry did not answer");
            return Ok(());
        };
        let devices: Vec<Value> = devices
            .iter()
            .map(|device| {
                json!({
                    "device_id": device.identity.stable_id,
                    "lifecycle": device.lifecycle,
                    "metrics": device.metrics,
                })
            })
            .collect();
        self.emit(StatusMessage::new(
            StatusKind::Telemetry,
            json!({ "devices": devices }),
        ))
    }

    async fn finish(mut self) -> Result<(), RigError> {
        self.emit(StatusMessage::new(StatusKind::Quitting, json!({})))?;
        if let Err(failure) = self.registry.shutdown().await {
            log::warn!("Registry shutdown: {}", failure);
        }
        while let Some(event) = self.events.recv().await {
            self.forward(event)?;
        }
        log::info!("Command channel closed");
        Ok(())
    }
}
