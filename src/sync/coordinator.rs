use futures::future::join_all;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::watch;

use super::tentative::Tentative;
use crate::{
    govee::{
        command::{segment_requests, ControlRequest, DeviceCommand},
        device::{Device, DeviceRef, Properties, Segment},
        error::GatewayError,
        gateway::Gateway,
    },
    settings::SyncSettings,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("paused by rate limit, resuming in {0}s")]
    CoolingDown(u64),

    #[error("unknown device {0}")]
    UnknownDevice(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    Loading,
    Ready,
    Cooldown(u64),
}

/// The coordinator's complete view: device list plus session status.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncSnapshot {
    pub devices: Vec<Device>,
    pub loading: bool,
    pub cooldown_remaining: u64,
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        SyncSnapshot {
            devices: vec![],
            loading: true,
            cooldown_remaining: 0,
        }
    }
}

impl SyncSnapshot {
    pub fn status(&self) -> SyncStatus {
        if self.cooldown_remaining > 0 {
            SyncStatus::Cooldown(self.cooldown_remaining)
        } else if self.loading {
            SyncStatus::Loading
        } else {
            SyncStatus::Ready
        }
    }

    pub fn device(&self, device_id: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.device == device_id)
    }

    pub fn device_mut(&mut self, device_id: &str) -> Option<&mut Device> {
        self.devices.iter_mut().find(|device| device.device == device_id)
    }
}

/// Owns the authoritative device list and its last known properties.
///
/// All state lives in a watch channel, so every mutation is visible to
/// subscribers (the MQTT publisher) as soon as it happens. Remote calls are
/// the only suspension points; the channel is never borrowed across them.
pub struct SyncCoordinator {
    gateway: Gateway,
    state: watch::Sender<SyncSnapshot>,
    default_retry_after: u64,
}

impl SyncCoordinator {
    pub fn new(gateway: Gateway, settings: &SyncSettings) -> Self {
        let (state, _) = watch::channel(SyncSnapshot::default());

        SyncCoordinator {
            gateway,
            state,
            default_retry_after: settings.default_retry_after_seconds,
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Cooldown in seconds used when a rate limit carries no retry hint.
    pub fn default_retry_after(&self) -> u64 {
        self.default_retry_after
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.state.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.state.borrow().status()
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.state.borrow().device(device_id).cloned()
    }

    pub fn device_refs(&self) -> Vec<DeviceRef> {
        self.state
            .borrow()
            .devices
            .iter()
            .map(Device::device_ref)
            .collect()
    }

    fn cooldown_remaining(&self) -> u64 {
        self.state.borrow().cooldown_remaining
    }

    /// Replaces the device list with the remote one. Properties already known
    /// for devices that are still present are carried over.
    pub async fn refresh_devices(&self, silent: bool) {
        if self.cooldown_remaining() > 0 {
            return;
        }

        if !silent {
            self.state.send_if_modified(|snapshot| {
                let modified = !snapshot.loading;
                snapshot.loading = true;
                modified
            });
        }

        let devices = self.gateway.list_devices().await;
        info!("Device list refreshed: {} device(s)", devices.len());

        self.state.send_modify(|snapshot| {
            let devices = devices
                .into_iter()
                .map(|mut device| {
                    if let Some(known) = snapshot.device(&device.device) {
                        device.properties = known.properties.clone();
                        device.segments = known.segments.clone();
                    }
                    device
                })
                .collect();

            snapshot.devices = devices;

            if !silent {
                snapshot.loading = false;
            }
        });
    }

    /// Reads the state of every listed device in one batch and merges the
    /// results into the device list.
    ///
    /// No-op on an empty list or while cooling down. A rate limit starts the
    /// cooldown and applies nothing from the batch. A device whose own read
    /// failed keeps its last known properties until the next round.
    pub async fn refresh_device_states(&self, devices: &[DeviceRef]) {
        if devices.is_empty() || self.cooldown_remaining() > 0 {
            return;
        }

        let entries = match self.gateway.read_states(devices).await {
            Ok(entries) => entries,
            Err(GatewayError::RateLimited { retry_after }) => {
                self.enter_cooldown(retry_after.unwrap_or(self.default_retry_after));
                return;
            }
            Err(e) => {
                warn!("Error refreshing states: {}", e);
                return;
            }
        };

        self.state.send_if_modified(|snapshot| {
            let mut modified = false;

            for entry in entries {
                let Some(device) = snapshot.device_mut(&entry.device) else {
                    continue;
                };

                let Some(update) = entry.properties else {
                    debug!("No state for {} this round, keeping last known", entry.device);
                    continue;
                };

                let before = device.properties.clone();
                device
                    .properties
                    .get_or_insert_with(Properties::default)
                    .merge(&update);
                modified |= device.properties != before;
            }

            modified
        });
    }

    /// Re-lists the devices, then reads the state of the listed members only.
    pub async fn refresh_group(&self, device_ids: &[String]) -> Result<(), SyncError> {
        let remaining = self.cooldown_remaining();
        if remaining > 0 {
            return Err(SyncError::CoolingDown(remaining));
        }

        self.refresh_devices(true).await;

        let members: Vec<DeviceRef> = self
            .state
            .borrow()
            .devices
            .iter()
            .filter(|device| device_ids.contains(&device.device))
            .map(Device::device_ref)
            .collect();

        self.refresh_device_states(&members).await;

        Ok(())
    }

    /// Local-only field-wise merge into one device's properties. Returns
    /// whether the device is known.
    pub fn update_device_state(&self, device_id: &str, partial: &Properties) -> bool {
        let mut found = false;

        self.state.send_if_modified(|snapshot| {
            let Some(device) = snapshot.device_mut(device_id) else {
                return false;
            };
            found = true;

            let properties = device.properties.get_or_insert_with(Properties::default);
            let before = properties.clone();
            properties.merge(partial);
            *properties != before
        });

        found
    }

    /// Starts (or restarts) the cooldown. A new signal replaces the remaining
    /// time, it never adds to it.
    pub fn enter_cooldown(&self, seconds: u64) {
        info!("Rate limited by Govee API, pausing for {}s", seconds);

        self.state.send_if_modified(|snapshot| {
            let modified = snapshot.cooldown_remaining != seconds;
            snapshot.cooldown_remaining = seconds;
            modified
        });
    }

    /// Advances the cooldown countdown by one second.
    pub fn tick_cooldown(&self) {
        self.state.send_if_modified(|snapshot| {
            if snapshot.cooldown_remaining == 0 {
                return false;
            }

            snapshot.cooldown_remaining -= 1;
            if snapshot.cooldown_remaining == 0 {
                info!("Cooldown finished, resuming");
            }

            true
        });
    }

    async fn send(&self, request: &ControlRequest) -> Result<(), GatewayError> {
        let result = self.gateway.send_command(request).await;

        if let Err(GatewayError::RateLimited { retry_after }) = &result {
            self.enter_cooldown(retry_after.unwrap_or(self.default_retry_after));
        }

        result.map(|_| ())
    }

    /// Sends a command to one device with an optimistic local update. If the
    /// remote call fails, the fields the command touched are put back to their
    /// previous values.
    pub async fn dispatch(&self, device_id: &str, command: DeviceCommand) -> Result<(), SyncError> {
        let remaining = self.cooldown_remaining();
        if remaining > 0 {
            return Err(SyncError::CoolingDown(remaining));
        }

        let device = self
            .device(device_id)
            .ok_or_else(|| SyncError::UnknownDevice(device_id.to_string()))?;

        if let DeviceCommand::Segments(segments) = &command {
            return self.dispatch_segments(&device, segments).await;
        }

        let requests = command.translate(&device.device, &device.model)?;

        let partial = command.optimistic_properties();
        let mut tentative = None;
        if !partial.is_empty() {
            self.state.send_if_modified(|snapshot| {
                tentative = Tentative::apply(snapshot, device_id, &partial);
                tentative.is_some()
            });
        }

        for request in &requests {
            if let Err(e) = self.send(request).await {
                if let Some(tentative) = tentative {
                    warn!("Command for {} failed, reverting: {}", tentative.device_id(), e);
                    self.state.send_modify(|snapshot| {
                        tentative.rollback(snapshot);
                    });
                }
                return Err(e.into());
            }
        }

        Ok(())
    }

    /// Segment colors and brightness go out as two separate calls. If the
    /// brightness call fails after the color call succeeded, the device keeps
    /// the new colors with its old brightness, and so does the local state.
    async fn dispatch_segments(&self, device: &Device, segments: &[Segment]) -> Result<(), SyncError> {
        let (color, brightness) = segment_requests(&device.device, &device.model, segments)?;

        self.send(&color).await?;
        self.state.send_if_modified(|snapshot| match snapshot.device_mut(&device.device) {
            Some(device) => {
                device.apply_segment_colors(segments);
                true
            }
            None => false,
        });

        self.send(&brightness).await?;
        self.state.send_if_modified(|snapshot| match snapshot.device_mut(&device.device) {
            Some(device) => {
                device.apply_segment_brightness(segments);
                true
            }
            None => false,
        });

        Ok(())
    }

    /// Sends the same commands to several devices concurrently. Each device
    /// gets its own optimistic update and rollback.
    pub async fn dispatch_group(
        &self,
        device_ids: &[String],
        commands: &[DeviceCommand],
    ) -> Vec<(String, Result<(), SyncError>)> {
        let dispatches = device_ids.iter().map(|device_id| async move {
            for command in commands {
                if let Err(e) = self.dispatch(device_id, command.clone()).await {
                    return (device_id.clone(), Err(e));
                }
            }
            (device_id.clone(), Ok(()))
        });

        join_all(dispatches).await
    }
}
