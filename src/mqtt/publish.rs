use std::{collections::HashMap, sync::Arc};

use color_eyre::Result;
use log::error;
use rumqttc::QoS;
use serde::Serialize;

use super::mqtt_device::{publish_mqtt_device, MqttDevice};
use crate::{
    protocols::mqtt::MqttClient,
    settings::Settings,
    sync::coordinator::{SyncCoordinator, SyncSnapshot, SyncStatus},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Loading,
    Ready,
    Cooldown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MqttStatus {
    pub status: StatusKind,
    pub cooldown_remaining: u64,
}

impl From<SyncStatus> for MqttStatus {
    fn from(status: SyncStatus) -> Self {
        let (status, cooldown_remaining) = match status {
            SyncStatus::Loading => (StatusKind::Loading, 0),
            SyncStatus::Ready => (StatusKind::Ready, 0),
            SyncStatus::Cooldown(remaining) => (StatusKind::Cooldown, remaining),
        };

        MqttStatus {
            status,
            cooldown_remaining,
        }
    }
}

/// Remembers what was last published so only changes go out.
#[derive(Debug, Default)]
pub struct PublishedState {
    devices: HashMap<String, MqttDevice>,
    status: Option<MqttStatus>,
}

impl PublishedState {
    /// Devices whose published representation differs from the last one sent.
    /// Devices that left the list are forgotten.
    pub fn changed_devices(&mut self, snapshot: &SyncSnapshot) -> Result<Vec<MqttDevice>> {
        let mut changed = vec![];

        for device in &snapshot.devices {
            let mqtt_device = MqttDevice::from_device(device)?;

            if self.devices.get(&mqtt_device.id) != Some(&mqtt_device) {
                self.devices.insert(mqtt_device.id.clone(), mqtt_device.clone());
                changed.push(mqtt_device);
            }
        }

        self.devices
            .retain(|id, _| snapshot.devices.iter().any(|device| &device.device == id));

        Ok(changed)
    }

    pub fn changed_status(&mut self, snapshot: &SyncSnapshot) -> Option<MqttStatus> {
        let status = MqttStatus::from(snapshot.status());

        if self.status == Some(status) {
            None
        } else {
            self.status = Some(status);
            Some(status)
        }
    }
}

async fn publish_snapshot(
    mqtt_client: &MqttClient,
    settings: &Settings,
    published: &mut PublishedState,
    snapshot: &SyncSnapshot,
) -> Result<()> {
    if let Some(status) = published.changed_status(snapshot) {
        let json = serde_json::to_string(&status)?;

        mqtt_client
            .client
            .publish(&settings.mqtt.status_topic, QoS::AtLeastOnce, true, json)
            .await?;
    }

    for mqtt_device in published.changed_devices(snapshot)? {
        publish_mqtt_device(mqtt_client, settings, &mqtt_device).await?;
    }

    Ok(())
}

/// Mirrors every change of the coordinator's view to the broker.
pub fn start_state_publish_loop(
    mqtt_client: &MqttClient,
    settings: &Settings,
    coordinator: &Arc<SyncCoordinator>,
) {
    let mqtt_client = mqtt_client.clone();
    let settings = settings.clone();
    let mut rx = coordinator.subscribe();

    tokio::spawn(async move {
        let mut published = PublishedState::default();

        loop {
            let snapshot = rx.borrow_and_update().clone();

            let result = publish_snapshot(&mqtt_client, &settings, &mut published, &snapshot).await;
            if let Err(e) = result {
                error!("Error while publishing state to MQTT: {:?}", e);
            }

            if rx.changed().await.is_err() {
                break;
            }
        }
    });
}
