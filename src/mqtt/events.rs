use std::{collections::VecDeque, sync::Arc};

use color_eyre::Result;
use eyre::eyre;
use log::warn;
use rumqttc::QoS;

use crate::{
    mqtt::mqtt_device::MqttDevice,
    protocols::mqtt::MqttClient,
    settings::Settings,
    sync::coordinator::SyncCoordinator,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetTarget {
    Device(String),
    Group(String),

    /// Re-list devices and read the state of one group's members
    GroupRefresh(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SetMessage {
    pub target: SetTarget,
    pub device: MqttDevice,
}

/// Extracts the `{id}` part of `topic` according to `template`.
pub fn match_topic(template: &str, topic: &str) -> Option<String> {
    let (prefix, suffix) = template.split_once("{id}")?;
    let id = topic.strip_prefix(prefix)?.strip_suffix(suffix)?;

    if id.is_empty() || id.contains('/') {
        None
    } else {
        Some(id.to_string())
    }
}

pub fn parse_set_topic(settings: &Settings, topic: &str) -> Option<SetTarget> {
    if let Some(id) = match_topic(&settings.mqtt.light_topic_set, topic) {
        return Some(SetTarget::Device(id));
    }

    if let Some(id) = match_topic(&settings.mqtt.group_topic_set, topic) {
        return Some(SetTarget::Group(id));
    }

    match_topic(&settings.mqtt.group_topic_refresh, topic).map(SetTarget::GroupRefresh)
}

/// Queues a set message, folding it into any message still waiting for the
/// same target. Fields of the newer message win.
pub fn enqueue_set_message(queue: &mut VecDeque<SetMessage>, message: SetMessage) {
    let pending = queue
        .iter()
        .position(|queued| queued.target == message.target)
        .and_then(|idx| queue.remove(idx));

    let message = match pending {
        Some(mut pending) => {
            pending.device.merge(message.device);
            pending
        }
        None => message,
    };

    queue.push_back(message);
}

pub async fn handle_incoming_mqtt_event(
    event: rumqttc::Event,
    mqtt_client: &MqttClient,
    settings: &Settings,
) -> Result<()> {
    match event {
        rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
            let templates = [
                &settings.mqtt.light_topic_set,
                &settings.mqtt.group_topic_set,
                &settings.mqtt.group_topic_refresh,
            ];

            for template in templates {
                mqtt_client
                    .client
                    .subscribe(template.replace("{id}", "+"), QoS::AtMostOnce)
                    .await?;
            }
        }
        rumqttc::Event::Incoming(rumqttc::Packet::Publish(msg)) => {
            let Some(target) = parse_set_topic(settings, &msg.topic) else {
                warn!("Ignoring message on unexpected topic {}", msg.topic);
                return Ok(());
            };

            // Refresh requests carry no payload worth reading
            let device: MqttDevice = match target {
                SetTarget::GroupRefresh(_) => MqttDevice::default(),
                _ => match serde_json::from_slice(&msg.payload) {
                    Ok(device) => device,
                    Err(e) => {
                        warn!("Ignoring malformed set message on {}: {}", msg.topic, e);
                        return Ok(());
                    }
                },
            };

            {
                let mut unhandled_messages = mqtt_client.unhandled_messages.write().await;
                enqueue_set_message(&mut unhandled_messages, SetMessage { target, device });
            }

            // Wake up the dispatch task
            mqtt_client.notify.notify_one();
        }
        _ => {}
    }

    Ok(())
}

pub fn start_mqtt_events_loop(
    mqtt_client: &MqttClient,
    settings: &Settings,
    coordinator: &Arc<SyncCoordinator>,
) {
    let unhandled_messages = mqtt_client.unhandled_messages.clone();
    let notify = mqtt_client.notify.clone();

    let settings = settings.clone();
    let coordinator = coordinator.clone();

    tokio::spawn(async move {
        loop {
            let next_message = {
                let mut unhandled_messages = unhandled_messages.write().await;
                unhandled_messages.pop_front()
            };

            match next_message {
                Some(message) => {
                    let result = process_set_message(message, &settings, &coordinator).await;

                    if let Err(e) = result {
                        warn!("Error while processing MQTT message: {}", e);
                    }
                }
                None => {
                    notify.notified().await;
                }
            }
        }
    });
}

pub async fn process_set_message(
    message: SetMessage,
    settings: &Settings,
    coordinator: &SyncCoordinator,
) -> Result<()> {
    let commands = message.device.to_commands();

    match message.target {
        SetTarget::Device(device_id) => {
            for command in commands {
                coordinator.dispatch(&device_id, command).await?;
            }
        }
        SetTarget::Group(group_id) => {
            let group = settings
                .group(&group_id)
                .ok_or_else(|| eyre!("Unknown group {}", group_id))?;

            let results = coordinator.dispatch_group(&group.devices, &commands).await;

            for (device_id, result) in results {
                if let Err(e) = result {
                    warn!("Group {} member {} failed: {}", group.name, device_id, e);
                }
            }
        }
        SetTarget::GroupRefresh(group_id) => {
            let group = settings
                .group(&group_id)
                .ok_or_else(|| eyre!("Unknown group {}", group_id))?;

            coordinator.refresh_group(&group.devices).await?;
        }
    }

    Ok(())
}
