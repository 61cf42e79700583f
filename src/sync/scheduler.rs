use std::{sync::Arc, time::Duration};

use log::debug;
use tokio::time::{Instant, MissedTickBehavior};

use super::coordinator::SyncCoordinator;
use crate::{govee::device::DeviceRef, settings::SyncSettings};

/// Decides when a batch state refresh is due.
///
/// The schedule is armed for one set of device ids. A change in that set
/// (including the first non-empty list) fires immediately and restarts the
/// interval; an empty set disarms it.
#[derive(Debug)]
pub struct PollSchedule {
    interval: Duration,
    armed_for: Vec<String>,
    last_fired: Option<Instant>,
}

impl PollSchedule {
    pub fn new(interval: Duration) -> Self {
        PollSchedule {
            interval,
            armed_for: vec![],
            last_fired: None,
        }
    }

    /// Returns whether a refresh should run now for the given device list.
    pub fn poll(&mut self, devices: &[DeviceRef], now: Instant) -> bool {
        let mut ids: Vec<String> = devices.iter().map(|device| device.device.clone()).collect();
        ids.sort();
        ids.dedup();

        if ids.is_empty() {
            self.armed_for.clear();
            self.last_fired = None;
            return false;
        }

        let due = match self.last_fired {
            _ if ids != self.armed_for => true,
            None => true,
            Some(last_fired) => now.duration_since(last_fired) >= self.interval,
        };

        if due {
            self.armed_for = ids;
            self.last_fired = Some(now);
        }

        due
    }
}

/// Decides when the device list is fetched again. A populated list is
/// refreshed on the poll interval; an empty one (nothing on the account yet,
/// or a failed listing) is retried sooner.
#[derive(Debug)]
pub struct ListSchedule {
    interval: Duration,
    retry_interval: Duration,
    last_listed: Instant,
}

impl ListSchedule {
    pub fn new(interval: Duration, retry_interval: Duration, listed_at: Instant) -> Self {
        ListSchedule {
            interval,
            retry_interval: retry_interval.min(interval),
            last_listed: listed_at,
        }
    }

    pub fn poll(&mut self, empty: bool, now: Instant) -> bool {
        let wait = if empty { self.retry_interval } else { self.interval };
        let due = now.duration_since(self.last_listed) >= wait;

        if due {
            self.last_listed = now;
        }

        due
    }
}

/// Drives the coordinator's clock: counts down the cooldown once a second,
/// lists devices again and triggers batch refreshes on the poll interval.
///
/// Expects the initial device listing to have happened already.
pub fn start_sync_loop(coordinator: &Arc<SyncCoordinator>, settings: &SyncSettings) {
    let coordinator = coordinator.clone();
    let poll_interval = Duration::from_secs(settings.poll_interval_seconds);
    let list_retry = Duration::from_secs(settings.list_retry_seconds);

    tokio::spawn(async move {
        let mut schedule = PollSchedule::new(poll_interval);
        let mut list_schedule = ListSchedule::new(poll_interval, list_retry, Instant::now());
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            coordinator.tick_cooldown();

            let devices = coordinator.device_refs();
            let now = Instant::now();

            if list_schedule.poll(devices.is_empty(), now) {
                debug!("Listing devices");

                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    coordinator.refresh_devices(true).await;
                });
            }

            if schedule.poll(&devices, now) {
                debug!("Refreshing state of {} device(s)", devices.len());

                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    coordinator.refresh_device_states(&devices).await;
                });
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{govee::gateway::test_gateway, sync::coordinator::SyncStatus};

    fn sync_settings(poll_interval_seconds: u64, list_retry_seconds: u64) -> SyncSettings {
        SyncSettings {
            poll_interval_seconds,
            list_retry_seconds,
            ..Default::default()
        }
    }

    fn device_list() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "data": { "devices": [{ "device": "A", "model": "H6008", "deviceName": "Lamp" }] }
        }))
    }

    fn refs(ids: &[&str]) -> Vec<DeviceRef> {
        ids.iter()
            .map(|id| DeviceRef {
                device: id.to_string(),
                model: "H6008".to_string(),
            })
            .collect()
    }

    #[test]
    fn empty_list_never_fires() {
        let mut schedule = PollSchedule::new(Duration::from_secs(300));
        let now = Instant::now();

        assert!(!schedule.poll(&[], now));
        assert!(!schedule.poll(&[], now + Duration::from_secs(600)));
    }

    #[test]
    fn fires_immediately_then_on_interval() {
        let mut schedule = PollSchedule::new(Duration::from_secs(300));
        let start = Instant::now();
        let devices = refs(&["A", "B"]);

        assert!(schedule.poll(&devices, start));
        assert!(!schedule.poll(&devices, start + Duration::from_secs(1)));
        assert!(!schedule.poll(&devices, start + Duration::from_secs(299)));
        assert!(schedule.poll(&devices, start + Duration::from_secs(300)));
        assert!(!schedule.poll(&devices, start + Duration::from_secs(301)));
    }

    #[test]
    fn changed_device_set_rearms() {
        let mut schedule = PollSchedule::new(Duration::from_secs(300));
        let start = Instant::now();

        assert!(schedule.poll(&refs(&["A", "B"]), start));
        // Same set in another order is not a change
        assert!(!schedule.poll(&refs(&["B", "A"]), start + Duration::from_secs(10)));
        assert!(schedule.poll(&refs(&["A", "C"]), start + Duration::from_secs(20)));
        assert!(!schedule.poll(&refs(&["A", "C"]), start + Duration::from_secs(310)));
        assert!(schedule.poll(&refs(&["A", "C"]), start + Duration::from_secs(320)));
    }

    #[test]
    fn emptied_list_disarms_until_devices_return() {
        let mut schedule = PollSchedule::new(Duration::from_secs(300));
        let start = Instant::now();

        assert!(schedule.poll(&refs(&["A"]), start));
        assert!(!schedule.poll(&[], start + Duration::from_secs(5)));
        assert!(schedule.poll(&refs(&["A"]), start + Duration::from_secs(6)));
    }

    #[test]
    fn empty_list_is_retried_sooner() {
        let start = Instant::now();
        let mut schedule = ListSchedule::new(Duration::from_secs(300), Duration::from_secs(10), start);

        assert!(!schedule.poll(true, start + Duration::from_secs(9)));
        assert!(schedule.poll(true, start + Duration::from_secs(10)));
        assert!(!schedule.poll(false, start + Duration::from_secs(20)));
        assert!(!schedule.poll(false, start + Duration::from_secs(309)));
        assert!(schedule.poll(false, start + Duration::from_secs(310)));
    }

    #[test]
    fn retry_never_waits_longer_than_interval() {
        let start = Instant::now();
        let mut schedule = ListSchedule::new(Duration::from_secs(1), Duration::from_secs(10), start);

        assert!(schedule.poll(true, start + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn loop_counts_cooldown_down_without_reading_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .respond_with(device_list())
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/devices/state"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let settings = sync_settings(300, 10);
        let coordinator = Arc::new(SyncCoordinator::new(test_gateway(&server.uri()), &settings));
        coordinator.refresh_devices(false).await;

        // No remote call happens from here on, so the clock can be paused
        tokio::time::pause();
        coordinator.enter_cooldown(3);
        start_sync_loop(&coordinator, &settings);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(coordinator.status(), SyncStatus::Cooldown(2));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(coordinator.status(), SyncStatus::Cooldown(1));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(coordinator.status(), SyncStatus::Ready);
    }

    #[tokio::test]
    async fn failed_startup_listing_recovers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .respond_with(device_list())
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/devices/state"))
            .and(query_param("device", "A"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "properties": [{ "brightness": 40 }] }
            })))
            .mount(&server)
            .await;

        let settings = sync_settings(300, 1);
        let coordinator = Arc::new(SyncCoordinator::new(test_gateway(&server.uri()), &settings));
        coordinator.refresh_devices(false).await;
        assert!(coordinator.device_refs().is_empty());

        let mut rx = coordinator.subscribe();
        start_sync_loop(&coordinator, &settings);

        // Real clock: the listing goes over a socket to the mock server
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let brightness = rx
                    .borrow_and_update()
                    .device("A")
                    .and_then(|device| device.properties.as_ref())
                    .and_then(|properties| properties.brightness);

                if brightness == Some(40) {
                    break;
                }

                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }
}
