use std::sync::Arc;

use color_eyre::Result;
use govee::gateway::Gateway;
use mqtt::events::start_mqtt_events_loop;
use mqtt::publish::start_state_publish_loop;
use protocols::https::mk_hyper_https_client;
use protocols::mqtt::mk_mqtt_client;
use sync::coordinator::SyncCoordinator;
use sync::scheduler::start_sync_loop;

use crate::api::start_api_server;
use crate::settings::read_settings;

mod api;
mod govee;
mod mqtt;
mod protocols;
mod settings;
mod sync;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let settings = read_settings()?;
    let https_client = mk_hyper_https_client(&settings.govee)?;
    let gateway = Gateway::new(&settings.govee, https_client);
    let coordinator = Arc::new(SyncCoordinator::new(gateway, &settings.sync));

    if let Some(api_settings) = &settings.api {
        start_api_server(api_settings, &coordinator)?;
    }

    let mqtt_client = mk_mqtt_client(&settings).await?;
    start_state_publish_loop(&mqtt_client, &settings, &coordinator);

    coordinator.refresh_devices(false).await;

    start_sync_loop(&coordinator, &settings.sync);
    start_mqtt_events_loop(&mqtt_client, &settings, &coordinator);

    tokio::signal::ctrl_c().await?;

    Ok(())
}
