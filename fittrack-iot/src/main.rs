mod bluez;
mod config;
mod hub;
mod mqtt;
mod provisioning;
mod sas;

use crate::bluez::BluezAdapter;
use crate::config::{Config, IotCentralConfig};
use crate::hub::IotHubClient;
use bluez_async::BluetoothSession;
use eyre::Report;
use fittrack::{ActivityBridge, BoxError};
use futures::TryFutureExt;
use stable_eyre::eyre;
use stable_eyre::eyre::WrapErr;
use tokio::{signal, try_join};

#[tokio::main]
async fn main() -> Result<(), Report> {
    stable_eyre::install()?;
    pretty_env_logger::init();
    color_backtrace::install();

    let config = Config::from_file()?;

    // Connect a Bluetooth session.
    let (dbus_handle, session) = BluetoothSession::new().await?;
    let adapter = BluezAdapter::new(session);
    let events = adapter
        .event_stream(config.bluetooth.scan_interval)
        .await
        .wrap_err("Subscribing to Bluetooth events")?;

    let (bridge, bridge_handle) =
        ActivityBridge::new(adapter, &config.bluetooth.peripheral_name);
    let bridge_task = bridge.run(events, establish_session(config.iot_central));

    let shutdown = async {
        signal::ctrl_c().await?;
        log::info!("Stopping");
        bridge_handle.stop().await?;
        Ok::<_, Report>(())
    };

    tokio::select! {
        // If this ever finishes, we lost connection to D-Bus.
        res = dbus_handle => {
            res?;
            Err(eyre::eyre!("Lost connection to D-Bus"))
        }
        // The bridge only finishes cleanly once it has been stopped.
        res = async { try_join!(bridge_task.err_into::<Report>(), shutdown) } => {
            res?;
            Ok(())
        }
    }
}

/// Find out which IoT Hub to use, then connect to it.
async fn establish_session(config: IotCentralConfig) -> Result<IotHubClient, BoxError> {
    let (hub, device_id) = match &config.assigned_hub {
        Some(hub) => (hub.to_owned(), config.device_id.to_owned()),
        None => {
            let registration = provisioning::register(&config).await?;
            log::info!(
                "Device {} assigned to {}",
                registration.device_id,
                registration.assigned_hub
            );
            (registration.assigned_hub, registration.device_id)
        }
    };
    Ok(IotHubClient::connect(&hub, &device_id, &config.key, config.token_ttl).await?)
}
