use rumqttc::{MqttOptions, Transport};
use rustls::{ClientConfig, RootCertStore};
use std::time::Duration;

const MQTT_TLS_PORT: u16 = 8883;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const REQUESTS_CAP: usize = 10;

/// Construct the `MqttOptions` for connecting to an Azure MQTT endpoint over TLS, authenticating
/// with a shared access signature as the password.
pub fn get_mqtt_options(
    client_id: &str,
    host: &str,
    username: String,
    sas_token: String,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, host, MQTT_TLS_PORT);
    mqtt_options.set_keep_alive(KEEP_ALIVE);
    mqtt_options.set_credentials(username, sas_token);
    mqtt_options.set_transport(tls_transport());
    mqtt_options
}

fn tls_transport() -> Transport {
    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    for e in &native_certs.errors {
        log::warn!("Error loading platform certificates: {}", e);
    }
    let (added, ignored) = root_store.add_parsable_certificates(native_certs.certs);
    log::debug!("Loaded {} platform certificates ({} ignored)", added, ignored);
    let client_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Transport::tls_with_config(client_config.into())
}
