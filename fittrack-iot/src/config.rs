use eyre::{bail, Report};
use fittrack::FITTRACK_NAME;
use serde::{Deserialize as _, Deserializer};
use serde_derive::Deserialize;
use stable_eyre::eyre::WrapErr;
use std::fs::read_to_string;
use std::time::Duration;

const DEFAULT_PROVISIONING_HOST: &str = "global.azure-devices-provisioning.net";
const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const CONFIG_FILENAME: &str = "fittrack-iot.toml";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bluetooth: BluetoothConfig,
    pub iot_central: IotCentralConfig,
}

impl Config {
    pub fn from_file() -> Result<Config, Report> {
        Config::read(CONFIG_FILENAME)
    }

    fn read(filename: &str) -> Result<Config, Report> {
        let config_file =
            read_to_string(filename).wrap_err_with(|| format!("Reading {filename}"))?;
        Config::parse(&config_file).wrap_err_with(|| format!("Parsing {filename}"))
    }

    fn parse(config_file: &str) -> Result<Config, Report> {
        let config: Config = toml::from_str(config_file)?;
        if config.bluetooth.scan_interval.is_zero() {
            bail!("bluetooth.scan_interval_seconds must be greater than zero");
        }
        if config.iot_central.token_ttl.is_zero() {
            bail!("iot_central.token_ttl_seconds must be greater than zero");
        }
        Ok(config)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BluetoothConfig {
    /// The advertised name of the tracker to connect to.
    pub peripheral_name: String,
    /// How often to check the list of discovered devices while scanning.
    #[serde(
        deserialize_with = "de_duration_seconds",
        rename = "scan_interval_seconds"
    )]
    pub scan_interval: Duration,
}

impl Default for BluetoothConfig {
    fn default() -> BluetoothConfig {
        BluetoothConfig {
            peripheral_name: FITTRACK_NAME.to_owned(),
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IotCentralConfig {
    /// The ID scope of the IoT Central application's device provisioning service.
    pub id_scope: String,
    pub device_id: String,
    /// The device's primary or secondary symmetric key, base64 encoded.
    pub key: String,
    pub provisioning_host: String,
    /// If this is set then provisioning is skipped, and the device connects straight to this IoT
    /// Hub.
    pub assigned_hub: Option<String>,
    /// How long the shared access signatures used to authenticate should be valid for.
    #[serde(
        deserialize_with = "de_duration_seconds",
        rename = "token_ttl_seconds"
    )]
    pub token_ttl: Duration,
}

impl Default for IotCentralConfig {
    fn default() -> IotCentralConfig {
        IotCentralConfig {
            id_scope: String::new(),
            device_id: String::new(),
            key: String::new(),
            provisioning_host: DEFAULT_PROVISIONING_HOST.to_owned(),
            assigned_hub: None,
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }
}

pub fn de_duration_seconds<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let seconds = u64::deserialize(d)?;
    Ok(Duration::from_secs(seconds))
}
