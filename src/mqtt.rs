// Broker connection settings. `rumqttc` does the protocol and TLS work; this
// only maps our `MqttConfig` onto `MqttOptions`.
use log::{info, warn};
use rumqttc::{MqttOptions, QoS, Transport};
use std::time::Duration;

use crate::config::MqttConfig;

pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut mqttoptions = MqttOptions::new(&config.client_id, &config.host, config.port);
    mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

    if config.tls {
        // Server certificate is checked against the platform's root store.
        mqttoptions.set_transport(Transport::tls_with_default_config());
    }
    info!(
        "Connecting to MQTT broker at {}:{} (tls: {})",
        config.host, config.port, config.tls
    );

    match (&config.username, &config.password) {
        (Some(user), Some(pass)) => {
            mqttoptions.set_credentials(user, pass);
            info!("Using MQTT credentials for user {}", user);
        }
        (Some(_), None) | (None, Some(_)) => {
            // Warn but continue without credentials if only one is set.
            warn!(
                "MQTT credentials incomplete: both username and password must be set to enable auth"
            );
        }
        (None, None) => {
            info!("No MQTT credentials provided; connecting without authentication");
        }
    }

    mqttoptions
}

pub fn qos(level: u8) -> anyhow::Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(anyhow::anyhow!("invalid QoS level {}, expected 0, 1 or 2", other)),
    }
}
