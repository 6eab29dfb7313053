use anyhow::Result;
use courier_config::KafkaConfig;
use rdkafka::config::ClientConfig;
use tracing::info;

/// Creates a new `rdkafka::config::ClientConfig` from the application's `KafkaConfig`.
///
/// Shared by the transactional producers, the relay consumers and the admin
/// client so that all of them connect with the same security settings.
///
/// It handles:
/// - Setting up bootstrap servers.
/// - Enabling SSL/TLS if `ssl_enabled` is true.
/// - Configuring SASL authentication if a mechanism, username and password are provided.
pub fn create_client_config(config: &KafkaConfig) -> Result<ClientConfig> {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.brokers);

    // Default to plaintext if SSL is not explicitly enabled and no SASL.
    client_config.set("security.protocol", "plaintext");

    if config.ssl_enabled {
        info!("Enabling SSL/TLS for Kafka connection");
        client_config.set("security.protocol", "ssl");
    }

    if let Some(ca_location) = &config.ssl_ca_location {
        client_config.set("ssl.ca.location", ca_location);
    }

    if let (Some(mechanism), Some(username), Some(password)) = (
        &config.sasl_mechanism,
        &config.sasl_username,
        &config.sasl_password,
    ) {
        info!(sasl_mechanism = %mechanism, "Configuring SASL authentication");
        client_config
            .set("sasl.mechanism", mechanism)
            .set("sasl.username", username)
            .set("sasl.password", password);

        if config.ssl_enabled {
            client_config.set("security.protocol", "sasl_ssl");
        } else {
            client_config.set("security.protocol", "sasl_plaintext");
        }
    }

    Ok(client_config)
}
