use meshbus_core::config::BrokerConfig;
use rdkafka::config::ClientConfig;
use std::time::Duration;

/// Base rdkafka configuration shared by producers, consumers and admin
/// clients: bootstrap servers, client id and security settings.
#[must_use]
pub fn client_config(broker: &BrokerConfig) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &broker.brokers)
        .set("client.id", &broker.client_id)
        .set("security.protocol", broker.security_protocol.as_str());

    if let Some(sasl) = &broker.sasl {
        config
            .set("sasl.mechanism", &sasl.mechanism)
            .set("sasl.username", &sasl.username)
            .set("sasl.password", &sasl.password);
    }
    if let Some(ca) = &broker.ssl_ca_location {
        config.set("ssl.ca.location", ca);
    }
    config
}

/// Producer configuration: [`client_config`] plus acknowledgment mode and a
/// delivery timeout of `send_timeout`, so librdkafka gives up on a message
/// no later than the caller stops waiting for it.
#[must_use]
pub fn producer_config(broker: &BrokerConfig, acks: &str, send_timeout: Duration) -> ClientConfig {
    let mut config = client_config(broker);
    config
        .set("acks", acks)
        .set("message.timeout.ms", send_timeout.as_millis().max(1).to_string());
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbus_core::config::{SaslCredentials, SecurityProtocol};

    #[test]
    fn plaintext_config_has_no_credentials() {
        let config = client_config(&BrokerConfig::default());

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("security.protocol"), Some("PLAINTEXT"));
        assert_eq!(config.get("sasl.username"), None);
    }

    #[test]
    fn producer_delivery_timeout_follows_send_timeout() {
        let broker = BrokerConfig {
            send_timeout: Duration::from_millis(2500),
            ..BrokerConfig::default()
        };

        let config = producer_config(&broker, "1", broker.send_timeout);

        assert_eq!(config.get("acks"), Some("1"));
        assert_eq!(config.get("message.timeout.ms"), Some("2500"));
        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
    }

    #[test]
    fn sasl_credentials_are_applied() {
        let broker = BrokerConfig {
            security_protocol: SecurityProtocol::SaslSsl,
            sasl: Some(SaslCredentials {
                mechanism: "SCRAM-SHA-512".to_string(),
                username: "svc".to_string(),
                password: "secret".to_string(),
            }),
            ssl_ca_location: Some("/etc/ssl/ca.pem".to_string()),
            ..BrokerConfig::default()
        };

        let config = client_config(&broker);

        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(config.get("sasl.password"), Some("secret"));
        assert_eq!(config.get("ssl.ca.location"), Some("/etc/ssl/ca.pem"));
    }
}
