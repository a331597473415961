//! MQTT endpoint parsing and TLS material loading.
//!
//! Mirrors Home Assistant's MQTT TLS options: an optional CA (system roots
//! otherwise) and an optional client certificate/key pair for mutual TLS.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;

/// PEM material for an `mqtts://` connection.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// CA certificate. `None` uses the bundled web PKI roots.
    pub ca: Option<Vec<u8>>,
    /// Client certificate and key, always together.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!(
                        "failed to read MQTT TLS client cert '{}'",
                        cert_path.display()
                    )
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read MQTT TLS client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(anyhow!("MQTT TLS client certificate provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("MQTT TLS client key provided without certificate"))
            }
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }

    /// rumqttc transport for `endpoint`.
    pub fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if self.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS materials provided but the broker address is not mqtts://"
                ));
            }
            return Ok(Transport::tcp());
        }
        if !self.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }
        let ca = self.ca.clone().ok_or_else(|| {
            anyhow!("MQTT TLS CA certificate is required when providing client certificates")
        })?;
        Ok(Transport::tls(ca, self.client_auth.clone(), None))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse a broker address.
///
/// Accepts `host:port`, `[v6]:port`, `mqtt://`/`tcp://` (plain) and
/// `mqtts://`/`ssl://` (TLS). A bare host gets 1883, or 8883 with TLS.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }
    if remainder.is_empty() {
        return Err(anyhow!("empty MQTT broker address"));
    }

    let default_port = if use_tls { 8883 } else { 1883 };
    let (host, port) = split_host_port(remainder, default_port)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    // IPv6 addresses in brackets: [::1]:1883
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port
                .parse()
                .with_context(|| format!("invalid MQTT port in {}", addr))?,
            None if rest.is_empty() => default_port,
            None => return Err(anyhow!("invalid MQTT address: {}", addr)),
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid MQTT port in {}", addr))?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_schemes_and_ports() {
        let plain = parse_mqtt_endpoint("mqtt://broker.local:1884").unwrap();
        assert_eq!(plain.host, "broker.local");
        assert_eq!(plain.port, 1884);
        assert!(!plain.use_tls);

        let tls = parse_mqtt_endpoint("mqtts://homeassistant.local").unwrap();
        assert_eq!(tls.port, 8883);
        assert!(tls.use_tls);

        let v6 = parse_mqtt_endpoint("[::1]:1883").unwrap();
        assert_eq!(v6.host, "::1");

        assert_eq!(parse_mqtt_endpoint("localhost").unwrap().port, 1883);
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(parse_mqtt_endpoint("ws://broker:80").is_err());
        assert!(parse_mqtt_endpoint("broker:notaport").is_err());
        assert!(parse_mqtt_endpoint("mqtt://").is_err());
    }

    #[test]
    fn client_cert_requires_key() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(b"-----BEGIN CERTIFICATE-----").unwrap();
        let err = TlsMaterials::load(None, Some(cert.path()), None).unwrap_err();
        assert!(err.to_string().contains("without key"));
    }

    #[test]
    fn plain_endpoint_refuses_tls_materials() {
        let materials = TlsMaterials {
            ca: Some(b"ca".to_vec()),
            client_auth: None,
        };
        let endpoint = parse_mqtt_endpoint("broker:1883").unwrap();
        assert!(materials.build_transport(&endpoint).is_err());
        assert!(TlsMaterials::default().build_transport(&endpoint).is_ok());
    }
}
