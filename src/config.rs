use crate::ipfix::Transport;
use crate::record::RecordDescriptor;
use anyhow::Context;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;

fn default_flow_export_interval() -> u64 {
    5
}

fn default_topology_export_interval() -> u64 {
    20
}

fn default_stats_interval() -> u64 {
    10
}

fn default_export_timeout() -> u64 {
    30
}

fn default_max_flow_lifetime() -> u64 {
    300
}

fn default_olsr_port() -> u16 {
    698
}

#[derive(Debug, Deserialize)]
pub struct CollectorConfig {
    pub ip: IpAddr,
    pub port: u16,
    pub transport: Transport,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub observation_domain_id: u32,
    /// Record export interval in seconds.
    pub interval: u64,
    pub interfaces: Vec<String>,
    pub collectors: Vec<CollectorConfig>,

    #[serde(default)]
    pub records: Vec<RecordDescriptor>,

    #[serde(default)]
    pub xmlfile: Option<String>,
    #[serde(default)]
    pub xmlpostprocessing: Option<String>,

    #[serde(default)]
    pub compression_method: Option<String>,
    #[serde(default)]
    pub compression_method_params: Option<String>,

    #[serde(default)]
    pub anonymization_key: Option<String>,
    #[serde(default)]
    pub anonymization_pad: Option<String>,

    #[serde(default = "default_flow_export_interval")]
    pub flow_export_interval: u64,
    #[serde(default = "default_topology_export_interval")]
    pub topology_export_interval: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
    #[serde(default = "default_export_timeout")]
    pub export_timeout: u64,
    #[serde(default = "default_max_flow_lifetime")]
    pub max_flow_lifetime: u64,
    #[serde(default = "default_olsr_port")]
    pub olsr_port: u16,
}

/// CryptoPAn key material is a 16 byte key plus a 16 byte pad.
const ANONYMIZATION_KEY_LEN: usize = 16;

fn validate(conf: &Config) -> anyhow::Result<()> {
    if conf.interfaces.is_empty() {
        anyhow::bail!("configuration declares no capture interfaces");
    }
    if conf.interval == 0 {
        anyhow::bail!("record export interval must be non-zero");
    }

    for (name, value) in [
        ("anonymization_key", &conf.anonymization_key),
        ("anonymization_pad", &conf.anonymization_pad),
    ] {
        if let Some(value) = value {
            if value.len() != ANONYMIZATION_KEY_LEN {
                anyhow::bail!(
                    "{} must be exactly {} bytes, got {}",
                    name,
                    ANONYMIZATION_KEY_LEN,
                    value.len()
                );
            }
        }
    }
    if conf.anonymization_key.is_some() || conf.anonymization_pad.is_some() {
        tracing::warn!("anonymization keys configured but anonymization is not compiled in");
    }

    Ok(())
}

pub fn read_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    let conf: Config = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse configuration file {}", path.display()))?;

    validate(&conf)?;
    Ok(conf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "observation_domain_id": 42,
        "interval": 60,
        "interfaces": ["wlan0", "eth0"],
        "collectors": [{"ip": "10.0.0.1", "port": 4739, "transport": "udp"}]
    }"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let conf: Config = serde_json::from_str(MINIMAL).unwrap();
        assert_eq!(conf.observation_domain_id, 42);
        assert_eq!(conf.interfaces.len(), 2);
        assert_eq!(conf.flow_export_interval, 5);
        assert_eq!(conf.topology_export_interval, 20);
        assert_eq!(conf.stats_interval, 10);
        assert_eq!(conf.export_timeout, 30);
        assert_eq!(conf.max_flow_lifetime, 300);
        assert_eq!(conf.olsr_port, 698);
        assert!(conf.xmlfile.is_none());
        assert!(conf.records.is_empty());
    }

    #[test]
    fn collector_transport_is_parsed() {
        let conf: Config = serde_json::from_str(MINIMAL).unwrap();
        assert_eq!(conf.collectors[0].transport, Transport::Udp);
        assert_eq!(conf.collectors[0].port, 4739);
    }

    #[test]
    fn unknown_transport_is_rejected() {
        let raw = MINIMAL.replace("udp", "carrier-pigeon");
        assert!(serde_json::from_str::<Config>(&raw).is_err());
    }

    fn with_anonymization(key: &str, pad: &str) -> Config {
        let raw = MINIMAL.replace(
            "\"interval\": 60,",
            &format!(
                "\"interval\": 60, \"anonymization_key\": \"{}\", \"anonymization_pad\": \"{}\",",
                key, pad
            ),
        );
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn anonymization_material_must_be_sixteen_bytes() {
        let conf = with_anonymization("0123456789abcdef", "fedcba9876543210");
        assert!(validate(&conf).is_ok());

        let conf = with_anonymization("too-short", "fedcba9876543210");
        assert!(validate(&conf).is_err());

        let conf = with_anonymization("0123456789abcdef", "a-pad-that-is-way-too-long");
        assert!(validate(&conf).is_err());
    }

    #[test]
    fn empty_interface_list_is_rejected() {
        let raw = MINIMAL.replace("[\"wlan0\", \"eth0\"]", "[]");
        let conf: Config = serde_json::from_str(&raw).unwrap();
        assert!(validate(&conf).is_err());
    }
}
