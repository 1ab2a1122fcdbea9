use anyhow::{Context, Result};
use exporter_core::Endpoint;
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:9328";
pub const DEFAULT_CLAMD_URL: &str = "tcp://127.0.0.1:3310";
pub const DEFAULT_ICAP_HOST: &str = "localhost";
pub const DEFAULT_ICAP_PORT: u16 = 1344;
pub const DEFAULT_ICAP_SERVICE: &str = "squidclamav?allow204=on&force=on&sizelimit=off&mode=simple";
const DEFAULT_PATH: &str = "clamav-exporter.yaml";

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
pub struct ClamdConfig {
    pub enable: Option<bool>,
    pub url: Option<String>,
}

impl ClamdConfig {
    pub fn enabled(&self) -> bool {
        self.enable.unwrap_or(false)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::parse(self.url.as_deref().unwrap_or(DEFAULT_CLAMD_URL))
    }
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
pub struct IcapConfig {
    pub enable: Option<bool>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub service: Option<String>,
}

impl IcapConfig {
    pub fn enabled(&self) -> bool {
        self.enable.unwrap_or(false)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::tcp(self.host.as_deref().unwrap_or(DEFAULT_ICAP_HOST), self.port.unwrap_or(DEFAULT_ICAP_PORT))
    }

    pub fn service(&self) -> &str {
        self.service.as_deref().unwrap_or(DEFAULT_ICAP_SERVICE)
    }
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
pub struct Config {
    pub listen: Option<String>,
    pub clamd: Option<ClamdConfig>,
    pub icap: Option<IcapConfig>,
}

impl Config {
    pub fn listen(&self) -> &str {
        self.listen.as_deref().unwrap_or(DEFAULT_LISTEN)
    }

    pub fn clamd(&self) -> ClamdConfig {
        self.clamd.clone().unwrap_or_default()
    }

    pub fn icap(&self) -> IcapConfig {
        self.icap.clone().unwrap_or_default()
    }
}

pub fn parse_config(s: &str) -> Result<Config> {
    // an empty document deserializes to unit, not a map
    if s.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(s)?)
}

/// Load `path`, or `./clamav-exporter.yaml` when no path is given and that file exists.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_PATH);
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("failed to open config {:?}", path))?;
    parse_config(&s).with_context(|| format!("failed to decode config {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use exporter_core::Scheme;

    #[test]
    fn defaults_when_empty() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.listen(), DEFAULT_LISTEN);
        assert!(!cfg.clamd().enabled());
        assert!(!cfg.icap().enabled());
        assert_eq!(cfg.clamd().endpoint().to_string(), DEFAULT_CLAMD_URL);
        assert_eq!(cfg.icap().endpoint().address(), "localhost:1344");
        assert_eq!(cfg.icap().service(), DEFAULT_ICAP_SERVICE);
    }

    #[test]
    fn full_document() {
        let cfg = parse_config(
            "listen: 127.0.0.1:9999\nclamd:\n  enable: true\n  url: unix:///run/clamav/clamd.ctl\nicap:\n  enable: true\n  host: icap.internal\n  port: 11344\n  service: avscan\n",
        )
        .unwrap();
        assert_eq!(cfg.listen(), "127.0.0.1:9999");
        let clamd = cfg.clamd();
        assert!(clamd.enabled());
        assert_eq!(clamd.endpoint().scheme(), Scheme::Unix);
        assert_eq!(clamd.endpoint().address(), "/run/clamav/clamd.ctl");
        let icap = cfg.icap();
        assert!(icap.enabled());
        assert_eq!(icap.endpoint().address(), "icap.internal:11344");
        assert_eq!(icap.service(), "avscan");
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(parse_config("clamd: [1, 2").is_err());
        assert!(parse_config("icap:\n  port: not-a-port\n").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let missing = std::env::temp_dir().join("clamav-exporter-does-not-exist.yaml");
        assert!(load_config(Some(&missing)).is_err());
    }
}
