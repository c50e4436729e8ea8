use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Duration;
use serde::{Deserialize, Deserializer, Serialize};

const DEFAULT_REQUEST_TIMEOUT_SECS: i64 = 30;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListenSettings {
    /// The TLS key material presented by the HTTPS listener to intercepted clients
    pub tls_privkey: Option<PathBuf>,
    pub tls_chain: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct UpstreamSettings {
    /// Extra trust anchors for outbound TLS, on top of the webpki roots
    pub cacert_file: Option<PathBuf>,
}

#[serde_with::serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    pub socks_host: IpAddr,
    /// A missing or non-integer port leaves the front-end disabled.
    #[serde(deserialize_with = "lenient_port")]
    pub socks_port: Option<u16>,

    pub http_host: IpAddr,
    #[serde(deserialize_with = "lenient_port")]
    pub http_port: Option<u16>,

    pub https_host: IpAddr,
    #[serde(deserialize_with = "lenient_port")]
    pub https_port: Option<u16>,

    /// Settings for the HTTPS / HTTP2 internal listener
    pub https: ListenSettings,
    /// Settings for connecting to the real targets.
    pub upstream: UpstreamSettings,

    /// Relay lifecycle diagnostics on the `socks` target
    pub socks_log: bool,
    /// Request diagnostics on the `http` target
    pub http_log: bool,

    /// Global generic options for proxying
    #[serde_as(as = "serde_with::DurationSeconds<i64>")]
    pub request_timeout: Duration,
    pub tcp_nodelay: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Settings {
            socks_host: localhost,
            socks_port: None,
            http_host: localhost,
            http_port: None,
            https_host: localhost,
            https_port: None,
            https: ListenSettings::default(),
            upstream: UpstreamSettings::default(),
            socks_log: false,
            http_log: false,
            request_timeout: Duration::seconds(DEFAULT_REQUEST_TIMEOUT_SECS),
            tcp_nodelay: false,
        }
    }
}

impl Settings {
    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.socks_port.map(|port| SocketAddr::new(self.socks_host, port))
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_port.map(|port| SocketAddr::new(self.http_host, port))
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https_port.map(|port| SocketAddr::new(self.https_host, port))
    }

    /// Negative or out of range timeouts fall back to the default.
    pub fn request_timeout_std(&self) -> std::time::Duration {
        self.request_timeout
            .to_std()
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(std::time::Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS as u64))
    }
}

fn lenient_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(i64),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Port::deserialize(deserializer)? {
        Port::Number(port) => u16::try_from(port).ok(),
        Port::Other(_) => None,
    })
}

pub fn init<P: AsRef<Path>>(path: P) -> anyhow::Result<Settings> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    Settings::from_toml(&raw).with_context(|| format!("Failed to parse config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.http_host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(settings.socks_port, None);
        assert_eq!(settings.request_timeout_std(), std::time::Duration::from_secs(30));
        assert!(!settings.http_log);
    }

    #[test]
    fn test_full_config() {
        let settings = Settings::from_toml(
            r#"
            socks-host = "0.0.0.0"
            socks-port = 1080
            http-port = 0
            https-port = 8443
            socks-log = true
            request-timeout = 5
            tcp-nodelay = true

            [https]
            tls-chain = "/etc/itm/chain.pem"
            tls-privkey = "/etc/itm/key.pem"

            [upstream]
            cacert-file = "/etc/itm/ca.pem"
            "#,
        )
        .unwrap();

        assert_eq!(settings.socks_addr(), Some("0.0.0.0:1080".parse().unwrap()));
        assert_eq!(settings.http_addr(), Some("127.0.0.1:0".parse().unwrap()));
        assert_eq!(settings.https_port, Some(8443));
        assert_eq!(settings.https.tls_chain.as_deref(), Some(Path::new("/etc/itm/chain.pem")));
        assert!(settings.upstream.cacert_file.is_some());
        assert!(settings.socks_log && settings.tcp_nodelay);
        assert_eq!(settings.request_timeout_std(), std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_non_integer_ports_disable_listeners() {
        let settings = Settings::from_toml(
            r#"
            socks-port = "1080"
            http-port = 70000
            https-port = -1
            "#,
        )
        .unwrap();

        assert_eq!(settings.socks_port, None);
        assert_eq!(settings.http_port, None);
        assert_eq!(settings.https_port, None);
    }
}
