use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use failure::Error;

use errors::ConfigError;

/// How the connection to the directory server is carried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TransportMode {
    /// LDAP over plain TCP.
    Plaintext,
    /// LDAP over TLS from the first byte (LDAPS).
    Encrypted,
}

impl Default for TransportMode {
    fn default() -> Self {
        TransportMode::Plaintext
    }
}

impl TransportMode {
    pub fn default_port(self) -> u16 {
        match self {
            TransportMode::Plaintext => 389,
            TransportMode::Encrypted => 636,
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            TransportMode::Plaintext => "ldap",
            TransportMode::Encrypted => "ldaps",
        }
    }

    pub fn plugin_name(self) -> &'static str {
        match self {
            TransportMode::Plaintext => "LDAP",
            TransportMode::Encrypted => "LDAPS",
        }
    }
}

/// Target and transport settings of one relay client.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RelayConfig {
    pub host: String,
    /// Falls back to the default port of `mode` when unset.
    pub port: Option<u16>,
    pub mode: TransportMode,
    /// Clear `NTLMSSP_NEGOTIATE_SIGN` from relayed negotiate messages.
    ///
    /// Servers enforcing LDAP signing reject the relayed bind either way.
    pub strip_signing: bool,
    pub connect_timeout_ms: Option<u64>,
    /// Read and write timeout of the socket.
    pub io_timeout_ms: Option<u64>,
    /// Validate the server certificate and host name in encrypted mode.
    pub verify_certificate: bool,
}

impl RelayConfig {
    pub fn new<S: Into<String>>(host: S, mode: TransportMode) -> Self {
        RelayConfig {
            host: host.into(),
            mode,
            ..Default::default()
        }
    }

    pub fn ldap<S: Into<String>>(host: S) -> Self {
        RelayConfig::new(host, TransportMode::Plaintext)
    }

    pub fn ldaps<S: Into<String>>(host: S) -> Self {
        RelayConfig::new(host, TransportMode::Encrypted)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.mode.default_port())
    }

    pub fn url(&self) -> String {
        if self.host.contains(':') {
            format!("{}://[{}]:{}", self.mode.scheme(), self.host, self.port())
        } else {
            format!("{}://{}:{}", self.mode.scheme(), self.host, self.port())
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }
}

impl fmt::Display for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

impl FromStr for RelayConfig {
    type Err = Error;

    /// Parses `ldap://host[:port]`, `ldaps://host[:port]` or a bare host.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mode, target) = if let Some(idx) = s.find("://") {
            let mode = match s[..idx].to_lowercase().as_str() {
                "ldap" => TransportMode::Plaintext,
                "ldaps" => TransportMode::Encrypted,
                scheme => return Err(ConfigError::UnsupportedScheme(scheme.to_owned()).into()),
            };

            (mode, &s[idx + 3..])
        } else {
            (TransportMode::Plaintext, s)
        };

        let target = target.split('/').next().unwrap_or_default();

        let (host, port) = if target.starts_with('[') {
            let end = target
                .find(']')
                .ok_or_else(|| ConfigError::InvalidHost(target.to_owned()))?;

            (&target[1..end], target[end + 1..].trim_start_matches(':'))
        } else if let Some(idx) = target.rfind(':') {
            (&target[..idx], &target[idx + 1..])
        } else {
            (target, "")
        };

        // IPv6 literals must be bracketed
        if host.is_empty() || (host.contains(':') && !target.starts_with('[')) {
            return Err(ConfigError::InvalidHost(s.to_owned()).into());
        }

        let mut config = RelayConfig::new(host, mode);

        if !port.is_empty() {
            config.port = Some(port
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port.to_owned()))?);
        }

        Ok(config)
    }
}
