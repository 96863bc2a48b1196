use crate::error::ConfigError;

pub const DEFAULT_DEVICE_ID: &str = "VIRTUAL_FOT_DEVICE";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 1883;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Where and as whom the device connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerSettings {
    host: String,
    port: u16,
    device_id: String,
    credentials: Option<Credentials>,
}

impl BrokerSettings {
    pub fn builder() -> BrokerSettingsBuilder {
        BrokerSettingsBuilder::default()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// `host:port`
    pub fn uri(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Default, Clone)]
pub struct BrokerSettingsBuilder {
    device_id: Option<String>,
    host: Option<String>,
    port: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl BrokerSettingsBuilder {
    /// The first non-empty id wins, later calls are ignored.
    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        if self.device_id.is_none() && !device_id.is_empty() {
            self.device_id = Some(device_id);
        }
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn build(self) -> Result<BrokerSettings, ConfigError> {
        let host = match self.host.as_deref().map(strip_scheme) {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => DEFAULT_HOST.to_string(),
        };

        let port = match self.port.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_PORT,
            Some(port) => port
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port.to_string()))?,
        };

        let credentials = self
            .username
            .filter(|username| !username.is_empty())
            .map(|username| Credentials {
                username,
                password: self.password.unwrap_or_default(),
            });

        Ok(BrokerSettings {
            host,
            port,
            device_id: self
                .device_id
                .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
            credentials,
        })
    }
}

/// Drops a `tcp://`, `udp://` or any other `<scheme>://` prefix.
fn strip_scheme(host: &str) -> &str {
    let host = host.trim();
    match host.find("://") {
        Some(index) => &host[index + 3..],
        None => host,
    }
}
