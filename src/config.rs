//! Declarative gateway configuration.
//!
//! The runtime consumes a small document listing gateways: name, protocol,
//! transport, optional password, option overrides and capability names.
//! A TOML file and `OPENNETTY_`-prefixed environment variables merge, the
//! environment winning. The richer catalogue the document may carry
//! (devices, scenarios) belongs to the external importer and is ignored
//! here.

use std::{sync::Arc, time::Duration};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_serial::{DataBits, Parity, StopBits};

use crate::{
    gateway::{Gateway, GatewayCapabilities, GatewayOptions, Transport},
    message::Protocol,
    retry::RetryOptions,
};

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "OPENNETTY_";

/// Errors raised while loading or interpreting the document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document could not be read or deserialised.
    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),
    /// A capability name is not one the runtime recognises.
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),
    /// A serial transport knob is out of range.
    #[error("invalid serial setting: {0}")]
    InvalidSerial(&'static str),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self { Self::Figment(Box::new(err)) }
}

/// The root of the configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Declared gateways.
    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,
}

/// One gateway declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Unique gateway name.
    pub name: String,
    /// Physical-layer family.
    pub protocol: Protocol,
    /// How to reach the gateway.
    pub transport: TransportConfig,
    /// Authentication password, when the gateway demands one.
    #[serde(default)]
    pub password: Option<String>,
    /// Capability names, `OpenWebNetCommandSession` style.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Option overrides; omitted fields keep their defaults.
    #[serde(default)]
    pub options: OptionsConfig,
}

/// Transport declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// TCP endpoint.
    Tcp {
        /// Host name or address.
        host: String,
        /// Application port.
        port: u16,
    },
    /// Serial port.
    Serial {
        /// Device path.
        path: String,
        /// Line speed in baud.
        baud_rate: u32,
        /// `none`, `odd` or `even`; defaults to `none`.
        #[serde(default)]
        parity: Option<String>,
        /// 5–8; defaults to 8.
        #[serde(default)]
        data_bits: Option<u8>,
        /// 1 or 2; defaults to 1.
        #[serde(default)]
        stop_bits: Option<u8>,
    },
}

/// Millisecond-granularity option overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptionsConfig {
    /// `frame_ack_timeout` in milliseconds.
    pub frame_ack_timeout_ms: Option<u64>,
    /// `action_validation_timeout` in milliseconds.
    pub action_validation_timeout_ms: Option<u64>,
    /// `connection_negotiation_timeout` in milliseconds.
    pub connection_negotiation_timeout_ms: Option<u64>,
    /// `unique_status_reply_timeout` in milliseconds.
    pub unique_status_reply_timeout_ms: Option<u64>,
    /// `unique_dimension_reply_timeout` in milliseconds.
    pub unique_dimension_reply_timeout_ms: Option<u64>,
    /// `multiple_status_reply_timeout` in milliseconds.
    pub multiple_status_reply_timeout_ms: Option<u64>,
    /// `multiple_dimension_reply_timeout` in milliseconds.
    pub multiple_dimension_reply_timeout_ms: Option<u64>,
    /// `outgoing_message_processing_timeout` in milliseconds.
    pub outgoing_message_processing_timeout_ms: Option<u64>,
    /// `post_send_delay` in milliseconds.
    pub post_send_delay_ms: Option<u64>,
    /// Generic-session supervision mode.
    pub supervision: Option<bool>,
    /// Retry attempt budget.
    pub retry_max_attempts: Option<u32>,
    /// Retry delay in milliseconds.
    pub retry_delay_ms: Option<u64>,
    /// Exponential retry backoff.
    pub retry_exponential: Option<bool>,
}

impl Settings {
    /// Load from `path`, with `OPENNETTY_` environment overrides
    /// (`__`-separated nesting).
    ///
    /// # Errors
    /// [`ConfigError::Figment`] when the document cannot be read.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Ok(Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Materialise the declared gateways.
    ///
    /// # Errors
    /// [`ConfigError`] for unknown capability names or serial knobs.
    pub fn gateways(&self) -> Result<Vec<Arc<Gateway>>, ConfigError> {
        self.gateways.iter().map(GatewayConfig::build).collect()
    }
}

impl GatewayConfig {
    fn build(&self) -> Result<Arc<Gateway>, ConfigError> {
        let transport = self.transport.build()?;
        let mut gateway = Gateway::new(self.name.clone(), self.protocol, transport)
            .with_options(self.options.build())
            .with_capabilities(parse_capabilities(&self.capabilities)?);
        if let Some(password) = &self.password {
            gateway = gateway.with_password(password.clone());
        }
        Ok(Arc::new(gateway))
    }
}

impl TransportConfig {
    fn build(&self) -> Result<Transport, ConfigError> {
        match self {
            Self::Tcp { host, port } => Ok(Transport::Tcp {
                host: host.clone(),
                port: *port,
            }),
            Self::Serial {
                path,
                baud_rate,
                parity,
                data_bits,
                stop_bits,
            } => Ok(Transport::Serial {
                path: path.clone(),
                baud_rate: *baud_rate,
                parity: parse_parity(parity.as_deref())?,
                data_bits: parse_data_bits(*data_bits)?,
                stop_bits: parse_stop_bits(*stop_bits)?,
            }),
        }
    }
}

impl OptionsConfig {
    fn build(&self) -> GatewayOptions {
        let defaults = GatewayOptions::default();
        let ms = Duration::from_millis;
        let pick = |value: Option<u64>, fallback: Duration| value.map_or(fallback, ms);
        GatewayOptions {
            frame_ack_timeout: pick(self.frame_ack_timeout_ms, defaults.frame_ack_timeout),
            action_validation_timeout: pick(
                self.action_validation_timeout_ms,
                defaults.action_validation_timeout,
            ),
            connection_negotiation_timeout: pick(
                self.connection_negotiation_timeout_ms,
                defaults.connection_negotiation_timeout,
            ),
            unique_status_reply_timeout: pick(
                self.unique_status_reply_timeout_ms,
                defaults.unique_status_reply_timeout,
            ),
            unique_dimension_reply_timeout: pick(
                self.unique_dimension_reply_timeout_ms,
                defaults.unique_dimension_reply_timeout,
            ),
            multiple_status_reply_timeout: pick(
                self.multiple_status_reply_timeout_ms,
                defaults.multiple_status_reply_timeout,
            ),
            multiple_dimension_reply_timeout: pick(
                self.multiple_dimension_reply_timeout_ms,
                defaults.multiple_dimension_reply_timeout,
            ),
            outgoing_message_processing_timeout: pick(
                self.outgoing_message_processing_timeout_ms,
                defaults.outgoing_message_processing_timeout,
            ),
            post_send_delay: pick(self.post_send_delay_ms, defaults.post_send_delay),
            supervision: self.supervision.unwrap_or(defaults.supervision),
            retry: RetryOptions {
                max_attempts: self
                    .retry_max_attempts
                    .unwrap_or(defaults.retry.max_attempts),
                delay: pick(self.retry_delay_ms, defaults.retry.delay),
                exponential: self
                    .retry_exponential
                    .unwrap_or(defaults.retry.exponential),
                retryable: defaults.retry.retryable,
            },
        }
    }
}

fn parse_capabilities(names: &[String]) -> Result<GatewayCapabilities, ConfigError> {
    let mut capabilities = GatewayCapabilities::OPENWEBNET_GATEWAY;
    for name in names {
        capabilities |= match name.as_str() {
            "OpenWebNetGateway" => GatewayCapabilities::OPENWEBNET_GATEWAY,
            "OpenWebNetCommandSession" => GatewayCapabilities::COMMAND_SESSION,
            "OpenWebNetGenericSession" => GatewayCapabilities::GENERIC_SESSION,
            "OpenWebNetEventSession" => GatewayCapabilities::EVENT_SESSION,
            other => return Err(ConfigError::UnknownCapability(other.to_owned())),
        };
    }
    Ok(capabilities)
}

fn parse_parity(value: Option<&str>) -> Result<Parity, ConfigError> {
    match value {
        None | Some("none") => Ok(Parity::None),
        Some("odd") => Ok(Parity::Odd),
        Some("even") => Ok(Parity::Even),
        Some(_) => Err(ConfigError::InvalidSerial("parity must be none, odd or even")),
    }
}

fn parse_data_bits(value: Option<u8>) -> Result<DataBits, ConfigError> {
    match value {
        Some(5) => Ok(DataBits::Five),
        Some(6) => Ok(DataBits::Six),
        Some(7) => Ok(DataBits::Seven),
        None | Some(8) => Ok(DataBits::Eight),
        Some(_) => Err(ConfigError::InvalidSerial("data bits must be 5-8")),
    }
}

fn parse_stop_bits(value: Option<u8>) -> Result<StopBits, ConfigError> {
    match value {
        None | Some(1) => Ok(StopBits::One),
        Some(2) => Ok(StopBits::Two),
        Some(_) => Err(ConfigError::InvalidSerial("stop bits must be 1 or 2")),
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn loads_gateways_from_toml() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "opennetty.toml",
                r#"
                    [[gateways]]
                    name = "attic"
                    protocol = "scs"
                    password = "12345"
                    capabilities = ["OpenWebNetCommandSession", "OpenWebNetEventSession"]
                    transport = { kind = "tcp", host = "192.168.1.35", port = 20000 }

                    [gateways.options]
                    frame_ack_timeout_ms = 750
                    supervision = true

                    [[gateways]]
                    name = "meter"
                    protocol = "nitoo"
                    transport = { kind = "serial", path = "/dev/ttyUSB0", baud_rate = 19200 }
                "#,
            )?;
            let settings = Settings::from_file("opennetty.toml").expect("load");
            let gateways = settings.gateways().expect("materialise");
            assert_eq!(gateways.len(), 2);

            let attic = &gateways[0];
            assert_eq!(attic.name(), "attic");
            assert_eq!(attic.protocol(), Protocol::Scs);
            assert_eq!(attic.password(), Some("12345"));
            assert!(attic
                .capabilities()
                .contains(GatewayCapabilities::COMMAND_SESSION));
            assert_eq!(
                attic.options().frame_ack_timeout,
                Duration::from_millis(750)
            );
            assert!(attic.options().supervision);

            let meter = &gateways[1];
            assert!(matches!(
                meter.transport(),
                Transport::Serial {
                    parity: Parity::None,
                    data_bits: DataBits::Eight,
                    stop_bits: StopBits::One,
                    ..
                }
            ));
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_nothing_by_default() {
        Jail::expect_with(|jail| {
            jail.create_file("opennetty.toml", "")?;
            let settings = Settings::from_file("opennetty.toml").expect("load");
            assert!(settings.gateways.is_empty());
            Ok(())
        });
    }

    #[test]
    fn unknown_capability_is_rejected() {
        let config = GatewayConfig {
            name: "x".to_owned(),
            protocol: Protocol::Scs,
            transport: TransportConfig::Tcp {
                host: "localhost".to_owned(),
                port: 20000,
            },
            password: None,
            capabilities: vec!["Teleporter".to_owned()],
            options: OptionsConfig::default(),
        };
        let settings = Settings {
            gateways: vec![config],
        };
        assert!(matches!(
            settings.gateways(),
            Err(ConfigError::UnknownCapability(_))
        ));
    }
}
