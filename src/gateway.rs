//! Gateway descriptors: identity, transport, options bundle, capabilities.
//!
//! A [`Gateway`] is immutable after construction and shared as
//! `Arc<Gateway>` across the worker pool and service layer; configuration
//! reloads build new instances.

use std::time::Duration;

use bitflags::bitflags;
use tokio_serial::{DataBits, Parity, StopBits};

use crate::{message::Protocol, retry::RetryOptions};

bitflags! {
    /// Capability bits the runtime recognises on a gateway declaration.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct GatewayCapabilities: u8 {
        /// The endpoint speaks OpenWebNet at all.
        const OPENWEBNET_GATEWAY = 1 << 0;
        /// The gateway accepts command sessions (`*99*9##`).
        const COMMAND_SESSION = 1 << 1;
        /// The gateway accepts generic sessions.
        const GENERIC_SESSION = 1 << 2;
        /// The gateway accepts event sessions (`*99*1##`).
        const EVENT_SESSION = 1 << 3;
    }
}

bitflags! {
    /// Per-call transmission options.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TransmissionOptions: u8 {
        /// Execute at most one attempt regardless of the retry policy.
        const DISALLOW_RETRANSMISSIONS = 1 << 0;
        /// Wait for the end device's action validation frame (Nitoo
        /// unicast commands and dimension writes only).
        const REQUIRE_ACTION_VALIDATION = 1 << 1;
        /// Do not wait for the gateway's acknowledgement after writing.
        const DISABLE_ACKNOWLEDGEMENT_VALIDATION = 1 << 2;
    }
}

impl TransmissionOptions {
    /// Whether the sender should wait for an acknowledgement.
    #[must_use]
    pub const fn awaits_acknowledgement(self) -> bool {
        !self.contains(Self::DISABLE_ACKNOWLEDGEMENT_VALIDATION)
    }

    /// Whether the sender should wait for action validation.
    #[must_use]
    pub const fn awaits_action(self) -> bool {
        self.contains(Self::REQUIRE_ACTION_VALIDATION)
    }
}

/// How to reach a gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum Transport {
    /// A TCP endpoint.
    Tcp {
        /// Host name or address.
        host: String,
        /// Application port; gateway-specific, never assumed.
        port: u16,
    },
    /// A serial port.
    Serial {
        /// Device path, `/dev/ttyUSB0` style.
        path: String,
        /// Line speed in baud.
        baud_rate: u32,
        /// Parity bit handling.
        parity: Parity,
        /// Data bits per character.
        data_bits: DataBits,
        /// Stop bits per character.
        stop_bits: StopBits,
    },
}

/// Timeout bundle and tuning knobs, all independently configurable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOptions {
    /// Wait for ACK/NACK/BUSY after a write.
    pub frame_ack_timeout: Duration,
    /// Wait for the end device's action validation frame.
    pub action_validation_timeout: Duration,
    /// Budget for the whole session negotiation.
    pub connection_negotiation_timeout: Duration,
    /// Wait for the single reply to a status request.
    pub unique_status_reply_timeout: Duration,
    /// Wait for the single reply to a dimension request.
    pub unique_dimension_reply_timeout: Duration,
    /// Gap allowed between replies while enumerating statuses.
    pub multiple_status_reply_timeout: Duration,
    /// Gap allowed between replies while enumerating dimensions.
    pub multiple_dimension_reply_timeout: Duration,
    /// Wait for a worker to pick up a submitted message.
    pub outgoing_message_processing_timeout: Duration,
    /// Inter-frame silence enforced after a completed send.
    pub post_send_delay: Duration,
    /// Negotiate Generic sessions in supervision mode (`*13*66*##`).
    pub supervision: bool,
    /// Retry policy wrapped around outbound submissions.
    pub retry: RetryOptions,
}

impl Default for GatewayOptions {
    /// Defaults tuned for physical gateways: 1 s acknowledgement, 3 s
    /// action validation, 10 s negotiation, 2 s unique replies, 3 s
    /// enumeration gap, 1 s worker pickup, 25 ms inter-frame silence, no
    /// supervision, default retry policy.
    fn default() -> Self {
        Self {
            frame_ack_timeout: Duration::from_secs(1),
            action_validation_timeout: Duration::from_secs(3),
            connection_negotiation_timeout: Duration::from_secs(10),
            unique_status_reply_timeout: Duration::from_secs(2),
            unique_dimension_reply_timeout: Duration::from_secs(2),
            multiple_status_reply_timeout: Duration::from_secs(3),
            multiple_dimension_reply_timeout: Duration::from_secs(3),
            outgoing_message_processing_timeout: Duration::from_secs(1),
            post_send_delay: Duration::from_millis(25),
            supervision: false,
            retry: RetryOptions::default(),
        }
    }
}

/// One configured OpenWebNet gateway.
#[derive(Debug, Clone)]
pub struct Gateway {
    name: String,
    protocol: Protocol,
    transport: Transport,
    password: Option<String>,
    options: GatewayOptions,
    capabilities: GatewayCapabilities,
}

impl Gateway {
    /// Create a gateway with default options and the plain
    /// [`GatewayCapabilities::OPENWEBNET_GATEWAY`] capability.
    #[must_use]
    pub fn new(name: impl Into<String>, protocol: Protocol, transport: Transport) -> Self {
        Self {
            name: name.into(),
            protocol,
            transport,
            password: None,
            options: GatewayOptions::default(),
            capabilities: GatewayCapabilities::OPENWEBNET_GATEWAY,
        }
    }

    /// Attach the authentication password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Replace the options bundle.
    #[must_use]
    pub fn with_options(mut self, options: GatewayOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the capability set.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: GatewayCapabilities) -> Self {
        self.capabilities = capabilities | GatewayCapabilities::OPENWEBNET_GATEWAY;
        self
    }

    /// The configured name, unique among gateways.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// The physical-layer family.
    #[must_use]
    pub const fn protocol(&self) -> Protocol { self.protocol }

    /// How to reach the gateway.
    #[must_use]
    pub const fn transport(&self) -> &Transport { &self.transport }

    /// The authentication password, if one is configured.
    #[must_use]
    pub fn password(&self) -> Option<&str> { self.password.as_deref() }

    /// The options bundle.
    #[must_use]
    pub const fn options(&self) -> &GatewayOptions { &self.options }

    /// The capability set.
    #[must_use]
    pub const fn capabilities(&self) -> GatewayCapabilities { self.capabilities }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(GatewayCapabilities::OPENWEBNET_GATEWAY, 0)]
    #[case(GatewayCapabilities::COMMAND_SESSION, 1)]
    #[case(GatewayCapabilities::GENERIC_SESSION, 2)]
    #[case(GatewayCapabilities::EVENT_SESSION, 3)]
    fn capability_bit_positions(#[case] flag: GatewayCapabilities, #[case] bit: u32) {
        assert_eq!(flag.bits(), 1u8 << bit);
    }

    #[test]
    fn transmission_option_predicates() {
        let plain = TransmissionOptions::default();
        assert!(plain.awaits_acknowledgement());
        assert!(!plain.awaits_action());

        let tuned = TransmissionOptions::DISABLE_ACKNOWLEDGEMENT_VALIDATION
            | TransmissionOptions::REQUIRE_ACTION_VALIDATION;
        assert!(!tuned.awaits_acknowledgement());
        assert!(tuned.awaits_action());
    }

    #[test]
    fn builder_keeps_the_gateway_capability() {
        let gateway = Gateway::new(
            "attic",
            Protocol::Scs,
            Transport::Tcp {
                host: "192.168.1.35".to_owned(),
                port: 20000,
            },
        )
        .with_capabilities(GatewayCapabilities::COMMAND_SESSION);
        assert!(gateway
            .capabilities()
            .contains(GatewayCapabilities::OPENWEBNET_GATEWAY));
        assert!(gateway
            .capabilities()
            .contains(GatewayCapabilities::COMMAND_SESSION));
    }
}
