//! Client runtime for the OpenWebNet home-automation protocol.
//!
//! OpenNetty talks to OpenWebNet gateways across three physical-layer
//! families — the wired SCS bus, Zigbee radio and Nitoo
//! powerline/radio/infrared — over TCP or a serial port. The crate covers
//! the core runtime: the ASCII frame codec, framed pipes and connections,
//! the typed message model, negotiated and authenticated sessions, the
//! notification pipeline, the per-gateway worker pool, the client-facing
//! service operations and the retry policy around them.
//!
//! [`runtime::OpenNetty`] wires the pieces together; most applications
//! start there:
//!
//! ```no_run
//! use opennetty::{
//!     config::Settings,
//!     gateway::TransmissionOptions,
//!     message::{Category, Command, Protocol},
//!     runtime::OpenNetty,
//!     service::Destination,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let gateways = Settings::from_file("opennetty.toml")?.gateways()?;
//! let runtime = OpenNetty::start(gateways)?;
//!
//! let off = Command::new(Category::lighting(), "0")?;
//! runtime
//!     .service()
//!     .execute_command(
//!         Protocol::Scs,
//!         &off,
//!         &Destination::default(),
//!         None,
//!         TransmissionOptions::default(),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod frame;
pub mod gateway;
pub mod message;
pub mod pipe;
pub mod pipeline;
pub mod retry;
pub mod runtime;
pub mod service;
pub mod session;
pub mod worker;
