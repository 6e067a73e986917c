//! Core library for the GRECP hybrid access client.
//!
//! The client bonds a primary cellular link (LTE) and a secondary broadband
//! link (DSL) into one virtual interface, negotiated with a Hybrid Access
//! Aggregation Point (HAAP) over the GRE Tunnel Bonding Control Protocol.
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! - `proto`: GRE header and GRECP message wire formats
//! - `session`: Link, session and lease state owned by the control loop
//! - `handlers`: Inbound message validation and outbound message builders
//! - `control_loop`: The periodic tick driving requests, hellos and lifecycle
//! - `reorder`: Sequence tracking and the bounded-latency reorder buffer
//! - `scheduler`: Egress link selection
//! - `bridge`: Encapsulation and decapsulation between links and the TUN device
//! - `transport`: Raw GRE sockets and interface address lookup
//! - `tun`: Tunnel device framing and the Linux TUN device
//! - `dhcp`: busybox udhcpc helpers and lease parsing
//! - `event`: Lifecycle event script hooks
//! - `config`: Client configuration
//!
//! # Example
//!
//! ```no_run
//! use grecp_core::proto::{GrecpMessage, MessageType, TunnelType};
//!
//! let hello = GrecpMessage::new(MessageType::Hello, TunnelType::Lte, 0);
//! let bytes = hello.encode().expect("hello fits in a packet");
//! assert_eq!(GrecpMessage::decode(&bytes).unwrap(), hello);
//! ```

pub mod bridge;
pub mod config;
pub mod control_loop;
pub mod dhcp;
pub mod event;
pub mod handlers;
pub mod proto;
pub mod reorder;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod tun;

pub use config::ClientConfig;
pub use control_loop::{Controller, LinkEndpoint};
pub use proto::{GrecpMessage, GreHeader, MessageType, TunnelType};
pub use session::{LinkView, SystemState};
