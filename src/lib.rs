//! dataplane - fixed-size message buffers moved between workers over shared memory
//!
//! A producer worker claims an empty buffer, writes a message into it and
//! produces it; the transport moves it into a consumer's buffer, where a
//! consumer worker reads and releases it. The building blocks are:
//!
//! - **Endpoints** ([`endpoint`]): textual addresses of memory resources,
//!   resolved to shared identities
//! - **Memory** ([`memory`]): regions created by their owner and attached by
//!   peers, with flag words and bounds-checked mappings
//! - **Drivers** ([`driver`]): per-protocol memory creation and copy engines,
//!   collected in an explicit registry
//! - **Ports** ([`port`]): rings of buffers with fill/drain flags and a
//!   negotiated role deciding who moves data
//! - **Controllers** ([`controller`]): the four transfer patterns and the
//!   templates they post
//! - **Circuits** ([`circuit`]): one producer set, its consumer sets and the
//!   four-message handshake that connects two participants
//! - **Transport** ([`transport`]): circuit table, dispatch loop and the
//!   worker buffer API
//!
//! # Example
//!
//! ```rust,no_run
//! use dataplane::circuit::{CircuitSpec, PortSetSpec};
//! use dataplane::config::TransportConfig;
//! use dataplane::port::PortRole;
//! use dataplane::transport::Transport;
//!
//! # fn example() -> dataplane::error::Result<()> {
//! let transport = Transport::with_defaults(TransportConfig::default());
//! let id = transport.create_circuit(&CircuitSpec::new(
//!     PortSetSpec::new(1, 2, 64, PortRole::ActiveMessage),
//!     vec![PortSetSpec::new(1, 2, 64, PortRole::ActiveFlowControl)],
//! ))?;
//!
//! if let Some(mut buffer) = transport.get_empty_buffer(id, 0)? {
//!     let n = buffer.fill(b"hello");
//!     transport.produce(buffer, 7, n)?;
//! }
//! transport.dispatch();
//!
//! if let Some(buffer) = transport.get_full_buffer(id, 0, 0)? {
//!     assert_eq!(buffer.data(), b"hello");
//!     transport.release(buffer)?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod circuit;
pub mod config;
pub mod constants;
pub mod controller;
pub mod descriptor;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod memory;
pub mod port;
pub mod transport;

pub use buffer::{BufferHandle, BufferMetaData, BufferState, FlagMode};
pub use circuit::{CircuitSpec, CircuitState, PortSetSpec, ProduceStatus};
pub use config::TransportConfig;
pub use error::{CircuitId, Result, TransportError};
pub use port::{Distribution, PortRole, RoleOptions, RoleRequest, SubPolicy};
pub use transport::Transport;
