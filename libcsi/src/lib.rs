//! # libcsi
//!
//! Container Storage Interface plumbing shared by RK8s storage plugins.  A
//! plugin implements [`CsiIdentity`], [`CsiController`] and [`CsiNode`];
//! [`CsiServer`] exposes them on a Unix socket or TCP port as
//! length-prefixed JSON frames, and [`CsiClient`] calls them from the
//! orchestrator side.
//!
//! - [`types`]: request and response payloads
//! - [`error`] and [`status`]: failures and the codes they carry
//! - [`message`]: the request/response envelope
//! - [`service`]: the plugin traits
//! - [`transport`]: endpoints, server and client
//!
//! Protocol reference: <https://github.com/container-storage-interface/spec>

pub mod error;
pub mod message;
pub mod service;
pub mod status;
pub mod transport;
pub mod types;

pub use error::CsiError;
pub use message::{CsiMessage, Envelope};
pub use service::{CsiController, CsiIdentity, CsiNode};
pub use status::Code;
pub use transport::{CsiClient, CsiServer, Endpoint};
pub use types::*;
