//! Socket transport for CSI messages.
//!
//! This module provides [`CsiClient`] and [`CsiServer`] that exchange
//! [`Envelope`](crate::Envelope)s as length-delimited JSON frames over a Unix
//! domain socket or a TCP connection.  Which one is used is decided by the
//! [`Endpoint`] the plugin is started with.

pub mod client;
pub mod server;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::CsiError;

pub use client::CsiClient;
pub use server::CsiServer;

/// Upper bound for a single frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Address a plugin listens on, written as `unix:///path/to/csi.sock` or
/// `tcp://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket at the given path.
    Unix(PathBuf),
    /// TCP socket address (`host:port`).
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(CsiError::InvalidArgument(format!(
                    "endpoint {s:?} has an empty socket path"
                )));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.is_empty() {
                return Err(CsiError::InvalidArgument(format!(
                    "endpoint {s:?} has an empty address"
                )));
            }
            return Ok(Self::Tcp(addr.to_owned()));
        }
        Err(CsiError::InvalidArgument(format!(
            "endpoint {s:?} must start with unix:// or tcp://"
        )))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// A connected byte stream, either Unix or TCP.
pub(crate) trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

/// Frame codec shared by client and server.
pub(crate) fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}
