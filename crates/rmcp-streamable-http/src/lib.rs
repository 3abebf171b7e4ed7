#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]
#![doc = include_str!("../README.md")]

mod error;
pub use error::{ErrorKind, TransportError};

/// JSON-RPC envelope types and validation
pub mod model;
pub mod service;
pub use model::ErrorData;
pub use service::{Dispatcher, Peer, serve_transport};

pub mod transport;

// re-export
pub use serde_json;
