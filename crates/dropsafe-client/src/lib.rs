#![forbid(unsafe_code)]

//! Authenticated client for the journalist API.
//!
//! Connection settings come from [`dropsafe_core::ClientCfg`], injected at
//! construction. The error taxonomy here never crosses into the export
//! pipeline; callers decide how to surface fetch failures.

mod api;
mod checksum;
mod error;
mod types;

pub use api::ApiClient;
pub use checksum::verify_etag;
pub use error::{ClientError, ClientResult};
pub use types::{Credentials, Reply, Session, Source, Submission};
