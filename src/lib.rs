//! Registry Transfer Library
//!
//! Client side of the registry HTTP API v2 blob transfer protocol: endpoint discovery,
//! challenge-based authentication, chunk planning and resumable uploads.

pub mod config;
pub mod digest;
pub mod error;
pub mod logging;
pub mod registry;
pub mod upload;

pub use config::{AuthMode, RegistryClientConfig};
pub use digest::DigestUtils;
pub use error::{RegistryError, Result};
pub use logging::Logger;
pub use registry::{RegistryClient, RegistryClientBuilder};
pub use tokio_util::sync::CancellationToken;
pub use upload::{ChunkPlanner, ChunkRange, CompletedUpload, UploadSession, UploadState};
