//! Registry operations module
//!
//! Blob reads and the resumable upload controller, both routed through the shared dispatcher.

pub mod blob_operations;
pub mod blob_upload_operations;

pub use blob_operations::{BlobDownload, BlobOperations};
pub use blob_upload_operations::{BlobUploadOperations, MountResult};
