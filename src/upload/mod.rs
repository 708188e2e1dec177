//! Upload module: chunk planning and resumable upload session types

pub mod chunked;
pub mod session;

pub use chunked::{ChunkPlanner, ChunkRange, chunk_layout, effective_chunk_size};
pub use session::{CompletedUpload, UploadSession, UploadState, UploadStatus};
