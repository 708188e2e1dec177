//! Registry module for registry HTTP API v2 interactions
//!
//! This module provides authentication, request dispatch and the blob/upload operations
//! built on top of it. Everything talks to the registry through [`dispatcher::Dispatcher`].

pub mod auth;
pub mod client;
pub mod dispatcher;
pub mod operations;
pub mod query;
pub mod token;

pub use auth::{
    AnonymousBearerAuth, AuthChallenge, AuthStrategy, BasicAuth, Credentials, PasswordBearerAuth,
};
pub use client::{BlobUpload, RegistryClient, RegistryClientBuilder, UploadOutcome};
pub use dispatcher::{ApiRequest, ApiResponse, ByteStream, Dispatcher};
pub use operations::{BlobDownload, BlobOperations, BlobUploadOperations, MountResult};
pub use query::QueryString;
pub use token::{Token, TokenClient};
