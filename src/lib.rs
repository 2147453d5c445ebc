pub mod common;
pub mod server;

pub use common::error::UploadError;
pub use common::identifier::{validate, Identifier};
pub use server::{IngestConfig, IngestServer};
