//! Registry error types.

use thiserror::Error;

use crate::client::ClientId;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Client already registered: {0}")]
    DuplicateClient(ClientId),

    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),

    #[error("Channel name must not be empty")]
    EmptyChannel,

    #[error("Send to client {client} failed: {reason}")]
    SendFailed { client: ClientId, reason: String },
}

pub type RegistryResult<T> = Result<T, RegistryError>;
