use cuelink_session::{SessionApiError, SessionError};
use cuelink_store::StoreError;
use cuelink_transport::{CommandError, TransportError};

use crate::settings::SettingsError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Backend(#[from] SessionApiError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("client has been destroyed")]
    Destroyed,
}
