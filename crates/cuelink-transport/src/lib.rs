pub mod commands;
pub mod error;
pub mod policy;
pub mod transport;

pub use commands::CommandChannel;
pub use error::{CommandError, TransportError};
pub use policy::ReconnectPolicy;
pub use transport::{
    CloseKind, ConnectEvent, DisconnectEvent, Endpoint, LinkState, Transport, TransportConfig,
    NORMAL_CLOSURE, SUPERSEDED_CLOSURE,
};
