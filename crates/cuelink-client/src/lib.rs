//! Client runtime: wires transport, health, session and telemetry buffering
//! into one handle.

pub mod client;
pub mod error;
pub mod settings;

pub use client::{ClientEvent, CueClient};
pub use error::ClientError;
pub use settings::{
    load_settings, load_settings_from_path, load_settings_with, ClientSettings, SettingsError,
};
