//! Session lifecycle against the backend REST surface.

pub mod api;
pub mod cache;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod renewal;

pub use api::{
    BackendConfig, ClientInfo, CreateSessionRequest, RenewResponse, SessionApi, SessionApiError,
    StreamInfo, StreamQuality, SwitchStreamResponse,
};
pub use cache::SessionCache;
pub use error::SessionError;
pub use http::HttpBackend;
pub use lifecycle::{ClearReason, SessionConfig, SessionEvent, SessionLifecycle};
pub use renewal::{renewal_plan, RenewalPlan};
