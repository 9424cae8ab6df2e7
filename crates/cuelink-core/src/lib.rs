pub mod clock;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod pubsub;
pub mod scheduler;
pub mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use envelope::Envelope;
pub use errors::CommandErrorCode;
pub use ids::{RequestId, SessionId, StreamId};
pub use pubsub::{Subscribers, Subscription, Topics};
pub use scheduler::{Scheduler, TimerHandle, TokioScheduler};
pub use session::{Role, Session};
