//! YoctoClaw - Event-routing runtime core for a personal AI assistant

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod providers;
pub mod scheduler;
pub mod session;
pub mod skills;
pub mod utils;

pub use bus::{
    DeliveryStatus, Event, EventBus, EventKind, EventPayload, MediaAttachment, MediaType,
    TimerSource,
};
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{ProviderError, Result, YoctoError};
pub use providers::{ChatMessage, ChatRole, Completion, EchoProvider, ProviderAdapter};
pub use scheduler::{CronExpr, CronTrigger, HeartbeatTrigger};
pub use session::{Session, SessionStatus, SessionStore, Step, Turn};
pub use skills::{SkillManifest, SkillRegistry};
