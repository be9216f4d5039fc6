//! Skills module - manifest loading and the command registry.

pub mod loader;
pub mod registry;
pub mod types;

pub use loader::{parse_manifest, SkillLoader};
pub use registry::{
    builtin_manifests, CommandHandle, CommandHandler, HelloCommand, SkillRegistry,
};
pub use types::{
    CommandError, CommandSpec, ManifestHeader, SkillManifest, ToolErrorKind, ToolOutcome,
};
