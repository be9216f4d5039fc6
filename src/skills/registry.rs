//! Command registry built from skill manifests.
//!
//! The registry is built once at startup (or on explicit reload), owns the
//! parsed manifests, and hands out immutable command handles. After load it
//! is read-only and needs no synchronization.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::{Result, YoctoError};
use crate::providers::ToolDescriptor;

use super::types::{CommandError, CommandSpec, SkillManifest, ToolErrorKind, ToolOutcome};

/// Default wall-clock budget for one command invocation.
const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// The executable side of a command. The underlying capability is an
/// external collaborator: a function, a subprocess, an API call.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command. `args` is the raw text after the command name.
    async fn run(
        &self,
        args: &str,
        session_key: &str,
    ) -> std::result::Result<String, CommandError>;
}

/// Immutable view of one resolved command.
#[derive(Clone)]
pub struct CommandHandle {
    /// The command's manifest entry
    pub command: CommandSpec,
    /// Name of the skill that declared it
    pub skill: String,
    /// The owning skill's instruction text, carried opaquely
    pub instructions: Arc<str>,
    handler: Option<Arc<dyn CommandHandler>>,
}

impl CommandHandle {
    /// Whether an executable handler is bound to this command.
    pub fn is_bound(&self) -> bool {
        self.handler.is_some()
    }
}

impl std::fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandle")
            .field("command", &self.command.name)
            .field("skill", &self.skill)
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// Immutable command index keyed by command name.
pub struct SkillRegistry {
    commands: HashMap<String, CommandHandle>,
    manifests: Vec<SkillManifest>,
    invoke_timeout: Duration,
}

impl SkillRegistry {
    /// Build the index. A command name declared by more than one manifest
    /// is a load-time error: fail fast, never silently shadow.
    pub fn load(manifests: Vec<SkillManifest>) -> Result<Self> {
        let mut commands: HashMap<String, CommandHandle> = HashMap::new();

        for manifest in &manifests {
            let instructions: Arc<str> = Arc::from(manifest.instructions.as_str());
            for spec in &manifest.commands {
                if let Some(existing) = commands.get(&spec.name) {
                    return Err(YoctoError::Skill(format!(
                        "command '{}' declared by both '{}' and '{}'",
                        spec.name, existing.skill, manifest.name
                    )));
                }
                commands.insert(
                    spec.name.clone(),
                    CommandHandle {
                        command: spec.clone(),
                        skill: manifest.name.clone(),
                        instructions: Arc::clone(&instructions),
                        handler: None,
                    },
                );
            }
        }

        info!(
            skills = manifests.len(),
            commands = commands.len(),
            "Skill registry loaded"
        );

        Ok(Self {
            commands,
            manifests,
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
        })
    }

    /// Registry preloaded with the builtin skills and their handlers.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::load(builtin_manifests())?;
        registry.bind("hello", Arc::new(HelloCommand))?;
        Ok(registry)
    }

    /// Set the per-invocation timeout (builder pattern).
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    /// Bind an executable handler to a declared command.
    pub fn bind(&mut self, command: &str, handler: Arc<dyn CommandHandler>) -> Result<()> {
        match self.commands.get_mut(command) {
            Some(entry) => {
                entry.handler = Some(handler);
                Ok(())
            }
            None => Err(YoctoError::Skill(format!(
                "cannot bind handler: no command named '{}'",
                command
            ))),
        }
    }

    /// Look up a command by name, returning an immutable handle.
    pub fn resolve(&self, command: &str) -> Option<CommandHandle> {
        self.commands.get(command).cloned()
    }

    /// Execute a resolved command for one session.
    ///
    /// Safe to call concurrently for different sessions; the dispatcher's
    /// single-turn invariant keeps one session from invoking twice at once.
    /// Commands without a bound handler answer with their skill's
    /// instruction text (documentation pass-through).
    pub async fn invoke(
        &self,
        handle: &CommandHandle,
        args: &str,
        session_key: &str,
    ) -> ToolOutcome {
        let Some(handler) = &handle.handler else {
            return ToolOutcome::success(&handle.instructions);
        };

        let start = Instant::now();
        let result = tokio::time::timeout(self.invoke_timeout, handler.run(args, session_key)).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => {
                info!(
                    command = %handle.command.name,
                    duration_ms,
                    "Command executed"
                );
                ToolOutcome::success(&output)
            }
            Ok(Err(err)) => {
                error!(
                    command = %handle.command.name,
                    duration_ms,
                    error = %err.message,
                    "Command failed"
                );
                err.into()
            }
            Err(_) => {
                error!(
                    command = %handle.command.name,
                    duration_ms,
                    "Command timed out"
                );
                ToolOutcome::failure(
                    ToolErrorKind::Timeout,
                    &format!(
                        "command '{}' exceeded {}s",
                        handle.command.name,
                        self.invoke_timeout.as_secs()
                    ),
                )
            }
        }
    }

    /// The tool catalog handed to providers.
    pub fn catalog(&self) -> Vec<ToolDescriptor> {
        let mut catalog: Vec<ToolDescriptor> = self
            .commands
            .values()
            .map(|handle| ToolDescriptor {
                name: handle.command.name.clone(),
                description: handle.command.description.clone(),
                help: handle.command.help.clone(),
            })
            .collect();
        catalog.sort_by(|a, b| a.name.cmp(&b.name));
        catalog
    }

    /// Names of all registered commands, sorted.
    pub fn command_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// The loaded manifests (read-only).
    pub fn manifests(&self) -> &[SkillManifest] {
        &self.manifests
    }

    /// Whether a command exists.
    pub fn has(&self, command: &str) -> bool {
        self.commands.contains_key(command)
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the registry has no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Builtin skill manifests compiled into the binary.
pub fn builtin_manifests() -> Vec<SkillManifest> {
    vec![SkillManifest::new(
        "greeter",
        "Friendly greetings",
        vec![CommandSpec {
            name: "hello".into(),
            description: "Greet someone by name".into(),
            help: "/hello <name>".into(),
        }],
    )
    .with_instructions("Greet people warmly and keep it short.")]
}

/// Builtin greeter: `/hello World` → `Hello World! 👋`
pub struct HelloCommand;

#[async_trait]
impl CommandHandler for HelloCommand {
    async fn run(
        &self,
        args: &str,
        _session_key: &str,
    ) -> std::result::Result<String, CommandError> {
        let name = args.trim();
        if name.is_empty() {
            Ok("Hello there! 👋".to_string())
        } else {
            Ok(format!("Hello {}! 👋", name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(skill: &str, commands: &[&str]) -> SkillManifest {
        SkillManifest::new(
            skill,
            "test skill",
            commands
                .iter()
                .map(|name| CommandSpec {
                    name: name.to_string(),
                    description: String::new(),
                    help: String::new(),
                })
                .collect(),
        )
    }

    #[test]
    fn test_load_and_resolve() {
        let registry = SkillRegistry::load(vec![manifest("a", &["ping"])]).unwrap();
        assert!(registry.has("ping"));
        assert_eq!(registry.len(), 1);

        let handle = registry.resolve("ping").unwrap();
        assert_eq!(handle.skill, "a");
        assert!(!handle.is_bound());

        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn test_duplicate_command_is_load_error() {
        let err =
            SkillRegistry::load(vec![manifest("a", &["ping"]), manifest("b", &["ping"])])
                .unwrap_err();
        assert!(matches!(err, YoctoError::Skill(_)));
        let msg = err.to_string();
        assert!(msg.contains("'ping'"));
        assert!(msg.contains("'a'") && msg.contains("'b'"));
    }

    #[test]
    fn test_bind_unknown_command_is_error() {
        let mut registry = SkillRegistry::load(vec![]).unwrap();
        let err = registry.bind("ghost", Arc::new(HelloCommand)).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_hello_command_scenario() {
        let registry = SkillRegistry::with_builtins().unwrap();
        let handle = registry.resolve("hello").unwrap();
        assert!(handle.is_bound());

        let outcome = registry.invoke(&handle, "World", "s1").await;
        assert_eq!(outcome, ToolOutcome::success("Hello World! 👋"));
    }

    #[tokio::test]
    async fn test_hello_command_no_args() {
        let registry = SkillRegistry::with_builtins().unwrap();
        let handle = registry.resolve("hello").unwrap();
        let outcome = registry.invoke(&handle, "  ", "s1").await;
        assert_eq!(outcome, ToolOutcome::success("Hello there! 👋"));
    }

    #[tokio::test]
    async fn test_unbound_command_returns_instructions() {
        let manifests = vec![manifest("docs", &["guide"]).with_instructions("Read the manual.")];
        let registry = SkillRegistry::load(manifests).unwrap();
        let handle = registry.resolve("guide").unwrap();

        let outcome = registry.invoke(&handle, "", "s1").await;
        assert_eq!(outcome, ToolOutcome::success("Read the manual."));
    }

    #[tokio::test]
    async fn test_handler_error_is_typed() {
        struct Failing;
        #[async_trait]
        impl CommandHandler for Failing {
            async fn run(
                &self,
                _args: &str,
                _session_key: &str,
            ) -> std::result::Result<String, CommandError> {
                Err(CommandError::invalid_args("name required"))
            }
        }

        let mut registry = SkillRegistry::load(vec![manifest("a", &["strict"])]).unwrap();
        registry.bind("strict", Arc::new(Failing)).unwrap();

        let handle = registry.resolve("strict").unwrap();
        let outcome = registry.invoke(&handle, "", "s1").await;
        assert_eq!(
            outcome,
            ToolOutcome::failure(ToolErrorKind::InvalidArgs, "name required")
        );
    }

    #[tokio::test]
    async fn test_invocation_timeout() {
        struct Slow;
        #[async_trait]
        impl CommandHandler for Slow {
            async fn run(
                &self,
                _args: &str,
                _session_key: &str,
            ) -> std::result::Result<String, CommandError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("too late".into())
            }
        }

        let mut registry = SkillRegistry::load(vec![manifest("a", &["slow"])]).unwrap();
        registry.bind("slow", Arc::new(Slow)).unwrap();
        let registry = registry.with_invoke_timeout(Duration::from_millis(20));

        let handle = registry.resolve("slow").unwrap();
        let outcome = registry.invoke(&handle, "", "s1").await;
        assert!(matches!(
            outcome,
            ToolOutcome::Failure {
                kind: ToolErrorKind::Timeout,
                ..
            }
        ));
    }

    #[test]
    fn test_catalog_is_sorted() {
        let registry =
            SkillRegistry::load(vec![manifest("a", &["zeta", "alpha"])]).unwrap();
        let catalog = registry.catalog();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].name, "alpha");
        assert_eq!(catalog[1].name, "zeta");
    }

    #[test]
    fn test_concurrent_invocation_is_allowed() {
        // CommandHandle is Clone + Send; two sessions can hold handles at once.
        let registry = SkillRegistry::with_builtins().unwrap();
        let h1 = registry.resolve("hello").unwrap();
        let h2 = registry.resolve("hello").unwrap();
        assert_eq!(h1.command.name, h2.command.name);
    }
}
