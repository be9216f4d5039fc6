//! Skills management command handler.

use anyhow::Result;

use yoctoclaw::config::Config;
use yoctoclaw::skills::{builtin_manifests, SkillLoader, SkillRegistry};

use super::SkillsAction;

pub async fn cmd_skills(action: SkillsAction) -> Result<()> {
    match action {
        SkillsAction::List => cmd_list(),
    }
}

fn cmd_list() -> Result<()> {
    let config = Config::load()?;
    let mut manifests = builtin_manifests();
    manifests.extend(SkillLoader::new(config.skills_dir()).load_all()?);
    let registry = SkillRegistry::load(manifests)?;

    if registry.is_empty() {
        println!("No skills loaded.");
        return Ok(());
    }

    for manifest in registry.manifests() {
        println!("{} — {}", manifest.name, manifest.description);
        for command in &manifest.commands {
            if command.help.is_empty() {
                println!("  /{:<14} {}", command.name, command.description);
            } else {
                println!(
                    "  /{:<14} {}  ({})",
                    command.name, command.description, command.help
                );
            }
        }
    }
    println!();
    println!(
        "{} command(s) across {} skill(s).",
        registry.len(),
        registry.manifests().len()
    );
    Ok(())
}
