//! Skill manifest discovery and parsing.
//!
//! Manifests live one per directory as `SKILL.md`: a YAML frontmatter
//! header between `---` fences, then the markdown instruction body.

use std::path::{Path, PathBuf};

use crate::error::{Result, YoctoError};

use super::types::{ManifestHeader, SkillManifest};

/// Discover and parse skill manifests from a skills directory.
pub struct SkillLoader {
    skills_dir: PathBuf,
}

impl SkillLoader {
    /// Create a loader rooted at `skills_dir`.
    pub fn new(skills_dir: PathBuf) -> Self {
        Self { skills_dir }
    }

    /// The directory this loader scans.
    pub fn skills_dir(&self) -> &Path {
        &self.skills_dir
    }

    /// Load every `<dir>/<skill>/SKILL.md` under the skills directory.
    ///
    /// A manifest that fails to parse is a load error, not a silent skip:
    /// the registry is built once at startup and should fail fast.
    pub fn load_all(&self) -> Result<Vec<SkillManifest>> {
        let mut manifests = Vec::new();

        let entries = match std::fs::read_dir(&self.skills_dir) {
            Ok(entries) => entries,
            // No skills directory simply means no skills.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(manifests),
            Err(e) => return Err(e.into()),
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir() && p.join("SKILL.md").is_file())
            .collect();
        paths.sort();

        for dir in paths {
            let file = dir.join("SKILL.md");
            let fallback = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let raw = std::fs::read_to_string(&file)?;
            let mut manifest = parse_manifest(&raw, &fallback)?;
            manifest.path = Some(file.to_string_lossy().to_string());
            manifests.push(manifest);
        }

        Ok(manifests)
    }
}

/// Parse a manifest from raw markdown.
///
/// The header is required; `fallback_name` fills in when the header omits
/// a name (the directory name, by convention).
pub fn parse_manifest(raw: &str, fallback_name: &str) -> Result<SkillManifest> {
    let (header_text, body) = split_frontmatter(raw).ok_or_else(|| {
        YoctoError::Skill(format!(
            "skill '{}' is missing its frontmatter header",
            fallback_name
        ))
    })?;

    let header: ManifestHeader = serde_yaml::from_str(header_text).map_err(|e| {
        YoctoError::Skill(format!("skill '{}' has a bad header: {}", fallback_name, e))
    })?;

    for command in &header.commands {
        if command.name.trim().is_empty() {
            return Err(YoctoError::Skill(format!(
                "skill '{}' declares a command with an empty name",
                fallback_name
            )));
        }
    }

    let name = if header.name.trim().is_empty() {
        fallback_name.to_string()
    } else {
        header.name.clone()
    };
    let description = if header.description.trim().is_empty() {
        format!("Skill '{}'", name)
    } else {
        header.description.clone()
    };

    Ok(SkillManifest {
        name,
        description,
        commands: header.commands,
        instructions: body.trim().to_string(),
        path: None,
    })
}

/// Split `---\n<header>\n---\n<body>`. Returns `None` when there is no
/// frontmatter fence at the top of the file.
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').or_else(|| {
        rest.strip_prefix("\r\n")
    })?;
    // Closing fence on its own line.
    for marker in ["\n---\n", "\n---\r\n"] {
        if let Some(pos) = rest.find(marker) {
            return Some((&rest[..pos], &rest[pos + marker.len()..]));
        }
    }
    // Fence at end of file with no body.
    if let Some(stripped) = rest.strip_suffix("\n---") {
        return Some((stripped, ""));
    }
    None
}
