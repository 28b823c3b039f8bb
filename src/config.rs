//! Configuration consumed as plain data: alias definitions and ignore
//! patterns. Loading a config file is the front-end's job; every core entry
//! point takes these values explicitly.

use ignore::overrides::{Override, OverrideBuilder};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid ignore pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: ignore::Error,
    },
}

/// A source tree being backed up, named by its alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRoot {
    pub alias: String,
    pub path: PathBuf,
}

impl SourceRoot {
    pub fn new(alias: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { alias: alias.into(), path: path.into() }
    }
}

/// One configured source: where it lives, and where restores should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasSpec {
    pub source: PathBuf,
    /// Restore destination override; falls back to `source` when absent.
    pub restore_to: Option<PathBuf>,
}

/// The alias table plus filename ignore patterns.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub aliases: BTreeMap<String, AliasSpec>,
    pub ignore: Vec<String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_alias(&mut self, name: impl Into<String>, spec: AliasSpec) {
        self.aliases.insert(name.into(), spec);
    }

    /// Where files for `alias` should be restored to, if the alias is known.
    pub fn resolve_restore(&self, alias: &str) -> Option<&Path> {
        self.aliases
            .get(alias)
            .map(|spec| spec.restore_to.as_deref().unwrap_or(&spec.source))
    }
}

/// Compiled ignore patterns, anchored at one walk root.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    overrides: Option<Override>,
}

impl IgnoreRules {
    /// Rules that match nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile glob patterns rooted at `root`. Patterns use gitignore syntax;
    /// a match means "skip this path".
    pub fn compile(root: &Path, patterns: &[String]) -> Result<Self, ConfigError> {
        if patterns.is_empty() {
            return Ok(Self::empty());
        }
        let mut builder = OverrideBuilder::new(root);
        for pattern in patterns {
            // Negated override patterns act as excludes.
            builder.add(&format!("!{pattern}")).map_err(|source| ConfigError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
        }
        let overrides = builder.build().map_err(|source| ConfigError::Pattern {
            pattern: patterns.join(", "),
            source,
        })?;
        Ok(Self { overrides: Some(overrides) })
    }

    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        match &self.overrides {
            Some(ov) => ov.matched(path, is_dir).is_ignore(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_restore_prefers_override() {
        let mut config = Config::new();
        config.add_alias(
            "photos",
            AliasSpec {
                source: PathBuf::from("/data/photos"),
                restore_to: Some(PathBuf::from("/restore/photos")),
            },
        );
        config.add_alias(
            "docs",
            AliasSpec { source: PathBuf::from("/data/docs"), restore_to: None },
        );

        assert_eq!(config.resolve_restore("photos"), Some(Path::new("/restore/photos")));
        assert_eq!(config.resolve_restore("docs"), Some(Path::new("/data/docs")));
        assert_eq!(config.resolve_restore("unknown"), None);
    }

    #[test]
    fn test_ignore_rules_match() {
        let root = Path::new("/data");
        let rules =
            IgnoreRules::compile(root, &["*.bak".to_string(), "cache/".to_string()]).unwrap();

        assert!(rules.is_ignored(Path::new("/data/old.bak"), false));
        assert!(rules.is_ignored(Path::new("/data/cache"), true));
        assert!(!rules.is_ignored(Path::new("/data/report.txt"), false));
    }

    #[test]
    fn test_empty_rules_match_nothing() {
        let rules = IgnoreRules::empty();
        assert!(!rules.is_ignored(Path::new("/anything"), false));
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let result = IgnoreRules::compile(Path::new("/data"), &["bad[".to_string()]);
        assert!(matches!(result, Err(ConfigError::Pattern { .. })));
    }
}
