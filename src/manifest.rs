//! Declaration manifests for the accessor generator.
//!
//! A manifest lists locks and fields for a runtime whose state is
//! generated rather than written by hand:
//!
//! ```toml
//! [build]
//! instances = true                 # false collapses per-instance into global
//! global_struct = "Globals"
//!
//! [[lock]]
//! name = "registry"
//! rank = 10
//!
//! [[field]]
//! name = "registry"
//! tier = "global"
//! type = "Registry"
//! init = "Registry::new()"
//! lock = "registry"
//!
//! [[field]]
//! name = "stack_depth"
//! per_thread = true                # tier derived from placement
//! type = "usize"
//! ```
//!
//! Field order in the manifest is the order of the generated code.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::codegen::lock_const_name;
use crate::state::{
    ConfigurationError, LockRef, Placement, PolicyTable, Protection, StateField, Tier,
};

/// One `[[lock]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockDecl {
    pub name: String,
    pub rank: u8,
}

/// One `[[field]]` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDecl {
    pub name: String,
    #[serde(default)]
    pub tier: Option<Tier>,
    #[serde(default)]
    pub before_instance: Option<bool>,
    #[serde(default)]
    pub per_thread: Option<bool>,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub init: Option<String>,
    /// `cfg` predicate under which the field exists.
    #[serde(default)]
    pub guard: Option<String>,
    #[serde(default)]
    pub export: bool,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub constant: bool,
    #[serde(default)]
    pub lock: Option<String>,
    #[serde(default)]
    pub read_mostly: bool,
}

impl FieldDecl {
    /// The field's tier: declared, derived from placement, or both when
    /// they agree.
    pub fn resolve_tier(&self, instances_supported: bool) -> Result<Tier, ConfigurationError> {
        let placement = match (self.before_instance, self.per_thread) {
            (None, None) => None,
            (before, per_thread) => Some(Placement::new(
                before.unwrap_or(false),
                per_thread.unwrap_or(false),
            )),
        };
        let classified = placement.map(|p| Tier::classify(p, instances_supported));
        match (self.tier, classified) {
            (None, None) => Err(ConfigurationError::MissingTier(self.name.clone())),
            (Some(declared), Some(classified)) if declared != classified => {
                Err(ConfigurationError::TierConflict {
                    field: self.name.clone(),
                    declared,
                    classified,
                })
            }
            (Some(tier), _) | (None, Some(tier)) => Ok(tier),
        }
    }

    fn resolve(
        &self,
        locks: &[LockRef],
        instances_supported: bool,
    ) -> Result<StateField, ConfigurationError> {
        let tier = self.resolve_tier(instances_supported)?;
        let mut field = StateField::new(self.name.clone(), tier, self.type_name.clone());
        if let Some(init) = &self.init {
            field = field.initializer(init.clone());
        }
        if let Some(guard) = &self.guard {
            field = field.guarded(guard.clone());
        }
        match &self.lock {
            Some(name) => {
                let lock = locks
                    .iter()
                    .find(|l| l.name == name.as_str())
                    .cloned()
                    .ok_or_else(|| ConfigurationError::UnknownLock {
                        field: self.name.clone(),
                        lock: name.clone(),
                    })?;
                field = field.protection(if self.read_mostly {
                    Protection::ReadMostly(lock)
                } else {
                    Protection::Mutex(lock)
                });
            }
            None if self.read_mostly => {
                warn!(
                    target: "tierstate::codegen",
                    field = %self.name,
                    "read_mostly without a lock is ignored"
                );
            }
            None => {}
        }
        if self.export {
            field = field.export();
        }
        if self.persistent {
            field = field.persistent();
        }
        if self.constant {
            field = field.constant();
        }
        Ok(field)
    }
}

/// The `[build]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildOptions {
    /// Whether the target runtime supports more than one instance.
    pub instances: bool,
    pub global_struct: String,
    pub instance_struct: String,
    pub thread_struct: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            instances: true,
            global_struct: "GlobalVars".to_string(),
            instance_struct: "InstanceVars".to_string(),
            thread_struct: "ThreadVars".to_string(),
        }
    }
}

impl BuildOptions {
    pub fn struct_name(&self, tier: Tier) -> &str {
        match tier {
            Tier::Global => &self.global_struct,
            Tier::PerInstance => &self.instance_struct,
            Tier::PerThread => &self.thread_struct,
        }
    }
}

/// A parsed manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub build: BuildOptions,
    #[serde(default, rename = "lock")]
    pub locks: Vec<LockDecl>,
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldDecl>,
}

/// Errors from loading or validating a manifest.
#[derive(Debug)]
pub enum ManifestError {
    Io { path: PathBuf, source: io::Error },
    Parse {
        path: Option<PathBuf>,
        source: toml::de::Error,
    },
    Invalid(ConfigurationError),
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestError::Io { path, source } => {
                write!(f, "Failed to read manifest '{}': {}", path.display(), source)
            }
            ManifestError::Parse {
                path: Some(path),
                source,
            } => write!(f, "Invalid manifest '{}': {}", path.display(), source),
            ManifestError::Parse { path: None, source } => {
                write!(f, "Invalid manifest: {}", source)
            }
            ManifestError::Invalid(err) => write!(f, "Invalid declarations: {}", err),
        }
    }
}

impl std::error::Error for ManifestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ManifestError::Io { source, .. } => Some(source),
            ManifestError::Parse { source, .. } => Some(source),
            ManifestError::Invalid(err) => Some(err),
        }
    }
}

impl From<ConfigurationError> for ManifestError {
    fn from(err: ConfigurationError) -> Self {
        ManifestError::Invalid(err)
    }
}

impl Manifest {
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        toml::from_str(content).map_err(|source| ManifestError::Parse { path: None, source })
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest = toml::from_str(&content).map_err(|source| ManifestError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        debug!(target: "tierstate::codegen", path = %path.display(), "Loaded manifest");
        Ok(manifest)
    }

    /// Validate every declaration into a policy table.
    pub fn policy(&self) -> Result<PolicyTable, ConfigurationError> {
        let locks: Vec<LockRef> = self
            .locks
            .iter()
            .map(|l| LockRef::new(l.name.clone(), l.rank))
            .collect();
        let mut table = PolicyTable::new(locks.iter().cloned())?;

        let mut constants: HashMap<String, &str> = HashMap::new();
        for lock in &locks {
            let generated = lock_const_name(lock);
            if let Some(existing) = constants.insert(generated.clone(), lock.name.as_ref()) {
                return Err(ConfigurationError::LockNameCollision {
                    lock: lock.name.to_string(),
                    existing: existing.to_string(),
                    generated,
                });
            }
        }
        for tier in [Tier::Global, Tier::PerInstance, Tier::PerThread] {
            check_identifier(self.build.struct_name(tier))?;
        }
        for decl in &self.fields {
            check_identifier(&decl.name)?;
            table.declare(decl.resolve(&locks, self.build.instances)?)?;
        }
        Ok(table)
    }
}

// Strict and reserved keywords of the 2021 edition.
const KEYWORDS: &[&str] = &[
    "abstract", "as", "async", "await", "become", "box", "break", "const", "continue", "crate",
    "do", "dyn", "else", "enum", "extern", "false", "final", "fn", "for", "if", "impl", "in",
    "let", "loop", "macro", "match", "mod", "move", "mut", "override", "priv", "pub", "ref",
    "return", "self", "Self", "static", "struct", "super", "trait", "true", "try", "type",
    "typeof", "unsafe", "unsized", "use", "virtual", "where", "while", "yield",
];

/// Reject names the generated code could not declare.
fn check_identifier(name: &str) -> Result<(), ConfigurationError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid = valid_start
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name != "_"
        && !KEYWORDS.contains(&name);
    if valid {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidIdentifier(name.to_string()))
    }
}
