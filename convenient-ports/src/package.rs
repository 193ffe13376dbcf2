//! Package metadata model.

use crate::error::MetadataError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Package identifier: `category/name` with an optional `@flavor`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageId {
    origin: String,
    flavor: Option<String>,
}

impl PackageId {
    pub fn parse(value: &str) -> Result<Self, MetadataError> {
        let invalid = || MetadataError::InvalidPackageId(value.to_string());

        let (origin, flavor) = match value.split_once('@') {
            Some((origin, flavor)) if !flavor.is_empty() => (origin, Some(flavor.to_string())),
            Some(_) => return Err(invalid()),
            None => (value, None),
        };

        let valid_component = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
        };
        match origin.split_once('/') {
            Some((category, name)) if valid_component(category) && valid_component(name) => {
                Ok(Self {
                    origin: origin.to_string(),
                    flavor,
                })
            }
            _ => Err(invalid()),
        }
    }

    /// `category/name` without the flavor.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn category(&self) -> &str {
        self.origin.split('/').next().unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.origin.rsplit('/').next().unwrap_or_default()
    }

    pub fn flavor(&self) -> Option<&str> {
        self.flavor.as_deref()
    }

    /// File-name friendly form: `category_name` or `category_name@flavor`.
    pub fn file_stem(&self) -> String {
        let base = self.origin.replace('/', "_");
        match &self.flavor {
            Some(flavor) => format!("{base}@{flavor}"),
            None => base,
        }
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.flavor {
            Some(flavor) => write!(f, "{}@{}", self.origin, flavor),
            None => write!(f, "{}", self.origin),
        }
    }
}

impl FromStr for PackageId {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PackageId {
    type Error = MetadataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PackageId> for String {
    fn from(id: PackageId) -> Self {
        id.to_string()
    }
}

/// What a dependency is needed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Extract,
    Patch,
    Build,
    Run,
    Test,
}

impl DependencyKind {
    /// Whether the dependency must exist before the dependent job may start.
    /// Test dependencies only gate the test phase.
    pub fn orders_build(self) -> bool {
        !matches!(self, DependencyKind::Test)
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DependencyKind::Extract => "extract",
            DependencyKind::Patch => "patch",
            DependencyKind::Build => "build",
            DependencyKind::Run => "run",
            DependencyKind::Test => "test",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub package: PackageId,
    pub kind: DependencyKind,
}

/// Kind of an option group, following the ports framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionGroupKind {
    /// Independent on/off options (`OPTIONS_DEFINE`)
    Free,
    /// Any subset, including none
    Group,
    /// Exactly one
    Single,
    /// At most one
    Radio,
    /// At least one
    Multi,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionGroup {
    pub kind: OptionGroupKind,
    #[serde(default)]
    pub name: String,
    pub options: Vec<String>,
    /// Options of this group enabled by default
    #[serde(default)]
    pub selected: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagKind {
    Broken,
    Ignore,
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagKind::Broken => f.write_str("BROKEN"),
            FlagKind::Ignore => f.write_str("IGNORE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFlag {
    pub kind: FlagKind,
    #[serde(default)]
    pub reason: String,
}

/// Metadata of one package, immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: PackageId,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub option_groups: Vec<OptionGroup>,
    #[serde(default)]
    pub flags: Vec<PackageFlag>,
}

impl Package {
    pub fn new(id: PackageId) -> Self {
        Self {
            id,
            dependencies: Vec::new(),
            option_groups: Vec::new(),
            flags: Vec::new(),
        }
    }

    /// Builder-style helper used by manifests and tests.
    pub fn with_dependency(mut self, package: PackageId, kind: DependencyKind) -> Self {
        self.dependencies.push(Dependency { package, kind });
        self
    }

    pub fn with_flag(mut self, kind: FlagKind, reason: impl Into<String>) -> Self {
        self.flags.push(PackageFlag {
            kind,
            reason: reason.into(),
        });
        self
    }

    pub fn with_option_group(mut self, group: OptionGroup) -> Self {
        self.option_groups.push(group);
        self
    }

    /// The flag that makes building pointless, if any. IGNORE wins over BROKEN.
    pub fn skip_flag(&self) -> Option<&PackageFlag> {
        self.flags
            .iter()
            .find(|f| f.kind == FlagKind::Ignore)
            .or_else(|| self.flags.first())
    }

    /// Dependencies that gate the start of a build, without duplicates,
    /// in declaration order.
    pub fn build_dependencies(&self) -> Vec<&Dependency> {
        let mut seen = BTreeSet::new();
        self.dependencies
            .iter()
            .filter(|d| d.kind.orders_build() && seen.insert(&d.package))
            .collect()
    }

    /// Test-only dependencies, skipping those already needed for the build.
    pub fn test_dependencies(&self) -> Vec<&PackageId> {
        let build: BTreeSet<_> = self.build_dependencies().into_iter().map(|d| &d.package).collect();
        let mut seen = BTreeSet::new();
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Test)
            .map(|d| &d.package)
            .filter(|p| !build.contains(p) && seen.insert(*p))
            .collect()
    }

    /// Options enabled by default across all groups.
    pub fn default_options(&self) -> BTreeSet<String> {
        self.option_groups
            .iter()
            .flat_map(|g| g.selected.iter().cloned())
            .collect()
    }
}
