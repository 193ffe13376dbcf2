//! Build option selections and the combination generator.
//!
//! A port declares its options in groups (see [`OptionGroupKind`]). To test a
//! port thoroughly, we build it not only with its default options but also
//! with a bounded set of option combinations, each differing from the
//! default in a way that exercises one group's semantics.
//!
//! The generator is a pure function of the package metadata and the
//! include/exclude filters, so the scheduler can consume it as plain data.

use crate::error::MetadataError;
use crate::package::{OptionGroupKind, Package, PackageId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Options considered enabled regardless of `OPTIONS_DEFAULT`.
pub const ALWAYS_ENABLED: [&str; 4] = ["DOCS", "NLS", "EXAMPLES", "IPV6"];

/// Options forced on (`true`) or off (`false`) relative to the defaults.
///
/// An empty selection is the default variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionSelection(BTreeMap<String, bool>);

impl OptionSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    pub fn set(&mut self, option: impl Into<String>, enabled: bool) {
        let _ = self.0.insert(option.into(), enabled);
    }

    pub fn get(&self, option: &str) -> Option<bool> {
        self.0.get(option).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Options switched on.
    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        self.iter().filter(|(_, on)| *on).map(|(k, _)| k)
    }

    /// Options switched off.
    pub fn disabled(&self) -> impl Iterator<Item = &str> {
        self.iter().filter(|(_, on)| !*on).map(|(k, _)| k)
    }

    /// Short stable digest used to keep log file names unique per variant.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        let hash = hasher.finalize();
        hash.iter().take(4).map(|b| format!("{b:02x}")).collect()
    }
}

impl FromIterator<(String, bool)> for OptionSelection {
    fn from_iter<I: IntoIterator<Item = (String, bool)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// `+FOO -BAR`, or `default` for the empty selection.
impl fmt::Display for OptionSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("default");
        }
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}{}", if *v { '+' } else { '-' }, k))
            .collect();
        f.write_str(&parts.join(" "))
    }
}

/// Parses `+FOO -BAR` (also comma separated), or `default`.
impl FromStr for OptionSelection {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut selection = OptionSelection::new();
        for token in s.split(|c: char| c.is_whitespace() || c == ',') {
            if token.is_empty() || token == "default" {
                continue;
            }
            let (enabled, name) = match (token.strip_prefix('+'), token.strip_prefix('-')) {
                (Some(name), _) => (true, name),
                (_, Some(name)) => (false, name),
                _ => return Err(MetadataError::InvalidOption(token.to_string())),
            };
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(MetadataError::InvalidOption(token.to_string()));
            }
            selection.set(name, enabled);
        }
        Ok(selection)
    }
}

/// A package bound to one concrete option selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Variant {
    pub package: PackageId,
    pub options: OptionSelection,
}

impl Variant {
    pub fn new(package: PackageId, options: OptionSelection) -> Self {
        Self { package, options }
    }

    pub fn default_of(package: PackageId) -> Self {
        Self::new(package, OptionSelection::new())
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.options.is_default() {
            write!(f, "{}", self.package)
        } else {
            write!(f, "{} [{}]", self.package, self.options)
        }
    }
}

/// Restricts which options the generator may touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionFilter {
    /// When set, only these options may appear in a combination
    pub include: Option<BTreeSet<String>>,
    pub exclude: BTreeSet<String>,
}

impl OptionFilter {
    fn allows(&self, option: &str) -> bool {
        self.include.as_ref().is_none_or(|inc| inc.contains(option))
            && !self.exclude.contains(option)
    }
}

/// Options enabled by default, including [`ALWAYS_ENABLED`].
pub fn effective_defaults(package: &Package) -> BTreeSet<String> {
    let mut enabled = package.default_options();
    enabled.extend(ALWAYS_ENABLED.iter().map(|s| s.to_string()));
    enabled
}

fn all(options: &BTreeSet<String>, value: bool) -> Vec<(String, bool)> {
    options.iter().map(|o| (o.clone(), value)).collect()
}

fn exclusive(options: &BTreeSet<String>, choice: &str) -> Vec<(String, bool)> {
    options.iter().map(|o| (o.clone(), o == choice)).collect()
}

fn toggles(options: &BTreeSet<String>) -> impl Iterator<Item = Vec<(String, bool)>> + '_ {
    options
        .iter()
        .flat_map(|o| [vec![(o.clone(), true)], vec![(o.clone(), false)]])
}

/// Raw candidates before filtering, in generation order.
fn candidates(package: &Package, enabled: &BTreeSet<String>) -> Vec<Vec<(String, bool)>> {
    let mut out = Vec::new();

    let kinds = [
        OptionGroupKind::Free,
        OptionGroupKind::Group,
        OptionGroupKind::Single,
        OptionGroupKind::Radio,
        OptionGroupKind::Multi,
    ];

    for kind in kinds {
        for group in package.option_groups.iter().filter(|g| g.kind == kind) {
            let options: BTreeSet<String> = group.options.iter().cloned().collect();
            debug!(package = %package.id, group = %group.name, ?kind, "Expanding option group");

            match kind {
                OptionGroupKind::Free => out.extend(toggles(&options)),
                OptionGroupKind::Group => {
                    out.extend(toggles(&options));
                    out.push(all(&options, true));
                    out.push(all(&options, false));
                }
                OptionGroupKind::Single => {
                    out.extend(options.iter().map(|c| exclusive(&options, c)));
                }
                OptionGroupKind::Radio => {
                    out.extend(options.iter().map(|c| exclusive(&options, c)));
                    out.push(all(&options, false));
                }
                OptionGroupKind::Multi => {
                    let default: BTreeSet<String> =
                        options.intersection(enabled).cloned().collect();
                    out.extend(options.iter().map(|c| exclusive(&options, c)));
                    for option in &options {
                        // toggling the sole default option off would leave none enabled
                        if !(default.len() == 1 && default.contains(option)) {
                            out.push(vec![(option.clone(), true)]);
                            out.push(vec![(option.clone(), false)]);
                        }
                    }
                    out.push(all(&options, true));
                }
            }
        }
    }

    out
}

/// Enumerate the option combinations worth building for `package`.
///
/// Each combination only mentions options that differ from the defaults and
/// pass the filter. Empty and duplicate combinations are dropped; the
/// first occurrence wins, so the output order is deterministic.
pub fn generate_combinations(package: &Package, filter: &OptionFilter) -> Vec<OptionSelection> {
    let enabled = effective_defaults(package);
    let mut seen = HashSet::new();
    let mut result = Vec::new();

    for candidate in candidates(package, &enabled) {
        let selection: OptionSelection = candidate
            .into_iter()
            .filter(|(option, value)| *value != enabled.contains(option) && filter.allows(option))
            .collect();

        if selection.is_empty() {
            continue;
        }
        if seen.insert(selection.clone()) {
            result.push(selection);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::OptionGroup;

    fn package(kind: OptionGroupKind, options: &[&str], selected: &[&str]) -> Package {
        Package::new("devel/example".parse().unwrap()).with_option_group(OptionGroup {
            kind,
            name: "G".into(),
            options: options.iter().map(|s| s.to_string()).collect(),
            selected: selected.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn render(combinations: &[OptionSelection]) -> Vec<String> {
        combinations.iter().map(ToString::to_string).collect()
    }

    fn generate(pkg: &Package) -> Vec<String> {
        render(&generate_combinations(pkg, &OptionFilter::default()))
    }

    #[test]
    fn test_free_options() {
        let pkg = package(OptionGroupKind::Free, &["O1", "O2", "O3", "O4"], &["O2", "O4"]);
        assert_eq!(generate(&pkg), vec!["+O1", "-O2", "+O3", "-O4"]);
    }

    #[test]
    fn test_group_options() {
        let pkg = package(OptionGroupKind::Group, &["O1", "O2", "O3", "O4"], &["O2", "O4"]);
        assert_eq!(
            generate(&pkg),
            vec!["+O1", "-O2", "+O3", "-O4", "+O1 +O3", "-O2 -O4"]
        );
    }

    #[test]
    fn test_single_options() {
        let pkg = package(OptionGroupKind::Single, &["O1", "O2", "O3", "O4"], &["O2"]);
        assert_eq!(generate(&pkg), vec!["+O1 -O2", "-O2 +O3", "-O2 +O4"]);
    }

    #[test]
    fn test_radio_options() {
        let pkg = package(OptionGroupKind::Radio, &["O1", "O2", "O3", "O4"], &["O2"]);
        assert_eq!(generate(&pkg), vec!["+O1 -O2", "-O2 +O3", "-O2 +O4", "-O2"]);
    }

    #[test]
    fn test_multi_options() {
        let pkg = package(
            OptionGroupKind::Multi,
            &["O1", "O2", "O3", "O4", "O5"],
            &["O1", "O2", "O3"],
        );
        assert_eq!(
            generate(&pkg),
            vec![
                "-O2 -O3",
                "-O1 -O3",
                "-O1 -O2",
                "-O1 -O2 -O3 +O4",
                "-O1 -O2 -O3 +O5",
                "-O1",
                "-O2",
                "-O3",
                "+O4",
                "+O5",
                "+O4 +O5",
            ]
        );
    }

    #[test]
    fn test_multi_never_disables_sole_default() {
        let pkg = package(OptionGroupKind::Multi, &["A", "B"], &["A"]);
        let combos = generate(&pkg);
        assert!(!combos.contains(&"-A".to_string()), "{combos:?}");
        assert_eq!(combos, vec!["-A +B", "+B"]);
    }

    #[test]
    fn test_always_enabled_options() {
        let pkg = package(OptionGroupKind::Free, &["DOCS", "X11"], &[]);
        assert_eq!(generate(&pkg), vec!["-DOCS", "+X11"]);
    }

    #[test]
    fn test_include_and_exclude() {
        let pkg = package(OptionGroupKind::Free, &["A", "B", "C"], &[]);
        let filter = OptionFilter {
            include: Some(["A".to_string(), "B".to_string()].into()),
            exclude: ["B".to_string()].into(),
        };
        assert_eq!(render(&generate_combinations(&pkg, &filter)), vec!["+A"]);
    }

    #[test]
    fn test_no_groups_means_no_combinations() {
        let pkg = Package::new("devel/plain".parse().unwrap());
        assert!(generate_combinations(&pkg, &OptionFilter::default()).is_empty());
    }

    #[test]
    fn test_selection_parse_and_display() {
        let sel: OptionSelection = "+SSL -DOCS,+X11".parse().unwrap();
        assert_eq!(sel.to_string(), "-DOCS +SSL +X11");
        assert_eq!(sel.enabled().collect::<Vec<_>>(), vec!["SSL", "X11"]);
        assert_eq!(sel.disabled().collect::<Vec<_>>(), vec!["DOCS"]);
        assert!("SSL".parse::<OptionSelection>().is_err());
        assert!("default".parse::<OptionSelection>().unwrap().is_default());
        assert_eq!(OptionSelection::new().to_string(), "default");
    }

    #[test]
    fn test_digest_is_stable_and_distinct() {
        let a: OptionSelection = "+A".parse().unwrap();
        let b: OptionSelection = "-A".parse().unwrap();
        assert_eq!(a.digest(), a.clone().digest());
        assert_eq!(a.digest().len(), 8);
        assert_ne!(a.digest(), b.digest());
    }
}
