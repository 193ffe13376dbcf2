//! Metadata read from a ports tree with `make -V`.

use super::MetadataReader;
use crate::error::{MetadataError, MetadataResult};
use crate::package::{
    Dependency, DependencyKind, FlagKind, OptionGroup, OptionGroupKind, Package, PackageFlag,
    PackageId,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Variables holding dependency lists, with the kind each maps to.
const DEPENDS_VARS: [(&str, DependencyKind); 7] = [
    ("EXTRACT_DEPENDS", DependencyKind::Extract),
    ("PATCH_DEPENDS", DependencyKind::Patch),
    ("BUILD_DEPENDS", DependencyKind::Build),
    ("LIB_DEPENDS", DependencyKind::Build),
    ("PKG_DEPENDS", DependencyKind::Build),
    ("RUN_DEPENDS", DependencyKind::Run),
    ("TEST_DEPENDS", DependencyKind::Test),
];

const FLAG_VARS: [(&str, FlagKind); 2] = [("BROKEN", FlagKind::Broken), ("IGNORE", FlagKind::Ignore)];

const GROUP_VARS: [(&str, OptionGroupKind); 4] = [
    ("OPTIONS_GROUP", OptionGroupKind::Group),
    ("OPTIONS_SINGLE", OptionGroupKind::Single),
    ("OPTIONS_RADIO", OptionGroupKind::Radio),
    ("OPTIONS_MULTI", OptionGroupKind::Multi),
];

/// Reads port metadata by querying the ports framework.
///
/// Each package is queried once per reader; results are cached.
pub struct PortsTreeReader {
    portsdir: PathBuf,
    make: String,
    cache: Mutex<HashMap<PackageId, Arc<Package>>>,
}

impl PortsTreeReader {
    pub fn new(portsdir: impl Into<PathBuf>) -> Self {
        // elsewhere make is usually GNU make, but the framework needs BSD make
        let make = if cfg!(target_os = "freebsd") { "make" } else { "bmake" };
        Self::with_make(portsdir, make)
    }

    pub fn with_make(portsdir: impl Into<PathBuf>, make: impl Into<String>) -> Self {
        Self {
            portsdir: portsdir.into(),
            make: make.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn query(&self, id: &PackageId, vars: &[String]) -> MetadataResult<Vec<String>> {
        let dir = self.portsdir.join(id.origin());
        let mut command = Command::new(&self.make);
        let _ = command.arg("-C").arg(&dir).kill_on_drop(true);
        if let Some(flavor) = id.flavor() {
            let _ = command.env("FLAVOR", flavor);
        }
        for var in vars {
            let _ = command.arg("-V").arg(var);
        }

        let output = command.output().await?;
        if !output.status.success() {
            return Err(MetadataError::Query {
                package: id.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        if lines.len() != vars.len() {
            return Err(MetadataError::Query {
                package: id.clone(),
                reason: format!("expected {} values, got {}", vars.len(), lines.len()),
            });
        }
        Ok(lines)
    }

    async fn load(&self, id: &PackageId) -> MetadataResult<Package> {
        let mut vars: Vec<String> = DEPENDS_VARS.iter().map(|(v, _)| v.to_string()).collect();
        vars.extend(FLAG_VARS.iter().map(|(v, _)| v.to_string()));
        vars.extend(["OPTIONS_DEFINE", "OPTIONS_DEFAULT"].map(String::from));
        vars.extend(GROUP_VARS.iter().map(|(v, _)| v.to_string()));

        let values = self.query(id, &vars).await?;
        let table: HashMap<&str, &str> = vars
            .iter()
            .map(String::as_str)
            .zip(values.iter().map(String::as_str))
            .collect();
        let value = |name: &str| table.get(name).copied().unwrap_or_default();

        let mut package = Package::new(id.clone());
        for (var, kind) in DEPENDS_VARS {
            package.dependencies.extend(parse_depends(value(var), kind)?);
        }
        for (var, kind) in FLAG_VARS {
            let reason = value(var).trim();
            if !reason.is_empty() {
                package.flags.push(PackageFlag {
                    kind,
                    reason: reason.to_string(),
                });
            }
        }

        let defaults = words(value("OPTIONS_DEFAULT"));
        let define: Vec<String> = value("OPTIONS_DEFINE").split_whitespace().map(String::from).collect();
        if !define.is_empty() {
            package.option_groups.push(group(OptionGroupKind::Free, String::new(), define, &defaults));
        }

        // members of named groups need a second query
        let mut named = Vec::new();
        for (var, kind) in GROUP_VARS {
            for name in value(var).split_whitespace() {
                named.push((kind, name.to_string(), format!("{var}_{name}")));
            }
        }
        if !named.is_empty() {
            let member_vars: Vec<String> = named.iter().map(|(_, _, v)| v.clone()).collect();
            let members = self.query(id, &member_vars).await?;
            for ((kind, name, _), options) in named.into_iter().zip(members) {
                let options = options.split_whitespace().map(String::from).collect();
                package.option_groups.push(group(kind, name, options, &defaults));
            }
        }

        debug!(
            package = %id,
            dependencies = package.dependencies.len(),
            option_groups = package.option_groups.len(),
            "Read port metadata"
        );
        Ok(package)
    }
}

fn words(value: &str) -> BTreeSet<String> {
    value.split_whitespace().map(String::from).collect()
}

fn group(
    kind: OptionGroupKind,
    name: String,
    options: Vec<String>,
    defaults: &BTreeSet<String>,
) -> OptionGroup {
    let selected = options.iter().filter(|o| defaults.contains(*o)).cloned().collect();
    OptionGroup {
        kind,
        name,
        options,
        selected,
    }
}

/// Parse a dependency list such as
/// `python3.11:lang/python311 ${LOCALBASE}/bin/pytest:devel/py-pytest@py311`.
///
/// The origin may carry a ports directory prefix and a trailing `:target`.
pub fn parse_depends(value: &str, kind: DependencyKind) -> MetadataResult<Vec<Dependency>> {
    let mut deps = Vec::new();
    for entry in value.split_whitespace() {
        let mut fields = entry.split(':');
        let origin = match (fields.next(), fields.next()) {
            (Some(_), Some(origin)) => origin,
            _ => {
                warn!(%entry, "Ignoring dependency without origin");
                continue;
            }
        };
        // strip `/usr/ports/` style prefixes, keeping category/name[@flavor]
        let parts: Vec<&str> = origin.trim_end_matches('/').rsplitn(3, '/').collect();
        let origin = match parts.as_slice() {
            [name, category, ..] => format!("{category}/{name}"),
            _ => origin.to_string(),
        };
        deps.push(Dependency {
            package: PackageId::parse(&origin)?,
            kind,
        });
    }
    Ok(deps)
}

#[async_trait]
impl MetadataReader for PortsTreeReader {
    async fn read(&self, id: &PackageId) -> MetadataResult<Arc<Package>> {
        if let Some(package) = self.cache.lock().await.get(id) {
            return Ok(Arc::clone(package));
        }
        let package = Arc::new(self.load(id).await?);
        let _ = self
            .cache
            .lock()
            .await
            .insert(id.clone(), Arc::clone(&package));
        Ok(package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_depends() {
        let deps = parse_depends(
            "python3.11:lang/python311 ${LOCALBASE}/bin/pytest:/usr/ports/devel/py-pytest@py311 \
             libfoo.so:devel/foo:build",
            DependencyKind::Build,
        )
        .unwrap();
        let origins: Vec<String> = deps.iter().map(|d| d.package.to_string()).collect();
        assert_eq!(origins, vec!["lang/python311", "devel/py-pytest@py311", "devel/foo"]);
        assert!(deps.iter().all(|d| d.kind == DependencyKind::Build));
    }

    #[test]
    fn test_parse_depends_skips_bare_entries() {
        assert!(parse_depends("nodelimiter", DependencyKind::Run).unwrap().is_empty());
        assert!(parse_depends("", DependencyKind::Run).unwrap().is_empty());
        assert!(parse_depends("x:noslash", DependencyKind::Run).is_err());
    }

    /// A fake `make` printing canned answers in the order variables are queried.
    fn fake_make(dir: &TempDir, script: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("make");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_reads_port_variables() {
        let tmp = TempDir::new().unwrap();
        // first call: 7 depends, 2 flags, define, default, 4 group lists;
        // second call: members of the single group
        let make = fake_make(
            &tmp,
            r#"case "$*" in
  *OPTIONS_SINGLE_SSL*) echo "OPENSSL LIBRESSL" ;;
  *) printf '%s\n' '' '' 'cc:devel/cc' '' '' 'lib:devel/lib' 'pytest:devel/pytest' \
       '' 'unfetchable' 'DOCS X11' 'DOCS OPENSSL' '' 'SSL' '' '' ;;
esac"#,
        );
        let reader = PortsTreeReader::with_make(tmp.path(), make);
        let id: PackageId = "www/app".parse().unwrap();
        let package = reader.read(&id).await.unwrap();

        let deps: Vec<String> = package
            .dependencies
            .iter()
            .map(|d| format!("{}:{}", d.kind, d.package))
            .collect();
        assert_eq!(deps, vec!["build:devel/cc", "run:devel/lib", "test:devel/pytest"]);
        assert_eq!(package.skip_flag().unwrap().reason, "unfetchable");
        assert_eq!(package.option_groups.len(), 2);
        assert_eq!(package.option_groups[1].kind, OptionGroupKind::Single);
        assert_eq!(package.option_groups[1].name, "SSL");
        assert!(package.option_groups[1].selected.contains("OPENSSL"));

        // cached: same allocation on a second read
        let again = reader.read(&id).await.unwrap();
        assert!(Arc::ptr_eq(&package, &again));
    }

    #[tokio::test]
    async fn test_short_output_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let make = fake_make(&tmp, "echo only-one-line");
        let reader = PortsTreeReader::with_make(tmp.path(), make);
        let err = reader.read(&"www/app".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, MetadataError::Query { .. }), "{err}");
    }
}
