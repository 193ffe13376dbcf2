//! Base image download, unpacking and one-time setup.

use crate::environment::{EnvironmentDefinition, Tunables};
use crate::error::{InfraResult, InfrastructureError};
use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

pub const DEFAULT_MIRROR: &str = "https://download.freebsd.org/ftp/releases";

/// Directories every base gets, used as mountpoints inside the sandbox.
pub const BASE_DIRECTORIES: [&str; 5] = ["usr/ports", "distfiles", "work", "packages", "ccache"];

/// Provides the contents of a fresh base dataset.
#[async_trait]
pub trait BaseImageProvider: Send + Sync {
    /// Fill the empty directory `root` with the release's base system.
    async fn populate(&self, definition: &EnvironmentDefinition, root: &Path) -> InfraResult<()>;

    /// Install extra packages into a prepared base.
    async fn install_packages(&self, root: &Path, packages: &[String]) -> InfraResult<()> {
        if packages.is_empty() {
            return Ok(());
        }
        info!(root = %root.display(), packages = %packages.join(" "), "Installing base packages");
        let output = Command::new("pkg")
            .arg("-c")
            .arg(root)
            .args(["install", "-y"])
            .args(packages)
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(InfrastructureError::BaseUnavailable {
                environment: root.display().to_string(),
                reason: format!(
                    "pkg install failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

/// Path component of the release mirror for an architecture.
pub fn arch_path(arch: &str) -> String {
    match arch {
        "aarch64" => "arm64/aarch64".to_string(),
        "armv7" => "arm/armv7".to_string(),
        "powerpc64" | "powerpc64le" => format!("powerpc/{arch}"),
        "riscv64" => "riscv/riscv64".to_string(),
        other => other.to_string(),
    }
}

/// Downloads `base.txz` of a release from a mirror.
#[derive(Debug, Clone)]
pub struct ReleaseImageFetcher {
    mirror: String,
    cache_dir: PathBuf,
}

impl ReleaseImageFetcher {
    pub fn new(mirror: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            mirror: mirror.into(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn url(&self, definition: &EnvironmentDefinition) -> String {
        format!(
            "{}/{}/{}/base.txz",
            self.mirror.trim_end_matches('/'),
            arch_path(&definition.spec.arch),
            definition.spec.version
        )
    }

    fn download(url: &str, dest: &Path) -> Result<(), String> {
        if dest.exists() {
            debug!(path = %dest.display(), "Base image already downloaded");
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }

        info!(%url, "Fetching base image");
        let response = ureq::get(url)
            .timeout(Duration::from_secs(1800))
            .call()
            .map_err(|e| e.to_string())?;

        // write to a temporary name so an interrupted download is not reused
        let temp = dest.with_extension("tmp");
        let mut file = fs::File::create(&temp).map_err(|e| e.to_string())?;
        let mut reader = response.into_reader();
        let _ = io::copy(&mut reader, &mut file).map_err(|e| e.to_string())?;
        fs::rename(&temp, dest).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn unpack(archive: &Path, root: &Path) -> Result<(), String> {
        info!(archive = %archive.display(), root = %root.display(), "Unpacking base image");
        let file = fs::File::open(archive).map_err(|e| e.to_string())?;
        let decoder = xz2::read::XzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive.set_preserve_permissions(true);
        archive.set_preserve_ownerships(true);
        archive.unpack(root).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl BaseImageProvider for ReleaseImageFetcher {
    async fn populate(&self, definition: &EnvironmentDefinition, root: &Path) -> InfraResult<()> {
        let url = self.url(definition);
        let archive = self.cache_dir.join(format!(
            "{}-{}-base.txz",
            definition.spec.version, definition.spec.arch
        ));
        let root = root.to_path_buf();
        let task_url = url.clone();

        tokio::task::spawn_blocking(move || {
            Self::download(&task_url, &archive)?;
            Self::unpack(&archive, &root).inspect_err(|_| {
                // a corrupt cached image would fail every later attempt
                let _ = fs::remove_file(&archive);
            })
        })
        .await
        .map_err(|e| InfrastructureError::BaseImageFetch {
            url: url.clone(),
            reason: e.to_string(),
        })?
        .map_err(|reason| InfrastructureError::BaseImageFetch { url, reason })
    }
}

/// One-time setup of a freshly unpacked base: resolver, pkg branch and
/// sandbox mountpoints.
pub fn prepare_base_tree(root: &Path, tunables: &Tunables) -> io::Result<()> {
    let etc = root.join("etc");
    fs::create_dir_all(&etc)?;
    fs::write(etc.join("resolv.conf"), format!("nameserver {}\n", tunables.resolver))?;

    let pkg_conf = etc.join("pkg").join("FreeBSD.conf");
    if pkg_conf.exists() {
        let contents = fs::read_to_string(&pkg_conf)?;
        let branch = &tunables.pkg_branch;
        let updated = contents
            .replace("quarterly", branch)
            .replace("latest", branch);
        fs::write(&pkg_conf, updated)?;
    }

    for dir in BASE_DIRECTORIES {
        fs::create_dir_all(root.join(dir))?;
    }
    if tunables.tmpfs.localbase {
        fs::create_dir_all(root.join("usr/local"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn definition(arch: &str) -> EnvironmentDefinition {
        EnvironmentDefinition::new("x", "14.1-RELEASE", arch, Tunables::default(), vec![]).unwrap()
    }

    #[test]
    fn test_release_urls() {
        let fetcher = ReleaseImageFetcher::new(format!("{DEFAULT_MIRROR}/"), "/tmp");
        assert_eq!(
            fetcher.url(&definition("amd64")),
            "https://download.freebsd.org/ftp/releases/amd64/14.1-RELEASE/base.txz"
        );
        assert_eq!(
            fetcher.url(&definition("aarch64")),
            "https://download.freebsd.org/ftp/releases/arm64/aarch64/14.1-RELEASE/base.txz"
        );
        assert_eq!(arch_path("riscv64"), "riscv/riscv64");
        assert_eq!(arch_path("powerpc64le"), "powerpc/powerpc64le");
    }

    #[test]
    fn test_prepare_base_tree() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("etc/pkg")).unwrap();
        fs::write(
            tmp.path().join("etc/pkg/FreeBSD.conf"),
            "url: \"pkg+http://pkg.FreeBSD.org/${ABI}/quarterly\",\n",
        )
        .unwrap();

        prepare_base_tree(tmp.path(), &Tunables::default()).unwrap();

        assert_eq!(
            fs::read_to_string(tmp.path().join("etc/resolv.conf")).unwrap(),
            "nameserver 8.8.8.8\n"
        );
        assert!(
            fs::read_to_string(tmp.path().join("etc/pkg/FreeBSD.conf"))
                .unwrap()
                .contains("/latest\"")
        );
        for dir in BASE_DIRECTORIES {
            assert!(tmp.path().join(dir).is_dir(), "{dir}");
        }
    }

    #[tokio::test]
    async fn test_unreachable_mirror() {
        let tmp = TempDir::new().unwrap();
        let fetcher = ReleaseImageFetcher::new("http://127.0.0.1:9", tmp.path());
        let err = fetcher
            .populate(&definition("amd64"), &tmp.path().join("root"))
            .await
            .unwrap_err();
        assert!(matches!(err, InfrastructureError::BaseImageFetch { .. }), "{err}");
        assert!(!err.is_host_global());
    }
}
