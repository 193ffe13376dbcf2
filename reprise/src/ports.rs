//! Port list collection from arguments, list files and the working directory.

use convenient_ports::PackageId;
use std::collections::HashSet;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Origin of the port in `dir`: its path below `portsdir`, or its last two
/// components when it lives elsewhere.
pub fn origin_of(dir: &Path, portsdir: &Path) -> Option<String> {
    if let Ok(relative) = dir.strip_prefix(portsdir) {
        let parts: Vec<_> = relative.iter().filter_map(|c| c.to_str()).collect();
        if parts.len() == 2 {
            return Some(parts.join("/"));
        }
    }
    let name = dir.file_name()?.to_str()?;
    let category = dir.parent()?.file_name()?.to_str()?;
    Some(format!("{category}/{name}"))
}

/// Entries of a port list: one origin per line, `#` starts a comment.
pub fn parse_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_list(file: &Path) -> io::Result<String> {
    if file == Path::new("-") {
        let mut text = String::new();
        let _ = io::stdin().read_to_string(&mut text)?;
        Ok(text)
    } else {
        std::fs::read_to_string(file)
    }
}

/// Every requested port, in request order.
///
/// Repeats are kept: a port named twice is built twice on each environment.
pub fn collect(
    args: &[String],
    file: Option<&Path>,
    portsdir: &Path,
) -> Result<Vec<PackageId>, Box<dyn std::error::Error + Send + Sync>> {
    let mut entries = Vec::new();
    if let Some(file) = file {
        let text = read_list(file).map_err(|e| format!("failed to read {}: {}", file.display(), e))?;
        entries.extend(parse_list(&text));
    }
    for arg in args {
        if arg == "." {
            let cwd: PathBuf = std::env::current_dir()?;
            let origin = origin_of(&cwd, portsdir)
                .ok_or_else(|| format!("{} is not a port directory", cwd.display()))?;
            entries.push(origin);
        } else {
            entries.push(arg.trim_end_matches('/').to_string());
        }
    }

    let ports = entries
        .iter()
        .map(|entry| entry.parse::<PackageId>())
        .collect::<Result<Vec<_>, _>>()?;
    if ports.is_empty() {
        return Err("no ports given".into());
    }
    Ok(ports)
}

/// Ports named more than once.
pub fn repeated(ports: &[PackageId]) -> Vec<&PackageId> {
    let mut seen = HashSet::new();
    ports.iter().filter(|p| !seen.insert(*p)).collect()
}
