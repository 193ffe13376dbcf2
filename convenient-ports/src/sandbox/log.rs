//! Per-job log file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

const WIDTH: usize = 80;

/// Append-only log shared by every phase of one job.
#[derive(Debug)]
pub struct JobLog {
    path: PathBuf,
    file: File,
}

impl JobLog {
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A framed section title:
    ///
    /// ```text
    /// ================================================================================
    /// = Build phase ==================================================================
    /// ================================================================================
    /// ```
    pub fn banner(&mut self, title: &str) -> io::Result<()> {
        let rule = "=".repeat(WIDTH);
        let mut heading = format!("= {title} ");
        if heading.len() < WIDTH {
            heading.push_str(&"=".repeat(WIDTH - heading.len()));
        }
        writeln!(self.file, "{rule}\n{heading}\n{rule}")?;
        self.file.flush()
    }

    pub fn line(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.file, "{text}")
    }

    /// Handles for a child's stdout and stderr.
    pub fn stdio(&self) -> io::Result<(Stdio, Stdio)> {
        Ok((
            Stdio::from(self.file.try_clone()?),
            Stdio::from(self.file.try_clone()?),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_banner_width() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("r1/env/devel_x.log");
        let mut log = JobLog::create(&path).unwrap();
        log.banner("Fetch phase").unwrap();
        log.line("done").unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[..3].iter().all(|l| l.len() == WIDTH));
        assert!(lines[1].starts_with("= Fetch phase ==="));
        assert_eq!(lines[3], "done");
    }
}
