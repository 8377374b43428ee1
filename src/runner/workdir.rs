//! Run working directories.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::model::{ModelDefinition, RestartFile};
use crate::Result;

/// The kernel's redirected run log, kept by every cleanup.
pub const RUN_LOG_FILE_NAME: &str = "dimr_redirected.log";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
    /// Paths that could not be removed, with the error text.
    pub failures: Vec<(PathBuf, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RunWorkingDirectory {
    path: PathBuf,
    ignored: BTreeSet<PathBuf>,
}

impl RunWorkingDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let mut ignored = BTreeSet::new();
        ignored.insert(PathBuf::from(RUN_LOG_FILE_NAME));
        Self {
            path: path.into(),
            ignored,
        }
    }

    pub fn for_model(root: &Path, model: &ModelDefinition) -> Self {
        let mut workdir = Self::new(root.join(&model.export_directory));
        for path in &model.ignored_paths {
            workdir.ignore(path);
        }
        workdir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keeps `path` (relative to the directory, or absolute inside it) and,
    /// for directories, everything below it.
    pub fn ignore(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let relative = path.strip_prefix(&self.path).unwrap_or(path);
        self.ignored.insert(relative.to_path_buf());
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.path).unwrap_or(path);
        self.ignored.iter().any(|kept| relative.starts_with(kept))
    }

    /// Creates the directory when missing, otherwise cleans it.
    pub fn prepare(&self) -> Result<CleanupReport> {
        self.prepare_with(|path| fs::remove_file(path))
    }

    pub fn prepare_with(&self, remove: impl FnMut(&Path) -> io::Result<()>) -> Result<CleanupReport> {
        if self.path.is_dir() {
            Ok(self.clean_with(remove))
        } else {
            fs::create_dir_all(&self.path)?;
            Ok(CleanupReport::default())
        }
    }

    pub fn clean(&self) -> CleanupReport {
        self.clean_with(|path| fs::remove_file(path))
    }

    /// Removes every file not ignored using `remove`. Failures are recorded
    /// in the report and never returned.
    pub fn clean_with(&self, mut remove: impl FnMut(&Path) -> io::Result<()>) -> CleanupReport {
        let mut report = CleanupReport::default();
        if self.path.is_dir() {
            self.clean_dir(&self.path, &mut remove, &mut report);
        }
        for (path, reason) in &report.failures {
            warn!(path = %path.display(), reason = %reason, "could not remove file from working directory");
        }
        debug!(
            path = %self.path.display(),
            removed = report.removed.len(),
            kept = report.kept.len(),
            "cleaned working directory"
        );
        report
    }

    fn clean_dir(
        &self,
        dir: &Path,
        remove: &mut impl FnMut(&Path) -> io::Result<()>,
        report: &mut CleanupReport,
    ) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                report.failures.push((dir.to_path_buf(), e.to_string()));
                return;
            }
        };

        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        paths.sort();

        for path in paths {
            if self.is_ignored(&path) {
                report.kept.push(path);
            } else if path.is_dir() {
                self.clean_dir(&path, remove, report);
                // Only succeeds once the directory is empty.
                let _ = fs::remove_dir(&path);
            } else {
                match remove(&path) {
                    Ok(()) => report.removed.push(path),
                    Err(e) => report.failures.push((path, e.to_string())),
                }
            }
        }
    }

    /// Restart files (`*_rst.*`) at the top level, ordered by name.
    pub fn collect_restart_files(&self) -> Vec<RestartFile> {
        let Ok(entries) = fs::read_dir(&self.path) else {
            return Vec::new();
        };

        let mut files: Vec<RestartFile> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.contains("_rst.") {
                    return None;
                }
                match fs::read(entry.path()) {
                    Ok(content) => Some(RestartFile::new(name, content)),
                    Err(e) => {
                        warn!(file = %name, error = %e, "could not read restart file");
                        None
                    }
                }
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.path.join(RUN_LOG_FILE_NAME)
    }

    /// Full text of the redirected run log, if the kernel wrote one.
    pub fn read_run_log(&self) -> Option<String> {
        let file = fs::File::open(self.run_log_path()).ok()?;
        match read_complete_stream(file) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(error = %e, "could not read the kernel run log");
                None
            }
        }
    }
}

/// Reads `reader` to the end. Invalid UTF-8 is replaced, not rejected.
pub fn read_complete_stream(mut reader: impl Read) -> io::Result<String> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
