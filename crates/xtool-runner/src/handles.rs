//! Data handles: staged locations of port data for one chunk.
//!
//! Executors supply a [`DataHandleProvider`]; the local one stages plain
//! files, either at user-supplied paths or inside a per-run working
//! directory `<tmp>/<tool>_<datestamp>_<rand>/{input,output}/`.

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::HandleError;

/// Where one port's data of one chunk should be staged.
#[derive(Debug, Clone, Copy)]
pub struct HandleRequest<'a> {
    pub port: usize,
    /// Number of ports of the same direction.
    pub port_count: usize,
    pub chunk: usize,
    /// Extension of the port's file type, without the dot.
    pub extension: &'a str,
    /// User-supplied location, if any.
    pub suggested: Option<&'a Path>,
}

/// Staged input of one port.
pub trait InputHandle: Send + Sync {
    /// Location handed to the external tool.
    fn location(&self) -> &str;

    /// Open the staged location for writing, replacing previous content.
    fn open_write(&self) -> Result<Box<dyn Write + Send>, HandleError>;

    /// Whether opening will replace a file that existed before the run.
    fn overwrites_existing(&self) -> bool {
        false
    }

    /// Delete the staged artifact. Idempotent.
    fn clean_up(&self);
}

/// Staged output of one port.
pub trait OutputHandle: Send + Sync {
    fn location(&self) -> &str;

    /// Remove whatever sits at the location before the tool runs, so a
    /// stale file is never read back as the tool's output.
    fn prepare(&self) -> Result<(), HandleError> {
        Ok(())
    }

    /// Make the tool's output available as a local file and return its path.
    fn open_read(&self) -> Result<PathBuf, HandleError>;

    fn overwrites_existing(&self) -> bool {
        false
    }

    fn clean_up(&self);
}

/// Allocates handles for one run.
pub trait DataHandleProvider: Send + Sync {
    fn create_input(&self, request: &HandleRequest<'_>) -> Result<Arc<dyn InputHandle>, HandleError>;

    fn create_output(&self, request: &HandleRequest<'_>)
        -> Result<Arc<dyn OutputHandle>, HandleError>;

    /// Location of the run's working directory, once one was created.
    fn working_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Release run-level resources once all handles were cleaned up.
    fn clean_up(&self) {}
}

/// `base` with `_<suffix>` appended to the file stem for every suffix.
pub fn decorate_path(base: &Path, suffixes: &[String]) -> PathBuf {
    if suffixes.is_empty() {
        return base.to_path_buf();
    }
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = stem;
    for suffix in suffixes {
        name.push('_');
        name.push_str(suffix);
    }
    if let Some(ext) = base.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    base.with_file_name(name)
}

/// Suffixes disambiguating a user-supplied path: the port when several
/// ports exist, then the chunk when it is not the first.
fn explicit_suffixes(request: &HandleRequest<'_>) -> Vec<String> {
    let mut suffixes = Vec::new();
    if request.port_count > 1 {
        suffixes.push(request.port.to_string());
    }
    if request.chunk > 0 {
        suffixes.push(request.chunk.to_string());
    }
    suffixes
}

fn io_error(path: &Path, source: std::io::Error) -> HandleError {
    HandleError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// A local file. Files the provider allocated are deleted on clean-up;
/// user-supplied files are left in place.
#[derive(Debug)]
pub struct LocalFileHandle {
    path: PathBuf,
    location: String,
    owned: bool,
    existed: bool,
}

impl LocalFileHandle {
    fn new(path: PathBuf, owned: bool) -> Self {
        let existed = !owned && path.exists();
        Self {
            location: path.display().to_string(),
            path,
            owned,
            existed,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remove(&self) {
        if !self.owned {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Deleted {}", self.location),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete {}: {}", self.location, e),
        }
    }
}

impl InputHandle for LocalFileHandle {
    fn location(&self) -> &str {
        &self.location
    }

    fn open_write(&self) -> Result<Box<dyn Write + Send>, HandleError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let file = File::create(&self.path).map_err(|e| io_error(&self.path, e))?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn overwrites_existing(&self) -> bool {
        self.existed
    }

    fn clean_up(&self) {
        self.remove();
    }
}

impl OutputHandle for LocalFileHandle {
    fn location(&self) -> &str {
        &self.location
    }

    fn prepare(&self) -> Result<(), HandleError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Removed previous output {}", self.location);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    fn open_read(&self) -> Result<PathBuf, HandleError> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.is_file() => Ok(self.path.clone()),
            Ok(_) => Err(HandleError::Missing(self.location.clone())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(HandleError::Missing(self.location.clone()))
            }
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    fn overwrites_existing(&self) -> bool {
        self.existed
    }

    fn clean_up(&self) {
        self.remove();
    }
}

/// Stages port data as local files.
pub struct LocalHandleProvider {
    tmp_root: PathBuf,
    tool_name: String,
    work_dir: Mutex<Option<PathBuf>>,
}

impl LocalHandleProvider {
    pub fn new(tmp_root: impl Into<PathBuf>, tool_name: impl Into<String>) -> Self {
        Self {
            tmp_root: tmp_root.into(),
            tool_name: tool_name.into(),
            work_dir: Mutex::new(None),
        }
    }

    /// The run's working directory, created on first use.
    fn ensure_work_dir(&self) -> Result<PathBuf, HandleError> {
        let mut guard = self
            .work_dir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(dir) = guard.as_ref() {
            return Ok(dir.clone());
        }

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let rand = uuid::Uuid::new_v4().simple().to_string();
        let dir = self
            .tmp_root
            .join(format!("{}_{}_{}", self.tool_name, stamp, &rand[..8]));
        for sub in ["input", "output"] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(|e| io_error(&path, e))?;
        }
        debug!("Created working directory {}", dir.display());
        *guard = Some(dir.clone());
        Ok(dir)
    }

    fn allocate(&self, request: &HandleRequest<'_>, sub: &str) -> Result<LocalFileHandle, HandleError> {
        if let Some(path) = request.suggested {
            return Ok(LocalFileHandle::new(
                decorate_path(path, &explicit_suffixes(request)),
                false,
            ));
        }

        let dir = self.ensure_work_dir()?.join(sub);
        let mut name = format!("port{}", request.port);
        if request.chunk > 0 {
            name.push_str(&format!("_{}", request.chunk));
        }
        name.push('.');
        name.push_str(request.extension);
        Ok(LocalFileHandle::new(dir.join(name), true))
    }
}

impl DataHandleProvider for LocalHandleProvider {
    fn create_input(&self, request: &HandleRequest<'_>) -> Result<Arc<dyn InputHandle>, HandleError> {
        Ok(Arc::new(self.allocate(request, "input")?))
    }

    fn create_output(
        &self,
        request: &HandleRequest<'_>,
    ) -> Result<Arc<dyn OutputHandle>, HandleError> {
        Ok(Arc::new(self.allocate(request, "output")?))
    }

    fn working_dir(&self) -> Option<PathBuf> {
        self.work_dir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Remove the working directory if nothing is left in it.
    fn clean_up(&self) {
        let Some(dir) = self.working_dir() else {
            return;
        };
        for path in [dir.join("input"), dir.join("output"), dir.clone()] {
            match fs::remove_dir(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    debug!("Keeping {}: {}", path.display(), e);
                    return;
                }
            }
        }
        debug!("Removed working directory {}", dir.display());
    }
}
