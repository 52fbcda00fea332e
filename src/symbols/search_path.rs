use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable holding extra symbol directories, separated like `PATH`.
pub const SYMBOL_PATH_VAR: &str = "LEAKWATCH_SYMBOL_PATH";

#[cfg(unix)]
const SYSTEM_SYMBOL_DIRS: &[&str] = &["/usr/lib/debug"];
#[cfg(not(unix))]
const SYSTEM_SYMBOL_DIRS: &[&str] = &[];

/// Directories where debug information is expected, in priority order.
///
/// Built from the running executable's directory, the working directory, the system debug
/// directories and finally [`SYMBOL_PATH_VAR`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolSearchPath {
    dirs: Vec<PathBuf>,
}

impl SymbolSearchPath {
    /// Builds the search path of the current process.
    pub fn build() -> Self {
        Self::from_parts(
            std::env::current_exe().ok().as_deref(),
            std::env::var_os(SYMBOL_PATH_VAR),
        )
    }

    pub fn from_parts(executable: Option<&Path>, extra: Option<OsString>) -> Self {
        let mut path = Self::default();
        if let Some(dir) = executable.and_then(Path::parent) {
            path.push(dir.to_path_buf());
        }
        path.push(PathBuf::from("."));
        for dir in SYSTEM_SYMBOL_DIRS {
            path.push(PathBuf::from(dir));
        }
        if let Some(extra) = extra {
            for dir in std::env::split_paths(&extra) {
                // quotes are not part of a directory name
                let dir = dir.to_string_lossy().replace('"', "");
                if !dir.is_empty() {
                    path.push(PathBuf::from(dir));
                }
            }
        }
        path
    }

    fn push(&mut self, dir: PathBuf) {
        if !self.dirs.contains(&dir) {
            self.dirs.push(dir);
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }
}

impl fmt::Display for SymbolSearchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let separator = if cfg!(windows) { ';' } else { ':' };
        for (index, dir) in self.dirs.iter().enumerate() {
            if index > 0 {
                write!(f, "{separator}")?;
            }
            write!(f, "{}", dir.display())?;
        }
        Ok(())
    }
}
