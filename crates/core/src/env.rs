//! Execution-environment detection and script locator synthesis.

use std::fmt;
use std::path::PathBuf;

/// The kind of execution context available for hosting workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnv {
    /// Dedicated OS threads are available; worker scripts may block.
    Threaded,
    /// Only cooperative tasks are available; worker scripts must be async.
    Cooperative,
}

impl RuntimeEnv {
    /// Detects the hosting environment.
    ///
    /// Single-core machines and single-threaded executors get the
    /// cooperative environment; everything else gets dedicated threads.
    pub fn detect() -> Self {
        match std::thread::available_parallelism() {
            Ok(n) if n.get() > 1 => RuntimeEnv::Threaded,
            _ => RuntimeEnv::Cooperative,
        }
    }
}

/// Where a worker script lives: a file path in a threaded server runtime,
/// a URL in a hosted script environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLocator {
    /// Script file on the local filesystem.
    Path(PathBuf),
    /// Script resource reachable by URL.
    Url(String),
}

impl ScriptLocator {
    /// Synthesizes the conventional locator for a named worker script
    /// under a base directory or base URL, per environment.
    pub fn for_worker(env: RuntimeEnv, base: &str, name: &str) -> Self {
        match env {
            RuntimeEnv::Threaded => {
                ScriptLocator::Path(PathBuf::from(base).join(format!("{name}.worker.js")))
            }
            RuntimeEnv::Cooperative => {
                let base = base.trim_end_matches('/');
                ScriptLocator::Url(format!("{base}/{name}.worker.js"))
            }
        }
    }
}

impl fmt::Display for ScriptLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptLocator::Path(p) => write!(f, "{}", p.display()),
            ScriptLocator::Url(u) => write!(f, "{u}"),
        }
    }
}
