use crate::config::RouteFile;
use crate::proxy::filter::FilterRegistry;
use crate::routing::Route;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

/// Supplies compiled routes. External data sources (Kubernetes, etcd, ...)
/// implement this; the crate ships the file-backed one.
pub trait RouteSource: Send + Sync {
    fn load(&self) -> Result<Vec<Route>>;
}

/// Reads route definitions from a TOML file and compiles them against the
/// filter registry. Reloading is re-running `load` and swapping the table.
pub struct FileRouteSource {
    path: PathBuf,
    registry: Arc<FilterRegistry>,
}

impl FileRouteSource {
    pub fn new(path: PathBuf, registry: Arc<FilterRegistry>) -> Self {
        Self { path, registry }
    }
}

impl RouteSource for FileRouteSource {
    fn load(&self) -> Result<Vec<Route>> {
        let file = RouteFile::load(&self.path)?;
        file.routes
            .iter()
            .map(|def| Route::compile(def, &self.registry))
            .collect()
    }
}
