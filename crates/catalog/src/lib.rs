use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use fedra_contracts::{
    CatalogSpec, Column, Manifest, OptionKind, ScoreTimelineOption, UPLOADS_CATALOG_ID,
};

pub mod infer;

#[derive(Debug)]
pub enum CatalogError {
    ManifestMissing,
    ManifestInvalid(String),
    UnknownCatalog(String),
    UnknownFile { catalog: String, file: String },
    Io(std::io::Error),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::ManifestMissing => write!(f, "data manifest not found"),
            CatalogError::ManifestInvalid(detail) => write!(f, "data manifest invalid: {}", detail),
            CatalogError::UnknownCatalog(id) => write!(f, "unknown catalog `{}`", id),
            CatalogError::UnknownFile { catalog, file } => {
                write!(f, "unknown file `{}` in catalog `{}`", file, catalog)
            }
            CatalogError::Io(err) => write!(f, "catalog io error: {}", err),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<std::io::Error> for CatalogError {
    fn from(value: std::io::Error) -> Self {
        CatalogError::Io(value)
    }
}

struct CachedManifest {
    mtime: SystemTime,
    catalogs: Vec<CatalogSpec>,
}

/// Typed, cached view over the manifest plus the synthetic uploads catalog.
///
/// The cache is single-writer: reloads happen under the write lock when the
/// manifest mtime moves or a mutation (upload, explicit invalidation) marks
/// it dirty. Readers get cloned snapshots.
pub struct CatalogRegistry {
    manifest_path: PathBuf,
    node_root: PathBuf,
    sample_rows: usize,
    cache: RwLock<Option<CachedManifest>>,
    uploads: RwLock<Option<CatalogSpec>>,
    dirty: AtomicBool,
}

impl CatalogRegistry {
    pub fn new(node_root: impl Into<PathBuf>, manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            node_root: node_root.into(),
            sample_rows: 200,
            cache: RwLock::new(None),
            uploads: RwLock::new(None),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn with_sample_rows(mut self, sample_rows: usize) -> Self {
        self.sample_rows = sample_rows.max(1);
        self
    }

    pub fn node_root(&self) -> &Path {
        &self.node_root
    }

    /// Absolute location of a manifest-relative file path. Parent components
    /// and absolute paths are rejected so a manifest cannot point outside the
    /// node root.
    pub fn resolve_path(&self, relative: &str) -> Result<PathBuf, CatalogError> {
        let rel = Path::new(relative);
        if rel.is_absolute() || !is_safe_rel_path(rel) {
            return Err(CatalogError::ManifestInvalid(format!(
                "file path `{}` must be relative without parent components",
                relative
            )));
        }
        Ok(self.node_root.join(rel))
    }

    /// Installs or replaces the synthetic uploads catalog (single writer: the
    /// upload store).
    pub fn install_uploads_catalog(&self, catalog: CatalogSpec) {
        debug_assert_eq!(catalog.id, UPLOADS_CATALOG_ID);
        let mut slot = self.uploads.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(catalog);
        self.invalidate();
    }

    pub fn invalidate(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn load_manifest(&self) -> Result<Manifest, CatalogError> {
        let bytes = match std::fs::read(&self.manifest_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CatalogError::ManifestMissing);
            }
            Err(err) => return Err(CatalogError::Io(err)),
        };

        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|err| CatalogError::ManifestInvalid(err.to_string()))?;
        manifest.validate().map_err(CatalogError::ManifestInvalid)?;
        Ok(manifest)
    }

    /// All catalogs, enriched with existence bits, actual record counts for
    /// tabular files, and inferred columns where the manifest declared none.
    pub fn list_catalogs(&self) -> Result<Vec<CatalogSpec>, CatalogError> {
        let mut catalogs = self.manifest_catalogs()?;
        let uploads = self.uploads.read().unwrap_or_else(|e| e.into_inner());
        if let Some(uploads) = uploads.as_ref() {
            catalogs.push(uploads.clone());
        }
        Ok(catalogs)
    }

    pub fn get_catalog(&self, id: &str) -> Result<CatalogSpec, CatalogError> {
        self.list_catalogs()?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| CatalogError::UnknownCatalog(id.to_string()))
    }

    /// Declared columns when the manifest carries them, otherwise an inferred
    /// schema from the header and a bounded sample.
    pub fn schema_of(&self, catalog_id: &str, file_name: &str) -> Result<Vec<Column>, CatalogError> {
        let catalog = self.get_catalog(catalog_id)?;
        let entry = catalog
            .file(file_name)
            .ok_or_else(|| CatalogError::UnknownFile {
                catalog: catalog_id.to_string(),
                file: file_name.to_string(),
            })?;

        if let Some(columns) = &entry.columns
            && !columns.is_empty()
        {
            return Ok(columns.clone());
        }

        let Some(delimiter) = entry.kind.delimiter() else {
            return Ok(Vec::new());
        };

        let path = self.resolve_path(&entry.path)?;
        let (header, rows) = infer::read_sample(&path, delimiter, self.sample_rows)?;
        Ok(infer::infer_columns(&header, &rows))
    }

    /// Score/timeline options projected from the catalog metadata arrays
    /// `score_options` and `timeline_options`.
    pub fn score_timeline(
        &self,
        catalog_id: &str,
    ) -> Result<Vec<ScoreTimelineOption>, CatalogError> {
        let catalog = self.get_catalog(catalog_id)?;

        let mut options = Vec::new();
        for (key, kind) in [
            ("score_options", OptionKind::Score),
            ("timeline_options", OptionKind::Timeline),
        ] {
            let Some(values) = catalog.metadata.get(key).and_then(|v| v.as_array()) else {
                continue;
            };
            for value in values {
                let Some(name) = value.get("name").and_then(|v| v.as_str()) else {
                    continue;
                };
                let Some(option_value) = value.get("value").and_then(|v| v.as_str()) else {
                    continue;
                };
                options.push(ScoreTimelineOption {
                    kind,
                    name: name.to_string(),
                    value: option_value.to_string(),
                    description: value
                        .get("description")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    is_default: value
                        .get("default")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                });
            }
        }

        Ok(options)
    }

    fn manifest_catalogs(&self) -> Result<Vec<CatalogSpec>, CatalogError> {
        let mtime = std::fs::metadata(&self.manifest_path)
            .and_then(|m| m.modified())
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => CatalogError::ManifestMissing,
                _ => CatalogError::Io(err),
            })?;

        if !self.dirty.load(Ordering::Acquire) {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.as_ref()
                && cached.mtime == mtime
            {
                return Ok(cached.catalogs.clone());
            }
        }

        let manifest = self.load_manifest()?;
        let catalogs = manifest
            .catalogs
            .into_iter()
            .map(|catalog| self.enrich(catalog))
            .collect::<Vec<_>>();

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        *cache = Some(CachedManifest {
            mtime,
            catalogs: catalogs.clone(),
        });
        self.dirty.store(false, Ordering::Release);

        Ok(catalogs)
    }

    fn enrich(&self, mut catalog: CatalogSpec) -> CatalogSpec {
        for entry in &mut catalog.files {
            let Ok(path) = self.resolve_path(&entry.path) else {
                entry.exists = false;
                continue;
            };

            entry.exists = path.exists();
            if !entry.exists {
                continue;
            }

            if entry.kind.is_tabular() {
                match infer::count_data_rows(&path) {
                    Ok(count) => entry.record_count = Some(count),
                    Err(err) => {
                        tracing::warn!(
                            catalog_id = %catalog.id,
                            file = %entry.name,
                            error = %err,
                            "failed to count records"
                        );
                    }
                }

                if entry.columns.as_ref().is_none_or(|c| c.is_empty())
                    && let Some(delimiter) = entry.kind.delimiter()
                {
                    match infer::read_sample(&path, delimiter, self.sample_rows) {
                        Ok((header, rows)) => {
                            entry.columns = Some(infer::infer_columns(&header, &rows));
                        }
                        Err(err) => {
                            tracing::warn!(
                                catalog_id = %catalog.id,
                                file = %entry.name,
                                error = %err,
                                "failed to infer schema"
                            );
                        }
                    }
                }
            }
        }

        catalog
    }
}

fn is_safe_rel_path(path: &Path) -> bool {
    use std::path::Component;
    path.components()
        .all(|c| matches!(c, Component::Normal(_)))
}
