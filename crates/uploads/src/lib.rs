use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fedra_catalog::CatalogRegistry;
use fedra_contracts::{
    AccessLevel, CatalogSpec, FileEntry, FileKind, PrivacyLevel, UPLOADS_CATALOG_ID, UploadKind,
    UploadedFile,
};
use ulid::Ulid;

const SCRIPT_EXTENSIONS: &[&str] = &["py", "r"];
const DATA_EXTENSIONS: &[&str] = &["csv", "tsv", "json", "npy", "npz", "mat", "nii", "nii.gz"];

#[derive(Debug)]
pub enum UploadError {
    InvalidExtension(String),
    TooLarge { limit: u64 },
    NotFound(String),
    Io(std::io::Error),
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::InvalidExtension(ext) => {
                write!(f, "file extension `{}` is not allowed", ext)
            }
            UploadError::TooLarge { limit } => {
                write!(f, "upload exceeds the {} byte limit", limit)
            }
            UploadError::NotFound(id) => write!(f, "uploaded file `{}` not found", id),
            UploadError::Io(err) => write!(f, "upload io error: {}", err),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<std::io::Error> for UploadError {
    fn from(value: std::io::Error) -> Self {
        UploadError::Io(value)
    }
}

/// Append-only store for researcher-submitted scripts and data files.
///
/// Data uploads are mirrored into the synthetic `user-uploaded-files`
/// catalog so analyses can target them like any curated catalog.
pub struct UploadStore {
    root: PathBuf,
    node_root: PathBuf,
    max_bytes: u64,
    registry: Arc<CatalogRegistry>,
}

impl UploadStore {
    pub fn open(
        node_root: impl Into<PathBuf>,
        max_bytes: u64,
        registry: Arc<CatalogRegistry>,
    ) -> Result<Self, UploadError> {
        let node_root = node_root.into();
        let root = node_root.join("uploads");
        std::fs::create_dir_all(root.join("scripts"))?;
        std::fs::create_dir_all(root.join("data"))?;

        let store = Self {
            root,
            node_root,
            max_bytes,
            registry,
        };
        store.refresh_catalog()?;
        Ok(store)
    }

    pub fn put_script(&self, original_name: &str, bytes: &[u8]) -> Result<UploadedFile, UploadError> {
        self.put(UploadKind::Script, original_name, bytes)
    }

    pub fn put_data(&self, original_name: &str, bytes: &[u8]) -> Result<UploadedFile, UploadError> {
        let uploaded = self.put(UploadKind::Data, original_name, bytes)?;
        self.refresh_catalog()?;
        Ok(uploaded)
    }

    pub fn list(&self, kind: UploadKind) -> Result<Vec<UploadedFile>, UploadError> {
        let mut entries = Vec::new();
        for dir_entry in std::fs::read_dir(self.dir_for(kind))? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_file() {
                continue;
            }
            if let Some(uploaded) = self.describe(kind, &dir_entry.path()) {
                entries.push(uploaded);
            }
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    pub fn get(&self, id: &str) -> Result<UploadedFile, UploadError> {
        for kind in [UploadKind::Script, UploadKind::Data] {
            if let Some(found) = self.find_in(kind, id)? {
                return Ok(found);
            }
        }
        Err(UploadError::NotFound(id.to_string()))
    }

    pub fn path_of(&self, id: &str) -> Result<PathBuf, UploadError> {
        let uploaded = self.get(id)?;
        Ok(self.dir_for(uploaded.kind).join(uploaded.stored_name))
    }

    pub fn open_file(&self, id: &str) -> Result<(UploadedFile, std::fs::File), UploadError> {
        let uploaded = self.get(id)?;
        let path = self.dir_for(uploaded.kind).join(&uploaded.stored_name);
        Ok((uploaded, std::fs::File::open(path)?))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.get(id).is_ok()
    }

    /// Synthetic catalog over the data directory. Uploaded files are private
    /// and unrestricted by cohort policy beyond the floor of one.
    pub fn uploads_catalog(&self) -> Result<CatalogSpec, UploadError> {
        let mut files = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for uploaded in self.list(UploadKind::Data)? {
            let rel = format!("uploads/data/{}", uploaded.stored_name);
            // Logical names must stay unique within the catalog even when the
            // same filename is uploaded twice.
            let name = if seen.insert(uploaded.original_name.clone()) {
                uploaded.original_name.clone()
            } else {
                format!("{}_{}", uploaded.id, uploaded.original_name)
            };
            files.push(FileEntry {
                name,
                path: rel,
                kind: kind_from_extension(&uploaded.extension),
                description: Some(format!("uploaded file {}", uploaded.id)),
                columns: None,
                record_count: None,
                pattern: None,
                exists: true,
            });
        }

        Ok(CatalogSpec {
            id: UPLOADS_CATALOG_ID.to_string(),
            name: "User Uploaded Files".to_string(),
            description: "Files registered through the upload store".to_string(),
            access_level: AccessLevel::Private,
            privacy_level: PrivacyLevel::Medium,
            min_cohort_size: 1,
            files,
            metadata: serde_json::Map::new(),
        })
    }

    fn refresh_catalog(&self) -> Result<(), UploadError> {
        let catalog = self.uploads_catalog()?;
        self.registry.install_uploads_catalog(catalog);
        Ok(())
    }

    fn put(
        &self,
        kind: UploadKind,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<UploadedFile, UploadError> {
        if self.max_bytes > 0 && bytes.len() as u64 > self.max_bytes {
            return Err(UploadError::TooLarge {
                limit: self.max_bytes,
            });
        }

        let safe = sanitize_filename(original_name);
        let extension = extension_of(&safe);
        let allowed = match kind {
            UploadKind::Script => SCRIPT_EXTENSIONS,
            UploadKind::Data => DATA_EXTENSIONS,
        };
        if !allowed.contains(&extension.as_str()) {
            return Err(UploadError::InvalidExtension(extension));
        }

        let id = Ulid::new().to_string();
        let stored_name = format!("{}_{}", id, safe);
        let path = self.dir_for(kind).join(&stored_name);

        // create_new: an id collision or replay must never clobber a file.
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        let mut file = options.open(&path)?;
        std::io::Write::write_all(&mut file, bytes)?;

        tracing::info!(
            upload_id = %id,
            kind = kind.as_str(),
            size_bytes = bytes.len(),
            "upload stored"
        );

        Ok(UploadedFile {
            id,
            original_name: safe,
            stored_name,
            kind,
            extension,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        })
    }

    fn dir_for(&self, kind: UploadKind) -> PathBuf {
        match kind {
            UploadKind::Script => self.root.join("scripts"),
            UploadKind::Data => self.root.join("data"),
        }
    }

    fn find_in(&self, kind: UploadKind, id: &str) -> Result<Option<UploadedFile>, UploadError> {
        let prefix = format!("{}_", id);
        for dir_entry in std::fs::read_dir(self.dir_for(kind))? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                return Ok(self.describe(kind, &dir_entry.path()));
            }
        }
        Ok(None)
    }

    fn describe(&self, kind: UploadKind, path: &Path) -> Option<UploadedFile> {
        let stored_name = path.file_name()?.to_string_lossy().to_string();
        let (id, original_name) = stored_name.split_once('_')?;
        if id.is_empty() || original_name.is_empty() {
            return None;
        }

        let metadata = std::fs::metadata(path).ok()?;
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let extension = extension_of(original_name);
        Some(UploadedFile {
            id: id.to_string(),
            original_name: original_name.to_string(),
            stored_name,
            kind,
            extension,
            size_bytes: metadata.len(),
            created_at: created,
        })
    }

    pub fn node_root(&self) -> &Path {
        &self.node_root
    }
}

/// Keeps alphanumerics, dot, dash and underscore; everything else (path
/// separators, control characters, spaces) becomes an underscore. Leading
/// dots and underscores are stripped so a name can never be hidden or carry
/// a parent reference.
pub fn sanitize_filename(original: &str) -> String {
    let cleaned = original
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();

    let trimmed = cleaned.trim_start_matches(['.', '_']);
    let capped = trimmed.chars().take(120).collect::<String>();
    if capped.is_empty() {
        "upload".to_string()
    } else {
        capped
    }
}

/// Lowercased extension, treating `.nii.gz` as one unit.
pub fn extension_of(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".nii.gz") {
        return "nii.gz".to_string();
    }
    lower.rsplit_once('.').map(|(_, ext)| ext.to_string()).unwrap_or_default()
}

fn kind_from_extension(extension: &str) -> FileKind {
    match extension {
        "csv" => FileKind::Csv,
        "tsv" => FileKind::Tsv,
        "json" => FileKind::Json,
        "nii.gz" => FileKind::NiiGz,
        "nii" => FileKind::Nii,
        "npy" => FileKind::Npy,
        "npz" => FileKind::Npz,
        "mat" => FileKind::Mat,
        _ => FileKind::Unknown,
    }
}
