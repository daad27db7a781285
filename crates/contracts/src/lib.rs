use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod canonical;
pub mod state;

pub use state::{RequestState, TransitionError, transition};

/// Catalog id reserved for files registered through the upload store.
pub const UPLOADS_CATALOG_ID: &str = "user-uploaded-files";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Public,
    Restricted,
    Private,
    #[serde(other)]
    Unknown,
}

impl Default for AccessLevel {
    fn default() -> Self {
        AccessLevel::Private
    }
}

impl AccessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::Public => "public",
            AccessLevel::Restricted => "restricted",
            AccessLevel::Private => "private",
            AccessLevel::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyLevel {
    Low,
    Medium,
    High,
    #[serde(other)]
    Unknown,
}

impl Default for PrivacyLevel {
    fn default() -> Self {
        PrivacyLevel::Medium
    }
}

impl PrivacyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PrivacyLevel::Low => "low",
            PrivacyLevel::Medium => "medium",
            PrivacyLevel::High => "high",
            PrivacyLevel::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Csv,
    Tsv,
    Json,
    Nifti,
    #[serde(rename = "nii.gz")]
    NiiGz,
    #[serde(rename = "nii")]
    Nii,
    Npy,
    Npz,
    Mat,
    #[serde(other)]
    Unknown,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Csv => "csv",
            FileKind::Tsv => "tsv",
            FileKind::Json => "json",
            FileKind::Nifti => "nifti",
            FileKind::NiiGz => "nii.gz",
            FileKind::Nii => "nii",
            FileKind::Npy => "npy",
            FileKind::Npz => "npz",
            FileKind::Mat => "mat",
            FileKind::Unknown => "unknown",
        }
    }

    /// Tabular files are parsed into rows by the loader; everything else is
    /// handed to the child as an opaque path.
    pub fn is_tabular(self) -> bool {
        matches!(self, FileKind::Csv | FileKind::Tsv)
    }

    pub fn delimiter(self) -> Option<u8> {
        match self {
            FileKind::Csv => Some(b','),
            FileKind::Tsv => Some(b'\t'),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Int,
    Float,
    Bool,
    Datetime,
    #[serde(other)]
    Unknown,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Bool => "bool",
            ColumnType::Datetime => "datetime",
            ColumnType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<Column>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Set at read time by the registry; manifests normally omit it.
    #[serde(default)]
    pub exists: bool,
}

fn default_min_cohort() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub privacy_level: PrivacyLevel,
    #[serde(default = "default_min_cohort")]
    pub min_cohort_size: u64,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CatalogSpec {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.id.trim().is_empty() {
            return Err("catalog id must be non-empty");
        }
        if self.min_cohort_size == 0 {
            return Err("min_cohort_size must be >= 1");
        }
        let mut names = std::collections::HashSet::new();
        for file in &self.files {
            if file.name.trim().is_empty() {
                return Err("file name must be non-empty");
            }
            if !names.insert(file.name.as_str()) {
                return Err("file names must be unique within a catalog");
            }
        }
        Ok(())
    }

    pub fn file(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    #[serde(default)]
    pub catalogs: Vec<CatalogSpec>,
}

impl Manifest {
    pub fn validate(&self) -> Result<(), String> {
        let mut ids = std::collections::HashSet::new();
        for catalog in &self.catalogs {
            catalog
                .validate()
                .map_err(|reason| format!("catalog `{}`: {}", catalog.id, reason))?;
            if catalog.id == UPLOADS_CATALOG_ID {
                return Err(format!(
                    "catalog id `{}` is reserved for the upload store",
                    UPLOADS_CATALOG_ID
                ));
            }
            if !ids.insert(catalog.id.as_str()) {
                return Err(format!("duplicate catalog id `{}`", catalog.id));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Score,
    Timeline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTimelineOption {
    #[serde(rename = "type")]
    pub kind: OptionKind,
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    Script,
    Data,
}

impl UploadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadKind::Script => "script",
            UploadKind::Data => "data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    pub original_name: String,
    pub stored_name: String,
    pub kind: UploadKind,
    pub extension: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requester {
    pub name: String,
    pub institution: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,
}

impl Requester {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.name.trim().is_empty() {
            return Err("requester name is required");
        }
        if self.institution.trim().is_empty() {
            return Err("requester institution is required");
        }
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err("requester email must be a plausible address");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisKind {
    Demographics,
    Correlation,
    DamageScore,
    Custom,
}

impl AnalysisKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisKind::Demographics => "demographics",
            AnalysisKind::Correlation => "correlation",
            AnalysisKind::DamageScore => "damage-score",
            AnalysisKind::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    Python,
    R,
}

impl Default for ScriptLanguage {
    fn default() -> Self {
        ScriptLanguage::Python
    }
}

impl ScriptLanguage {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptLanguage::Python => "python",
            ScriptLanguage::R => "r",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ScriptLanguage::Python => "py",
            ScriptLanguage::R => "r",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Approve,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub approver: String,
    pub decision: DecisionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub id: String,
    pub requester: Requester,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub research_question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methodology: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outcomes: Option<String>,
    pub catalog_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_score: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_timeline: Option<String>,
    pub kind: AnalysisKind,
    #[serde(default)]
    pub language: ScriptLanguage,
    pub script: String,
    pub script_hash: String,
    #[serde(default)]
    pub uploaded_files: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<String>,
    pub state: RequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisRequest {
    /// Script language effective for execution: non-custom kinds are always
    /// Python regardless of the submitted language field.
    pub fn effective_language(&self) -> ScriptLanguage {
        match self.kind {
            AnalysisKind::Custom => self.language,
            _ => ScriptLanguage::Python,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    Timeout,
    Cancelled,
    ChildCrash,
    ArtifactTooLarge,
    InterruptedBeforeCompletion,
    Internal,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Cancelled => "cancelled",
            FailureReason::ChildCrash => "child-crash",
            FailureReason::ArtifactTooLarge => "artifact-too-large",
            FailureReason::InterruptedBeforeCompletion => "interrupted-before-completion",
            FailureReason::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub reason: FailureReason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub request_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(default)]
    pub stdout_tail: String,
    #[serde(default)]
    pub stderr_tail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// One stored result row. The admin view serializes the whole record; the
/// external view is the `external()` projection, which never carries the
/// retained original of a blocked payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub request_id: String,
    pub seq: u64,
    pub result_type: String,
    pub released: bool,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasedResult {
    pub seq: u64,
    pub result_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn external(&self) -> ReleasedResult {
        ReleasedResult {
            seq: self.seq,
            result_type: self.result_type.clone(),
            payload: self.payload.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_state: Option<RequestState>,
    pub new_state: RequestState,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub payload_hash: String,
}
