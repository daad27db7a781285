use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fedra_catalog::CatalogRegistry;
use fedra_contracts::{AnalysisRequest, CatalogSpec};
use fedra_uploads::UploadStore;

use crate::RunnerConfig;

/// Stable loader module name scripts import from the workspace.
pub const LOADER_FILE: &str = "data_loader.py";
const LOADER_SOURCE: &str = include_str!("../assets/data_loader.py");

#[derive(Debug, Clone)]
pub struct WorkspacePlan {
    pub root: PathBuf,
    pub script_file: String,
    pub config_path: PathBuf,
    pub output_file: PathBuf,
    pub results_log: PathBuf,
    pub interpreter: String,
}

/// Materializes `work/<job-id>/`: the script, the loader module, the job
/// config, and an `input/` tree linking exactly the files the job may read.
pub fn build(
    config: &RunnerConfig,
    registry: &CatalogRegistry,
    uploads: &UploadStore,
    request: &AnalysisRequest,
    catalog: &CatalogSpec,
    job_id: &str,
) -> std::io::Result<WorkspacePlan> {
    let root = config.work_root.join(job_id);
    let input_dir = root.join("input");
    let output_dir = root.join("output");
    std::fs::create_dir_all(&input_dir)?;
    std::fs::create_dir_all(&output_dir)?;
    std::fs::create_dir_all(root.join("tmp"))?;

    let language = request.effective_language();
    let script_file = format!("script.{}", language.extension());
    std::fs::write(root.join(&script_file), &request.script)?;
    std::fs::write(root.join(LOADER_FILE), LOADER_SOURCE)?;

    let mut file_entries = Vec::new();
    for entry in &catalog.files {
        let source = match registry.resolve_path(&entry.path) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(job_id = %job_id, file = %entry.name, error = %err, "skipping file");
                continue;
            }
        };
        if !source.exists() {
            tracing::warn!(job_id = %job_id, file = %entry.name, "catalog file missing, not exposed");
            continue;
        }

        let link_name = unique_link_name(&input_dir, &source, &entry.name);
        let link = input_dir.join(&link_name);
        expose(&source, &link)?;

        file_entries.push(serde_json::json!({
            "name": entry.name,
            "path": link,
            "type": entry.kind.as_str(),
        }));
    }

    let mut upload_paths = Vec::new();
    if !request.uploaded_files.is_empty() {
        let uploads_dir = input_dir.join("uploads");
        std::fs::create_dir_all(&uploads_dir)?;
        for upload_id in &request.uploaded_files {
            let source = uploads
                .path_of(upload_id)
                .map_err(|err| std::io::Error::other(err.to_string()))?;
            let file_name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| upload_id.clone());
            let link = uploads_dir.join(file_name);
            expose(&source, &link)?;
            upload_paths.push(link);
        }
    }

    let output_file = output_dir.join("result.json");
    let results_log = output_dir.join("results.jsonl");

    let job_config = serde_json::json!({
        "job_id": job_id,
        "request_id": request.id,
        "catalog_id": catalog.id,
        "catalog": {
            "id": catalog.id,
            "name": catalog.name,
            "description": catalog.description,
            "privacy_level": catalog.privacy_level.as_str(),
            "min_cohort_size": catalog.min_cohort_size,
        },
        "files": file_entries,
        "uploads": upload_paths,
        "selected_score": request.selected_score,
        "selected_timeline": request.selected_timeline,
        "output_file": output_file,
        "results_log": results_log,
    });

    let config_path = root.join("job_config.json");
    std::fs::write(
        &config_path,
        serde_json::to_vec_pretty(&job_config).unwrap_or_else(|_| b"{}".to_vec()),
    )?;

    let interpreter = match language {
        fedra_contracts::ScriptLanguage::Python => config.python_bin.clone(),
        fedra_contracts::ScriptLanguage::R => config.rscript_bin.clone(),
    };

    Ok(WorkspacePlan {
        root,
        script_file,
        config_path,
        output_file,
        results_log,
        interpreter,
    })
}

/// Links (or copies, where symlinks are unavailable) a source file into the
/// input tree.
fn expose(source: &Path, link: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(source, link)
    }
    #[cfg(not(unix))]
    {
        std::fs::copy(source, link).map(|_| ())
    }
}

fn unique_link_name(input_dir: &Path, source: &Path, logical_name: &str) -> String {
    let base = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| logical_name.to_string());

    if !input_dir.join(&base).exists() {
        return base;
    }
    let mut idx = 1;
    loop {
        let candidate = format!("{}_{}", idx, base);
        if !input_dir.join(&candidate).exists() {
            return candidate;
        }
        idx += 1;
    }
}

/// Deletes terminal workspaces once they outlive the retention window,
/// measured from the workspace's last modification.
pub fn spawn_retention_sweeper(work_root: PathBuf, retention: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600).min(retention.max(Duration::from_secs(1))));
        loop {
            ticker.tick().await;
            if let Err(err) = sweep_expired(&work_root, retention) {
                tracing::warn!(error = %err, "workspace retention sweep failed");
            }
        }
    });
}

pub fn sweep_expired(work_root: &Path, retention: Duration) -> std::io::Result<u32> {
    let entries = match std::fs::read_dir(work_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let expired = now
            .duration_since(modified)
            .map(|age| age > retention)
            .unwrap_or(false);
        if expired {
            std::fs::remove_dir_all(entry.path())?;
            removed += 1;
            tracing::info!(workspace = %entry.path().display(), "expired workspace removed");
        }
    }
    Ok(removed)
}
