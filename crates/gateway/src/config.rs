use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use fedra_runner::RunnerConfig;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_addr: SocketAddr,
    pub node_name: String,
    pub node_root: PathBuf,
    pub manifest_path: PathBuf,
    pub executor_slots: usize,
    pub max_cpu_secs: u64,
    pub max_wall_secs: u64,
    pub max_mem_bytes: u64,
    pub max_out_bytes: u64,
    pub max_upload_bytes: u64,
    pub pending_ttl_secs: u64,
    pub retention_secs: u64,
    pub python_bin: String,
    pub rscript_bin: String,
    pub infer_sample_rows: usize,
    pub submit_rate_limit: u32,
    pub sandbox_unshare_net: bool,
    pub sandbox_run_as_uid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

fn invalid(message: impl Into<String>) -> StartupError {
    StartupError {
        code: "ERR_INVALID_CONFIG",
        message: message.into(),
    }
}

impl NodeConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("FEDRA_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                merged.extend(parse_env_file(config_path)?);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = match trimmed(kv, "FEDRA_BIND_ADDR") {
            None => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8300),
            Some(raw) => raw
                .parse::<SocketAddr>()
                .map_err(|_| invalid("FEDRA_BIND_ADDR must be a valid host:port address"))?,
        };

        let node_name = trimmed(kv, "FEDRA_NODE_NAME")
            .unwrap_or("fedra-node")
            .to_string();

        let node_root = PathBuf::from(trimmed(kv, "FEDRA_NODE_ROOT").unwrap_or("."));

        let manifest_path = match trimmed(kv, "FEDRA_MANIFEST_PATH") {
            Some(raw) => {
                let path = PathBuf::from(raw);
                if path.is_absolute() {
                    path
                } else {
                    node_root.join(path)
                }
            }
            None => node_root.join("data/manifest.json"),
        };

        let executor_slots = parse_num(kv, "FEDRA_EXECUTOR_SLOTS", 2usize)?;
        if !(1..=64).contains(&executor_slots) {
            return Err(invalid("FEDRA_EXECUTOR_SLOTS must be between 1 and 64"));
        }

        let max_cpu_secs = parse_num(kv, "FEDRA_MAX_CPU_SECS", 300u64)?;
        let max_wall_secs = parse_num(kv, "FEDRA_MAX_WALL_SECS", 600u64)?;
        if max_cpu_secs == 0 || max_wall_secs == 0 {
            return Err(invalid("job time limits must be at least one second"));
        }

        let max_mem_bytes = parse_num(kv, "FEDRA_MAX_MEM_BYTES", 2u64 * 1024 * 1024 * 1024)?;
        let max_out_bytes = parse_num(kv, "FEDRA_MAX_OUT_BYTES", 100u64 * 1024 * 1024)?;
        if max_out_bytes == 0 {
            return Err(invalid("FEDRA_MAX_OUT_BYTES must be at least one byte"));
        }
        let max_upload_bytes = parse_num(kv, "FEDRA_MAX_UPLOAD_BYTES", 100u64 * 1024 * 1024)?;

        let pending_ttl_secs = parse_num(kv, "FEDRA_PENDING_TTL_SECS", 30u64 * 24 * 60 * 60)?;
        let retention_secs = parse_num(kv, "FEDRA_RETENTION_SECS", 24u64 * 60 * 60)?;

        let python_bin = trimmed(kv, "FEDRA_PYTHON_BIN").unwrap_or("python3").to_string();
        let rscript_bin = trimmed(kv, "FEDRA_RSCRIPT_BIN").unwrap_or("Rscript").to_string();

        let infer_sample_rows = parse_num(kv, "FEDRA_INFER_SAMPLE_ROWS", 200usize)?;
        if infer_sample_rows == 0 {
            return Err(invalid("FEDRA_INFER_SAMPLE_ROWS must be at least 1"));
        }

        let submit_rate_limit = parse_num(kv, "FEDRA_SUBMIT_RATE_LIMIT", 30u32)?;

        let sandbox_unshare_net =
            parse_bool(kv.get("FEDRA_SANDBOX_UNSHARE_NET")).unwrap_or(false);

        let sandbox_run_as_uid = match trimmed(kv, "FEDRA_SANDBOX_RUN_AS_UID") {
            None => None,
            Some(raw) => Some(
                raw.parse::<u32>()
                    .map_err(|_| invalid("FEDRA_SANDBOX_RUN_AS_UID must be a numeric uid"))?,
            ),
        };

        Ok(Self {
            bind_addr,
            node_name,
            node_root,
            manifest_path,
            executor_slots,
            max_cpu_secs,
            max_wall_secs,
            max_mem_bytes,
            max_out_bytes,
            max_upload_bytes,
            pending_ttl_secs,
            retention_secs,
            python_bin,
            rscript_bin,
            infer_sample_rows,
            submit_rate_limit,
            sandbox_unshare_net,
            sandbox_run_as_uid,
        })
    }

    pub fn pending_ttl(&self) -> Option<std::time::Duration> {
        (self.pending_ttl_secs > 0).then(|| std::time::Duration::from_secs(self.pending_ttl_secs))
    }

    pub fn runner_config(&self) -> RunnerConfig {
        let mut runner = RunnerConfig::new(&self.node_root);
        runner.slots = self.executor_slots;
        runner.max_cpu_secs = self.max_cpu_secs;
        runner.max_wall_secs = self.max_wall_secs;
        runner.max_mem_bytes = self.max_mem_bytes;
        runner.max_out_bytes = self.max_out_bytes;
        runner.retention_secs = self.retention_secs;
        runner.python_bin = self.python_bin.clone();
        runner.rscript_bin = self.rscript_bin.clone();
        runner.unshare_net = self.sandbox_unshare_net;
        runner.run_as_uid = self.sandbox_run_as_uid;
        runner
    }
}

fn trimmed<'a>(kv: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    kv.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn parse_num<T>(kv: &HashMap<String, String>, key: &'static str, default: T) -> Result<T, StartupError>
where
    T: std::str::FromStr,
{
    match trimmed(kv, key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| invalid(format!("{} must be an integer", key))),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;
    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();
    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}
