use fedra_contracts::ScriptLanguage;

/// Patterns that end a submission at the door. Analysis scripts get their
/// data through the workspace loader; process control, raw host access and
/// network reach have no place in them.
const PYTHON_DENYLIST: &[&str] = &[
    "import subprocess",
    "from subprocess",
    "os.system",
    "os.popen",
    "os.exec",
    "eval(",
    "exec(",
    "__import__",
    "import socket",
    "import ctypes",
];

const R_DENYLIST: &[&str] = &["system(", "system2(", "shell(", "download.file", "socketconnection"];

/// Case-insensitive scan; returns every denied pattern found.
pub fn scan(script: &str, language: ScriptLanguage) -> Vec<&'static str> {
    let lowered = script.to_ascii_lowercase();
    let denylist = match language {
        ScriptLanguage::Python => PYTHON_DENYLIST,
        ScriptLanguage::R => R_DENYLIST,
    };

    denylist
        .iter()
        .copied()
        .filter(|pattern| lowered.contains(pattern))
        .collect()
}
