use std::process::Stdio;

use tokio::process::Command;

use crate::workspace::WorkspacePlan;

/// Resource and identity knobs handed to the child process.
///
/// Filesystem scope is the workspace (cwd plus the links under `input/`);
/// CPU, address-space and file-size ceilings are kernel rlimits, so the
/// limits hold even if the supervisor dies. Network isolation, when enabled,
/// unshares user and network namespaces so the child has no route out; when
/// disabled the surrounding deployment (container, netns) is expected to
/// provide it.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub cpu_secs: u64,
    pub mem_bytes: u64,
    pub out_bytes: u64,
    pub unshare_net: bool,
    pub run_as_uid: Option<u32>,
}

/// Builds the sandboxed command: workspace cwd, environment stripped to the
/// job contract (`LC_ALL`, `JOB_ID`, `JOB_CONFIG`, `OUTPUT_FILE`), piped
/// stdio, own process group.
pub fn command(plan: &WorkspacePlan, job_id: &str, spec: &SandboxSpec) -> Command {
    let mut cmd = Command::new(&plan.interpreter);
    cmd.arg(&plan.script_file)
        .current_dir(&plan.root)
        .env_clear()
        .env("LC_ALL", "C")
        .env("JOB_ID", job_id)
        .env("JOB_CONFIG", &plan.config_path)
        .env("OUTPUT_FILE", &plan.output_file)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        let cpu = spec.cpu_secs;
        let mem = spec.mem_bytes;
        let out = spec.out_bytes;
        let unshare_net = spec.unshare_net;
        let uid = spec.run_as_uid;

        unsafe {
            cmd.pre_exec(move || {
                // Own session so the whole process group can be signalled.
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }

                if unshare_net {
                    let flags = libc::CLONE_NEWUSER | libc::CLONE_NEWNET;
                    if libc::unshare(flags) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                if cpu > 0 {
                    set_rlimit(libc::RLIMIT_CPU as u32, cpu, cpu.saturating_add(5))?;
                }
                if mem > 0 {
                    set_rlimit(libc::RLIMIT_AS as u32, mem, mem)?;
                }
                if out > 0 {
                    set_rlimit(libc::RLIMIT_FSIZE as u32, out, out)?;
                }

                if let Some(uid) = uid
                    && libc::setuid(uid) != 0
                {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
    }

    cmd
}

#[cfg(unix)]
fn set_rlimit(resource: u32, soft: u64, hard: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // Safety: plain syscall on a stack value, called between fork and exec.
    if unsafe { libc::setrlimit(resource as _, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Graceful stop: SIGTERM to the child's process group. Escalation to
/// SIGKILL is the supervisor's call after the grace window.
pub fn terminate_group(pid: u32) {
    #[cfg(unix)]
    {
        // Negative pid addresses the whole group created by setsid.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Maps a terminating signal to a failure classification where the kernel
/// enforced one of the sandbox limits directly.
#[cfg(unix)]
pub fn limit_signal(signal: i32) -> Option<fedra_contracts::FailureReason> {
    match signal {
        libc::SIGXCPU => Some(fedra_contracts::FailureReason::Timeout),
        libc::SIGXFSZ => Some(fedra_contracts::FailureReason::ArtifactTooLarge),
        _ => None,
    }
}

#[cfg(not(unix))]
pub fn limit_signal(_signal: i32) -> Option<fedra_contracts::FailureReason> {
    None
}
