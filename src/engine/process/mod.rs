//! Engine subprocesses, contained in a cgroup on Linux.

#[cfg(target_os = "linux")]
mod process_linux;

#[cfg(target_os = "linux")]
pub use process_linux::*;

#[cfg(not(target_os = "linux"))]
mod process_stub;

#[cfg(not(target_os = "linux"))]
pub use process_stub::*;

use std::path::Path;
use std::process::{Child, Stdio};
use std::time::Duration;

use anyhow::Context;

/// What to run.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSpec<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    pub working_dir: Option<&'a Path>,
    /// Let the engine write to our stderr instead of discarding it.
    pub allow_stderr: bool,
}

/// Spawn with piped stdin/stdout.
fn create_process(spec: &ProcessSpec) -> anyhow::Result<Child> {
    let mut cmd = std::process::Command::new(spec.command);
    cmd.args(spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped());
    if !spec.allow_stderr {
        cmd.stderr(Stdio::null());
    }
    if let Some(dir) = spec.working_dir {
        cmd.current_dir(dir);
    }
    cmd.spawn()
        .with_context(|| format!("could not start engine command '{}'", spec.command))
}

/// Kill `child` unless it already exited, then reap it.
fn kill_child(child: &mut Child) -> anyhow::Result<()> {
    if child.try_wait().context("could not poll process")?.is_some() {
        return Ok(());
    }
    child.kill().context("could not kill process")?;
    child.wait().context("could not reap process")?;
    Ok(())
}

const CLEANUP_DURATION: Duration = Duration::from_millis(200);

impl Drop for LimitedProcess {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(CLEANUP_DURATION) {
                tracing::warn!("could not clean up engine process {}: {e:#}", self.child.id());
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn uncontained_process_is_killed() {
        let args = vec!["-c".to_string(), "sleep 30".to_string()];
        let spec = ProcessSpec {
            command: "sh",
            args: &args,
            working_dir: None,
            allow_stderr: false,
        };
        let mut process = LimitedProcess::launch_without_container(&spec).unwrap();
        assert!(process.child.try_wait().unwrap().is_none());
        process.try_kill(Duration::from_secs(1)).unwrap();
        assert!(process.child.try_wait().unwrap().is_some());
    }

    #[test]
    fn killing_an_exited_process_is_fine() {
        let args = vec!["-c".to_string(), "exit 0".to_string()];
        let spec = ProcessSpec {
            command: "sh",
            args: &args,
            working_dir: None,
            allow_stderr: false,
        };
        let mut process = LimitedProcess::launch_without_container(&spec).unwrap();
        process.child.wait().unwrap();
        process.try_kill(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn missing_command_fails_to_spawn() {
        let spec = ProcessSpec {
            command: "/nonexistent/engine-binary",
            args: &[],
            working_dir: None,
            allow_stderr: false,
        };
        assert!(LimitedProcess::launch_without_container(&spec).is_err());
    }
}
