use std::process::Child;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use cgroups_rs::Cgroup;

use super::{create_process, kill_child, ProcessSpec};

fn get_current_user_id() -> anyhow::Result<String> {
    let output = std::process::Command::new("id")
        .arg("-u")
        .output()
        .context("Could not launch 'id -u'")?;
    let id = std::str::from_utf8(&output.stdout).context("id is not a valid string")?;
    Ok(id.trim().to_string())
}

fn get_cgroup_path(user_id: &str, group_name: &str) -> String {
    format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
}

/// Create a cgroup at `path`.
///
/// * `max_memory` - bytes, non-positive means no restriction.
/// * `max_pids` - non-positive means no restriction. Engines running on the JVM need a few
///   dozen threads.
/// * `cpus` - cpuset list (`"1-5,7"`), empty means no restriction.
fn create_cgroup(path: &str, max_memory: i64, max_pids: i64, cpus: &str) -> anyhow::Result<Cgroup> {
    let mut builder = cgroups_rs::cgroup_builder::CgroupBuilder::new(path);
    if max_memory > 0 {
        builder = builder.memory().memory_hard_limit(max_memory).done();
    }
    if max_pids > 0 {
        builder = builder
            .pid()
            .maximum_number_of_processes(cgroups_rs::MaxValue::Value(max_pids))
            .done();
    }
    if !cpus.is_empty() {
        builder = builder.cpu().cpus(cpus.to_string()).done();
    }
    builder
        .build(cgroups_rs::hierarchies::auto())
        .context("could not create cgroup")
}

fn wait_for_process_cleanup(
    cgroup: &Cgroup,
    pid: u64,
    max_duration: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + max_duration;
    while cgroup.tasks().iter().any(|task| task.pid == pid) {
        if Instant::now() > deadline {
            anyhow::bail!("process {pid} still alive after {max_duration:?}");
        }
        std::thread::sleep(std::cmp::min(Duration::from_millis(10), max_duration / 10));
    }
    Ok(())
}

fn create_process_in_cgroup(spec: &ProcessSpec, group: &Cgroup) -> anyhow::Result<Child> {
    let mut child = create_process(spec)?;

    let pid = child.id() as u64;
    if let Err(err) = group.add_task_by_tgid(cgroups_rs::CgroupPid { pid }) {
        let kill = kill_child(&mut child);
        return Err(err).with_context(|| match kill {
            Err(kill_err) => format!(
                "could not add engine to cgroup, and engine could not be killed either ({kill_err})"
            ),
            Ok(()) => "could not add engine to cgroup".to_string(),
        });
    }
    Ok(child)
}

/// An engine process, optionally inside its own cgroup. Killed on drop.
#[derive(Debug)]
pub struct LimitedProcess {
    pub child: Child,
    cgroup: Option<Cgroup>,
    pub(super) cleaned_up: bool,
}

impl LimitedProcess {
    /// Start the engine in a fresh cgroup limited to `max_memory` bytes and `cpus`.
    pub fn launch(
        spec: &ProcessSpec,
        max_memory: i64,
        cpus: &str,
    ) -> anyhow::Result<LimitedProcess> {

        static COUNTER: AtomicU32 = AtomicU32::new(1);
        let user_id = get_current_user_id().context("could not get user id")?;
        let group_name = format!(
            "MTG_BENCH_ENGINE_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = get_cgroup_path(&user_id, &group_name);
        let group = create_cgroup(&path, max_memory, 256, cpus).context("could not create cgroup")?;
        let child = match create_process_in_cgroup(spec, &group) {
            Ok(child) => child,
            Err(err) => {
                let _ = group.delete();
                return Err(err.context("could not create engine process in cgroup"));
            }
        };

        Ok(LimitedProcess {
            child,
            cgroup: Some(group),
            cleaned_up: false,
        })
    }

    pub fn launch_without_container(spec: &ProcessSpec) -> anyhow::Result<LimitedProcess> {
        let child = create_process(spec).context("could not create engine process")?;
        Ok(LimitedProcess {
            child,
            cgroup: None,
            cleaned_up: false,
        })
    }

    pub fn is_contained(&self) -> bool {
        self.cgroup.is_some()
    }

    pub fn try_kill(&mut self, max_duration: Duration) -> anyhow::Result<()> {
        match &mut self.cgroup {
            Some(cgroup) => {
                cgroup.kill().context("could not kill engine cgroup")?;
                wait_for_process_cleanup(cgroup, self.child.id() as u64, max_duration)
                    .context("engine cleanup timed out")?;
                let _ = self.child.wait();
                self.cleaned_up = true;
                if let Err(e) = cgroup.delete() {
                    tracing::warn!("Failed to remove cgroup. If this happens a lot, it may slow down the computer. {e}");
                }
                Ok(())
            }
            None => {
                kill_child(&mut self.child)?;
                self.cleaned_up = true;
                Ok(())
            }
        }
    }
}
