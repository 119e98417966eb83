use std::process::Child;
use std::time::Duration;

use anyhow::{bail, Context};

use super::{create_process, kill_child, ProcessSpec};

#[derive(Debug)]
pub struct LimitedProcess {
    pub child: Child,
    pub(super) cleaned_up: bool,
}

impl LimitedProcess {
    pub fn launch(
        _spec: &ProcessSpec,
        _max_memory: i64,
        _cpus: &str,
    ) -> anyhow::Result<LimitedProcess> {

        bail!("cgroups only available on linux")
    }

    pub fn launch_without_container(spec: &ProcessSpec) -> anyhow::Result<LimitedProcess> {
        let child = create_process(spec).context("could not create engine process")?;
        Ok(LimitedProcess {
            child,
            cleaned_up: false,
        })
    }

    pub fn is_contained(&self) -> bool {
        false
    }

    pub fn try_kill(&mut self, _max_duration: Duration) -> anyhow::Result<()> {
        kill_child(&mut self.child)?;
        self.cleaned_up = true;
        Ok(())
    }
}
