//! Behavior flags of a benchmark run.
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional and case-insensitive. Set the value to `"true"` to enable a flag.
//!
//! - `BENCH_VERBOSE` — Print running matches and match results to stdout (default: `true`)
//! - `BENCH_LOG` — Write a `bench.log` file in the run directory (default: `false`)
//! - `BENCH_CONTAIN_ENGINES` — Launch engines inside a cgroup (default: `true`)
//! - `BENCH_ALLOW_UNCONTAINED` — Fall back to an uncontained engine when the cgroup cannot be
//!   created (default: `false`)
//! - `BENCH_DEBUG_ENGINE_STDERR` — Forward engine stderr for debugging (default: `false`)

/// Behavior flags of a benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) contain_engines: bool,
    pub(crate) allow_uncontained: bool,
    pub(crate) debug_engine_stderr: bool,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Match progress is printed to stdout.
    /// - Logging to file is disabled.
    /// - Engines run inside a cgroup, and a failure to create one aborts the match.
    /// - Engine stderr is discarded.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            contain_engines: true,
            allow_uncontained: false,
            debug_engine_stderr: false,
        }
    }

    /// Create configuration from environment variables, see the module documentation.
    ///
    /// Any other value than `"true"` disables a flag; unset variables keep the default.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        Self {
            verbose: get_env_flag("BENCH_VERBOSE", true),
            log: get_env_flag("BENCH_LOG", false),
            contain_engines: get_env_flag("BENCH_CONTAIN_ENGINES", true),
            allow_uncontained: get_env_flag("BENCH_ALLOW_UNCONTAINED", false),
            debug_engine_stderr: get_env_flag("BENCH_DEBUG_ENGINE_STDERR", false),
        }
    }

    /// Enable or disable console progress output.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Enable or disable cgroup containment of engines.
    pub fn with_contain_engines(mut self, value: bool) -> Self {
        self.contain_engines = value;
        self
    }

    /// Allow running an engine uncontained when its cgroup cannot be created.
    ///
    /// Only the game time limit is enforced in that case.
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// Enable or disable engine stderr output (debug purposes only).
    pub fn with_debug_engine_stderr(mut self, value: bool) -> Self {
        self.debug_engine_stderr = value;
        self
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn log(&self) -> bool {
        self.log
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_override_defaults() {
        let config = Configuration::new()
            .with_verbose(false)
            .with_contain_engines(false)
            .with_debug_engine_stderr(true);
        assert!(!config.verbose);
        assert!(!config.log);
        assert!(!config.contain_engines);
        assert!(!config.allow_uncontained);
        assert!(config.debug_engine_stderr);
        assert_eq!(Configuration::default(), Configuration::new());
    }
}
