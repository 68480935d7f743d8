//! Immutable per-run fork configuration and worker command-line assembly.
//!
//! One [`ForkConfiguration`] is created from external configuration per run
//! and never mutated. It knows how to turn itself plus a fork index into a
//! ready-to-spawn [`std::process::Command`], including the boot-path
//! delivery strategy: inline argument for short paths, a generated args
//! file when the command line would blow past platform limits, or a
//! manifest archive when modular isolation is requested.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;

use crate::settings::{ENV_FORK_ID, EXCLUDED_ENV};

use super::archive;

/// Inline boot-path argument budget; beyond this the args-file indirection
/// is used. Deliberately far below every platform's real limit.
const INLINE_ARG_LIMIT: usize = 4096;

/// Placeholder substituted with the fork index in the user arg line.
pub const PLACEHOLDER_FORK_INDEX: &str = "{fork.index}";
/// Placeholder substituted with the executing thread index.
pub const PLACEHOLDER_THREAD_INDEX: &str = "{thread.index}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("working directory {0} exists but is not a directory")]
    WorkingDirNotADirectory(PathBuf),
    #[error("cannot create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("boot path {0} cannot be joined into a path list")]
    UnjoinableBootPath(PathBuf),
    #[error("cannot write {what}: {source}")]
    Artifact {
        what: &'static str,
        source: std::io::Error,
    },
}

/// How the boot-path list travels to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathDelivery {
    /// Pick per spawn: archive when modular, args file when too long,
    /// inline otherwise.
    #[default]
    Auto,
    Inline,
    ArgsFile,
    ManifestArchive,
}

/// Immutable description of how workers are forked for one run.
#[derive(Debug, Clone)]
pub struct ForkConfiguration {
    /// Worker executable.
    pub entry: PathBuf,
    /// Resource paths handed to the worker at boot.
    pub boot_paths: Vec<PathBuf>,
    pub working_dir: PathBuf,
    /// Extra argument line, `{fork.index}`/`{thread.index}` substituted.
    pub arg_line: Option<String>,
    /// Environment overrides applied after the exclusion list.
    pub env: BTreeMap<String, String>,
    /// Log the assembled command line before spawning.
    pub debug: bool,
    pub fork_count: u32,
    pub reuse_forks: bool,
    /// Wall-clock budget per worker; `None` waits forever.
    pub timeout: Option<Duration>,
    pub delivery: PathDelivery,
    /// Forces the manifest-archive delivery.
    pub modular: bool,
    pub reports_dir: PathBuf,
}

impl ForkConfiguration {
    /// Validate and create the directories this run writes into. A working
    /// path that exists as a non-directory is a fatal configuration error,
    /// surfaced before any process is spawned.
    pub fn prepare(&self) -> Result<(), ConfigError> {
        for dir in [&self.working_dir, &self.reports_dir] {
            if dir.exists() {
                if !dir.is_dir() {
                    return Err(ConfigError::WorkingDirNotADirectory(dir.clone()));
                }
            } else {
                std::fs::create_dir_all(dir).map_err(|source| ConfigError::CreateDir {
                    path: dir.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    fn joined_boot_path(&self) -> Result<OsString, ConfigError> {
        std::env::join_paths(&self.boot_paths).map_err(|_| {
            let offender = self
                .boot_paths
                .iter()
                .find(|p| p.to_string_lossy().contains(':'))
                .cloned()
                .unwrap_or_default();
            ConfigError::UnjoinableBootPath(offender)
        })
    }

    /// The delivery strategy actually used for this spawn.
    pub fn resolve_delivery(&self, joined_len: usize) -> PathDelivery {
        match self.delivery {
            PathDelivery::Auto => {
                if self.modular {
                    PathDelivery::ManifestArchive
                } else if joined_len > INLINE_ARG_LIMIT {
                    PathDelivery::ArgsFile
                } else {
                    PathDelivery::Inline
                }
            }
            explicit => explicit,
        }
    }

    /// Assemble the spawnable command for one fork. Generated indirection
    /// files land in `scratch_dir`, which outlives the worker. User arg-line
    /// tokens ride behind a `--` separator so the worker's own argument
    /// parser never trips over them.
    pub fn command(
        &self,
        fork_index: u32,
        settings_path: &Path,
        scratch_dir: &Path,
    ) -> Result<Command, ConfigError> {
        let mut cmd = Command::new(&self.entry);

        cmd.arg(settings_path);

        if !self.boot_paths.is_empty() {
            let joined = self.joined_boot_path()?;
            match self.resolve_delivery(joined.len()) {
                PathDelivery::Inline | PathDelivery::Auto => {
                    cmd.arg("--boot-path").arg(&joined);
                }
                PathDelivery::ArgsFile => {
                    let path = scratch_dir.join(format!("boot-args-{fork_index}.txt"));
                    std::fs::write(&path, joined.to_string_lossy().as_bytes()).map_err(
                        |source| ConfigError::Artifact {
                            what: "boot args file",
                            source,
                        },
                    )?;
                    cmd.arg("--boot-path-file").arg(path);
                }
                PathDelivery::ManifestArchive => {
                    let path = scratch_dir.join(format!("boot-{fork_index}.zip"));
                    std::fs::write(&path, archive::manifest_archive_bytes(&self.boot_paths))
                        .map_err(|source| ConfigError::Artifact {
                            what: "boot archive",
                            source,
                        })?;
                    cmd.arg("--boot-archive").arg(path);
                }
            }
        }

        if let Some(template) = &self.arg_line {
            let line = template
                .replace(PLACEHOLDER_FORK_INDEX, &fork_index.to_string())
                .replace(PLACEHOLDER_THREAD_INDEX, &fork_index.to_string());
            cmd.arg("--");
            cmd.args(line.split_whitespace());
        }

        for excluded in EXCLUDED_ENV {
            cmd.env_remove(excluded);
        }
        cmd.envs(&self.env);
        cmd.env(ENV_FORK_ID, fork_index.to_string());
        cmd.current_dir(&self.working_dir);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if self.debug {
            tracing::debug!(command = %preview(&cmd), "assembled worker command line");
        }
        Ok(cmd)
    }
}

/// Loggable rendition of an assembled command.
pub fn preview(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> ForkConfiguration {
        ForkConfiguration {
            entry: PathBuf::from("/usr/bin/true"),
            boot_paths: vec![PathBuf::from("/opt/boot")],
            working_dir: dir.join("work"),
            arg_line: None,
            env: BTreeMap::new(),
            debug: false,
            fork_count: 1,
            reuse_forks: true,
            timeout: None,
            delivery: PathDelivery::Auto,
            modular: false,
            reports_dir: dir.join("reports"),
        }
    }

    #[test]
    fn prepare_creates_missing_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config(dir.path());
        config.prepare().expect("prepare");
        assert!(config.working_dir.is_dir());
        assert!(config.reports_dir.is_dir());
    }

    #[test]
    fn non_directory_working_path_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config(dir.path());
        config.working_dir = dir.path().join("occupied");
        std::fs::write(&config.working_dir, b"a file").expect("write");
        assert!(matches!(
            config.prepare(),
            Err(ConfigError::WorkingDirNotADirectory(_))
        ));
    }

    #[test]
    fn short_paths_go_inline_and_long_paths_use_args_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config(dir.path());
        assert_eq!(config.resolve_delivery(100), PathDelivery::Inline);
        assert_eq!(config.resolve_delivery(100_000), PathDelivery::ArgsFile);
    }

    #[test]
    fn modular_forces_the_manifest_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config(dir.path());
        config.modular = true;
        assert_eq!(config.resolve_delivery(10), PathDelivery::ManifestArchive);
    }

    #[test]
    fn arg_line_placeholders_are_substituted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config(dir.path());
        config.prepare().expect("prepare");
        config.arg_line = Some("--mem 256 --tag fork-{fork.index}".to_string());
        let cmd = config
            .command(3, Path::new("settings.json"), dir.path())
            .expect("command");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"fork-3".to_string()));
        assert!(args.contains(&"--mem".to_string()));
    }

    #[test]
    fn excluded_variables_are_scrubbed_and_fork_id_is_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config(dir.path());
        config.prepare().expect("prepare");
        let cmd = config
            .command(7, Path::new("settings.json"), dir.path())
            .expect("command");
        let fork_id = cmd
            .get_envs()
            .find(|(k, _)| k.to_str() == Some(ENV_FORK_ID))
            .and_then(|(_, v)| v)
            .map(|v| v.to_string_lossy().into_owned());
        assert_eq!(fork_id.as_deref(), Some("7"));
    }
}
