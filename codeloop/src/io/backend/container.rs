//! Container backend driven through the `docker` CLI.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::{BackendError, BackendHandle, ExecutionBackend, ExecutionResult};
use crate::cancel::CancelToken;
use crate::io::config::ContainerConfig;
use crate::io::process::{CommandOutput, run_command};

const DOCKER: &str = "docker";
/// Bound for engine housekeeping commands (`info`, `run`, `cp`, `rm`).
const ADMIN_TIMEOUT: Duration = Duration::from_secs(120);
const ADMIN_OUTPUT_LIMIT: usize = 64 * 1024;
const CODE_FILE: &str = "code.js";
const NAME_PREFIX: &str = "codeloop";
/// Extra time the host waits past the in-container limit before giving up.
const EXEC_GRACE: Duration = Duration::from_secs(10);

static NAME_SEQ: AtomicU64 = AtomicU64::new(0);

/// Whether the container engine answers `docker info`.
///
/// A missing `docker` binary counts as not running.
pub fn engine_is_running(cancel: &CancelToken) -> Result<bool> {
    match docker(["info"], cancel) {
        Ok(out) => Ok(!out.timed_out && out.status.success()),
        Err(err) if err.downcast_ref::<std::io::Error>().is_some() => {
            debug!(err = %err, "docker binary unavailable");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Whether `image` is available locally.
pub fn image_exists(image: &str, cancel: &CancelToken) -> Result<bool> {
    let out = docker(["image", "inspect", image], cancel)?;
    Ok(!out.timed_out && out.status.success())
}

fn docker<I, S>(args: I, cancel: &CancelToken) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut cmd = Command::new(DOCKER);
    cmd.args(args);
    run_command(cmd, ADMIN_TIMEOUT, ADMIN_OUTPUT_LIMIT, cancel)
}

/// Force-remove a container by id or name.
///
/// Ignores cancellation so it can clean up after an interrupted run.
pub fn remove_container(id: &str) -> Result<()> {
    docker(["rm", "-f", id], &CancelToken::new())?.ensure_success("docker rm")
}

/// Name for a new container, unique within this host.
fn container_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    let seq = NAME_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{NAME_PREFIX}-{}-{nanos:08x}-{seq}", std::process::id())
}

/// Runs generated code inside a long-lived container.
pub struct ContainerRuntime {
    cfg: ContainerConfig,
}

impl ContainerRuntime {
    pub const NAME: &'static str = "container";

    pub fn new(cfg: ContainerConfig) -> Self {
        Self { cfg }
    }

    fn exec_command(&self, handle: &BackendHandle) -> Command {
        let mut cmd = Command::new(DOCKER);
        cmd.args(["exec", "-w", self.cfg.workdir.as_str(), handle.id()]);
        cmd
    }

    fn container_path(&self, handle: &BackendHandle, rel: &str) -> String {
        format!("{}:{}/{rel}", handle.id(), self.cfg.workdir.trim_end_matches('/'))
    }

    /// Host-side bound for a command already limited inside the container.
    fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.exec_timeout_secs) + EXEC_GRACE
    }

    fn run_args(&self, name: &str) -> Vec<String> {
        [
            "run",
            "-d",
            "--name",
            name,
            "-w",
            self.cfg.workdir.as_str(),
            self.cfg.image.as_str(),
            "tail",
            "-f",
            "/dev/null",
        ]
        .map(String::from)
        .to_vec()
    }

    fn install_packages(
        &self,
        handle: &BackendHandle,
        packages: &BTreeSet<String>,
        cancel: &CancelToken,
    ) -> Result<String> {
        let mut cmd = self.exec_command(handle);
        cmd.args(time_limited(self.cfg.exec_timeout_secs, npm_install_args(packages)));
        info!(count = packages.len(), "installing packages");
        let out = run_command(cmd, self.exec_timeout(), self.cfg.output_limit_bytes, cancel)
            .context("npm install")?;
        if !out.status.success() || out.timed_out {
            warn!(exit_code = ?out.status.code(), timed_out = out.timed_out, "npm install failed");
        }
        Ok(out.combined())
    }
}

impl ExecutionBackend for ContainerRuntime {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    #[instrument(skip_all, fields(image = %self.cfg.image))]
    fn acquire(&mut self, cancel: &CancelToken) -> Result<BackendHandle> {
        if !engine_is_running(cancel)? {
            return Err(BackendError::EngineNotRunning.into());
        }
        if !image_exists(&self.cfg.image, cancel)? {
            return Err(BackendError::ImageNotFound(self.cfg.image.clone()).into());
        }
        let name = container_name();
        let started = docker(self.run_args(&name), cancel)
            .and_then(|out| out.ensure_success("docker run"));
        if let Err(err) = started {
            // The daemon may have created the container before the CLI failed.
            if let Err(cleanup) = remove_container(&name) {
                debug!(container = %name, err = %format!("{cleanup:#}"), "no container to clean up");
            }
            return Err(err);
        }
        info!(container = %name, "container started");
        Ok(BackendHandle::new(name))
    }

    #[instrument(skip_all, fields(container = %handle, source = %source.display()))]
    fn import_dataset(&mut self, handle: &BackendHandle, source: &Path, cancel: &CancelToken) -> Result<()> {
        // `<dir>/.` copies the directory's contents rather than the directory itself.
        let mut cp = Command::new(DOCKER);
        cp.arg("cp")
            .arg(source.join("."))
            .arg(self.container_path(handle, "."));
        run_command(cp, ADMIN_TIMEOUT, ADMIN_OUTPUT_LIMIT, cancel)
            .context("docker cp into container")?
            .ensure_success("docker cp into container")?;
        info!("dataset imported");
        Ok(())
    }

    #[instrument(skip_all, fields(container = %handle, packages = packages.len()))]
    fn execute(
        &mut self,
        handle: &BackendHandle,
        code: &str,
        packages: &BTreeSet<String>,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult> {
        let staging = tempfile::tempdir().context("create staging dir")?;
        let code_path = staging.path().join(CODE_FILE);
        fs::write(&code_path, code).with_context(|| format!("write {}", code_path.display()))?;
        let mut cp = Command::new(DOCKER);
        cp.arg("cp")
            .arg(&code_path)
            .arg(self.container_path(handle, CODE_FILE));
        run_command(cp, ADMIN_TIMEOUT, ADMIN_OUTPUT_LIMIT, cancel)?
            .ensure_success("docker cp code.js")?;

        let mut output = String::new();
        if !packages.is_empty() {
            output.push_str(&self.install_packages(handle, packages, cancel)?);
        }

        let mut cmd = self.exec_command(handle);
        cmd.args(time_limited(
            self.cfg.exec_timeout_secs,
            vec!["node".to_string(), CODE_FILE.to_string()],
        ));
        let started = Instant::now();
        let out = run_command(cmd, self.exec_timeout(), self.cfg.output_limit_bytes, cancel)
            .context("node code.js")?;
        let timed_out = out.timed_out
            || hit_time_limit(out.status.code(), started.elapsed(), self.cfg.exec_timeout_secs);
        output.push_str(&out.combined());
        if timed_out {
            output.push_str(&format!(
                "\n[execution timed out after {}s]",
                self.cfg.exec_timeout_secs
            ));
        }
        debug!(exit_code = ?out.status.code(), timed_out, "execution finished");
        Ok(ExecutionResult {
            output,
            exit_code: if timed_out { None } else { out.status.code() },
            timed_out,
        })
    }

    #[instrument(skip_all, fields(container = %handle, output = %output.display()))]
    fn export_dataset(&mut self, handle: &BackendHandle, output: &Path, cancel: &CancelToken) -> Result<()> {
        let staging = tempfile::tempdir().context("create export staging dir")?;
        let mut cp = Command::new(DOCKER);
        cp.arg("cp")
            .arg(self.container_path(handle, "."))
            .arg(staging.path());
        run_command(cp, ADMIN_TIMEOUT, ADMIN_OUTPUT_LIMIT, cancel)?
            .ensure_success("docker cp out of container")?;

        fs::create_dir_all(output).with_context(|| format!("create {}", output.display()))?;
        let mut exported = 0usize;
        for entry in fs::read_dir(staging.path()).context("read export staging dir")? {
            let entry = entry.context("read export staging entry")?;
            let name = entry.file_name();
            if is_excluded(&name.to_string_lossy(), &self.cfg.export_exclude) {
                continue;
            }
            exported += copy_tree(&entry.path(), &output.join(&name))?;
        }
        info!(files = exported, "dataset exported");
        Ok(())
    }

    #[instrument(skip_all, fields(container = %handle))]
    fn release(&mut self, handle: BackendHandle) -> Result<()> {
        remove_container(handle.id())?;
        info!("container removed");
        Ok(())
    }
}

fn npm_install_args(packages: &BTreeSet<String>) -> Vec<String> {
    let mut args = vec!["npm".to_string(), "install".to_string(), "--no-save".to_string()];
    args.extend(packages.iter().cloned());
    args
}

/// Wrap `program` in coreutils `timeout` so it is killed inside the container,
/// not just the local `docker exec` client.
fn time_limited(secs: u64, program: Vec<String>) -> Vec<String> {
    let mut args = vec![
        "timeout".to_string(),
        "-s".to_string(),
        "KILL".to_string(),
        secs.to_string(),
    ];
    args.extend(program);
    args
}

/// Whether an exit status reports the in-container limit firing.
///
/// GNU `timeout -s KILL` exits 137 and busybox exits 124 or 137; the elapsed
/// time rules out programs that return those codes on their own.
fn hit_time_limit(exit_code: Option<i32>, elapsed: Duration, limit_secs: u64) -> bool {
    matches!(exit_code, Some(124 | 137)) && elapsed >= Duration::from_secs(limit_secs)
}

fn is_excluded(name: &str, exclude: &[String]) -> bool {
    exclude.iter().any(|e| e == name)
}

/// Copy a file or directory tree, returning the number of files copied.
fn copy_tree(from: &Path, to: &Path) -> Result<usize> {
    let mut copied = 0usize;
    for entry in WalkDir::new(from) {
        let entry = entry.with_context(|| format!("walk {}", from.display()))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let dest = if rel.as_os_str().is_empty() {
            to.to_path_buf()
        } else {
            to.join(rel)
        };
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).with_context(|| format!("create {}", dest.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("copy {} to {}", entry.path().display(), dest.display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn npm_install_lists_packages_in_order() {
        let packages: BTreeSet<String> = ["sharp", "chalk"].map(String::from).into();
        assert_eq!(
            npm_install_args(&packages),
            ["npm", "install", "--no-save", "chalk", "sharp"]
        );
    }

    #[test]
    fn programs_run_under_an_in_container_kill_timeout() {
        let args = time_limited(30, vec!["node".to_string(), CODE_FILE.to_string()]);
        assert_eq!(args, ["timeout", "-s", "KILL", "30", "node", "code.js"]);
    }

    #[test]
    fn limit_exit_codes_count_only_after_the_limit_elapsed() {
        assert!(hit_time_limit(Some(137), Duration::from_secs(30), 30));
        assert!(hit_time_limit(Some(124), Duration::from_secs(31), 30));
        assert!(!hit_time_limit(Some(137), Duration::from_secs(2), 30));
        assert!(!hit_time_limit(Some(0), Duration::from_secs(45), 30));
        assert!(!hit_time_limit(None, Duration::from_secs(45), 30));
    }

    #[test]
    fn host_waits_past_the_in_container_limit() {
        let runtime = ContainerRuntime::new(ContainerConfig {
            exec_timeout_secs: 30,
            ..ContainerConfig::default()
        });
        assert!(runtime.exec_timeout() > Duration::from_secs(30));
    }

    #[test]
    fn containers_are_started_under_a_known_name() {
        let runtime = ContainerRuntime::new(ContainerConfig::default());
        let name = container_name();
        let args = runtime.run_args(&name);
        let flag = args.iter().position(|a| a == "--name").expect("--name");
        assert_eq!(args[flag + 1], name);
        assert_eq!(args[..2], ["run", "-d"]);
    }

    #[test]
    fn container_names_are_unique() {
        let first = container_name();
        let second = container_name();
        assert!(first.starts_with("codeloop-"));
        assert_ne!(first, second);
    }

    #[test]
    fn container_paths_join_workdir() {
        let runtime = ContainerRuntime::new(ContainerConfig {
            workdir: "/home/node/work/".to_string(),
            ..ContainerConfig::default()
        });
        let handle = BackendHandle::new("abc123");
        assert_eq!(
            runtime.container_path(&handle, CODE_FILE),
            "abc123:/home/node/work/code.js"
        );
    }

    #[test]
    fn default_exclusions_skip_install_artifacts() {
        let exclude = ContainerConfig::default().export_exclude;
        assert!(is_excluded("node_modules", &exclude));
        assert!(is_excluded("package-lock.json", &exclude));
        assert!(!is_excluded("result.txt", &exclude));
    }

    #[test]
    fn copy_tree_copies_nested_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("charts")).expect("mkdir");
        fs::write(src.join("result.txt"), "42").expect("write");
        fs::write(src.join("charts/index.html"), "<html>").expect("write");

        let dst = temp.path().join("dst");
        assert_eq!(copy_tree(&src, &dst).expect("copy"), 2);
        assert_eq!(fs::read_to_string(dst.join("result.txt")).expect("read"), "42");
        assert!(dst.join("charts/index.html").is_file());
    }

    #[test]
    fn copy_tree_copies_single_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("result.txt");
        fs::write(&src, "7").expect("write");
        let dst = temp.path().join("out/result.txt");
        assert_eq!(copy_tree(&src, &dst).expect("copy"), 1);
        assert_eq!(fs::read_to_string(dst).expect("read"), "7");
    }
}
