//! Crossing invocation: run a stage1 entrypoint against a running pod.
//!
//! The core never enters namespaces itself. It resolves the in-pod helper
//! paths from the stage1 manifest annotations and hands the namespace-entry
//! command to the entrypoint through the environment.

use crate::pod::Pod;
use anyhow::{Context, Result, bail};
use std::{env, path::PathBuf, process::Command};
use tracing::debug;

/// Annotation naming the namespace-entry helper.
pub const ENTER_ENTRYPOINT: &str = "coreos.com/rkt/stage1/enter";

/// Annotation naming the attach entrypoint.
pub const ATTACH_ENTRYPOINT: &str = "coreos.com/rkt/stage1/attach";

/// Run the pod's attach entrypoint with the dispatcher argv.
pub fn attach(pod: &Pod, app: &str, args: &[String]) -> Result<()> {
    run_crossing_entrypoint(pod, app, ATTACH_ENTRYPOINT, args)
}

/// Invoke a stage1 entrypoint with the crossing environment set, changing
/// into the pod directory for the duration of the child and restoring the
/// previous working directory afterwards.
fn run_crossing_entrypoint(pod: &Pod, app: &str, entrypoint: &str, args: &[String]) -> Result<()> {
    let enter_cmd = stage1_command(pod, ENTER_ENTRYPOINT).context("determine 'enter' entrypoint")?;
    let entrypoint_cmd =
        stage1_command(pod, entrypoint).context(format!("determine {entrypoint:?} entrypoint"))?;
    let pid1 = pod.pid1()?;

    let previous_dir = env::current_dir().context("determine working directory")?;
    debug!("Pivoting to pod directory {}", pod.path().display());
    env::set_current_dir(pod.path()).context("change to pod directory")?;

    let status = Command::new(&entrypoint_cmd)
        .args(args)
        .env_clear()
        .env("RKT_STAGE1_ENTERCMD", &enter_cmd)
        .env("RKT_STAGE1_ENTERPID", pid1.to_string())
        .env("RKT_STAGE1_ENTERAPPNAME", app)
        .status();

    env::set_current_dir(&previous_dir).context("restore working directory")?;

    let status = status.context("execute stage1 entrypoint")?;
    if !status.success() {
        bail!("stage1 entrypoint failed with {status}");
    }
    Ok(())
}

/// Resolve an entrypoint annotation to its path below the stage1 rootfs.
fn stage1_command(pod: &Pod, annotation: &str) -> Result<PathBuf> {
    let entrypoint = pod.stage1_entrypoint(annotation)?;
    Ok(pod
        .stage1_rootfs()
        .join(entrypoint.trim_start_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const UUID: &str = "15938e4e-9d0f-4c84-82b4-abe67a4b3bf5";

    #[test]
    fn entrypoints_resolve_below_the_stage1_rootfs() -> Result<()> {
        let data_dir = TempDir::new()?;
        let pod_dir = data_dir.path().join("pods/run").join(UUID);
        fs::create_dir_all(pod_dir.join("stage1"))?;
        fs::write(
            pod_dir.join("stage1/manifest"),
            r#"{"annotations":[{"name":"coreos.com/rkt/stage1/enter","value":"/enter"}]}"#,
        )?;

        let pod = Pod::load(data_dir.path(), UUID)?;
        assert_eq!(
            stage1_command(&pod, ENTER_ENTRYPOINT)?,
            pod_dir.join("stage1/rootfs/enter")
        );
        assert!(stage1_command(&pod, ATTACH_ENTRYPOINT).is_err());
        Ok(())
    }
}
