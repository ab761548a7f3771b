//! Pod lookups needed by the host-side attach front-end.
//!
//! Only the minimal read-side contracts live here: resolving a running pod
//! directory from its UUID, its PID1, the app list from the pod manifest,
//! and the stage1 entrypoint annotations.

use anyhow::{Context, Result, bail};
use getset::Getters;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Directory below the data dir where running pods live.
const RUN_DIR: &str = "pods/run";

/// Pod manifest file name inside the pod directory.
const POD_MANIFEST: &str = "pod";

/// File holding the pod's PID1 inside the pod directory.
const PID_FILE: &str = "pid";

/// Stage1 image manifest, relative to the pod directory.
const STAGE1_MANIFEST: &str = "stage1/manifest";

/// Stage1 rootfs, relative to the pod directory.
const STAGE1_ROOTFS: &str = "stage1/rootfs";

/// A running pod resolved from its UUID.
#[derive(Debug, Getters)]
pub struct Pod {
    #[get = "pub"]
    uuid: String,

    #[get = "pub"]
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct PodManifest {
    apps: Vec<RuntimeApp>,
}

#[derive(Debug, Deserialize)]
struct RuntimeApp {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ImageManifest {
    #[serde(default)]
    annotations: Vec<Annotation>,
}

#[derive(Debug, Deserialize)]
struct Annotation {
    name: String,
    value: String,
}

impl Pod {
    /// Resolve a pod directory below `data_dir`, failing when the pod is not
    /// currently running.
    pub fn load(data_dir: &Path, uuid: &str) -> Result<Self> {
        let path = data_dir.join(RUN_DIR).join(uuid);
        if !path.is_dir() {
            bail!("pod {uuid:?} is not currently running");
        }
        debug!("Resolved pod at {}", path.display());
        Ok(Self {
            uuid: uuid.into(),
            path,
        })
    }

    /// The pod's PID1.
    pub fn pid1(&self) -> Result<i32> {
        let contents = fs::read_to_string(self.path.join(PID_FILE))
            .context(format!("determine the pid for pod {:?}", self.uuid))?;
        contents
            .trim()
            .parse()
            .context(format!("malformed pid for pod {:?}", self.uuid))
    }

    /// The target app name: the explicit flag when given, otherwise inferred
    /// from the pod manifest when the pod runs exactly one app.
    pub fn app_name(&self, flag: Option<&str>) -> Result<String> {
        if let Some(name) = flag {
            if !name.is_empty() {
                return Ok(name.into());
            }
        }

        let manifest = self.manifest()?;
        match manifest.apps.as_slice() {
            [app] => Ok(app.name.clone()),
            [] => bail!("pod {:?} contains no apps", self.uuid),
            _ => bail!(
                "pod {:?} contains multiple apps, specify the app name",
                self.uuid
            ),
        }
    }

    /// Root of the stage1 filesystem.
    pub fn stage1_rootfs(&self) -> PathBuf {
        self.path.join(STAGE1_ROOTFS)
    }

    /// Resolve a stage1 entrypoint annotation to a path relative to the
    /// stage1 rootfs.
    pub fn stage1_entrypoint(&self, annotation: &str) -> Result<String> {
        let contents = fs::read_to_string(self.path.join(STAGE1_MANIFEST))
            .context("open stage1 image manifest")?;
        let manifest: ImageManifest =
            serde_json::from_str(&contents).context("parse stage1 image manifest")?;
        manifest
            .annotations
            .into_iter()
            .find(|a| a.name == annotation)
            .map(|a| a.value)
            .context(format!("entrypoint {annotation:?} not annotated"))
    }

    fn manifest(&self) -> Result<PodManifest> {
        let contents =
            fs::read_to_string(self.path.join(POD_MANIFEST)).context("open pod manifest")?;
        serde_json::from_str(&contents).context("parse pod manifest")
    }
}
