//! Host-side attach front-end.
//!
//! Resolves the target pod and app, translates the user-supplied attach mode
//! into the dispatcher argv, and launches the pod's attach entrypoint
//! through the crossing invoker.

use crate::{config, invoker, mode::AttachRequest, pod::Pod};
use anyhow::{Context, Result};
use clap::Parser;
use getset::{CopyGetters, Getters};
use std::path::PathBuf;

/// Default rkt data directory holding the pod trees.
const DEFAULT_DATA_DIR: &str = "/var/lib/rkt";

#[derive(CopyGetters, Debug, Getters, Parser)]
#[command(
    name = "iottymux-attach",
    version,
    about = "Attach to an app running within a pod"
)]
/// Configuration of the attach front-end.
pub struct Front {
    #[get = "pub"]
    #[arg(value_name("UUID"))]
    /// UUID of a running pod.
    uuid: String,

    #[get = "pub"]
    #[arg(default_value(""), long("app"), value_name("NAME"))]
    /// Name of the app to attach to within the specified pod.
    app: String,

    #[get = "pub"]
    #[arg(default_value("list"), long("mode"), value_name("MODE"))]
    /// Attach mode: "list", "auto", "tty", or a combination of tty-in,
    /// tty-out, stdin, stdout and stderr.
    mode: String,

    #[get_copy = "pub"]
    #[arg(
        default_missing_value("true"),
        default_value("false"),
        long("debug"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(clap::value_parser!(bool))
    )]
    /// Enable debug logging.
    debug: bool,

    #[get = "pub"]
    #[arg(
        default_value(DEFAULT_DATA_DIR),
        env("RKT_DATA_DIR"),
        long("data-dir"),
        value_name("DIR")
    )]
    /// Data directory holding the pod trees.
    data_dir: PathBuf,
}

impl Front {
    /// Parse the CLI, resolve the pod, and drive the attach invocation.
    pub fn run() -> Result<()> {
        let front = Self::parse();
        crate::init_logging(front.debug())?;

        let pod = Pod::load(front.data_dir(), front.uuid())?;
        let app = pod
            .app_name(Some(front.app().as_str()))
            .context("determine app name")?;
        config::validate_app_name(&app)?;

        let request = AttachRequest::parse(&app, front.debug(), front.mode())
            .context("invalid attach mode")?;
        invoker::attach(&pod, &app, &request.to_args())
    }
}
