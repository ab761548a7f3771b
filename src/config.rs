//! Configuration related structures
use crate::registry::REGISTRY_FILE;
use anyhow::{Result, bail};
use clap::Parser;
use getset::{CopyGetters, Getters};
use std::{convert::Infallible, path::PathBuf};
use strum::Display;

/// Default directory below which every app keeps its endpoints, FIFOs and
/// logfile.
pub const DEFAULT_BASE_DIR: &str = "/rkt/iottymux";

#[derive(CopyGetters, Debug, Getters, Parser)]
#[command(version, about = "Interactive I/O multiplexer for pod-confined applications")]
/// Configuration of the in-pod multiplexer and attach helper.
pub struct Config {
    #[get_copy = "pub"]
    #[arg(default_value("list"), long("action"), value_name("ACTION"))]
    /// Sub-action to perform.
    action: Action,

    #[get = "pub"]
    #[arg(default_value(""), env("STAGE2_APPNAME"), long("app"), value_name("NAME"))]
    /// Name of the application whose channels are multiplexed.
    app: String,

    #[get_copy = "pub"]
    #[arg(
        default_missing_value("true"),
        default_value("false"),
        env("STAGE1_DEBUG"),
        long("debug"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Enable debug logging.
    debug: bool,

    #[get_copy = "pub"]
    #[arg(
        default_value(""),
        env("STAGE1_LOGMODE"),
        long("log-mode"),
        value_name("MODE"),
        value_parser(log_mode)
    )]
    /// Output log mode, "k8s-plain" tees stdout and stderr into the app logfile.
    log_mode: LogMode,

    #[get = "pub"]
    #[arg(
        default_value(DEFAULT_BASE_DIR),
        env("IOTTYMUX_BASE_DIR"),
        long("base-dir"),
        value_name("DIR")
    )]
    /// Directory holding the per-app endpoint registries and FIFOs.
    base_dir: PathBuf,

    #[get_copy = "pub"]
    #[arg(
        default_value("false"),
        env("STAGE2_STDIN"),
        long("stdin"),
        default_missing_value("true"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Whether the application stdin channel is enabled.
    stdin: bool,

    #[get_copy = "pub"]
    #[arg(
        default_value("false"),
        env("STAGE2_STDOUT"),
        long("stdout"),
        default_missing_value("true"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Whether the application stdout channel is enabled.
    stdout: bool,

    #[get_copy = "pub"]
    #[arg(
        default_value("false"),
        env("STAGE2_STDERR"),
        long("stderr"),
        default_missing_value("true"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Whether the application stderr channel is enabled.
    stderr: bool,

    #[get_copy = "pub"]
    #[arg(
        default_value("false"),
        env("STAGE2_ATTACH_TTYIN"),
        long("attach-tty-in"),
        default_missing_value("true"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Select the tty-in endpoint for a custom attach.
    attach_tty_in: bool,

    #[get_copy = "pub"]
    #[arg(
        default_value("false"),
        env("STAGE2_ATTACH_TTYOUT"),
        long("attach-tty-out"),
        default_missing_value("true"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Select the tty-out endpoint for a custom attach.
    attach_tty_out: bool,

    #[get_copy = "pub"]
    #[arg(
        default_value("false"),
        env("STAGE2_ATTACH_STDIN"),
        long("attach-stdin"),
        default_missing_value("true"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Select the stdin endpoint for a custom attach.
    attach_stdin: bool,

    #[get_copy = "pub"]
    #[arg(
        default_value("false"),
        env("STAGE2_ATTACH_STDOUT"),
        long("attach-stdout"),
        default_missing_value("true"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Select the stdout endpoint for a custom attach.
    attach_stdout: bool,

    #[get_copy = "pub"]
    #[arg(
        default_value("false"),
        env("STAGE2_ATTACH_STDERR"),
        long("attach-stderr"),
        default_missing_value("true"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Select the stderr endpoint for a custom attach.
    attach_stderr: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse()
    }
}

impl Config {
    /// Validate the configuration integrity.
    pub fn validate(&self) -> Result<()> {
        validate_app_name(self.app())
    }

    /// Directory backing this app's endpoints, FIFOs and logfile.
    pub fn app_dir(&self) -> PathBuf {
        self.base_dir().join(self.app())
    }

    /// Path of this app's endpoint registry.
    pub fn registry_path(&self) -> PathBuf {
        self.app_dir().join(REGISTRY_FILE)
    }
}

/// Sub-actions of the in-pod helper.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, clap::ValueEnum)]
#[strum(serialize_all = "kebab-case")]
pub enum Action {
    /// Print the advertised endpoints of the app.
    List,
    /// Bridge every advertised endpoint to the caller streams.
    AutoAttach,
    /// Bridge the selected endpoints only.
    CustomAttach,
    /// Serve the stream multiplexer for a non-TTY app.
    Iomux,
    /// Serve the TTY multiplexer for a terminal app.
    Ttymux,
}

/// Available output log modes.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum LogMode {
    /// No persistent log.
    None,
    /// Kubernetes-style plain text tee of stdout and stderr.
    K8sPlain,
}

/// Parser for the stringly-typed environment flags: `"true"` enables,
/// anything else disables.
fn true_flag(value: &str) -> Result<bool, Infallible> {
    Ok(value == "true")
}

fn log_mode(value: &str) -> Result<LogMode, Infallible> {
    Ok(match value {
        "k8s-plain" => LogMode::K8sPlain,
        _ => LogMode::None,
    })
}

/// Validate an AC name: slash-separated segments of lowercase alphanumerics
/// and dashes, with no empty segment and no leading or trailing dash.
///
/// App names become filesystem path components, so this gate runs before any
/// path is derived from them.
pub fn validate_app_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("empty app name");
    }
    for segment in name.split('/') {
        let valid = !segment.is_empty()
            && !segment.starts_with('-')
            && !segment.ends_with('-')
            && segment
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if !valid {
            bail!("invalid app name ({name}): not a valid AC name");
        }
    }
    Ok(())
}
