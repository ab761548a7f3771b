//! Stage1 attach entrypoint: re-enter the pod and exec the multiplexer
//! helper.
//!
//! This trampoline receives the dispatcher argv from the host-side
//! front-end, translates the channel flags into the `STAGE2_*` environment,
//! and runs `/iottymux` inside the pod through the namespace-entry command
//! passed down in `RKT_STAGE1_ENTERCMD`.

use crate::config::{self, Action};
use anyhow::{Context, Result, bail};
use clap::Parser;
use getset::{CopyGetters, Getters};
use std::{convert::Infallible, env, process::Command};
use tracing::debug;

/// In-pod path of the multiplexer helper.
const IOTTYMUX_PATH: &str = "/iottymux";

#[derive(CopyGetters, Debug, Getters, Parser)]
#[command(name = "iottymux-entry", version, about = "Stage1 attach entrypoint")]
/// The dispatcher argv as emitted by the attach front-end.
pub struct Entry {
    #[get = "pub"]
    #[arg(default_value(""), long("app"), value_name("NAME"))]
    /// Application name.
    app: String,

    #[get_copy = "pub"]
    #[arg(
        default_missing_value("true"),
        default_value("false"),
        long("debug"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Enable debug logging.
    debug: bool,

    #[get_copy = "pub"]
    #[arg(default_value("list"), long("action"), value_name("ACTION"))]
    /// Attach action to dispatch.
    action: Action,

    #[get_copy = "pub"]
    #[arg(
        default_missing_value("true"),
        default_value("false"),
        long("tty-in"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Attach to the tty-in endpoint.
    tty_in: bool,

    #[get_copy = "pub"]
    #[arg(
        default_missing_value("true"),
        default_value("false"),
        long("tty-out"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Attach to the tty-out endpoint.
    tty_out: bool,

    #[get_copy = "pub"]
    #[arg(
        default_missing_value("true"),
        default_value("false"),
        long("stdin"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Attach to the stdin endpoint.
    stdin: bool,

    #[get_copy = "pub"]
    #[arg(
        default_missing_value("true"),
        default_value("false"),
        long("stdout"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Attach to the stdout endpoint.
    stdout: bool,

    #[get_copy = "pub"]
    #[arg(
        default_missing_value("true"),
        default_value("false"),
        long("stderr"),
        num_args(0..=1),
        require_equals(true),
        value_name("BOOL"),
        value_parser(true_flag)
    )]
    /// Attach to the stderr endpoint.
    stderr: bool,
}

fn true_flag(value: &str) -> Result<bool, Infallible> {
    Ok(value == "true")
}

impl Entry {
    /// Parse the dispatcher argv and run the in-pod helper.
    pub fn run() -> Result<()> {
        let entry = Self::parse();
        crate::init_logging(entry.debug())?;
        config::validate_app_name(entry.app())?;

        let argv = entry.helper_argv(
            env::var("RKT_STAGE1_ENTERCMD").ok().as_deref(),
            env::var("RKT_STAGE1_ENTERPID").ok().as_deref(),
        )?;
        debug!("Executing {argv:?}");

        let status = Command::new(&argv[0])
            .args(&argv[1..])
            .env_clear()
            .env("STAGE2_APPNAME", entry.app())
            .env("STAGE1_DEBUG", entry.debug().to_string())
            .env("STAGE2_ATTACH_TTYIN", entry.tty_in().to_string())
            .env("STAGE2_ATTACH_TTYOUT", entry.tty_out().to_string())
            .env("STAGE2_ATTACH_STDIN", entry.stdin().to_string())
            .env("STAGE2_ATTACH_STDOUT", entry.stdout().to_string())
            .env("STAGE2_ATTACH_STDERR", entry.stderr().to_string())
            .status()
            .context(r#"execute "iottymux""#)?;
        if !status.success() {
            bail!(r#""iottymux" failed with {status}"#);
        }
        Ok(())
    }

    /// The helper argv, prefixed with the namespace-entry command when one
    /// was handed down through the environment.
    fn helper_argv(&self, enter_cmd: Option<&str>, enter_pid: Option<&str>) -> Result<Vec<String>> {
        let mut argv = Vec::new();
        if let Some(enter_cmd) = enter_cmd {
            if !enter_cmd.is_empty() {
                let pid = enter_pid.context("RKT_STAGE1_ENTERPID not set")?;
                argv.extend([enter_cmd.into(), format!("--pid={pid}"), "--".into()]);
            }
        }
        argv.push(IOTTYMUX_PATH.into());
        argv.push(format!("--action={}", self.action()));
        Ok(argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Entry {
        Entry::try_parse_from([&["iottymux-entry"], args].concat()).expect("parse entry")
    }

    #[test]
    fn dispatcher_argv_round_trips() {
        let entry = parse(&[
            "--app=app-a",
            "--debug=false",
            "--action=custom-attach",
            "--tty-in=false",
            "--tty-out=false",
            "--stdin=true",
            "--stdout=true",
            "--stderr=false",
        ]);
        assert_eq!(entry.app(), "app-a");
        assert_eq!(entry.action(), Action::CustomAttach);
        assert!(entry.stdin());
        assert!(entry.stdout());
        assert!(!entry.stderr());
        assert!(!entry.tty_in());
    }

    #[test]
    fn helper_argv_without_enter_command() -> Result<()> {
        let entry = parse(&["--app=app-a", "--action=list"]);
        assert_eq!(
            entry.helper_argv(None, None)?,
            vec!["/iottymux", "--action=list"]
        );
        Ok(())
    }

    #[test]
    fn helper_argv_with_enter_command() -> Result<()> {
        let entry = parse(&["--app=app-a", "--action=auto-attach"]);
        assert_eq!(
            entry.helper_argv(Some("/enter"), Some("4242"))?,
            vec![
                "/enter",
                "--pid=4242",
                "--",
                "/iottymux",
                "--action=auto-attach"
            ]
        );
        Ok(())
    }

    #[test]
    fn enter_command_requires_a_pid() {
        let entry = parse(&["--app=app-a"]);
        assert!(entry.helper_argv(Some("/enter"), None).is_err());
    }
}
