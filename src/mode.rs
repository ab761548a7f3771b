//! Attach-mode parsing and dispatcher argv construction.

use crate::config::Action;
use anyhow::{Result, bail};
use getset::{CopyGetters, Getters};

/// A validated attach request derived from the user-supplied `--mode` flag,
/// ready to be serialized into the stage1 attach entrypoint argv.
#[derive(CopyGetters, Debug, Eq, Getters, PartialEq)]
pub struct AttachRequest {
    #[get = "pub"]
    app: String,

    #[get_copy = "pub"]
    debug: bool,

    #[get_copy = "pub"]
    action: Action,

    #[get_copy = "pub"]
    tty_in: bool,

    #[get_copy = "pub"]
    tty_out: bool,

    #[get_copy = "pub"]
    stdin: bool,

    #[get_copy = "pub"]
    stdout: bool,

    #[get_copy = "pub"]
    stderr: bool,
}

impl AttachRequest {
    /// Parse a user-supplied mode string into a validated request.
    ///
    /// `list` (or an empty mode) and `auto` carry no explicit channel set;
    /// everything else selects channels by substring presence, with the
    /// shorthand `tty` standing for both terminal directions. The full
    /// names `tty-in` and `tty-out` are matched as such, so they can never
    /// be misread as the bare `tty` shorthand.
    pub fn parse(app: &str, debug: bool, mode: &str) -> Result<Self> {
        let mut request = Self {
            app: app.into(),
            debug,
            action: Action::CustomAttach,
            tty_in: false,
            tty_out: false,
            stdin: false,
            stdout: false,
            stderr: false,
        };

        match mode {
            "" | "list" => {
                request.action = Action::List;
                return Ok(request);
            }
            "auto" => {
                request.action = Action::AutoAttach;
                return Ok(request);
            }
            "tty" => {
                request.tty_in = true;
                request.tty_out = true;
            }
            _ => {
                request.tty_in = mode.contains("tty-in");
                request.tty_out = mode.contains("tty-out");
                request.stdin = mode.contains("stdin");
                request.stdout = mode.contains("stdout");
                request.stderr = mode.contains("stderr");
            }
        }

        let tty = request.tty_in || request.tty_out;
        let streams = request.stdin || request.stdout || request.stderr;
        if !tty && !streams {
            bail!("mode must specify at least one endpoint to attach");
        }
        if tty && streams {
            bail!("incompatible endpoints {mode:?}");
        }
        Ok(request)
    }

    /// The argument vector for the stage1 attach entrypoint.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--app={}", self.app),
            format!("--debug={}", self.debug),
            format!("--action={}", self.action),
        ];
        if self.action == Action::CustomAttach {
            args.extend([
                format!("--tty-in={}", self.tty_in),
                format!("--tty-out={}", self.tty_out),
                format!("--stdin={}", self.stdin),
                format!("--stdout={}", self.stdout),
                format!("--stderr={}", self.stderr),
            ]);
        }
        args
    }
}
