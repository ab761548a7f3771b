//! In-pod attach actions: list and bridge the advertised endpoints of an app.
//!
//! The process is already inside the pod's namespaces when these run, placed
//! there by the crossing invoker, so the loopback dials below reach the mux
//! listeners directly.

use crate::{
    config::Config,
    fanout::Sink,
    registry::{Endpoint, Registry, StreamName},
};
use anyhow::{Context, Result, bail};
use futures::future::join_all;
use std::io::Write;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    task::{self, JoinHandle},
};
use tracing::{Instrument, debug, debug_span};

/// Any byte source a bridge can read the caller side from.
type Source = Box<dyn AsyncRead + Send + Unpin>;

/// The caller-side streams endpoints are bridged to.
///
/// Each stream backs at most one bridge per invocation; the TTY and stream
/// flavors are mutually exclusive within one registry, so no valid endpoint
/// set needs a caller stream twice.
pub struct Caller {
    stdin: Option<Source>,
    stdout: Option<Sink>,
    stderr: Option<Sink>,
}

impl Caller {
    /// The invoking process' own standard streams.
    pub fn stdio() -> Self {
        Self::new(
            tokio::io::stdin(),
            tokio::io::stdout(),
            tokio::io::stderr(),
        )
    }

    /// Bundle arbitrary caller streams.
    pub fn new(
        stdin: impl AsyncRead + Send + Unpin + 'static,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdin: Some(Box::new(stdin)),
            stdout: Some(Box::new(stdout)),
            stderr: Some(Box::new(stderr)),
        }
    }

    fn stdin(&mut self) -> Result<Source> {
        self.stdin.take().context("caller stdin already bridged")
    }

    fn stdout(&mut self) -> Result<Sink> {
        self.stdout.take().context("caller stdout already bridged")
    }

    fn stderr(&mut self) -> Result<Sink> {
        self.stderr.take().context("caller stderr already bridged")
    }
}

/// Print every advertised endpoint of the app on `out`.
pub fn list(config: &Config, out: &mut impl Write) -> Result<()> {
    for endpoint in Registry::load(config.registry_path())? {
        writeln!(
            out,
            "{} available on port {}",
            endpoint.name(),
            endpoint.port()
        )
        .context("write endpoint listing")?;
    }
    Ok(())
}

/// Bridge every advertised endpoint to the caller streams.
pub async fn auto(config: &Config, caller: Caller) -> Result<()> {
    let endpoints = Registry::load(config.registry_path())?;
    bridge(&endpoints, None, caller).await
}

/// Bridge exactly the endpoints selected through the attach flags.
pub async fn custom(config: &Config, caller: Caller) -> Result<()> {
    let selection = selection(config)?;
    let endpoints: Vec<Endpoint> = Registry::load(config.registry_path())?
        .into_iter()
        .filter(|endpoint| selected(&selection, endpoint.name()))
        .collect();
    bridge(&endpoints, Some(&selection), caller).await
}

/// Collect and validate the requested channel set.
fn selection(config: &Config) -> Result<Vec<StreamName>> {
    let flags = [
        (config.attach_tty_in(), StreamName::TtyIn),
        (config.attach_tty_out(), StreamName::TtyOut),
        (config.attach_stdin(), StreamName::Stdin),
        (config.attach_stdout(), StreamName::Stdout),
        (config.attach_stderr(), StreamName::Stderr),
    ];
    let selection: Vec<StreamName> = flags
        .into_iter()
        .filter_map(|(requested, name)| requested.then_some(name))
        .collect();

    if selection.is_empty() {
        bail!("mode must specify at least one endpoint to attach");
    }
    if selection.iter().any(|name| name.is_tty()) && selection.iter().any(|name| !name.is_tty()) {
        bail!("incompatible endpoints");
    }
    Ok(selection)
}

/// Whether an advertised endpoint matches the requested channel set.
///
/// A `tty` endpoint serves both directions, so any selected TTY channel
/// matches it; the bridged directions are narrowed in [`bridge`].
fn selected(selection: &[StreamName], name: StreamName) -> bool {
    match name {
        StreamName::Tty => selection.iter().any(|n| n.is_tty()),
        name => selection.contains(&name),
    }
}

/// Dial every endpoint and wire it to the caller streams, then block until
/// all bridges terminate. Any dial failure is fatal.
async fn bridge(
    endpoints: &[Endpoint],
    selection: Option<&[StreamName]>,
    mut caller: Caller,
) -> Result<()> {
    let mut bridges: Vec<JoinHandle<()>> = Vec::new();
    for endpoint in endpoints {
        let stream = TcpStream::connect((endpoint.address(), endpoint.port()))
            .await
            .context(format!(
                "dial {} endpoint on port {}",
                endpoint.name(),
                endpoint.port()
            ))?;
        debug!("Bridging {} endpoint", endpoint.name());

        match endpoint.name() {
            StreamName::Stdin | StreamName::TtyIn => {
                bridges.push(spawn_copy(caller.stdin()?, stream, endpoint.name()));
            }
            StreamName::Stdout | StreamName::TtyOut => {
                bridges.push(spawn_copy(stream, caller.stdout()?, endpoint.name()));
            }
            StreamName::Stderr => {
                bridges.push(spawn_copy(stream, caller.stderr()?, endpoint.name()));
            }
            StreamName::Tty => {
                let (read_half, write_half) = stream.into_split();
                let want_in = selection.is_none_or(|s| s.contains(&StreamName::TtyIn));
                let want_out = selection.is_none_or(|s| s.contains(&StreamName::TtyOut));
                if want_in {
                    bridges.push(spawn_copy(caller.stdin()?, write_half, endpoint.name()));
                }
                if want_out {
                    bridges.push(spawn_copy(read_half, caller.stdout()?, endpoint.name()));
                }
            }
        }
    }

    join_all(bridges).await;
    Ok(())
}

/// One bridge direction; ends when either side closes or fails.
fn spawn_copy<R, W>(mut reader: R, mut writer: W, name: StreamName) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    task::spawn(
        async move {
            if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
                debug!("Bridge terminated: {e}");
            }
        }
        .instrument(debug_span!("bridge", stream = %name)),
    )
}
