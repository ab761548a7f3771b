//! TTY multiplexer for terminal applications.
//!
//! Owns the master side of a PTY pair and bind-mounts the slave device into
//! the app directory, so the subsequent application unit can dup it onto its
//! fd 0/1/2 by path. The master is exposed as a single bidirectional
//! loopback listener; bytes are forwarded raw in both directions to preserve
//! terminal control sequences.

use crate::{
    config::Config,
    fanout::{self, FanOut, Message},
    listener, notify,
    registry::{Endpoint, Registry, StreamName},
};
use anyhow::{Context, Result};
use nix::{
    mount::{MsFlags, mount},
    pty::openpty,
    unistd::ttyname,
};
use std::fs;
use tokio::{io::AsyncReadExt, net::TcpListener, task};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error};

/// Bind-mount target of the PTY slave below the app directory.
const TTY_FILE: &str = "tty";

/// Interaction flavor derived from the requested stream directions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TtyMode {
    /// No direction requested; the slave is still bind-mounted for local use
    /// by the app unit, but no listener is created.
    Unexposed,
    /// Input only.
    In,
    /// Output only.
    Out,
    /// Both directions.
    Both,
}

impl TtyMode {
    /// Derive the flavor from the per-stream request flags.
    pub fn from_flags(stdin: bool, stdout: bool, stderr: bool) -> Self {
        match (stdin, stdout || stderr) {
            (true, true) => Self::Both,
            (true, false) => Self::In,
            (false, true) => Self::Out,
            (false, false) => Self::Unexposed,
        }
    }

    /// The endpoint name this flavor is advertised under, if any.
    pub fn endpoint_name(self) -> Option<StreamName> {
        match self {
            Self::Unexposed => None,
            Self::In => Some(StreamName::TtyIn),
            Self::Out => Some(StreamName::TtyOut),
            Self::Both => Some(StreamName::Tty),
        }
    }
}

/// Serve the TTY multiplexer until `shutdown` fires.
pub async fn serve(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let dir = config.app_dir();

    debug!("Opening PTY pair");
    let pty = openpty(None, None).context("allocate PTY pair")?;
    let slave_path = ttyname(&pty.slave).context("resolve PTY slave path")?;
    debug!("PTY slave at {}", slave_path.display());

    let tty_path = dir.join(TTY_FILE);
    fs::File::create(&tty_path).context("create PTY bind-mount target")?;
    mount(
        Some(&slave_path),
        &tty_path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .context("bind-mount PTY slave")?;

    let mode = TtyMode::from_flags(config.stdin(), config.stdout(), config.stderr());
    let mut registry = Registry::create(config.registry_path())?;
    let mut serving = None;
    if let Some(name) = mode.endpoint_name() {
        let (listener, port) = listener::bind_loopback().await?;
        registry.append(&Endpoint::loopback(name, port))?;
        serving = Some((listener, name));
    }
    registry.commit().context("commit endpoint registry")?;

    notify::ready().context("startup notification")?;
    debug!("TTY handler ready");

    // Keep the slave end open for the mux lifetime so reads on the master
    // never hit EIO while no client or app unit holds the device.
    let slave = fs::File::from(pty.slave);

    if let Some((listener, name)) = serving {
        spawn_tty_channel(name, pty.master, listener)?;
    }

    shutdown.cancelled().await;
    drop(slave);
    Ok(())
}

/// Wire the PTY master to the listener: a single master reader fans raw
/// chunks out to every live client, and input from every client is funneled
/// through a single master writer, interleaved byte-for-byte.
fn spawn_tty_channel(
    name: StreamName,
    master: std::os::fd::OwnedFd,
    listener: TcpListener,
) -> Result<()> {
    let read_half = tokio::fs::File::from_std(fs::File::from(
        master.try_clone().context("duplicate PTY master")?,
    ));
    let write_half = tokio::fs::File::from_std(fs::File::from(master));

    let fanout = FanOut::spawn(name);
    let drain_tx = fanout.clone();
    task::spawn(
        async move {
            if let Err(e) = fanout::drain_chunks(read_half, drain_tx).await {
                error!("Drain failure: {e:#}");
            }
        }
        .instrument(debug_span!("drain", stream = %name)),
    );

    let funnel = fanout::spawn_funnel(write_half);
    task::spawn(
        async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("Accepted new connection for {name} from {addr}");
                        let (client_read, client_write) = stream.into_split();
                        if fanout.send(Message::Client(Box::new(client_write))).is_err() {
                            return;
                        }
                        let tx = funnel.clone();
                        task::spawn(
                            forward_client(client_read, tx)
                                .instrument(debug_span!("tty-client")),
                        );
                    }
                    Err(e) => error!("Accept failure on {name}: {e}"),
                }
            }
        }
        .instrument(debug_span!("accept", stream = %name)),
    );

    Ok(())
}

/// Forward one client's raw bytes into the master funnel.
async fn forward_client<R>(mut reader: R, funnel: tokio::sync::mpsc::UnboundedSender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(read) => {
                if funnel.send(buf[..read].to_vec()).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Client read failure: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::{Read, Write}, net::Ipv4Addr, time::Duration};
    use tokio::{io::AsyncWriteExt, net::TcpStream, time::timeout};

    #[test]
    fn mode_derivation() {
        assert_eq!(TtyMode::from_flags(true, false, false), TtyMode::In);
        assert_eq!(TtyMode::from_flags(false, true, false), TtyMode::Out);
        assert_eq!(TtyMode::from_flags(false, false, true), TtyMode::Out);
        assert_eq!(TtyMode::from_flags(true, true, false), TtyMode::Both);
        assert_eq!(TtyMode::from_flags(true, false, true), TtyMode::Both);
        assert_eq!(TtyMode::from_flags(false, false, false), TtyMode::Unexposed);

        assert_eq!(TtyMode::In.endpoint_name(), Some(StreamName::TtyIn));
        assert_eq!(TtyMode::Out.endpoint_name(), Some(StreamName::TtyOut));
        assert_eq!(TtyMode::Both.endpoint_name(), Some(StreamName::Tty));
        assert_eq!(TtyMode::Unexposed.endpoint_name(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tty_channel_is_bidirectional_and_raw() -> Result<()> {
        let pty = openpty(None, None)?;
        // The slave stands in for the application side of the terminal.
        let mut slave = fs::File::from(pty.slave);

        let (listener, port) = listener::bind_loopback().await?;
        spawn_tty_channel(StreamName::Tty, pty.master, listener)?;

        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Raw output: no line framing, control bytes preserved.
        let payload = b"\x1b[1mhe";
        let mut writer = slave.try_clone()?;
        task::spawn_blocking(move || writer.write_all(payload)).await??;

        let mut buf = vec![0; payload.len()];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf)).await??;
        assert_eq!(buf, payload);

        // Input path: client bytes reach the slave. The fresh PTY is still in
        // canonical mode, so the line is delivered once the newline arrives.
        client.write_all(b"x\n").await?;
        let got = task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut b = vec![0; 2];
            slave.read_exact(&mut b)?;
            Ok(b)
        })
        .await??;
        assert_eq!(got, b"x\n");
        Ok(())
    }
}
