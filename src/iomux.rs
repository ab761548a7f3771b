//! Stream multiplexer for non-TTY applications.
//!
//! Serves the container side of up to three pre-created FIFOs, exposing each
//! enabled channel as a loopback TCP listener. Everything here is
//! line-oriented: output fan-out, logfile tee and the stdin channel all work
//! on `\n`-delimited records, and an unterminated tail is dropped at EOF.
//! In particular the stdin contract means an interactive client sees no echo
//! until it sends a full line; TTY mode exists precisely to avoid this, and
//! binary or unterminated streams are out of scope for stream mode.

use crate::{
    config::{Config, LogMode},
    fanout::{self, FanOut, Message},
    listener, notify,
    registry::{Endpoint, Registry, StreamName},
};
use anyhow::{Context, Result};
use std::path::Path;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
    net::TcpListener,
    sync::mpsc::UnboundedSender,
    task,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error};

/// FIFO names below the app directory, app-facing ends of the three streams.
const STDIN_FIFO: &str = "stage2-stdin";
const STDOUT_FIFO: &str = "stage2-stdout";
const STDERR_FIFO: &str = "stage2-stderr";

/// File name of the optional plain-text log tee.
const LOG_FILE: &str = "logfile";

/// Serve the stream multiplexer until `shutdown` fires.
///
/// FIFO opens block until the application opens its ends, and the endpoint
/// registry is committed before readiness can be signalled, so the app unit
/// never starts against half-wired channels. The whole startup prologue is
/// raced against `shutdown`: a termination request received while a FIFO
/// open is still blocked wins immediately.
pub async fn serve(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let channels = tokio::select! {
        channels = startup(config) => channels?,
        () = shutdown.cancelled() => {
            debug!("Shutdown requested during startup");
            return Ok(());
        }
    };

    if let Some((fifo, listener)) = channels.stdin {
        spawn_input_channel(listener, fifo);
    }
    if let Some((fifo, listener)) = channels.stdout {
        spawn_output_channel(StreamName::Stdout, fifo, listener, channels.stdout_tee);
    }
    if let Some((fifo, listener)) = channels.stderr {
        spawn_output_channel(StreamName::Stderr, fifo, listener, channels.stderr_tee);
    }

    shutdown.cancelled().await;
    Ok(())
}

/// The enabled channels, each one FIFO wired to its listener, plus the
/// optional tee targets.
struct Channels {
    stdin: Option<(File, TcpListener)>,
    stdout: Option<(File, TcpListener)>,
    stderr: Option<(File, TcpListener)>,
    stdout_tee: Option<File>,
    stderr_tee: Option<File>,
}

/// Open the enabled FIFOs and listeners, advertise and commit the registry,
/// open the tee and signal readiness.
async fn startup(config: &Config) -> Result<Channels> {
    let dir = config.app_dir();
    let mut registry = Registry::create(config.registry_path())?;

    let mut stdin_channel = None;
    if config.stdin() {
        let fifo = OpenOptions::new()
            .write(true)
            .open(dir.join(STDIN_FIFO))
            .await
            .context("open stdin FIFO")?;
        let (listener, port) = listener::bind_loopback().await?;
        registry.append(&Endpoint::loopback(StreamName::Stdin, port))?;
        stdin_channel = Some((fifo, listener));
    }

    let mut stdout_channel = None;
    if config.stdout() {
        let fifo = OpenOptions::new()
            .read(true)
            .open(dir.join(STDOUT_FIFO))
            .await
            .context("open stdout FIFO")?;
        let (listener, port) = listener::bind_loopback().await?;
        registry.append(&Endpoint::loopback(StreamName::Stdout, port))?;
        stdout_channel = Some((fifo, listener));
    }

    let mut stderr_channel = None;
    if config.stderr() {
        let fifo = OpenOptions::new()
            .read(true)
            .open(dir.join(STDERR_FIFO))
            .await
            .context("open stderr FIFO")?;
        let (listener, port) = listener::bind_loopback().await?;
        registry.append(&Endpoint::loopback(StreamName::Stderr, port))?;
        stderr_channel = Some((fifo, listener));
    }

    registry.commit().context("commit endpoint registry")?;

    let (stdout_tee, stderr_tee) = open_tee(config.log_mode(), &dir)?;

    notify::ready_if_configured().context("startup notification")?;

    Ok(Channels {
        stdin: stdin_channel,
        stdout: stdout_channel,
        stderr: stderr_channel,
        stdout_tee,
        stderr_tee,
    })
}

/// Open the k8s-plain logfile, truncating any predecessor.
///
/// Both channels tee into one file description (duplicated handle), so their
/// lines append sequentially instead of overwriting each other.
fn open_tee(mode: LogMode, dir: &Path) -> Result<(Option<File>, Option<File>)> {
    if mode != LogMode::K8sPlain {
        return Ok((None, None));
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dir.join(LOG_FILE))
        .context("open logfile")?;
    let dup = file.try_clone().context("duplicate logfile handle")?;
    Ok((Some(File::from_std(file)), Some(File::from_std(dup))))
}

/// Wire one output channel: drainer, accept loop and fan-out.
pub fn spawn_output_channel<R>(
    name: StreamName,
    fifo: R,
    listener: TcpListener,
    tee: Option<File>,
) -> UnboundedSender<Message>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let fanout = FanOut::spawn(name);
    if let Some(target) = tee {
        fanout.send(Message::Target(Box::new(target))).ok();
    }

    let drain_tx = fanout.clone();
    task::spawn(
        async move {
            if let Err(e) = fanout::drain_lines(BufReader::new(fifo), drain_tx).await {
                error!("Drain failure: {e:#}");
            }
        }
        .instrument(debug_span!("drain", stream = %name)),
    );

    let accept_tx = fanout.clone();
    task::spawn(
        async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("Accepted new connection for {name} from {addr}");
                        if accept_tx.send(Message::Client(Box::new(stream))).is_err() {
                            return;
                        }
                    }
                    Err(e) => error!("Accept failure on {name}: {e}"),
                }
            }
        }
        .instrument(debug_span!("accept", stream = %name)),
    );

    fanout
}

/// Wire the stdin channel: accept loop, per-client forwarders and the single
/// funnel writer owning the FIFO write end.
pub fn spawn_input_channel<W>(listener: TcpListener, fifo: W)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let funnel = fanout::spawn_funnel(fifo);
    task::spawn(
        async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("Accepted new connection for stdin from {addr}");
                        let tx = funnel.clone();
                        task::spawn(
                            forward_input(stream, tx).instrument(debug_span!("stdin-client")),
                        );
                    }
                    Err(e) => error!("Accept failure on stdin: {e}"),
                }
            }
        }
        .instrument(debug_span!("accept", stream = "stdin")),
    );
}

/// Forward one client's lines into the funnel; terminates on the first read
/// failure, client EOF, or funnel closure. No interleaving guarantees exist
/// between concurrent clients beyond whole lines.
async fn forward_input<R>(stream: R, funnel: UnboundedSender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return,
            Ok(_) => {
                if line.last() != Some(&b'\n') {
                    // unterminated tail at client EOF
                    return;
                }
                if funnel.send(line.clone()).is_err() {
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
    use std::{net::Ipv4Addr, time::Duration};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, duplex},
        net::TcpStream,
        time::timeout,
    };

    #[tokio::test]
    async fn output_channel_fans_out_to_tcp_clients() -> Result<()> {
        let (mut app, fifo) = duplex(1024);
        let (listener, port) = listener::bind_loopback().await?;
        spawn_output_channel(StreamName::Stdout, fifo, listener, None);

        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
        // Let the accept loop register the client before draining lines.
        tokio::time::sleep(Duration::from_millis(100)).await;

        app.write_all(b"ALPHA\nBETA\n").await?;

        let mut buf = vec![0; "ALPHA\nBETA\n".len()];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf)).await??;
        assert_eq!(buf, b"ALPHA\nBETA\n");
        Ok(())
    }

    #[tokio::test]
    async fn input_channel_funnels_client_lines() -> Result<()> {
        let (fifo, mut app) = duplex(1024);
        let (listener, port) = listener::bind_loopback().await?;
        spawn_input_channel(listener, fifo);

        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
        client.write_all(b"run\n").await?;

        let mut buf = vec![0; "run\n".len()];
        timeout(Duration::from_secs(5), app.read_exact(&mut buf)).await??;
        assert_eq!(buf, b"run\n");
        Ok(())
    }

    #[tokio::test]
    async fn input_forwarder_drops_unterminated_tail() -> Result<()> {
        let (mut client, server) = duplex(1024);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let forwarder = task::spawn(forward_input(server, tx));
        client.write_all(b"whole\npartial").await?;
        drop(client);

        forwarder.await?;
        assert_eq!(rx.recv().await, Some(b"whole\n".to_vec()));
        assert!(rx.try_recv().is_err());
        Ok(())
    }
}
