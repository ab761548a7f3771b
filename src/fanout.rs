//! Multi-sink output fan-out.
//!
//! One fan-out task exclusively owns the client and tee-target lists of a
//! single output channel and consumes a single typed queue. Dead sinks are
//! flagged and skipped, never retried and never removed, so one failing
//! client cannot disturb the others.

use crate::registry::StreamName;
use anyhow::{Context, Result};
use memchr::memchr;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task,
};
use tracing::{Instrument, debug, debug_span, error, trace};
use tz::{DateTime, TimeZone};

/// Any byte sink a fan-out can serve.
pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// A message to be consumed by a fan-out task.
pub enum Message {
    /// A chunk drained from the application side, forwarded to every live sink.
    Data(Vec<u8>),
    /// A newly accepted client connection; it only receives chunks drained
    /// after it was registered.
    Client(Sink),
    /// A local tee target; it receives timestamped, stream-labelled lines.
    Target(Sink),
}

struct Slot {
    sink: Sink,
    alive: bool,
}

impl Slot {
    /// Write `chunk`, clearing the alive flag and closing the sink on failure.
    async fn write(&mut self, chunk: &[u8]) {
        if !self.alive {
            return;
        }
        let mut result = self.sink.write_all(chunk).await;
        if result.is_ok() {
            result = self.sink.flush().await;
        }
        if let Err(e) = result {
            trace!("Dropping dead sink: {e}");
            self.alive = false;
            let _ = self.sink.shutdown().await;
        }
    }
}

/// The fan-out state for one output channel.
pub struct FanOut {
    label: StreamName,
    clients: Vec<Slot>,
    targets: Vec<Slot>,
}

impl FanOut {
    /// Spawn a fan-out task for the given stream and return its input queue.
    ///
    /// The task runs until every queue sender is dropped.
    pub fn spawn(label: StreamName) -> UnboundedSender<Message> {
        let (tx, rx) = unbounded_channel();
        let fanout = Self {
            label,
            clients: Vec::new(),
            targets: Vec::new(),
        };
        task::spawn(
            async move {
                if let Err(e) = fanout.run(rx).await {
                    error!("Fan-out failure: {e:#}");
                }
            }
            .instrument(debug_span!("fanout", stream = %label)),
        );
        tx
    }

    async fn run(mut self, mut rx: UnboundedReceiver<Message>) -> Result<()> {
        while let Some(message) = rx.recv().await {
            match message {
                Message::Data(chunk) => self.broadcast(&chunk).await?,
                Message::Client(sink) => {
                    debug!("Registering new {} client", self.label);
                    self.clients.push(Slot { sink, alive: true });
                }
                Message::Target(sink) => {
                    debug!("Registering new {} tee target", self.label);
                    self.targets.push(Slot { sink, alive: true });
                }
            }
        }
        debug!("Queue closed, {} fan-out done", self.label);
        Ok(())
    }

    async fn broadcast(&mut self, chunk: &[u8]) -> Result<()> {
        if self.targets.iter().any(|t| t.alive) {
            let prefix = format!("{} {} ", timestamp()?, self.label).into_bytes();
            let line = [prefix.as_slice(), chunk].concat();
            for target in &mut self.targets {
                target.write(&line).await;
            }
        }
        for client in &mut self.clients {
            client.write(chunk).await;
        }
        Ok(())
    }
}

/// Current local time in RFC3339 form with nanosecond precision.
fn timestamp() -> Result<String> {
    let tz = TimeZone::local().context("get local timezone")?;
    Ok(DateTime::now(tz.as_ref())
        .context("get local datetime")?
        .to_string())
}

/// Drain `reader` line by line into a fan-out queue.
///
/// Lines keep their `\n` terminator. An unterminated tail at EOF is dropped.
pub async fn drain_lines<R>(mut reader: R, fanout: UnboundedSender<Message>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        loop {
            let available = reader.fill_buf().await.context("read line")?;
            if available.is_empty() {
                return Ok(());
            }
            match memchr(b'\n', available) {
                Some(i) => {
                    line.extend_from_slice(&available[..=i]);
                    reader.consume(i + 1);
                    break;
                }
                None => {
                    let read = available.len();
                    line.extend_from_slice(available);
                    reader.consume(read);
                }
            }
        }
        if fanout.send(Message::Data(line.clone())).is_err() {
            return Ok(());
        }
    }
}

/// Drain `reader` into a fan-out queue in raw chunks, preserving terminal
/// control sequences.
pub async fn drain_chunks<R>(mut reader: R, fanout: UnboundedSender<Message>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0; 8192];
    loop {
        let read = reader.read(&mut buf).await.context("read chunk")?;
        if read == 0 {
            return Ok(());
        }
        if fanout.send(Message::Data(buf[..read].to_vec())).is_err() {
            return Ok(());
        }
    }
}

/// Funnel writer: single owner of an application-facing write end, fed by
/// any number of per-client forwarders.
pub fn spawn_funnel<W>(mut writer: W) -> UnboundedSender<Vec<u8>>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx) = unbounded_channel::<Vec<u8>>();
    task::spawn(
        async move {
            while let Some(chunk) = rx.recv().await {
                if let Err(e) = writer.write_all(&chunk).await {
                    debug!("Funnel write failure: {e}");
                    return;
                }
            }
        }
        .instrument(debug_span!("funnel")),
    );
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::{
        fs,
        io::{AsyncReadExt, BufReader, duplex},
        time::timeout,
    };

    async fn read_exact(reader: &mut (impl AsyncRead + Unpin), len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        timeout(Duration::from_secs(5), reader.read_exact(&mut buf)).await??;
        Ok(buf)
    }

    #[tokio::test]
    async fn broadcast_preserves_order() -> Result<()> {
        let tx = FanOut::spawn(StreamName::Stdout);
        let (client, mut receiver) = duplex(1024);
        tx.send(Message::Client(Box::new(client))).ok();

        for line in ["ALPHA\n", "BETA\n", "GAMMA\n"] {
            tx.send(Message::Data(line.into())).ok();
        }

        let got = read_exact(&mut receiver, "ALPHA\nBETA\nGAMMA\n".len()).await?;
        assert_eq!(got, b"ALPHA\nBETA\nGAMMA\n");
        Ok(())
    }

    #[tokio::test]
    async fn late_joiner_misses_history() -> Result<()> {
        let tx = FanOut::spawn(StreamName::Stdout);
        tx.send(Message::Data(b"EARLY\n".to_vec())).ok();

        let (client, mut receiver) = duplex(1024);
        tx.send(Message::Client(Box::new(client))).ok();
        tx.send(Message::Data(b"LATE\n".to_vec())).ok();

        let got = read_exact(&mut receiver, "LATE\n".len()).await?;
        assert_eq!(got, b"LATE\n");
        Ok(())
    }

    #[tokio::test]
    async fn dead_client_does_not_disturb_others() -> Result<()> {
        let tx = FanOut::spawn(StreamName::Stdout);

        let (dead, dead_receiver) = duplex(16);
        drop(dead_receiver);
        tx.send(Message::Client(Box::new(dead))).ok();

        let (live, mut receiver) = duplex(1024);
        tx.send(Message::Client(Box::new(live))).ok();

        tx.send(Message::Data(b"ALPHA\n".to_vec())).ok();
        tx.send(Message::Data(b"BETA\n".to_vec())).ok();

        let got = read_exact(&mut receiver, "ALPHA\nBETA\n".len()).await?;
        assert_eq!(got, b"ALPHA\nBETA\n");
        Ok(())
    }

    #[tokio::test]
    async fn tee_lines_are_timestamped_and_labelled() -> Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        let tx = FanOut::spawn(StreamName::Stderr);
        let target = fs::OpenOptions::new()
            .write(true)
            .open(file.path())
            .await?;
        tx.send(Message::Target(Box::new(target))).ok();
        tx.send(Message::Data(b"oops\n".to_vec())).ok();

        let mut contents = String::new();
        for _ in 0..50 {
            contents = std::fs::read_to_string(file.path())?;
            if !contents.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut fields = contents.split_whitespace();
        let stamp = fields.next().expect("no timestamp");
        time::OffsetDateTime::parse(stamp, &time::format_description::well_known::Rfc3339)
            .expect("unable to parse timestamp");
        assert_eq!(fields.next(), Some("stderr"));
        assert_eq!(fields.next(), Some("oops"));
        Ok(())
    }

    #[tokio::test]
    async fn drain_lines_drops_unterminated_tail() -> Result<()> {
        let (mut app, mux) = duplex(1024);
        let (tx, mut rx) = unbounded_channel();

        let drainer = task::spawn(drain_lines(BufReader::new(mux), tx));
        app.write_all(b"ALPHA\nBET").await?;
        drop(app);

        drainer.await??;
        match rx.recv().await {
            Some(Message::Data(line)) => assert_eq!(line, b"ALPHA\n"),
            _ => panic!("no line drained"),
        }
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn drain_chunks_forwards_raw_bytes() -> Result<()> {
        let (mut app, mux) = duplex(1024);
        let (tx, mut rx) = unbounded_channel();

        let drainer = task::spawn(drain_chunks(mux, tx));
        app.write_all(b"\x1b[2Jhe").await?;
        drop(app);

        drainer.await??;
        match rx.recv().await {
            Some(Message::Data(chunk)) => assert_eq!(chunk, b"\x1b[2Jhe"),
            _ => panic!("no chunk drained"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn funnel_serializes_writers() -> Result<()> {
        let (mux, mut app) = duplex(1024);
        let tx = spawn_funnel(mux);

        tx.send(b"one\n".to_vec()).ok();
        tx.send(b"two\n".to_vec()).ok();

        let got = read_exact(&mut app, "one\ntwo\n".len()).await?;
        assert_eq!(got, b"one\ntwo\n");
        Ok(())
    }
}
