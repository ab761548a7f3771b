//! Endpoint registry: advertise and discover the interactive channels of one app.

use anyhow::{Context, Result, bail};
use getset::CopyGetters;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    net::Ipv4Addr,
    path::Path,
};
use strum::{Display, EnumString};
use tracing::debug;

/// File name of the per-app registry below the app directory.
pub const REGISTRY_FILE: &str = "endpoints";

/// Channel names an endpoint can be advertised under.
///
/// The TTY names and the stream names are mutually exclusive within one
/// app's registry.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum StreamName {
    /// Application standard input, written by attach clients.
    Stdin,
    /// Application standard output.
    Stdout,
    /// Application standard error.
    Stderr,
    /// Bidirectional terminal channel.
    Tty,
    /// Input-only terminal channel.
    TtyIn,
    /// Output-only terminal channel.
    TtyOut,
}

impl StreamName {
    /// Whether this name belongs to the TTY flavor.
    pub fn is_tty(self) -> bool {
        matches!(self, Self::Tty | Self::TtyIn | Self::TtyOut)
    }
}

/// Address families an endpoint can advertise.
#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize)]
pub enum Family {
    /// IPv4, the only family currently emitted.
    #[strum(serialize = "AF_INET4")]
    #[serde(rename = "AF_INET4")]
    Inet4,
}

/// One advertised interactive channel.
#[derive(Clone, Copy, CopyGetters, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[getset(get_copy = "pub")]
pub struct Endpoint {
    /// Channel name, unique within one app's registry.
    name: StreamName,
    /// Address family of the listener.
    family: Family,
    /// Listener address, always a loopback literal.
    address: Ipv4Addr,
    /// Kernel-assigned ephemeral port.
    port: u16,
}

impl Endpoint {
    /// Record for a freshly bound loopback listener.
    pub fn loopback(name: StreamName, port: u16) -> Self {
        Self {
            name,
            family: Family::Inet4,
            address: Ipv4Addr::LOCALHOST,
            port,
        }
    }
}

/// Encoding of a single registry record, one record per line.
///
/// Kept behind a trait so the line format can be swapped without touching
/// the registry callers.
pub trait EndpointCodec: Send + Sync {
    /// Encode one record including its line terminator.
    fn encode(&self, endpoint: &Endpoint) -> Result<String>;

    /// Decode one line, `None` for malformed records (readers ignore them).
    fn decode(&self, line: &str) -> Option<Endpoint>;
}

/// Shipped format: `<name>,<family>,<address>,<port>`.
#[derive(Debug, Default)]
pub struct CsvCodec;

impl EndpointCodec for CsvCodec {
    fn encode(&self, endpoint: &Endpoint) -> Result<String> {
        Ok(format!(
            "{},{},{},{}\n",
            endpoint.name(),
            endpoint.family(),
            endpoint.address(),
            endpoint.port()
        ))
    }

    fn decode(&self, line: &str) -> Option<Endpoint> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 4 {
            return None;
        }
        let name = fields[0].parse().ok()?;
        let family = fields[1].parse().ok()?;
        let address = fields[2].parse().ok()?;
        let port: u16 = fields[3].trim_end_matches('\n').parse().ok()?;
        if port == 0 {
            return None;
        }
        Some(Endpoint {
            name,
            family,
            address,
            port,
        })
    }
}

/// Reserved alternate format: one JSON object per line.
#[derive(Debug, Default)]
pub struct JsonCodec;

impl EndpointCodec for JsonCodec {
    fn encode(&self, endpoint: &Endpoint) -> Result<String> {
        let mut line = serde_json::to_string(endpoint).context("encode endpoint record")?;
        line.push('\n');
        Ok(line)
    }

    fn decode(&self, line: &str) -> Option<Endpoint> {
        serde_json::from_str(line).ok()
    }
}

/// Write-once registry for one app activation.
///
/// The writer truncates any predecessor, appends records as listeners are
/// bound, and must be committed before readiness is signalled.
pub struct Registry {
    file: File,
    codec: Box<dyn EndpointCodec>,
}

impl Registry {
    /// Open (and truncate) the registry at `path` for writing.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .context(format!(
                "create endpoint registry '{}'",
                path.as_ref().display()
            ))?;
        Ok(Self {
            file,
            codec: Box::new(CsvCodec),
        })
    }

    /// Append one freshly bound endpoint record.
    pub fn append(&mut self, endpoint: &Endpoint) -> Result<()> {
        debug!("Advertising {} endpoint on port {}", endpoint.name(), endpoint.port());
        self.file
            .write_all(self.codec.encode(endpoint)?.as_bytes())
            .context("append endpoint record")
    }

    /// Sync and close the registry.
    ///
    /// The registry must be committed strictly before readiness is signalled
    /// to the pod init.
    pub fn commit(self) -> Result<()> {
        self.file.sync_all().context("sync endpoint registry")
    }

    /// Read all records from `path` in insertion order.
    ///
    /// Malformed records and a partial last line are ignored. A missing or
    /// empty registry is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<Endpoint>> {
        Self::load_with(path, &CsvCodec)
    }

    /// Like [`Self::load`] with an explicit codec.
    pub fn load_with<P: AsRef<Path>>(path: P, codec: &dyn EndpointCodec) -> Result<Vec<Endpoint>> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .context(format!("open endpoint registry '{}'", path.display()))?;
        if contents.is_empty() {
            bail!("endpoint registry '{}' is empty", path.display());
        }

        // Everything after the final newline is either empty or an
        // unterminated partial record, never a valid one.
        let mut lines: Vec<&str> = contents.split('\n').collect();
        lines.pop();

        Ok(lines.iter().filter_map(|line| codec.decode(line)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    fn sample() -> Vec<Endpoint> {
        vec![
            Endpoint::loopback(StreamName::Stdin, 41000),
            Endpoint::loopback(StreamName::Stdout, 41001),
            Endpoint::loopback(StreamName::Stderr, 41002),
        ]
    }

    #[test]
    fn round_trip_csv() -> Result<()> {
        let file = NamedTempFile::new()?;
        let mut sut = Registry::create(file.path())?;
        for endpoint in sample() {
            sut.append(&endpoint)?;
        }
        sut.commit()?;

        let loaded = Registry::load(file.path())?;
        assert_eq!(loaded, sample());

        let ports: HashMap<_, _> = loaded.iter().map(|e| (e.name(), e.port())).collect();
        assert_eq!(ports[&StreamName::Stdin], 41000);
        assert_eq!(ports[&StreamName::Stdout], 41001);
        assert_eq!(ports[&StreamName::Stderr], 41002);
        Ok(())
    }

    #[test]
    fn round_trip_json() -> Result<()> {
        let file = NamedTempFile::new()?;
        let codec = JsonCodec;
        let mut contents = String::new();
        for endpoint in sample() {
            contents.push_str(&codec.encode(&endpoint)?);
        }
        fs::write(file.path(), contents)?;

        let loaded = Registry::load_with(file.path(), &codec)?;
        assert_eq!(loaded, sample());
        Ok(())
    }

    #[test]
    fn load_ignores_malformed_records() -> Result<()> {
        let file = NamedTempFile::new()?;
        fs::write(
            file.path(),
            "stdout,AF_INET4,127.0.0.1,41001\n\
             short,line\n\
             bogus,AF_INET4,127.0.0.1,41002\n\
             stderr,AF_INET4,127.0.0.1,nope\n\
             stdin,AF_INET4,127.0.0.1,0\n",
        )?;

        let loaded = Registry::load(file.path())?;
        assert_eq!(loaded, vec![Endpoint::loopback(StreamName::Stdout, 41001)]);
        Ok(())
    }

    #[test]
    fn load_ignores_partial_last_line() -> Result<()> {
        let file = NamedTempFile::new()?;
        fs::write(
            file.path(),
            "stdout,AF_INET4,127.0.0.1,41001\nstderr,AF_INET4,127.0.0.1,4100",
        )?;

        let loaded = Registry::load(file.path())?;
        assert_eq!(loaded, vec![Endpoint::loopback(StreamName::Stdout, 41001)]);
        Ok(())
    }

    #[test]
    fn load_missing_registry_fails() {
        assert!(Registry::load("/does/not/exist/endpoints").is_err());
    }

    #[test]
    fn load_empty_registry_fails() -> Result<()> {
        let file = NamedTempFile::new()?;
        assert!(Registry::load(file.path()).is_err());
        Ok(())
    }

    #[test]
    fn stream_name_forms() {
        assert_eq!(StreamName::TtyIn.to_string(), "tty-in");
        assert_eq!("tty-out".parse::<StreamName>().unwrap(), StreamName::TtyOut);
        assert!(StreamName::Tty.is_tty());
        assert!(!StreamName::Stdout.is_tty());
        assert_eq!(Family::Inet4.to_string(), "AF_INET4");
    }

    #[test]
    fn create_truncates_predecessor() -> Result<()> {
        let file = NamedTempFile::new()?;
        fs::write(file.path(), "stdout,AF_INET4,127.0.0.1,41001\n")?;

        let mut sut = Registry::create(file.path())?;
        sut.append(&Endpoint::loopback(StreamName::Tty, 41500))?;
        sut.commit()?;

        let loaded = Registry::load(file.path())?;
        assert_eq!(loaded, vec![Endpoint::loopback(StreamName::Tty, 41500)]);
        Ok(())
    }
}
