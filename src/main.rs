use anyhow::{Context, Result};
use iottymux::Mux;
use std::process;

fn main() {
    if let Err(err) = run() {
        eprintln!("iottymux: runtime failure: {err:#}");
        process::exit(254);
    }
}

fn run() -> Result<()> {
    Mux::new().context("create mux")?.start().context("start mux")
}
