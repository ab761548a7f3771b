//! Readiness notification toward the pod init.
//!
//! The endpoint registry must be committed before readiness is signalled,
//! and the application unit must not start before the signal arrives.

use anyhow::{Context, Result, bail};
use libsystemd::daemon::{self, NotifyState};
use std::env;

/// Signal `READY=1`; an absent notification socket is an error.
pub fn ready() -> Result<()> {
    if !daemon::notify(false, &[NotifyState::Ready]).context("send readiness notification")? {
        bail!("readiness notification not delivered, notification socket unset");
    }
    Ok(())
}

/// Signal `READY=1` when running as a notify-type service, no-op otherwise.
pub fn ready_if_configured() -> Result<()> {
    if env::var_os("NOTIFY_SOCKET").is_none() {
        return Ok(());
    }
    ready()
}
