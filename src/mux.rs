//! In-pod helper entrypoint: dispatches the requested sub-action.

use crate::{
    attach::{self, Caller},
    config::{Action, Config},
    iomux, ttymux,
};
use anyhow::{Context, Result};
use getset::Getters;
use std::io;
use tokio::{
    runtime::Builder,
    signal::unix::{SignalKind, signal},
    task,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span};

#[derive(Debug, Getters)]
/// The in-pod multiplexer and attach helper.
pub struct Mux {
    /// Helper configuration.
    #[get = "pub"]
    config: Config,
}

impl Mux {
    /// Create a new `Mux` instance from the CLI and environment.
    pub fn new() -> Result<Self> {
        let mux = Self {
            config: Default::default(),
        };
        crate::init_logging(mux.config().debug()).context("init logging")?;
        mux.config().validate().context("validate config")?;
        Ok(mux)
    }

    /// Run the requested action to completion and consume the instance.
    pub fn start(self) -> Result<()> {
        let rt = Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("build runtime")?;
        let result = rt.block_on(self.dispatch());
        // A FIFO open abandoned by a shutdown during startup may still block
        // a pool thread; never wait for it on exit.
        rt.shutdown_background();
        result
    }

    async fn dispatch(self) -> Result<()> {
        debug!("Dispatching action {}", self.config.action());
        match self.config.action() {
            Action::List => attach::list(&self.config, &mut io::stdout()),
            Action::AutoAttach => attach::auto(&self.config, Caller::stdio()).await,
            Action::CustomAttach => attach::custom(&self.config, Caller::stdio()).await,
            Action::Iomux => iomux::serve(&self.config, Self::shutdown_token()?).await,
            Action::Ttymux => ttymux::serve(&self.config, Self::shutdown_token()?).await,
        }
    }

    /// Token tripped by SIGTERM or SIGINT; the muxes serve until it fires.
    fn shutdown_token() -> Result<CancellationToken> {
        let token = CancellationToken::new();
        let trip = token.clone();
        let mut term = signal(SignalKind::terminate()).context("register SIGTERM handler")?;
        let mut int = signal(SignalKind::interrupt()).context("register SIGINT handler")?;
        task::spawn(
            async move {
                tokio::select! {
                    _ = term.recv() => debug!("Received SIGTERM"),
                    _ = int.recv() => debug!("Received SIGINT"),
                }
                trip.cancel();
            }
            .instrument(debug_span!("signals")),
        );
        Ok(token)
    }
}
