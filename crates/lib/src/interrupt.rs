//! Turning termination signals into an orderly teardown.
//!
//! The apply runs on a blocking thread; signals are received on the async
//! side and recorded here. The apply polls between steps, so a signal
//! during a step lets that step finish and then unwinds everything.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::error::ApplyError;

/// Shared record of the first termination signal received, if any.
#[derive(Debug, Clone, Default)]
pub(crate) struct Interrupt {
    first: Arc<OnceLock<&'static str>>,
    /// Interactive shells currently holding the terminal.
    shells: Arc<AtomicUsize>,
}

impl Interrupt {
    pub(crate) fn trigger(&self, signame: &'static str) {
        if signame == "SIGINT" && self.shells.load(Ordering::SeqCst) > 0 {
            tracing::debug!("SIGINT while a debug shell is running; leaving it to the shell");
            return;
        }
        if self.first.set(signame).is_ok() {
            tracing::warn!("Received {signame}; tearing down after the current step");
        }
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.first.get().is_some()
    }

    /// Fail with [`ApplyError::Interrupted`] if a signal has arrived.
    pub(crate) fn check(&self) -> Result<()> {
        match self.first.get() {
            Some(signame) => Err(ApplyError::Interrupted(signame).into()),
            None => Ok(()),
        }
    }

    /// Hand SIGINT to an interactive shell sharing our terminal until the
    /// guard is dropped. Other signals still interrupt.
    pub(crate) fn yield_sigint(&self) -> SigintYield<'_> {
        self.shells.fetch_add(1, Ordering::SeqCst);
        SigintYield(self)
    }
}

/// See [`Interrupt::yield_sigint`].
#[derive(Debug)]
pub(crate) struct SigintYield<'a>(&'a Interrupt);

impl Drop for SigintYield<'_> {
    fn drop(&mut self) {
        self.0.shells.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handlers for SIGINT, SIGTERM and SIGHUP. Once installed these signals
/// no longer terminate the process.
#[derive(Debug)]
pub(crate) struct SignalWatch {
    sigint: Signal,
    sigterm: Signal,
    sighup: Signal,
}

impl SignalWatch {
    /// Must be called from within the runtime.
    pub(crate) fn install() -> Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt()).context("Installing SIGINT handler")?,
            sigterm: signal(SignalKind::terminate()).context("Installing SIGTERM handler")?,
            sighup: signal(SignalKind::hangup()).context("Installing SIGHUP handler")?,
        })
    }

    /// The name of the next signal received.
    async fn next(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sighup.recv() => "SIGHUP",
        }
    }

    /// Record every signal into `interrupt` until cancelled.
    pub(crate) async fn forward(mut self, interrupt: Interrupt) {
        loop {
            let signame = self.next().await;
            interrupt.trigger(signame);
        }
    }
}
