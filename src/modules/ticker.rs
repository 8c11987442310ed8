//! Ticker: the smallest useful module. It observes `kernel.tick`, counts the
//! ticks it saw, and announces its own start and stop.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::Context;
use serde_json::json;
use tracing::info;

use crate::kernel::context::ModuleContext;
use crate::kernel::event_bus::Subscription;
use crate::kernel::loader::KernelModule;
use crate::kernel::manifest::ModuleManifest;

/// Module id.
pub const TICKER_ID: &str = "ticker";

/// Event the ticker observes.
pub const TICK_EVENT: &str = "kernel.tick";

/// Manifest for [`TickerModule`]. It needs no permissions.
pub fn ticker_manifest() -> ModuleManifest {
    let mut manifest = ModuleManifest::new(TICKER_ID, env!("CARGO_PKG_VERSION"));
    manifest.display_name = Some("Ticker".to_owned());
    manifest.description = Some("Counts kernel.tick events".to_owned());
    manifest
}

/// Counts `kernel.tick` events while running.
#[derive(Debug, Default)]
pub struct TickerModule {
    ticks: Rc<Cell<u64>>,
    subscription: RefCell<Option<Subscription>>,
}

impl TickerModule {
    /// Fresh ticker with a zero count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticks observed since construction.
    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }
}

impl KernelModule for TickerModule {
    fn name(&self) -> &str {
        TICKER_ID
    }

    fn start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        info!(module = ctx.module_id(), "ticker starting");
        let ticks = Rc::clone(&self.ticks);
        let module_id = ctx.module_id().to_owned();
        let subscription = ctx.listen(TICK_EVENT, move |payload| {
            ticks.set(ticks.get().saturating_add(1));
            info!(module = %module_id, %payload, "tick observed");
            Ok(())
        })?;
        *self.subscription.borrow_mut() = Some(subscription);
        ctx.emit("ticker.started", json!({ "ok": true }))?;
        Ok(())
    }

    fn stop(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        info!(module = ctx.module_id(), "ticker stopping");
        let subscription = self
            .subscription
            .borrow_mut()
            .take()
            .context("ticker stopped without an active subscription")?;
        subscription.unsubscribe();
        ctx.emit("ticker.stopped", json!({ "ok": true, "ticks": self.ticks.get() }))?;
        Ok(())
    }
}
