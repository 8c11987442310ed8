//! Modules shipped with the kernel.
//!
//! [`builtin_catalog`] exposes them to `module.register` by name.

pub mod ticker;

use std::rc::Rc;

use crate::bridge::ModuleCatalog;
use crate::kernel::loader::KernelModule;

pub use ticker::{ticker_manifest, TickerModule, TICKER_ID};

/// Catalog holding every built-in module.
pub fn builtin_catalog() -> ModuleCatalog {
    let catalog = ModuleCatalog::new();
    catalog.insert(TICKER_ID, || -> Rc<dyn KernelModule> { Rc::new(TickerModule::new()) });
    catalog
}
