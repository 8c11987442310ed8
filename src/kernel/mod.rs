//! Kernel core: the trusted component graph every module runs inside.
//!
//! [`Kernel`] wires the components in dependency order from a
//! [`KernelConfig`]:
//!
//! ```text
//! clock → scheduler → bus → permissions → schemas → loader
//!       → watchdog → cache → snapshotter → bridge → transport
//! ```
//!
//! All of it is single-threaded. Deferred work sits in the [`Scheduler`]
//! until the embedder calls [`Kernel::run_pending`] or awaits
//! [`Kernel::drive`].

pub mod cache;
pub mod clock;
pub mod context;
pub mod error;
pub mod event_bus;
pub mod loader;
pub mod manifest;
pub mod permission;
pub mod scheduler;
pub mod schema;
pub mod snapshot;
pub mod watchdog;

use std::future::Future;
use std::rc::Rc;
use std::sync::LazyLock;

use regex::Regex;
use tracing::info;

use crate::bridge::{HostRouting, KernelBridge, LocalTransport, ModuleCatalog, UnifiedTransport};
use crate::config::KernelConfig;
use crate::host::HostAdapter;

use self::cache::CacheStore;
use self::clock::{Clock, SystemClock};
use self::error::KernelError;
use self::event_bus::EventBus;
use self::loader::ModuleLoader;
use self::permission::PermissionSystem;
use self::scheduler::Scheduler;
use self::schema::SchemaRegistry;
use self::snapshot::KernelSnapshotter;
use self::watchdog::WatchdogCore;

/// Source id of the kernel itself. Always permitted, never contained.
pub const KERNEL_SOURCE: &str = "kernel";

static NAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_.:-]+$").ok());

/// Whether `name` is a legal event, module or schema name: non-empty,
/// lowercase ASCII letters, digits and `_ . : -`.
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name))
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and wires a [`Kernel`].
#[derive(Default)]
pub struct KernelBuilder {
    config: KernelConfig,
    clock: Option<Rc<dyn Clock>>,
    host: Option<HostAdapter>,
    catalog: Option<Rc<ModuleCatalog>>,
    host_transport: Option<Rc<dyn crate::bridge::KernelTransport>>,
}

impl KernelBuilder {
    /// Start from `config`.
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Use `clock` instead of wall time.
    #[must_use]
    pub fn clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Back the cache and module scans with `host`.
    #[must_use]
    pub fn host(mut self, host: HostAdapter) -> Self {
        self.host = Some(host);
        self
    }

    /// Modules `module.register` may instantiate by name.
    #[must_use]
    pub fn catalog(mut self, catalog: Rc<ModuleCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Forward `host.*` commands to `transport`.
    #[must_use]
    pub fn host_transport(mut self, transport: Rc<dyn crate::bridge::KernelTransport>) -> Self {
        self.host_transport = Some(transport);
        self
    }

    /// Wire every component and start the watchdog.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::EventContract`] if the watchdog cannot
    /// subscribe to the bus.
    pub fn build(self) -> Result<Kernel, KernelError> {
        let config = self.config;
        let clock: Rc<dyn Clock> = self.clock.unwrap_or_else(|| Rc::new(SystemClock));
        let scheduler = Rc::new(Scheduler::new(Rc::clone(&clock)));
        let bus = EventBus::new(config.bus.clone(), Rc::clone(&scheduler));
        let permissions = PermissionSystem::attach(&bus);
        let schemas = Rc::new(SchemaRegistry::new(Rc::clone(&bus), Rc::clone(&permissions)));
        let loader = Rc::new(ModuleLoader::new(
            Rc::clone(&bus),
            Rc::clone(&permissions),
            Rc::clone(&schemas),
            Rc::clone(&scheduler),
        ));
        let watchdog = WatchdogCore::new(Rc::clone(&bus), Rc::clone(&loader), config.watchdog.clone());
        watchdog.start()?;
        let cache = Rc::new(CacheStore::new(
            Rc::clone(&permissions),
            self.host.as_ref().map(|h| Rc::clone(&h.store)),
        ));
        let snapshotter = Rc::new(
            KernelSnapshotter::new(Rc::clone(&bus), Rc::clone(&loader), Rc::clone(&schemas))
                .with_watchdog(Rc::clone(&watchdog))
                .with_cache(Rc::clone(&cache)),
        );
        let catalog = self.catalog.unwrap_or_default();
        let bridge = Rc::new(KernelBridge::new(
            Rc::clone(&bus),
            Rc::clone(&loader),
            Rc::clone(&cache),
            Rc::clone(&schemas),
            Rc::clone(&snapshotter),
            Rc::clone(&catalog),
            self.host.clone(),
        ));
        let local: Rc<dyn crate::bridge::KernelTransport> =
            Rc::new(LocalTransport::new(Rc::clone(&bridge)));
        let mut transport = UnifiedTransport::new(local, HostRouting::Auto);
        if let Some(host_transport) = self.host_transport {
            transport = transport.with_host(host_transport);
        }

        info!(
            schema_validation = config.bus.enable_schema_validation,
            backpressure = config.bus.backpressure.enabled,
            default_policy = config.watchdog.default_policy.as_str(),
            "kernel wired"
        );

        Ok(Kernel {
            config,
            scheduler,
            bus,
            permissions,
            schemas,
            loader,
            watchdog,
            cache,
            snapshotter,
            catalog,
            bridge,
            transport: Rc::new(transport),
        })
    }
}

impl std::fmt::Debug for KernelBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelBuilder")
            .field("config", &self.config)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// A fully wired kernel instance.
pub struct Kernel {
    config: KernelConfig,
    scheduler: Rc<Scheduler>,
    bus: Rc<EventBus>,
    permissions: Rc<PermissionSystem>,
    schemas: Rc<SchemaRegistry>,
    loader: Rc<ModuleLoader>,
    watchdog: Rc<WatchdogCore>,
    cache: Rc<CacheStore>,
    snapshotter: Rc<KernelSnapshotter>,
    catalog: Rc<ModuleCatalog>,
    bridge: Rc<KernelBridge>,
    transport: Rc<UnifiedTransport>,
}

impl Kernel {
    /// Wire a kernel from `config` with wall time and no host.
    ///
    /// # Errors
    ///
    /// See [`KernelBuilder::build`].
    pub fn new(config: KernelConfig) -> Result<Self, KernelError> {
        KernelBuilder::new(config).build()
    }

    /// Start configuring a kernel.
    pub fn builder(config: KernelConfig) -> KernelBuilder {
        KernelBuilder::new(config)
    }

    /// Configuration the kernel was built from.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Deferred-work queue.
    pub fn scheduler(&self) -> &Rc<Scheduler> {
        &self.scheduler
    }

    /// Event bus.
    pub fn bus(&self) -> &Rc<EventBus> {
        &self.bus
    }

    /// Permission system.
    pub fn permissions(&self) -> &Rc<PermissionSystem> {
        &self.permissions
    }

    /// Schema registry.
    pub fn schemas(&self) -> &Rc<SchemaRegistry> {
        &self.schemas
    }

    /// Module loader.
    pub fn loader(&self) -> &Rc<ModuleLoader> {
        &self.loader
    }

    /// Watchdog.
    pub fn watchdog(&self) -> &Rc<WatchdogCore> {
        &self.watchdog
    }

    /// Cache.
    pub fn cache(&self) -> &Rc<CacheStore> {
        &self.cache
    }

    /// Snapshotter.
    pub fn snapshotter(&self) -> &Rc<KernelSnapshotter> {
        &self.snapshotter
    }

    /// Module catalog used by `module.register`.
    pub fn catalog(&self) -> &Rc<ModuleCatalog> {
        &self.catalog
    }

    /// Command bridge.
    pub fn bridge(&self) -> &Rc<KernelBridge> {
        &self.bridge
    }

    /// Prefix-routing transport in front of the bridge.
    pub fn transport(&self) -> &Rc<UnifiedTransport> {
        &self.transport
    }

    /// Run every scheduled task that is due now, including tasks those
    /// tasks schedule with zero delay. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        self.scheduler.run_due()
    }

    /// Let tracked module tasks make progress, then run due tasks.
    pub async fn drive(&self) -> usize {
        self.scheduler
            .run_until(async {
                tokio::task::yield_now().await;
                let ran = self.run_pending();
                tokio::task::yield_now().await;
                ran
            })
            .await
    }

    /// Await `future` while tracked module tasks run alongside it.
    pub async fn run_until<F: Future>(&self, future: F) -> F::Output {
        self.scheduler.run_until(future).await
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("modules", &self.loader.module_ids())
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
