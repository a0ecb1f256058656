/* Engine: the process-wide handle that ties the driver registry (component C) to the I/O loop
 * (component D) and exposes the top-level operations from hound.h (hound_init_driver,
 * hound_destroy_driver, hound_get_datadesc, hound_get_dev_name, hound_alloc_ctx) as methods on
 * an explicit handle rather than hidden global state. `Context` (component E) borrows this
 * handle to reach the registry and I/O loop it doesn't own directly. */
use std::path::Path;
use std::sync::Arc;

use crate::context::{Context, ContextRequest};
use crate::driver::registry::{DriverFactory, DriverRegistry, RefTransition, UnrefTransition};
use crate::driver::InitArg;
use crate::error::{HoundError, Result};
use crate::io::IoLoop;
use crate::queue::Queue;
use crate::record::{DataFmt, DataId, DevId, Period};
use crate::schema;

/// One entry of the descriptor resolver's public enumeration (component F):
/// the cross product of (driver instance, enabled schema entry).
#[derive(Debug, Clone)]
pub struct DataDesc {
    pub data_id: DataId,
    pub dev_id: DevId,
    pub name: String,
    pub avail_periods: Vec<Period>,
    pub fmts: Vec<DataFmt>,
}

pub(crate) struct EngineInner {
    registry: DriverRegistry,
    io_loop: IoLoop,
}

impl EngineInner {
    /// Register one subscriber for `(data_id, period_ns)` and, if this is
    /// the driver's first subscriber, add its fd to the I/O loop. Bridges
    /// the registry's "this driver needs starting" signal and the loop's fd
    /// table, since the registry has no knowledge of the loop.
    fn ref_data(&self, path: &str, data_id: DataId, period_ns: Period) -> Result<()> {
        match self.registry.driver_ref(path, data_id, period_ns)? {
            RefTransition::Started { fd, kind } => {
                let dev_id = self
                    .registry
                    .dev_id_of(path)
                    .ok_or_else(|| HoundError::DriverNotRegistered(path.to_string()))?;
                let handle = self
                    .registry
                    .driver_handle(path)
                    .ok_or_else(|| HoundError::DriverNotRegistered(path.to_string()))?;
                self.io_loop.add_fd(path, fd, dev_id, kind, handle)?;
            }
            RefTransition::AlreadyRunning => {}
        }
        Ok(())
    }

    /// Release one subscriber; remove the driver's fd from the loop if this
    /// was the last one.
    fn unref_data(&self, path: &str, data_id: DataId, period_ns: Period) -> Result<()> {
        match self.registry.driver_unref(path, data_id, period_ns)? {
            UnrefTransition::Stopped => self.io_loop.remove_fd(path),
            UnrefTransition::StillRunning => {}
        }
        Ok(())
    }

    pub(crate) fn resolve(&self, data_id: DataId) -> Result<String> {
        self.registry.driver_get(data_id)
    }

    pub(crate) fn ref_entry(&self, path: &str, data_id: DataId, period_ns: Period) -> Result<()> {
        self.ref_data(path, data_id, period_ns)
    }

    pub(crate) fn unref_entry(&self, path: &str, data_id: DataId, period_ns: Period) {
        if let Err(err) = self.unref_data(path, data_id, period_ns) {
            tracing::warn!(path, data_id, period_ns, "failed to unref on context teardown: {}", err);
        }
    }

    pub(crate) fn subscribe_queue(&self, data_id: DataId, queue: &Arc<Queue>) {
        self.io_loop.add_queue(data_id, Arc::clone(queue));
    }

    pub(crate) fn unsubscribe_queue(&self, data_id: DataId, queue: &Arc<Queue>) {
        self.io_loop.remove_queue(data_id, queue);
    }

    pub(crate) fn next(&self, path: &str, data_id: DataId, n: usize) -> Result<()> {
        self.registry.driver_next(path, data_id, n)
    }
}

/// The top-level handle for a running Hound instance: one driver registry
/// and one background I/O loop. Cloning an `Engine` clones a cheap `Arc`
/// handle to the same underlying state: a process-wide registry and loop
/// singleton modeled as an explicit value instead of hidden globals.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Build a fresh engine and start its background I/O thread.
    pub fn new() -> Self {
        let io_loop = IoLoop::new().expect("failed to create I/O loop self-pipe");
        io_loop.start();
        Self {
            inner: Arc::new(EngineInner {
                registry: DriverRegistry::new(),
                io_loop,
            }),
        }
    }

    /// Register a driver type under `name` so it can later be instantiated
    /// by [`Engine::init_driver`]. Mirrors `hound_register_driver`, but as
    /// an explicit call here instead of the legacy C library's
    /// constructor-attribute self-registration.
    pub fn register(&self, name: impl Into<String>, factory: DriverFactory) -> Result<()> {
        self.inner.registry.register(name, factory)
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        self.inner.registry.unregister(name)
    }

    /// `hound_init_driver`: parse the schema, then initialize a driver
    /// instance of type `name` at `path` against it.
    pub fn init_driver(
        &self,
        name: &str,
        path: &str,
        schema_base: &Path,
        schema_file: &str,
        args: &[InitArg],
    ) -> Result<DevId> {
        let schema = schema::load(schema_base, schema_file)?;
        self.inner.registry.driver_init(name, path, args, schema)
    }

    /// Initialize a driver instance from an already-parsed schema, for
    /// callers (and tests) that build descriptors in memory rather than
    /// from a YAML file on disk.
    pub fn init_driver_with_schema(
        &self,
        name: &str,
        path: &str,
        args: &[InitArg],
        schema: Vec<schema::SchemaDesc>,
    ) -> Result<DevId> {
        self.inner.registry.driver_init(name, path, args, schema)
    }

    /// `hound_destroy_driver`.
    pub fn destroy_driver(&self, path: &str) -> Result<()> {
        self.inner.registry.driver_destroy(path)
    }

    /// `hound_get_datadesc`: the cross product of (live driver instance,
    /// enabled schema entry).
    pub fn get_datadesc(&self) -> Vec<DataDesc> {
        let mut out = Vec::new();
        for path in self.inner.registry.paths() {
            let Some(dev_id) = self.inner.registry.dev_id_of(&path) else {
                continue;
            };
            let Ok(descs) = self.inner.registry.datadesc_of(&path) else {
                continue;
            };
            for desc in descs {
                if !desc.enabled {
                    continue;
                }
                let schema = self.inner.registry.schema_for(&path, desc.data_id);
                let name = schema.as_ref().map(|s| s.name.clone()).unwrap_or_default();
                let fmts = schema.map(|s| s.fmts).unwrap_or_default();
                out.push(DataDesc {
                    data_id: desc.data_id,
                    dev_id,
                    name,
                    avail_periods: desc.avail_periods,
                    fmts,
                });
            }
        }
        out
    }

    /// `hound_get_dev_name`.
    pub fn get_dev_name(&self, dev_id: DevId) -> Result<Option<String>> {
        self.inner
            .registry
            .device_name_by_dev_id(dev_id)
            .ok_or(HoundError::DeviceDoesNotExist(dev_id.to_string()))
    }

    /// `hound_alloc_ctx`: validate the request and ref every requested
    /// `(data_id, period)`, starting each driver's fd with the I/O loop as
    /// needed. The returned context is inactive; call `start` on it to
    /// begin receiving records.
    pub fn context_alloc(&self, request: ContextRequest) -> Result<Context> {
        Context::alloc(self.inner.clone(), request)
    }
}
