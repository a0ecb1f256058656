/* Driver registry (component C): name -> factory map and path -> live-instance map, both behind
 * their own mutex. Owns the rollback-on-failure init sequence and the per-(data_id, period)
 * subscription bookkeeping that decides when a driver's underlying fd is opened/closed. Grounded
 * on driver_init/driver_destroy/driver_ref/driver_unref in original_source/include/hound-private/
 * driver.h and the allocate-then-validate-then-commit shape of `DeviceDriver`/`create_driver` in
 * ratbagd-rs's src/driver/mod.rs. */
use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::{DataRq, DriverKind, DriverOps, DrvDatadesc, InitArg, DEVICE_NAME_MAX};
use crate::error::{HoundError, Result};
use crate::record::{DataId, DevId, Period};
use crate::schema::SchemaDesc;

/// A no-argument constructor for one concrete driver type, registered once
/// under the protocol name a YAML schema or caller refers to it by.
pub type DriverFactory = Box<dyn Fn() -> Box<dyn DriverOps> + Send + Sync>;

/// Shared ownership of one driver instance: the registry calls `init`/
/// `datadesc`/`setdata`/`next`/`destroy` on it, and (once started) the I/O
/// loop calls `parse`/`poll` on the same instance through a clone of this
/// handle. Grounded on how `io.c`'s `s_ios` and the registry's `drv_ctx`
/// both reach into the same allocated driver object in the original.
pub type DriverHandle = Arc<Mutex<Box<dyn DriverOps>>>;

/// What a subscription-count transition requires the caller (the context /
/// engine layer, which owns the I/O loop) to do next.
#[derive(Debug)]
pub enum RefTransition {
    /// This was the driver's first subscriber: its fd must be added to the
    /// I/O loop.
    Started { fd: RawFd, kind: DriverKind },
    /// The driver was already running; nothing fd-related changes.
    AlreadyRunning,
}

#[derive(Debug)]
pub enum UnrefTransition {
    /// This was the last subscriber: the driver's fd must be removed from
    /// the I/O loop.
    Stopped,
    StillRunning,
}

struct Instance {
    dev_id: DevId,
    name: String,
    ops: DriverHandle,
    kind: DriverKind,
    descs: Vec<DrvDatadesc>,
    schema: Vec<SchemaDesc>,
    device_name: Option<String>,
    fd: Option<RawFd>,
    /// `(data_id, period_ns) -> subscriber count` across every context
    /// currently referencing this driver.
    refcounts: HashMap<(DataId, Period), usize>,
}

impl Instance {
    fn desc_for(&self, data_id: DataId) -> Option<&DrvDatadesc> {
        self.descs.iter().find(|d| d.data_id == data_id)
    }

    fn schema_for(&self, data_id: DataId) -> Option<&SchemaDesc> {
        self.schema.iter().find(|s| s.data_id == data_id)
    }

    /// The subscription union to hand the driver via `setdata`: one `DataRq`
    /// per distinct `(data_id, period)` pair with at least one subscriber.
    fn subscription_union(&self) -> Vec<DataRq> {
        self.refcounts
            .keys()
            .map(|&(id, period_ns)| DataRq { id, period_ns })
            .collect()
    }
}

/// Owns every registered driver factory and every live driver instance.
pub struct DriverRegistry {
    factories: Mutex<HashMap<String, DriverFactory>>,
    instances: Mutex<HashMap<String, Instance>>,
    next_dev_id: Mutex<u32>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            factories: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            next_dev_id: Mutex::new(0),
        }
    }

    /// Register a driver type under `name`. Fails if that name is already
    /// taken.
    pub fn register(&self, name: impl Into<String>, factory: DriverFactory) -> Result<()> {
        let name = name.into();
        let mut factories = self.factories.lock().unwrap();
        if factories.contains_key(&name) {
            return Err(HoundError::DriverAlreadyRegistered(name));
        }
        factories.insert(name, factory);
        Ok(())
    }

    /// Unregister a driver type. Callers must destroy every live instance of
    /// it first (there is no cascading teardown).
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut factories = self.factories.lock().unwrap();
        if factories.remove(name).is_none() {
            return Err(HoundError::DriverNotRegistered(name.to_string()));
        }
        Ok(())
    }

    fn alloc_dev_id(&self) -> Result<DevId> {
        let mut next = self.next_dev_id.lock().unwrap();
        let id = u8::try_from(*next).map_err(|_| HoundError::OutOfMemory)?;
        *next += 1;
        Ok(id)
    }

    /// Instantiate a driver of type `name` at `path`, against an
    /// already-parsed schema. Follows the rollback ordering from
    /// `driver.h`: resolve factory -> check path free -> validate schema has
    /// no duplicate ids -> `ops.init` -> `ops.device_name` -> `ops.datadesc`
    /// -> validate each enabled entry's invariant -> assign dev_id -> commit.
    /// Any failure after `ops.init` undoes it via `ops.destroy` before
    /// returning.
    pub fn driver_init(
        &self,
        name: &str,
        path: &str,
        args: &[InitArg],
        schema: Vec<SchemaDesc>,
    ) -> Result<DevId> {
        {
            let instances = self.instances.lock().unwrap();
            if instances.contains_key(path) {
                return Err(HoundError::DriverAlreadyPresent(path.to_string()));
            }
        }

        let mut seen = HashSet::new();
        for desc in &schema {
            if !seen.insert(desc.data_id) {
                return Err(HoundError::DescriptorDuplicate(desc.data_id));
            }
        }

        let mut ops: Box<dyn DriverOps> = {
            let factories = self.factories.lock().unwrap();
            let factory = factories
                .get(name)
                .ok_or_else(|| HoundError::DriverNotRegistered(name.to_string()))?;
            factory()
        };

        ops.init(path, args)?;

        let device_name = ops.device_name().map(|mut n| {
            if n.len() >= DEVICE_NAME_MAX {
                let cut = n
                    .char_indices()
                    .map(|(i, c)| i + c.len_utf8())
                    .take_while(|&end| end <= DEVICE_NAME_MAX - 1)
                    .last()
                    .unwrap_or(0);
                warn!(path, "device name truncated to {} bytes", cut);
                n.truncate(cut);
            }
            n
        });

        let mut descs: Vec<DrvDatadesc> = schema.iter().map(|s| DrvDatadesc::disabled(s.data_id)).collect();
        if let Err(err) = ops.datadesc(&mut descs) {
            let _ = ops.destroy();
            return Err(err);
        }

        for desc in &descs {
            if !desc.check_invariant() {
                let _ = ops.destroy();
                return Err(HoundError::DriverFail(format!(
                    "driver {name} declared data id {:#x} enabled with no available periods",
                    desc.data_id
                )));
            }
        }

        let dev_id = match self.alloc_dev_id() {
            Ok(id) => id,
            Err(err) => {
                let _ = ops.destroy();
                return Err(err);
            }
        };

        let kind = ops.kind();
        let instance = Instance {
            dev_id,
            name: name.to_string(),
            ops: Arc::new(Mutex::new(ops)),
            kind,
            descs,
            schema,
            device_name,
            fd: None,
            refcounts: HashMap::new(),
        };

        info!(path, dev_id, driver = name, "driver instance initialized");
        self.instances.lock().unwrap().insert(path.to_string(), instance);
        Ok(dev_id)
    }

    /// Tear down a driver instance. Refuses if any subscription is still
    /// live.
    pub fn driver_destroy(&self, path: &str) -> Result<()> {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .get(path)
            .ok_or_else(|| HoundError::DriverNotRegistered(path.to_string()))?;
        if !instance.refcounts.is_empty() {
            return Err(HoundError::DriverInUse(path.to_string()));
        }
        let instance = instances.remove(path).unwrap();
        instance.ops.lock().unwrap().destroy()?;
        debug!(path, "driver instance destroyed");
        Ok(())
    }

    /// Resolve which driver instance (by path) serves `data_id`. Errors if
    /// no instance serves it, or if more than one does (`ConflictingDrivers`,
    /// which the schema-duplicate check in `driver_init` prevents within one
    /// instance but not across distinct instances registered against
    /// overlapping schemas).
    pub fn driver_get(&self, data_id: DataId) -> Result<String> {
        let instances = self.instances.lock().unwrap();
        let mut found: Option<&String> = None;
        for (path, instance) in instances.iter() {
            if instance.desc_for(data_id).map(|d| d.enabled).unwrap_or(false) {
                if found.is_some() {
                    return Err(HoundError::ConflictingDrivers(data_id));
                }
                found = Some(path);
            }
        }
        found
            .cloned()
            .ok_or(HoundError::DataIdDoesNotExist(data_id))
    }

    pub fn dev_id_of(&self, path: &str) -> Option<DevId> {
        self.instances.lock().unwrap().get(path).map(|i| i.dev_id)
    }

    pub fn device_name_of(&self, path: &str) -> Option<Option<String>> {
        self.instances
            .lock()
            .unwrap()
            .get(path)
            .map(|i| i.device_name.clone())
    }

    /// Enumerate the enabled data descriptors for `path` (component F's
    /// `get_datadesc`).
    pub fn datadesc_of(&self, path: &str) -> Result<Vec<DrvDatadesc>> {
        let instances = self.instances.lock().unwrap();
        let instance = instances
            .get(path)
            .ok_or_else(|| HoundError::DriverNotRegistered(path.to_string()))?;
        Ok(instance.descs.clone())
    }

    /// Register one subscriber for `(data_id, period_ns)` on the driver
    /// serving `data_id`. On the zero-to-one transition for this driver
    /// instance as a whole, opens it (`ops.start`) and returns the fd to add
    /// to the I/O loop.
    ///
    /// Atomic: the refcount entry is only committed once `setdata` (and, on
    /// the idle-to-running transition, `start`) have both succeeded. A
    /// failure on either leaves `refcounts` exactly as it was on entry, so
    /// there's no phantom subscription blocking a later `driver_destroy`.
    pub fn driver_ref(&self, path: &str, data_id: DataId, period_ns: Period) -> Result<RefTransition> {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .get_mut(path)
            .ok_or_else(|| HoundError::DriverNotRegistered(path.to_string()))?;

        let desc = instance
            .desc_for(data_id)
            .ok_or(HoundError::DataIdDoesNotExist(data_id))?;
        if !desc.enabled {
            return Err(HoundError::DataIdDoesNotExist(data_id));
        }
        if !desc.avail_periods.contains(&period_ns) {
            return Err(HoundError::PeriodUnsupported { data_id, period_ns });
        }

        let was_idle = instance.refcounts.is_empty();
        let already_counted = instance.refcounts.contains_key(&(data_id, period_ns));
        let mut prospective = instance.subscription_union();
        if !already_counted {
            prospective.push(DataRq { id: data_id, period_ns });
        }

        let mut ops = instance.ops.lock().unwrap();
        ops.setdata(&prospective)?;

        let started_fd = if was_idle {
            match ops.start() {
                Ok(fd) => Some(fd),
                Err(err) => {
                    // Roll setdata back to the pre-call union; the refcount
                    // entry below is never reached so no subscriber is
                    // counted for a driver that never started.
                    let _ = ops.setdata(&instance.subscription_union());
                    return Err(err);
                }
            }
        } else {
            None
        };
        drop(ops);

        *instance.refcounts.entry((data_id, period_ns)).or_insert(0) += 1;

        if let Some(fd) = started_fd {
            instance.fd = Some(fd);
            debug!(path, data_id, period_ns, "driver started");
            Ok(RefTransition::Started { fd, kind: instance.kind })
        } else {
            Ok(RefTransition::AlreadyRunning)
        }
    }

    /// Release one subscriber for `(data_id, period_ns)`. On the
    /// last-to-zero transition, stops the driver (`ops.stop`) and signals
    /// that its fd must be removed from the I/O loop.
    pub fn driver_unref(&self, path: &str, data_id: DataId, period_ns: Period) -> Result<UnrefTransition> {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .get_mut(path)
            .ok_or_else(|| HoundError::DriverNotRegistered(path.to_string()))?;

        if let Some(count) = instance.refcounts.get_mut(&(data_id, period_ns)) {
            *count -= 1;
            if *count == 0 {
                instance.refcounts.remove(&(data_id, period_ns));
            }
        }

        let rqs = instance.subscription_union();
        let mut ops = instance.ops.lock().unwrap();
        if !rqs.is_empty() {
            ops.setdata(&rqs)?;
        }

        if instance.refcounts.is_empty() {
            ops.stop()?;
            drop(ops);
            instance.fd = None;
            debug!(path, data_id, period_ns, "driver stopped");
            Ok(UnrefTransition::Stopped)
        } else {
            Ok(UnrefTransition::StillRunning)
        }
    }

    /// Ask a driver to produce one on-demand sample. Meaningless (and
    /// accepted as a no-op by `DriverOps::next`'s default) for periodic
    /// data.
    pub fn driver_next(&self, path: &str, data_id: DataId, n: usize) -> Result<()> {
        let instances = self.instances.lock().unwrap();
        let instance = instances
            .get(path)
            .ok_or_else(|| HoundError::DriverNotRegistered(path.to_string()))?;
        instance.ops.lock().unwrap().next(data_id, n)
    }

    /// Shared handle to the driver instance's trait object, for the I/O
    /// loop to call `parse`/`poll` on once it owns the fd.
    pub fn driver_handle(&self, path: &str) -> Option<DriverHandle> {
        self.instances.lock().unwrap().get(path).map(|i| i.ops.clone())
    }

    /// Every live instance's path, for the descriptor resolver (component
    /// F) to enumerate across.
    pub fn paths(&self) -> Vec<String> {
        self.instances.lock().unwrap().keys().cloned().collect()
    }

    /// The parsed schema entry backing one instance's `data_id`, if any;
    /// carries the field formats the public descriptor needs.
    pub fn schema_for(&self, path: &str, data_id: DataId) -> Option<SchemaDesc> {
        self.instances
            .lock()
            .unwrap()
            .get(path)
            .and_then(|i| i.schema_for(data_id).cloned())
    }

    /// The cached device name for whichever instance was assigned
    /// `dev_id`, for `hound_get_dev_name`. The outer `Option` is "no such
    /// device id"; the inner is "device id exists but reported no name".
    pub fn device_name_by_dev_id(&self, dev_id: DevId) -> Option<Option<String>> {
        self.instances
            .lock()
            .unwrap()
            .values()
            .find(|i| i.dev_id == dev_id)
            .map(|i| i.device_name.clone())
    }
}
