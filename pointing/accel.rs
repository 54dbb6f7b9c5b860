// ========================================================================================
//
//                     The device manager: host <-> device memory residency
//
// ========================================================================================
//
// Bulk buffers are staged on the accelerator once and then reused by many kernels, so
// kernels never copy them per call. Instead, every staged host allocation is recorded in
// a registry that maps its host base address to the base of its device copy. A kernel
// that receives host slices asks the registry for the matching device memory, with
// offsets preserved: if host base `H` maps to device base `D`, then `H + k` maps to
// `D + k` for every `k` inside the allocation.
//
// The accelerator behind this manager is a software device. Its memory is a separate
// heap arena owned by the registry, and its compute resource is a dedicated team of
// worker threads. Kernels launched through a `DeviceScope` see only device memory, so
// the residency contract is exercised exactly as it would be on discrete hardware.
//
// A single manager exists per process (`AccelManager::get`). Within a kernel launch the
// registry is read-only: a `DeviceScope` holds the read lock until the launch returns,
// and `create`, `update_device`, `remove` and `reset` wait for the write lock.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{size_of, size_of_val};
use std::ptr::NonNull;
use std::sync::{OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, trace};
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

use crate::buffer::Element;
use crate::config::{AccelConfig, AccelTarget, ConfigError};

/// Device allocations are carved out of `u64` words, which aligns every [`Element`].
const DEVICE_WORD: usize = size_of::<u64>();

#[derive(Debug, Error)]
pub enum AccelError {
    #[error("host address {addr:#x} is not present on the device")]
    NotPresent { addr: usize },
    #[error("{len} bytes at host address {addr:#x} run past the end of their device allocation")]
    OutOfBounds { addr: usize, len: usize },
    #[error("host range at {addr:#x} overlaps an allocation already present on the device")]
    AlreadyPresent { addr: usize },
    #[error("cannot create a device copy of an empty host allocation")]
    EmptyAllocation,
    #[error("no accelerator device is selected; kernels run on the host")]
    NoDevice,
    #[error("the process-wide device manager is already initialized")]
    AlreadyInitialized,
    #[error("failed to start the device team pool: {0}")]
    TeamPool(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ========================================================================================
//                                  Device memory
// ========================================================================================

/// One block of device memory. The first `skew` bytes are padding chosen so that the
/// device base has the same alignment modulo 8 as the host base it mirrors.
struct DeviceAllocation {
    words: NonNull<u64>,
    len_words: usize,
    skew: usize,
}

// SAFETY: the block is uniquely owned; every access to its contents is ordered by the
// registry lock or, for transient mappings, by the launch that owns it.
unsafe impl Send for DeviceAllocation {}
unsafe impl Sync for DeviceAllocation {}

impl DeviceAllocation {
    fn zeroed(bytes: usize, skew: usize) -> Self {
        let len_words = (bytes + skew).div_ceil(DEVICE_WORD);
        let storage: &mut [u64] = Box::leak(vec![0u64; len_words].into_boxed_slice());
        Self {
            words: NonNull::from(storage).cast::<u64>(),
            len_words,
            skew,
        }
    }

    /// The device address that corresponds to the host base address.
    #[inline]
    fn base(&self) -> *mut u8 {
        // SAFETY: `skew < DEVICE_WORD <= len_words * DEVICE_WORD` whenever `len_words > 0`,
        // and `skew == 0` for an empty block.
        unsafe { self.words.as_ptr().cast::<u8>().add(self.skew) }
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        // SAFETY: `words` and `len_words` describe the boxed slice leaked in `zeroed`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.words.as_ptr(),
                self.len_words,
            )));
        }
    }
}

struct Entry {
    bytes: usize,
    device: DeviceAllocation,
}

#[derive(Default)]
struct Registry {
    entries: BTreeMap<usize, Entry>,
}

impl Registry {
    /// The registered allocation whose host range contains `addr`.
    fn containing(&self, addr: usize) -> Option<(usize, &Entry)> {
        self.entries
            .range(..=addr)
            .next_back()
            .filter(|&(&base, entry)| addr < base + entry.bytes)
            .map(|(&base, entry)| (base, entry))
    }

    fn overlaps(&self, addr: usize, bytes: usize) -> bool {
        self.containing(addr).is_some() || self.entries.range(addr..addr + bytes).next().is_some()
    }

    /// Device address of the `len` bytes starting at host `addr`, which must all fall
    /// inside a single registered allocation.
    fn translate(&self, addr: usize, len: usize) -> Result<*mut u8, AccelError> {
        let (base, entry) = self
            .containing(addr)
            .ok_or(AccelError::NotPresent { addr })?;
        let offset = addr - base;
        if offset + len > entry.bytes {
            return Err(AccelError::OutOfBounds { addr, len });
        }
        // SAFETY: `offset < entry.bytes`, and the device block spans `entry.bytes` bytes
        // past its base.
        Ok(unsafe { entry.device.base().add(offset) })
    }
}

// ========================================================================================
//                                  The manager
// ========================================================================================

static MANAGER: OnceLock<AccelManager> = OnceLock::new();

pub struct AccelManager {
    config: AccelConfig,
    registry: RwLock<Registry>,
    teams: Option<ThreadPool>,
}

impl fmt::Debug for AccelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccelManager")
            .field("config", &self.config)
            .field("n_registered", &self.n_registered())
            .finish()
    }
}

impl AccelManager {
    /// Builds a standalone manager. Most callers want the process-wide one from [`get`].
    ///
    /// [`get`]: AccelManager::get
    pub fn new(config: AccelConfig) -> Result<Self, AccelError> {
        config.validate()?;
        let teams = match config.target {
            AccelTarget::Host => None,
            AccelTarget::Emulated => {
                let device = config.device;
                let pool = ThreadPoolBuilder::new()
                    .num_threads(config.teams)
                    .thread_name(move |team| format!("detpoint-dev{device}-team{team}"))
                    .build()
                    .map_err(|e| AccelError::TeamPool(e.to_string()))?;
                Some(pool)
            }
        };
        info!(
            "Accelerator target: {} (device {}, {} teams)",
            config.target,
            config.device,
            teams.as_ref().map_or(0, ThreadPool::current_num_threads)
        );
        Ok(Self {
            config,
            registry: RwLock::new(Registry::default()),
            teams,
        })
    }

    /// The process-wide manager, configured from the environment on first use.
    pub fn get() -> Result<&'static AccelManager, AccelError> {
        if let Some(manager) = MANAGER.get() {
            return Ok(manager);
        }
        let manager = Self::new(AccelConfig::from_env()?)?;
        // A racing initializer may have published first; its manager is kept.
        Ok(MANAGER.get_or_init(|| manager))
    }

    /// Initializes the process-wide manager with an explicit configuration. Fails if
    /// [`get`](AccelManager::get) or `install` already ran.
    pub fn install(config: AccelConfig) -> Result<&'static AccelManager, AccelError> {
        let manager = Self::new(config)?;
        MANAGER
            .set(manager)
            .map_err(|_| AccelError::AlreadyInitialized)?;
        MANAGER.get().ok_or(AccelError::AlreadyInitialized)
    }

    #[inline]
    pub fn config(&self) -> &AccelConfig {
        &self.config
    }

    /// True when there is no accelerator and kernels must run on the host.
    #[inline]
    pub fn device_is_host(&self) -> bool {
        self.teams.is_none()
    }

    /// The selected device id, or `-1` on the host.
    #[inline]
    pub fn get_device(&self) -> i32 {
        if self.device_is_host() {
            -1
        } else {
            self.config.device
        }
    }

    pub fn n_teams(&self) -> usize {
        self.teams
            .as_ref()
            .map_or(0, ThreadPool::current_num_threads)
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Device address of the registered host address `host`. On the host this is
    /// `host` itself.
    pub fn device_ptr(&self, host: *const u8) -> Result<*const u8, AccelError> {
        if self.device_is_host() {
            return Ok(host);
        }
        let device = self.read_registry().translate(host as usize, 0)?;
        trace!("device_ptr: {host:p} -> {device:p}");
        Ok(device.cast_const())
    }

    /// Whether `host` lies inside an allocation present on the device. Everything is
    /// present when the device is the host.
    pub fn is_present(&self, host: *const u8) -> bool {
        self.device_is_host() || self.read_registry().containing(host as usize).is_some()
    }

    pub fn n_registered(&self) -> usize {
        self.read_registry().entries.len()
    }

    /// Allocates zeroed device memory mirroring `host` and registers the pair.
    pub fn create<T: Element>(&self, host: &[T]) -> Result<(), AccelError> {
        if self.device_is_host() {
            return Ok(());
        }
        let bytes = size_of_val(host);
        if bytes == 0 {
            return Err(AccelError::EmptyAllocation);
        }
        let addr = host.as_ptr() as usize;
        let mut registry = self.write_registry();
        if registry.overlaps(addr, bytes) {
            return Err(AccelError::AlreadyPresent { addr });
        }
        registry.entries.insert(
            addr,
            Entry {
                bytes,
                device: DeviceAllocation::zeroed(bytes, addr % DEVICE_WORD),
            },
        );
        debug!(
            "Registered {bytes} bytes at {addr:#x} on device {} ({} allocations)",
            self.config.device,
            registry.entries.len()
        );
        Ok(())
    }

    /// Copies `host` into its device mirror. `host` may be any sub-range of a
    /// registered allocation.
    pub fn update_device<T: Element>(&self, host: &[T]) -> Result<(), AccelError> {
        let bytes = size_of_val(host);
        if self.device_is_host() || bytes == 0 {
            return Ok(());
        }
        let registry = self.write_registry();
        let device = registry.translate(host.as_ptr() as usize, bytes)?;
        // SAFETY: `translate` confirmed the destination range lies in one device block,
        // and the write lock excludes every reader of device memory.
        unsafe {
            std::ptr::copy_nonoverlapping(host.as_ptr().cast::<u8>(), device, bytes);
        }
        trace!("update_device: {bytes} bytes at {:p}", host.as_ptr());
        Ok(())
    }

    /// Copies the device mirror of `host` back into `host`.
    pub fn update_host<T: Element>(&self, host: &mut [T]) -> Result<(), AccelError> {
        let bytes = size_of_val(host);
        if self.device_is_host() || bytes == 0 {
            return Ok(());
        }
        let registry = self.read_registry();
        let device = registry.translate(host.as_ptr() as usize, bytes)?;
        // SAFETY: as in `update_device`; device memory is only written under the write
        // lock or through the exclusive borrow of its host mirror, which `host` holds.
        unsafe {
            std::ptr::copy_nonoverlapping(
                device.cast_const(),
                host.as_mut_ptr().cast::<u8>(),
                bytes,
            );
        }
        trace!("update_host: {bytes} bytes at {:p}", host.as_ptr());
        Ok(())
    }

    /// Releases the device mirror of `host`, which must be the registered base.
    pub fn remove<T: Element>(&self, host: &[T]) -> Result<(), AccelError> {
        if self.device_is_host() {
            return Ok(());
        }
        let addr = host.as_ptr() as usize;
        let mut registry = self.write_registry();
        registry
            .entries
            .remove(&addr)
            .ok_or(AccelError::NotPresent { addr })?;
        debug!(
            "Released device mirror of {addr:#x} ({} allocations remain)",
            registry.entries.len()
        );
        Ok(())
    }

    /// Releases every device allocation.
    pub fn reset(&self) {
        let mut registry = self.write_registry();
        let released = registry.entries.len();
        registry.entries.clear();
        debug!("Released all {released} device allocations");
    }

    /// Opens a launch scope on the device. The registry stays read-only until the
    /// scope is dropped.
    pub fn target_scope(&self) -> Result<DeviceScope<'_>, AccelError> {
        let teams = self.teams.as_ref().ok_or(AccelError::NoDevice)?;
        Ok(DeviceScope {
            registry: self.read_registry(),
            teams,
        })
    }
}

// ========================================================================================
//                                  Launch scopes
// ========================================================================================

/// A device launch in progress: resolves host slices to their device mirrors, maps
/// small host arrays for the duration of the launch, and runs work on the device teams.
pub struct DeviceScope<'m> {
    registry: RwLockReadGuard<'m, Registry>,
    teams: &'m ThreadPool,
}

impl DeviceScope<'_> {
    pub fn n_teams(&self) -> usize {
        self.teams.current_num_threads()
    }

    /// The device mirror of `host`.
    pub fn resolve<'b, T: Element>(&'b self, host: &'b [T]) -> Result<&'b [T], AccelError> {
        let bytes = size_of_val(host);
        if bytes == 0 {
            return Ok(&[]);
        }
        let device = self.registry.translate(host.as_ptr() as usize, bytes)?;
        // SAFETY: the range lies in one zero-initialized device block whose alignment
        // matches the host's, and the block cannot be rewritten or freed while this
        // scope holds the read lock.
        Ok(unsafe { std::slice::from_raw_parts(device.cast::<T>().cast_const(), host.len()) })
    }

    /// The device mirror of `host`, writable. The exclusive borrow of `host` is held
    /// for as long as the device slice lives, so the mirror cannot be aliased.
    pub fn resolve_mut<'b, T: Element>(
        &'b self,
        host: &'b mut [T],
    ) -> Result<&'b mut [T], AccelError> {
        let bytes = size_of_val(host);
        if bytes == 0 {
            return Ok(&mut []);
        }
        let device = self.registry.translate(host.as_ptr() as usize, bytes)?;
        // SAFETY: as in `resolve`; uniqueness follows from the exclusive host borrow.
        Ok(unsafe { std::slice::from_raw_parts_mut(device.cast::<T>(), host.len()) })
    }

    /// Copies `host` into transient device memory released when the mapping drops.
    pub fn map_to<T: Element>(&self, host: &[T]) -> TargetData<T> {
        let bytes = size_of_val(host);
        let allocation = DeviceAllocation::zeroed(bytes, 0);
        // SAFETY: the fresh block holds at least `bytes` bytes and is not yet shared.
        unsafe {
            std::ptr::copy_nonoverlapping(host.as_ptr().cast::<u8>(), allocation.base(), bytes);
        }
        TargetData {
            allocation,
            len: host.len(),
            marker: PhantomData,
        }
    }

    /// Runs `op` on the device teams and waits for it.
    pub fn install<R, OP>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.teams.install(op)
    }
}

/// A host array copied to the device for the duration of one launch.
pub struct TargetData<T> {
    allocation: DeviceAllocation,
    len: usize,
    marker: PhantomData<T>,
}

impl<T: Element> TargetData<T> {
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the block was filled with `len` elements of `T` in `map_to` and is
        // aligned to `DEVICE_WORD`.
        unsafe { std::slice::from_raw_parts(self.allocation.base().cast::<T>().cast_const(), self.len) }
    }
}
