/// Global state for the hypervisor
///
/// The protection engine is built once during single-threaded setup and is
/// only read afterwards. Trap handlers reach it through [`MEM_PROTECT`].

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::mem_protect::MemProtect;

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

pub struct GlobalMemProtect {
    inner: UnsafeCell<Option<MemProtect>>,
    state: AtomicU8,
}

// Safety: `inner` is written exactly once, by the caller that wins the
// UNINIT -> INITIALIZING exchange, and only read after READY is published.
unsafe impl Sync for GlobalMemProtect {}

impl GlobalMemProtect {
    pub const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(None),
            state: AtomicU8::new(UNINIT),
        }
    }

    /// Install the engine. A second call hands `mp` back untouched.
    pub fn init(&self, mp: MemProtect) -> Result<(), MemProtect> {
        if self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(mp);
        }

        unsafe { *self.inner.get() = Some(mp) };
        self.state.store(READY, Ordering::Release);
        log::info!("memory protection online");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    pub fn get(&self) -> Option<&MemProtect> {
        if !self.is_initialized() {
            return None;
        }
        unsafe { (*self.inner.get()).as_ref() }
    }
}

impl Default for GlobalMemProtect {
    fn default() -> Self {
        Self::new()
    }
}

pub static MEM_PROTECT: GlobalMemProtect = GlobalMemProtect::new();
