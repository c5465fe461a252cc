use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Capacity-one gate for one kind of capture job
///
/// Acquiring never waits: a held slot rejects the caller outright.
#[derive(Debug)]
pub struct AdmissionSlot {
    name: &'static str,
    busy: AtomicBool,
}

impl AdmissionSlot {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            busy: AtomicBool::new(false),
        })
    }

    /// Claims the slot; `None` if a job already holds it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotGuard { slot: self.clone() })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Held for the lifetime of a job; dropping it frees the slot.
#[derive(Debug)]
pub struct SlotGuard {
    slot: Arc<AdmissionSlot>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}
