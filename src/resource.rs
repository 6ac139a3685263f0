use std::sync::{Arc, Mutex, PoisonError};

use crate::proto;

/// A compute allocation: CPU cores, memory in MB, GPU units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComputeResource {
    pub cpu_count: i32,
    pub memory_mb: i64,
    pub gpu_count: i32,
}

impl ComputeResource {
    pub fn new(cpu_count: i32, memory_mb: i64, gpu_count: i32) -> Self {
        Self {
            cpu_count,
            memory_mb,
            gpu_count,
        }
    }

    pub fn plus(self, other: Self) -> Self {
        Self {
            cpu_count: self.cpu_count + other.cpu_count,
            memory_mb: self.memory_mb + other.memory_mb,
            gpu_count: self.gpu_count + other.gpu_count,
        }
    }

    pub fn minus(self, other: Self) -> Self {
        Self {
            cpu_count: self.cpu_count - other.cpu_count,
            memory_mb: self.memory_mb - other.memory_mb,
            gpu_count: self.gpu_count - other.gpu_count,
        }
    }

    pub fn is_non_negative(&self) -> bool {
        self.cpu_count >= 0 && self.memory_mb >= 0 && self.gpu_count >= 0
    }
}

impl From<proto::ComputeResource> for ComputeResource {
    fn from(r: proto::ComputeResource) -> Self {
        Self {
            cpu_count: r.cpu_count,
            memory_mb: r.memory_mb,
            gpu_count: r.gpu_count,
        }
    }
}

impl From<ComputeResource> for proto::ComputeResource {
    fn from(r: ComputeResource) -> Self {
        Self {
            cpu_count: r.cpu_count,
            memory_mb: r.memory_mb,
            gpu_count: r.gpu_count,
        }
    }
}

/// Process-wide record of currently allocated resources.
///
/// Adjustments are elementwise under one mutex; there is no admission
/// rejection here. The control plane decides what fits, the ledger only
/// tracks it, so a short overcommit between two transitions is tolerated.
#[derive(Debug)]
pub struct AllocationLedger {
    capacity: ComputeResource,
    allocated: Mutex<ComputeResource>,
}

impl AllocationLedger {
    pub fn new(capacity: ComputeResource) -> Self {
        Self {
            capacity,
            allocated: Mutex::new(ComputeResource::default()),
        }
    }

    pub fn plus(&self, delta: ComputeResource) {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        *allocated = allocated.plus(delta);
    }

    pub fn minus(&self, delta: ComputeResource) {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        *allocated = allocated.minus(delta);
    }

    pub fn allocated(&self) -> ComputeResource {
        *self.allocated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> ComputeResource {
        self.capacity
    }
}

/// Scoped allocation: `plus` on construction, `minus` exactly once on drop,
/// on every exit path including panic.
#[derive(Debug)]
pub struct AllocationGuard {
    ledger: Arc<AllocationLedger>,
    amount: ComputeResource,
}

impl AllocationGuard {
    pub fn new(ledger: Arc<AllocationLedger>, amount: ComputeResource) -> Self {
        ledger.plus(amount);
        Self { ledger, amount }
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        self.ledger.minus(self.amount);
    }
}
