//! Shard assignment strategies
//!
//! An assigner maps an entity identifier to a worker index. The pool caches
//! the answer per entity, so an assigner only runs on first sighting.

/// Trait for shard assignment strategies
pub trait WorkerAssigner: Send + Sync {
    /// Index of the worker that should handle `entity_id`, in `0..num_workers`
    fn assign(&self, entity_id: &str, num_workers: usize) -> usize;
}

const FNV32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash of `bytes`
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV32_OFFSET_BASIS, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(FNV32_PRIME)
    })
}

/// Hash-mod sharding: `fnv1a_32(entity_id) % num_workers`
///
/// Deterministic across processes and platforms, so the same entity lands
/// on the same worker in every run with the same pool size.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv1aAssigner;

impl Fnv1aAssigner {
    /// Create a new FNV-1a assigner
    pub fn new() -> Self {
        Self
    }
}

impl WorkerAssigner for Fnv1aAssigner {
    fn assign(&self, entity_id: &str, num_workers: usize) -> usize {
        if num_workers == 0 {
            return 0;
        }

        let workers = u32::try_from(num_workers).unwrap_or(u32::MAX);
        (fnv1a_32(entity_id.as_bytes()) % workers) as usize
    }
}

/// Assigner backed by a user-supplied function
pub struct CustomAssigner<F> {
    func: F,
}

impl<F> CustomAssigner<F>
where
    F: Fn(&str, usize) -> usize + Send + Sync,
{
    /// Create a new custom assigner with the given function
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> WorkerAssigner for CustomAssigner<F>
where
    F: Fn(&str, usize) -> usize + Send + Sync,
{
    fn assign(&self, entity_id: &str, num_workers: usize) -> usize {
        (self.func)(entity_id, num_workers)
    }
}
