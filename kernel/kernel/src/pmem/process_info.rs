use super::header::persist;
use crate::process::ExecutionContext;
use amd64::cache::{flush_object, CacheFlush};
use amd64::mem::Paging;
use memory::PhysMapper;

/// `valid_index` of an info whose contexts are not complete yet
const NO_VALID_CONTEXT: u64 = u64::MAX;

/// Work done while checkpointing
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct CheckpointStats {
    pub copied_bytes: u64,
    pub flushed_lines: u64,
}

/// The durable state of a persistent process: two execution contexts of which one is always a complete snapshot.
///
/// The slot named by `valid_index` holds the state as of the last checkpoint. The other one is the *working* context
/// that the process runs on and modifies. Each checkpoint makes the working context durable, flips `valid_index` to
/// it with a single flushed write and then copies it over the now stale slot, which becomes the new working context.
///
/// Both contexts have their own page tables and their own copies of the data, stack and heap segments; only the
/// read-only code segment is shared.
#[derive(Debug)]
#[repr(C)]
pub struct PersistentProcessInfo {
    ctx: [ExecutionContext; 2],
    valid_index: u64,
}

impl PersistentProcessInfo {
    /// Install the two contexts of a new process and make slot 0 the valid one.
    ///
    /// `working` must be a copy of `valid` that refers to its own page tables and segment memory. Segment contents
    /// have to be durable already.
    pub fn init<F: CacheFlush + ?Sized>(&mut self, valid: ExecutionContext, working: ExecutionContext, flusher: &F) {
        self.valid_index = NO_VALID_CONTEXT;
        persist(flusher, &self.valid_index);
        self.ctx = [valid, working];
        persist(flusher, &self.ctx);
        self.valid_index = 0;
        persist(flusher, &self.valid_index);
    }

    pub fn is_valid(&self) -> bool {
        self.valid_index < 2
    }

    pub fn valid_index(&self) -> usize {
        assert!(
            self.is_valid(),
            "persistent process info {:p} is corrupt: valid index {}",
            self,
            self.valid_index
        );
        self.valid_index as usize
    }

    fn working_index(&self) -> usize {
        1 - self.valid_index()
    }

    pub fn valid_context(&self) -> &ExecutionContext {
        &self.ctx[self.valid_index()]
    }

    pub fn working_context(&self) -> &ExecutionContext {
        &self.ctx[self.working_index()]
    }

    pub fn working_context_mut(&mut self) -> &mut ExecutionContext {
        let index = self.working_index();
        &mut self.ctx[index]
    }

    pub fn contexts_mut(&mut self) -> &mut [ExecutionContext; 2] {
        &mut self.ctx
    }

    /// Checkpoint the process.
    ///
    /// 1. the working context and its dirty pages are flushed
    /// 2. `valid_index` is flipped to the working context and flushed
    /// 3. the now valid context is copied into the other slot which becomes the working context
    ///
    /// A crash before 2 leaves the previous snapshot valid, a crash after it the new one.
    pub fn switch_context<M: PhysMapper, F: CacheFlush + ?Sized>(
        &mut self,
        paging: &Paging<M>,
        flusher: &F,
        stats: &mut CheckpointStats,
    ) {
        let working = self.working_index();
        stats.flushed_lines += self.ctx[working].flush(paging, flusher);

        self.valid_index = working as u64;
        stats.flushed_lines += persist(flusher, &self.valid_index);

        stats.copied_bytes += self.refresh_working_context(paging);
    }

    /// Overwrite the working context with the valid one and return the bytes copied.
    ///
    /// This is also how a checkpointed process is prepared to run again after a restart.
    pub fn refresh_working_context<M: PhysMapper>(&mut self, paging: &Paging<M>) -> u64 {
        let valid_index = self.valid_index();
        let [first, second] = &mut self.ctx;
        let (valid, stale) = match valid_index {
            0 => (&*first, second),
            _ => (&*second, first),
        };
        stale.copy_from(valid, paging)
    }

    /// Flush the whole info structure
    pub fn flush<F: CacheFlush + ?Sized>(&self, flusher: &F) -> u64 {
        flush_object(flusher, self as *const Self)
    }
}
