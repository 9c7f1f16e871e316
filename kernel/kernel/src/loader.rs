//! Turning ELF executables into execution contexts
//!
//! Every process gets four segments:
//!
//! | segment | source | placement | attributes |
//! | ------- | ------ | --------- | ---------- |
//! | code | all non-writable `PT_LOAD` headers | as linked | user, read only |
//! | data | all writable `PT_LOAD` headers, including `.bss` | as linked | user, writable |
//! | stack | [`USER_STACK_PAGES`] zeroed pages | [`USER_STACK_BASE`] | user, writable |
//! | heap | [`USER_HEAP_PAGES`] zeroed pages | [`USER_HEAP_BASE`] | user, writable |
//!
//! Images have to be at least 8 byte aligned in memory.

use crate::config::{USER_HEAP_BASE, USER_HEAP_PAGES, USER_STACK_BASE, USER_STACK_PAGES};
use crate::pmem::{PersistentMemoryManager, PersistentProcessInfo, PmemAllocator};
use crate::process::{ExecutionContext, ProcessMappingInfo, SegmentMapping};
use crate::KernelError;
use allocators::{AllocInit, PageAllocator};
use amd64::cache::{flush_range, CacheFlush};
use amd64::context::CpuContext;
use amd64::mem::{EntryFlags, Paging, USER_HALF};
use core::mem::size_of;
use core::ops::Range;
use core::ptr::NonNull;
use elfloader::{
    ElfBinary, ElfLoader, ElfLoaderErr, Flags, LoadableHeaders, RelocationEntry, RelocationType,
    VAddr as ElfVAddr,
};
use memory::{align_down, align_up, bytes_to_pages, pages_to_bytes, PAddr, PhysMapper, VAddr, PAGE_SIZE};

/// Where position independent executables are placed
pub const PIE_LOAD_BASE: VAddr = 0x40_0000;

const CODE_ATTRS: EntryFlags = EntryFlags::PRESENT.union(EntryFlags::USER);
const DATA_ATTRS: EntryFlags = EntryFlags::PRESENT
    .union(EntryFlags::WRITABLE)
    .union(EntryFlags::USER);

/// Allocate zeroed backing memory for `pages` pages at `vaddr` and map it into `root`
fn map_segment<M: PhysMapper>(
    paging: &Paging<M>,
    frames: &mut impl PageAllocator,
    root: PAddr,
    vaddr: VAddr,
    pages: u64,
    attrs: EntryFlags,
) -> Result<SegmentMapping, KernelError> {
    let paddr = frames.alloc_pages_init(pages, AllocInit::Zeroed)?;
    let segment = SegmentMapping::new(vaddr, paddr, pages_to_bytes(pages));
    paging.map_range(frames, root, vaddr, paddr, segment.map_size, attrs)?;
    Ok(segment)
}

/// Copy `bytes` to `vaddr` inside `segment` through the kernel mapping of its backing memory
fn write_into<M: PhysMapper>(mapper: &M, segment: &SegmentMapping, vaddr: VAddr, bytes: &[u8]) -> bool {
    let end = vaddr + bytes.len() as u64;
    if !segment.is_backed() || vaddr < segment.vaddr || end > segment.end() {
        return false;
    }
    unsafe {
        let dst = mapper.phys_to_mapped_mut::<u8>(segment.paddr + (vaddr - segment.vaddr));
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
    }
    true
}

/// Places the `PT_LOAD` segments of an image into the address space `root`
struct SegmentLoader<'a, M: PhysMapper, A: PageAllocator> {
    paging: &'a Paging<M>,
    frames: &'a mut A,
    root: PAddr,
    vbase: VAddr,
    code: SegmentMapping,
    data: SegmentMapping,
    /// The actual cause when the loader had to report a generic [`ElfLoaderErr`]
    error: Option<KernelError>,
}

impl<M: PhysMapper, A: PageAllocator> SegmentLoader<'_, M, A> {
    fn back(&mut self, span: Range<VAddr>, attrs: EntryFlags) -> Result<SegmentMapping, ElfLoaderErr> {
        let pages = bytes_to_pages(span.end - span.start);
        match map_segment(self.paging, self.frames, self.root, span.start, pages, attrs) {
            Ok(segment) => Ok(segment),
            Err(e) => {
                self.error = Some(e);
                Err(ElfLoaderErr::OutOfMemory)
            }
        }
    }

    fn write(&self, vaddr: VAddr, bytes: &[u8]) -> Result<(), ElfLoaderErr> {
        let mapper = self.paging.mapper();
        if write_into(mapper, &self.code, vaddr, bytes) || write_into(mapper, &self.data, vaddr, bytes) {
            Ok(())
        } else {
            log::warn!("{} bytes at {vaddr:#x} are outside of every loaded segment", bytes.len());
            Err(ElfLoaderErr::UnsupportedSectionData)
        }
    }
}

impl<M: PhysMapper, A: PageAllocator> ElfLoader for SegmentLoader<'_, M, A> {
    fn allocate(&mut self, load_headers: LoadableHeaders) -> Result<(), ElfLoaderErr> {
        let mut code: Option<Range<VAddr>> = None;
        let mut data: Option<Range<VAddr>> = None;
        for header in load_headers {
            let start = self.vbase + header.virtual_addr();
            let end = start + header.mem_size();
            log::debug!("allocate base = {start:#x} end = {end:#x} flags = {}", header.flags());
            let span = if header.flags().is_write() {
                &mut data
            } else {
                &mut code
            };
            *span = Some(match span.take() {
                None => start..end,
                Some(other) => other.start.min(start)..other.end.max(end),
            });
        }

        let code = code.map(|span| align_down(span.start)..align_up(span.end));
        let data = data.map(|span| align_down(span.start)..align_up(span.end));
        if let (Some(code), Some(data)) = (&code, &data) {
            if code.start < data.end && data.start < code.end {
                log::warn!("code {code:x?} and data {data:x?} share pages");
                self.error = Some(KernelError::SharedSegmentPage(code.start.max(data.start)));
                return Err(ElfLoaderErr::UnsupportedSectionData);
            }
        }
        if let Some(span) = code {
            self.code = self.back(span, CODE_ATTRS)?;
        }
        if let Some(span) = data {
            self.data = self.back(span, DATA_ATTRS)?;
        }
        Ok(())
    }

    fn load(&mut self, flags: Flags, base: ElfVAddr, region: &[u8]) -> Result<(), ElfLoaderErr> {
        let start = self.vbase + base;
        log::debug!(
            "loading region into = {:#x} -- {:#x}, {}",
            start,
            start + region.len() as u64,
            flags
        );
        self.write(start, region)
    }

    fn relocate(&mut self, entry: RelocationEntry) -> Result<(), ElfLoaderErr> {
        use elfloader::arch::x86_64::RelocationTypes;
        match entry.rtype {
            RelocationType::x86_64(RelocationTypes::R_AMD64_RELATIVE) => {
                let addend = entry.addend.ok_or(ElfLoaderErr::UnsupportedRelocationEntry)?;
                let target = self.vbase + entry.offset;
                log::trace!("R_RELATIVE *{:#x} = {:#x}", target, self.vbase + addend);
                self.write(target, &(self.vbase + addend).to_le_bytes())
            }
            other => {
                log::warn!("unsupported relocation {other:?}");
                Err(ElfLoaderErr::UnsupportedRelocationEntry)
            }
        }
    }
}

/// Place `args` at the top of `stack` the way the System V ABI expects them at process entry.
///
/// ```text
///                   ┌──────────────────────────┐ <- stack end
///                   │ argument strings         │
///                   ├──────────────────────────┤
///                   │ padding to 16 bytes      │
///                   ├──────────────────────────┤
///                   │ auxv: AT_NULL, 0         │
///                   │ envp: NULL               │
///                   │ argv[argc]: NULL         │
///                   │ argv[0..argc]            │
/// returned rsp ---> │ argc                     │
///                   └──────────────────────────┘
/// ```
///
/// Returns the initial stack pointer and the address of `argv`.
fn push_arguments<M: PhysMapper>(
    mapper: &M,
    stack: &SegmentMapping,
    args: &[&str],
) -> Result<(VAddr, VAddr), KernelError> {
    let strings: u64 = args.iter().map(|arg| arg.len() as u64 + 1).sum();
    let words = 1 + args.len() as u64 + 1 + 1 + 2;
    let rsp = (stack.end() - strings - words * 8) & !0xF;
    if rsp < stack.vaddr {
        return Err(KernelError::ArgumentsTooLarge(stack.end() - rsp));
    }

    let put = |vaddr: VAddr, bytes: &[u8]| {
        if write_into(mapper, stack, vaddr, bytes) {
            Ok(())
        } else {
            Err(KernelError::ArgumentsTooLarge(stack.end() - rsp))
        }
    };

    let argv = rsp + 8;
    let mut string = stack.end() - strings;
    let mut slot = argv;
    for arg in args {
        put(string, arg.as_bytes())?;
        put(string + arg.len() as u64, &[0])?;
        put(slot, &string.to_le_bytes())?;
        string += arg.len() as u64 + 1;
        slot += 8;
    }
    // argv terminator, envp terminator and auxv are already zero on a fresh stack
    put(rsp, &(args.len() as u64).to_le_bytes())?;
    Ok((rsp, argv))
}

/// Build the execution context of a new process running `image` with `args`.
///
/// All memory including page tables comes from `frames`. The kernel half of the address space is shared with
/// `kernel_root` and `kernel_rsp` is the top of the kernel stack the process enters the kernel on.
pub fn build_context<M: PhysMapper>(
    paging: &Paging<M>,
    frames: &mut impl PageAllocator,
    kernel_root: PAddr,
    kernel_rsp: VAddr,
    image: &[u8],
    args: &[&str],
) -> Result<ExecutionContext, KernelError> {
    let binary = ElfBinary::new(image)?;
    let root = paging.create_root(frames)?;
    paging.share_kernel_half(root, kernel_root);

    let vbase = if binary.is_pie() { PIE_LOAD_BASE } else { 0 };
    let mut loader = SegmentLoader {
        paging,
        frames: &mut *frames,
        root,
        vbase,
        code: SegmentMapping::default(),
        data: SegmentMapping::default(),
        error: None,
    };
    if let Err(e) = binary.load(&mut loader) {
        return Err(loader.error.take().unwrap_or(e.into()));
    }
    let (code, data) = (loader.code, loader.data);

    let stack = map_segment(paging, frames, root, USER_STACK_BASE, USER_STACK_PAGES, DATA_ATTRS)?;
    let (rsp, argv) = push_arguments(paging.mapper(), &stack, args)?;
    let heap = map_segment(paging, frames, root, USER_HEAP_BASE, USER_HEAP_PAGES, DATA_ATTRS)?;

    let entry = vbase + binary.entry_point();
    let mut cpu = CpuContext::new_user(entry, rsp, root);
    cpu.rdi = args.len() as u64;
    cpu.rsi = argv;
    log::debug!("built context for {:?}: entry {entry:#x} code {code} data {data}", args.first());
    Ok(ExecutionContext::new(
        cpu,
        kernel_rsp,
        ProcessMappingInfo {
            code,
            data,
            stack,
            heap,
            heap_used: 0,
        },
    ))
}

/// Give a context in the same state as `original` that has its own page tables and its own copies of every
/// writable segment. Only the code segment is shared.
pub fn mirror_context<M: PhysMapper>(
    paging: &Paging<M>,
    frames: &mut impl PageAllocator,
    kernel_root: PAddr,
    original: &ExecutionContext,
) -> Result<ExecutionContext, KernelError> {
    let root = paging.create_root(frames)?;
    paging.share_kernel_half(root, kernel_root);

    let source = &original.map_info;
    let code = source.code;
    if code.is_backed() {
        paging.map_range(frames, root, code.vaddr, code.paddr, code.map_size, CODE_ATTRS)?;
    }
    let mut mirror = |segment: &SegmentMapping| -> Result<SegmentMapping, KernelError> {
        if !segment.is_backed() {
            return Ok(SegmentMapping::default());
        }
        let pages = bytes_to_pages(segment.map_size);
        map_segment(paging, frames, root, segment.vaddr, pages, DATA_ATTRS)
    };
    let map_info = ProcessMappingInfo {
        code,
        data: mirror(&source.data)?,
        stack: mirror(&source.stack)?,
        heap: mirror(&source.heap)?,
        heap_used: 0,
    };

    let cpu = CpuContext {
        cr3: root,
        ..Default::default()
    };
    let mut ctx = ExecutionContext::new(cpu, original.kernel_rsp, map_info);
    ctx.copy_from(original, paging);
    Ok(ctx)
}

/// Flush the page tables of the user half and every segment of `ctx` and return the number of flushes
fn flush_everything<M: PhysMapper, F: CacheFlush + ?Sized>(
    paging: &Paging<M>,
    flusher: &F,
    ctx: &ExecutionContext,
) -> u64 {
    let mut flushes = 0;
    paging.for_each_table(ctx.root(paging), USER_HALF, |table| {
        let table = paging.mapper().phys_to_mapped(table) as *const u8;
        flushes += flush_range(flusher, table, PAGE_SIZE as usize);
    });
    ctx.map_info
        .segments()
        .iter()
        .map(|segment| segment.flush_all(paging.mapper(), flusher))
        .sum::<u64>()
        + flushes
}

/// Create the durable state of a new persistent process running `image` in the region of `manager`.
///
/// Segments, page tables and the [`PersistentProcessInfo`] are all placed in persistent memory and flushed before
/// the info is marked valid. Returns the kernel mapping of the info.
pub fn build_persistent_process_info<M: PhysMapper + Copy, F: CacheFlush + ?Sized>(
    paging: &Paging<M>,
    manager: &mut PersistentMemoryManager,
    flusher: &F,
    kernel_root: PAddr,
    image: &[u8],
    args: &[&str],
) -> Result<NonNull<PersistentProcessInfo>, KernelError> {
    let mapper = *paging.mapper();
    let mut pmem = PmemAllocator::new(manager, mapper, flusher);
    // the kernel stack lives in DRAM and is handed to the process afterwards
    let valid = build_context(paging, &mut pmem, kernel_root, 0, image, args)?;
    let working = mirror_context(paging, &mut pmem, kernel_root, &valid)?;
    let flushes = flush_everything(paging, flusher, &valid) + flush_everything(paging, flusher, &working);

    let info = pmem.manager().alloc_persistent_process_info(mapper, flusher)?;
    let mut info = NonNull::new(unsafe { mapper.phys_to_mapped_mut::<PersistentProcessInfo>(info) })
        .ok_or(KernelError::Uninitialized)?;
    unsafe { info.as_mut() }.init(valid, working, flusher);
    log::info!(
        "created persistent process info at {:p} ({} bytes, {flushes} lines flushed)",
        info,
        size_of::<PersistentProcessInfo>()
    );
    Ok(info)
}
