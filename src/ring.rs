//! Ring Topology Resolver (C3): reconstructs one CPU's ring-buffer page
//! topology from a frozen snapshot, per spec §4.2.

use crate::host::Host;
use crate::layout::Layout;
use crate::model::RingBufferPerCpu;
use crate::util::{read_long, read_u64};
use crate::{Error, Result};

const RB_PAGE_TAG_MASK: u64 = 0b11;
const RB_PAGE_HEAD: u8 = 1;

/// A `list_head.next`-style pointer with the low two bits used by the
/// lockless ring buffer to tag the head page during a writer update.
#[derive(Debug, Clone, Copy)]
struct TaggedPtr {
    raw: u64,
}

impl TaggedPtr {
    fn addr(self) -> u64 {
        self.raw & !RB_PAGE_TAG_MASK
    }

    fn tag(self) -> u8 {
        (self.raw & RB_PAGE_TAG_MASK) as u8
    }
}

/// Read the raw `.list.next` pointer out of the buffer page at
/// `page_kaddr`, returning the (untagged) address of the next page's
/// descriptor and the tag bits that were set on the pointer.
fn next_page(host: &dyn Host, layout: &Layout, page_kaddr: u64) -> Result<(u64, u8)> {
    let list_addr = page_kaddr + layout.off.buffer_page_list;
    let next_field = list_addr + layout.off.list_head_next;
    let raw = read_u64(host, next_field, layout.big_endian)?;
    let tagged = TaggedPtr { raw };
    let next_list_addr = tagged.addr();
    let next_page_kaddr = next_list_addr
        .checked_sub(layout.off.buffer_page_list)
        .ok_or_else(|| Error::TopologyAnomaly(format!("bad list pointer {:#x}", raw)))?;
    Ok((next_page_kaddr, tagged.tag()))
}

/// Resolve the real head page. On the lockless buffer the head is marked
/// by a tag on whichever page's `next` pointer targets it; the walk is
/// anchored at `cpu_buffer->pages`, the permanent list-head the kernel
/// never swaps (unlike `head_page`, which a writer update can leave
/// pointing at a stale page under a race), per `ftrace_init_pages`. The
/// classic buffer has no tag scheme and `head_page` is authoritative.
fn resolve_real_head(
    host: &dyn Host,
    layout: &Layout,
    cpu_buffer_kaddr: u64,
    head_page: u64,
    nr_pages: u32,
) -> Result<u64> {
    if !layout.lockless {
        return Ok(head_page);
    }
    let pages_list_addr = read_u64(host, cpu_buffer_kaddr + layout.off.rbpc_pages, layout.big_endian)?;
    let anchor_page = pages_list_addr
        .checked_sub(layout.off.buffer_page_list)
        .ok_or_else(|| Error::TopologyAnomaly(format!("bad pages anchor pointer {:#x}", pages_list_addr)))?;

    let mut cur = anchor_page;
    for _ in 0..=nr_pages {
        let (next, tag) = next_page(host, layout, cur)?;
        if tag == RB_PAGE_HEAD {
            return Ok(next);
        }
        cur = next;
        if cur == anchor_page {
            break;
        }
    }
    Ok(head_page)
}

/// Walk the circular page list starting at `real_head_page`, collecting
/// each page-descriptor address exactly once. A page revisited before
/// `nr_pages` have been collected, or a walk that fails to close back to
/// `real_head_page` after exactly `nr_pages` steps, means the list is
/// corrupt or truncated; under `strict_ring_validation` this is a hard
/// error, otherwise it is warned and the page list truncated, the same
/// tolerance [`linearize`] applies to its own overrun case.
fn enumerate_pages(
    host: &dyn Host,
    layout: &Layout,
    real_head_page: u64,
    nr_pages: u32,
    strict_ring_validation: bool,
) -> Result<Vec<u64>> {
    let mut pages = Vec::with_capacity(nr_pages as usize);
    let mut cur = real_head_page;
    for _ in 0..nr_pages {
        if pages.contains(&cur) {
            let msg = format!(
                "ring revisited page {:#x} before enumerating {} pages",
                cur, nr_pages
            );
            if strict_ring_validation {
                return Err(Error::TopologyAnomaly(msg));
            }
            log::warn!("{}; truncating page list", msg);
            return Ok(pages);
        }
        pages.push(cur);
        let (next, _tag) = next_page(host, layout, cur)?;
        cur = next;
    }
    if cur != real_head_page {
        let msg = format!(
            "ring did not close back to head page {:#x} after {} pages",
            real_head_page, nr_pages
        );
        if strict_ring_validation {
            return Err(Error::TopologyAnomaly(msg));
        }
        log::warn!("{}", msg);
    }
    Ok(pages)
}

/// Linearize the pages to dump, in reader-then-ring-order, per the
/// invariants documented on [`crate::model::RingBufferPerCpu`].
fn linearize(
    host: &dyn Host,
    layout: &Layout,
    reader_page: u64,
    real_head_page: u64,
    commit_page: u64,
    nr_pages: u32,
    strict_ring_validation: bool,
) -> Result<Vec<u64>> {
    let mut linear = vec![reader_page];
    if reader_page == commit_page {
        return Ok(linear);
    }
    linear.push(real_head_page);
    let mut cur = real_head_page;
    let mut steps = 0u32;
    while cur != commit_page {
        let (next, _tag) = next_page(host, layout, cur)?;
        cur = next;
        linear.push(cur);
        steps += 1;
        if steps > nr_pages {
            if strict_ring_validation {
                return Err(Error::TopologyAnomaly(format!(
                    "ring on cpu buffer never reached commit page {:#x} after {} pages",
                    commit_page, nr_pages
                )));
            }
            log::warn!(
                "ring buffer linearization did not reach commit page {:#x}; truncating",
                commit_page
            );
            break;
        }
    }
    Ok(linear)
}

/// Reconstruct one CPU's ring-buffer topology.
///
/// `cpu_buffer_kaddr` is the `ring_buffer_per_cpu *` for this CPU.
/// `fallback_nr_pages` is used on kernels where the page count lives on
/// the shared `ring_buffer` rather than per-CPU (`layout.per_cpu_sized ==
/// false`).
pub fn resolve_cpu_ring(
    host: &dyn Host,
    layout: &Layout,
    cpu_buffer_kaddr: u64,
    fallback_nr_pages: u32,
    strict_ring_validation: bool,
) -> Result<RingBufferPerCpu> {
    let off = &layout.off;

    let nr_pages = if let Some(nr_pages_off) = off.rbpc_nr_pages {
        read_long(host, cpu_buffer_kaddr + nr_pages_off, layout.long_size, layout.big_endian)?
            as u32
    } else {
        fallback_nr_pages
    };
    if nr_pages == 0 {
        return Err(Error::TopologyAnomaly(format!(
            "cpu buffer {:#x} reports zero pages",
            cpu_buffer_kaddr
        )));
    }

    let head_page = read_u64(host, cpu_buffer_kaddr + off.rbpc_head_page, layout.big_endian)?;
    let tail_page = read_u64(host, cpu_buffer_kaddr + off.rbpc_tail_page, layout.big_endian)?;
    let commit_page = read_u64(host, cpu_buffer_kaddr + off.rbpc_commit_page, layout.big_endian)?;
    let reader_page = read_u64(host, cpu_buffer_kaddr + off.rbpc_reader_page, layout.big_endian)?;
    let overrun = read_u64(host, cpu_buffer_kaddr + off.rbpc_overrun, layout.big_endian)?;
    let entries = read_u64(host, cpu_buffer_kaddr + off.rbpc_entries, layout.big_endian)?;

    let real_head_page = resolve_real_head(host, layout, cpu_buffer_kaddr, head_page, nr_pages)?;
    let pages = enumerate_pages(host, layout, real_head_page, nr_pages, strict_ring_validation)?;

    if strict_ring_validation && !pages.contains(&commit_page) && commit_page != reader_page {
        return Err(Error::TopologyAnomaly(format!(
            "commit page {:#x} not reachable from head page {:#x}",
            commit_page, real_head_page
        )));
    }

    let linear_pages = linearize(
        host,
        layout,
        reader_page,
        real_head_page,
        commit_page,
        nr_pages,
        strict_ring_validation,
    )?;

    Ok(RingBufferPerCpu {
        kaddr: cpu_buffer_kaddr,
        head_page,
        tail_page,
        commit_page,
        reader_page,
        real_head_page,
        nr_pages,
        pages,
        linear_pages,
        overrun,
        entries,
    })
}

/// Read the debug-info-resolved page count off the shared `ring_buffer`
/// struct, for kernels that size pages globally rather than per-CPU.
pub fn read_shared_page_count(host: &dyn Host, layout: &Layout, ring_buffer_kaddr: u64) -> Result<u32> {
    let pages_off = layout.off.ring_buffer_pages.ok_or_else(|| {
        Error::LayoutMismatch("ring_buffer.pages absent on a non-per-cpu-sized kernel".into())
    })?;
    let v = read_long(host, ring_buffer_kaddr + pages_off, layout.long_size, layout.big_endian)?;
    Ok(v as u32)
}
