//! In-memory model reconstructed from the dump (spec §3).
//!
//! Everything here is plain data. It is built once by [`crate::ring`] and
//! [`crate::events`] and held immutably by [`crate::extension::Extension`]
//! for the lifetime of the extension.

/// Per-CPU ring-buffer snapshot.
///
/// Invariants upheld by [`crate::ring::resolve_cpu_ring`]: `nr_pages >= 1`;
/// `pages` contains each page-descriptor address exactly once;
/// `real_head_page` is one of `pages`; `linear_pages[0] == reader_page`;
/// if `reader_page != commit_page` then `linear_pages[1] == real_head_page`
/// and (barring the corruption-escape guard) `linear_pages.last() ==
/// Some(&commit_page)`; `linear_pages.len() <= nr_pages + 1`.
#[derive(Debug, Clone)]
pub struct RingBufferPerCpu {
    /// Kernel address of the per-CPU descriptor. Zero means this CPU is
    /// absent and every other field is meaningless.
    pub kaddr: u64,
    /// Head page recorded verbatim on the descriptor (may not be the true
    /// head — see `real_head_page`).
    pub head_page: u64,
    /// Tail page, read verbatim.
    pub tail_page: u64,
    /// Commit page, read verbatim.
    pub commit_page: u64,
    /// Reader page, read verbatim.
    pub reader_page: u64,
    /// True head page, resolved by the topology algorithm.
    pub real_head_page: u64,
    /// Total ring size.
    pub nr_pages: u32,
    /// Every buffer-page descriptor address, in ring order starting at
    /// `real_head_page`.
    pub pages: Vec<u64>,
    /// Pages to dump, in emission order.
    pub linear_pages: Vec<u64>,
    /// Overrun counter, read verbatim.
    pub overrun: u64,
    /// Entries counter, read verbatim.
    pub entries: u64,
}

impl RingBufferPerCpu {
    /// A ring whose `kaddr` is zero: the CPU is absent from this dump.
    pub fn absent() -> Self {
        RingBufferPerCpu {
            kaddr: 0,
            head_page: 0,
            tail_page: 0,
            commit_page: 0,
            reader_page: 0,
            real_head_page: 0,
            nr_pages: 0,
            pages: Vec::new(),
            linear_pages: Vec::new(),
            overrun: 0,
            entries: 0,
        }
    }

    /// Whether this CPU's ring is present in the dump.
    pub fn is_present(&self) -> bool {
        self.kaddr != 0
    }
}

/// The full set of per-CPU rings backing one `trace_array` (`global_trace`
/// or `max_tr`).
#[derive(Debug, Clone, Default)]
pub struct RingSet {
    /// One entry per possible CPU; absent CPUs carry [`RingBufferPerCpu::absent`].
    pub cpus: Vec<RingBufferPerCpu>,
}

impl RingSet {
    /// Present CPUs, in CPU-index order.
    pub fn present(&self) -> impl Iterator<Item = (usize, &RingBufferPerCpu)> {
        self.cpus
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_present())
    }
}

/// One column of an event record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtraceField {
    /// Field name.
    pub name: String,
    /// Field type, e.g. `"int"`, `"char[16]"`, `"__data_loc char[]"`.
    pub field_type: String,
    /// Byte offset within the record.
    pub offset: u32,
    /// Size in bytes.
    pub size: u32,
    /// Whether the field is signed.
    pub is_signed: bool,
}

/// One event schema, as extracted from `ftrace_event_call`.
#[derive(Debug, Clone)]
pub struct EventType {
    /// Stable id assigned by the kernel.
    pub id: u32,
    /// Subsystem name (e.g. `"ftrace"`, `"sched"`).
    pub system: String,
    /// Event name within its subsystem.
    pub name: String,
    /// Raw print format string.
    pub print_fmt: String,
    /// `true` exactly when `system == "ftrace"`.
    pub plugin: bool,
    /// Event-specific fields, in storage order. When the kernel exposes no
    /// standalone common-fields list, the trailing
    /// [`default_common_field_count`] entries are the common fields.
    pub fields: Vec<FtraceField>,
}

/// Number of trailing fields treated as the common header when no
/// standalone `ftrace_common_fields` table exists.
pub const DEFAULT_COMMON_FIELD_COUNT: usize = 5;

/// The complete reconstructed model: event schema plus one or two ring sets.
#[derive(Debug, Clone, Default)]
pub struct Model {
    /// The `global_trace` ring, always present once initialization succeeds.
    pub global: RingSet,
    /// The `max_tr` ("snapshot"/latency) ring. Its buffer pointer can be
    /// null in the dump, in which case this is `None`.
    pub max_tr: Option<RingSet>,
    /// All event types, in discovery order.
    pub event_types: Vec<EventType>,
    /// `id -> index into event_types`, for ids below 256.
    pub event_type_cache: std::collections::HashMap<u32, usize>,
    /// Standalone common-fields table (`ftrace_common_fields`), if present.
    pub common_fields: Vec<FtraceField>,
    /// Name of the currently active tracer.
    pub current_tracer_name: String,
}

impl Model {
    /// Look up an event type by id, preferring the direct-indexed cache.
    pub fn event_type_by_id(&self, id: u32) -> Option<&EventType> {
        if let Some(&idx) = self.event_type_cache.get(&id) {
            return self.event_types.get(idx);
        }
        self.event_types.iter().find(|e| e.id == id)
    }
}
