//! Layout Probe (C1): resolves struct-member offsets and schema variants
//! once at initialization, per spec §4.1.

use crate::host::Host;
use crate::{Error, Result};

/// How the fields list is reached from an `ftrace_event_call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldsStrategy {
    /// `fields` lives directly on the call.
    Inline,
    /// `fields`/`get_fields` live on `call.class`.
    ViaClass,
}

/// How a `get_fields` getter resolves to a fields-list anchor, for the
/// event classes (mainly syscalls) that indirect through a function
/// pointer rather than a plain list head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallFieldsStrategy {
    /// `get_fields` is null; use `class.fields` directly.
    None,
    /// `get_fields == syscall_get_enter_fields`; fields live at
    /// `call.data + offset_of(syscall_metadata.enter_fields)`.
    EnterInline,
    /// `get_fields == syscall_get_exit_fields` and a standalone
    /// `syscall_exit_fields` symbol exists.
    ExitGlobalSymbol,
    /// `get_fields == syscall_get_exit_fields` but no standalone symbol
    /// exists; fall back to `call.data + offset_of(syscall_metadata.exit_fields)`.
    ExitInline,
    /// `get_fields` is set but matches neither known getter address; the
    /// fields list for this event cannot be resolved.
    Unknown,
}

/// Where an event's numeric id lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdLocation {
    /// `ftrace_event_call.id` directly.
    Direct,
    /// `ftrace_event_call.event.type` (newer kernels).
    ViaEventType,
}

/// Where the event's `system` name lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemLocation {
    /// `ftrace_event_call.system` directly.
    Direct,
    /// `ftrace_event_call.class.system`.
    ViaClass,
}

/// Resolved struct-member offsets this crate reads. `None` means the
/// member is absent in this kernel's debug info.
#[derive(Debug, Clone, Default)]
pub struct Offsets {
    /// `trace_array.buffer`.
    pub trace_array_buffer: u64,
    /// `trace_array.current_trace`, on kernels that store it there rather
    /// than behind the `current_trace` global symbol.
    pub trace_array_current_trace: Option<u64>,
    /// `tracer.name`.
    pub tracer_name: u64,

    /// `ring_buffer.pages`, on kernels sharing one page count across CPUs.
    pub ring_buffer_pages: Option<u64>,
    /// `ring_buffer.flags`.
    pub ring_buffer_flags: u64,
    /// `ring_buffer.cpus`.
    pub ring_buffer_cpus: u64,
    /// `ring_buffer.buffers` (a `ring_buffer_per_cpu **`).
    pub ring_buffer_buffers: u64,

    /// `ring_buffer_per_cpu.nr_pages`, on kernels tracking per-CPU counts.
    pub rbpc_nr_pages: Option<u64>,
    /// `ring_buffer_per_cpu.cpu`.
    pub rbpc_cpu: u64,
    /// `ring_buffer_per_cpu.pages`.
    pub rbpc_pages: u64,
    /// `ring_buffer_per_cpu.head_page`.
    pub rbpc_head_page: u64,
    /// `ring_buffer_per_cpu.tail_page`.
    pub rbpc_tail_page: u64,
    /// `ring_buffer_per_cpu.commit_page`.
    pub rbpc_commit_page: u64,
    /// `ring_buffer_per_cpu.reader_page`.
    pub rbpc_reader_page: u64,
    /// `ring_buffer_per_cpu.overrun`.
    pub rbpc_overrun: u64,
    /// `ring_buffer_per_cpu.entries`.
    pub rbpc_entries: u64,

    /// `buffer_page.read`.
    pub buffer_page_read: u64,
    /// `buffer_page.list`.
    pub buffer_page_list: u64,
    /// `buffer_page.page`.
    pub buffer_page_page: u64,

    /// `list_head.next`.
    pub list_head_next: u64,

    /// `ftrace_event_call.list`.
    pub call_list: u64,
    /// `ftrace_event_call.fields`, under [`FieldsStrategy::Inline`].
    pub call_fields: Option<u64>,
    /// `ftrace_event_call.class`, under [`FieldsStrategy::ViaClass`].
    pub call_class: Option<u64>,
    /// `ftrace_event_call.name`.
    pub call_name: u64,
    /// `ftrace_event_call.system`, under [`SystemLocation::Direct`].
    pub call_system: Option<u64>,
    /// `ftrace_event_call.print_fmt`, if present.
    pub call_print_fmt: Option<u64>,
    /// `ftrace_event_call.id`, under [`IdLocation::Direct`].
    pub call_id: Option<u64>,
    /// `ftrace_event_call.event`, under [`IdLocation::ViaEventType`].
    pub call_event: Option<u64>,
    /// `ftrace_event_call.data`, used by the syscall indirection paths.
    pub call_data: Option<u64>,
    /// `trace_event.type`, under [`IdLocation::ViaEventType`].
    pub trace_event_type: Option<u64>,

    /// `ftrace_event_class.fields`.
    pub class_fields: u64,
    /// `ftrace_event_class.get_fields`, if present.
    pub class_get_fields: Option<u64>,
    /// `ftrace_event_class.system`, under [`SystemLocation::ViaClass`].
    pub class_system: u64,

    /// `ftrace_event_field.link`.
    pub field_link: u64,
    /// `ftrace_event_field.name`.
    pub field_name: u64,
    /// `ftrace_event_field.type`.
    pub field_type: u64,
    /// `ftrace_event_field.offset`.
    pub field_offset: u64,
    /// `ftrace_event_field.size`.
    pub field_size: u64,
    /// `ftrace_event_field.is_signed`.
    pub field_is_signed: u64,

    /// `syscall_metadata.enter_fields`, under [`SyscallFieldsStrategy::EnterInline`].
    pub syscall_metadata_enter_fields: Option<u64>,
    /// `syscall_metadata.exit_fields`, under [`SyscallFieldsStrategy::ExitInline`].
    pub syscall_metadata_exit_fields: Option<u64>,

    /// `trace_bprintk_fmt.fmt`, for module-contributed printk format
    /// entries walked off the `trace_bprintk_fmt_list` symbol.
    pub trace_bprintk_fmt_fmt: Option<u64>,
}

/// Everything resolved once at init: offsets, detected schema variants and
/// fixed target properties.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Every resolved `(struct, member)` offset.
    pub off: Offsets,
    /// Whether this kernel's ring buffer uses the lockless (pointer-width
    /// `pages` field, tagged-pointer head resolution) implementation.
    pub lockless: bool,
    /// Whether each CPU's buffer tracks its own page count, as opposed to
    /// one count shared on `ring_buffer`.
    pub per_cpu_sized: bool,
    /// How to reach an event's fields list from its `ftrace_event_call`.
    pub fields_strategy: FieldsStrategy,
    /// Address of the `syscall_get_enter_fields` function, if present.
    pub syscall_get_enter_fields_addr: Option<u64>,
    /// Address of the `syscall_get_exit_fields` function, if present.
    pub syscall_get_exit_fields_addr: Option<u64>,
    /// Address of the standalone `syscall_exit_fields` symbol, if present.
    pub syscall_exit_fields_symbol: Option<u64>,
    /// Where an event's id lives.
    pub id_location: IdLocation,
    /// Where an event's system name lives.
    pub system_location: SystemLocation,
    /// Kernel page size on the dumped target.
    pub page_size: u32,
    /// Size of a kernel `long` on the dumped target, in bytes.
    pub long_size: u8,
    /// Whether the dumped target is big-endian.
    pub big_endian: bool,
}

fn mandatory(host: &dyn Host, strukt: &str, member: &str) -> Result<u64> {
    host.member_offset(strukt, member).ok_or_else(|| {
        Error::LayoutMismatch(format!("{}.{} is absent", strukt, member))
    })
}

impl Layout {
    /// Probe the host's debug info and build a [`Layout`].
    pub fn probe(host: &dyn Host) -> Result<Layout> {
        let per_cpu_sized = host.member_exists("ring_buffer_per_cpu", "nr_pages");

        let ring_buffer_pages = if per_cpu_sized {
            None
        } else {
            Some(mandatory(host, "ring_buffer", "pages")?)
        };

        let lockless = host
            .member_size("ring_buffer_per_cpu", "pages")
            .map(|sz| sz == u64::from(host.long_size()))
            .unwrap_or(false);

        let rbpc_nr_pages = if per_cpu_sized {
            Some(mandatory(host, "ring_buffer_per_cpu", "nr_pages")?)
        } else {
            None
        };

        let (fields_strategy, call_fields, class_fields, class_get_fields, call_class) =
            if host.member_exists("ftrace_event_call", "fields") {
                (
                    FieldsStrategy::Inline,
                    Some(mandatory(host, "ftrace_event_call", "fields")?),
                    0,
                    None,
                    None,
                )
            } else {
                let call_class = mandatory(host, "ftrace_event_call", "class")?;
                let class_fields = mandatory(host, "ftrace_event_class", "fields")?;
                let class_get_fields = host.member_offset("ftrace_event_class", "get_fields");
                (
                    FieldsStrategy::ViaClass,
                    None,
                    class_fields,
                    class_get_fields,
                    Some(call_class),
                )
            };

        let syscall_get_enter_fields_addr = host
            .symbol_lookup("syscall_get_enter_fields")
            .map(|s| s.value);
        let syscall_get_exit_fields_addr = host
            .symbol_lookup("syscall_get_exit_fields")
            .map(|s| s.value);
        let syscall_exit_fields_symbol = host.symbol_lookup("syscall_exit_fields").map(|s| s.value);

        let call_id = host.member_offset("ftrace_event_call", "id");
        let (id_location, call_event, trace_event_type) = if call_id.is_some() {
            (IdLocation::Direct, None, None)
        } else {
            let call_event = mandatory(host, "ftrace_event_call", "event")?;
            let trace_event_type = mandatory(host, "trace_event", "type")?;
            (IdLocation::ViaEventType, Some(call_event), Some(trace_event_type))
        };

        let call_system = host.member_offset("ftrace_event_call", "system");
        let (system_location, class_system) = if call_system.is_some() {
            (SystemLocation::Direct, 0)
        } else {
            (
                SystemLocation::ViaClass,
                mandatory(host, "ftrace_event_class", "system")?,
            )
        };

        let off = Offsets {
            trace_array_buffer: mandatory(host, "trace_array", "buffer")?,
            trace_array_current_trace: host.member_offset("trace_array", "current_trace"),
            tracer_name: mandatory(host, "tracer", "name")?,

            ring_buffer_pages,
            ring_buffer_flags: mandatory(host, "ring_buffer", "flags")?,
            ring_buffer_cpus: mandatory(host, "ring_buffer", "cpus")?,
            ring_buffer_buffers: mandatory(host, "ring_buffer", "buffers")?,

            rbpc_nr_pages,
            rbpc_cpu: mandatory(host, "ring_buffer_per_cpu", "cpu")?,
            rbpc_pages: mandatory(host, "ring_buffer_per_cpu", "pages")?,
            rbpc_head_page: mandatory(host, "ring_buffer_per_cpu", "head_page")?,
            rbpc_tail_page: mandatory(host, "ring_buffer_per_cpu", "tail_page")?,
            rbpc_commit_page: mandatory(host, "ring_buffer_per_cpu", "commit_page")?,
            rbpc_reader_page: mandatory(host, "ring_buffer_per_cpu", "reader_page")?,
            rbpc_overrun: mandatory(host, "ring_buffer_per_cpu", "overrun")?,
            rbpc_entries: mandatory(host, "ring_buffer_per_cpu", "entries")?,

            buffer_page_read: mandatory(host, "buffer_page", "read")?,
            buffer_page_list: mandatory(host, "buffer_page", "list")?,
            buffer_page_page: mandatory(host, "buffer_page", "page")?,

            list_head_next: mandatory(host, "list_head", "next")?,

            call_list: mandatory(host, "ftrace_event_call", "list")?,
            call_fields,
            call_class,
            call_name: mandatory(host, "ftrace_event_call", "name")?,
            call_system,
            call_print_fmt: host.member_offset("ftrace_event_call", "print_fmt"),
            call_id,
            call_event,
            call_data: host.member_offset("ftrace_event_call", "data"),
            trace_event_type,

            class_fields,
            class_get_fields,
            class_system,

            field_link: mandatory(host, "ftrace_event_field", "link")?,
            field_name: mandatory(host, "ftrace_event_field", "name")?,
            field_type: mandatory(host, "ftrace_event_field", "type")?,
            field_offset: mandatory(host, "ftrace_event_field", "offset")?,
            field_size: mandatory(host, "ftrace_event_field", "size")?,
            field_is_signed: mandatory(host, "ftrace_event_field", "is_signed")?,

            syscall_metadata_enter_fields: host
                .member_offset("syscall_metadata", "enter_fields"),
            syscall_metadata_exit_fields: host.member_offset("syscall_metadata", "exit_fields"),

            trace_bprintk_fmt_fmt: host.member_offset("trace_bprintk_fmt", "fmt"),
        };

        Ok(Layout {
            off,
            lockless,
            per_cpu_sized,
            fields_strategy,
            syscall_get_enter_fields_addr,
            syscall_get_exit_fields_addr,
            syscall_exit_fields_symbol,
            id_location,
            system_location,
            page_size: host.page_size(),
            long_size: host.long_size(),
            big_endian: host.is_big_endian(),
        })
    }

    /// Strategy for resolving a syscall event's fields, given the
    /// `get_fields` function-pointer value read from its class.
    pub fn syscall_fields_strategy(&self, get_fields_value: u64) -> SyscallFieldsStrategy {
        if get_fields_value == 0 {
            return SyscallFieldsStrategy::None;
        }
        if Some(get_fields_value) == self.syscall_get_enter_fields_addr {
            return SyscallFieldsStrategy::EnterInline;
        }
        if Some(get_fields_value) == self.syscall_get_exit_fields_addr {
            return if self.syscall_exit_fields_symbol.is_some() {
                SyscallFieldsStrategy::ExitGlobalSymbol
            } else {
                SyscallFieldsStrategy::ExitInline
            };
        }
        SyscallFieldsStrategy::Unknown
    }
}
