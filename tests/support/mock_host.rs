//! In-memory fake implementing `coretrace::host::Host`, built over a
//! byte-addressed `HashMap` instead of a real crash-dump image.

use std::cell::Cell;
use std::collections::HashMap;

use coretrace::host::{DebugInfo, MemberKind, Memory, ModuleSymbols, Symbol, SymbolEntry, Symbols, Tasks, TargetInfo};

#[derive(Debug, Clone, Copy)]
struct MemberInfo {
    offset: u64,
    size: u64,
    kind: MemberKind,
}

/// A fake target: a flat byte-addressed memory image plus a debug-info
/// and symbol table populated explicitly by each test.
#[derive(Debug)]
pub struct MockHost {
    mem: HashMap<u64, u8>,
    members: HashMap<(String, String), MemberInfo>,
    symbols: HashMap<String, Symbol>,
    modules: Vec<ModuleSymbols>,
    tasks: Vec<(i32, String)>,
    page_size: u32,
    long_size: u8,
    big_endian: bool,
    next_free: Cell<u64>,
}

impl MockHost {
    /// A little-endian, 64-bit-long, small-page target: enough to
    /// exercise the reconstruction logic without real 4KiB pages.
    pub fn new(page_size: u32) -> Self {
        MockHost {
            mem: HashMap::new(),
            members: HashMap::new(),
            symbols: HashMap::new(),
            modules: Vec::new(),
            tasks: Vec::new(),
            page_size,
            long_size: 8,
            big_endian: false,
            next_free: Cell::new(0x1000),
        }
    }

    /// Bump-allocate `size` bytes of fresh, non-overlapping address space
    /// aligned to 8 bytes.
    pub fn alloc(&self, size: u64) -> u64 {
        let addr = self.next_free.get();
        let aligned = (addr + 7) & !7;
        self.next_free.set(aligned + size);
        aligned
    }

    /// Register a `(struct, member)` offset/size/kind triple.
    pub fn set_member(&mut self, strukt: &str, member: &str, offset: u64, size: u64, kind: MemberKind) {
        self.members.insert(
            (strukt.to_string(), member.to_string()),
            MemberInfo { offset, size, kind },
        );
    }

    /// Register a global symbol.
    pub fn set_symbol(&mut self, name: &str, value: u64, kind: char) {
        self.symbols.insert(name.to_string(), Symbol { value, kind });
    }

    /// Add a running task.
    pub fn add_task(&mut self, pid: i32, comm: &str) {
        self.tasks.push((pid, comm.to_string()));
    }

    /// Write raw bytes starting at `addr`.
    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            self.mem.insert(addr + i as u64, b);
        }
    }

    /// Write a little/big-endian (per `self.big_endian`) `u64`.
    pub fn write_u64(&mut self, addr: u64, v: u64) {
        let bytes = if self.big_endian { v.to_be_bytes() } else { v.to_le_bytes() };
        self.write_bytes(addr, &bytes);
    }

    /// Write a `u32`.
    pub fn write_u32(&mut self, addr: u64, v: u32) {
        let bytes = if self.big_endian { v.to_be_bytes() } else { v.to_le_bytes() };
        self.write_bytes(addr, &bytes);
    }

    /// Write a `u8`.
    pub fn write_u8(&mut self, addr: u64, v: u8) {
        self.write_bytes(addr, &[v]);
    }

    /// Write a NUL-terminated string, returning its address.
    pub fn write_cstr(&mut self, s: &str) -> u64 {
        let addr = self.alloc(s.len() as u64 + 1);
        self.write_bytes(addr, s.as_bytes());
        self.write_u8(addr + s.len() as u64, 0);
        addr
    }

    /// Read back a `u64` previously written at `addr`. Test-setup helper
    /// only, not part of the `Memory` trait.
    pub fn peek_u64(&self, addr: u64) -> u64 {
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = *self.mem.get(&(addr + i as u64)).unwrap_or(&0);
        }
        if self.big_endian {
            u64::from_be_bytes(bytes)
        } else {
            u64::from_le_bytes(bytes)
        }
    }

    /// Zero-fill `len` bytes starting at `addr` (so reads of never
    /// explicitly written pages succeed rather than fail).
    pub fn zero_fill(&mut self, addr: u64, len: u64) {
        for i in 0..len {
            self.mem.entry(addr + i).or_insert(0);
        }
    }
}

impl Memory for MockHost {
    fn read_mem(&self, kaddr: u64, dst: &mut [u8]) -> bool {
        for (i, slot) in dst.iter_mut().enumerate() {
            match self.mem.get(&(kaddr + i as u64)) {
                Some(&b) => *slot = b,
                None => return false,
            }
        }
        true
    }

    fn read_string(&self, kaddr: u64, max: usize) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        for i in 0..max {
            let b = *self.mem.get(&(kaddr + i as u64))?;
            out.push(b);
            if b == 0 {
                break;
            }
        }
        Some(out)
    }
}

impl DebugInfo for MockHost {
    fn member_offset(&self, strukt: &str, member: &str) -> Option<u64> {
        self.members
            .get(&(strukt.to_string(), member.to_string()))
            .map(|m| m.offset)
    }

    fn member_size(&self, strukt: &str, member: &str) -> Option<u64> {
        self.members
            .get(&(strukt.to_string(), member.to_string()))
            .map(|m| m.size)
    }

    fn member_exists(&self, strukt: &str, member: &str) -> bool {
        self.members.contains_key(&(strukt.to_string(), member.to_string()))
    }

    fn member_type_kind(&self, strukt: &str, member: &str) -> Option<MemberKind> {
        self.members
            .get(&(strukt.to_string(), member.to_string()))
            .map(|m| m.kind)
    }

    fn symbol_lookup(&self, name: &str) -> Option<Symbol> {
        self.symbols.get(name).copied()
    }
}

impl TargetInfo for MockHost {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn long_size(&self) -> u8 {
        self.long_size
    }

    fn is_big_endian(&self) -> bool {
        self.big_endian
    }
}

impl Tasks for MockHost {
    fn running_tasks(&self) -> Vec<(i32, String)> {
        self.tasks.clone()
    }
}

impl Symbols for MockHost {
    fn iter_symbols(&self) -> Box<dyn Iterator<Item = SymbolEntry> + '_> {
        Box::new(
            self.symbols
                .iter()
                .map(|(name, sym)| SymbolEntry {
                    value: sym.value,
                    kind: sym.kind,
                    name: name.clone(),
                }),
        )
    }

    fn iter_modules(&self) -> Box<dyn Iterator<Item = ModuleSymbols> + '_> {
        Box::new(self.modules.iter().cloned())
    }
}

/// Standard `(struct, member)` offsets for an "inline fields, direct id,
/// direct system, lockless, per-CPU-sized" kernel — the common case most
/// tests build against. `buffer_page`/`list_head`/`ftrace_event_field`
/// layouts are shared with the syscall-indirection variant.
pub fn install_common_layout(host: &mut MockHost) {
    host.set_member("trace_array", "buffer", 0, 8, MemberKind::Pointer);
    host.set_member("tracer", "name", 0, 8, MemberKind::Pointer);

    host.set_member("ring_buffer", "flags", 0, 8, MemberKind::Other);
    host.set_member("ring_buffer", "cpus", 8, 4, MemberKind::Other);
    host.set_member("ring_buffer", "buffers", 16, 8, MemberKind::Pointer);

    host.set_member("ring_buffer_per_cpu", "cpu", 0, 4, MemberKind::Other);
    host.set_member("ring_buffer_per_cpu", "nr_pages", 8, 8, MemberKind::Other);
    host.set_member("ring_buffer_per_cpu", "pages", 16, 8, MemberKind::Pointer);
    host.set_member("ring_buffer_per_cpu", "head_page", 24, 8, MemberKind::Pointer);
    host.set_member("ring_buffer_per_cpu", "tail_page", 32, 8, MemberKind::Pointer);
    host.set_member("ring_buffer_per_cpu", "commit_page", 40, 8, MemberKind::Pointer);
    host.set_member("ring_buffer_per_cpu", "reader_page", 48, 8, MemberKind::Pointer);
    host.set_member("ring_buffer_per_cpu", "overrun", 56, 8, MemberKind::Other);
    host.set_member("ring_buffer_per_cpu", "entries", 64, 8, MemberKind::Other);

    host.set_member("buffer_page", "read", 0, 8, MemberKind::Other);
    host.set_member("buffer_page", "list", 8, 16, MemberKind::Other);
    host.set_member("buffer_page", "page", 24, 8, MemberKind::Pointer);

    host.set_member("list_head", "next", 0, 8, MemberKind::Pointer);

    host.set_member("ftrace_event_call", "list", 0, 16, MemberKind::Other);
    host.set_member("ftrace_event_call", "fields", 16, 16, MemberKind::Other);
    host.set_member("ftrace_event_call", "name", 32, 8, MemberKind::Pointer);
    host.set_member("ftrace_event_call", "system", 40, 8, MemberKind::Pointer);
    host.set_member("ftrace_event_call", "print_fmt", 48, 8, MemberKind::Pointer);
    host.set_member("ftrace_event_call", "id", 56, 4, MemberKind::Other);

    host.set_member("ftrace_event_field", "link", 0, 16, MemberKind::Other);
    host.set_member("ftrace_event_field", "name", 16, 8, MemberKind::Pointer);
    host.set_member("ftrace_event_field", "type", 24, 8, MemberKind::Pointer);
    host.set_member("ftrace_event_field", "offset", 32, 4, MemberKind::Other);
    host.set_member("ftrace_event_field", "size", 36, 4, MemberKind::Other);
    host.set_member("ftrace_event_field", "is_signed", 40, 1, MemberKind::Other);
}

/// `(struct, member)` offsets for a "via-class fields, syscall-enter
/// getter" kernel: the indirection path scenario-4 style tests exercise.
pub fn install_syscall_class_layout(host: &mut MockHost) {
    host.set_member("ftrace_event_call", "list", 0, 16, MemberKind::Other);
    host.set_member("ftrace_event_call", "class", 16, 8, MemberKind::Pointer);
    host.set_member("ftrace_event_call", "name", 24, 8, MemberKind::Pointer);
    host.set_member("ftrace_event_call", "print_fmt", 32, 8, MemberKind::Pointer);
    host.set_member("ftrace_event_call", "id", 40, 4, MemberKind::Other);
    host.set_member("ftrace_event_call", "data", 48, 8, MemberKind::Pointer);

    host.set_member("ftrace_event_class", "fields", 0, 16, MemberKind::Other);
    host.set_member("ftrace_event_class", "get_fields", 16, 8, MemberKind::Pointer);
    host.set_member("ftrace_event_class", "system", 24, 8, MemberKind::Pointer);

    host.set_member("syscall_metadata", "enter_fields", 0, 16, MemberKind::Other);
    host.set_member("syscall_metadata", "exit_fields", 16, 16, MemberKind::Other);

    host.set_member("ftrace_event_field", "link", 0, 16, MemberKind::Other);
    host.set_member("ftrace_event_field", "name", 16, 8, MemberKind::Pointer);
    host.set_member("ftrace_event_field", "type", 24, 8, MemberKind::Pointer);
    host.set_member("ftrace_event_field", "offset", 32, 4, MemberKind::Other);
    host.set_member("ftrace_event_field", "size", 36, 4, MemberKind::Other);
    host.set_member("ftrace_event_field", "is_signed", 40, 1, MemberKind::Other);

    host.set_member("list_head", "next", 0, 8, MemberKind::Pointer);
}

/// Initialize a standalone `list_head` as an empty circular list
/// (`head.next == head`), ready for [`push_event_call`] to splice into.
pub fn init_empty_list(host: &mut MockHost, head_addr: u64) {
    host.write_u64(head_addr, head_addr);
}

/// Populate a circular `ftrace_event_field` list whose head `list_head`
/// already lives at `head_addr` (either an embedded member of a call/class
/// struct, or a standalone allocation for `ftrace_common_fields`).
/// Field offsets follow [`install_common_layout`]/[`install_syscall_class_layout`]
/// (`link:0, name:16, type:24, offset:32, size:36, is_signed:40`).
pub fn build_fields_list(host: &mut MockHost, head_addr: u64, fields: &[(&str, &str, u32, u32, bool)]) {
    let node_addrs: Vec<u64> = fields.iter().map(|_| host.alloc(48)).collect();

    let first_link = node_addrs.first().copied().unwrap_or(head_addr);
    host.write_u64(head_addr, first_link);

    for (i, &addr) in node_addrs.iter().enumerate() {
        let next_link = node_addrs.get(i + 1).copied().unwrap_or(head_addr);
        host.write_u64(addr, next_link); // link.next
        host.write_u64(addr + 8, 0); // link.prev, unused by the walker

        let (name, ty, offset, size, signed) = fields[i];
        let name_addr = host.write_cstr(name);
        let type_addr = host.write_cstr(ty);
        host.write_u64(addr + 16, name_addr);
        host.write_u64(addr + 24, type_addr);
        host.write_u32(addr + 32, offset);
        host.write_u32(addr + 36, size);
        host.write_u8(addr + 40, if signed { 1 } else { 0 });
    }
}

/// Append one `ftrace_event_call` node (inline-fields layout) to the
/// `ftrace_events` list whose head `list_head` lives at `events_head`,
/// by splicing it in right after the head. Returns the call's address.
/// Suitable only for single-call lists built incrementally by inserting
/// each new call right after the head (reverse discovery order, matching
/// the kernel's own `list_add`).
pub fn push_event_call(
    host: &mut MockHost,
    events_head: u64,
    name: &str,
    system: &str,
    print_fmt: &str,
    id: u32,
    fields: &[(&str, &str, u32, u32, bool)],
) -> u64 {
    let call = host.alloc(64);
    let old_first = host.peek_u64(events_head);

    host.write_u64(call, old_first); // call.list.next
    host.write_u64(call + 8, 0); // call.list.prev, unused

    let fields_head = call + 16;
    build_fields_list(host, fields_head, fields);

    let name_addr = host.write_cstr(name);
    let system_addr = host.write_cstr(system);
    let print_fmt_addr = host.write_cstr(print_fmt);
    host.write_u64(call + 32, name_addr);
    host.write_u64(call + 40, system_addr);
    host.write_u64(call + 48, print_fmt_addr);
    host.write_u32(call + 56, id);

    host.write_u64(events_head, call);
    call
}

/// Build a circular ring of `n` buffer pages and return their addresses
/// in ring order, with `pages[0].list.next == pages[1]`, wrapping around.
pub fn build_page_ring(host: &mut MockHost, n: usize, page_size: u32) -> Vec<u64> {
    let mut pages = vec![0u64; n];
    // Allocate placeholders first so we know every address up front, then
    // patch each page's `.list.next` pointer to the next page's `.list`
    // address (== page address + 8 here).
    for slot in pages.iter_mut() {
        *slot = host.alloc(32);
    }
    for i in 0..n {
        let next_page = pages[(i + 1) % n];
        let next_list_addr = next_page + 8;
        let page_data = host.alloc(page_size as u64);
        host.zero_fill(page_data, page_size as u64);
        host.write_u64(pages[i], 0);
        host.write_u64(pages[i] + 8, next_list_addr);
        host.write_u64(pages[i] + 16, 0);
        host.write_u64(pages[i] + 24, page_data);
    }
    pages
}
