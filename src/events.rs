//! Event Schema Extractor (C4): walks the kernel's registered
//! `ftrace_event_call` list and reconstructs each event's id, name, system,
//! print format and field list, per spec §4.3.

use std::collections::HashMap;

use crate::host::Host;
use crate::layout::{FieldsStrategy, IdLocation, Layout, SyscallFieldsStrategy, SystemLocation};
use crate::model::{EventType, FtraceField};
use crate::util::{read_long, read_u32, read_u64, read_u8};
use crate::{Error, Result};

/// Longest `print_fmt` string this crate will read before giving up.
const MAX_PRINT_FMT_LEN: usize = 64 * 1024;
/// Longest field name/type string.
const MAX_IDENT_LEN: usize = 256;
/// Safety cap on the number of fields walked for a single event, guarding
/// against a corrupted circular list.
const MAX_FIELDS_PER_EVENT: usize = 512;
/// Safety cap on the number of events walked off the `ftrace_events` list.
const MAX_EVENTS: usize = 16 * 1024;

fn read_cstr(host: &dyn Host, ptr_kaddr: u64, max: usize, long_size: u8, big_endian: bool) -> Result<String> {
    let addr = read_long(host, ptr_kaddr, long_size, big_endian)?;
    if addr == 0 {
        return Ok(String::new());
    }
    let bytes = host
        .read_string(addr, max)
        .ok_or_else(|| Error::ReadFailure(format!("string at {:#x}", addr)))?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end])
        .map(str::to_owned)
        .map_err(Error::ParseUtf8)
}

/// Walk a circular `list_head` of `ftrace_event_field`s anchored at
/// `fields_head` (the address of the `list_head` itself, not a field).
fn walk_fields(host: &dyn Host, layout: &Layout, fields_head: u64) -> Result<Vec<FtraceField>> {
    let off = &layout.off;
    let mut fields = Vec::new();

    let first_next = read_u64(host, fields_head + layout.off.list_head_next, layout.big_endian)?;
    let mut cur_list = first_next;

    for _ in 0..MAX_FIELDS_PER_EVENT {
        if cur_list == fields_head || cur_list == 0 {
            break;
        }
        let field_addr = cur_list
            .checked_sub(off.field_link)
            .ok_or_else(|| Error::TopologyAnomaly(format!("bad field link {:#x}", cur_list)))?;

        let name = read_cstr(host, field_addr + off.field_name, MAX_IDENT_LEN, layout.long_size, layout.big_endian)?;
        let field_type = read_cstr(host, field_addr + off.field_type, MAX_IDENT_LEN, layout.long_size, layout.big_endian)?;
        let offset = read_u32(host, field_addr + off.field_offset, layout.big_endian)?;
        let size = read_u32(host, field_addr + off.field_size, layout.big_endian)?;
        let is_signed = read_u8(host, field_addr + off.field_is_signed)? != 0;

        fields.push(FtraceField {
            name,
            field_type,
            offset,
            size,
            is_signed,
        });

        cur_list = read_u64(host, cur_list + off.list_head_next, layout.big_endian)?;
    }

    Ok(fields)
}

/// Resolve the address of the fields-list head for one event call,
/// following the decision procedure in spec §4.3.
fn resolve_fields_head(host: &dyn Host, layout: &Layout, call_addr: u64) -> Result<Option<u64>> {
    let off = &layout.off;
    match layout.fields_strategy {
        FieldsStrategy::Inline => Ok(Some(call_addr + off.call_fields.expect("inline strategy implies call_fields"))),
        FieldsStrategy::ViaClass => {
            let class_addr = read_long(
                host,
                call_addr + off.call_class.expect("via-class strategy implies call_class"),
                layout.long_size,
                layout.big_endian,
            )?;
            if class_addr == 0 {
                return Ok(None);
            }
            let get_fields_value = match off.class_get_fields {
                Some(gf_off) => read_long(host, class_addr + gf_off, layout.long_size, layout.big_endian)?,
                None => 0,
            };
            match layout.syscall_fields_strategy(get_fields_value) {
                SyscallFieldsStrategy::None => Ok(Some(class_addr + off.class_fields)),
                SyscallFieldsStrategy::Unknown => {
                    log::warn!(
                        "unrecognized get_fields {:#x} on class {:#x}, skipping fields",
                        get_fields_value,
                        class_addr
                    );
                    Ok(None)
                }
                SyscallFieldsStrategy::EnterInline => {
                    let call_data_off = off.call_data.ok_or_else(|| {
                        Error::LayoutMismatch("ftrace_event_call.data absent for syscall enter event".into())
                    })?;
                    let data_addr = read_long(host, call_addr + call_data_off, layout.long_size, layout.big_endian)?;
                    let enter_off = off.syscall_metadata_enter_fields.ok_or_else(|| {
                        Error::LayoutMismatch("syscall_metadata.enter_fields absent".into())
                    })?;
                    Ok(Some(data_addr + enter_off))
                }
                SyscallFieldsStrategy::ExitGlobalSymbol => Ok(layout.syscall_exit_fields_symbol),
                SyscallFieldsStrategy::ExitInline => {
                    let call_data_off = off.call_data.ok_or_else(|| {
                        Error::LayoutMismatch("ftrace_event_call.data absent for syscall exit event".into())
                    })?;
                    let data_addr = read_long(host, call_addr + call_data_off, layout.long_size, layout.big_endian)?;
                    let exit_off = off.syscall_metadata_exit_fields.ok_or_else(|| {
                        Error::LayoutMismatch("syscall_metadata.exit_fields absent".into())
                    })?;
                    Ok(Some(data_addr + exit_off))
                }
            }
        }
    }
}

fn extract_one_event(host: &dyn Host, layout: &Layout, call_addr: u64) -> Result<EventType> {
    let off = &layout.off;

    let id = match layout.id_location {
        IdLocation::Direct => read_u32(host, call_addr + off.call_id.expect("direct id"), layout.big_endian)?,
        IdLocation::ViaEventType => {
            let event_off = off.call_event.expect("via-event-type id");
            let type_off = off.trace_event_type.expect("via-event-type id");
            read_u32(host, call_addr + event_off + type_off, layout.big_endian)?
        }
    };

    let name = read_cstr(host, call_addr + off.call_name, MAX_IDENT_LEN, layout.long_size, layout.big_endian)?;

    let system = match layout.system_location {
        SystemLocation::Direct => read_cstr(
            host,
            call_addr + off.call_system.expect("direct system"),
            MAX_IDENT_LEN,
            layout.long_size,
            layout.big_endian,
        )?,
        SystemLocation::ViaClass => {
            let class_addr = read_long(
                host,
                call_addr + off.call_class.expect("via-class system implies call_class"),
                layout.long_size,
                layout.big_endian,
            )?;
            if class_addr == 0 {
                String::new()
            } else {
                read_cstr(host, class_addr + off.class_system, MAX_IDENT_LEN, layout.long_size, layout.big_endian)?
            }
        }
    };

    let print_fmt = match off.call_print_fmt {
        Some(pf_off) => {
            read_cstr(host, call_addr + pf_off, MAX_PRINT_FMT_LEN, layout.long_size, layout.big_endian)
                .unwrap_or_default()
        }
        None => String::new(),
    };

    let fields = match resolve_fields_head(host, layout, call_addr)? {
        Some(head) => walk_fields(host, layout, head)?,
        None => {
            log::warn!("event {} has no resolvable fields list, skipping fields", name);
            Vec::new()
        }
    };

    let plugin = system == "ftrace";

    Ok(EventType {
        id,
        system,
        name,
        print_fmt,
        plugin,
        fields,
    })
}

/// Walk the `ftrace_events` list and extract every registered event type,
/// plus the standalone common-fields table if the kernel exposes one.
pub fn extract_event_types(
    host: &dyn Host,
    layout: &Layout,
    ftrace_events_head: u64,
) -> Result<(Vec<EventType>, HashMap<u32, usize>, Vec<FtraceField>)> {
    let off = &layout.off;
    let mut event_types = Vec::new();
    let mut cache = HashMap::new();

    let mut cur_list = read_u64(host, ftrace_events_head + off.list_head_next, layout.big_endian)?;

    for _ in 0..MAX_EVENTS {
        if cur_list == ftrace_events_head || cur_list == 0 {
            break;
        }
        let call_addr = cur_list
            .checked_sub(off.call_list)
            .ok_or_else(|| Error::TopologyAnomaly(format!("bad call list pointer {:#x}", cur_list)))?;

        match extract_one_event(host, layout, call_addr) {
            Ok(event) => {
                if event.id != 0 && event.id < 256 {
                    cache.insert(event.id, event_types.len());
                }
                event_types.push(event);
            }
            Err(e) => log::warn!("skipping event call {:#x}: {}", call_addr, e),
        }

        cur_list = read_u64(host, cur_list + off.list_head_next, layout.big_endian)?;
    }

    let common_fields = match host.symbol_lookup("ftrace_common_fields") {
        Some(sym) => walk_fields(host, layout, sym.value).unwrap_or_default(),
        None => Vec::new(),
    };

    Ok((event_types, cache, common_fields))
}
