//! Event format-block rendering (spec §4.5), shared by the tracing-tree
//! emitter and the archive writer — both need byte-identical
//! `events/<system>/<name>/format` text.

use crate::model::{EventType, FtraceField, DEFAULT_COMMON_FIELD_COUNT};

fn format_field_line(f: &FtraceField) -> String {
    // `__data_loc` fields keep their trailing `[]` attached to the type;
    // fixed-size arrays move the `[N]` onto the declared name instead.
    let (ty, suffix) = if f.field_type.starts_with("__data_loc") {
        (f.field_type.as_str(), "")
    } else if let Some(pos) = f.field_type.find('[') {
        (&f.field_type[..pos], &f.field_type[pos..])
    } else {
        (f.field_type.as_str(), "")
    };
    format!(
        "\tfield:{} {}{};\toffset:{};\tsize:{};\tsigned:{};\n",
        ty,
        f.name,
        suffix,
        f.offset,
        f.size,
        if f.is_signed { 1 } else { 0 }
    )
}

/// Render one event's `format` file body.
///
/// `common` is the standalone common-fields table, if the kernel exposes
/// one (`ftrace_common_fields`). When empty, the trailing
/// [`DEFAULT_COMMON_FIELD_COUNT`] entries of `event.fields`, in storage
/// order, are treated as the common header instead.
///
/// Fields are stored in reverse declaration order (the kernel prepends on
/// registration), so both groups are emitted in reverse of their storage
/// order to recover declaration order.
pub fn format_event_block(event: &EventType, common: &[FtraceField]) -> String {
    let mut out = String::new();
    out.push_str(&format!("name: {}\n", event.name));
    out.push_str(&format!("ID: {}\n", event.id));
    out.push_str("format:\n");

    let (common_fields, specific_fields): (&[FtraceField], &[FtraceField]) = if !common.is_empty() {
        (common, &event.fields[..])
    } else {
        let split = event.fields.len().saturating_sub(DEFAULT_COMMON_FIELD_COUNT);
        (&event.fields[split..], &event.fields[..split])
    };

    for f in common_fields.iter().rev() {
        out.push_str(&format_field_line(f));
    }
    out.push('\n');
    for f in specific_fields.iter().rev() {
        out.push_str(&format_field_line(f));
    }
    out.push('\n');

    out.push_str(&format!("print fmt: {}\n", event.print_fmt));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, ty: &str, offset: u32, size: u32, signed: bool) -> FtraceField {
        FtraceField {
            name: name.to_string(),
            field_type: ty.to_string(),
            offset,
            size,
            is_signed: signed,
        }
    }

    #[test]
    fn data_loc_field_keeps_brackets_on_type() {
        let line = format_field_line(&field("file", "__data_loc char[]", 8, 4, false));
        assert!(line.contains("field:__data_loc char[] file;"));
    }

    #[test]
    fn fixed_array_moves_brackets_to_name() {
        let line = format_field_line(&field("comm", "char[16]", 8, 16, true));
        assert!(line.contains("field:char comm[16];"));
    }

    #[test]
    fn default_common_split_uses_trailing_fields() {
        let event = EventType {
            id: 1,
            system: "sched".into(),
            name: "sched_switch".into(),
            print_fmt: "\"%s\"".into(),
            plugin: false,
            fields: vec![
                field("prev_comm", "char[16]", 8, 16, true),
                field("common_type", "unsigned short", 0, 2, false),
                field("common_flags", "unsigned char", 2, 1, false),
                field("common_preempt_count", "unsigned char", 3, 1, false),
                field("common_pid", "int", 4, 4, true),
                field("common_padding", "int", 8, 4, false),
            ],
        };
        let block = format_event_block(&event, &[]);
        let format_idx = block.find("format:\n").unwrap();
        let body = &block[format_idx..];
        assert!(body.find("common_type").unwrap() < body.find("prev_comm").unwrap());
    }
}
