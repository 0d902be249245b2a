//! Orchestrator (C7): builds the full [`Model`] once against a [`Host`]
//! and holds it for the lifetime of the extension.

use crate::events::extract_event_types;
use crate::host::Host;
use crate::layout::Layout;
use crate::model::{Model, RingBufferPerCpu, RingSet};
use crate::ring::{read_shared_page_count, resolve_cpu_ring};
use crate::util::read_long;
use crate::{Error, Result};

/// Tunables that resolve ambiguity the debug info alone cannot, set once
/// when the extension is loaded.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Highest possible CPU index to probe, typically `nr_cpu_ids` on the
    /// dumped kernel.
    pub nr_cpu_ids: usize,
    /// When `true`, a ring whose topology cannot be fully linearized (the
    /// walk from the head page never reaches the commit page within
    /// `nr_pages` steps, or the commit page is unreachable) is reported
    /// as an error. When `false`, the ring is truncated and a warning is
    /// logged instead, matching the original extension's tolerance for a
    /// live, moving target.
    pub strict_ring_validation: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            nr_cpu_ids: 1,
            strict_ring_validation: false,
        }
    }
}

fn resolve_ring_set(
    host: &dyn Host,
    layout: &Layout,
    options: &Options,
    trace_array_kaddr: u64,
) -> Result<RingSet> {
    let ring_buffer_kaddr = read_long(
        host,
        trace_array_kaddr + layout.off.trace_array_buffer,
        layout.long_size,
        layout.big_endian,
    )?;
    if ring_buffer_kaddr == 0 {
        return Ok(RingSet::default());
    }

    let fallback_nr_pages = if layout.per_cpu_sized {
        0
    } else {
        read_shared_page_count(host, layout, ring_buffer_kaddr)?
    };

    let buffers_ptr = read_long(
        host,
        ring_buffer_kaddr + layout.off.ring_buffer_buffers,
        layout.long_size,
        layout.big_endian,
    )?;

    let mut cpus = Vec::with_capacity(options.nr_cpu_ids);
    for cpu in 0..options.nr_cpu_ids {
        let slot = buffers_ptr + (cpu as u64) * u64::from(layout.long_size);
        let cpu_buffer_kaddr = read_long(host, slot, layout.long_size, layout.big_endian)?;
        if cpu_buffer_kaddr == 0 {
            cpus.push(RingBufferPerCpu::absent());
            continue;
        }
        match resolve_cpu_ring(
            host,
            layout,
            cpu_buffer_kaddr,
            fallback_nr_pages,
            options.strict_ring_validation,
        ) {
            Ok(ring) => cpus.push(ring),
            Err(e) => {
                log::warn!("cpu {} ring buffer unusable, treating as absent: {}", cpu, e);
                cpus.push(RingBufferPerCpu::absent());
            }
        }
    }
    Ok(RingSet { cpus })
}

fn resolve_current_tracer_name(host: &dyn Host, layout: &Layout, trace_array_kaddr: u64) -> Result<String> {
    let tracer_kaddr = if let Some(off) = layout.off.trace_array_current_trace {
        read_long(host, trace_array_kaddr + off, layout.long_size, layout.big_endian)?
    } else {
        let sym = host
            .symbol_lookup("current_trace")
            .ok_or_else(|| Error::ReadFailure("current_trace symbol not found".into()))?;
        read_long(host, sym.value, layout.long_size, layout.big_endian)?
    };
    if tracer_kaddr == 0 {
        return Ok("nop".to_string());
    }
    let name_ptr = read_long(
        host,
        tracer_kaddr + layout.off.tracer_name,
        layout.long_size,
        layout.big_endian,
    )?;
    if name_ptr == 0 {
        return Ok(String::new());
    }
    let bytes = host
        .read_string(name_ptr, 64)
        .ok_or_else(|| Error::ReadFailure(format!("tracer name at {:#x}", name_ptr)))?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Owns the reconstructed [`Model`] for the lifetime of the extension.
#[derive(Debug)]
pub struct Extension {
    layout: Layout,
    model: Model,
}

impl Extension {
    /// Build the full model from the host's current state. This is the
    /// only place reconstruction runs; every command dispatched against
    /// this [`Extension`] reads the same frozen [`Model`].
    pub fn init(host: &dyn Host, options: Options) -> Result<Extension> {
        let layout = Layout::probe(host)?;

        let global_trace = host
            .symbol_lookup("global_trace")
            .ok_or_else(|| Error::ReadFailure("global_trace symbol not found".into()))?;
        let global = resolve_ring_set(host, &layout, &options, global_trace.value)?;

        let max_tr = match host.symbol_lookup("max_tr") {
            Some(sym) => match resolve_ring_set(host, &layout, &options, sym.value) {
                Ok(set) if set.present().next().is_some() => Some(set),
                Ok(_) => None,
                Err(e) => {
                    log::warn!("max_tr ring unusable: {}", e);
                    None
                }
            },
            None => None,
        };

        let ftrace_events = host
            .symbol_lookup("ftrace_events")
            .ok_or_else(|| Error::ReadFailure("ftrace_events symbol not found".into()))?;
        let (event_types, event_type_cache, common_fields) =
            extract_event_types(host, &layout, ftrace_events.value)?;

        let current_tracer_name = resolve_current_tracer_name(host, &layout, global_trace.value)
            .unwrap_or_else(|e| {
                log::warn!("could not resolve current tracer name: {}", e);
                String::new()
            });

        Ok(Extension {
            layout,
            model: Model {
                global,
                max_tr,
                event_types,
                event_type_cache,
                common_fields,
                current_tracer_name,
            },
        })
    }

    /// The reconstructed model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// The resolved layout used to build [`Extension::model`].
    pub fn layout(&self) -> &Layout {
        &self.layout
    }
}

impl Drop for Extension {
    fn drop(&mut self) {
        log::debug!("tearing down extension: dropping reconstructed model");
    }
}
