//! Tracing-tree Emitter (C5): writes a directory tree that mimics the
//! layout of a mounted `tracefs`, per spec §4.4.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::format::format_event_block;
use crate::host::Host;
use crate::layout::Layout;
use crate::model::Model;
use crate::Result;

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = fs::File::create(path)?;
    f.write_all(contents)?;
    Ok(())
}

/// Concatenate the raw page payloads for one CPU's linearized pages into
/// a single `trace_pipe_raw`-shaped blob.
fn raw_pipe_bytes(host: &dyn Host, layout: &Layout, pages: &[u64]) -> Result<Vec<u8>> {
    let page_size = layout.page_size as usize;
    let mut out = Vec::with_capacity(pages.len() * page_size);
    for &page_kaddr in pages {
        let data_addr = page_kaddr + layout.off.buffer_page_page;
        let mut buf = vec![0u8; page_size];
        if !host.read_mem(data_addr, &mut buf) {
            log::warn!("could not read page {:#x}, emitting zero-filled page", data_addr);
        }
        out.extend_from_slice(&buf);
    }
    Ok(out)
}

/// Which optional sections of the tracing tree to include, mirroring the
/// `-s`/`-m` flags on `trace dump`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpOpts {
    /// `-m`: also write `events/<system>/<name>/format` and
    /// `saved_cmdlines`.
    pub events_and_cmdlines: bool,
    /// `-s`: also write `kallsyms`.
    pub kallsyms: bool,
}

/// Write the tracing tree rooted at `root`. `per_cpu/cpu<N>/trace_pipe_raw`
/// is always written; `opts` gates the rest.
pub fn write_tree(root: &Path, model: &Model, layout: &Layout, host: &dyn Host, opts: DumpOpts) -> Result<()> {
    fs::create_dir_all(root)?;

    for (cpu, ring) in model.global.present() {
        let bytes = raw_pipe_bytes(host, layout, &ring.linear_pages)?;
        write_file(&root.join(format!("per_cpu/cpu{}/trace_pipe_raw", cpu)), &bytes)?;
    }

    if opts.events_and_cmdlines {
        for event in &model.event_types {
            let block = format_event_block(event, &model.common_fields);
            write_file(
                &root.join(format!("events/{}/{}/format", event.system, event.name)),
                block.as_bytes(),
            )?;
        }

        let cmdlines: String = host
            .running_tasks()
            .into_iter()
            .map(|(pid, comm)| format!("{} {}\n", pid, comm))
            .collect();
        write_file(&root.join("saved_cmdlines"), cmdlines.as_bytes())?;
    }

    if opts.kallsyms {
        let mut kallsyms = String::new();
        for sym in host.iter_symbols() {
            kallsyms.push_str(&format!("{:016x} {} {}\n", sym.value, sym.kind, sym.name));
        }
        for module in host.iter_modules() {
            for sym in module.symbols {
                kallsyms.push_str(&format!(
                    "{:016x} {} {}\t[{}]\n",
                    sym.value, sym.kind, sym.name, module.name
                ));
            }
        }
        write_file(&root.join("kallsyms"), kallsyms.as_bytes())?;
    }

    Ok(())
}
