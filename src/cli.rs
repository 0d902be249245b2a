//! Command-line surface for the `trace` extension command (spec §6).
//!
//! Parsing is hand-rolled rather than via a clap-style derive: the whole
//! surface is four forms, which a small match is clearer than a
//! declarative parser for.

use std::path::PathBuf;
use std::process::Command as ProcessCommand;

use crate::archive::write_archive;
use crate::extension::Extension;
use crate::host::Host;
use crate::tree::{write_tree, DumpOpts};
use crate::{Error, Result};

/// Default directory for `trace dump [-sm]` with no path argument.
const DEFAULT_TREE_DIR: &str = "dump_tracing_dir";
/// Default file for `trace dump -t` with no path argument.
const DEFAULT_ARCHIVE_FILE: &str = "trace.dat";

/// One parsed invocation of the `trace` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `trace` with no arguments: print the name of the currently active
    /// tracer.
    ShowTracer,
    /// `trace show` / `trace report`: write a temporary archive and hand
    /// it to the external `trace-cmd report` renderer.
    Render,
    /// `trace dump [-sm] [<dir>]`: write a tracing tree to `dir` (default
    /// `dump_tracing_dir`), `opts` recording which of `-s`/`-m` were given.
    DumpTree(PathBuf, DumpOpts),
    /// `trace dump -t [<file>]`: write a trace-archive v6 file to `file`
    /// (default `trace.dat`).
    DumpArchive(PathBuf),
}

fn parse_dump(rest: &[String]) -> Result<Command> {
    let mut opts = DumpOpts::default();
    let mut want_archive = false;
    let mut positional: Option<&str> = None;

    for arg in rest {
        if let Some(flags) = arg.strip_prefix('-') {
            if flags.is_empty() {
                return Err(Error::Usage("empty dump flag".into()));
            }
            for c in flags.chars() {
                match c {
                    't' => want_archive = true,
                    's' => opts.kallsyms = true,
                    'm' => opts.events_and_cmdlines = true,
                    other => return Err(Error::Usage(format!("unrecognized dump flag: -{}", other))),
                }
            }
        } else if positional.is_none() {
            positional = Some(arg.as_str());
        } else {
            return Err(Error::Usage(format!("unexpected extra argument: {}", arg)));
        }
    }

    if want_archive && (opts.kallsyms || opts.events_and_cmdlines) {
        return Err(Error::Usage("-t cannot be combined with -s or -m".into()));
    }

    if want_archive {
        let path = positional.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_ARCHIVE_FILE));
        Ok(Command::DumpArchive(path))
    } else {
        let path = positional.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_TREE_DIR));
        Ok(Command::DumpTree(path, opts))
    }
}

/// Parse `trace` command arguments (excluding the command name itself).
pub fn parse(args: &[String]) -> Result<Command> {
    let mut it = args.iter();
    match it.next() {
        None => Ok(Command::ShowTracer),
        Some(word) if word == "show" || word == "report" => {
            if it.next().is_some() {
                return Err(Error::Usage(format!("'{}' takes no arguments", word)));
            }
            Ok(Command::Render)
        }
        Some(word) if word == "dump" => parse_dump(it.as_slice()),
        Some(other) => Err(Error::Usage(format!("unknown trace command: {}", other))),
    }
}

fn render_with_trace_cmd(path: &std::path::Path) -> Result<()> {
    let exe = std::env::var("TRACE_CMD").unwrap_or_else(|_| "trace-cmd".to_string());
    let status = ProcessCommand::new(&exe)
        .arg("report")
        .arg(path)
        .status()
        .map_err(|e| Error::ExternalRenderer(format!("failed to launch {}: {}", exe, e)))?;
    if !status.success() {
        return Err(Error::ExternalRenderer(format!("{} exited with {}", exe, status)));
    }
    Ok(())
}

/// Execute a parsed command against an already-initialized extension.
pub fn dispatch(ext: &Extension, host: &dyn Host, cmd: Command) -> Result<()> {
    let layout = ext.layout();
    match cmd {
        Command::ShowTracer => {
            println!("current tracer is {}", ext.model().current_tracer_name);
            Ok(())
        }
        Command::Render => {
            let tmp = std::env::temp_dir().join("coretrace-report.dat");
            let mut f = std::fs::File::create(&tmp)?;
            write_archive(&mut f, ext.model(), layout, host)?;
            drop(f);
            render_with_trace_cmd(&tmp)
        }
        Command::DumpTree(dir, opts) => write_tree(&dir, ext.model(), layout, host, opts),
        Command::DumpArchive(file) => {
            let mut f = std::fs::File::create(&file)?;
            write_archive(&mut f, ext.model(), layout, host)
        }
    }
}
