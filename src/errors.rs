//! Utilities dealing with error handling in this crate.

use derive_more::From;
use failure::Fail;

/// Errors produced by this crate.
///
/// Variants follow the taxonomy used throughout the extension: a layout
/// mismatch aborts initialization, a read failure aborts the current
/// traversal, a topology/schema anomaly is normally just logged and the
/// offending CPU or event is skipped, and filesystem/allocation errors
/// abort the current command.
#[derive(Debug, Fail, From)]
pub enum Error {
    /// A mandatory `(struct, member)` offset the Layout Probe needs is
    /// absent from the debug info. Initialization is aborted.
    #[fail(display = "layout mismatch: {}", _0)]
    LayoutMismatch(String),
    /// A kernel-virtual address could not be read, or a symbol the
    /// extension depends on was not found.
    #[fail(display = "read failure: {}", _0)]
    ReadFailure(String),
    /// Ring or event-schema corruption bounded enough to report rather
    /// than repair (page-count mismatch, unresolved head page, unknown
    /// `get_fields` getter).
    #[fail(display = "topology anomaly: {}", _0)]
    TopologyAnomaly(String),
    /// `mkdir`/`open`/`write` failed for a reason other than `EEXIST` on
    /// `mkdir`.
    #[fail(display = "filesystem error - {}", _0)]
    Filesystem(#[cause] std::io::Error),
    /// A growable buffer could not be extended.
    #[fail(display = "allocation failure: {}", _0)]
    Allocation(String),
    /// A string read from the dump was not valid UTF-8.
    #[fail(display = "parse error - {}", _0)]
    ParseUtf8(#[cause] std::str::Utf8Error),
    /// The external `trace-cmd` renderer could not be located or invoked.
    #[fail(display = "trace-cmd error: {}", _0)]
    ExternalRenderer(String),
    /// Malformed command-line arguments to the `trace` command.
    #[fail(display = "usage error: {}", _0)]
    Usage(String),
}

/// Result type used in this crate.
pub type Result<T> = std::result::Result<T, Error>;
