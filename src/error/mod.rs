//! Diagnostics produced by the emitter, and the [`Reporter`] seam used to
//! surface them the way an assembler driver's `efunc` callback would.

use std::fmt;

/// Severity of a diagnostic, mirroring the three classes NASM's output
/// back ends report through: non-fatal (skip this item and continue),
/// warning, and panic (an invariant the driver violated; terminates).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Continue, but the item that produced this diagnostic was skipped
    /// or coerced to a safe default.
    NonFatal,
    /// Continue; purely informational.
    Warning,
    /// The caller violated an invariant of the emitter (e.g. an
    /// intra-segment PC-relative reference, or a segment used before
    /// any section was declared). Not recoverable.
    Panic,
}

/// Sub-class of a warning, used to gate GNU-extension-specific warnings
/// behind `ERR_WARN_GNUELF` the way the reference tool does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarnClass {
    /// No special gating.
    General,
    /// 16-bit ELF relocations are a GNU extension; warn only if the
    /// caller has this class of warning enabled.
    GnuElf,
}

/// All diagnostics the emitter can produce.
///
/// Each variant carries the data needed to reconstruct the exact message
/// text from spec.md §7 rather than a pre-formatted string, so a caller
/// can match on the diagnostic kind without string-matching.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Attempted to emit non-reserve bytes while `segto == NO_SEG`.
    #[error("attempt to assemble code in [ABSOLUTE] space")]
    AbsoluteSpace,

    /// Wrote initialized bytes into a `NOBITS` (`.bss`-like) section.
    #[error("attempt to initialize memory in BSS section `{section}': ignored")]
    InitializedBss {
        /// Name of the offending section.
        section: String,
    },

    /// `OUT_RESERVE` into a `PROGBITS` section; the gap is materialized
    /// as zero bytes instead of being left unreserved.
    #[error("uninitialized space declared in non-BSS section `{section}': zeroing")]
    ReserveInProgbits {
        /// Name of the offending section.
        section: String,
    },

    /// A relocation was requested against an odd-numbered (segment-base)
    /// pseudo-segment, which ELF32/i386 object files cannot express.
    #[error("ELF format does not support segment base references")]
    SegmentBaseReference,

    /// `wrt ..plt` was combined with `OUT_ADDRESS` (a non-PC-relative use).
    #[error("ELF format cannot produce non-PC-relative PLT references")]
    NonPcRelativePlt,

    /// A GOT-family `wrt` was combined with a PC-relative emission kind.
    #[error("ELF format cannot produce PC-relative GOT references")]
    PcRelativeGot,

    /// A 2-byte address/PC-relative slot was requested with a `wrt` that
    /// only supports 32-bit relocations, or a non-NO_SEG size other than 4.
    #[error("Unsupported non-32-bit ELF relocation")]
    Non32BitRelocation,

    /// `wrt` named a pseudo-segment this back end does not recognise.
    #[error("ELF format does not support this use of WRT")]
    UnsupportedWrt,

    /// An exact (symbol-precise) relocation, or a nearest-below search on
    /// an external symbol with nonzero offset, found no candidate symbol.
    #[error("unable to find a suitable global symbol for this reference")]
    NoSuitableGlobalSymbol,

    /// A symbol's `SIZE` expression evaluated to something relocatable
    /// (not a plain constant).
    #[error("cannot use relocatable expression as symbol size")]
    RelocatableSymbolSize,

    /// Attempt to declare one of the four sections the writer owns
    /// (`.comment`, `.shstrtab`, `.symtab`, `.strtab`).
    #[error("attempt to redefine reserved section name `{name}'")]
    ReservedSectionName {
        /// The rejected section name.
        name: String,
    },

    /// `align=N` with `N` not a power of two; coerced to 1.
    #[error("section alignment {requested} is not a power of two")]
    AlignmentNotPowerOfTwo {
        /// The alignment value the caller requested.
        requested: u32,
    },

    /// A `special` string was supplied to `deflabel` but none of its
    /// recognised sub-fields (type/visibility/size) consumed it.
    #[error("no special symbol features supported here")]
    UnusedSpecialText,

    /// An unrecognised `..`-prefixed pseudo-symbol name.
    #[error("unrecognised special symbol `{name}'")]
    UnrecognisedSpecialSymbol {
        /// The offending name.
        name: String,
    },

    /// An unrecognised symbol type keyword in a `GLOBAL` special string.
    #[error("unrecognised symbol type `{keyword}'")]
    UnrecognisedSymbolType {
        /// The offending keyword.
        keyword: String,
    },

    /// A `COMMON` alignment constraint failed to parse as a number.
    #[error("alignment constraint `{text}' is not a valid number")]
    InvalidAlignmentConstraint {
        /// The raw text that failed to parse.
        text: String,
    },

    /// A `COMMON` alignment constraint parsed but was not a power of two.
    #[error("alignment constraint `{text}' is not a power of two")]
    AlignmentConstraintNotPowerOfTwo {
        /// The raw text that was rejected.
        text: String,
    },

    /// Propagated I/O failure from the output writer.
    #[error("I/O error: {message}")]
    Io {
        /// Description of the underlying `std::io::Error`.
        message: String,
    },
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io {
            message: e.to_string(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Receives every diagnostic the emitter produces, the Rust-native
/// analogue of the `efunc errfunc` callback threaded through NASM's
/// `elf_init`.
///
/// The default implementation ([`LogReporter`]) logs non-fatal and
/// warning diagnostics through the `log` crate and panics on
/// [`Severity::Panic`], matching spec.md §7 ("PANIC is reserved for...
/// these indicate upstream bugs and terminate").
pub trait Reporter {
    /// Record a diagnostic. `class` only matters for warnings gated by
    /// `ERR_WARN_GNUELF`; callers that don't care can ignore it.
    fn report(&mut self, severity: Severity, class: WarnClass, error: &Error);
}

/// A [`Reporter`] that logs through the `log` crate and panics on
/// [`Severity::Panic`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter {
    /// Whether GNU-extension warnings (16-bit ELF relocations) should be
    /// surfaced. Corresponds to `ERR_WARN_GNUELF` being enabled.
    pub warn_gnu_elf: bool,
}

impl Reporter for LogReporter {
    fn report(&mut self, severity: Severity, class: WarnClass, error: &Error) {
        if class == WarnClass::GnuElf && !self.warn_gnu_elf {
            return;
        }
        match severity {
            Severity::NonFatal => log::error!("{error}"),
            Severity::Warning => log::warn!("{error}"),
            Severity::Panic => panic!("{error}"),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::NonFatal => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Panic => write!(f, "panic"),
        }
    }
}
