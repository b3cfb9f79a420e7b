//! A custom error and result type, shared by every stage of the pipeline

use core::fmt;
use core::result;
use std::error;
use std::io;

#[non_exhaustive]
#[derive(Debug)]
/// A custom SynthXEX error
pub enum Error {
    /// The input is not an Xbox 360 PE file; carries the failed check
    NotXbox360Pe(String),
    /// An internal request for header data the extractor does not recognize
    UnknownDataRequest(u8),
    /// A PE section carries none of the EXECUTE / WRITE / READ / DISCARDABLE flags
    MissingSectionFlag(usize),
    /// The PE contains a structure we do not support (PE-TLS, import-by-name,
    /// an import library we have no loader constant for)
    UnsupportedStructure(String),
    /// An RVA→offset or offset→RVA conversion landed outside every section
    InvalidRvaOrOffset(u32),
    /// An import library name does not parse as `name@build.hotfix+build.hotfix`
    InvalidImportName(String),
    /// More import addresses than the table can declare
    DataOverflow(usize),
    /// An error emanating from reading or interpreting bytes
    Scroll(scroll::Error),
    /// An IO based error
    IO(io::Error),
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IO(io) => Some(io),
            Error::Scroll(scroll) => Some(scroll),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        Error::Scroll(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotXbox360Pe(msg) => write!(fmt, "input PE is not an Xbox 360 PE: {msg}"),
            Error::UnknownDataRequest(flags) => write!(
                fmt,
                "internal error getting data from PE (request flags {flags:#x}); this is a bug"
            ),
            Error::MissingSectionFlag(idx) => {
                write!(fmt, "R/W/X flag missing from PE section {idx}")
            }
            Error::UnsupportedStructure(msg) => {
                write!(fmt, "unsupported data structure in PE: {msg}")
            }
            Error::InvalidRvaOrOffset(addr) => {
                write!(fmt, "invalid RVA or offset: {addr:#x}")
            }
            Error::InvalidImportName(name) => {
                write!(fmt, "invalid import library name: {name:?}")
            }
            Error::DataOverflow(count) => {
                write!(fmt, "import address count {count} overflows its table")
            }
            Error::Scroll(err) => write!(fmt, "{err}"),
            Error::IO(err) => write!(fmt, "{err}"),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
