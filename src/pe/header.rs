//! Validation and raw header fields of an Xbox 360 PE.
//!
//! The layout constants here are the only place the DOS/COFF/optional-header
//! geometry is spelled out; everything downstream works from [`HeaderData`].

use crate::error::{self, Error};
use log::debug;
use scroll::Pread;

/// DOS header magic: "MZ" read little-endian
pub const DOS_MAGIC: u16 = 0x5a4d;
/// Offset of the PE header pointer inside the DOS header
pub const PE_POINTER_OFFSET: usize = 0x3c;
/// COFF machine ID for big-endian PowerPC, the Xenon CPU
pub const COFF_MACHINE_POWERPCBE: u16 = 0x01f2;
/// Optional-header subsystem ID for the Xbox
pub const SUBSYSTEM_XBOX: u16 = 0x000e;
/// Size of the PE signature plus the COFF file header
pub const SIZEOF_COFF_HEADER: usize = 0x18;
/// Size of one section table record
pub const SIZEOF_SECTION_RECORD: usize = 40;
/// DLL bit of the COFF characteristics
pub const PE_CHAR_FLAG_DLL: u16 = 0x2000;
/// Small-page image (4 KiB); the only alternative on this platform is 64 KiB
pub const PAGE_SIZE_4K: u32 = 0x1000;
pub const PAGE_SIZE_64K: u32 = 0x10000;

// Field offsets relative to the PE signature.
const COFF_MACHINE: usize = 0x04;
const COFF_SECTION_COUNT: usize = 0x06;
const COFF_SIZEOF_OPT_HEADER: usize = 0x14;
const COFF_CHARACTERISTICS: usize = 0x16;
const OPT_ENTRY_POINT: usize = 0x28;
const OPT_BASE_ADDR: usize = 0x34;
const OPT_SECTION_ALIGNMENT: usize = 0x38;
const OPT_SUBSYSTEM: usize = 0x5c;
const OPT_EXPORT_DIRECTORY: usize = 0x78;
const OPT_IMPORT_DIRECTORY: usize = 0x80;
const OPT_TLS_DIRECTORY: usize = 0xc0;

// Offsets of the raw size and raw pointer inside a section record.
const SECTION_RAW_SIZE: usize = 0x10;
const SECTION_RAW_OFFSET: usize = 0x14;

fn reject(msg: &str) -> Error {
    Error::NotXbox360Pe(msg.into())
}

/// Structural check of the input. This isn't thorough, but it's enough to
/// catch any non-PE/360 files before the extractor starts trusting offsets.
pub fn validate(bytes: &[u8], skip_machine_check: bool) -> error::Result<()> {
    // DOS header must fit, so the PE pointer can be read at all
    if bytes.len() < PE_POINTER_OFFSET + 4 {
        return Err(reject("file is smaller than a DOS header"));
    }

    let magic: u16 = bytes
        .pread_with(0, scroll::LE)
        .map_err(|_| reject("cannot read DOS magic"))?;

    if magic != DOS_MAGIC {
        return Err(reject("DOS magic mismatch"));
    }

    let pe_offset: u32 = bytes
        .pread_with(PE_POINTER_OFFSET, scroll::LE)
        .map_err(|_| reject("cannot read PE header pointer"))?;
    let pe_offset = pe_offset as usize;

    if bytes.len() < pe_offset {
        return Err(reject("PE header pointer is beyond the end of the file"));
    }

    let section_count: u16 = bytes
        .pread_with(pe_offset + COFF_SECTION_COUNT, scroll::LE)
        .map_err(|_| reject("cannot read section count"))?;

    if section_count == 0 {
        return Err(reject("no sections"));
    }

    let sizeof_opt_header: u16 = bytes
        .pread_with(pe_offset + COFF_SIZEOF_OPT_HEADER, scroll::LE)
        .map_err(|_| reject("cannot read optional header size"))?;

    let section_table_end = pe_offset
        + SIZEOF_COFF_HEADER
        + sizeof_opt_header as usize
        + section_count as usize * SIZEOF_SECTION_RECORD;

    if bytes.len() < section_table_end {
        return Err(reject("file is too small to hold the PE header"));
    }

    let machine: u16 = bytes
        .pread_with(pe_offset + COFF_MACHINE, scroll::LE)
        .map_err(|_| reject("cannot read machine ID"))?;

    if machine != COFF_MACHINE_POWERPCBE && !skip_machine_check {
        return Err(reject("machine ID is not POWERPCBE"));
    }

    let subsystem: u16 = bytes
        .pread_with(pe_offset + OPT_SUBSYSTEM, scroll::LE)
        .map_err(|_| reject("cannot read subsystem"))?;

    if subsystem != SUBSYSTEM_XBOX {
        return Err(reject("subsystem is not XBOX"));
    }

    let page_size: u32 = bytes
        .pread_with(pe_offset + OPT_SECTION_ALIGNMENT, scroll::LE)
        .map_err(|_| reject("cannot read section alignment"))?;

    if page_size != PAGE_SIZE_4K && page_size != PAGE_SIZE_64K {
        return Err(reject("section alignment is neither 4 KiB nor 64 KiB"));
    }

    // Every section's raw data must lie within the file
    let section_table = pe_offset + SIZEOF_COFF_HEADER + sizeof_opt_header as usize;

    for i in 0..section_count as usize {
        let record = section_table + i * SIZEOF_SECTION_RECORD;
        let raw_size: u32 = bytes
            .pread_with(record + SECTION_RAW_SIZE, scroll::LE)
            .map_err(|_| reject("cannot read section raw size"))?;
        let raw_offset: u32 = bytes
            .pread_with(record + SECTION_RAW_OFFSET, scroll::LE)
            .map_err(|_| reject("cannot read section raw offset"))?;

        if (bytes.len() as u64) < raw_size as u64 + raw_offset as u64 {
            return Err(reject("section raw data extends beyond the file"));
        }
    }

    debug!("validated Xbox 360 PE, {} sections", section_count);
    Ok(())
}

/// The header fields the rest of the pipeline needs, in host order.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeaderData {
    pub pe_header_offset: u32,
    pub section_count: u16,
    /// `section_count * 40`
    pub section_table_size: u32,
    /// End of the optional header, with the legacy one-byte slack kept
    pub header_size: u32,
    pub characteristics: u16,
    pub entry_point_rva: u32,
    pub base_addr: u32,
    pub page_size: u32,
    pub export_present: bool,
    /// RVA of the import directory table, zero when the PE imports nothing
    pub idt_rva: u32,
}

/// Pulls [`HeaderData`] out of a validated PE. `flags` selects additional
/// data requests; none are defined yet, so any nonzero value is an internal
/// error rather than silently ignored.
pub fn extract(bytes: &[u8], flags: u8) -> error::Result<HeaderData> {
    if flags != 0 {
        return Err(Error::UnknownDataRequest(flags));
    }

    let pe_header_offset: u32 = bytes.pread_with(PE_POINTER_OFFSET, scroll::LE)?;
    let pe = pe_header_offset as usize;

    let section_count: u16 = bytes.pread_with(pe + COFF_SECTION_COUNT, scroll::LE)?;
    let section_table_size = section_count as u32 * SIZEOF_SECTION_RECORD as u32;

    let sizeof_opt_header: u16 = bytes.pread_with(pe + COFF_SIZEOF_OPT_HEADER, scroll::LE)?;
    let header_size = (pe_header_offset + 1) + SIZEOF_COFF_HEADER as u32 + sizeof_opt_header as u32;

    let characteristics: u16 = bytes.pread_with(pe + COFF_CHARACTERISTICS, scroll::LE)?;
    let entry_point_rva: u32 = bytes.pread_with(pe + OPT_ENTRY_POINT, scroll::LE)?;
    let base_addr: u32 = bytes.pread_with(pe + OPT_BASE_ADDR, scroll::LE)?;
    let page_size: u32 = bytes.pread_with(pe + OPT_SECTION_ALIGNMENT, scroll::LE)?;

    let export_directory: u32 = bytes.pread_with(pe + OPT_EXPORT_DIRECTORY, scroll::LE)?;
    let idt_rva: u32 = bytes.pread_with(pe + OPT_IMPORT_DIRECTORY, scroll::LE)?;

    // PE TLS is unsupported, so finding it means we must abort
    let tls_addr: u32 = bytes.pread_with(pe + OPT_TLS_DIRECTORY, scroll::LE)?;
    let tls_size: u32 = bytes.pread_with(pe + OPT_TLS_DIRECTORY + 4, scroll::LE)?;

    if tls_addr != 0 || tls_size != 0 {
        return Err(Error::UnsupportedStructure("PE TLS directory present".into()));
    }

    let header = HeaderData {
        pe_header_offset,
        section_count,
        section_table_size,
        header_size,
        characteristics,
        entry_point_rva,
        base_addr,
        page_size,
        export_present: export_directory != 0,
        idt_rva,
    };
    debug!("{:x?}", header);
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_truncated_dos_header() {
        let bytes = [0x4d, 0x5a, 0x00];
        assert!(matches!(
            validate(&bytes, false),
            Err(Error::NotXbox360Pe(_))
        ));
    }

    #[test]
    fn reject_bad_magic() {
        let mut bytes = vec![0u8; 0x40];
        bytes[0] = b'Z';
        bytes[1] = b'M';
        assert!(matches!(
            validate(&bytes, false),
            Err(Error::NotXbox360Pe(_))
        ));
    }

    #[test]
    fn unknown_data_request_is_an_internal_error() {
        let bytes = vec![0u8; 0x200];
        assert!(matches!(
            extract(&bytes, 0x80),
            Err(Error::UnknownDataRequest(0x80))
        ));
    }
}
