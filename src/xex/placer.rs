//! Assigns every structure its absolute offset in the output file.

use crate::error;
use crate::xex::header::{
    OptHeaderEntry, SIZEOF_OPT_HEADER_ENTRY, SIZEOF_XEX_HEADER, XEX_OPT_ID_BASEFILE_FORMAT,
    XEX_OPT_ID_IMPORT_LIBS, XEX_OPT_ID_TLS_INFO, XexHeader,
};
use crate::xex::optheaders::{OptionalHeaders, SIZEOF_BASEFILE_FORMAT, SIZEOF_TLS_INFO};
use crate::xex::security::{SIZEOF_PAGE_DESCRIPTOR, SIZEOF_SECURITY_INFO, SecurityInfoHeader};
use log::debug;

/// Rounds `offset` up to the next multiple of `alignment`.
pub fn next_aligned(offset: u32, alignment: u32) -> u32 {
    match offset % alignment {
        0 => offset,
        rem => offset + (alignment - rem),
    }
}

/// Absolute file offsets of every emitted structure. Offsets of headers that
/// are absent stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Offsets {
    pub xex_header: u32,
    pub opt_header_entries: u32,
    pub sec_info: u32,
    pub basefile_format: u32,
    pub import_libraries: u32,
    pub tls_info: u32,
    pub basefile: u32,
}

/// Lays the file out: fixed header, entry table, security info, the optional
/// header bodies 8-aligned in entry order, then the basefile on a 4 KiB
/// boundary. The import-libraries body is the one exception: its end abuts
/// the basefile, so its offset is only known after the basefile's is.
pub fn place(
    xex: &mut XexHeader,
    entries: &mut [OptHeaderEntry],
    sec: &SecurityInfoHeader,
    headers: &OptionalHeaders,
) -> error::Result<Offsets> {
    let mut offsets = Offsets::default();
    let mut current = 0u32;

    offsets.xex_header = current;
    current += SIZEOF_XEX_HEADER;

    // Entry table immediately follows the fixed header, unaligned
    offsets.opt_header_entries = current;
    current += entries.len() as u32 * SIZEOF_OPT_HEADER_ENTRY;

    current = next_aligned(current, 8);
    offsets.sec_info = current;
    xex.sec_info_offset = current;
    current += SIZEOF_SECURITY_INFO + sec.page_desc_count * SIZEOF_PAGE_DESCRIPTOR;

    let mut import_libs_entry = None;

    for (index, entry) in entries.iter_mut().enumerate() {
        current = next_aligned(current, 8);

        match entry.id {
            XEX_OPT_ID_BASEFILE_FORMAT => {
                entry.data_or_offset = current;
                offsets.basefile_format = current;
                current += SIZEOF_BASEFILE_FORMAT;
            }
            XEX_OPT_ID_IMPORT_LIBS => {
                // deferred: end-anchored against the basefile below
                import_libs_entry = Some(index);
            }
            XEX_OPT_ID_TLS_INFO => {
                entry.data_or_offset = current;
                offsets.tls_info = current;
                current += SIZEOF_TLS_INFO;
            }
            _ => {} // inline entries own no bytes
        }
    }

    let import_libs_size = headers
        .import_libraries
        .as_ref()
        .map(|libs| libs.size)
        .unwrap_or(0);
    current += import_libs_size;

    current = next_aligned(current, 0x1000);
    offsets.basefile = current;
    xex.pe_offset = current;

    if let Some(index) = import_libs_entry {
        offsets.import_libraries = offsets.basefile - import_libs_size;
        entries[index].data_or_offset = offsets.import_libraries;
    }

    debug!("placed structures: {offsets:#x?}");
    Ok(offsets)
}
