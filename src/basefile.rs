//! Maps the PE into the basefile stored inside the XEX: an image laid out so
//! that every RVA equals its file offset, page-padded, with the import
//! address tables rewritten into the Xenon form the loader patches.

use crate::error::{self, Error};
use crate::pe::PeImage;
use crate::pe::import::PE_IMPORT_ORDINAL_FLAG;
use crate::xex::placer::next_aligned;
use log::debug;
use scroll::{Pread, Pwrite};
use std::io;

/// Rewrites `bytes` (the PE) into a fresh basefile image and updates
/// `pe.size` to the padded image length.
pub fn map(bytes: &[u8], pe: &mut PeImage) -> error::Result<Vec<u8>> {
    // header_size carries a legacy one-byte slack, so this can poke past the
    // end of a PE whose last section stores no data
    let header_len = (pe.header_size + pe.section_table_size) as usize;

    if header_len > bytes.len() {
        return Err(Error::IO(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "PE ends inside its header",
        )));
    }

    // The image ends where the furthest section does, rounded up to a page
    let mut end = header_len as u32;

    for section in &pe.sections {
        end = end.max(section.rva + section.raw_size);
    }

    let size = next_aligned(end, pe.page_size);
    let mut basefile = vec![0u8; size as usize];

    // PE headers land at offset zero unchanged
    basefile[..header_len].copy_from_slice(&bytes[..header_len]);

    // Each section lands at its RVA
    for section in &pe.sections {
        let src = section.raw_offset as usize;
        let dst = section.rva as usize;
        let len = section.raw_size as usize;
        basefile[dst..dst + len].copy_from_slice(&bytes[src..src + len]);
    }

    pe.size = size;
    debug!("mapped PE into {size:#x} byte basefile");

    xenonify_iats(&mut basefile, pe)?;
    Ok(basefile)
}

/// Rewrites every IAT entry from the PE ordinal form into the XEX form:
/// ordinal flag stripped, owning module index in bits 16..24, stored
/// big-endian. RVA equals offset here, so the tables are patched in place.
fn xenonify_iats(basefile: &mut [u8], pe: &PeImage) -> error::Result<()> {
    for (index, table) in pe.import_info.tables.iter().enumerate() {
        for slot in 0..table.imports.len() {
            let offset = table.iat_rva as usize + slot * 4;
            let entry: u32 = basefile.pread_with(offset, scroll::LE)?;
            let entry = (entry & !PE_IMPORT_ORDINAL_FLAG) | ((index as u32 & 0xff) << 16);
            basefile.pwrite_with(entry, offset, scroll::BE)?;
        }

        debug!(
            "xenonified {} IAT entries for module {}",
            table.imports.len(),
            index
        );
    }

    Ok(())
}
