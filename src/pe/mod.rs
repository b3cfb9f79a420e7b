//! Parsing of the input PE: validation, header extraction, the section
//! table, and import discovery.

pub mod header;
pub mod import;
pub mod section;

use crate::error;
use log::debug;

/// Parse-time knobs, mirroring the converter's CLI switches.
#[derive(Debug, Copy, Clone, Default)]
pub struct ParseOptions {
    /// Accept PEs whose COFF machine ID is not POWERPCBE. The subsystem and
    /// alignment checks still apply.
    pub skip_machine_check: bool,
}

/// An analyzed Xbox 360 PE image. Created once by [`PeImage::parse`],
/// read-only afterwards except for [`size`](Self::size), which the basefile
/// mapper updates to the padded image length.
#[derive(Debug, Clone, Default)]
pub struct PeImage {
    /// Input file size, replaced by the basefile size after mapping
    pub size: u32,
    /// Preferred load address of the image
    pub base_addr: u32,
    pub entry_point_rva: u32,
    pub pe_header_offset: u32,
    pub section_count: u16,
    pub section_table_size: u32,
    /// End of the optional header (with the legacy one-byte slack)
    pub header_size: u32,
    /// Page size, 4 KiB or 64 KiB, from the PE section alignment
    pub page_size: u32,
    /// COFF characteristics; the DLL bit feeds the module-flag heuristic
    pub characteristics: u16,
    pub sections: Vec<section::Section>,
    pub import_info: import::ImportInfo,
    /// Whether the PE carries an export directory
    pub export_present: bool,
}

impl PeImage {
    /// Validates `bytes` as an Xbox 360 PE and extracts everything the XEX
    /// side needs: header fields, sections, imports, and branch stubs.
    pub fn parse(bytes: &[u8], opts: &ParseOptions) -> error::Result<Self> {
        header::validate(bytes, opts.skip_machine_check)?;

        let data = header::extract(bytes, 0)?;

        let mut sections = Vec::with_capacity(data.section_count as usize);
        let offset = &mut ((data.header_size - 1) as usize);

        for i in 0..data.section_count as usize {
            let section = section::Section::parse(bytes, offset, i)?;
            debug!("({}) {:x?}", i, section);
            sections.push(section);
        }

        let import_info =
            import::ImportInfo::parse(bytes, data.idt_rva, data.base_addr, &sections)?;

        Ok(PeImage {
            size: bytes.len() as u32,
            base_addr: data.base_addr,
            entry_point_rva: data.entry_point_rva,
            pe_header_offset: data.pe_header_offset,
            section_count: data.section_count,
            section_table_size: data.section_table_size,
            header_size: data.header_size,
            page_size: data.page_size,
            characteristics: data.characteristics,
            sections,
            import_info,
            export_present: data.export_present,
        })
    }
}
