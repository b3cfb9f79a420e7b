//! Import extraction: walks the import directory table, reads every import
//! address table, and locates the PowerPC branch stubs that call through it.

use crate::error::{self, Error};
use crate::pe::section::{self, Section};
use log::debug;
use scroll::Pread;

/// Top bit of an IAT entry: import by ordinal. The only kind we accept.
pub const PE_IMPORT_ORDINAL_FLAG: u32 = 0x8000_0000;
/// Size of one import directory record
pub const SIZEOF_IMPORT_DIRECTORY_ENTRY: usize = 20;

/// `bctr`, the tail of every branch stub
const BCTR: u32 = 0x4e80_0420;
/// `mtctr rX` with the register field zeroed
const MTCTR: u32 = 0x7c09_03a6;
/// Opcode bits of `lis rX, hi` (`addis` with rA = 0)
const LIS: u32 = 0x3c00_0000;
/// Opcode plus rA mask for `lis`; rA must be zero for the absolute-load form
const LIS_MASK: u32 = 0xfc1f_0000;
/// Opcode bits of `lwz rX, lo(rY)`
const LWZ: u32 = 0x8000_0000;
const OPCODE_MASK: u32 = 0xfc00_0000;

/// One import directory record, straight off the disk.
#[derive(Debug, Copy, Clone, Pread)]
struct ImportDirectoryEntry {
    import_lookup_table_rva: u32,
    time_date_stamp: u32,
    forwarder_chain: u32,
    name_rva: u32,
    import_address_table_rva: u32,
}

impl ImportDirectoryEntry {
    /// The directory is terminated by a fully zero record.
    fn is_null(&self) -> bool {
        self.import_lookup_table_rva == 0
            && self.time_date_stamp == 0
            && self.forwarder_chain == 0
            && self.name_rva == 0
            && self.import_address_table_rva == 0
    }
}

/// One imported symbol: the absolute address of its IAT slot, and of the
/// branch stub calling through that slot once the scan has located it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Import {
    pub iat_addr: u32,
    /// Zero until a branch stub loading `iat_addr` is found
    pub branch_stub_addr: u32,
}

/// All imports pulled from one library.
#[derive(Debug, Clone, Default)]
pub struct ImportTable {
    /// The versioned library name, e.g. `xboxkrnl.exe@1888.0+1888.0`
    pub name: String,
    /// RVA of this library's IAT
    pub iat_rva: u32,
    pub imports: Vec<Import>,
}

impl ImportTable {
    pub fn branch_stub_count(&self) -> usize {
        self.imports
            .iter()
            .filter(|import| import.branch_stub_addr != 0)
            .count()
    }
}

/// Everything the XEX side needs to know about the PE's imports.
#[derive(Debug, Clone, Default)]
pub struct ImportInfo {
    /// RVA of the import directory table, zero if the PE imports nothing
    pub idt_rva: u32,
    pub tables: Vec<ImportTable>,
}

impl ImportInfo {
    pub fn total_import_count(&self) -> usize {
        self.tables.iter().map(|table| table.imports.len()).sum()
    }

    pub fn total_branch_stub_count(&self) -> usize {
        self.tables.iter().map(ImportTable::branch_stub_count).sum()
    }

    /// Walks the IDT and every IAT it references, then scans the code
    /// sections for branch stubs. `base_addr` turns RVAs into the absolute
    /// addresses the XEX import tables carry.
    pub fn parse(
        bytes: &[u8],
        idt_rva: u32,
        base_addr: u32,
        sections: &[Section],
    ) -> error::Result<Self> {
        let mut info = ImportInfo {
            idt_rva,
            tables: Vec::new(),
        };

        if idt_rva == 0 {
            return Ok(info);
        }

        let idt_offset = section::rva_to_offset(idt_rva, sections)
            .ok_or(Error::InvalidRvaOrOffset(idt_rva))?;
        let mut offset = idt_offset as usize;

        loop {
            let entry: ImportDirectoryEntry = bytes.gread_with(&mut offset, scroll::LE)?;

            if entry.is_null() {
                break;
            }

            let table = parse_table(bytes, &entry, base_addr, sections)?;
            debug!(
                "import table {:?}: {} imports, IAT at rva {:#x}",
                table.name,
                table.imports.len(),
                table.iat_rva
            );
            info.tables.push(table);
        }

        locate_branch_stubs(bytes, base_addr, sections, &mut info)?;
        Ok(info)
    }
}

fn parse_table(
    bytes: &[u8],
    entry: &ImportDirectoryEntry,
    base_addr: u32,
    sections: &[Section],
) -> error::Result<ImportTable> {
    let name_offset = section::rva_to_offset(entry.name_rva, sections)
        .ok_or(Error::InvalidRvaOrOffset(entry.name_rva))?;
    let name: &str = bytes.pread(name_offset as usize)?;

    let iat_rva = entry.import_address_table_rva;
    let iat_offset =
        section::rva_to_offset(iat_rva, sections).ok_or(Error::InvalidRvaOrOffset(iat_rva))?;

    let mut imports = Vec::new();
    let mut offset = iat_offset as usize;

    loop {
        let entry_offset = offset as u32;
        let slot: u32 = bytes.gread_with(&mut offset, scroll::LE)?;

        if slot == 0 {
            break;
        }

        // Import by name has the top bit clear; the XEX form cannot express it
        if slot & PE_IMPORT_ORDINAL_FLAG == 0 {
            return Err(Error::UnsupportedStructure(format!(
                "import by name in IAT at rva {iat_rva:#x}"
            )));
        }

        let rva = section::offset_to_rva(entry_offset, sections)
            .ok_or(Error::InvalidRvaOrOffset(entry_offset))?;

        imports.push(Import {
            iat_addr: base_addr + rva,
            branch_stub_addr: 0,
        });
    }

    Ok(ImportTable {
        name: name.to_string(),
        iat_rva,
        imports,
    })
}

/// Matches the four-instruction absolute-load prologue
///
/// ```text
/// lis   rX, hi(addr)
/// lwz   rX, lo(addr)(rX)
/// mtctr rX
/// bctr
/// ```
///
/// and reconstructs the loaded address.
fn match_branch_stub(words: [u32; 4]) -> Option<u32> {
    if words[0] & LIS_MASK != LIS {
        return None;
    }

    let reg = (words[0] >> 21) & 0x1f;
    let hi = words[0] & 0xffff;

    if words[1] & OPCODE_MASK != LWZ
        || (words[1] >> 21) & 0x1f != reg
        || (words[1] >> 16) & 0x1f != reg
    {
        return None;
    }

    let lo = words[1] & 0xffff;

    if words[2] != MTCTR | (reg << 21) {
        return None;
    }

    if words[3] != BCTR {
        return None;
    }

    Some((hi << 16) | lo)
}

/// Scans every code section for branch stubs and attaches each one to the
/// import whose IAT slot it loads. Stops as soon as every import has a stub;
/// leftover imports are data imports and legitimately have none.
fn locate_branch_stubs(
    bytes: &[u8],
    base_addr: u32,
    sections: &[Section],
    info: &mut ImportInfo,
) -> error::Result<()> {
    let total_imports = info.total_import_count();
    let mut found = info.total_branch_stub_count();

    for section in sections.iter().filter(|section| section.is_code()) {
        let start = section.raw_offset as usize;
        let end = start + section.raw_size as usize;
        let mut offset = start;

        // Instructions are 4-byte aligned, stubs need not be 16-byte aligned
        while offset + 16 <= end && found < total_imports {
            let words = [
                bytes.pread_with::<u32>(offset, scroll::BE)?,
                bytes.pread_with::<u32>(offset + 4, scroll::BE)?,
                bytes.pread_with::<u32>(offset + 8, scroll::BE)?,
                bytes.pread_with::<u32>(offset + 12, scroll::BE)?,
            ];

            let Some(addr) = match_branch_stub(words) else {
                offset += 4;
                continue;
            };

            let claimed = info.tables.iter_mut().flat_map(|table| &mut table.imports).find(
                |import| import.iat_addr == addr && import.branch_stub_addr == 0,
            );

            if let Some(import) = claimed {
                let stub_rva = section::offset_to_rva(offset as u32, sections)
                    .ok_or(Error::InvalidRvaOrOffset(offset as u32))?;
                import.branch_stub_addr = base_addr + stub_rva;
                found += 1;
                debug!(
                    "branch stub at {:#x} claims IAT slot {:#x}",
                    import.branch_stub_addr, addr
                );
                offset += 16;
            } else {
                offset += 4;
            }
        }
    }

    Ok(())
}
