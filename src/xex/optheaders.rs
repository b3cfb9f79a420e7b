//! The optional headers: basefile format, entrypoint, import libraries, TLS
//! info, and system flags. Import libraries carry their own SHA-1 chain.

use crate::error::{self, Error};
use crate::pe::PeImage;
use crate::pe::import::ImportInfo;
use crate::xex::header::{
    OptHeaderEntry, XEX_OPT_ID_BASEFILE_FORMAT, XEX_OPT_ID_ENTRYPOINT, XEX_OPT_ID_IMPORT_LIBS,
    XEX_OPT_ID_SYS_FLAGS, XEX_OPT_ID_TLS_INFO,
};
use crate::xex::placer::next_aligned;
use crate::xex::security::SecurityInfoHeader;
use log::debug;
use sha1::{Digest, Sha1};

pub const XEX_SYS_GAMEPAD_DISCONNECT: u32 = 0x0000_0020;
pub const XEX_SYS_INSECURE_SOCKETS: u32 = 0x0000_0040;
pub const XEX_SYS_XAM_HOOKS: u32 = 0x0000_1000;
pub const XEX_SYS_BACKGROUND_DL: u32 = 0x0008_0000;
pub const XEX_SYS_ALLOW_CONTROL_SWAP: u32 = 0x4000_0000;

/// On-disk size of the basefile-format header
pub const SIZEOF_BASEFILE_FORMAT: u32 = 16;
/// On-disk size of the TLS info header
pub const SIZEOF_TLS_INFO: u32 = 16;
/// On-disk size of the import-libraries header before the name table
pub const SIZEOF_IMPORT_LIBRARIES_HEADER: u32 = 12;
/// On-disk size of one import table before its address list
pub const SIZEOF_IMPORT_TABLE_HEADER: u32 = 40;

/// Major version every import library is stamped with
const IMPORT_VERSION_MAJOR: u32 = 2;
const IMPORT_VERSION_MINOR: u32 = 0;

/// System flags granted to every output.
pub fn system_flags() -> u32 {
    XEX_SYS_GAMEPAD_DISCONNECT
        | XEX_SYS_INSECURE_SOCKETS
        | XEX_SYS_XAM_HOOKS
        | XEX_SYS_BACKGROUND_DL
        | XEX_SYS_ALLOW_CONTROL_SWAP
}

/// Describes how the basefile is stored: unencrypted and uncompressed, one
/// raw-data block covering the whole image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasefileFormat {
    pub size: u32,
    pub enc_type: u16,
    pub comp_type: u16,
    pub data_size: u32,
    pub zero_size: u32,
}

impl BasefileFormat {
    pub fn new(pe_size: u32) -> Self {
        BasefileFormat {
            // one raw-data descriptor plus the data descriptor itself
            size: 8 + 8,
            enc_type: 0x0,
            comp_type: 0x1,
            data_size: pe_size,
            zero_size: 0x0,
        }
    }
}

impl Default for BasefileFormat {
    fn default() -> Self {
        BasefileFormat::new(0)
    }
}

/// TLS info stub: the loader wants the slot count, everything else is zero
/// because we never emit TLS data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TlsInfo {
    pub slot_count: u32,
    pub raw_data_addr: u32,
    pub data_size: u32,
    pub raw_data_size: u32,
}

impl TlsInfo {
    pub fn new() -> Self {
        TlsInfo {
            slot_count: 0x40,
            raw_data_addr: 0x0,
            data_size: 0x0,
            raw_data_size: 0x0,
        }
    }
}

impl Default for TlsInfo {
    fn default() -> Self {
        TlsInfo::new()
    }
}

/// One per imported library: versions, the loader's per-library constant,
/// and the interleaved IAT / branch-stub addresses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XexImportTable {
    pub size: u32,
    /// Digest of the next table in the chain, zero for the last
    pub sha1: [u8; 20],
    pub unknown: u32,
    pub target_ver: u32,
    pub minimum_ver: u32,
    pub padding: u8,
    pub table_index: u8,
    pub address_count: u16,
    pub addresses: Vec<u32>,
}

impl XexImportTable {
    /// The table in its on-disk big-endian form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size as usize);
        bytes.extend_from_slice(&self.size.to_be_bytes());
        bytes.extend_from_slice(&self.sha1);
        bytes.extend_from_slice(&self.unknown.to_be_bytes());
        bytes.extend_from_slice(&self.target_ver.to_be_bytes());
        bytes.extend_from_slice(&self.minimum_ver.to_be_bytes());
        bytes.push(self.padding);
        bytes.push(self.table_index);
        bytes.extend_from_slice(&self.address_count.to_be_bytes());

        for address in &self.addresses {
            bytes.extend_from_slice(&address.to_be_bytes());
        }

        bytes
    }

    /// Digest over the on-disk form minus the leading size field.
    fn digest(&self) -> [u8; 20] {
        let mut sha = Sha1::new();
        sha.update(&self.to_bytes()[4..]);
        sha.finalize().into()
    }
}

/// The import-libraries optional header: a shared name table followed by one
/// table per library.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportLibraries {
    pub size: u32,
    pub name_table_size: u32,
    pub table_count: u32,
    pub name_table: Vec<u8>,
    pub tables: Vec<XexImportTable>,
}

impl ImportLibraries {
    /// Builds the header from the extracted imports, chaining the table
    /// hashes from the last table back to the first and storing the chain
    /// root plus the table count in the security info.
    pub fn new(info: &ImportInfo, sec: &mut SecurityInfoHeader) -> error::Result<Self> {
        let table_count = info.tables.len();
        sec.import_table_count = table_count as u32;

        let mut names = Vec::with_capacity(table_count);
        let mut tables = Vec::with_capacity(table_count);

        for (index, pe_table) in info.tables.iter().enumerate() {
            let (name, target_ver, minimum_ver) = parse_versioned_name(&pe_table.name)?;

            let unknown = loader_constant(name).ok_or_else(|| {
                Error::UnsupportedStructure(format!(
                    "import library {name:?} has no known loader constant"
                ))
            })?;

            // An IAT address per import, a stub address per located stub
            let mut addresses =
                Vec::with_capacity(pe_table.imports.len() + pe_table.branch_stub_count());

            for import in &pe_table.imports {
                addresses.push(import.iat_addr);

                if import.branch_stub_addr != 0 {
                    addresses.push(import.branch_stub_addr);
                }
            }

            let address_count =
                u16::try_from(addresses.len()).map_err(|_| Error::DataOverflow(addresses.len()))?;
            let table_index = u8::try_from(index).map_err(|_| Error::DataOverflow(index))?;

            tables.push(XexImportTable {
                size: SIZEOF_IMPORT_TABLE_HEADER + addresses.len() as u32 * 4,
                sha1: [0; 20],
                unknown,
                target_ver,
                minimum_ver,
                padding: 0,
                table_index,
                address_count,
                addresses,
            });
            names.push(name);
        }

        // Chain back to front: each digest covers the table including the
        // digest of the one after it, and the front digest is the root
        for i in (0..table_count).rev() {
            let digest = tables[i].digest();

            if i > 0 {
                tables[i - 1].sha1 = digest;
            } else {
                sec.import_table_sha1 = digest;
            }
        }

        // Name table: NUL-terminated names, each slot padded to 4 bytes
        let mut name_table_size = 0u32;
        let mut name_offsets = Vec::with_capacity(table_count);

        for name in &names {
            name_offsets.push(name_table_size as usize);
            name_table_size += next_aligned(name.len() as u32 + 1, 4);
        }

        let mut name_table = vec![0u8; name_table_size as usize];

        for (name, offset) in names.iter().zip(&name_offsets) {
            name_table[*offset..*offset + name.len()].copy_from_slice(name.as_bytes());
        }

        let size = SIZEOF_IMPORT_LIBRARIES_HEADER
            + name_table_size
            + tables.iter().map(|table| table.size).sum::<u32>();

        debug!(
            "import libraries: {table_count} tables, {name_table_size} bytes of names, {size} bytes total"
        );

        Ok(ImportLibraries {
            size,
            name_table_size,
            table_count: table_count as u32,
            name_table,
            tables,
        })
    }
}

/// The loader constant tied to each importable executable. The origin of
/// these values is not understood, so nothing beyond the known three is
/// accepted.
fn loader_constant(name: &str) -> Option<u32> {
    match name {
        "xboxkrnl.exe" => Some(0x45dc_17e0),
        "xam.xex" => Some(0xfca1_5c76),
        "xbdm.xex" => Some(0xeceb_8109),
        _ => None,
    }
}

/// Splits `name@build.hotfix+build.hotfix` into the bare library name, the
/// packed target version, and the packed minimum version.
fn parse_versioned_name(full: &str) -> error::Result<(&str, u32, u32)> {
    let invalid = || Error::InvalidImportName(full.to_string());

    let (name, versions) = full.split_once('@').ok_or_else(invalid)?;

    if name.is_empty() {
        return Err(invalid());
    }

    let (target, minimum) = versions.split_once('+').ok_or_else(invalid)?;
    let target_ver = parse_version(target).ok_or_else(invalid)?;
    let minimum_ver = parse_version(minimum).ok_or_else(invalid)?;

    Ok((name, target_ver, minimum_ver))
}

/// Packs `build.hotfix` as `major(4) | minor(4) | build(16) | hotfix(8)`
/// with the fixed major and minor.
fn parse_version(version: &str) -> Option<u32> {
    let (build, hotfix) = version.split_once('.')?;
    let build: u16 = build.parse().ok()?;
    let hotfix: u8 = hotfix.parse().ok()?;

    Some(
        (IMPORT_VERSION_MAJOR & 0xf) << 28
            | (IMPORT_VERSION_MINOR & 0xf) << 24
            | (build as u32) << 8
            | hotfix as u32,
    )
}

/// The bodies of the optional headers that have one; entrypoint and system
/// flags live inline in their entries.
#[derive(Debug, Clone, Default)]
pub struct OptionalHeaders {
    pub basefile_format: BasefileFormat,
    pub import_libraries: Option<ImportLibraries>,
    pub tls_info: TlsInfo,
}

/// Assembles the optional headers and their entry table. Entries are pushed
/// in ascending ID order; the loader rejects the XEX otherwise.
pub fn build(
    sec: &mut SecurityInfoHeader,
    pe: &PeImage,
) -> error::Result<(Vec<OptHeaderEntry>, OptionalHeaders)> {
    let imports_present = pe.import_info.total_import_count() > 0;
    let mut entries = Vec::with_capacity(4 + usize::from(imports_present));

    entries.push(OptHeaderEntry {
        id: XEX_OPT_ID_BASEFILE_FORMAT,
        data_or_offset: 0, // patched by the placer
    });

    entries.push(OptHeaderEntry {
        id: XEX_OPT_ID_ENTRYPOINT,
        data_or_offset: sec.base_addr + pe.entry_point_rva,
    });

    let import_libraries = if imports_present {
        entries.push(OptHeaderEntry {
            id: XEX_OPT_ID_IMPORT_LIBS,
            data_or_offset: 0, // patched by the placer
        });
        Some(ImportLibraries::new(&pe.import_info, sec)?)
    } else {
        None
    };

    entries.push(OptHeaderEntry {
        id: XEX_OPT_ID_TLS_INFO,
        data_or_offset: 0, // patched by the placer
    });

    entries.push(OptHeaderEntry {
        id: XEX_OPT_ID_SYS_FLAGS,
        data_or_offset: system_flags(),
    });

    let headers = OptionalHeaders {
        basefile_format: BasefileFormat::new(sec.pe_size),
        import_libraries,
        tls_info: TlsInfo::new(),
    };

    Ok((entries, headers))
}
