//! Converts an Xbox 360 PE image into an XEX2 container the platform loader
//! accepts.
//!
//! The input is an unencrypted, uncompressed PE/COFF file built for the XBOX
//! subsystem on big-endian 32-bit PowerPC. The output is a signed-format XEX
//! whose headers describe the basefile layout, page permissions, import
//! bindings, region, media and system flags, entrypoint, and TLS
//! configuration, with a SHA-1 chain over every page of the image and every
//! import table. There is no encryption (the AES key is zero) and no code
//! signing; the signature field carries a human-readable version tag.
//!
//! The pipeline runs strictly forward:
//!
//! ```text
//! validate → extract headers → parse sections → extract imports
//!          → map basefile → security info → optional headers
//!          → place → write → header hash
//! ```
//!
//! Nothing downstream of the mapper re-reads the PE; later stages read the
//! basefile. Use [`synthesize`] to run the whole pipeline over files, or the
//! [`pe`], [`basefile`], and [`xex`] modules to drive the stages directly.

pub mod basefile;
pub mod error;
pub mod pe;
pub mod xex;

pub use crate::error::{Error, Result};
pub use crate::pe::{ParseOptions, PeImage};
pub use crate::xex::security::VERSION_TAG;

use log::info;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// Conversion switches, all off by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Accept PEs with a non-PowerPC machine ID
    pub skip_machine_check: bool,
    /// Module flags to use instead of deriving them from the PE
    pub module_flags: Option<u32>,
}

/// The basefile is kept next to the output as a normal artifact of the run.
pub fn basefile_path(xex_path: &Path) -> PathBuf {
    let mut path = OsString::from(xex_path.as_os_str());
    path.push(".basefile");
    PathBuf::from(path)
}

/// Runs the whole pipeline: reads the PE at `pe_path` and writes the XEX to
/// `xex_path`, leaving the intermediate basefile at `<xex_path>.basefile`.
pub fn synthesize(pe_path: &Path, xex_path: &Path, opts: &BuildOptions) -> Result<()> {
    let pe_bytes = fs::read(pe_path)?;

    info!("validating PE and retrieving header data");
    let parse_opts = ParseOptions {
        skip_machine_check: opts.skip_machine_check,
    };
    let mut pe = PeImage::parse(&pe_bytes, &parse_opts)?;
    info!(
        "got {} sections and {} imports from PE",
        pe.section_count,
        pe.import_info.total_import_count()
    );

    info!("creating basefile from PE");
    let basefile_bytes = basefile::map(&pe_bytes, &mut pe)?;
    let basefile_path = basefile_path(xex_path);
    fs::write(&basefile_path, &basefile_bytes)?;

    info!("building security header and page descriptors");
    let mut sec = xex::security::SecurityInfoHeader::new(&pe);
    sec.set_page_descriptors(&basefile_bytes, &pe.sections)?;

    info!("building optional headers");
    let (mut entries, headers) = xex::optheaders::build(&mut sec, &pe)?;

    let mut xex_header = xex::header::XexHeader {
        module_flags: opts
            .module_flags
            .unwrap_or_else(|| xex::header::module_flags(&pe)),
        pe_offset: 0,
        sec_info_offset: 0,
        opt_header_count: entries.len() as u32,
    };

    info!("aligning data");
    let offsets = xex::placer::place(&mut xex_header, &mut entries, &sec, &headers)?;

    info!("writing XEX");
    let mut xex_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(xex_path)?;
    let mut basefile_file = fs::File::open(&basefile_path)?;

    xex::writer::write_xex(
        &mut xex_file,
        &mut basefile_file,
        &xex_header,
        &entries,
        &sec,
        &headers,
        &offsets,
    )?;

    info!("calculating and writing header SHA-1");
    xex::hash::write_header_hash(&mut xex_file)?;

    info!("XEX built");
    Ok(())
}
