//! The final pass: hash the finished headers and patch the digest in.
//!
//! The header hash covers bytes that only exist once everything else has
//! been written, so it reads the output back rather than predicting it.

use crate::error;
use crate::xex::security::{HEADERS_HASH_OFFSET, IMAGE_INFO_OFFSET, IMAGE_INFO_SIZE};
use log::debug;
use sha1::{Digest, Sha1};
use std::io::{Read, Seek, SeekFrom, Write};

/// Offset of the basefile offset inside the XEX header
const PE_OFFSET_FIELD: u64 = 0x8;
/// Offset of the security info offset inside the XEX header
const SEC_INFO_OFFSET_FIELD: u64 = 0x10;

fn read_u32_be(xex: &mut (impl Read + Seek), offset: u64) -> error::Result<u32> {
    let mut bytes = [0u8; 4];
    xex.seek(SeekFrom::Start(offset))?;
    xex.read_exact(&mut bytes)?;
    Ok(u32::from_be_bytes(bytes))
}

/// Reads the freshly written XEX back, hashes the header range in its two
/// segments (everything after the image info up to the basefile, then the
/// start of the file up to the image info), and writes the digest into the
/// security info header.
pub fn write_header_hash(xex: &mut (impl Read + Write + Seek)) -> error::Result<()> {
    let pe_offset = read_u32_be(xex, PE_OFFSET_FIELD)?;
    let sec_info_offset = read_u32_be(xex, SEC_INFO_OFFSET_FIELD)?;

    let end_of_image_info = sec_info_offset + IMAGE_INFO_OFFSET + IMAGE_INFO_SIZE;

    let mut remainder = vec![0u8; (pe_offset - end_of_image_info) as usize];
    xex.seek(SeekFrom::Start(end_of_image_info as u64))?;
    xex.read_exact(&mut remainder)?;

    let mut sha = Sha1::new();
    sha.update(&remainder);

    let mut start = vec![0u8; (sec_info_offset + IMAGE_INFO_OFFSET) as usize];
    xex.seek(SeekFrom::Start(0))?;
    xex.read_exact(&mut start)?;
    sha.update(&start);

    let digest = sha.finalize();

    xex.seek(SeekFrom::Start((sec_info_offset + HEADERS_HASH_OFFSET) as u64))?;
    xex.write_all(&digest)?;
    xex.flush()?;

    debug!(
        "header hash over [{end_of_image_info:#x}, {pe_offset:#x}) then [0, {:#x})",
        sec_info_offset + IMAGE_INFO_OFFSET
    );
    Ok(())
}
