//! Emits the assembled XEX: headers are laid out big-endian in one buffer,
//! the basefile is streamed in after them.

use crate::error;
use crate::xex::header::{OptHeaderEntry, XEX2_MAGIC, XexHeader};
use crate::xex::optheaders::{BasefileFormat, ImportLibraries, OptionalHeaders, TlsInfo};
use crate::xex::placer::Offsets;
use crate::xex::security::SecurityInfoHeader;
use log::debug;
use scroll::{BE, Pwrite};
use std::io::{Read, Write};

/// Streaming copy granularity for the basefile
const COPY_CHUNK: usize = 0x1000;

/// Writes the whole container: every header structure at its placed offset,
/// then `pe_size` bytes of basefile. The headers hash is still zero
/// afterwards; the read-back pass fills it in.
pub fn write_xex(
    xex: &mut impl Write,
    basefile: &mut impl Read,
    header: &XexHeader,
    entries: &[OptHeaderEntry],
    sec: &SecurityInfoHeader,
    headers: &OptionalHeaders,
    offsets: &Offsets,
) -> error::Result<()> {
    // Everything before the basefile fits in one buffer; byte order is
    // converted at the moment each field lands in it
    let mut buffer = vec![0u8; offsets.basefile as usize];

    write_xex_header(&mut buffer, header, offsets)?;
    write_entries(&mut buffer, entries, offsets)?;
    write_security_info(&mut buffer, sec, offsets)?;
    write_basefile_format(&mut buffer, &headers.basefile_format, offsets)?;

    if let Some(libs) = &headers.import_libraries {
        write_import_libraries(&mut buffer, libs, offsets)?;
    }

    write_tls_info(&mut buffer, &headers.tls_info, offsets)?;

    xex.write_all(&buffer)?;
    debug!("wrote {:#x} bytes of headers", buffer.len());

    // Stream the basefile in fixed-size chunks to bound memory use
    let mut chunk = [0u8; COPY_CHUNK];
    let mut remaining = sec.pe_size as usize;

    while remaining > 0 {
        let len = remaining.min(COPY_CHUNK);
        basefile.read_exact(&mut chunk[..len])?;
        xex.write_all(&chunk[..len])?;
        remaining -= len;
    }

    xex.flush()?;
    debug!("streamed {:#x} bytes of basefile", sec.pe_size);
    Ok(())
}

fn write_xex_header(
    buffer: &mut [u8],
    header: &XexHeader,
    offsets: &Offsets,
) -> error::Result<()> {
    let offset = &mut (offsets.xex_header as usize);

    buffer.gwrite_with::<&[u8]>(XEX2_MAGIC, offset, ())?;
    buffer.gwrite_with(header.module_flags, offset, BE)?;
    buffer.gwrite_with(header.pe_offset, offset, BE)?;
    buffer.gwrite_with(0u32, offset, BE)?; // reserved
    buffer.gwrite_with(header.sec_info_offset, offset, BE)?;
    buffer.gwrite_with(header.opt_header_count, offset, BE)?;
    Ok(())
}

fn write_entries(
    buffer: &mut [u8],
    entries: &[OptHeaderEntry],
    offsets: &Offsets,
) -> error::Result<()> {
    let offset = &mut (offsets.opt_header_entries as usize);

    for entry in entries {
        buffer.gwrite_with(entry.id, offset, BE)?;
        buffer.gwrite_with(entry.data_or_offset, offset, BE)?;
    }

    Ok(())
}

fn write_security_info(
    buffer: &mut [u8],
    sec: &SecurityInfoHeader,
    offsets: &Offsets,
) -> error::Result<()> {
    let offset = &mut (offsets.sec_info as usize);

    buffer.gwrite_with(sec.header_size, offset, BE)?;
    buffer.gwrite_with(sec.pe_size, offset, BE)?;
    buffer.gwrite_with::<&[u8]>(&sec.signature, offset, ())?;
    buffer.gwrite_with(sec.image_info_size, offset, BE)?;
    buffer.gwrite_with(sec.image_flags, offset, BE)?;
    buffer.gwrite_with(sec.base_addr, offset, BE)?;
    buffer.gwrite_with::<&[u8]>(&sec.image_sha1, offset, ())?;
    buffer.gwrite_with(sec.import_table_count, offset, BE)?;
    buffer.gwrite_with::<&[u8]>(&sec.import_table_sha1, offset, ())?;
    buffer.gwrite_with::<&[u8]>(&sec.media_id, offset, ())?;
    buffer.gwrite_with::<&[u8]>(&sec.aes_key, offset, ())?;
    buffer.gwrite_with(sec.export_table_addr, offset, BE)?;
    buffer.gwrite_with::<&[u8]>(&sec.headers_hash, offset, ())?;
    buffer.gwrite_with(sec.game_region, offset, BE)?;
    buffer.gwrite_with(sec.media_types, offset, BE)?;
    buffer.gwrite_with(sec.page_desc_count, offset, BE)?;

    // The descriptor array follows the fixed part directly
    for descriptor in &sec.descriptors {
        buffer.gwrite_with(descriptor.size_and_info, offset, BE)?;
        buffer.gwrite_with::<&[u8]>(&descriptor.sha1, offset, ())?;
    }

    Ok(())
}

fn write_basefile_format(
    buffer: &mut [u8],
    format: &BasefileFormat,
    offsets: &Offsets,
) -> error::Result<()> {
    let offset = &mut (offsets.basefile_format as usize);

    buffer.gwrite_with(format.size, offset, BE)?;
    buffer.gwrite_with(format.enc_type, offset, BE)?;
    buffer.gwrite_with(format.comp_type, offset, BE)?;
    buffer.gwrite_with(format.data_size, offset, BE)?;
    buffer.gwrite_with(format.zero_size, offset, BE)?;
    Ok(())
}

fn write_import_libraries(
    buffer: &mut [u8],
    libs: &ImportLibraries,
    offsets: &Offsets,
) -> error::Result<()> {
    let offset = &mut (offsets.import_libraries as usize);

    buffer.gwrite_with(libs.size, offset, BE)?;
    buffer.gwrite_with(libs.name_table_size, offset, BE)?;
    buffer.gwrite_with(libs.table_count, offset, BE)?;
    buffer.gwrite_with::<&[u8]>(&libs.name_table, offset, ())?;

    for table in &libs.tables {
        buffer.gwrite_with::<&[u8]>(&table.to_bytes(), offset, ())?;
    }

    Ok(())
}

fn write_tls_info(buffer: &mut [u8], tls: &TlsInfo, offsets: &Offsets) -> error::Result<()> {
    let offset = &mut (offsets.tls_info as usize);

    buffer.gwrite_with(tls.slot_count, offset, BE)?;
    buffer.gwrite_with(tls.raw_data_addr, offset, BE)?;
    buffer.gwrite_with(tls.data_size, offset, BE)?;
    buffer.gwrite_with(tls.raw_data_size, offset, BE)?;
    Ok(())
}
