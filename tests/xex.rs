//! End-to-end runs of the whole pipeline over synthetic Xbox 360 PEs.

mod common;

use common::{IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, ImportSpec, PeBuilder, branch_stub};
use sha1::{Digest, Sha1};
use std::fs;
use synthxex::{BuildOptions, Error, basefile_path, synthesize};

const KRNL: &str = "xboxkrnl.exe@1888.0+1888.0";

fn be16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(bytes[offset..offset + 2].try_into().unwrap())
}

fn be32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

/// Runs the converter over `pe` and returns the XEX and basefile images.
fn run(pe: Vec<u8>, opts: &BuildOptions) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let dir = tempfile::tempdir().unwrap();
    let pe_path = dir.path().join("input.pe");
    let xex_path = dir.path().join("output.xex");
    fs::write(&pe_path, pe).unwrap();

    synthesize(&pe_path, &xex_path, opts)?;

    let xex = fs::read(&xex_path).unwrap();
    let basefile = fs::read(basefile_path(&xex_path)).unwrap();
    Ok((xex, basefile))
}

fn run_ok(pe: Vec<u8>) -> (Vec<u8>, Vec<u8>) {
    run(pe, &BuildOptions::default()).unwrap()
}

/// Collects the optional-header entry table as (id, value) pairs.
fn entries(xex: &[u8]) -> Vec<(u32, u32)> {
    let count = be32(xex, 20) as usize;
    (0..count)
        .map(|i| (be32(xex, 24 + i * 8), be32(xex, 24 + i * 8 + 4)))
        .collect()
}

fn entry_value(xex: &[u8], id: u32) -> Option<u32> {
    entries(xex)
        .into_iter()
        .find(|(entry_id, _)| *entry_id == id)
        .map(|(_, value)| value)
}

fn minimal_title() -> PeBuilder {
    let mut code = vec![0u8; 0x60];

    for chunk in code.chunks_exact_mut(4) {
        chunk.copy_from_slice(&0x6000_0000u32.to_be_bytes()); // nop
    }

    PeBuilder::new().section(
        b".text",
        0x1000,
        code,
        IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
    )
}

#[test]
fn minimal_title_layout_and_page_chain() {
    let (xex, basefile) = run_ok(minimal_title().build());

    assert_eq!(&xex[0..4], b"XEX2");
    assert_eq!(be32(&xex, 4), 0x1); // TITLE
    assert_eq!(be32(&xex, 12), 0); // reserved

    let pe_offset = be32(&xex, 8);
    let sec_info = be32(&xex, 16) as usize;
    assert_eq!(pe_offset % 0x1000, 0);
    assert_eq!(sec_info % 8, 0);
    assert_eq!(be32(&xex, 20), 4); // no imports, no import libs header

    // Security info: sizes, flags, and the signature tag
    let pe_size = be32(&xex, sec_info + 0x4);
    assert_eq!(pe_size, 0x2000); // header page plus one code page
    assert_eq!(basefile.len(), 0x2000);
    assert_eq!(be32(&xex, sec_info), 0x184 + 2 * 24);
    assert_eq!(be32(&xex, sec_info + 0x108), 0x174);
    assert_eq!(be32(&xex, sec_info + 0x10c), 0x3000_0000); // region free, 4 KiB pages
    assert_eq!(be32(&xex, sec_info + 0x110), 0x8200_0000);
    assert_eq!(be32(&xex, sec_info + 0x128), 0); // no import tables
    assert!(xex[sec_info + 0x140..sec_info + 0x160].iter().all(|&b| b == 0)); // media ID, AES key
    assert_eq!(be32(&xex, sec_info + 0x178), 0xffff_ffff);
    assert_eq!(be32(&xex, sec_info + 0x17c), 0xffff_ffff);
    assert!(xex[sec_info + 0x8..sec_info + 0x8 + 8].starts_with(b"SynthXEX"));

    // Page descriptors: read-only header page, then the code page
    assert_eq!(be32(&xex, sec_info + 0x180), 2);
    let descriptors = sec_info + 0x184;
    assert_eq!(be32(&xex, descriptors), 0x13);
    assert_eq!(be32(&xex, descriptors + 24), 0x11);

    // The chain terminates at the last page and roots in the image hash
    let last_link = &xex[descriptors + 24 + 4..descriptors + 48];
    assert_eq!(last_link, &[0u8; 20]);

    let mut sha = Sha1::new();
    sha.update(&basefile[0x1000..0x2000]);
    sha.update(0x11u32.to_be_bytes());
    sha.update([0u8; 20]);
    let code_page_digest = sha.finalize();
    assert_eq!(&xex[descriptors + 4..descriptors + 24], code_page_digest.as_slice());

    let mut sha = Sha1::new();
    sha.update(&basefile[..0x1000]);
    sha.update(0x13u32.to_be_bytes());
    sha.update(code_page_digest);
    assert_eq!(
        &xex[sec_info + 0x114..sec_info + 0x128],
        sha.finalize().as_slice()
    );

    // The basefile is stored verbatim from peOffset
    assert_eq!(&xex[pe_offset as usize..], &basefile[..]);
    assert_eq!(&basefile[0x1000..0x1004], &0x6000_0000u32.to_be_bytes());
}

#[test]
fn minimal_title_optional_headers() {
    let (xex, _) = run_ok(minimal_title().build());

    let ids: Vec<u32> = entries(&xex).iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![0x3ff, 0x10100, 0x20104, 0x30000]);
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

    assert_eq!(entry_value(&xex, 0x10100), Some(0x8200_1000));
    assert_eq!(entry_value(&xex, 0x30000), Some(0x4008_1060));

    // Basefile format: no encryption, no compression, whole image raw
    let format = entry_value(&xex, 0x3ff).unwrap() as usize;
    assert_eq!(format % 8, 0);
    assert_eq!(be32(&xex, format), 16);
    assert_eq!(be16(&xex, format + 4), 0);
    assert_eq!(be16(&xex, format + 6), 1);
    assert_eq!(be32(&xex, format + 8), 0x2000);
    assert_eq!(be32(&xex, format + 12), 0);

    // TLS stub carries the slot count only
    let tls = entry_value(&xex, 0x20104).unwrap() as usize;
    assert_eq!(tls % 8, 0);
    assert_eq!(be32(&xex, tls), 0x40);
    assert!(xex[tls + 4..tls + 16].iter().all(|&b| b == 0));
}

#[test]
fn header_hash_covers_both_segments() {
    let (xex, _) = run_ok(minimal_title().build());

    let pe_offset = be32(&xex, 8) as usize;
    let sec_info = be32(&xex, 16) as usize;
    let end_of_image_info = sec_info + 0x8 + 0x174;

    let mut sha = Sha1::new();
    sha.update(&xex[end_of_image_info..pe_offset]);
    sha.update(&xex[..sec_info + 0x8]);

    assert_eq!(
        &xex[sec_info + 0x164..sec_info + 0x178],
        sha.finalize().as_slice()
    );
}

#[test]
fn region_free_dll_with_exports() {
    let pe = minimal_title()
        .base_addr(0x8210_0000)
        .characteristics(0x2102)
        .export_dir(0x1000)
        .build();
    let (xex, _) = run_ok(pe);

    assert_eq!(be32(&xex, 4), 0xb); // DLL | TITLE | EXPORTS
    let sec_info = be32(&xex, 16) as usize;
    assert_eq!(be32(&xex, sec_info + 0x160), 0); // export table address stays zero
}

#[test]
fn module_type_override_wins() {
    let opts = BuildOptions {
        skip_machine_check: false,
        module_flags: Some(0x2 | 0x8), // sysdll
    };
    let (xex, _) = run(minimal_title().build(), &opts).unwrap();
    assert_eq!(be32(&xex, 4), 0xa);
}

fn imports_pe(ordinals: Vec<u32>, stub_for: Option<usize>) -> (Vec<u8>, ImportSpec) {
    let spec = ImportSpec {
        rva: 0x2000,
        libs: vec![(KRNL, ordinals)],
    };

    let mut code = vec![0u8; 0x10];

    if let Some(slot) = stub_for {
        let target = 0x8200_0000 + spec.iat_rva(0) + slot as u32 * 4;
        code.extend_from_slice(&branch_stub(11, target));
    }

    code.resize(0x60, 0);

    let pe = PeBuilder::new()
        .import_dir(0x2000)
        .section(
            b".text",
            0x1000,
            code,
            IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
        )
        .section(b".rdata", 0x2000, spec.to_bytes(), IMAGE_SCN_MEM_READ)
        .build();

    (pe, spec)
}

#[test]
fn single_kernel_import_by_ordinal() {
    let (pe, spec) = imports_pe(vec![0x8000_0001], None);
    let (xex, _) = run_ok(pe);

    let sec_info = be32(&xex, 16) as usize;
    let pe_offset = be32(&xex, 8);
    assert_eq!(be32(&xex, sec_info + 0x128), 1);
    assert_eq!(be32(&xex, 20), 5);

    // Import libraries body ends exactly where the basefile starts
    let libs = entry_value(&xex, 0x103ff).unwrap();
    let size = be32(&xex, libs as usize);
    assert_eq!(libs + size, pe_offset);

    let libs = libs as usize;
    assert_eq!(be32(&xex, libs + 4), 16); // name table size
    assert_eq!(be32(&xex, libs + 8), 1); // table count
    assert_eq!(&xex[libs + 12..libs + 24], b"xboxkrnl.exe");
    assert_eq!(xex[libs + 24], 0);

    // The single import table
    let table = libs + 12 + 16;
    assert_eq!(be32(&xex, table), 40 + 4);
    assert_eq!(&xex[table + 4..table + 24], &[0u8; 20]); // chain terminator
    assert_eq!(be32(&xex, table + 24), 0x45dc_17e0);
    assert_eq!(be32(&xex, table + 28), 0x2007_6000); // target 2.0.1888.0
    assert_eq!(be32(&xex, table + 32), 0x2007_6000); // minimum 2.0.1888.0
    assert_eq!(xex[table + 36], 0); // padding
    assert_eq!(xex[table + 37], 0); // table index
    assert_eq!(be16(&xex, table + 38), 1);
    assert_eq!(be32(&xex, table + 40), 0x8200_0000 + spec.iat_rva(0));

    // The chain root covers this table, minus its size field
    let mut sha = Sha1::new();
    sha.update(&xex[table + 4..table + 44]);
    assert_eq!(
        &xex[sec_info + 0x12c..sec_info + 0x140],
        sha.finalize().as_slice()
    );

    // The IAT slot in the stored basefile is big-endian, ordinal flag
    // stripped, module index zero
    let slot = (pe_offset + spec.iat_rva(0)) as usize;
    assert_eq!(&xex[slot..slot + 4], &0x0000_0001u32.to_be_bytes());
}

#[test]
fn located_branch_stub_follows_its_slot() {
    let (pe, spec) = imports_pe(vec![0x8000_0001], Some(0));
    let (xex, basefile) = run_ok(pe);

    let libs = entry_value(&xex, 0x103ff).unwrap() as usize;
    let table = libs + 12 + 16;
    assert_eq!(be32(&xex, table), 40 + 8);
    assert_eq!(be16(&xex, table + 38), 2);
    assert_eq!(be32(&xex, table + 40), 0x8200_0000 + spec.iat_rva(0));
    assert_eq!(be32(&xex, table + 44), 0x8200_1010); // the stub, 0x10 into .text

    // Mapping left the slot ordinal-stripped
    let slot = spec.iat_rva(0) as usize;
    assert_eq!(&basefile[slot..slot + 4], &0x0000_0001u32.to_be_bytes());
}

#[test]
fn interleaved_addresses_for_mixed_imports() {
    // Three imports, a stub only for the middle one
    let (pe, spec) = imports_pe(
        vec![0x8000_0001, 0x8000_0002, 0x8000_0003],
        Some(1),
    );
    let (xex, _) = run_ok(pe);

    let libs = entry_value(&xex, 0x103ff).unwrap() as usize;
    let table = libs + 12 + 16;
    let iat = 0x8200_0000 + spec.iat_rva(0);

    assert_eq!(be16(&xex, table + 38), 4);
    let addresses: Vec<u32> = (0..4).map(|i| be32(&xex, table + 40 + i * 4)).collect();
    assert_eq!(addresses, vec![iat, iat + 4, 0x8200_1010, iat + 8]);
}

#[test]
fn import_name_without_versions_is_rejected() {
    let spec = ImportSpec {
        rva: 0x2000,
        libs: vec![("xboxkrnl.exe", vec![0x8000_0001])],
    };
    let pe = PeBuilder::new()
        .import_dir(0x2000)
        .section(b".text", 0x1000, vec![0u8; 0x60], IMAGE_SCN_MEM_EXECUTE)
        .section(b".rdata", 0x2000, spec.to_bytes(), IMAGE_SCN_MEM_READ)
        .build();

    assert!(matches!(
        run(pe, &BuildOptions::default()),
        Err(Error::InvalidImportName(_))
    ));
}

#[test]
fn unknown_import_library_is_rejected() {
    let spec = ImportSpec {
        rva: 0x2000,
        libs: vec![("custom.xex@1888.0+1888.0", vec![0x8000_0001])],
    };
    let pe = PeBuilder::new()
        .import_dir(0x2000)
        .section(b".text", 0x1000, vec![0u8; 0x60], IMAGE_SCN_MEM_EXECUTE)
        .section(b".rdata", 0x2000, spec.to_bytes(), IMAGE_SCN_MEM_READ)
        .build();

    assert!(matches!(
        run(pe, &BuildOptions::default()),
        Err(Error::UnsupportedStructure(_))
    ));
}

#[test]
fn import_by_name_is_rejected() {
    let (pe, _) = imports_pe(vec![0x0000_4000], None); // top bit clear
    assert!(matches!(
        run(pe, &BuildOptions::default()),
        Err(Error::UnsupportedStructure(_))
    ));
}

#[test]
fn pe_tls_is_rejected() {
    let pe = minimal_title().tls_dir(0x1800, 0x10).build();
    assert!(matches!(
        run(pe, &BuildOptions::default()),
        Err(Error::UnsupportedStructure(_))
    ));
}

#[test]
fn foreign_machine_id_is_rejected_unless_skipped() {
    let pe = minimal_title().machine(0x8664).build();
    assert!(matches!(
        run(pe.clone(), &BuildOptions::default()),
        Err(Error::NotXbox360Pe(_))
    ));

    let opts = BuildOptions {
        skip_machine_check: true,
        module_flags: None,
    };
    assert!(run(pe, &opts).is_ok());
}
