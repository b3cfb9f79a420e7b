//! The security info header and the SHA-1 chain over the image pages.

use crate::error;
use crate::pe::PeImage;
use crate::pe::header::PAGE_SIZE_4K;
use crate::pe::section::{Section, XEX_SECTION_RODATA, XEX_SECTION_SIZE_ONE};
use log::debug;
use sha1::{Digest, Sha1};

/// Image uses 4 KiB pages instead of the default 64 KiB
pub const XEX_IMG_FLAG_4KIB_PAGES: u32 = 0x1000_0000;
/// Image is not locked to a region
pub const XEX_IMG_FLAG_REGION_FREE: u32 = 0x2000_0000;
/// Region field value for a region-free image
pub const XEX_REG_FLAG_REGION_FREE: u32 = 0xffff_ffff;

/// Size of the fixed part of the security info, up to the descriptor array
pub const SIZEOF_SECURITY_INFO: u32 = 0x184;
/// Size of one page descriptor
pub const SIZEOF_PAGE_DESCRIPTOR: u32 = 24;
/// Declared length of the image-info region inside the security info
pub const IMAGE_INFO_SIZE: u32 = 0x174;
/// Offset of the image-info region inside the security info
pub const IMAGE_INFO_OFFSET: u32 = 0x8;
/// Offset of the headers hash inside the security info
pub const HEADERS_HASH_OFFSET: u32 = 0x164;

/// Human-readable tag carried in the (unsigned) signature field.
pub const VERSION_TAG: &str = concat!("SynthXEX ", env!("CARGO_PKG_VERSION"));

/// One page of the basefile: 28 bits of size in pages (always one here) and
/// 4 bits of permission info, plus this page's link in the hash chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageDescriptor {
    pub size_and_info: u32,
    pub sha1: [u8; 20],
}

impl Default for PageDescriptor {
    fn default() -> Self {
        PageDescriptor {
            size_and_info: 0,
            sha1: [0; 20],
        }
    }
}

/// The security info header. Media ID and AES key stay zero: the output is
/// unencrypted and carries SHA-1 integrity only.
#[derive(Debug, Clone)]
pub struct SecurityInfoHeader {
    pub header_size: u32,
    pub pe_size: u32,
    pub signature: [u8; 256],
    pub image_info_size: u32,
    pub image_flags: u32,
    pub base_addr: u32,
    /// Root of the page hash chain
    pub image_sha1: [u8; 20],
    pub import_table_count: u32,
    /// Root of the import-table hash chain
    pub import_table_sha1: [u8; 20],
    pub media_id: [u8; 16],
    pub aes_key: [u8; 16],
    pub export_table_addr: u32,
    /// Filled by the final read-back pass, zero at write time
    pub headers_hash: [u8; 20],
    pub game_region: u32,
    pub media_types: u32,
    pub page_desc_count: u32,
    pub descriptors: Vec<PageDescriptor>,
}

impl SecurityInfoHeader {
    /// Populates everything derivable from the mapped PE. The hash fields
    /// start zeroed; the chains and the header hash are computed later.
    pub fn new(pe: &PeImage) -> Self {
        let page_desc_count = pe.size / pe.page_size;

        let mut signature = [0u8; 256];
        signature[..VERSION_TAG.len()].copy_from_slice(VERSION_TAG.as_bytes());

        let mut image_flags = XEX_IMG_FLAG_REGION_FREE;

        if pe.page_size == PAGE_SIZE_4K {
            image_flags |= XEX_IMG_FLAG_4KIB_PAGES;
        }

        SecurityInfoHeader {
            header_size: page_desc_count * SIZEOF_PAGE_DESCRIPTOR + SIZEOF_SECURITY_INFO,
            pe_size: pe.size,
            signature,
            image_info_size: IMAGE_INFO_SIZE,
            image_flags,
            base_addr: pe.base_addr,
            image_sha1: [0; 20],
            import_table_count: 0,
            import_table_sha1: [0; 20],
            media_id: [0; 16],
            aes_key: [0; 16],
            export_table_addr: 0,
            headers_hash: [0; 20],
            game_region: XEX_REG_FLAG_REGION_FREE,
            media_types: 0xffff_ffff,
            page_desc_count,
            descriptors: Vec::new(),
        }
    }

    /// Builds the page descriptors over the basefile and computes the hash
    /// chain. Each digest covers the page bytes, the big-endian size/info
    /// word, and the digest of the page after it, so the chain is computed
    /// from the last page back to the first; the digest over page zero
    /// becomes the image hash.
    pub fn set_page_descriptors(
        &mut self,
        basefile: &[u8],
        sections: &[Section],
    ) -> error::Result<()> {
        let count = self.page_desc_count as usize;
        let page_size = (self.pe_size / self.page_desc_count) as usize;

        self.descriptors = vec![PageDescriptor::default(); count];

        for i in (0..count).rev() {
            self.descriptors[i].size_and_info = page_info(sections, (i * page_size) as u32) as u32;

            let mut sha = Sha1::new();
            sha.update(&basefile[i * page_size..(i + 1) * page_size]);
            sha.update(self.descriptors[i].size_and_info.to_be_bytes());
            sha.update(self.descriptors[i].sha1);
            let digest = sha.finalize();

            if i > 0 {
                self.descriptors[i - 1].sha1.copy_from_slice(&digest);
            } else {
                self.image_sha1.copy_from_slice(&digest);
            }
        }

        debug!("hashed {count} page descriptors");
        Ok(())
    }
}

/// Permission of the page starting at `page_offset` (an RVA, which equals
/// the basefile offset). The last section at or below the page wins; pages
/// below the first section hold the PE header image and are read-only data.
fn page_info(sections: &[Section], page_offset: u32) -> u8 {
    for section in sections.iter().rev() {
        if page_offset >= section.rva {
            return section.perm_flag;
        }
    }

    XEX_SECTION_RODATA | XEX_SECTION_SIZE_ONE
}
