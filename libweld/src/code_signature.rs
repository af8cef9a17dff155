//! Ad-hoc code signing: a SuperBlob holding a SHA-256 CodeDirectory over
//! every 4 KiB page of the file, an empty requirements set, optional
//! entitlements, and an empty wrapper in the signature slot. No identity is
//! involved; this is the form the kernel demands on Apple Silicon.

use byteorder::BigEndian;
use byteorder::WriteBytesExt;
use sha2::Digest;
use sha2::Sha256;

const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade_0cc0;
const CSMAGIC_CODEDIRECTORY: u32 = 0xfade_0c02;
const CSMAGIC_REQUIREMENTS: u32 = 0xfade_0c01;
const CSMAGIC_BLOBWRAPPER: u32 = 0xfade_0b01;
const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade_7171;
const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade_7172;

const CSSLOT_CODEDIRECTORY: u32 = 0;
const CSSLOT_REQUIREMENTS: u32 = 2;
const CSSLOT_ENTITLEMENTS: u32 = 5;
const CSSLOT_DER_ENTITLEMENTS: u32 = 7;
const CSSLOT_SIGNATURESLOT: u32 = 0x10000;

const CS_ADHOC: u32 = 0x2;
const CS_HASHTYPE_SHA256: u8 = 2;
const CS_EXECSEG_MAIN_BINARY: u64 = 0x1;

/// CodeDirectory version with the exec-segment fields.
const CD_VERSION: u32 = 0x20400;
const CD_HEADER_SIZE: u32 = 88;

const PAGE_SHIFT: u32 = 12;
pub(crate) const CS_PAGE_SIZE: usize = 1 << PAGE_SHIFT;
const HASH_SIZE: u32 = 32;

#[derive(Debug)]
pub(crate) struct CodeSignature {
    /// The output's basename, NUL-terminated into the identifier slot.
    identifier: Vec<u8>,
    entitlements: Option<Vec<u8>>,
    der_entitlements: Option<Vec<u8>>,
    exec_seg_limit: u64,
    exec_seg_is_main: bool,
}

impl CodeSignature {
    pub(crate) fn new(
        identifier: &str,
        entitlements: Option<Vec<u8>>,
        der_entitlements: Option<Vec<u8>>,
        exec_seg_limit: u64,
        exec_seg_is_main: bool,
    ) -> CodeSignature {
        let mut ident = identifier.as_bytes().to_vec();
        ident.push(0);
        CodeSignature {
            identifier: ident,
            entitlements,
            der_entitlements,
            exec_seg_limit,
            exec_seg_is_main,
        }
    }

    fn blob_count(&self) -> u32 {
        // CodeDirectory, requirements and the signature wrapper are always
        // present.
        3 + u32::from(self.entitlements.is_some()) + u32::from(self.der_entitlements.is_some())
    }

    fn directory_size(&self, code_limit: u64) -> u32 {
        let pages = code_limit.div_ceil(CS_PAGE_SIZE as u64) as u32;
        CD_HEADER_SIZE + self.identifier.len() as u32 + pages * HASH_SIZE
    }

    /// Exact size of the signature blob for a file whose signed region is
    /// `code_limit` bytes. The load command must carry this value before the
    /// pages are hashed.
    pub(crate) fn size(&self, code_limit: u64) -> u32 {
        let mut size = 12 + self.blob_count() * 8;
        size += self.directory_size(code_limit);
        size += 12; // empty requirements
        if let Some(blob) = &self.entitlements {
            size += 8 + blob.len() as u32;
        }
        if let Some(blob) = &self.der_entitlements {
            size += 8 + blob.len() as u32;
        }
        size += 8; // empty signature wrapper
        size.next_multiple_of(16)
    }

    /// Builds the SuperBlob. `code` is the file content up to the signature
    /// offset; it must already contain the final load commands.
    pub(crate) fn write(&self, code: &[u8]) -> Vec<u8> {
        let code_limit = code.len() as u64;
        let total = self.size(code_limit);

        let mut blobs: Vec<(u32, Vec<u8>)> = Vec::new();
        blobs.push((CSSLOT_CODEDIRECTORY, self.build_code_directory(code)));

        let mut requirements = Vec::new();
        requirements.write_u32::<BigEndian>(CSMAGIC_REQUIREMENTS).unwrap();
        requirements.write_u32::<BigEndian>(12).unwrap();
        requirements.write_u32::<BigEndian>(0).unwrap();
        blobs.push((CSSLOT_REQUIREMENTS, requirements));

        if let Some(plist) = &self.entitlements {
            let mut blob = Vec::new();
            blob.write_u32::<BigEndian>(CSMAGIC_EMBEDDED_ENTITLEMENTS).unwrap();
            blob.write_u32::<BigEndian>(8 + plist.len() as u32).unwrap();
            blob.extend_from_slice(plist);
            blobs.push((CSSLOT_ENTITLEMENTS, blob));
        }
        if let Some(der) = &self.der_entitlements {
            let mut blob = Vec::new();
            blob.write_u32::<BigEndian>(CSMAGIC_EMBEDDED_DER_ENTITLEMENTS).unwrap();
            blob.write_u32::<BigEndian>(8 + der.len() as u32).unwrap();
            blob.extend_from_slice(der);
            blobs.push((CSSLOT_DER_ENTITLEMENTS, blob));
        }

        let mut wrapper = Vec::new();
        wrapper.write_u32::<BigEndian>(CSMAGIC_BLOBWRAPPER).unwrap();
        wrapper.write_u32::<BigEndian>(8).unwrap();
        blobs.push((CSSLOT_SIGNATURESLOT, wrapper));

        let mut out = Vec::with_capacity(total as usize);
        let header_size = 12 + blobs.len() as u32 * 8;
        let length: u32 = header_size + blobs.iter().map(|(_, b)| b.len() as u32).sum::<u32>();
        out.write_u32::<BigEndian>(CSMAGIC_EMBEDDED_SIGNATURE).unwrap();
        out.write_u32::<BigEndian>(length).unwrap();
        out.write_u32::<BigEndian>(blobs.len() as u32).unwrap();
        let mut offset = header_size;
        for (slot, blob) in &blobs {
            out.write_u32::<BigEndian>(*slot).unwrap();
            out.write_u32::<BigEndian>(offset).unwrap();
            offset += blob.len() as u32;
        }
        for (_, blob) in &blobs {
            out.extend_from_slice(blob);
        }
        out.resize(total as usize, 0);
        out
    }

    fn build_code_directory(&self, code: &[u8]) -> Vec<u8> {
        let code_limit = code.len() as u64;
        let pages = code_limit.div_ceil(CS_PAGE_SIZE as u64) as u32;
        let size = self.directory_size(code_limit);
        let hash_offset = CD_HEADER_SIZE + self.identifier.len() as u32;

        let mut cd = Vec::with_capacity(size as usize);
        cd.write_u32::<BigEndian>(CSMAGIC_CODEDIRECTORY).unwrap();
        cd.write_u32::<BigEndian>(size).unwrap();
        cd.write_u32::<BigEndian>(CD_VERSION).unwrap();
        cd.write_u32::<BigEndian>(CS_ADHOC).unwrap();
        cd.write_u32::<BigEndian>(hash_offset).unwrap();
        cd.write_u32::<BigEndian>(CD_HEADER_SIZE).unwrap(); // identOffset
        cd.write_u32::<BigEndian>(0).unwrap(); // nSpecialSlots
        cd.write_u32::<BigEndian>(pages).unwrap();
        cd.write_u32::<BigEndian>(code_limit as u32).unwrap();
        cd.push(HASH_SIZE as u8);
        cd.push(CS_HASHTYPE_SHA256);
        cd.push(0); // platform
        cd.push(PAGE_SHIFT as u8);
        cd.write_u32::<BigEndian>(0).unwrap(); // spare2
        cd.write_u32::<BigEndian>(0).unwrap(); // scatterOffset
        cd.write_u32::<BigEndian>(0).unwrap(); // teamOffset
        cd.write_u32::<BigEndian>(0).unwrap(); // spare3
        cd.write_u64::<BigEndian>(0).unwrap(); // codeLimit64
        cd.write_u64::<BigEndian>(0).unwrap(); // execSegBase
        cd.write_u64::<BigEndian>(self.exec_seg_limit).unwrap();
        cd.write_u64::<BigEndian>(if self.exec_seg_is_main {
            CS_EXECSEG_MAIN_BINARY
        } else {
            0
        })
        .unwrap();
        debug_assert_eq!(cd.len() as u32, CD_HEADER_SIZE);

        cd.extend_from_slice(&self.identifier);

        for page in code.chunks(CS_PAGE_SIZE) {
            let mut hasher = Sha256::new();
            hasher.update(page);
            cd.extend_from_slice(&hasher.finalize());
        }
        debug_assert_eq!(cd.len() as u32, size);
        cd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_be_u32(data: &[u8], offset: usize) -> u32 {
        u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn size_prediction_matches_emission() {
        let signature = CodeSignature::new("a.out", None, None, 0x4000, true);
        for code_len in [1usize, 4096, 4097, 3 * 4096 + 17] {
            let code = vec![0xaau8; code_len];
            let blob = signature.write(&code);
            assert_eq!(blob.len() as u32, signature.size(code_len as u64));
            assert_eq!(blob.len() % 16, 0);
        }
    }

    #[test]
    fn superblob_layout_and_page_hashes() {
        let signature = CodeSignature::new("t", None, None, 0x1000, true);
        let code = vec![0x5au8; 2 * CS_PAGE_SIZE + 100];
        let blob = signature.write(&code);

        assert_eq!(read_be_u32(&blob, 0), CSMAGIC_EMBEDDED_SIGNATURE);
        assert_eq!(read_be_u32(&blob, 8), 3); // cd, requirements, wrapper

        // First index entry points at the CodeDirectory.
        assert_eq!(read_be_u32(&blob, 12), CSSLOT_CODEDIRECTORY);
        let cd_offset = read_be_u32(&blob, 16) as usize;
        assert_eq!(read_be_u32(&blob, cd_offset), CSMAGIC_CODEDIRECTORY);

        let n_code_slots = read_be_u32(&blob, cd_offset + 28);
        assert_eq!(n_code_slots, 3);

        // The first page hash is the SHA-256 of the first 4 KiB.
        let hash_offset = read_be_u32(&blob, cd_offset + 16) as usize;
        let mut hasher = Sha256::new();
        hasher.update(&code[..CS_PAGE_SIZE]);
        let expected = hasher.finalize();
        assert_eq!(&blob[cd_offset + hash_offset..cd_offset + hash_offset + 32], &expected[..]);

        // The trailing (short) page hashes only the remainder.
        let last = cd_offset + hash_offset + 2 * 32;
        let mut hasher = Sha256::new();
        hasher.update(&code[2 * CS_PAGE_SIZE..]);
        let expected = hasher.finalize();
        assert_eq!(&blob[last..last + 32], &expected[..]);
    }

    #[test]
    fn entitlements_ride_in_their_slot() {
        let plist = b"<plist/>".to_vec();
        let signature = CodeSignature::new("t", Some(plist.clone()), None, 0, false);
        let code = vec![0u8; 64];
        let blob = signature.write(&code);
        assert_eq!(read_be_u32(&blob, 8), 4);
        // Entitlements index follows cd and requirements.
        assert_eq!(read_be_u32(&blob, 12 + 2 * 8), CSSLOT_ENTITLEMENTS);
        let offset = read_be_u32(&blob, 12 + 2 * 8 + 4) as usize;
        assert_eq!(read_be_u32(&blob, offset), CSMAGIC_EMBEDDED_ENTITLEMENTS);
        assert_eq!(&blob[offset + 8..offset + 8 + plist.len()], &plist[..]);
    }
}
