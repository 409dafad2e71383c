// SPDX-License-Identifier: MPL-2.0

//! Brand sniffing for ISOBMFF-based AVIF files.
//!
//! AVIF files start with an `ftyp` box carrying a major brand and a list of
//! compatible brands:
//! - `avif` = still image
//! - `avis` = AVIF Image Sequence (animated)

const SEQUENCE_BRAND: &[u8; 4] = b"avis";

/// Upper bound on the `ftyp` box size we are willing to scan.
const MAX_FTYP_SIZE: usize = 256;

/// Brand information read from the leading `ftyp` box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileBrand {
    pub major: [u8; 4],
    /// `avis` is the major brand or listed among the compatible brands.
    pub sequence: bool,
}

impl FileBrand {
    #[must_use]
    pub fn major_str(&self) -> String {
        String::from_utf8_lossy(&self.major).into_owned()
    }
}

/// Read the `ftyp` box at the start of `data`.
///
/// Returns `None` when the buffer does not start with an `ftyp` box.
#[must_use]
pub fn sniff_brand(data: &[u8]) -> Option<FileBrand> {
    let header = data.get(..12)?;
    if &header[4..8] != b"ftyp" {
        return None;
    }

    let mut major = [0u8; 4];
    major.copy_from_slice(&header[8..12]);
    if &major == SEQUENCE_BRAND {
        return Some(FileBrand {
            major,
            sequence: true,
        });
    }

    // Compatible brands follow the 4-byte minor version.
    let box_size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let sequence = box_size > 16
        && box_size <= MAX_FTYP_SIZE
        && data
            .get(16..box_size.min(data.len()))
            .is_some_and(|brands| brands.chunks_exact(4).any(|b| b == SEQUENCE_BRAND));

    Some(FileBrand { major, sequence })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ftyp(major: &[u8; 4], compatible: &[&[u8; 4]]) -> Vec<u8> {
        let size = 16 + compatible.len() * 4;
        let mut data = Vec::with_capacity(size);
        data.extend_from_slice(&(size as u32).to_be_bytes());
        data.extend_from_slice(b"ftyp");
        data.extend_from_slice(major);
        data.extend_from_slice(&0u32.to_be_bytes());
        for brand in compatible {
            data.extend_from_slice(*brand);
        }
        data
    }

    #[test]
    fn detects_sequence_major_brand() {
        let brand = sniff_brand(&ftyp(b"avis", &[b"avif", b"mif1"])).unwrap();
        assert!(brand.sequence);
        assert_eq!(brand.major_str(), "avis");
    }

    #[test]
    fn detects_sequence_in_compatible_brands() {
        let brand = sniff_brand(&ftyp(b"avif", &[b"mif1", b"avis"])).unwrap();
        assert!(brand.sequence);
        assert_eq!(&brand.major, b"avif");
    }

    #[test]
    fn still_image_is_not_a_sequence() {
        let brand = sniff_brand(&ftyp(b"avif", &[b"mif1", b"miaf"])).unwrap();
        assert!(!brand.sequence);
    }

    #[test]
    fn rejects_non_isobmff() {
        assert_eq!(sniff_brand(b"\x89PNG\r\n\x1a\n\0\0\0\0"), None);
        assert_eq!(sniff_brand(b"short"), None);
    }
}
