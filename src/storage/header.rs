// # Header Page
//
// Byte layout of datafile page 0 as far as the storage core owns it. All
// remaining header structure belongs to higher layers; the core only
// commits to the fields below.
//
// - [0..27]:  reserved for higher layers (page metadata)
// - [32..55]: `HEADER_INFO` magic bytes
// - [59]:     `FILE_VERSION`
// - [60]:     collation pragma code, written at creation only
// - [65]:     invalid-state flag, 1 after an abnormal close

use crate::settings::Collation;
use crate::storage::page::PAGE_SIZE;

pub const HEADER_INFO: &[u8] = b"** quill-db datafile **";
pub const FILE_VERSION: u8 = 1;

pub const P_HEADER_INFO: usize = 32;
pub const P_FILE_VERSION: usize = 59;
pub const P_COLLATION: usize = 60;

/// Offset of the single-byte invalid-state flag within page 0. Set by
/// `DiskService::mark_as_invalid_state`, read by recovery on next open.
pub const P_INVALID_DATAFILE_STATE: usize = 65;

/// Build the initial header page for a freshly created datafile.
pub fn build_header_page(collation: Collation) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    page[P_HEADER_INFO..P_HEADER_INFO + HEADER_INFO.len()].copy_from_slice(HEADER_INFO);
    page[P_FILE_VERSION] = FILE_VERSION;
    page[P_COLLATION] = collation.to_code();
    page
}

/// Check the magic bytes and version of an existing page 0.
pub fn is_valid_header(page: &[u8]) -> bool {
    page.len() >= PAGE_SIZE
        && &page[P_HEADER_INFO..P_HEADER_INFO + HEADER_INFO.len()] == HEADER_INFO
        && page[P_FILE_VERSION] == FILE_VERSION
}

pub fn read_collation(page: &[u8]) -> Option<Collation> {
    Collation::from_code(page[P_COLLATION])
}

pub fn read_invalid_state(page: &[u8]) -> bool {
    page[P_INVALID_DATAFILE_STATE] != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let page = build_header_page(Collation::IgnoreCase);

        assert!(is_valid_header(&page));
        assert_eq!(read_collation(&page), Some(Collation::IgnoreCase));
        assert!(!read_invalid_state(&page));
    }

    #[test]
    fn test_garbage_is_not_a_header() {
        let page = vec![0xFFu8; PAGE_SIZE];
        assert!(!is_valid_header(&page));
    }
}
