//! In-memory image of one header page: a bitmap with one bit per data page.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8`, least significant
//! first. The backing buffer is only materialized once a bit is set, so
//! untouched headers cost nothing.

use super::DATA_PAGES_PER_HEADER;
use crate::storage::PAGE_SIZE;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBitmap {
    bits: Vec<u8>,
}

impl HeaderBitmap {
    pub fn new() -> Self {
        Self { bits: Vec::new() }
    }

    pub fn from_page(page: &[u8]) -> Self {
        let mut bitmap = Self::new();
        if page.iter().any(|&b| b != 0) {
            bitmap.bits = page[..PAGE_SIZE].to_vec();
        }
        bitmap
    }

    pub fn get(&self, index: usize) -> bool {
        match self.bits.get(index / 8) {
            Some(byte) => (byte >> (index % 8)) & 0x1 == 0x1,
            None => false,
        }
    }

    pub fn set(&mut self, index: usize) {
        if self.bits.is_empty() {
            self.bits = vec![0u8; PAGE_SIZE];
        }
        self.bits[index / 8] |= 1 << (index % 8);
    }

    pub fn clear(&mut self, index: usize) {
        if let Some(byte) = self.bits.get_mut(index / 8) {
            *byte &= !(1 << (index % 8));
        }
    }

    pub fn clear_all(&mut self) {
        self.bits.clear();
    }

    /// Index of the first clear bit, or `None` if every page is in use.
    pub fn first_clear(&self) -> Option<usize> {
        if self.bits.is_empty() {
            return Some(0);
        }
        for (i, &byte) in self.bits.iter().enumerate() {
            if byte == 0xFF {
                continue;
            }
            let index = i * 8 + byte.trailing_ones() as usize;
            return (index < DATA_PAGES_PER_HEADER).then_some(index);
        }
        None
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Full-page serialization, zero padded.
    pub fn to_page(&self) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        page[..self.bits.len()].copy_from_slice(&self.bits);
        page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_clear() {
        let mut bitmap = HeaderBitmap::new();
        assert!(!bitmap.get(0));
        assert_eq!(bitmap.count_ones(), 0);

        bitmap.set(0);
        bitmap.set(9);
        assert!(bitmap.get(0));
        assert!(bitmap.get(9));
        assert!(!bitmap.get(8));
        assert_eq!(bitmap.count_ones(), 2);

        bitmap.clear(0);
        assert!(!bitmap.get(0));
        assert_eq!(bitmap.count_ones(), 1);
    }

    #[test]
    fn test_bit_order() {
        let mut bitmap = HeaderBitmap::new();
        bitmap.set(1);
        bitmap.set(10);
        let page = bitmap.to_page();
        assert_eq!(page.len(), PAGE_SIZE);
        assert_eq!(page[0], 0b0000_0010);
        assert_eq!(page[1], 0b0000_0100);
        assert_eq!(HeaderBitmap::from_page(&page), bitmap);
    }

    #[test]
    fn test_first_clear() {
        let mut bitmap = HeaderBitmap::new();
        assert_eq!(bitmap.first_clear(), Some(0));

        for i in 0..11 {
            bitmap.set(i);
        }
        assert_eq!(bitmap.first_clear(), Some(11));

        bitmap.clear(3);
        assert_eq!(bitmap.first_clear(), Some(3));
    }

    #[test]
    fn test_full_bitmap() {
        let page = vec![0xFFu8; PAGE_SIZE];
        let mut bitmap = HeaderBitmap::from_page(&page);
        assert_eq!(bitmap.count_ones(), DATA_PAGES_PER_HEADER);
        assert_eq!(bitmap.first_clear(), None);

        bitmap.clear(DATA_PAGES_PER_HEADER - 1);
        assert_eq!(bitmap.first_clear(), Some(DATA_PAGES_PER_HEADER - 1));
    }

    #[test]
    fn test_all_zero_page_stays_lazy() {
        let bitmap = HeaderBitmap::from_page(&[0u8; PAGE_SIZE]);
        assert_eq!(bitmap, HeaderBitmap::new());
    }
}
