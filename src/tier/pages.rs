//! Page-backed extent buffers
//!
//! An extent is held as `pages_per_extent` separate pages rather than one
//! contiguous allocation. Objects never exceed a page, so any object copy
//! touches at most two pages.

use super::index::PAGE_SIZE;
use crate::error::{Error, Result};

/// The backing pages of one extent
#[derive(Debug, Clone)]
pub struct ExtentPages {
    pages: Vec<Box<[u8]>>,
}

impl ExtentPages {
    pub fn new(nr_pages: usize) -> Self {
        Self {
            pages: (0..nr_pages)
                .map(|_| vec![0u8; PAGE_SIZE].into_boxed_slice())
                .collect(),
        }
    }

    pub fn nr_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn len(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page(&self, index: usize) -> Option<&[u8]> {
        self.pages.get(index).map(|p| &p[..])
    }

    /// Split `[offset, offset + size)` into at most two in-page segments
    fn segments(&self, offset: usize, size: usize) -> Result<[(usize, usize, usize); 2]> {
        if size > PAGE_SIZE {
            return Err(Error::InvalidArgument(format!(
                "copy of {} bytes exceeds one page",
                size
            )));
        }
        if offset.checked_add(size).map_or(true, |end| end > self.len()) {
            return Err(Error::InvalidArgument(format!(
                "range {}+{} beyond extent of {} bytes",
                offset,
                size,
                self.len()
            )));
        }
        let page = offset / PAGE_SIZE;
        let start = offset % PAGE_SIZE;
        let first = size.min(PAGE_SIZE - start);
        Ok([(page, start, first), (page + 1, 0, size - first)])
    }

    /// Copy `dst.len()` bytes starting at byte `offset` of the extent
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let mut copied = 0;
        for (page, start, len) in self.segments(offset, dst.len())? {
            if len == 0 {
                continue;
            }
            dst[copied..copied + len].copy_from_slice(&self.pages[page][start..start + len]);
            copied += len;
        }
        Ok(())
    }

    /// Copy `src` into the extent starting at byte `offset`
    pub fn write_at(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        let mut copied = 0;
        for (page, start, len) in self.segments(offset, src.len())? {
            if len == 0 {
                continue;
            }
            self.pages[page][start..start + len].copy_from_slice(&src[copied..copied + len]);
            copied += len;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_within_page() -> Result<()> {
        let mut pages = ExtentPages::new(2);
        pages.write_at(100, b"hello")?;
        let mut out = [0u8; 5];
        pages.read_at(100, &mut out)?;
        assert_eq!(&out, b"hello");
        Ok(())
    }

    #[test]
    fn test_straddling_read_equals_two_halves() -> Result<()> {
        let mut pages = ExtentPages::new(2);
        let data: Vec<u8> = (0..200u8).collect();
        let offset = PAGE_SIZE - 80;
        pages.write_at(offset, &data)?;

        let mut whole = vec![0u8; 200];
        pages.read_at(offset, &mut whole)?;

        let mut first = vec![0u8; 80];
        let mut second = vec![0u8; 120];
        pages.read_at(offset, &mut first)?;
        pages.read_at(PAGE_SIZE, &mut second)?;

        assert_eq!(whole, [first, second].concat());
        assert_eq!(whole, data);
        assert_eq!(pages.page(1).map(|p| p[0]), Some(80));
        Ok(())
    }

    #[test]
    fn test_out_of_bounds() {
        let mut pages = ExtentPages::new(1);
        assert!(pages.write_at(PAGE_SIZE - 2, b"abc").is_err());
        let mut big = vec![0u8; PAGE_SIZE + 1];
        assert!(pages.read_at(0, &mut big).is_err());
    }
}
