//! Physical-to-machine translation for paravirtual guests.
//!
//! PV foreign mappings take machine frames, so guest pfns are translated
//! through the guest's own p2m table. The table is reached from the
//! shared-info page: `arch.pfn_to_mfn_frame_list_list` names a frame of
//! frame-list frames, which in turn name the frames holding the table.

use domdbg_core::domain::{MapProt, WordSize};

use super::privcmd::Privcmd;
use super::{PAGE_SIZE, foreign};
use crate::error::Error;

// offsetof(shared_info.arch.pfn_to_mfn_frame_list_list), native and
// compat ABIs
const FLL_OFFSET_64: usize = 3096;
const FLL_OFFSET_32: usize = 2576;

/// Indexed p2m table of a PV guest.
pub struct P2m {
    /// Machine frames holding the p2m table pages.
    frames: Vec<u64>,

    /// One past the highest guest pfn.
    max_pfn: u64,

    /// Entry width within the table.
    word_size: WordSize,
}

impl P2m {
    /// Walks the guest's frame lists and indexes the p2m table.
    pub fn load(
        privcmd: &Privcmd,
        domid: u32,
        word_size: WordSize,
        shared_info_frame: u64,
    ) -> crate::Result<Self> {
        let max_pfn = privcmd.maximum_gpfn(domid)? + 1;

        let shinfo = foreign::map_frames(
            privcmd,
            domid,
            &[shared_info_frame],
            MapProt::Read,
            0,
            PAGE_SIZE,
        )?;

        let fll_offset = match word_size {
            WordSize::Four => FLL_OFFSET_32,
            WordSize::Eight => FLL_OFFSET_64,
        };
        let fll = read_word(&shinfo, fll_offset, word_size);
        drop(shinfo);

        if fll == 0 {
            // the guest has not published its p2m frame lists yet
            return Err(Error::InvalidFrame(0));
        }

        let entries_per_page = PAGE_SIZE / word_size.bytes();
        let p2m_pages = (max_pfn as usize).div_ceil(entries_per_page);
        let fl_pages = p2m_pages.div_ceil(entries_per_page);

        // frame-list-list page: frames of the frame-list pages
        let fll_page = foreign::map_frames(privcmd, domid, &[fll], MapProt::Read, 0, PAGE_SIZE)?;
        let fl_frames = read_words(&fll_page, fl_pages, word_size);
        drop(fll_page);

        // frame-list pages: frames of the p2m table pages
        let fl = foreign::map_frames(
            privcmd,
            domid,
            &fl_frames,
            MapProt::Read,
            0,
            fl_pages * PAGE_SIZE,
        )?;
        let frames = read_words(&fl, p2m_pages, word_size);

        tracing::debug!(domid, max_pfn, pages = frames.len(), "p2m table indexed");

        Ok(Self {
            frames,
            max_pfn,
            word_size,
        })
    }

    /// Machine frame backing the given guest pfn.
    pub fn lookup(&self, privcmd: &Privcmd, domid: u32, pfn: u64) -> crate::Result<u64> {
        if pfn >= self.max_pfn {
            return Err(Error::InvalidFrame(pfn));
        }

        let entries_per_page = (PAGE_SIZE / self.word_size.bytes()) as u64;

        let page = self
            .frames
            .get((pfn / entries_per_page) as usize)
            .copied()
            .filter(|&frame| frame != 0)
            .ok_or(Error::InvalidFrame(pfn))?;

        let window = foreign::map_frames(privcmd, domid, &[page], MapProt::Read, 0, PAGE_SIZE)?;

        let offset = (pfn % entries_per_page) as usize * self.word_size.bytes();
        let mfn = read_word(&window, offset, self.word_size);

        if entry_is_invalid(mfn, self.word_size) {
            return Err(Error::InvalidFrame(pfn));
        }

        Ok(mfn)
    }
}

fn entry_is_invalid(entry: u64, word_size: WordSize) -> bool {
    match word_size {
        WordSize::Four => entry == u64::from(u32::MAX),
        WordSize::Eight => entry == u64::MAX,
    }
}

fn read_word(bytes: &[u8], offset: usize, word_size: WordSize) -> u64 {
    let mut raw = [0u8; 8];
    let n = word_size.bytes();
    raw[..n].copy_from_slice(&bytes[offset..offset + n]);

    u64::from_le_bytes(raw)
}

fn read_words(bytes: &[u8], count: usize, word_size: WordSize) -> Vec<u64> {
    (0..count)
        .map(|i| read_word(bytes, i * word_size.bytes(), word_size))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_follow_guest_width() {
        let mut bytes = vec![0u8; 16];
        bytes[..4].copy_from_slice(&0x1111u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&0x2222u32.to_le_bytes());
        bytes[8..16].copy_from_slice(&0x3333u64.to_le_bytes());

        assert_eq!(
            read_words(&bytes, 2, WordSize::Four),
            vec![0x1111, 0x2222]
        );
        assert_eq!(read_word(&bytes, 8, WordSize::Eight), 0x3333);
    }

    #[test]
    fn invalid_entries_follow_guest_width() {
        assert!(entry_is_invalid(
            u64::from(u32::MAX),
            WordSize::Four
        ));
        assert!(!entry_is_invalid(u64::from(u32::MAX), WordSize::Eight));
        assert!(entry_is_invalid(u64::MAX, WordSize::Eight));
    }
}
