// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! View of the decoded picture buffer, as maintained by the reference bookkeeping.
//!
//! The decoder never modifies the DPB: it reads it when translating the decode parameters of a
//! picture, which happens once the whole picture has been handed over.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;
use thiserror::Error;

use crate::codec::h264::picture::PictureData;

// Shortcut to refer to a DPB entry.
//
// The first member is the `PictureData` for the frame.
//
// The second member is the backend handle of the frame. It can be `None` if the inserted picture
// is non-existing, i.e. was inferred from a gap in `frame_num`.
#[derive(Clone)]
pub struct DpbEntry<T> {
    pub pic: Rc<RefCell<PictureData>>,
    pub reference: Option<T>,
}

#[derive(Debug, Error)]
pub enum StorePictureError {
    #[error("DPB is full")]
    DpbIsFull,
}

pub struct Dpb<T> {
    /// List of `PictureData` and backend handles to decoded pictures.
    entries: Vec<DpbEntry<T>>,
    /// The maximum number of pictures that can be stored.
    max_num_pics: usize,
}

impl<T> Default for Dpb<T> {
    fn default() -> Self {
        Self { entries: Vec::new(), max_num_pics: 16 }
    }
}

impl<T: Clone> Dpb<T> {
    /// Returns the length of the DPB.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a reference to the whole DPB entries.
    pub fn entries(&self) -> &Vec<DpbEntry<T>> {
        &self.entries
    }

    /// Set the maximum number of pictures the DPB can hold.
    pub fn set_max_num_pics(&mut self, max_num_pics: usize) {
        self.max_num_pics = max_num_pics;
    }

    /// Get a reference to the dpb's max num pics.
    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    /// Stores a picture along with its backend handle.
    pub fn store_picture(
        &mut self,
        pic: Rc<RefCell<PictureData>>,
        reference: Option<T>,
    ) -> Result<(), StorePictureError> {
        if self.entries.len() >= self.max_num_pics {
            return Err(StorePictureError::DpbIsFull);
        }

        debug!("Stored picture POC {:?}", pic.borrow().pic_order_cnt);
        self.entries.push(DpbEntry { pic, reference });

        Ok(())
    }

    /// Removes the pictures that are not references anymore.
    pub fn remove_unused(&mut self) {
        self.entries.retain(|entry| entry.pic.borrow().is_ref());
    }

    /// Clears the DPB, dropping all the pictures it holds.
    pub fn clear(&mut self) {
        debug!("Clearing the DPB");
        self.entries.clear();
    }
}

/// DPB shared between the reference bookkeeping, which owns it, and the decoder.
pub type SharedDpb<T> = Rc<RefCell<Dpb<T>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::picture::Reference;

    fn picture(reference: Reference) -> Rc<RefCell<PictureData>> {
        let mut pic = PictureData::default();
        pic.set_reference(reference);
        Rc::new(RefCell::new(pic))
    }

    #[test]
    fn store_until_full() {
        let mut dpb = Dpb::<u32>::default();
        dpb.set_max_num_pics(2);

        dpb.store_picture(picture(Reference::ShortTerm), Some(0)).unwrap();
        dpb.store_picture(picture(Reference::LongTerm), Some(1)).unwrap();
        assert!(matches!(
            dpb.store_picture(picture(Reference::ShortTerm), Some(2)),
            Err(StorePictureError::DpbIsFull)
        ));
        assert_eq!(dpb.len(), 2);
    }

    #[test]
    fn remove_unused_keeps_references() {
        let mut dpb = Dpb::<u32>::default();
        let unmarked = picture(Reference::ShortTerm);

        dpb.store_picture(unmarked.clone(), Some(0)).unwrap();
        dpb.store_picture(picture(Reference::LongTerm), Some(1)).unwrap();
        unmarked.borrow_mut().set_reference(Reference::None);
        dpb.remove_unused();

        assert_eq!(dpb.len(), 1);
        assert_eq!(dpb.entries()[0].reference, Some(1));

        dpb.clear();
        assert!(dpb.is_empty());
    }
}
