//! Persistent free list recycling pages released by copy-on-write.
//!
//! The list is a FIFO queue of page ids stored in its own chain of pages:
//!
//! | Field | Size          | Contents                              |
//! |-------|---------------|---------------------------------------|
//! | next  | 8 bytes       | page id of the next list page, 0 = end|
//! | ptrs  | 8 * 511 bytes | recyclable page ids                   |
//!
//! `head_idx` and `tail_idx` are monotonically increasing counters over
//! the logical slot sequence; `idx % 511` picks the slot inside the
//! current head or tail page. `max_idx` is the tail position recorded by
//! the last successful commit: ids pushed during the current transaction
//! sit in `[max_idx, tail_idx)` and stay untouchable until that commit
//! lands, because the still-live previous tree version may reference
//! them.
//!
//! The list stores no pager reference; every operation takes the pager as
//! an explicit argument, mirroring how the tree receives its page I/O.

use super::node::PAGE_SIZE;
use super::store::Pager;
use crate::errors::Error;
use tracing::trace;

/// Size of the `next` pointer at the start of a list page.
const NEXT_SIZE: usize = 8;

/// Size of one recyclable page id.
const PTR_SIZE: usize = 8;

/// Page ids per list page.
pub const MAX_PTRS: u64 = ((PAGE_SIZE - NEXT_SIZE) / PTR_SIZE) as u64;

fn lnode_next(page: &[u8]) -> u64 {
    let mut buf = [0u8; NEXT_SIZE];
    buf.copy_from_slice(&page[0..NEXT_SIZE]);
    u64::from_le_bytes(buf)
}

fn lnode_set_next(page: &mut [u8], ptr: u64) {
    page[0..NEXT_SIZE].copy_from_slice(&ptr.to_le_bytes());
}

fn lnode_ptr(page: &[u8], slot: u64) -> u64 {
    let pos = NEXT_SIZE + PTR_SIZE * slot as usize;
    let mut buf = [0u8; PTR_SIZE];
    buf.copy_from_slice(&page[pos..pos + PTR_SIZE]);
    u64::from_le_bytes(buf)
}

fn lnode_set_ptr(page: &mut [u8], slot: u64, ptr: u64) {
    let pos = NEXT_SIZE + PTR_SIZE * slot as usize;
    page[pos..pos + PTR_SIZE].copy_from_slice(&ptr.to_le_bytes());
}

/// Cursor state of the free list. The chain pages themselves live in the
/// pager like any other page.
#[derive(Debug, Default)]
pub struct FreeList {
    pub head_page: u64,
    pub head_idx: u64,
    pub tail_page: u64,
    pub tail_idx: u64,
    /// Tail position at the last successful commit; pop never advances
    /// past it.
    pub max_idx: u64,
}

impl FreeList {
    pub fn new() -> Self {
        FreeList::default()
    }

    fn slot(idx: u64) -> u64 {
        idx % MAX_PTRS
    }

    /// Takes the next reusable page id, or 0 when none is available.
    ///
    /// When the pop drains the head page, that page is itself recycled by
    /// pushing it onto the tail.
    pub fn pop_head(&mut self, pager: &mut Pager) -> Result<u64, Error> {
        let (ptr, drained) = self.pop(pager)?;
        if drained != 0 {
            trace!(page = drained, "Recycling drained free-list head page");
            self.push_tail(pager, drained)?;
        }
        Ok(ptr)
    }

    /// Raw pop without the head-recycling wrapper. Returns the popped id
    /// (0 when exhausted) and the drained head page id (0 when the head
    /// page still has slots left).
    fn pop(&mut self, pager: &mut Pager) -> Result<(u64, u64), Error> {
        if self.head_idx == self.max_idx {
            return Ok((0, 0));
        }

        let head = pager.read_page(self.head_page)?;
        let next = lnode_next(&head);
        let ptr = lnode_ptr(&head, Self::slot(self.head_idx));

        self.head_idx += 1;
        if Self::slot(self.head_idx) == 0 {
            if next == 0 {
                return Err(err!(
                    Corrupt,
                    "Free list ends early at page {}.",
                    self.head_page
                ));
            }
            let drained = self.head_page;
            self.head_page = next;
            return Ok((ptr, drained));
        }
        Ok((ptr, 0))
    }

    /// Appends a released page id to the tail of the list.
    ///
    /// The tail page is updated through the pager's copy-on-write buffer.
    /// When the tail page fills up, a new tail is taken from the head of
    /// the list if possible, otherwise appended to the file, and linked
    /// in.
    pub fn push_tail(&mut self, pager: &mut Pager, ptr: u64) -> Result<(), Error> {
        let tail = pager.update_page(self.tail_page)?;
        lnode_set_ptr(tail, Self::slot(self.tail_idx), ptr);

        self.tail_idx += 1;
        if Self::slot(self.tail_idx) != 0 {
            return Ok(());
        }

        // The tail page is full; acquire and link a fresh one.
        let (popped, drained) = self.pop(pager)?;
        let next = if popped != 0 {
            popped
        } else {
            pager.append_page(vec![0; PAGE_SIZE])
        };

        let old_tail = pager.update_page(self.tail_page)?;
        lnode_set_next(old_tail, next);
        self.tail_page = next;

        if drained != 0 {
            let new_tail = pager.update_page(self.tail_page)?;
            lnode_set_ptr(new_tail, Self::slot(self.tail_idx), drained);
            self.tail_idx += 1;
        }
        Ok(())
    }

    /// Publishes everything pushed so far for reuse. Called exactly once
    /// per successful commit, after the meta page is durable.
    pub fn set_max_idx(&mut self) {
        self.max_idx = self.tail_idx;
    }
}
