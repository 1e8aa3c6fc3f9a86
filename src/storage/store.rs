//! Page manager binding the tree and free list to a single file.
//!
//! The file is a sequence of 4096-byte pages. Page 0 is the meta page; it
//! holds the magic string, the tree root, the committed page count and the
//! free-list cursors, and it is the sole commit anchor. Everything else is
//! reached from those fields.
//!
//! Reads go through a read-only memory map. Writes never touch the map:
//! mutated pages collect in an in-memory buffer and are flushed with
//! pwrite during commit. The commit order is what makes a crash safe:
//!
//! 1. write all dirty pages, fsync
//! 2. write the meta page, fsync
//!
//! Until step 2 lands, the on-disk meta still points at the previous root
//! and free list, and none of the pages that version references have been
//! overwritten, so reopening after a crash yields the previous state.

use super::btree::{Btree, PageIo, PageRead};
use super::freelist::FreeList;
use super::node::{Node, PAGE_SIZE};
use crate::errors::Error;
use bincode::{config, Decode, Encode};
use memmap2::{Mmap, MmapOptions};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File signature stored at the start of the meta page.
const META_MAGIC: &[u8; 16] = b"MY_DB_SIG_012345";

/// Serialized size of [`Meta`]: the first 64 bytes of page 0.
const META_SIZE: usize = 64;

/// Smallest mmap chunk; further chunks double until the file is covered.
const MIN_MMAP_CHUNK: u64 = 64 << 20;

/// Contents of the meta page. Field order is the on-disk layout.
#[derive(Encode, Decode, Debug)]
struct Meta {
    magic: [u8; 16],
    root: u64,
    flushed: u64,
    free_head_page: u64,
    free_head_idx: u64,
    free_tail_page: u64,
    free_tail_idx: u64,
}

fn encode_meta(meta: &Meta) -> Result<[u8; META_SIZE], Error> {
    let encoded = bincode::encode_to_vec(meta, config::standard().with_fixed_int_encoding())
        .map_err(|e| err!(Storage, "Failed to encode the meta page. {}", e))?;

    if encoded.len() > META_SIZE {
        return Err(err!(
            Storage,
            "Meta does not fit within its frame ({} bytes).",
            encoded.len()
        ));
    }

    let mut frame = [0u8; META_SIZE];
    frame[..encoded.len()].copy_from_slice(&encoded);
    Ok(frame)
}

fn decode_meta(bytes: &[u8]) -> Result<Meta, Error> {
    let (meta, _): (Meta, usize) =
        bincode::decode_from_slice(bytes, config::standard().with_fixed_int_encoding())
            .map_err(|e| err!(Corrupt, "Failed to decode the meta page. {}", e))?;
    Ok(meta)
}

/// Page cache state: the mapped file regions plus the dirty-page buffer.
///
/// Mapped chunks are append-only and never remapped, so page slices stay
/// valid for the life of the store. `flushed` counts pages in the file;
/// ids `flushed..flushed + nappend` are new pages that exist only in
/// `updated` until the next commit.
pub struct Pager {
    pub(crate) chunks: Vec<Mmap>,
    pub(crate) mapped: u64,
    pub(crate) flushed: u64,
    pub(crate) nappend: u64,
    pub(crate) updated: HashMap<u64, Vec<u8>>,
}

impl Pager {
    pub(crate) fn new() -> Self {
        Pager {
            chunks: Vec::new(),
            mapped: 0,
            flushed: 0,
            nappend: 0,
            updated: HashMap::new(),
        }
    }

    /// Returns the current content of a page: the dirty version if one
    /// exists, otherwise the committed bytes from the map.
    pub(crate) fn read_page(&self, ptr: u64) -> Result<Vec<u8>, Error> {
        if let Some(page) = self.updated.get(&ptr) {
            return Ok(page.clone());
        }
        self.read_mapped(ptr)
    }

    fn read_mapped(&self, ptr: u64) -> Result<Vec<u8>, Error> {
        let mut start = 0u64;
        for chunk in &self.chunks {
            let end = start + (chunk.len() / PAGE_SIZE) as u64;
            if ptr < end {
                let offset = (ptr - start) as usize * PAGE_SIZE;
                return Ok(chunk[offset..offset + PAGE_SIZE].to_vec());
            }
            start = end;
        }
        Err(err!(Corrupt, "Page {} is outside the mapped file.", ptr))
    }

    /// Copy-on-writes a page into the dirty buffer and returns it for
    /// in-place mutation. Used by the free list to fill pointer slots.
    pub(crate) fn update_page(&mut self, ptr: u64) -> Result<&mut Vec<u8>, Error> {
        if !self.updated.contains_key(&ptr) {
            let page = self.read_mapped(ptr)?;
            self.updated.insert(ptr, page);
        }
        self.updated
            .get_mut(&ptr)
            .ok_or_else(|| err!(Storage, "Page {} missing from the write buffer.", ptr))
    }

    /// Assigns the next append-only page id and buffers the page.
    pub(crate) fn append_page(&mut self, data: Vec<u8>) -> u64 {
        let ptr = self.flushed + self.nappend;
        self.nappend += 1;
        self.updated.insert(ptr, data);
        ptr
    }

    /// Grows the mapped view to cover at least `size` bytes. Chunks start
    /// at 64 MiB and double, so remapping is never needed; a chunk may
    /// extend past the end of the file and becomes readable as the file
    /// grows under it.
    fn extend_mmap(&mut self, file: &File, size: u64) -> Result<(), Error> {
        if size <= self.mapped {
            return Ok(());
        }

        let mut alloc = self.mapped.max(MIN_MMAP_CHUNK);
        while size > self.mapped + alloc {
            alloc *= 2;
        }

        let chunk = unsafe {
            MmapOptions::new()
                .offset(self.mapped)
                .len(alloc as usize)
                .map(file)?
        };
        self.chunks.push(chunk);
        self.mapped += alloc;
        Ok(())
    }
}

impl PageRead for Pager {
    fn page_get(&self, ptr: u64) -> Result<Node, Error> {
        Ok(Node::from_page(self.read_page(ptr)?))
    }
}

/// The page I/O handed to the tree: reads through the pager, allocates
/// from the free list before appending, releases onto the free list.
struct PageCtx<'a> {
    pager: &'a mut Pager,
    freelist: &'a mut FreeList,
}

impl PageRead for PageCtx<'_> {
    fn page_get(&self, ptr: u64) -> Result<Node, Error> {
        self.pager.page_get(ptr)
    }
}

impl PageIo for PageCtx<'_> {
    fn page_alloc(&mut self, node: Node) -> Result<u64, Error> {
        let data = node.into_page()?;
        let reused = self.freelist.pop_head(self.pager)?;
        if reused != 0 {
            self.pager.updated.insert(reused, data);
            return Ok(reused);
        }
        Ok(self.pager.append_page(data))
    }

    fn page_free(&mut self, ptr: u64) -> Result<(), Error> {
        self.freelist.push_tail(self.pager, ptr)
    }
}

/// A single-file ordered key/value store.
///
/// One writer at a time; callers wanting concurrent access must wrap the
/// store in their own lock. Every mutation is committed before the call
/// returns, so each successful `insert` or `delete` survives a crash.
pub struct Store {
    path: PathBuf,
    file: File,
    pager: Pager,
    freelist: FreeList,
    tree: Btree,
    poisoned: bool,
}

impl Store {
    /// Opens the store at `path`, creating the file if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        let mut store = Store {
            path,
            file,
            pager: Pager::new(),
            freelist: FreeList::new(),
            tree: Btree::new(),
            poisoned: false,
        };

        if size == 0 {
            store.bootstrap()?;
            info!(path = %store.path.display(), "Created store");
        } else {
            store.load(size)?;
            info!(
                path = %store.path.display(),
                pages = store.pager.flushed,
                "Opened store"
            );
        }
        Ok(store)
    }

    /// Initial in-memory state for an empty file: two logical pages (meta
    /// plus one zeroed free-list page), nothing written yet. The first
    /// commit materializes both.
    fn bootstrap(&mut self) -> Result<(), Error> {
        self.pager.flushed = 2;
        self.pager.updated.insert(1, vec![0; PAGE_SIZE]);
        self.freelist = FreeList {
            head_page: 1,
            head_idx: 0,
            tail_page: 1,
            tail_idx: 0,
            max_idx: 0,
        };

        // Make the new file's directory entry durable as well.
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        File::open(parent)?.sync_all()?;
        Ok(())
    }

    fn load(&mut self, size: u64) -> Result<(), Error> {
        self.pager.extend_mmap(&self.file, size)?;

        let page0 = self.pager.read_page(0)?;
        let meta = decode_meta(&page0[..META_SIZE])?;
        if &meta.magic != META_MAGIC {
            return Err(err!(Corrupt, "Bad magic in the meta page."));
        }

        self.tree.root = meta.root;
        self.pager.flushed = meta.flushed;
        self.freelist.head_page = meta.free_head_page;
        self.freelist.head_idx = meta.free_head_idx;
        self.freelist.tail_page = meta.free_tail_page;
        self.freelist.tail_idx = meta.free_tail_idx;
        self.freelist.max_idx = meta.free_tail_idx;
        Ok(())
    }

    /// Looks up `key`.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, Error> {
        self.tree.get(&self.pager, key)
    }

    /// Inserts `key` or replaces its value, committing before returning.
    pub fn insert(&mut self, key: &[u8], val: &[u8]) -> Result<(), Error> {
        self.check_usable()?;
        let snapshot = self.current_meta(self.pager.flushed);
        match self.insert_inner(key, val) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.revert(&snapshot, &e);
                Err(e)
            }
        }
    }

    fn insert_inner(&mut self, key: &[u8], val: &[u8]) -> Result<(), Error> {
        self.tree.insert(
            &mut PageCtx {
                pager: &mut self.pager,
                freelist: &mut self.freelist,
            },
            key,
            val,
        )?;
        self.commit()
    }

    /// Removes `key`. Removing an absent key is a no-op, not an error,
    /// and performs no I/O.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.check_usable()?;
        let snapshot = self.current_meta(self.pager.flushed);
        match self.delete_inner(key) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.revert(&snapshot, &e);
                Err(e)
            }
        }
    }

    fn delete_inner(&mut self, key: &[u8]) -> Result<(), Error> {
        let changed = self.tree.delete(
            &mut PageCtx {
                pager: &mut self.pager,
                freelist: &mut self.freelist,
            },
            key,
        )?;
        if changed {
            self.commit()?;
        }
        Ok(())
    }

    /// Unmaps the file and closes it. The store is crash-safe at every
    /// committed state, so closing needs no extra flushing.
    pub fn close(self) {}

    /// Number of pages in the committed file, the meta and free-list
    /// pages included.
    pub fn num_pages(&self) -> u64 {
        self.pager.flushed
    }

    fn check_usable(&self) -> Result<(), Error> {
        if self.poisoned {
            return Err(err!(
                Corrupt,
                "The store is disabled after an earlier corruption error."
            ));
        }
        Ok(())
    }

    fn current_meta(&self, flushed: u64) -> Meta {
        Meta {
            magic: *META_MAGIC,
            root: self.tree.root,
            flushed,
            free_head_page: self.freelist.head_page,
            free_head_idx: self.freelist.head_idx,
            free_tail_page: self.freelist.tail_page,
            free_tail_idx: self.freelist.tail_idx,
        }
    }

    /// Makes the buffered mutation durable. Data pages are written and
    /// synced before the meta page; the meta write is the commit point.
    fn commit(&mut self) -> Result<(), Error> {
        let size = (self.pager.flushed + self.pager.nappend) * PAGE_SIZE as u64;
        self.pager.extend_mmap(&self.file, size)?;

        for (&ptr, page) in &self.pager.updated {
            self.file.write_all_at(page, ptr * PAGE_SIZE as u64)?;
        }
        self.file.sync_all()?;

        let meta = self.current_meta(self.pager.flushed + self.pager.nappend);
        self.file.write_all_at(&encode_meta(&meta)?, 0)?;
        self.file.sync_all()?;

        let dirty = self.pager.updated.len();
        self.pager.flushed += self.pager.nappend;
        self.pager.nappend = 0;
        self.pager.updated.clear();
        self.freelist.set_max_idx();

        debug!(
            pages = self.pager.flushed,
            root = self.tree.root,
            dirty,
            "Committed update"
        );
        Ok(())
    }

    /// Restores the pre-mutation state after a failed update. The file
    /// still carries the old meta page, so dropping the in-memory changes
    /// is all that is needed.
    fn revert(&mut self, meta: &Meta, cause: &Error) {
        warn!(error = %cause, "Update failed, reverting to the committed state");

        self.tree.root = meta.root;
        self.pager.flushed = meta.flushed;
        self.pager.nappend = 0;
        self.pager.updated.clear();
        self.freelist.head_page = meta.free_head_page;
        self.freelist.head_idx = meta.free_head_idx;
        self.freelist.tail_page = meta.free_tail_page;
        self.freelist.tail_idx = meta.free_tail_idx;
        self.freelist.max_idx = meta.free_tail_idx;

        if meta.root == 0 && meta.flushed == 2 {
            // Nothing has ever been committed; restore the seeded
            // free-list page that lives only in the dirty buffer.
            self.pager.updated.insert(1, vec![0; PAGE_SIZE]);
        }

        if matches!(cause, Error::Corrupt(_)) {
            self.poisoned = true;
        }
    }
}
