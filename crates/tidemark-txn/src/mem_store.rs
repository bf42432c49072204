//! In-memory reference implementations of the storage collaborators.
//!
//! Used by tests and benches. Pages are latched individually with
//! `parking_lot::RwLock`; the key index is a single map.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use tidemark_error::{Result, TidemarkError};
use tidemark_types::{PageId, RowPos, RsegId, SlotAddr, TableId, TrxId, TxnRecord};

use crate::storage::{RowKey, RowPage, RowStore, TxnHeader, UndoRecord, UndoStore};

/// Byte offset of the TXN header inside its first undo page.
pub const TXN_HEADER_OFFSET: u16 = 96;

// ---------------------------------------------------------------------------
// MemUndoStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemSegment {
    header: Option<TxnHeader>,
    records: Vec<UndoRecord>,
}

/// Undo segments kept in a hash map keyed by header address.
#[derive(Debug)]
pub struct MemUndoStore {
    segments: RwLock<HashMap<SlotAddr, MemSegment>>,
    next_page: AtomicU32,
    /// Max live segments per rollback segment; `None` is unbounded.
    per_rseg_limit: Option<usize>,
}

impl Default for MemUndoStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemUndoStore {
    pub fn new() -> Self {
        Self {
            segments: RwLock::new(HashMap::new()),
            next_page: AtomicU32::new(1),
            per_rseg_limit: None,
        }
    }

    pub fn with_segment_limit(limit: usize) -> Self {
        Self {
            per_rseg_limit: Some(limit),
            ..Self::new()
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Overwrite the header magic, as a torn or foreign page would read.
    pub fn corrupt_magic(&self, addr: SlotAddr) {
        if let Some(header) = self
            .segments
            .write()
            .get_mut(&addr)
            .and_then(|seg| seg.header.as_mut())
        {
            header.magic ^= 0xDEAD_BEEF;
        }
    }
}

impl UndoStore for MemUndoStore {
    fn allocate_segment(&self, rseg_id: RsegId) -> Result<SlotAddr> {
        let mut segments = self.segments.write();
        if let Some(limit) = self.per_rseg_limit {
            let used = segments.keys().filter(|a| a.rseg_id == rseg_id).count();
            if used >= limit {
                return Err(TidemarkError::SegmentSpaceExhausted { rseg_id });
            }
        }
        let page_no = self.next_page.fetch_add(1, Ordering::Relaxed);
        let addr = SlotAddr::new(rseg_id, page_no, TXN_HEADER_OFFSET);
        segments.insert(addr, MemSegment::default());
        Ok(addr)
    }

    fn free_segment(&self, addr: SlotAddr) {
        self.segments.write().remove(&addr);
    }

    fn read_header(&self, addr: SlotAddr) -> Option<TxnHeader> {
        self.segments.read().get(&addr)?.header.clone()
    }

    fn write_header(&self, addr: SlotAddr, header: &TxnHeader) -> Result<()> {
        let mut segments = self.segments.write();
        let seg = segments
            .get_mut(&addr)
            .ok_or_else(|| TidemarkError::internal(format!("write to unallocated {addr}")))?;
        seg.header = Some(header.clone());
        Ok(())
    }

    fn append_record(&self, addr: SlotAddr, record: UndoRecord) -> Result<()> {
        let mut segments = self.segments.write();
        let seg = segments
            .get_mut(&addr)
            .ok_or_else(|| TidemarkError::internal(format!("append to unallocated {addr}")))?;
        seg.records.push(record);
        Ok(())
    }

    fn records(&self, addr: SlotAddr) -> Vec<UndoRecord> {
        self.segments
            .read()
            .get(&addr)
            .map(|seg| seg.records.clone())
            .unwrap_or_default()
    }

    fn record_count(&self, addr: SlotAddr) -> usize {
        self.segments
            .read()
            .get(&addr)
            .map_or(0, |seg| seg.records.len())
    }

    fn reset_records(&self, addr: SlotAddr) {
        if let Some(seg) = self.segments.write().get_mut(&addr) {
            seg.records.clear();
        }
    }
}

// ---------------------------------------------------------------------------
// MemRowStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemRow {
    key: RowKey,
    rec: TxnRecord,
    delete_marked: bool,
    hint: Option<PageId>,
}

#[derive(Debug, Default)]
struct MemPage {
    slots: Vec<Option<MemRow>>,
}

impl RowPage for MemPage {
    fn txn_record(&self, slot: u16) -> Option<TxnRecord> {
        self.slots
            .get(usize::from(slot))?
            .as_ref()
            .map(|row| row.rec)
    }

    fn set_txn_fields(&mut self, slot: u16, rec: &TxnRecord) {
        if let Some(Some(row)) = self.slots.get_mut(usize::from(slot)) {
            row.rec = *rec;
        }
    }

    fn set_page_hint(&mut self, slot: u16, hint: PageId) {
        if let Some(Some(row)) = self.slots.get_mut(usize::from(slot)) {
            row.hint = Some(hint);
        }
    }
}

type PageRef = Arc<RwLock<MemPage>>;

/// Rows of every table, packed `rows_per_page` to a page.
#[derive(Debug)]
pub struct MemRowStore {
    rows_per_page: u16,
    pages: RwLock<HashMap<PageId, PageRef>>,
    index: RwLock<HashMap<(TableId, RowKey), RowPos>>,
    /// Page currently filled per table.
    tails: RwLock<HashMap<TableId, u32>>,
}

impl Default for MemRowStore {
    fn default() -> Self {
        Self::new(16)
    }
}

impl MemRowStore {
    pub fn new(rows_per_page: u16) -> Self {
        Self {
            rows_per_page: rows_per_page.max(1),
            pages: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            tails: RwLock::new(HashMap::new()),
        }
    }

    fn page(&self, id: PageId) -> Option<PageRef> {
        self.pages.read().get(&id).cloned()
    }

    fn alloc_slot(&self, table: TableId) -> RowPos {
        let mut tails = self.tails.write();
        let mut pages = self.pages.write();
        let page_no = tails.entry(table).or_insert(1);
        loop {
            let id = PageId::new(table, *page_no);
            let page = pages.entry(id).or_default();
            let mut page = page.write();
            if page.slots.len() < usize::from(self.rows_per_page) {
                page.slots.push(None);
                #[allow(clippy::cast_possible_truncation)]
                let slot = (page.slots.len() - 1) as u16;
                return RowPos::new(id, slot);
            }
            *page_no += 1;
        }
    }

    fn with_row<R>(&self, pos: RowPos, f: impl FnOnce(&MemRow) -> R) -> Option<R> {
        let page = self.page(pos.page)?;
        let page = page.read();
        page.slots.get(usize::from(pos.slot))?.as_ref().map(f)
    }

    fn take_row(&self, pos: RowPos) -> Option<MemRow> {
        let page = self.page(pos.page)?;
        let row = page.write().slots.get_mut(usize::from(pos.slot))?.take()?;
        self.index.write().remove(&(pos.table(), row.key));
        Some(row)
    }

    pub fn is_delete_marked(&self, pos: RowPos) -> Option<bool> {
        self.with_row(pos, |row| row.delete_marked)
    }

    pub fn row_count(&self) -> usize {
        self.index.read().len()
    }

    /// Move a row to a fresh slot, as a page split would; returns the new
    /// position.
    pub fn relocate(&self, pos: RowPos) -> Option<RowPos> {
        let row = self.take_row(pos)?;
        let new_pos = self.alloc_slot(pos.table());
        let page = self.page(new_pos.page)?;
        let key = row.key;
        page.write().slots[usize::from(new_pos.slot)] = Some(row);
        self.index.write().insert((pos.table(), key), new_pos);
        Some(new_pos)
    }
}

impl RowStore for MemRowStore {
    fn txn_record(&self, pos: RowPos) -> Option<TxnRecord> {
        self.with_row(pos, |row| row.rec)
    }

    fn with_page_exclusive(&self, page: PageId, f: &mut dyn FnMut(&mut dyn RowPage)) -> bool {
        let Some(page) = self.page(page) else {
            return false;
        };
        let mut guard = page.write();
        f(&mut *guard);
        true
    }

    fn write_row(
        &self,
        table: TableId,
        key: RowKey,
        rec: TxnRecord,
        delete_marked: bool,
    ) -> RowPos {
        let existing = self.index.read().get(&(table, key)).copied();
        let pos = existing.unwrap_or_else(|| {
            let pos = self.alloc_slot(table);
            self.index.write().insert((table, key), pos);
            pos
        });
        if let Some(page) = self.page(pos.page) {
            let mut page = page.write();
            let slot = &mut page.slots[usize::from(pos.slot)];
            let hint = slot.as_ref().and_then(|row| row.hint);
            *slot = Some(MemRow {
                key,
                rec,
                delete_marked,
                hint,
            });
        }
        pos
    }

    fn restore_row(&self, pos: RowPos, rec: Option<TxnRecord>) {
        match rec {
            None => {
                self.take_row(pos);
            }
            Some(rec) => {
                if let Some(page) = self.page(pos.page) {
                    if let Some(Some(row)) = page.write().slots.get_mut(usize::from(pos.slot)) {
                        row.rec = rec;
                        row.delete_marked = false;
                    }
                }
            }
        }
    }

    fn row_key(&self, pos: RowPos) -> Option<RowKey> {
        self.with_row(pos, |row| row.key)
    }

    fn search(&self, table: TableId, key: RowKey) -> Option<RowPos> {
        self.index.read().get(&(table, key)).copied()
    }

    fn search_page(&self, page: PageId, key: RowKey) -> Option<RowPos> {
        let page_ref = self.page(page)?;
        let guard = page_ref.read();
        guard.slots.iter().enumerate().find_map(|(slot, row)| {
            let row = row.as_ref()?;
            #[allow(clippy::cast_possible_truncation)]
            (row.key == key).then_some(RowPos::new(page, slot as u16))
        })
    }

    fn page_hint(&self, pos: RowPos) -> Option<PageId> {
        self.with_row(pos, |row| row.hint).flatten()
    }

    fn write_secondary(&self, table: TableId, key: RowKey, hint: Option<PageId>) -> RowPos {
        let pos = self.alloc_slot(table);
        if let Some(page) = self.page(pos.page) {
            page.write().slots[usize::from(pos.slot)] = Some(MemRow {
                key,
                rec: TxnRecord::temporary(TrxId::MIN),
                delete_marked: false,
                hint,
            });
        }
        pos
    }

    fn purge_row(&self, pos: RowPos, trx_id: TrxId) -> bool {
        let removable = self
            .with_row(pos, |row| row.delete_marked && row.rec.trx_id == trx_id)
            .unwrap_or(false);
        if removable {
            self.take_row(pos);
        }
        removable
    }
}
