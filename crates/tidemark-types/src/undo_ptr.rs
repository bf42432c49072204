//! Undo pointer (UBA) codec.
//!
//! Layout of the 64-bit pointer embedded in every row, low bit first:
//!
//! ```text
//! | offset:16 | page_no:32 | rseg_id:7 | unused:6 | is_slave:1 | csr:1 | state:1 |
//! 0           16           48          55         61           62      63
//! ```
//!
//! The low 55 bits form the slot pointer ([`SlotPtr`]) locating the TXN undo
//! log header; the top bits carry the commit flags cleanout writes back.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::commit::Csr;

// ---------------------------------------------------------------------------
// Field widths
// ---------------------------------------------------------------------------

pub const OFFSET_BITS: u32 = 16;
pub const PAGE_NO_BITS: u32 = 32;
pub const RSEG_ID_BITS: u32 = 7;
pub const UNUSED_BITS: u32 = 6;

const OFFSET_SHIFT: u32 = 0;
const PAGE_NO_SHIFT: u32 = OFFSET_SHIFT + OFFSET_BITS;
const RSEG_ID_SHIFT: u32 = PAGE_NO_SHIFT + PAGE_NO_BITS;
const UNUSED_SHIFT: u32 = RSEG_ID_SHIFT + RSEG_ID_BITS;
const SLAVE_SHIFT: u32 = UNUSED_SHIFT + UNUSED_BITS;
const CSR_SHIFT: u32 = SLAVE_SHIFT + 1;
const STATE_SHIFT: u32 = CSR_SHIFT + 1;

const _: () = assert!(STATE_SHIFT == 63);
const _: () = assert!(OFFSET_BITS + PAGE_NO_BITS + RSEG_ID_BITS + UNUSED_BITS + 3 == 64);

/// Width of the slot-address part of the pointer.
pub const SLOT_PTR_BITS: u32 = UNUSED_SHIFT;
const SLOT_PTR_MASK: u64 = (1_u64 << SLOT_PTR_BITS) - 1;
const UNUSED_MASK: u64 = ((1_u64 << UNUSED_BITS) - 1) << UNUSED_SHIFT;

const OFFSET_MASK: u64 = (1_u64 << OFFSET_BITS) - 1;
const PAGE_NO_MASK: u64 = (1_u64 << PAGE_NO_BITS) - 1;
const RSEG_ID_MASK: u64 = (1_u64 << RSEG_ID_BITS) - 1;

/// Largest rollback segment id.
pub const RSEG_ID_MAX: u8 = (1_u8 << RSEG_ID_BITS) - 1;

/// Real header offsets are strictly below this.
pub const SLOT_OFFSET_LIMIT: u16 = 0xFF00;
/// Offset of the NO_REDO sentinel address.
pub const SLOT_OFFSET_NO_REDO: u16 = 0xFFFF;
/// Page number of the NO_REDO sentinel address.
pub const SLOT_PAGE_NO_FAKE: u32 = 0;

// ---------------------------------------------------------------------------
// SlotAddr
// ---------------------------------------------------------------------------

/// Decoded location of a TXN undo log header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotAddr {
    pub rseg_id: u8,
    pub page_no: u32,
    pub offset: u16,
}

impl SlotAddr {
    /// Nothing assigned.
    pub const NULL: Self = Self {
        rseg_id: 0,
        page_no: 0,
        offset: 0,
    };

    /// Rows without durable undo (temporary tables).
    pub const NO_REDO: Self = Self {
        rseg_id: 0,
        page_no: SLOT_PAGE_NO_FAKE,
        offset: SLOT_OFFSET_NO_REDO,
    };

    /// Address of a real header. `rseg_id` must be in `1..=RSEG_ID_MAX` and
    /// `offset` below [`SLOT_OFFSET_LIMIT`].
    #[inline]
    pub const fn new(rseg_id: u8, page_no: u32, offset: u16) -> Self {
        debug_assert!(rseg_id != 0 && rseg_id <= RSEG_ID_MAX);
        debug_assert!(offset < SLOT_OFFSET_LIMIT);
        Self {
            rseg_id,
            page_no,
            offset,
        }
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.rseg_id == 0 && self.page_no == 0 && self.offset == 0
    }

    #[inline]
    pub const fn is_no_redo(&self) -> bool {
        self.rseg_id == 0 && self.offset >= SLOT_OFFSET_LIMIT
    }

    /// Neither sentinel.
    #[inline]
    pub const fn is_real(&self) -> bool {
        self.rseg_id != 0
    }

    #[inline]
    pub const fn encode(&self) -> SlotPtr {
        SlotPtr(
            ((self.offset as u64) << OFFSET_SHIFT)
                | ((self.page_no as u64) << PAGE_NO_SHIFT)
                | (((self.rseg_id as u64) & RSEG_ID_MASK) << RSEG_ID_SHIFT),
        )
    }
}

impl fmt::Display for SlotAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("slot(null)")
        } else if self.is_no_redo() {
            f.write_str("slot(no_redo)")
        } else {
            write!(f, "slot({}:{}:{})", self.rseg_id, self.page_no, self.offset)
        }
    }
}

// ---------------------------------------------------------------------------
// SlotPtr
// ---------------------------------------------------------------------------

/// Encoded 55-bit slot address, as stored in XA master addresses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct SlotPtr(u64);

impl SlotPtr {
    pub const NULL: Self = Self(0);

    /// Wrap raw bits; bits above the slot width are dropped.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw & SLOT_PTR_MASK)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    pub const fn decode(self) -> SlotAddr {
        SlotAddr {
            rseg_id: ((self.0 >> RSEG_ID_SHIFT) & RSEG_ID_MASK) as u8,
            page_no: ((self.0 >> PAGE_NO_SHIFT) & PAGE_NO_MASK) as u32,
            offset: ((self.0 >> OFFSET_SHIFT) & OFFSET_MASK) as u16,
        }
    }
}

// ---------------------------------------------------------------------------
// UndoPtr
// ---------------------------------------------------------------------------

/// Decoded fields of an [`UndoPtr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UndoPtrParts {
    pub slot: SlotAddr,
    pub committed: bool,
    pub csr: Csr,
    pub is_slave: bool,
}

/// Bit-packed row-embedded reference to the TXN undo header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct UndoPtr(u64);

impl UndoPtr {
    /// All-zero: active, no slot.
    pub const NULL: Self = Self(0);

    /// Committed pointer at the NO_REDO address, stamped on temporary rows.
    pub const NO_REDO_COMMITTED: Self = Self::encode(UndoPtrParts {
        slot: SlotAddr::NO_REDO,
        committed: true,
        csr: Csr::Automatic,
        is_slave: false,
    });

    /// Reinterpret raw bits. The unused field must be zero.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        debug_assert!(raw & UNUSED_MASK == 0);
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn encode(parts: UndoPtrParts) -> Self {
        Self(
            parts.slot.encode().raw()
                | ((parts.is_slave as u64) << SLAVE_SHIFT)
                | ((parts.csr.as_bit() as u64) << CSR_SHIFT)
                | ((parts.committed as u64) << STATE_SHIFT),
        )
    }

    #[inline]
    pub const fn decode(self) -> UndoPtrParts {
        UndoPtrParts {
            slot: self.slot_addr(),
            committed: self.is_committed(),
            csr: self.csr(),
            is_slave: self.is_slave(),
        }
    }

    /// Pointer written by an uncommitted modification.
    #[inline]
    pub const fn active(slot: SlotAddr) -> Self {
        Self(slot.encode().raw())
    }

    #[inline]
    pub const fn slot_ptr(self) -> SlotPtr {
        SlotPtr(self.0 & SLOT_PTR_MASK)
    }

    #[inline]
    pub const fn slot_addr(self) -> SlotAddr {
        self.slot_ptr().decode()
    }

    #[inline]
    pub const fn is_committed(self) -> bool {
        (self.0 >> STATE_SHIFT) & 1 == 1
    }

    #[inline]
    pub const fn is_active(self) -> bool {
        !self.is_committed()
    }

    #[inline]
    pub const fn csr(self) -> Csr {
        Csr::from_bit((self.0 >> CSR_SHIFT) & 1 == 1)
    }

    #[inline]
    pub const fn is_slave(self) -> bool {
        (self.0 >> SLAVE_SHIFT) & 1 == 1
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_no_redo(self) -> bool {
        self.slot_addr().is_no_redo()
    }

    /// Same slot, state set to committed with the given flags.
    #[must_use]
    #[inline]
    pub const fn with_commit(self, csr: Csr, is_slave: bool) -> Self {
        Self::encode(UndoPtrParts {
            slot: self.slot_addr(),
            committed: true,
            csr,
            is_slave,
        })
    }
}

impl fmt::Display for UndoPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.decode();
        write!(
            f,
            "uba[{} {} csr={} slave={}]",
            p.slot,
            if p.committed { "committed" } else { "active" },
            u8::from(p.csr.as_bit()),
            u8::from(p.is_slave),
        )
    }
}
