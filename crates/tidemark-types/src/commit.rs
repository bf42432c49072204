//! Commit-number value types.
//!
//! Every row carries a transaction reference ([`TxnRecord`]) whose commit
//! status is either stamped in place (after cleanout) or resolved through the
//! undo pointer. The types here are the shared vocabulary of that protocol:
//! local commit numbers ([`Scn`]), global commit numbers ([`Gcn`]), wall time
//! in microseconds ([`Utc`]), the commit source ([`Csr`]) and the composite
//! [`CommitMark`] / [`ProposalMark`].

use std::fmt;
use std::num::NonZeroU64;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::undo_ptr::{SlotAddr, UndoPtr};

/// Wall-clock base (2020-01-01, microseconds) for the sentinel commit marks.
pub const FAKE_UTC_BASE: u64 = 1_577_808_000 * 1_000_000;

// ---------------------------------------------------------------------------
// Scn
// ---------------------------------------------------------------------------

/// System commit number: local, strictly monotonic commit sequence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Scn(u64);

impl Scn {
    /// Not yet assigned.
    pub const NULL: Self = Self(u64::MAX);
    /// Largest assignable value.
    pub const MAX: Self = Self(u64::MAX - 1);
    /// Values at or below this are reserved for sentinel marks.
    pub const RESERVED_MAX: Self = Self(1024);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }

    /// The following scn. Saturates at [`Scn::MAX`].
    #[must_use]
    #[inline]
    pub const fn next(self) -> Self {
        if self.0 >= Self::MAX.0 {
            Self::MAX
        } else {
            Self(self.0 + 1)
        }
    }
}

impl fmt::Display for Scn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("scn#null")
        } else {
            write!(f, "scn#{}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Gcn
// ---------------------------------------------------------------------------

/// Global commit number: logical clock shared across a deployment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Gcn(u64);

impl Gcn {
    /// Not yet decided.
    pub const NULL: Self = Self(u64::MAX);
    /// Largest assignable value.
    pub const MAX: Self = Self(u64::MAX - 1);
    /// First GCN a freshly initialized system hands out; external GCNs below
    /// it are rejected.
    pub const INITIAL: Self = Self(1024);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }

    /// Whether an externally supplied GCN is acceptable.
    #[inline]
    pub const fn is_valid_external(self) -> bool {
        !self.is_null() && self.0 >= Self::INITIAL.0
    }
}

impl fmt::Display for Gcn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("gcn#null")
        } else {
            write!(f, "gcn#{}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Utc
// ---------------------------------------------------------------------------

/// Wall-clock commit time in microseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Utc(u64);

impl Utc {
    pub const NULL: Self = Self(0);
    pub const MAX: Self = Self(i32::MAX as u64 * 1_000_000);

    #[inline]
    pub const fn from_micros(us: u64) -> Self {
        Self(us)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1_000_000)
    }

    #[inline]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Time elapsed from `self` to `now`; zero if `now` is not later.
    #[must_use]
    pub const fn elapsed_until(self, now: Self) -> Duration {
        Duration::from_micros(now.0.saturating_sub(self.0))
    }

    #[must_use]
    pub const fn saturating_add(self, d: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let us = d.as_micros() as u64;
        Self(self.0.saturating_add(us))
    }
}

impl fmt::Display for Utc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

// ---------------------------------------------------------------------------
// Csr
// ---------------------------------------------------------------------------

/// Commit source of a GCN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Csr {
    /// Loaded from the local system GCN.
    #[default]
    Automatic = 0,
    /// Supplied by an external coordinator.
    Assigned = 1,
}

impl Csr {
    #[inline]
    pub const fn from_bit(bit: bool) -> Self {
        if bit { Self::Assigned } else { Self::Automatic }
    }

    #[inline]
    pub const fn as_bit(self) -> bool {
        matches!(self, Self::Assigned)
    }

    #[inline]
    pub const fn is_assigned(self) -> bool {
        matches!(self, Self::Assigned)
    }
}

// ---------------------------------------------------------------------------
// TrxId
// ---------------------------------------------------------------------------

/// Transaction identifier. Domain: `1..=(2^48 - 1)`.
///
/// Transaction ids are never reused; undo slots are.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct TrxId(NonZeroU64);

impl TrxId {
    pub const MAX_RAW: u64 = (1_u64 << 48) - 1;
    pub const MIN: Self = Self(NonZeroU64::MIN);

    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        if raw > Self::MAX_RAW {
            return None;
        }
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trx#{}", self.get())
    }
}

impl TryFrom<u64> for TrxId {
    type Error = InvalidTrxId;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidTrxId { raw: value })
    }
}

/// Error returned when constructing an out-of-domain `TrxId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTrxId {
    raw: u64,
}

impl InvalidTrxId {
    pub const fn raw(self) -> u64 {
        self.raw
    }
}

impl fmt::Display for InvalidTrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid TrxId {} (must satisfy 1 <= id <= {})",
            self.raw,
            TrxId::MAX_RAW
        )
    }
}

impl std::error::Error for InvalidTrxId {}

// ---------------------------------------------------------------------------
// ProposalMark / CommitMark
// ---------------------------------------------------------------------------

/// Tentative GCN decided at prepare for an async commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalMark {
    pub gcn: Gcn,
    pub csr: Csr,
}

impl ProposalMark {
    pub const NULL: Self = Self {
        gcn: Gcn::NULL,
        csr: Csr::Automatic,
    };

    pub const fn new(gcn: Gcn, csr: Csr) -> Self {
        Self { gcn, csr }
    }

    pub const fn is_null(&self) -> bool {
        self.gcn.is_null()
    }
}

impl Default for ProposalMark {
    fn default() -> Self {
        Self::NULL
    }
}

/// The commit image assigned once per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitMark {
    pub scn: Scn,
    pub utc: Utc,
    pub gcn: Gcn,
    pub csr: Csr,
}

impl CommitMark {
    pub const NULL: Self = Self {
        scn: Scn::NULL,
        utc: Utc::NULL,
        gcn: Gcn::NULL,
        csr: Csr::Automatic,
    };

    /// Deterministic image returned when the undo header is unreadable.
    pub const CORRUPTED: Self = Self::fake(1);

    /// Image for rows whose undo history has been lost.
    pub const LOST: Self = Self::fake(2);

    /// Image stamped on temporary-table rows, which never carry durable undo.
    pub const TEMPORARY: Self = Self::fake(3);

    const fn fake(n: u64) -> Self {
        Self {
            scn: Scn::new(n),
            utc: Utc::from_micros(FAKE_UTC_BASE + n),
            gcn: Gcn::new(n),
            csr: Csr::Automatic,
        }
    }

    pub const fn new(scn: Scn, utc: Utc, gcn: Gcn, csr: Csr) -> Self {
        Self { scn, utc, gcn, csr }
    }

    pub const fn is_null(&self) -> bool {
        self.scn.is_null()
    }

    /// Every component has been assigned.
    pub const fn is_allocated(&self) -> bool {
        !self.scn.is_null() && !self.gcn.is_null() && !self.utc.is_null()
    }

    /// One of the reserved sentinel images.
    pub const fn is_fake(&self) -> bool {
        !self.scn.is_null() && self.scn.get() <= Scn::RESERVED_MAX.get()
    }

    pub const fn proposal(&self) -> ProposalMark {
        ProposalMark::new(self.gcn, self.csr)
    }
}

impl Default for CommitMark {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for CommitMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}, {}, {:?}}}", self.scn, self.gcn, self.utc, self.csr)
    }
}

// ---------------------------------------------------------------------------
// Slot lifecycle and lookup status
// ---------------------------------------------------------------------------

/// Persistent lifecycle state of a TXN slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxnState {
    Active = 1,
    Committed = 2,
    Purged = 3,
    Erased = 4,
}

impl TxnState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Committed => "COMMITTED",
            Self::Purged => "PURGED",
            Self::Erased => "ERASED",
        }
    }

    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Active),
            2 => Some(Self::Committed),
            3 => Some(Self::Purged),
            4 => Some(Self::Erased),
            _ => None,
        }
    }
}

/// Outcome status of resolving a row's transaction reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LookupStatus {
    Active,
    Committed,
    Purged,
    Erased,
    /// The slot now belongs to another transaction; the image is the slot's
    /// archived previous image.
    Reuse,
    /// Undo header unreadable; the image is [`CommitMark::CORRUPTED`].
    UndoCorrupted,
}

impl LookupStatus {
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Ordering used to check that a trx's observed status never regresses.
    pub const fn rank(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Committed => 1,
            Self::Purged => 2,
            Self::Erased => 3,
            Self::Reuse => 4,
            Self::UndoCorrupted => 5,
        }
    }
}

impl From<TxnState> for LookupStatus {
    fn from(state: TxnState) -> Self {
        match state {
            TxnState::Active => Self::Active,
            TxnState::Committed => Self::Committed,
            TxnState::Purged => Self::Purged,
            TxnState::Erased => Self::Erased,
        }
    }
}

// ---------------------------------------------------------------------------
// TxnRecord / TxnLookupResult
// ---------------------------------------------------------------------------

/// A row's transaction reference as stored physically in the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnRecord {
    pub trx_id: TrxId,
    pub scn: Scn,
    pub undo_ptr: UndoPtr,
    pub gcn: Gcn,
}

impl TxnRecord {
    /// Reference written by an uncommitted modification.
    pub const fn active(trx_id: TrxId, slot: SlotAddr) -> Self {
        Self {
            trx_id,
            scn: Scn::NULL,
            undo_ptr: UndoPtr::active(slot),
            gcn: Gcn::NULL,
        }
    }

    /// Reference for a temporary-table row.
    pub const fn temporary(trx_id: TrxId) -> Self {
        Self {
            trx_id,
            scn: CommitMark::TEMPORARY.scn,
            undo_ptr: UndoPtr::NO_REDO_COMMITTED,
            gcn: CommitMark::TEMPORARY.gcn,
        }
    }

    #[inline]
    pub const fn is_committed(&self) -> bool {
        self.undo_ptr.is_committed()
    }

    /// Stamp a resolved commit image onto this reference.
    pub fn set_committed(&mut self, image: &CommitMark, is_slave: bool) {
        self.scn = image.scn;
        self.gcn = image.gcn;
        self.undo_ptr = self.undo_ptr.with_commit(image.csr, is_slave);
    }
}

/// Result of resolving a row's transaction reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnLookupResult {
    pub image: CommitMark,
    pub status: LookupStatus,
}

impl TxnLookupResult {
    pub const ACTIVE: Self = Self {
        image: CommitMark::NULL,
        status: LookupStatus::Active,
    };

    pub const CORRUPTED: Self = Self {
        image: CommitMark::CORRUPTED,
        status: LookupStatus::UndoCorrupted,
    };

    pub const fn new(image: CommitMark, status: LookupStatus) -> Self {
        Self { image, status }
    }

    pub const fn is_active(&self) -> bool {
        self.status.is_active()
    }
}
