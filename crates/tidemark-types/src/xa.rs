//! XA value types: transaction ids, branch counts, branch addresses and the
//! result of searching a transaction by XID.

use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::commit::{Csr, Gcn, ProposalMark, TrxId};
use crate::undo_ptr::SlotPtr;

/// Max bytes in each of `gtrid` and `bqual`.
pub const XID_PART_MAX: usize = 64;

// ---------------------------------------------------------------------------
// Xid
// ---------------------------------------------------------------------------

/// X/Open transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    format_id: i64,
    gtrid: Vec<u8>,
    bqual: Vec<u8>,
}

/// Error returned when an XID component is too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XidError {
    GtridTooLong { len: usize },
    BqualTooLong { len: usize },
}

impl fmt::Display for XidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GtridTooLong { len } => {
                write!(f, "gtrid is {len} bytes, max {XID_PART_MAX}")
            }
            Self::BqualTooLong { len } => {
                write!(f, "bqual is {len} bytes, max {XID_PART_MAX}")
            }
        }
    }
}

impl std::error::Error for XidError {}

impl Xid {
    pub fn new(
        format_id: i64,
        gtrid: impl Into<Vec<u8>>,
        bqual: impl Into<Vec<u8>>,
    ) -> Result<Self, XidError> {
        let gtrid = gtrid.into();
        let bqual = bqual.into();
        if gtrid.len() > XID_PART_MAX {
            return Err(XidError::GtridTooLong { len: gtrid.len() });
        }
        if bqual.len() > XID_PART_MAX {
            return Err(XidError::BqualTooLong { len: bqual.len() });
        }
        Ok(Self {
            format_id,
            gtrid,
            bqual,
        })
    }

    pub const fn format_id(&self) -> i64 {
        self.format_id
    }

    pub fn gtrid(&self) -> &[u8] {
        &self.gtrid
    }

    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }

    /// Stable hash used to map an XID onto a transaction rollback segment.
    ///
    /// Lengths are mixed in so `("ab", "c")` and `("a", "bc")` differ.
    #[allow(clippy::cast_possible_truncation)]
    pub fn hash64(&self) -> u64 {
        let mut buf = Vec::with_capacity(10 + self.gtrid.len() + self.bqual.len());
        buf.extend_from_slice(&self.format_id.to_le_bytes());
        buf.push(self.gtrid.len() as u8);
        buf.extend_from_slice(&self.gtrid);
        buf.push(self.bqual.len() as u8);
        buf.extend_from_slice(&self.bqual);
        xxh3_64(&buf)
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X'{}',X'{}',{}",
            hex(&self.gtrid),
            hex(&self.bqual),
            self.format_id
        )
    }
}

fn hex(bytes: &[u8]) -> String {
    use fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

// ---------------------------------------------------------------------------
// Branch counts and addresses
// ---------------------------------------------------------------------------

/// Participant counts of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct XaBranch {
    pub n_global: u16,
    pub n_local: u16,
}

impl XaBranch {
    pub const NULL: Self = Self {
        n_global: 0,
        n_local: 0,
    };

    pub const fn new(n_global: u16, n_local: u16) -> Self {
        Self { n_global, n_local }
    }

    pub const fn is_null(&self) -> bool {
        self.n_global == 0 && self.n_local == 0
    }
}

/// Address of an XA branch's TXN slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct XaAddr {
    pub tid: Option<TrxId>,
    pub slot_ptr: SlotPtr,
}

impl XaAddr {
    pub const NULL: Self = Self {
        tid: None,
        slot_ptr: SlotPtr::NULL,
    };

    pub const fn new(tid: TrxId, slot_ptr: SlotPtr) -> Self {
        Self {
            tid: Some(tid),
            slot_ptr,
        }
    }

    pub const fn is_null(&self) -> bool {
        self.tid.is_none() && self.slot_ptr.is_null()
    }

    /// Both halves present.
    pub const fn is_valid(&self) -> bool {
        self.tid.is_some() && !self.slot_ptr.is_null()
    }
}

// ---------------------------------------------------------------------------
// Search result
// ---------------------------------------------------------------------------

/// Outcome of looking a transaction up by XID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XaStatus {
    /// Another session is still executing the branch.
    Attached,
    /// Detached and prepared; the gcn is the proposal.
    DetachedPrepare,
    /// Finished and committed.
    Commit,
    /// Finished and rolled back.
    Rollback,
    /// Not found anywhere: never started, or already forgotten.
    NotStartOrForget,
    /// Found in a slot that does not record the outcome.
    NotSupport,
}

impl XaStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Attached => "ATTACHED",
            Self::DetachedPrepare => "DETACHED_PREPARE",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
            Self::NotStartOrForget => "NOTSTART_OR_FORGET",
            Self::NotSupport => "NOT_SUPPORT",
        }
    }
}

impl fmt::Display for XaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything `search_transaction_info` reports about an XID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XaInfo {
    pub status: XaStatus,
    /// Proposal while prepared, commit gcn once finished.
    pub gcn: Gcn,
    pub csr: Csr,
    pub slot: XaAddr,
    pub branch: XaBranch,
    pub maddr: XaAddr,
}

impl XaInfo {
    pub const fn with_status(status: XaStatus) -> Self {
        Self {
            status,
            gcn: Gcn::NULL,
            csr: Csr::Automatic,
            slot: XaAddr::NULL,
            branch: XaBranch::NULL,
            maddr: XaAddr::NULL,
        }
    }

    pub const fn proposal(&self) -> ProposalMark {
        ProposalMark::new(self.gcn, self.csr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::undo_ptr::SlotAddr;

    #[test]
    fn test_xid_limits() {
        assert!(Xid::new(1, vec![0_u8; 64], vec![0_u8; 64]).is_ok());
        assert_eq!(
            Xid::new(1, vec![0_u8; 65], b"b".to_vec()).unwrap_err(),
            XidError::GtridTooLong { len: 65 }
        );
        assert_eq!(
            Xid::new(1, b"g".to_vec(), vec![0_u8; 70]).unwrap_err(),
            XidError::BqualTooLong { len: 70 }
        );
    }

    #[test]
    fn test_xid_hash_is_stable_and_length_aware() {
        let a = Xid::new(1, b"ab".to_vec(), b"c".to_vec()).unwrap();
        let b = Xid::new(1, b"a".to_vec(), b"bc".to_vec()).unwrap();
        assert_eq!(a.hash64(), a.clone().hash64());
        assert_ne!(a.hash64(), b.hash64());
    }

    #[test]
    fn test_xid_display() {
        let xid = Xid::new(7, b"\x01\xff".to_vec(), b"".to_vec()).unwrap();
        assert_eq!(xid.to_string(), "X'01ff',X'',7");
    }

    #[test]
    fn test_xa_addr_validity() {
        let tid = TrxId::new(3).unwrap();
        let slot = SlotAddr::new(1, 4, 8).encode();
        assert!(XaAddr::NULL.is_null());
        assert!(!XaAddr::NULL.is_valid());
        assert!(XaAddr::new(tid, slot).is_valid());
        assert!(!XaAddr::new(tid, SlotPtr::NULL).is_valid());
    }

    #[test]
    fn test_info_defaults() {
        let info = XaInfo::with_status(XaStatus::NotStartOrForget);
        assert!(info.gcn.is_null());
        assert!(info.branch.is_null());
        assert_eq!(info.status.to_string(), "NOTSTART_OR_FORGET");
    }
}
