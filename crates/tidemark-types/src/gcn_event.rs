//! GCN replication event.
//!
//! Wire layout (little-endian):
//!
//! ```text
//! flags:u8 [gcn:u64 if HAVE_GCN] [n_global:u16 n_local:u16 if HAVE_BRANCH_COUNT]
//! ```

use std::fmt;

use crate::commit::{Csr, Gcn, ProposalMark};
use crate::encoding::{append_u16_le, append_u64_le, read_u16_le, read_u64_le};
use crate::xa::XaBranch;

pub const FLAG_HAVE_GCN: u8 = 0x01;
pub const FLAG_HAVE_SNAPSHOT_SEQ: u8 = 0x02;
pub const FLAG_HAVE_COMMITTED_SEQ: u8 = 0x04;
pub const FLAG_GCN_ASSIGNED: u8 = 0x08;
pub const FLAG_GCN_PROPOSAL: u8 = 0x10;
pub const FLAG_HAVE_BRANCH_COUNT: u8 = 0x20;

const GCN_LEN: usize = 8;
const BRANCH_LEN: usize = 4;

/// Error decoding a [`GcnEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcnEventError {
    /// Payload shorter than its flags promise.
    Truncated { needed: usize, available: usize },
}

impl fmt::Display for GcnEventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(f, "GCN event truncated: need {needed} bytes, have {available}")
            }
        }
    }
}

impl std::error::Error for GcnEventError {}

/// Commit-number event written next to each transaction in the replication
/// log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcnEvent {
    flags: u8,
    gcn: Gcn,
    branch: XaBranch,
}

impl GcnEvent {
    /// Event with no gcn and no branch counts.
    pub const EMPTY: Self = Self {
        flags: 0,
        gcn: Gcn::NULL,
        branch: XaBranch::NULL,
    };

    /// Event for a decided commit gcn, or a prepare proposal when
    /// `is_proposal`.
    #[must_use]
    pub fn new(gcn: Gcn, csr: Csr, is_proposal: bool, branch: XaBranch) -> Self {
        let mut flags = 0;
        if !gcn.is_null() {
            flags |= FLAG_HAVE_GCN;
            if csr.is_assigned() {
                flags |= FLAG_GCN_ASSIGNED;
            }
            if is_proposal {
                flags |= FLAG_GCN_PROPOSAL;
            }
        }
        if !branch.is_null() {
            flags |= FLAG_HAVE_BRANCH_COUNT;
        }
        Self { flags, gcn, branch }
    }

    /// Marks the sequence flags carried by binlog transaction events.
    #[must_use]
    pub const fn with_seq_flags(mut self, snapshot: bool, committed: bool) -> Self {
        if snapshot {
            self.flags |= FLAG_HAVE_SNAPSHOT_SEQ;
        }
        if committed {
            self.flags |= FLAG_HAVE_COMMITTED_SEQ;
        }
        self
    }

    pub const fn flags(&self) -> u8 {
        self.flags
    }

    pub const fn has_gcn(&self) -> bool {
        self.flags & FLAG_HAVE_GCN != 0
    }

    pub const fn has_branch(&self) -> bool {
        self.flags & FLAG_HAVE_BRANCH_COUNT != 0
    }

    /// `Gcn::NULL` when the event carries none.
    pub const fn gcn(&self) -> Gcn {
        if self.has_gcn() { self.gcn } else { Gcn::NULL }
    }

    pub const fn csr(&self) -> Csr {
        Csr::from_bit(self.flags & FLAG_GCN_ASSIGNED != 0)
    }

    pub const fn is_proposal(&self) -> bool {
        self.flags & FLAG_GCN_PROPOSAL != 0
    }

    pub const fn branch(&self) -> XaBranch {
        if self.has_branch() {
            self.branch
        } else {
            XaBranch::NULL
        }
    }

    pub const fn mark(&self) -> ProposalMark {
        ProposalMark::new(self.gcn(), self.csr())
    }

    pub const fn encoded_len(&self) -> usize {
        let mut len = 1;
        if self.has_gcn() {
            len += GCN_LEN;
        }
        if self.has_branch() {
            len += BRANCH_LEN;
        }
        len
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.flags);
        if self.has_gcn() {
            append_u64_le(buf, self.gcn.get());
        }
        if self.has_branch() {
            append_u16_le(buf, self.branch.n_global);
            append_u16_le(buf, self.branch.n_local);
        }
    }

    /// Decode one event from the front of `data`; returns the event and the
    /// number of bytes consumed.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), GcnEventError> {
        let Some(&flags) = data.first() else {
            return Err(GcnEventError::Truncated {
                needed: 1,
                available: 0,
            });
        };
        let mut event = Self {
            flags,
            gcn: Gcn::NULL,
            branch: XaBranch::NULL,
        };
        let needed = event.encoded_len();
        if data.len() < needed {
            return Err(GcnEventError::Truncated {
                needed,
                available: data.len(),
            });
        }

        let truncated = GcnEventError::Truncated {
            needed,
            available: data.len(),
        };
        let mut pos = 1;
        if event.has_gcn() {
            event.gcn = Gcn::new(read_u64_le(&data[pos..]).ok_or(truncated)?);
            pos += GCN_LEN;
        }
        if event.has_branch() {
            let n_global = read_u16_le(&data[pos..]).ok_or(truncated)?;
            let n_local = read_u16_le(&data[pos + 2..]).ok_or(truncated)?;
            event.branch = XaBranch::new(n_global, n_local);
            pos += BRANCH_LEN;
        }
        Ok((event, pos))
    }
}

impl Default for GcnEvent {
    fn default() -> Self {
        Self::EMPTY
    }
}
