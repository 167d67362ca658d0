//! XA transaction branch identifiers.

use crate::error::{ResourceError, ResourceResult, XaErrorCode};
use std::fmt;

/// Maximum size of a global transaction id in bytes.
pub const MAX_GTRID_SIZE: usize = 64;
/// Maximum size of a branch qualifier in bytes.
pub const MAX_BQUAL_SIZE: usize = 64;

/// Identifies one branch of a distributed transaction.
///
/// An `Xid` is the triple (format id, global transaction id, branch
/// qualifier). All branches of one global transaction share the same
/// global transaction id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Xid {
    format_id: i32,
    gtrid: Vec<u8>,
    bqual: Vec<u8>,
}

impl Xid {
    /// Creates a new XID.
    ///
    /// # Errors
    ///
    /// Returns an error if either identifier exceeds the XA size limits.
    pub fn new(format_id: i32, gtrid: &[u8], bqual: &[u8]) -> ResourceResult<Self> {
        if gtrid.is_empty() || gtrid.len() > MAX_GTRID_SIZE {
            return Err(ResourceError::xa(
                XaErrorCode::Protocol,
                format!("invalid gtrid length {}", gtrid.len()),
            ));
        }
        if bqual.len() > MAX_BQUAL_SIZE {
            return Err(ResourceError::xa(
                XaErrorCode::Protocol,
                format!("invalid bqual length {}", bqual.len()),
            ));
        }
        Ok(Self {
            format_id,
            gtrid: gtrid.to_vec(),
            bqual: bqual.to_vec(),
        })
    }

    /// Returns the format identifier.
    #[must_use]
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Returns the global transaction id.
    #[must_use]
    pub fn gtrid(&self) -> &[u8] {
        &self.gtrid
    }

    /// Returns the branch qualifier.
    #[must_use]
    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }

    /// Returns true if both XIDs belong to the same global transaction.
    #[must_use]
    pub fn same_transaction(&self, other: &Xid) -> bool {
        self.format_id == other.format_id && self.gtrid == other.gtrid
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        write_hex(f, &self.gtrid)?;
        write!(f, ":")?;
        write_hex(f, &self.bqual)
    }
}
