//! Offset/limit paging over a counted result set.
//!
//! The listing RPC returns `next_paging`/`previous_paging` blocks the client
//! feeds back verbatim; a page is only advertised when it actually exists.

use tonic::Status;

/// Applied when the request carries no paging block or a zero limit.
pub const DEFAULT_PAGE_LIMIT: i64 = 100;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PagingError {
    #[error("offset {offset} is beyond the result set ({total} items)")]
    OffsetOutOfRange { offset: i64, total: i64 },

    #[error("invalid paging limit {limit}")]
    InvalidLimit { limit: i64 },
}

impl From<PagingError> for Status {
    fn from(err: PagingError) -> Self {
        Status::invalid_argument(err.to_string())
    }
}

/// A validated window into a result set of `total` items.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageWindow {
    pub limit: i64,
    pub offset: i64,
    total: i64,
}

impl PageWindow {
    /// Validate a requested window against the counted total. A zero limit
    /// falls back to [`DEFAULT_PAGE_LIMIT`]; an offset past the end is an
    /// error rather than an empty page.
    pub fn new(limit: i64, offset: i64, total: i64) -> Result<Self, PagingError> {
        if limit < 0 {
            return Err(PagingError::InvalidLimit { limit });
        }
        let limit = if limit == 0 { DEFAULT_PAGE_LIMIT } else { limit };
        if offset < 0 || offset > total {
            return Err(PagingError::OffsetOutOfRange { offset, total });
        }
        Ok(Self {
            limit,
            offset,
            total,
        })
    }

    /// Offset of the following page, when more items remain.
    pub fn next_offset(&self) -> Option<i64> {
        let next = self.offset + self.limit;
        (next < self.total).then_some(next)
    }

    /// Offset of the preceding page, when this window is not the first.
    pub fn previous_offset(&self) -> Option<i64> {
        let prev = self.offset - self.limit;
        (prev >= 0).then_some(prev)
    }
}
