//! Query-side types shared by the storage trait and its callers.

use std::cmp::Ordering;

use crate::bso::Bso;
use crate::timestamp::Timestamp;

/// Sortindex value used to order rows that have none.
///
/// Keeps the `index` sort total so continuation tokens can resume past
/// rows without a sortindex.
pub const NULL_SORTINDEX: i64 = i32::MIN as i64;

/// Result ordering for collection scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sort {
    /// `modified` descending, then `id` ascending.
    #[default]
    Newest,
    /// `modified` ascending, then `id` ascending.
    Oldest,
    /// `sortindex` descending, then `modified` descending, then `id`
    /// ascending.
    Index,
}

impl Sort {
    /// Parses the `sort` query parameter.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "newest" => Some(Self::Newest),
            "oldest" => Some(Self::Oldest),
            "index" => Some(Self::Index),
            _ => None,
        }
    }
}

/// Filter set accepted by collection reads and deletes.
#[derive(Debug, Clone, Default)]
pub struct GetFilters {
    /// Restrict to these ids (already validated, at most 100).
    pub ids: Option<Vec<String>>,
    /// Strictly newer than this timestamp.
    pub newer: Option<Timestamp>,
    /// Strictly older than this timestamp.
    pub older: Option<Timestamp>,
    /// Result ordering.
    pub sort: Sort,
    /// Maximum rows returned; `None` is unbounded.
    pub limit: Option<usize>,
    /// Opaque continuation token from `X-Weave-Next-Offset`.
    pub offset: Option<String>,
}

/// One page of scan results plus the continuation token, if truncated.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_offset: Option<String>,
}

impl<T> Page<T> {
    /// An empty, final page.
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_offset: None,
        }
    }
}

/// Outcome of a successful write batch or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Rows actually inserted or updated (deleted, for deletes).
    pub changed: u64,
    /// Live rows remaining in the collection afterwards.
    pub count: u64,
}

/// A validated record ready for upsert.
///
/// Field semantics follow the batch contract: an absent field leaves
/// the stored column untouched; `modified` refreshes only when
/// `payload` is present or `sortindex`/`ttl` actually change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingBso {
    pub id: String,
    pub sortindex: Option<i32>,
    pub payload: Option<String>,
    pub ttl: Option<i64>,
}

impl IncomingBso {
    /// Payload bytes this record would write; zero when absent.
    pub fn payload_bytes(&self) -> usize {
        self.payload.as_deref().map_or(0, str::len)
    }
}

/// Sort-stable continuation token.
///
/// Encodes the sort key and id of the last row of the previous page.
/// The id goes last because ids may themselves contain `:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetToken {
    /// Coalesced sortindex of the last row; only set for [`Sort::Index`].
    pub sortindex: Option<i64>,
    /// `modified` of the last row, in centiseconds.
    pub modified: u64,
    /// Id of the last row.
    pub id: String,
}

impl OffsetToken {
    /// Builds the token for the last row of a page under `sort`.
    pub fn for_row(sort: Sort, bso: &Bso) -> Self {
        Self {
            sortindex: matches!(sort, Sort::Index)
                .then(|| bso.sortindex.map_or(NULL_SORTINDEX, i64::from)),
            modified: bso.modified.as_centis(),
            id: bso.id.clone(),
        }
    }

    /// Serializes the token for `X-Weave-Next-Offset`.
    pub fn encode(&self) -> String {
        match self.sortindex {
            Some(sortindex) => format!("{}:{}:{}", sortindex, self.modified, self.id),
            None => format!("{}:{}", self.modified, self.id),
        }
    }

    /// Decodes a client-supplied token for the given sort order.
    ///
    /// Returns `None` for malformed tokens or a token whose shape does
    /// not match the sort (clients must not reuse tokens across sorts).
    pub fn decode(sort: Sort, token: &str) -> Option<Self> {
        match sort {
            Sort::Index => {
                let (sortindex, rest) = token.split_once(':')?;
                let (modified, id) = rest.split_once(':')?;
                Some(Self {
                    sortindex: Some(sortindex.parse().ok()?),
                    modified: modified.parse().ok()?,
                    id: id.to_string(),
                })
            }
            Sort::Newest | Sort::Oldest => {
                let (modified, id) = token.split_once(':')?;
                Some(Self {
                    sortindex: None,
                    modified: modified.parse().ok()?,
                    id: id.to_string(),
                })
            }
        }
    }
}

/// Comparator for the declared sort orders, shared by the in-memory
/// (ephemeral) scan path so both backends page identically.
pub fn compare_for_sort(sort: Sort, a: &Bso, b: &Bso) -> Ordering {
    let by_id = |a: &Bso, b: &Bso| a.id.cmp(&b.id);
    match sort {
        Sort::Newest => b
            .modified
            .cmp(&a.modified)
            .then_with(|| by_id(a, b)),
        Sort::Oldest => a
            .modified
            .cmp(&b.modified)
            .then_with(|| by_id(a, b)),
        Sort::Index => {
            let sa = a.sortindex.map_or(NULL_SORTINDEX, i64::from);
            let sb = b.sortindex.map_or(NULL_SORTINDEX, i64::from);
            sb.cmp(&sa)
                .then_with(|| b.modified.cmp(&a.modified))
                .then_with(|| by_id(a, b))
        }
    }
}

/// True when `bso` sorts strictly after the row the token describes.
pub fn after_token(sort: Sort, token: &OffsetToken, bso: &Bso) -> bool {
    let modified = bso.modified.as_centis();
    match sort {
        Sort::Newest => {
            modified < token.modified || (modified == token.modified && bso.id > token.id)
        }
        Sort::Oldest => {
            modified > token.modified || (modified == token.modified && bso.id > token.id)
        }
        Sort::Index => {
            let sortindex = bso.sortindex.map_or(NULL_SORTINDEX, i64::from);
            let anchor = token.sortindex.unwrap_or(NULL_SORTINDEX);
            sortindex < anchor
                || (sortindex == anchor
                    && (modified < token.modified
                        || (modified == token.modified && bso.id > token.id)))
        }
    }
}
