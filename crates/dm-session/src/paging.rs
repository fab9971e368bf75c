//! Pagination engine
//!
//! Turns a predicate, sort, and page request into a windowed row set. A
//! page runs a content query plus a count query; a slice replaces the
//! count with a one-row look-ahead probe. Both force a deterministic
//! order by appending an id tie-break when the caller's sort does not
//! already pin one, so the union of all pages is exactly the unpaged
//! result set.

use tracing::debug;

use dm_core::{DmError, DmResult, PageRequest};
use dm_query::{Predicate, SortOrder};
use dm_store::{Row, StoreAdapter};

/// Run the content and count queries for one page window.
///
/// When a `count_hint` predicate is supplied, its count is verified
/// against the full count instead of replacing it; a mismatch means the
/// hint and the page predicate disagree about the result set, which fails
/// the query rather than producing silently wrong page arithmetic.
pub(crate) async fn fetch_page_rows(
    store: &dyn StoreAdapter,
    entity_type: &str,
    predicate: &Predicate,
    sort: &SortOrder,
    request: PageRequest,
    count_hint: Option<&Predicate>,
) -> DmResult<(Vec<Row>, i64)> {
    let sort = sort.with_id_tiebreak();
    let rows = store
        .query(
            entity_type,
            predicate,
            &sort,
            request.offset(),
            Some(request.size()),
        )
        .await?;
    let total = store.count(entity_type, predicate).await?;

    if let Some(hint) = count_hint {
        let hinted = store.count(entity_type, hint).await?;
        if hinted != total {
            return Err(DmError::ConsistencyViolation {
                message: format!(
                    "count hint for '{entity_type}' returned {hinted}, \
                     page predicate matches {total}"
                ),
            });
        }
    }

    debug!(
        entity_type,
        page = request.number(),
        size = request.size(),
        returned = rows.len(),
        total,
        "fetched page window"
    );
    Ok((rows, total))
}

/// Run the content query for one slice window with a one-row look-ahead.
/// The probe row signals a next window and is dropped from the content.
pub(crate) async fn fetch_slice_rows(
    store: &dyn StoreAdapter,
    entity_type: &str,
    predicate: &Predicate,
    sort: &SortOrder,
    request: PageRequest,
) -> DmResult<(Vec<Row>, bool)> {
    let sort = sort.with_id_tiebreak();
    let mut rows = store
        .query(
            entity_type,
            predicate,
            &sort,
            request.offset(),
            Some(request.size() + 1),
        )
        .await?;
    let has_next = rows.len() as i64 > request.size();
    rows.truncate(request.size() as usize);

    debug!(
        entity_type,
        page = request.number(),
        size = request.size(),
        returned = rows.len(),
        has_next,
        "fetched slice window"
    );
    Ok((rows, has_next))
}
