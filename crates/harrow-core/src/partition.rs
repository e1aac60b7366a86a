//! Deterministic splitting of the page index space into work units.

use crate::error::AppError;
use crate::models::WorkUnit;

/// Split `[0, total)` into contiguous, disjoint units, one per worker slot.
///
/// Every slot but the last gets `total / worker_count` pages; the last slot
/// absorbs the remainder. When there are fewer pages than slots, one
/// single-page unit is produced per page so no empty range is dispatched.
pub fn partition(total: u64, worker_count: usize, page_size: u32) -> Result<Vec<WorkUnit>, AppError> {
    if worker_count == 0 {
        return Err(AppError::ConfigError(
            "worker count must be at least 1".into(),
        ));
    }

    let slots = worker_count as u64;
    if total < slots {
        return Ok((0..total)
            .map(|page| WorkUnit {
                range_start: page,
                range_end: page + 1,
                page_size,
            })
            .collect());
    }

    let base = total / slots;
    Ok((0..slots)
        .map(|i| WorkUnit {
            range_start: i * base,
            range_end: if i + 1 == slots { total } else { (i + 1) * base },
            page_size,
        })
        .collect())
}
