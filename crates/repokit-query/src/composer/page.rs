use repokit_core::AppResult;
use repokit_core::types::PagingInfo;

/// The `(skip, take)` window of a paged request. Page and size must both
/// be at least one.
pub fn page_window(info: &PagingInfo) -> AppResult<(u64, u64)> {
    info.validate()?;
    Ok((info.offset(), info.limit()))
}
