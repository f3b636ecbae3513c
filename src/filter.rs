//! Category/status filtering and pagination for document lists.

use serde::{Deserialize, Serialize};

use crate::models::{Document, DocumentStatus};

pub const DEFAULT_PAGE_LIMIT: usize = 10;
pub const MAX_PAGE_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub total_pages: usize,
}

/// Case-insensitive category match; `None` keeps everything.
pub fn filter_documents(
    docs: Vec<Document>,
    category: Option<&str>,
    status: Option<DocumentStatus>,
) -> Vec<Document> {
    let category = category.map(str::trim).filter(|c| !c.is_empty() && *c != "all");
    docs.into_iter()
        .filter(|doc| match category {
            Some(wanted) => doc
                .document_category
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(wanted)),
            None => true,
        })
        .filter(|doc| status.map_or(true, |s| doc.status == s))
        .collect()
}

/// 1-based pages. Page 0 reads as page 1, limit is clamped to
/// `1..=MAX_PAGE_LIMIT`, and pages past the end are empty.
pub fn paginate<T>(items: Vec<T>, page: Option<usize>, limit: Option<usize>) -> Page<T> {
    let page = page.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    let total = items.len();
    let total_pages = total.div_ceil(limit);

    let items = items
        .into_iter()
        .skip((page - 1).saturating_mul(limit))
        .take(limit)
        .collect();

    Page {
        items,
        page,
        limit,
        total,
        total_pages,
    }
}
