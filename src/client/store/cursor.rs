//! Lazy query results
//!
//! A [`Cursor`] records filters, ordering and windowing against a borrowed
//! store and only touches documents when [`Cursor::data`], [`Cursor::first`]
//! or [`Cursor::count`] is called. Cursors are plain values: every builder
//! method consumes and returns one, and [`Cursor::copy`] branches a query
//! without affecting the original.
//!
//! ```rust,ignore
//! let running = jobs.find(&json!({"state": "running"}))?;
//! let newest = running.copy().sort_desc("created_at").limit(5).data();
//! let total = running.count();
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::query::{compare_values, values_at, Query};
use super::LocalStore;
use crate::shared::document::Document;
use crate::shared::error::SyncError;

type Comparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

#[derive(Clone)]
enum SortKey {
    Field { path: String, descending: bool },
    By(Comparator),
}

impl fmt::Debug for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortKey::Field { path, descending } => f
                .debug_struct("Field")
                .field("path", path)
                .field("descending", descending)
                .finish(),
            SortKey::By(_) => f.write_str("By(<fn>)"),
        }
    }
}

impl SortKey {
    fn compare(&self, a: &Document, b: &Document) -> Ordering {
        match self {
            SortKey::Field { path, descending } => {
                let left = values_at(a.fields(), path).into_iter().next();
                let right = values_at(b.fields(), path).into_iter().next();
                let ordering = compare_values(left, right);
                if *descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            }
            SortKey::By(comparator) => comparator(a, b),
        }
    }
}

/// A restartable, lazily evaluated view over one store
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    store: &'a LocalStore,
    filters: Vec<Query>,
    order: Vec<SortKey>,
    offset: usize,
    limit: Option<usize>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(store: &'a LocalStore) -> Self {
        Self {
            store,
            filters: Vec::new(),
            order: Vec::new(),
            offset: 0,
            limit: None,
        }
    }

    /// Narrow the result set by another query
    pub fn find(self, query: &Value) -> Result<Self, SyncError> {
        Ok(self.filter(Query::parse(query)?))
    }

    /// Narrow by an already compiled query
    pub fn filter(mut self, query: Query) -> Self {
        if !matches!(query, Query::All) {
            self.filters.push(query);
        }
        self
    }

    /// Ascending sort on a (dotted) field. Later sorts break ties of earlier ones.
    pub fn sort(mut self, field: impl Into<String>) -> Self {
        self.order.push(SortKey::Field {
            path: field.into(),
            descending: false,
        });
        self
    }

    pub fn sort_desc(mut self, field: impl Into<String>) -> Self {
        self.order.push(SortKey::Field {
            path: field.into(),
            descending: true,
        });
        self
    }

    pub fn sort_by<F>(mut self, comparator: F) -> Self
    where
        F: Fn(&Document, &Document) -> Ordering + Send + Sync + 'static,
    {
        self.order.push(SortKey::By(Arc::new(comparator)));
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Window to page `page` (1-based) of `per_page` documents
    pub fn page(self, page: usize, per_page: usize) -> Self {
        let page = page.max(1);
        self.offset((page - 1) * per_page).limit(per_page)
    }

    /// Independent copy of this cursor
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Evaluate the cursor
    pub fn data(&self) -> Vec<&'a Document> {
        let mut documents: Vec<&'a Document> = self
            .store
            .candidates(&self.filters)
            .into_iter()
            .filter(|doc| self.filters.iter().all(|q| q.matches(doc)))
            .collect();

        if !self.order.is_empty() {
            documents.sort_by(|a, b| {
                self.order
                    .iter()
                    .map(|key| key.compare(a, b))
                    .find(|ordering| ordering.is_ne())
                    .unwrap_or(Ordering::Equal)
            });
        }

        let windowed = documents.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => windowed.take(limit).collect(),
            None => windowed.collect(),
        }
    }

    pub fn first(&self) -> Option<&'a Document> {
        self.copy().limit(1).data().into_iter().next()
    }

    /// Size of the current result set, after offset and limit
    pub fn count(&self) -> usize {
        self.data().len()
    }

    pub fn ids(&self) -> Vec<&'a str> {
        self.data().into_iter().map(Document::id).collect()
    }
}
