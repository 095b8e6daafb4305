use chrono::{DateTime, Utc};
use domain::{Order, OrderStatus};

/// Filter applied to order listings.
///
/// Empty `statuses` matches every status. Time bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderFilter {
    pub statuses: Vec<OrderStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl OrderFilter {
    /// Creates a filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Orders still waiting on payment, which is what the timeout wheel tracks.
    pub fn awaiting_payment() -> Self {
        Self::new().with_statuses([OrderStatus::PendingPayment, OrderStatus::Allocating])
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = OrderStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn matches(&self, order: &Order) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&order.status()) {
            return false;
        }
        if let Some(after) = self.created_after
            && order.created_at() < after
        {
            return false;
        }
        if let Some(before) = self.created_before
            && order.created_at() > before
        {
            return false;
        }
        true
    }
}

/// Offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

impl Page {
    pub const DEFAULT_LIMIT: u64 = 50;

    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: u64) -> Self {
        Self::new(0, limit)
    }

    pub fn next(self) -> Self {
        Self::new(self.offset + self.limit, self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first(Self::DEFAULT_LIMIT)
    }
}

/// One page of results plus the total number of matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> PageResult<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }

    /// True when more matches exist after this page.
    pub fn has_more(&self, page: Page) -> bool {
        page.offset + (self.items.len() as u64) < self.total
    }
}
