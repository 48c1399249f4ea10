//! Paginated, day-grouped message listings.
//!
//! A page is cut from the room's messages sorted newest first, and only
//! then grouped by UTC calendar day. Pages therefore cut across day
//! boundaries: the last bucket of a page may hold part of a day whose
//! remaining messages continue on the next page.

use crate::error::{Error, Result};
use crate::model::ChatMessage;
use crate::room::RoomKey;
use crate::store::MessageStore;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Default page size.
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// A validated page request. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: u32,
    limit: u32,
}

impl PageRequest {
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `page` or `limit` is zero.
    pub fn new(page: u32, limit: u32) -> Result<Self> {
        if page == 0 {
            return Err(Error::Validation("page must be at least 1".into()));
        }
        if limit == 0 {
            return Err(Error::Validation("limit must be at least 1".into()));
        }
        Ok(Self { page, limit })
    }

    #[must_use]
    pub fn page(&self) -> u32 {
        self.page
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Number of messages skipped before this page.
    #[must_use]
    pub fn offset(&self) -> usize {
        (self.page as usize - 1).saturating_mul(self.limit as usize)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// Messages of one calendar day, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayGroup {
    /// ISO date (`YYYY-MM-DD`, UTC).
    pub day: NaiveDate,
    pub messages: Vec<ChatMessage>,
}

/// Group messages by UTC day, newest day first.
///
/// Order within a day follows the input order.
#[must_use]
pub fn group_by_day(messages: Vec<ChatMessage>) -> Vec<DayGroup> {
    let mut groups: Vec<DayGroup> = Vec::new();

    for message in messages {
        let day = message.created_at.date_naive();
        match groups.iter_mut().find(|group| group.day == day) {
            Some(group) => group.messages.push(message),
            None => groups.push(DayGroup {
                day,
                messages: vec![message],
            }),
        }
    }

    groups.sort_by(|a, b| b.day.cmp(&a.day));
    groups
}

/// List one page of a room, grouped by day.
///
/// # Errors
///
/// Propagates store failures.
pub async fn list_by_room(
    store: &dyn MessageStore,
    room: &RoomKey,
    page: PageRequest,
) -> Result<Vec<DayGroup>> {
    let messages = store
        .recent_in_room(room, page.offset(), page.limit() as usize)
        .await?;
    Ok(group_by_day(messages))
}
