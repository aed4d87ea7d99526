use async_trait::async_trait;
use shared::{domain::RoomId, protocol::Message};

use crate::error::SyncError;

/// One page of a room's past messages. Order within the page is not relied
/// upon; the reconciler sorts.
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        credential: &str,
        room_id: &RoomId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>, SyncError>;
}
