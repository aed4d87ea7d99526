use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    domain::RoomId,
    error::ApiException,
    protocol::{Message, MessagePageQuery, SendMessageRequest},
};
use tracing::{debug, warn};

use crate::{
    config::SyncConfig, error::SyncError, history::HistoryFetcher, optimistic::MessageSender,
};

/// REST client for the history and send endpoints.
pub struct HttpBackend {
    http: Client,
    config: SyncConfig,
}

impl HttpBackend {
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(http: Client, config: &SyncConfig) -> Self {
        Self {
            http,
            config: config.clone(),
        }
    }
}

async fn check_status(response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let err = ApiException::from_response(status.as_u16(), body);
    warn!(status = err.status, "http: request rejected: {}", err.message);
    Err(err.into())
}

#[async_trait]
impl HistoryFetcher for HttpBackend {
    async fn fetch_page(
        &self,
        credential: &str,
        room_id: &RoomId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>, SyncError> {
        let url = self.config.messages_url(room_id)?;
        debug!(room_id = %room_id, page, page_size, "http: fetching history page");
        let response = self
            .http
            .get(url)
            .bearer_auth(credential)
            .query(&MessagePageQuery { page, page_size })
            .send()
            .await?;
        let messages = check_status(response).await?.json().await?;
        Ok(messages)
    }
}

#[async_trait]
impl MessageSender for HttpBackend {
    async fn send_message(
        &self,
        credential: &str,
        room_id: &RoomId,
        content: &str,
    ) -> Result<Message, SyncError> {
        let url = self.config.messages_url(room_id)?;
        let response = self
            .http
            .post(url)
            .bearer_auth(credential)
            .json(&SendMessageRequest {
                content: content.to_string(),
            })
            .send()
            .await?;
        let message = check_status(response).await?.json().await?;
        Ok(message)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
