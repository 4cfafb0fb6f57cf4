use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    models::{ConversationListItem, MessageView, SentMessage, UnreadSummary},
    services::messaging::{Destination, ReadReceipt},
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {message}")]
    Status { status: u16, message: String },
}

impl ClientError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status: 401, .. })
    }
}

/// HTTP surface as seen by one signed-in session.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationListItem>, ClientError>;
    async fn list_messages(
        &self,
        conversation_id: i64,
        take: Option<i64>,
    ) -> Result<Vec<MessageView>, ClientError>;
    async fn send_message(
        &self,
        destination: &Destination,
        body: &str,
    ) -> Result<SentMessage, ClientError>;
    async fn mark_read(&self, conversation_id: i64) -> Result<ReadReceipt, ClientError>;
    async fn unread_summary(&self) -> Result<UnreadSummary, ClientError>;
    async fn set_typing(&self, conversation_id: i64, is_typing: bool) -> Result<(), ClientError>;
}

pub struct HttpChatApi {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpChatApi {
    /// `base_url` is the server origin, e.g. `http://localhost:3000`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body: Value = response.json().await.unwrap_or(Value::Null);
    let message = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error"))
        .to_string();

    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}

fn send_body(destination: &Destination, body: &str) -> Value {
    match destination {
        Destination::Existing(conversation_id) => json!({
            "conversationId": conversation_id,
            "body": body,
        }),
        Destination::New {
            recipient_ids,
            title,
        } => json!({
            "recipientIds": recipient_ids,
            "title": title,
            "body": body,
        }),
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationListItem>, ClientError> {
        self.call(self.http.get(self.url("/conversations"))).await
    }

    async fn list_messages(
        &self,
        conversation_id: i64,
        take: Option<i64>,
    ) -> Result<Vec<MessageView>, ClientError> {
        let mut request = self
            .http
            .get(self.url(&format!("/conversations/{}/messages", conversation_id)));
        if let Some(take) = take {
            request = request.query(&[("take", take)]);
        }
        self.call(request).await
    }

    async fn send_message(
        &self,
        destination: &Destination,
        body: &str,
    ) -> Result<SentMessage, ClientError> {
        // The delivery report riding along with the response is not needed here.
        self.call(
            self.http
                .post(self.url("/messages/send"))
                .json(&send_body(destination, body)),
        )
        .await
    }

    async fn mark_read(&self, conversation_id: i64) -> Result<ReadReceipt, ClientError> {
        self.call(
            self.http
                .post(self.url(&format!("/conversations/{}/read", conversation_id))),
        )
        .await
    }

    async fn unread_summary(&self) -> Result<UnreadSummary, ClientError> {
        self.call(self.http.get(self.url("/messages/unread"))).await
    }

    async fn set_typing(&self, conversation_id: i64, is_typing: bool) -> Result<(), ClientError> {
        let _: Value = self
            .call(
                self.http
                    .post(self.url(&format!("/conversations/{}/typing", conversation_id)))
                    .json(&json!({ "isTyping": is_typing })),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn urls_are_rooted_under_api_v1() {
        let api = HttpChatApi::new("http://localhost:3000/", "token");
        assert_eq!(
            api.url("/messages/unread"),
            "http://localhost:3000/api/v1/messages/unread"
        );
    }

    #[test]
    fn send_body_matches_destination() {
        let existing = send_body(&Destination::Existing(4), "hi");
        assert_eq!(existing["conversationId"], 4);
        assert!(existing.get("recipientIds").is_none());

        let recipient = Uuid::new_v4();
        let new = send_body(
            &Destination::New {
                recipient_ids: vec![recipient],
                title: Some("plans".to_string()),
            },
            "hi",
        );
        assert_eq!(new["recipientIds"][0], recipient.to_string());
        assert_eq!(new["title"], "plans");
        assert_eq!(new["body"], "hi");
    }
}
