/// `CardBackend` over the PostgREST `cards` table, with the push feed from
/// the Realtime socket.
///
/// The table is expected to stamp `created_at`/`updated_at` itself (column
/// defaults plus an update trigger); inserts never send timestamps.
use std::time::Duration;

use boardsync_core::backend::{CardBackend, ChangeStream, TransportError};
use boardsync_core::types::{Card, Column};
use futures_util::future::BoxFuture;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Serialize;
use serde_json::json;

use crate::config::ClientConfig;
use crate::realtime::{self, RealtimeEndpoint};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct RestBackend {
    client: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    realtime: RealtimeEndpoint,
}

/// Insert body: the client-chosen fields only.
#[derive(Debug, Serialize)]
struct NewCardRow<'a> {
    id: &'a str,
    project_id: &'a str,
    column_type: Column,
    content: &'a str,
    order_index: f64,
    created_by: &'a str,
}

impl<'a> From<&'a Card> for NewCardRow<'a> {
    fn from(card: &'a Card) -> Self {
        Self {
            id: &card.id,
            project_id: &card.project_id,
            column_type: card.column_type,
            content: &card.content,
            order_index: card.order_index,
            created_by: &card.created_by,
        }
    }
}

impl RestBackend {
    pub fn new(config: &ClientConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        let base_url = config.url.trim_end_matches('/').to_string();
        Ok(Self {
            realtime: RealtimeEndpoint::new(
                &base_url,
                &config.anon_key,
                config.access_token.as_deref(),
            ),
            client,
            base_url,
            api_key: config.anon_key.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn cards_url(&self) -> String {
        format!("{}/rest/v1/cards", self.base_url)
    }

    fn request(&self, method: Method, query: &[(&str, String)]) -> RequestBuilder {
        let token = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.client
            .request(method, self.cards_url())
            .query(query)
            .header("apikey", &self.api_key)
            .bearer_auth(token)
    }

    /// PATCH a single row and return its new image.
    fn patch(
        &self,
        card_id: &str,
        body: serde_json::Value,
    ) -> BoxFuture<'static, Result<Option<Card>, TransportError>> {
        let request = self
            .request(Method::PATCH, &[("id", eq(card_id))])
            .header("Prefer", "return=representation")
            .json(&body);
        Box::pin(async move {
            let rows = read_rows(request.send().await.map_err(network)?).await?;
            Ok(rows.into_iter().next())
        })
    }
}

fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

fn network(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}

async fn check(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    log::warn!(target: "boardsync.rest", "Request rejected ({}): {}", status, message);
    Err(TransportError::Rejected {
        status: status.as_u16(),
        message,
    })
}

async fn read_rows(response: Response) -> Result<Vec<Card>, TransportError> {
    check(response)
        .await?
        .json::<Vec<Card>>()
        .await
        .map_err(|e| TransportError::Decode(e.to_string()))
}

impl CardBackend for RestBackend {
    fn load_cards(&self, board_id: &str) -> BoxFuture<'static, Result<Vec<Card>, TransportError>> {
        let request = self.request(
            Method::GET,
            &[
                ("select", "*".to_string()),
                ("project_id", eq(board_id)),
                ("order", "order_index.asc".to_string()),
            ],
        );
        Box::pin(async move { read_rows(request.send().await.map_err(network)?).await })
    }

    fn insert_card(&self, card: Card) -> BoxFuture<'static, Result<Card, TransportError>> {
        let request = self
            .request(Method::POST, &[])
            .header("Prefer", "return=representation")
            .json(&[NewCardRow::from(&card)]);
        Box::pin(async move {
            let rows = read_rows(request.send().await.map_err(network)?).await?;
            rows.into_iter().next().ok_or_else(|| {
                TransportError::Decode(format!("insert of {} returned no row", card.id))
            })
        })
    }

    fn update_position(
        &self,
        card_id: &str,
        column: Column,
        order_index: f64,
    ) -> BoxFuture<'static, Result<Option<Card>, TransportError>> {
        self.patch(card_id, json!({ "column_type": column, "order_index": order_index }))
    }

    fn update_content(
        &self,
        card_id: &str,
        content: &str,
    ) -> BoxFuture<'static, Result<Option<Card>, TransportError>> {
        self.patch(card_id, json!({ "content": content }))
    }

    fn delete_card(&self, card_id: &str) -> BoxFuture<'static, Result<(), TransportError>> {
        let request = self.request(Method::DELETE, &[("id", eq(card_id))]);
        Box::pin(async move {
            check(request.send().await.map_err(network)?).await?;
            Ok(())
        })
    }

    fn subscribe(
        &self,
        board_id: &str,
    ) -> BoxFuture<'static, Result<ChangeStream, TransportError>> {
        let endpoint = self.realtime.clone();
        let board_id = board_id.to_string();
        Box::pin(async move { realtime::subscribe(&endpoint, &board_id).await })
    }
}
