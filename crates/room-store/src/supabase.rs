//! PostgREST-backed [`RoomStore`].

use crate::query::{Order, Query};
use crate::types::tables;
use crate::{
    NewParticipant, NewRoom, NewRoomMessage, Participant, ParticipantPatch, Reaction,
    ReactionKind, Room, RoomMessage, RoomPatch, RoomStore, StoreError, StoreResult,
};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use room_config_and_utils::{Config, SessionHandle};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

fn summarize_response_body(body: &str) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("len={},digest={:016x}", body.len(), hasher.finish())
}

/// Room store over the backend's REST interface.
///
/// Requests carry the publishable key as `apikey` and the signed-in user's
/// access token as the bearer, so row-level policies apply as that user.
#[derive(Clone)]
pub struct SupabaseRoomStore {
    http_client: reqwest::Client,
    api_url: String,
    anon_key: String,
    session: SessionHandle,
}

impl SupabaseRoomStore {
    /// Create a store for the given project URL (e.g. `https://xyz.supabase.co`).
    pub fn new(
        api_url: impl Into<String>,
        anon_key: impl Into<String>,
        session: SessionHandle,
    ) -> Self {
        let api_url: String = api_url.into();
        Self {
            http_client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            session,
        }
    }

    pub fn from_config(config: &Config, session: SessionHandle) -> StoreResult<Self> {
        let url = config
            .supabase_url()
            .map_err(|e| StoreError::Config(e.to_string()))?;
        Ok(Self::new(
            url.as_str(),
            config.supabase_publishable_key.clone(),
            session,
        ))
    }

    fn rest_url(&self, table: &str, query: &Query) -> String {
        let query = query.to_query_string();
        if query.is_empty() {
            format!("{}/rest/v1/{}", self.api_url, table)
        } else {
            format!("{}/rest/v1/{}?{}", self.api_url, table, query)
        }
    }

    fn request(&self, method: Method, url: &str) -> StoreResult<RequestBuilder> {
        let access_token = self.session.access_token().ok_or(StoreError::NotSignedIn)?;
        Ok(self
            .http_client
            .request(method, url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", access_token))
            .header("Accept", "application/json"))
    }

    async fn check(table: &'static str, action: &str, response: Response) -> StoreResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let body_summary = summarize_response_body(&body);
        match status {
            StatusCode::CONFLICT => {
                tracing::debug!(
                    table,
                    action,
                    body_summary = %body_summary,
                    "Write rejected by uniqueness constraint"
                );
                Err(StoreError::Conflict {
                    table,
                    message: body_summary,
                })
            }
            StatusCode::NOT_FOUND => {
                Err(StoreError::NotFound(format!("{table} ({body_summary})")))
            }
            _ => {
                tracing::error!(
                    table,
                    action,
                    status = %status,
                    body_summary = %body_summary,
                    "Store request failed"
                );
                Err(StoreError::Backend {
                    status: status.as_u16(),
                    message: format!("{action} {table}: {body_summary}"),
                })
            }
        }
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &'static str,
        query: Query,
    ) -> StoreResult<Vec<T>> {
        let url = self.rest_url(table, &query.select("*"));
        tracing::debug!(table, "Selecting rows");

        let response = self.request(Method::GET, &url)?.send().await?;
        let response = Self::check(table, "select", response).await?;
        let rows: Vec<T> = response.json().await?;
        tracing::debug!(table, count = rows.len(), "Selected rows");
        Ok(rows)
    }

    async fn insert<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        table: &'static str,
        body: &B,
    ) -> StoreResult<T> {
        let url = self.rest_url(table, &Query::new());
        tracing::debug!(table, "Inserting row");

        let response = self
            .request(Method::POST, &url)?
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;
        let response = Self::check(table, "insert", response).await?;
        let rows: Vec<T> = response.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Backend {
                status: 200,
                message: format!("insert into {table} returned no row"),
            })
    }

    async fn update<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        table: &'static str,
        query: Query,
        body: &B,
    ) -> StoreResult<Vec<T>> {
        if query.is_unfiltered() {
            return Err(StoreError::Config(format!(
                "refusing unfiltered update on {table}"
            )));
        }
        let url = self.rest_url(table, &query);
        tracing::debug!(table, "Updating rows");

        let response = self
            .request(Method::PATCH, &url)?
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;
        let response = Self::check(table, "update", response).await?;
        Ok(response.json().await?)
    }

    async fn delete<T: DeserializeOwned>(
        &self,
        table: &'static str,
        query: Query,
    ) -> StoreResult<Vec<T>> {
        if query.is_unfiltered() {
            return Err(StoreError::Config(format!(
                "refusing unfiltered delete on {table}"
            )));
        }
        let url = self.rest_url(table, &query);
        tracing::debug!(table, "Deleting rows");

        let response = self
            .request(Method::DELETE, &url)?
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let response = Self::check(table, "delete", response).await?;
        Ok(response.json().await?)
    }
}

fn membership(room_id: &str, user_id: &str) -> Query {
    Query::new().eq("room_id", room_id).eq("user_id", user_id)
}

#[async_trait]
impl RoomStore for SupabaseRoomStore {
    async fn list_active_rooms(&self, limit: usize) -> StoreResult<Vec<Room>> {
        self.select(
            tables::ROOMS,
            Query::new()
                .eq("is_active", true)
                .order(Order::desc("created_at"))
                .limit(limit),
        )
        .await
    }

    async fn fetch_room(&self, room_id: &str) -> StoreResult<Option<Room>> {
        let rooms: Vec<Room> = self
            .select(tables::ROOMS, Query::new().eq("id", room_id).limit(1))
            .await?;
        Ok(rooms.into_iter().next())
    }

    async fn create_room(&self, room: &NewRoom) -> StoreResult<Room> {
        self.insert(tables::ROOMS, room).await
    }

    async fn update_room(&self, room_id: &str, patch: &RoomPatch) -> StoreResult<Option<Room>> {
        let rooms: Vec<Room> = self
            .update(tables::ROOMS, Query::new().eq("id", room_id), patch)
            .await?;
        Ok(rooms.into_iter().next())
    }

    async fn delete_room(&self, room_id: &str) -> StoreResult<bool> {
        let rooms: Vec<Room> = self
            .delete(tables::ROOMS, Query::new().eq("id", room_id))
            .await?;
        Ok(!rooms.is_empty())
    }

    async fn fetch_participant(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> StoreResult<Option<Participant>> {
        let rows: Vec<Participant> = self
            .select(tables::PARTICIPANTS, membership(room_id, user_id).limit(1))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn list_participants(&self, room_id: &str) -> StoreResult<Vec<Participant>> {
        self.select(
            tables::PARTICIPANTS,
            Query::new()
                .eq("room_id", room_id)
                .order(Order::asc("joined_at")),
        )
        .await
    }

    async fn insert_participant(&self, participant: &NewParticipant) -> StoreResult<Participant> {
        self.insert(tables::PARTICIPANTS, participant).await
    }

    async fn update_participant(
        &self,
        room_id: &str,
        user_id: &str,
        patch: &ParticipantPatch,
    ) -> StoreResult<Option<Participant>> {
        let rows: Vec<Participant> = self
            .update(tables::PARTICIPANTS, membership(room_id, user_id), patch)
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn delete_participant(&self, room_id: &str, user_id: &str) -> StoreResult<bool> {
        let rows: Vec<Participant> = self
            .delete(tables::PARTICIPANTS, membership(room_id, user_id))
            .await?;
        Ok(!rows.is_empty())
    }

    async fn delete_room_participants(&self, room_id: &str) -> StoreResult<usize> {
        let rows: Vec<Participant> = self
            .delete(tables::PARTICIPANTS, Query::new().eq("room_id", room_id))
            .await?;
        Ok(rows.len())
    }

    async fn fetch_reaction(&self, room_id: &str, user_id: &str) -> StoreResult<Option<Reaction>> {
        let rows: Vec<Reaction> = self
            .select(tables::REACTIONS, membership(room_id, user_id).limit(1))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn list_reactions(&self, room_id: &str) -> StoreResult<Vec<Reaction>> {
        self.select(tables::REACTIONS, Query::new().eq("room_id", room_id))
            .await
    }

    async fn insert_reaction(&self, reaction: &Reaction) -> StoreResult<Reaction> {
        self.insert(tables::REACTIONS, reaction).await
    }

    async fn update_reaction(
        &self,
        room_id: &str,
        user_id: &str,
        kind: ReactionKind,
    ) -> StoreResult<Option<Reaction>> {
        let body = serde_json::json!({ "reaction_type": kind });
        let rows: Vec<Reaction> = self
            .update(tables::REACTIONS, membership(room_id, user_id), &body)
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn delete_reaction(&self, room_id: &str, user_id: &str) -> StoreResult<bool> {
        let rows: Vec<Reaction> = self
            .delete(tables::REACTIONS, membership(room_id, user_id))
            .await?;
        Ok(!rows.is_empty())
    }

    async fn list_messages(&self, room_id: &str, limit: usize) -> StoreResult<Vec<RoomMessage>> {
        let mut rows: Vec<RoomMessage> = self
            .select(
                tables::MESSAGES,
                Query::new()
                    .eq("room_id", room_id)
                    .order(Order::desc("created_at"))
                    .limit(limit),
            )
            .await?;
        rows.reverse();
        Ok(rows)
    }

    async fn insert_message(&self, message: &NewRoomMessage) -> StoreResult<RoomMessage> {
        self.insert(tables::MESSAGES, message).await
    }

    async fn soft_delete_message(&self, message_id: &str) -> StoreResult<Option<RoomMessage>> {
        let body = serde_json::json!({ "is_deleted": true });
        let rows: Vec<RoomMessage> = self
            .update(tables::MESSAGES, Query::new().eq("id", message_id), &body)
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_config_and_utils::AuthContext;

    #[test]
    fn summary_hides_body() {
        let summary = summarize_response_body("secret details");
        assert!(summary.starts_with("len=14,digest="));
        assert!(!summary.contains("secret"));
    }

    #[test]
    fn rest_url_appends_query() {
        let store = SupabaseRoomStore::new("https://abc.supabase.co/", "pk", SessionHandle::new());
        assert_eq!(
            store.rest_url(tables::ROOMS, &Query::new()),
            "https://abc.supabase.co/rest/v1/audio_rooms"
        );
        assert_eq!(
            store.rest_url(tables::PARTICIPANTS, &membership("r1", "u1")),
            "https://abc.supabase.co/rest/v1/room_participants?room_id=eq.r1&user_id=eq.u1"
        );
    }

    #[tokio::test]
    async fn requests_need_a_session() {
        let store = SupabaseRoomStore::new("https://abc.supabase.co", "pk", SessionHandle::new());
        let err = store.fetch_room("r1").await.unwrap_err();
        assert!(matches!(err, StoreError::NotSignedIn));
    }

    #[test]
    fn from_config_normalizes_url() {
        let mut config = Config::default();
        config.supabase_url = "https://abc.supabase.co".to_string();
        let session = SessionHandle::signed_in(AuthContext::new("u1", "token"));
        let store = SupabaseRoomStore::from_config(&config, session).unwrap();
        assert_eq!(store.api_url, "https://abc.supabase.co");
    }

    #[tokio::test]
    async fn unfiltered_writes_are_refused() {
        let session = SessionHandle::signed_in(AuthContext::new("u1", "token"));
        let store = SupabaseRoomStore::new("https://abc.supabase.co", "pk", session);
        let err = store
            .delete::<Room>(tables::ROOMS, Query::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }
}
