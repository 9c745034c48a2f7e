use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use uuid::Uuid;

use jotter_core::{
    Error, NewRequest, Request, RequestRepository, RequestStatus, RequestWithOwner, Result,
};

#[derive(Default)]
struct State {
    requests: HashMap<Uuid, Request>,
    logins: HashMap<Uuid, String>,
}

/// In-memory RequestRepository.
///
/// Owners without a registered login resolve to their user id, so `user:`
/// topics still address them.
#[derive(Default)]
pub struct MemoryRequestRepository {
    state: RwLock<State>,
}

impl MemoryRequestRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a login id with a user.
    pub async fn register_user(&self, user_id: Uuid, login: impl Into<String>) {
        self.state.write().await.logins.insert(user_id, login.into());
    }

    async fn transition(
        &self,
        id: Uuid,
        to: RequestStatus,
        apply: impl FnOnce(&mut Request),
    ) -> Result<Request> {
        let mut state = self.state.write().await;
        let request = state
            .requests
            .get_mut(&id)
            .ok_or(Error::RequestNotFound(id))?;
        if !request.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: request.status,
                to,
            });
        }
        request.status = to;
        apply(request);
        Ok(request.clone())
    }
}

#[async_trait]
impl RequestRepository for MemoryRequestRepository {
    async fn insert(&self, new: NewRequest) -> Result<Request> {
        let request = Request {
            id: Uuid::now_v7(),
            space_id: new.space_id,
            user_id: new.user_id,
            request_type: new.request_type,
            input: new.input,
            status: RequestStatus::Pending,
            position: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.state
            .write()
            .await
            .requests
            .insert(request.id, request.clone());
        Ok(request)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Request>> {
        Ok(self.state.read().await.requests.get(&id).cloned())
    }

    async fn get_with_owner(&self, id: Uuid) -> Result<Option<RequestWithOwner>> {
        let state = self.state.read().await;
        Ok(state.requests.get(&id).map(|request| RequestWithOwner {
            owner_login: state
                .logins
                .get(&request.user_id)
                .cloned()
                .unwrap_or_else(|| request.user_id.to_string()),
            request: request.clone(),
        }))
    }

    async fn upsert_owner(&self, user_id: Uuid, login: &str) -> Result<()> {
        self.register_user(user_id, login).await;
        Ok(())
    }

    async fn set_position(&self, id: Uuid, position: Option<i64>) -> Result<()> {
        let mut state = self.state.write().await;
        let request = state
            .requests
            .get_mut(&id)
            .ok_or(Error::RequestNotFound(id))?;
        if request.status == RequestStatus::Pending {
            request.position = position;
        }
        Ok(())
    }

    async fn mark_processing(&self, id: Uuid, at: DateTime<Utc>) -> Result<Request> {
        self.transition(id, RequestStatus::Processing, |r| {
            r.started_at = Some(at);
            r.position = None;
            r.error = None;
            r.completed_at = None;
        })
        .await
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        result: JsonValue,
        at: DateTime<Utc>,
    ) -> Result<Request> {
        self.transition(id, RequestStatus::Completed, |r| {
            r.result = Some(result);
            r.completed_at = Some(at);
        })
        .await
    }

    async fn mark_failed(&self, id: Uuid, error: &str, at: DateTime<Utc>) -> Result<Request> {
        self.transition(id, RequestStatus::Failed, |r| {
            r.error = Some(error.to_string());
            r.completed_at = Some(at);
        })
        .await
    }

    async fn mark_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<Request> {
        self.transition(id, RequestStatus::Cancelled, |r| {
            r.position = None;
            r.completed_at = Some(at);
        })
        .await
    }
}
