//! Writes: post, put, patch, delete and uploads.

use crate::client::Inner;
use crate::executor::headers;
use bytes::Bytes;
use serde_json::Value;
use skein_core::ports::Method;
use skein_core::{ClientError, ClientResult, HttpResponse};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Server answer to a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResponse {
    pub status: u16,
    /// `Location` header, set for accepted (202) requests that created a task.
    pub location: Option<String>,
    /// Decoded body; `Null` when empty or not JSON.
    pub body: Value,
}

impl MutationResponse {
    fn from_http(response: &HttpResponse) -> Self {
        Self {
            status: response.status,
            location: response.header(headers::LOCATION.as_str()).map(str::to_string),
            body: response.body_json().unwrap_or(Value::Null),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == 202
    }

    /// URI of the server-side task tracking an accepted request.
    pub fn task(&self) -> Option<&str> {
        if self.is_accepted() {
            self.location.as_deref()
        } else {
            None
        }
    }
}

/// An upload running in the background.
#[derive(Debug)]
pub struct UploadHandle {
    task: JoinHandle<ClientResult<MutationResponse>>,
}

impl UploadHandle {
    /// Cancel the transfer. `finish` then resolves to [`ClientError::Aborted`].
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn finish(self) -> ClientResult<MutationResponse> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(ClientError::Aborted),
            Err(err) => Err(ClientError::Network(format!("upload task failed: {}", err))),
        }
    }
}

impl Inner {
    pub(crate) async fn mutate(
        self: &Arc<Self>,
        method: Method,
        uri: &str,
        body: Option<&Value>,
    ) -> ClientResult<MutationResponse> {
        let token = self.session.token();
        let response = self
            .executor
            .write(method.clone(), uri, token.as_deref(), body)
            .await?;
        let result = self.settle_mutation(&method, uri, &response)?;
        if method == Method::DELETE {
            self.cache.remove(uri);
        } else {
            self.refresh_cached(uri).await;
        }
        Ok(result)
    }

    fn settle_mutation(
        &self,
        method: &Method,
        uri: &str,
        response: &HttpResponse,
    ) -> ClientResult<MutationResponse> {
        match response.status {
            401 => {
                self.session_expired();
                Err(ClientError::AuthExpired)
            }
            status if !response.is_success() => {
                tracing::debug!(%method, uri, status, "Mutation rejected");
                Err(ClientError::Http { status })
            }
            _ => {
                let result = MutationResponse::from_http(response);
                if let Some(task) = result.task() {
                    tracing::debug!(%method, uri, task, "Mutation accepted as task");
                }
                Ok(result)
            }
        }
    }

    /// Sequential deletes. Stops at the first failure.
    pub(crate) async fn delete_many(
        self: &Arc<Self>,
        uris: &[String],
    ) -> ClientResult<Option<MutationResponse>> {
        let mut accepted: Option<MutationResponse> = None;
        for uri in uris {
            let response = self.mutate(Method::DELETE, uri, None).await?;
            if !response.is_accepted() {
                continue;
            }
            if accepted.is_some() {
                tracing::warn!(uri = %uri, "More than one delete was accepted as a task");
                return Err(ClientError::NotImplemented(
                    "tracking more than one accepted delete".to_string(),
                ));
            }
            accepted = Some(response);
        }
        Ok(accepted)
    }

    pub(crate) fn upload(self: &Arc<Self>, uri: &str, body: Bytes, content_type: &str) -> UploadHandle {
        let inner = Arc::clone(self);
        let uri = uri.to_string();
        let content_type = content_type.to_string();
        let task = tokio::spawn(async move {
            let token = inner.session.token();
            tracing::debug!(uri = %uri, bytes = body.len(), "Upload started");
            let response = inner
                .executor
                .write_bytes(Method::POST, &uri, token.as_deref(), body, &content_type)
                .await?;
            let result = inner.settle_mutation(&Method::POST, &uri, &response)?;
            inner.refresh_cached(&uri).await;
            Ok(result)
        });
        UploadHandle { task }
    }
}
