//! Call context passed explicitly down the call chain.
//!
//! Nothing here lives in task-locals or globals; every layer that needs to
//! log a request id or act on behalf of a user receives the context as an
//! argument.

use uuid::Uuid;

/// Context of an inbound read/mutation on behalf of one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: Uuid,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, user_id: Uuid) -> Self {
        Self {
            request_id: request_id.into(),
            user_id,
        }
    }

    /// Context with a freshly generated request id.
    pub fn for_user(user_id: Uuid) -> Self {
        Self::new(Uuid::new_v4().to_string(), user_id)
    }

    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("request", request_id = %self.request_id, user_id = %self.user_id)
    }
}

/// Context of one queue delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: String,
    pub job_name: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

impl JobContext {
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            job_name = %self.job_name,
            attempt = self.attempt
        )
    }
}
