//! Metered generation route
//!
//! Drives the full admission state machine around the opaque generation
//! backend: cooldown → lock → quota → cooldown stamp → execute → charge on
//! success / clear on failure. Results land in the cache flagged for the
//! sync sweeper; the quota is charged only once the response is ready to be
//! delivered.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use prepstack_shared::{Feature, GenerationMode, Plan};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::generation::GenerationRequest;
use crate::state::AppState;

fn version_key(auth_user_id: &str, set_id: &str) -> String {
    format!("genver:{}:{}", auth_user_id, set_id)
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub mode: GenerationMode,
    pub topic: String,
    /// Number of questions per set
    #[serde(default = "default_count")]
    pub count: u32,
    /// Required for replace: the set being regenerated
    pub set_id: Option<String>,
}

fn default_count() -> u32 {
    5
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub set_id: String,
    pub questions: serde_json::Value,
    pub used: i64,
    pub limit: i64,
}

/// POST /api/generate
pub async fn generate(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<GenerateRequest>,
) -> ApiResult<Json<GenerateResponse>> {
    if request.topic.trim().is_empty() {
        return Err(ApiError::Validation("topic must not be empty".to_string()));
    }
    if request.count == 0 || request.count > 20 {
        return Err(ApiError::Validation(
            "count must be between 1 and 20".to_string(),
        ));
    }
    let target_set = match request.mode {
        GenerationMode::Replace => Some(request.set_id.clone().ok_or_else(|| {
            ApiError::Validation("set_id is required for replace".to_string())
        })?),
        GenerationMode::Full => None,
    };

    let account = state
        .subscriptions
        .load_or_create_account(&user.user_id, user.email.as_deref())
        .await?;
    let now = OffsetDateTime::now_utc();
    let plan = account.effective_plan(now);

    // Lightweight replace is a paid-and-trial feature; quota rejection below
    // is a different answer than this one.
    if request.mode == GenerationMode::Replace && plan == Plan::Free {
        return Err(ApiError::NotEntitled(
            "replace requires a trial or paid plan".to_string(),
        ));
    }

    let feature = Feature::QuestionSets;
    let permit = state
        .quota
        .begin(&user.user_id, plan, feature, request.mode, 1)
        .await?;

    // Version fence for serialized regeneration: capture before the slow
    // call, check before applying the result.
    let fence = match &target_set {
        Some(set_id) => state
            .cache
            .get(&version_key(&user.user_id, set_id))
            .await
            .map_err(|e| ApiError::from(prepstack_billing::BillingError::from(e)))?,
        None => None,
    };

    let backend_request = GenerationRequest {
        auth_user_id: user.user_id.clone(),
        mode: request.mode.to_string(),
        topic: request.topic.clone(),
        count: request.count,
    };

    let generated = match state.generation.generate(&backend_request).await {
        Ok(generated) => generated,
        Err(e) => {
            // No quota consumed: clear the cooldown so a legitimate retry is
            // not punished, and release the lease.
            if let Err(cleanup) = permit.abort().await {
                tracing::warn!(user_id = %user.user_id, error = %cleanup, "Permit cleanup failed");
            }
            return Err(e);
        }
    };

    if let Some(set_id) = &target_set {
        let current = state
            .cache
            .get(&version_key(&user.user_id, set_id))
            .await
            .unwrap_or(None);
        if current != fence {
            // A newer full generation superseded this set while the backend
            // was working; the stale result must not overwrite it.
            if let Err(cleanup) = permit.abort().await {
                tracing::warn!(user_id = %user.user_id, error = %cleanup, "Permit cleanup failed");
            }
            return Err(ApiError::Conflict {
                message: "set was regenerated while this request was in flight".to_string(),
                blocked: true,
            });
        }
    }

    let set_id = match &target_set {
        Some(set_id) => set_id.clone(),
        None => generated.set_id.clone(),
    };

    // Cache write first (flagged for the sweeper), then the quota charge,
    // then the response. Quota is untouched until commit, so failure here
    // still clears the cooldown and releases the lease.
    if let Err(e) = state
        .sweeper
        .store_pending(&user.user_id, &set_id, generated.questions.clone())
        .await
    {
        if let Err(cleanup) = permit.abort().await {
            tracing::warn!(user_id = %user.user_id, error = %cleanup, "Permit cleanup failed");
        }
        return Err(ApiError::from(e));
    }

    // Full generations advance the version fence so in-flight replaces of
    // the same set discard themselves.
    if request.mode == GenerationMode::Full {
        let stamp = now.unix_timestamp_nanos().to_string();
        if let Err(e) = state
            .cache
            .put(&version_key(&user.user_id, &set_id), &stamp, None)
            .await
        {
            tracing::warn!(user_id = %user.user_id, error = %e, "Failed to advance version fence");
        }
    }

    let used = permit.commit().await?;
    let limit = plan.limit_for(feature);

    Ok(Json(GenerateResponse {
        set_id,
        questions: generated.questions,
        used,
        limit,
    }))
}
