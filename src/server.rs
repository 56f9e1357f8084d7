use crate::{
    canary::{CanaryAction, CanaryState},
    config::AppConfig,
    deploy::{
        ApplyOptions, DeployManager, Deployment, InMemoryDeploymentStore, InMemoryRuleStore,
        InProcessEngine,
    },
    error::{Result, ServiceError},
    pack::{RulePack, RulePackUpload},
    plan::{MatchBy, Plan},
    schema::{SchemaCache, StaticSchemaSource},
    state::AppState,
};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    /// Builds the service in embedded mode: in-memory stores and a static
    /// schema source. Production callers assemble a `DeployManager` with
    /// real collaborators and use `with_state` instead.
    pub fn new(config: AppConfig) -> Self {
        let config = Arc::new(config);
        let schema = Arc::new(SchemaCache::new(
            Arc::new(StaticSchemaSource::new()),
            config.schema_ttl,
        ));
        let deploys = Arc::new(DeployManager::new(
            &config,
            schema,
            Arc::new(InMemoryRuleStore::new()),
            Arc::new(InMemoryDeploymentStore::new()),
            Arc::new(InProcessEngine::default()),
            None,
        ));
        let state = AppState::new(Arc::clone(&config), deploys);
        Self { config, state }
    }

    pub fn with_state(config: Arc<AppConfig>, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/packs", post(Self::upload_pack))
            .route("/api/packs/:pack_id/plan", post(Self::plan))
            .route("/api/packs/:pack_id/apply", post(Self::apply))
            .route("/api/deployments/:deploy_id", get(Self::get_deployment))
            .route("/api/deployments/:deploy_id/canary", post(Self::canary))
            .route("/api/deployments/:deploy_id/rollback", post(Self::rollback))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "ruleforge listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn upload_pack(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(upload): Json<RulePackUpload>,
    ) -> Result<Json<RulePack>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.deploys.upload_pack(upload)?))
    }

    async fn plan(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(pack_id): Path<String>,
        Json(request): Json<PlanRequest>,
    ) -> Result<Json<Plan>> {
        enforce_api_key(&headers, &state.config)?;
        let plan = state.deploys.plan(&pack_id, request.match_by).await?;
        Ok(Json(plan))
    }

    async fn apply(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(pack_id): Path<String>,
        Json(options): Json<ApplyOptions>,
    ) -> Result<Json<Deployment>> {
        enforce_api_key(&headers, &state.config)?;
        let deployment = state.deploys.apply(&pack_id, options).await?;
        Ok(Json(deployment))
    }

    async fn get_deployment(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(deploy_id): Path<String>,
    ) -> Result<Json<Deployment>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.deploys.get_deployment(&deploy_id).await?))
    }

    async fn canary(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(deploy_id): Path<String>,
        Json(request): Json<CanaryRequest>,
    ) -> Result<Json<CanaryState>> {
        enforce_api_key(&headers, &state.config)?;
        let canary = state
            .deploys
            .canary_control(&deploy_id, request.action, request.signal)
            .await?;
        Ok(Json(canary))
    }

    async fn rollback(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(deploy_id): Path<String>,
        Json(request): Json<RollbackRequest>,
    ) -> Result<Json<Deployment>> {
        enforce_api_key(&headers, &state.config)?;
        let deployment = state.deploys.rollback(&deploy_id, request.reason).await?;
        Ok(Json(deployment))
    }
}

#[derive(Debug, Deserialize, Default)]
struct PlanRequest {
    #[serde(default)]
    match_by: MatchBy,
}

#[derive(Debug, Deserialize)]
struct CanaryRequest {
    action: CanaryAction,
    #[serde(default)]
    signal: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RollbackRequest {
    #[serde(default)]
    reason: Option<String>,
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(ServiceError::Auth);
        }
    }

    Ok(())
}
