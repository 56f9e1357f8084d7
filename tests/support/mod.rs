use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use ruleforge::{
    config::AppConfig,
    deploy::{
        DeployManager, InMemoryDeploymentStore, InMemoryRuleStore, InProcessEngine,
    },
    schema::{SchemaCache, SchemaSource, ScopeKey, StaticSchemaSource},
    server::Server,
    state::AppState,
};
use serde::Serialize;
use serde_json::Value;
use std::{future::Future, sync::Arc, sync::Once};
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";
pub const TENANT: &str = "acme";

static TRACING_INIT: Once = Once::new();

/// Runs a test closure against a fully assembled in-process service with
/// in-memory stores and a seeded static schema.
pub async fn with_ruleforge_harness<F, Fut>(test: F)
where
    F: FnOnce(RuleforgeHarness) -> Fut,
    Fut: Future<Output = ()>,
{
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });

    let mut config = AppConfig::embedded();
    config.api_key = Some(API_KEY.to_string());
    let config = Arc::new(config);

    let schema_source = Arc::new(StaticSchemaSource::new());
    schema_source.insert_table(
        ScopeKey::new(TENANT, "auth_logs"),
        &[
            ("ts", "datetime"),
            ("user", "text"),
            ("src_ip", "text"),
            ("status", "text"),
        ],
    );

    let engine = Arc::new(InProcessEngine::default());
    let schema = Arc::new(SchemaCache::new(
        Arc::clone(&schema_source) as Arc<dyn SchemaSource>,
        config.schema_ttl,
    ));
    let deploys = Arc::new(DeployManager::new(
        &config,
        schema,
        Arc::new(InMemoryRuleStore::new()),
        Arc::new(InMemoryDeploymentStore::new()),
        Arc::clone(&engine) as Arc<dyn ruleforge::deploy::ExecutionEngine>,
        None,
    ));
    let state = AppState::new(Arc::clone(&config), deploys);
    let server = Server::with_state(config, state);

    let harness = RuleforgeHarness {
        router: server.router(),
        api_key: API_KEY.to_string(),
        engine,
        schema_source,
    };

    test(harness).await;
}

#[derive(Clone)]
pub struct RuleforgeHarness {
    router: Router,
    api_key: String,
    engine: Arc<InProcessEngine>,
    schema_source: Arc<StaticSchemaSource>,
}

impl RuleforgeHarness {
    pub async fn post<T>(&self, path: &str, payload: &T) -> http::Response<Body>
    where
        T: Serialize + ?Sized,
    {
        self.request("POST", path, Some(payload), true).await
    }

    #[allow(dead_code)]
    pub async fn post_without_api_key<T>(&self, path: &str, payload: &T) -> http::Response<Body>
    where
        T: Serialize + ?Sized,
    {
        self.request("POST", path, Some(payload), false).await
    }

    #[allow(dead_code)]
    pub async fn get(&self, path: &str) -> http::Response<Body> {
        self.request::<()>("GET", path, None, true).await
    }

    #[allow(dead_code)]
    pub fn set_engine_healthy(&self, healthy: bool) {
        self.engine.set_healthy(healthy);
    }

    #[allow(dead_code)]
    pub fn register_table(&self, table: &str, columns: &[(&str, &str)]) {
        self.schema_source
            .insert_table(ScopeKey::new(TENANT, table), columns);
    }

    async fn request<T>(
        &self,
        method: &str,
        path: &str,
        payload: Option<&T>,
        include_api_key: bool,
    ) -> http::Response<Body>
    where
        T: Serialize + ?Sized,
    {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json");

        if include_api_key {
            builder = builder.header("x-api-key", &self.api_key);
        }

        let body = match payload {
            Some(payload) => {
                Body::from(serde_json::to_vec(payload).expect("request payload should serialize"))
            }
            None => Body::empty(),
        };
        let request = builder
            .body(body)
            .expect("failed to build harness request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should deserialize");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
