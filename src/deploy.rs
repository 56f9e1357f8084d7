//! Deployment pipeline: guarded apply, canary control, and the store seams.
//!
//! The live rule store and the deployment record store are external
//! collaborators behind async traits; the in-memory implementations here
//! back the embedded service mode and the test suite.

use crate::{
    canary::{CanaryAction, CanaryState},
    config::AppConfig,
    error::{Result, ServiceError},
    pack::{LiveRule, RulePack, RulePackUpload, SigmaTranslator},
    plan::{
        self, Action, GuardrailContext, GuardrailResult, MatchBy, Plan, PlanConfig, PlanEntry,
        PlanTotals,
    },
    rollback,
    schema::SchemaCache,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployStatus {
    Planned,
    Applied,
    Failed,
    FailedCanary,
    Canceled,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub deploy_id: String,
    pub pack_id: String,
    pub tenant: String,
    pub status: DeployStatus,
    pub totals: PlanTotals,
    pub guardrails_snapshot: GuardrailResult,
    pub plan_sha: String,
    pub entries: Vec<PlanEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolled_back_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolled_back_to: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Concrete write against the live rule store.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleMutation {
    Upsert { rule: LiveRule },
    Disable { rule_id: String },
    Enable { rule_id: String },
    Remove { rule_id: String },
}

#[async_trait]
pub trait LiveRuleStore: Send + Sync {
    async fn list(&self, tenant: &str) -> Result<Vec<LiveRule>>;
    /// All-or-nothing write; no partial multi-entry application.
    async fn apply(&self, tenant: &str, mutations: &[RuleMutation]) -> Result<()>;
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn create(&self, deployment: &Deployment) -> Result<()>;
    async fn get(&self, deploy_id: &str) -> Result<Option<Deployment>>;
    async fn update(&self, deployment: &Deployment) -> Result<()>;
}

/// Narrow view of the downstream analytical store: the pipeline only ever
/// needs reachability, never row-level results.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn healthy(&self) -> bool;
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApplyOptions {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub force_reason: Option<String>,
    #[serde(default)]
    pub canary: bool,
    #[serde(default)]
    pub match_by: MatchBy,
}

pub struct DeployManager {
    schema: Arc<SchemaCache>,
    rules: Arc<dyn LiveRuleStore>,
    deployments: Arc<dyn DeploymentStore>,
    engine: Arc<dyn ExecutionEngine>,
    translator: Option<Arc<dyn SigmaTranslator>>,
    plan_config: PlanConfig,
    canary_stages: Vec<u8>,
    packs: RwLock<HashMap<String, RulePack>>,
    applied_shas: RwLock<BTreeSet<String>>,
    tenant_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    deploy_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeployManager {
    pub fn new(
        config: &AppConfig,
        schema: Arc<SchemaCache>,
        rules: Arc<dyn LiveRuleStore>,
        deployments: Arc<dyn DeploymentStore>,
        engine: Arc<dyn ExecutionEngine>,
        translator: Option<Arc<dyn SigmaTranslator>>,
    ) -> Self {
        Self {
            schema,
            rules,
            deployments,
            engine,
            translator,
            plan_config: PlanConfig {
                tenant_rule_quota: config.tenant_rule_quota,
                blast_radius_max: config.blast_radius_max,
            },
            canary_stages: config.canary_stages.clone(),
            packs: RwLock::new(HashMap::new()),
            applied_shas: RwLock::new(BTreeSet::new()),
            tenant_locks: Mutex::new(HashMap::new()),
            deploy_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn upload_pack(&self, upload: RulePackUpload) -> Result<RulePack> {
        let pack = RulePack::from_upload(upload)?;
        info!(pack_id = %pack.pack_id, tenant = %pack.tenant, rules = pack.items.len(), "pack uploaded");
        self.packs.write().insert(pack.pack_id.clone(), pack.clone());
        Ok(pack)
    }

    pub fn get_pack(&self, pack_id: &str) -> Result<RulePack> {
        self.packs
            .read()
            .get(pack_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("pack '{pack_id}'")))
    }

    /// Computes a reviewable plan. The lock probe here is advisory; apply
    /// re-evaluates everything while actually holding the tenant lock.
    pub async fn plan(&self, pack_id: &str, match_by: MatchBy) -> Result<Plan> {
        let pack = self.get_pack(pack_id)?;
        let live = self.rules.list(&pack.tenant).await?;
        let lock_free = self.tenant_lock(&pack.tenant).try_lock().is_ok();
        let ctx = self.gather_context(&live, lock_free).await;
        let compilations =
            plan::compile_pack(&self.schema, &pack, self.translator.as_deref()).await;
        Ok(plan::evaluate_plan(
            &pack,
            &live,
            match_by,
            &compilations,
            &ctx,
            &self.plan_config,
        ))
    }

    /// Applies a pack: plan regeneration, guardrail check, and the live-rule
    /// write happen as one atomic step under the tenant lock.
    pub async fn apply(&self, pack_id: &str, options: ApplyOptions) -> Result<Deployment> {
        let pack = self.get_pack(pack_id)?;

        if options.force && options.force_reason.as_deref().unwrap_or("").trim().is_empty() {
            return Err(ServiceError::InvalidRequest(
                "force apply requires a force_reason".into(),
            ));
        }

        let lock = self.tenant_lock(&pack.tenant);
        let _held = lock.try_lock().map_err(|_| {
            ServiceError::ConcurrencyConflict(format!("tenant '{}'", pack.tenant))
        })?;

        let live = self.rules.list(&pack.tenant).await?;
        // We hold the lock, so it cannot be held against us.
        let ctx = self.gather_context(&live, true).await;
        let compilations =
            plan::compile_pack(&self.schema, &pack, self.translator.as_deref()).await;
        let plan = plan::evaluate_plan(
            &pack,
            &live,
            options.match_by,
            &compilations,
            &ctx,
            &self.plan_config,
        );

        if !plan.guardrails.all_ok() && !options.force {
            return Err(ServiceError::GuardrailFailed(
                plan.guardrails
                    .failing()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            ));
        }

        let mutations = mutations_for(&pack, &plan.entries);

        // The record exists as PLANNED before the live-store write, so a
        // write failure leaves a FAILED deployment behind instead of nothing.
        let mut deployment = Deployment {
            deploy_id: Uuid::new_v4().to_string(),
            pack_id: pack.pack_id.clone(),
            tenant: pack.tenant.clone(),
            status: DeployStatus::Planned,
            totals: plan.totals,
            guardrails_snapshot: plan.guardrails.clone(),
            plan_sha: plan.plan_sha.clone(),
            entries: plan.entries.clone(),
            canary: None,
            force_reason: options.force.then(|| options.force_reason.clone()).flatten(),
            rolled_back_from: None,
            rolled_back_to: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.deployments.create(&deployment).await?;

        if let Err(err) = self.rules.apply(&pack.tenant, &mutations).await {
            deployment.status = DeployStatus::Failed;
            deployment.finished_at = Some(Utc::now());
            self.deployments.update(&deployment).await?;
            return Err(err);
        }

        self.applied_shas.write().insert(plan.plan_sha.clone());
        deployment.status = DeployStatus::Applied;
        deployment.canary = options.canary.then(|| CanaryState::new(self.canary_stages.clone()));
        let rollout_live = deployment
            .canary
            .as_ref()
            .is_some_and(|canary| !canary.is_terminal());
        deployment.finished_at = (!rollout_live).then(Utc::now);
        self.deployments.update(&deployment).await?;
        info!(
            deploy_id = %deployment.deploy_id,
            tenant = %deployment.tenant,
            forced = options.force,
            "pack applied"
        );
        Ok(deployment)
    }

    pub async fn get_deployment(&self, deploy_id: &str) -> Result<Deployment> {
        self.deployments
            .get(deploy_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("deployment '{deploy_id}'")))
    }

    /// Canary control operations on one deployment are serialized against
    /// each other; different deployments are fully independent.
    pub async fn canary_control(
        &self,
        deploy_id: &str,
        action: CanaryAction,
        signal: Option<bool>,
    ) -> Result<CanaryState> {
        let lock = self.deploy_lock(deploy_id);
        let _held = lock.lock().await;

        let mut deployment = self.get_deployment(deploy_id).await?;
        let mut canary = deployment.canary.clone().ok_or_else(|| {
            ServiceError::InvalidRequest(format!(
                "deployment '{deploy_id}' has no canary rollout"
            ))
        })?;

        if let Some(healthy) = signal {
            canary.record_signal(healthy);
        }

        match action {
            CanaryAction::Advance => canary.advance()?,
            CanaryAction::Pause => canary.pause()?,
            CanaryAction::Resume => canary.resume()?,
            CanaryAction::Cancel => {
                canary.cancel()?;
                deployment.status = if canary.negative_signal {
                    DeployStatus::FailedCanary
                } else {
                    DeployStatus::Canceled
                };
                deployment.finished_at = Some(Utc::now());
            }
        }

        if canary.state == crate::canary::CanaryPhase::Completed {
            deployment.finished_at = Some(Utc::now());
        }

        deployment.canary = Some(canary.clone());
        self.deployments.update(&deployment).await?;
        Ok(canary)
    }

    /// Reverts a deployment to its pre-image state as a new deployment.
    pub async fn rollback(&self, deploy_id: &str, reason: Option<String>) -> Result<Deployment> {
        let lock = self.deploy_lock(deploy_id);
        let _held = lock.lock().await;

        let mut source = self.get_deployment(deploy_id).await?;

        // The revert writes to the live rule set, so it contends with apply
        // on the same tenant lock. Ordering is always deploy lock first,
        // tenant lock second.
        let tenant_lock = self.tenant_lock(&source.tenant);
        let _tenant_held = tenant_lock.try_lock().map_err(|_| {
            ServiceError::ConcurrencyConflict(format!("tenant '{}'", source.tenant))
        })?;

        if !matches!(
            source.status,
            DeployStatus::Applied | DeployStatus::FailedCanary
        ) {
            return Err(ServiceError::RollbackUnavailable(format!(
                "deployment is {:?}, only APPLIED or FAILED_CANARY can be rolled back",
                source.status
            )));
        }

        // A still-moving canary is forced to canceled before the revert.
        if let Some(canary) = source.canary.as_mut() {
            if !canary.is_terminal() {
                canary.cancel()?;
            }
        }

        let pack = self.get_pack(&source.pack_id)?;
        let inverse = rollback::invert_entries(&source.entries, Some(pack.name.as_str()))?;
        self.rules.apply(&source.tenant, &inverse.mutations).await?;

        let rollback_deploy = Deployment {
            deploy_id: Uuid::new_v4().to_string(),
            pack_id: source.pack_id.clone(),
            tenant: source.tenant.clone(),
            status: DeployStatus::Applied,
            totals: inverse.totals,
            guardrails_snapshot: source.guardrails_snapshot.clone(),
            plan_sha: plan::hash_entries(&source.pack_id, &inverse.entries),
            entries: inverse.entries,
            canary: None,
            force_reason: reason,
            rolled_back_from: Some(source.deploy_id.clone()),
            rolled_back_to: None,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
        };
        self.deployments.create(&rollback_deploy).await?;

        source.status = DeployStatus::RolledBack;
        source.rolled_back_to = Some(rollback_deploy.deploy_id.clone());
        source.finished_at = Some(Utc::now());
        self.deployments.update(&source).await?;

        info!(
            deploy_id = %source.deploy_id,
            rollback_id = %rollback_deploy.deploy_id,
            "deployment rolled back"
        );
        Ok(rollback_deploy)
    }

    async fn gather_context(&self, live: &[LiveRule], lock_free: bool) -> GuardrailContext {
        let enabled = live.iter().filter(|rule| rule.definition.enabled);
        let mut active_per_category: BTreeMap<String, usize> = BTreeMap::new();
        let mut live_count = 0usize;
        for rule in enabled {
            live_count += 1;
            *active_per_category
                .entry(format!("{:?}", rule.definition.severity).to_lowercase())
                .or_default() += 1;
        }

        GuardrailContext {
            live_count,
            active_per_category,
            engine_healthy: self.engine.healthy().await,
            lock_free,
            applied_plan_shas: self.applied_shas.read().clone(),
        }
    }

    fn tenant_lock(&self, tenant: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.tenant_locks.lock();
        Arc::clone(
            locks
                .entry(tenant.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn deploy_lock(&self, deploy_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.deploy_locks.lock();
        Arc::clone(
            locks
                .entry(deploy_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

fn mutations_for(pack: &RulePack, entries: &[PlanEntry]) -> Vec<RuleMutation> {
    entries
        .iter()
        .filter_map(|entry| match entry.action {
            Action::Create | Action::Update => {
                let item = pack
                    .items
                    .iter()
                    .find(|item| item.rule_id == entry.rule_id)?;
                Some(RuleMutation::Upsert {
                    rule: LiveRule {
                        definition: item.clone(),
                        source_pack: Some(pack.name.clone()),
                    },
                })
            }
            Action::Disable => Some(RuleMutation::Disable {
                rule_id: entry.rule_id.clone(),
            }),
            Action::Skip => None,
        })
        .collect()
}

#[derive(Default)]
pub struct InMemoryRuleStore {
    tenants: RwLock<HashMap<String, BTreeMap<String, LiveRule>>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LiveRuleStore for InMemoryRuleStore {
    async fn list(&self, tenant: &str) -> Result<Vec<LiveRule>> {
        Ok(self
            .tenants
            .read()
            .get(tenant)
            .map(|rules| rules.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn apply(&self, tenant: &str, mutations: &[RuleMutation]) -> Result<()> {
        let mut tenants = self.tenants.write();
        let rules = tenants.entry(tenant.to_string()).or_default();

        // Validate first so a bad mutation cannot leave a half-applied batch.
        for mutation in mutations {
            let rule_id = match mutation {
                RuleMutation::Upsert { .. } => continue,
                RuleMutation::Disable { rule_id }
                | RuleMutation::Enable { rule_id }
                | RuleMutation::Remove { rule_id } => rule_id,
            };
            if !rules.contains_key(rule_id) {
                return Err(ServiceError::InvalidRequest(format!(
                    "live rule '{rule_id}' does not exist"
                )));
            }
        }

        for mutation in mutations {
            match mutation {
                RuleMutation::Upsert { rule } => {
                    rules.insert(rule.definition.rule_id.clone(), rule.clone());
                }
                RuleMutation::Disable { rule_id } => {
                    if let Some(rule) = rules.get_mut(rule_id) {
                        rule.definition.enabled = false;
                    }
                }
                RuleMutation::Enable { rule_id } => {
                    if let Some(rule) = rules.get_mut(rule_id) {
                        rule.definition.enabled = true;
                    }
                }
                RuleMutation::Remove { rule_id } => {
                    rules.remove(rule_id);
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDeploymentStore {
    deployments: RwLock<HashMap<String, Deployment>>,
}

impl InMemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for InMemoryDeploymentStore {
    async fn create(&self, deployment: &Deployment) -> Result<()> {
        self.deployments
            .write()
            .insert(deployment.deploy_id.clone(), deployment.clone());
        Ok(())
    }

    async fn get(&self, deploy_id: &str) -> Result<Option<Deployment>> {
        Ok(self.deployments.read().get(deploy_id).cloned())
    }

    async fn update(&self, deployment: &Deployment) -> Result<()> {
        self.deployments
            .write()
            .insert(deployment.deploy_id.clone(), deployment.clone());
        Ok(())
    }
}

/// In-process stand-in for the downstream analytical store.
pub struct InProcessEngine {
    healthy: std::sync::atomic::AtomicBool,
}

impl InProcessEngine {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: std::sync::atomic::AtomicBool::new(healthy),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy
            .store(healthy, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Default for InProcessEngine {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl ExecutionEngine for InProcessEngine {
    async fn healthy(&self) -> bool {
        self.healthy.load(std::sync::atomic::Ordering::SeqCst)
    }
}
