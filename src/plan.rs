//! Plan generation: diff a rule pack against live rules and evaluate the
//! guardrail battery.
//!
//! Planning is pure. All I/O (live rule listing, schema loads, engine
//! health, lock probes) happens before `evaluate_plan`, which is a
//! deterministic function of its inputs; recomputing it against unchanged
//! inputs yields a byte-identical plan, which is what the idempotency
//! guardrail hashes.

use crate::{
    blocks,
    pack::{LiveRule, RulePack, RuleDefinition, RuleKind, SigmaTranslator},
    schema::{ScopeKey, SchemaCache},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchBy {
    #[default]
    RuleId,
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Create,
    Update,
    Disable,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub rule_id: String,
    pub name: String,
    pub action: Action,
    pub warnings: Vec<String>,
    pub from_sha: Option<String>,
    pub to_sha: Option<String>,
    /// Live rule captured before the change, for rollback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_image: Option<RuleDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanTotals {
    pub create: usize,
    pub update: usize,
    pub disable: usize,
    pub skip: usize,
}

impl PlanTotals {
    pub fn blast_radius(&self) -> usize {
        self.create + self.update + self.disable
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Verdict {
    fn pass() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub compilation_clean: Verdict,
    pub hot_disable_safe: Verdict,
    pub quota_ok: Verdict,
    pub blast_radius_ok: Verdict,
    pub health_ok: Verdict,
    pub lock_ok: Verdict,
    pub idempotency_ok: Verdict,
}

impl GuardrailResult {
    pub fn all_ok(&self) -> bool {
        self.failing().is_empty()
    }

    pub fn failing(&self) -> Vec<&'static str> {
        let checks: [(&'static str, &Verdict); 7] = [
            ("compilation_clean", &self.compilation_clean),
            ("hot_disable_safe", &self.hot_disable_safe),
            ("quota_ok", &self.quota_ok),
            ("blast_radius_ok", &self.blast_radius_ok),
            ("health_ok", &self.health_ok),
            ("lock_ok", &self.lock_ok),
            ("idempotency_ok", &self.idempotency_ok),
        ];
        checks
            .into_iter()
            .filter(|(_, verdict)| !verdict.ok)
            .map(|(name, _)| name)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub pack_id: String,
    pub totals: PlanTotals,
    pub entries: Vec<PlanEntry>,
    pub guardrails: GuardrailResult,
    pub plan_sha: String,
}

/// Snapshot of the world gathered before the pure evaluation.
#[derive(Debug, Clone, Default)]
pub struct GuardrailContext {
    /// Enabled live rules for the tenant.
    pub live_count: usize,
    /// Enabled live rule count per severity category.
    pub active_per_category: BTreeMap<String, usize>,
    pub engine_healthy: bool,
    pub lock_free: bool,
    pub applied_plan_shas: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct PlanConfig {
    pub tenant_rule_quota: usize,
    pub blast_radius_max: usize,
}

/// Result of compiling one pack item for the tenant's current schema.
#[derive(Debug, Clone, Default)]
pub struct CompileOutcome {
    pub fragment: Option<String>,
    pub warnings: Vec<String>,
}

/// Compiles every pack item against the tenant's current schema, collecting
/// per-rule warnings. One bad rule never aborts the rest of the pack.
pub async fn compile_pack(
    schema: &SchemaCache,
    pack: &RulePack,
    translator: Option<&dyn SigmaTranslator>,
) -> BTreeMap<String, CompileOutcome> {
    let mut outcomes = BTreeMap::new();

    for item in &pack.items {
        let outcome = compile_item(schema, &pack.tenant, item, translator).await;
        outcomes.insert(item.rule_id.clone(), outcome);
    }

    outcomes
}

async fn compile_item(
    schema: &SchemaCache,
    tenant: &str,
    item: &RuleDefinition,
    translator: Option<&dyn SigmaTranslator>,
) -> CompileOutcome {
    let native = match item.kind {
        RuleKind::Native => crate::pack::parse_native(&item.content),
        RuleKind::Sigma => match translator {
            Some(translator) => translator.translate(&item.content),
            None => {
                return CompileOutcome {
                    fragment: None,
                    warnings: vec!["sigma rule has no configured translator".to_string()],
                }
            }
        },
    };

    let native = match native {
        Ok(native) => native,
        Err(err) => {
            return CompileOutcome {
                fragment: None,
                warnings: vec![err.to_string()],
            }
        }
    };

    let scope = ScopeKey::new(tenant, native.table.clone());
    let entry = match schema.load(&scope).await {
        Ok(entry) => entry,
        Err(err) => {
            return CompileOutcome {
                fragment: None,
                warnings: vec![format!("schema load failed: {err}")],
            }
        }
    };

    match blocks::compile_blocks(&native.blocks, &entry) {
        Ok(fragment) => CompileOutcome {
            fragment: Some(fragment),
            warnings: Vec::new(),
        },
        Err(err) => CompileOutcome {
            fragment: None,
            warnings: vec![err.to_string()],
        },
    }
}

/// Pure plan computation over a pack, the live rule set, and the gathered
/// guardrail context.
pub fn evaluate_plan(
    pack: &RulePack,
    live: &[LiveRule],
    match_by: MatchBy,
    compilations: &BTreeMap<String, CompileOutcome>,
    ctx: &GuardrailContext,
    cfg: &PlanConfig,
) -> Plan {
    let mut entries = Vec::with_capacity(pack.items.len());
    let mut totals = PlanTotals::default();
    let mut matched_live: BTreeSet<&str> = BTreeSet::new();

    for item in &pack.items {
        let found = find_live(live, item, match_by);
        if let Some(found) = found {
            matched_live.insert(found.definition.rule_id.as_str());
        }

        let warnings = compilations
            .get(&item.rule_id)
            .map(|outcome| outcome.warnings.clone())
            .unwrap_or_default();

        let entry = match found {
            None => {
                totals.create += 1;
                PlanEntry {
                    rule_id: item.rule_id.clone(),
                    name: item.name.clone(),
                    action: Action::Create,
                    warnings,
                    from_sha: None,
                    to_sha: Some(item.content_sha()),
                    pre_image: None,
                }
            }
            Some(found) if same_definition(&found.definition, item) => {
                totals.skip += 1;
                PlanEntry {
                    rule_id: item.rule_id.clone(),
                    name: item.name.clone(),
                    action: Action::Skip,
                    warnings,
                    from_sha: Some(found.definition.content_sha()),
                    to_sha: Some(item.content_sha()),
                    pre_image: None,
                }
            }
            Some(found) => {
                totals.update += 1;
                PlanEntry {
                    rule_id: item.rule_id.clone(),
                    name: item.name.clone(),
                    action: Action::Update,
                    warnings,
                    from_sha: Some(found.definition.content_sha()),
                    to_sha: Some(item.content_sha()),
                    pre_image: Some(found.definition.clone()),
                }
            }
        };
        entries.push(entry);
    }

    // Live rules this pack previously owned but no longer ships get disabled.
    let mut orphans: Vec<&LiveRule> = live
        .iter()
        .filter(|rule| {
            rule.definition.enabled
                && rule.source_pack.as_deref() == Some(pack.name.as_str())
                && !matched_live.contains(rule.definition.rule_id.as_str())
        })
        .collect();
    orphans.sort_by(|a, b| a.definition.rule_id.cmp(&b.definition.rule_id));

    for orphan in orphans {
        totals.disable += 1;
        entries.push(PlanEntry {
            rule_id: orphan.definition.rule_id.clone(),
            name: orphan.definition.name.clone(),
            action: Action::Disable,
            warnings: Vec::new(),
            from_sha: Some(orphan.definition.content_sha()),
            to_sha: None,
            pre_image: Some(orphan.definition.clone()),
        });
    }

    let plan_sha = hash_entries(&pack.pack_id, &entries);
    let guardrails = evaluate_guardrails(pack, live, &entries, &totals, &plan_sha, ctx, cfg);

    Plan {
        pack_id: pack.pack_id.clone(),
        totals,
        entries,
        guardrails,
        plan_sha,
    }
}

fn find_live<'a>(live: &'a [LiveRule], item: &RuleDefinition, match_by: MatchBy) -> Option<&'a LiveRule> {
    live.iter().find(|rule| match match_by {
        MatchBy::RuleId => rule.definition.rule_id == item.rule_id,
        MatchBy::Name => rule.definition.name == item.name,
    })
}

fn same_definition(live: &RuleDefinition, item: &RuleDefinition) -> bool {
    live.content_sha() == item.content_sha()
        && live.enabled == item.enabled
        && live.severity == item.severity
}

/// Stable digest over the target state a plan converges to.
///
/// The hash covers (rule_id, to_sha) rather than the per-entry action: a
/// plan that creates a rule and the all-skip plan produced by re-planning
/// the same pack after apply describe the same end state and must hash
/// identically, which is what lets the idempotency guardrail flag a
/// duplicate apply. Disable entries carry no to_sha and hash a tombstone
/// instead, so a plan that additionally retires an orphan never collides
/// with one that does not.
pub fn hash_entries(pack_id: &str, entries: &[PlanEntry]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pack_id.as_bytes());
    for entry in entries {
        hasher.update(entry.rule_id.as_bytes());
        hasher.update([0u8]);
        match entry.to_sha.as_deref() {
            Some(to_sha) => hasher.update(to_sha.as_bytes()),
            None => hasher.update(b"<disabled>".as_slice()),
        }
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn evaluate_guardrails(
    pack: &RulePack,
    live: &[LiveRule],
    entries: &[PlanEntry],
    totals: &PlanTotals,
    plan_sha: &str,
    ctx: &GuardrailContext,
    cfg: &PlanConfig,
) -> GuardrailResult {
    GuardrailResult {
        compilation_clean: compilation_clean(entries),
        hot_disable_safe: hot_disable_safe(live, entries, ctx),
        quota_ok: quota_ok(pack, cfg),
        blast_radius_ok: blast_radius_ok(totals, cfg),
        health_ok: if ctx.engine_healthy {
            Verdict::pass()
        } else {
            Verdict::fail("execution engine unreachable")
        },
        lock_ok: if ctx.lock_free {
            Verdict::pass()
        } else {
            Verdict::fail("another deployment holds the tenant lock")
        },
        idempotency_ok: if ctx.applied_plan_shas.contains(plan_sha) {
            Verdict::fail("this exact plan has already been applied")
        } else {
            Verdict::pass()
        },
    }
}

fn compilation_clean(entries: &[PlanEntry]) -> Verdict {
    let dirty: Vec<&str> = entries
        .iter()
        .filter(|entry| {
            matches!(entry.action, Action::Create | Action::Update) && !entry.warnings.is_empty()
        })
        .map(|entry| entry.rule_id.as_str())
        .collect();

    if dirty.is_empty() {
        Verdict::pass()
    } else {
        Verdict::fail(format!("rules failed to compile: {}", dirty.join(", ")))
    }
}

fn hot_disable_safe(live: &[LiveRule], entries: &[PlanEntry], ctx: &GuardrailContext) -> Verdict {
    let mut disables_per_category: BTreeMap<String, usize> = BTreeMap::new();
    for entry in entries.iter().filter(|e| e.action == Action::Disable) {
        if let Some(rule) = live.iter().find(|r| r.definition.rule_id == entry.rule_id) {
            *disables_per_category
                .entry(format!("{:?}", rule.definition.severity).to_lowercase())
                .or_default() += 1;
        }
    }

    for (category, disabled) in &disables_per_category {
        let active = ctx.active_per_category.get(category).copied().unwrap_or(0);
        if active <= *disabled {
            return Verdict::fail(format!(
                "disabling would leave no active '{category}' rules"
            ));
        }
    }
    Verdict::pass()
}

fn quota_ok(pack: &RulePack, cfg: &PlanConfig) -> Verdict {
    if pack.items.len() <= cfg.tenant_rule_quota {
        Verdict::pass()
    } else {
        Verdict::fail(format!(
            "pack has {} rules, tenant quota is {}",
            pack.items.len(),
            cfg.tenant_rule_quota
        ))
    }
}

fn blast_radius_ok(totals: &PlanTotals, cfg: &PlanConfig) -> Verdict {
    let blast = totals.blast_radius();
    if blast <= cfg.blast_radius_max {
        Verdict::pass()
    } else {
        Verdict::fail(format!(
            "plan touches {blast} rules, ceiling is {}",
            cfg.blast_radius_max
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{RuleKind, Severity};
    use pretty_assertions::assert_eq;

    fn rule(rule_id: &str, content: &str, enabled: bool) -> RuleDefinition {
        RuleDefinition {
            rule_id: rule_id.into(),
            name: format!("rule {rule_id}"),
            kind: RuleKind::Native,
            content: content.into(),
            severity: Severity::Medium,
            enabled,
        }
    }

    fn pack_of(items: Vec<RuleDefinition>) -> RulePack {
        RulePack {
            pack_id: "pack-1".into(),
            tenant: "acme".into(),
            name: "auth-pack".into(),
            version: "1".into(),
            items,
            source: "test".into(),
            uploader: "ops".into(),
        }
    }

    fn live_of(definition: RuleDefinition, source_pack: Option<&str>) -> LiveRule {
        LiveRule {
            definition,
            source_pack: source_pack.map(str::to_string),
        }
    }

    fn ctx() -> GuardrailContext {
        GuardrailContext {
            live_count: 0,
            active_per_category: BTreeMap::new(),
            engine_healthy: true,
            lock_free: true,
            applied_plan_shas: BTreeSet::new(),
        }
    }

    fn cfg() -> PlanConfig {
        PlanConfig {
            tenant_rule_quota: 500,
            blast_radius_max: 50,
        }
    }

    #[test]
    fn classifies_create_update_skip_disable() {
        let pack = pack_of(vec![
            rule("new", "{\"a\":1}", true),
            rule("changed", "{\"b\":2}", true),
            rule("same", "{\"c\":3}", true),
        ]);
        let live = vec![
            live_of(rule("changed", "{\"b\":1}", true), Some("auth-pack")),
            live_of(rule("same", "{\"c\":3}", true), Some("auth-pack")),
            live_of(rule("orphan", "{\"d\":4}", true), Some("auth-pack")),
            live_of(rule("other", "{\"e\":5}", true), Some("another-pack")),
        ];

        let plan = evaluate_plan(
            &pack,
            &live,
            MatchBy::RuleId,
            &BTreeMap::new(),
            &ctx(),
            &cfg(),
        );

        assert_eq!(
            plan.totals,
            PlanTotals {
                create: 1,
                update: 1,
                disable: 1,
                skip: 1,
            }
        );
        assert_eq!(plan.entries.len(), pack.items.len() + 1);

        let orphan = plan
            .entries
            .iter()
            .find(|e| e.rule_id == "orphan")
            .unwrap();
        assert_eq!(orphan.action, Action::Disable);
        assert!(orphan.pre_image.is_some());

        // A rule owned by a different pack is left alone.
        assert!(plan.entries.iter().all(|e| e.rule_id != "other"));
    }

    #[test]
    fn match_by_name_diffs_on_rule_names() {
        let mut incoming = rule("id-new", "{\"a\":1}", true);
        incoming.name = "Brute Force".into();
        let mut existing = rule("id-old", "{\"a\":1}", true);
        existing.name = "Brute Force".into();

        let pack = pack_of(vec![incoming]);
        let live = vec![live_of(existing, Some("auth-pack"))];

        let plan = evaluate_plan(
            &pack,
            &live,
            MatchBy::Name,
            &BTreeMap::new(),
            &ctx(),
            &cfg(),
        );
        assert_eq!(plan.totals.skip, 1);
        assert_eq!(plan.totals.create, 0);
    }

    #[test]
    fn planning_is_pure_and_deterministic() {
        let pack = pack_of(vec![rule("r1", "{\"a\":1}", true)]);
        let live = vec![live_of(rule("r2", "{\"b\":2}", true), Some("auth-pack"))];

        let first = evaluate_plan(
            &pack,
            &live,
            MatchBy::RuleId,
            &BTreeMap::new(),
            &ctx(),
            &cfg(),
        );
        let second = evaluate_plan(
            &pack,
            &live,
            MatchBy::RuleId,
            &BTreeMap::new(),
            &ctx(),
            &cfg(),
        );

        assert_eq!(first, second);
        assert_eq!(first.plan_sha, second.plan_sha);
    }

    #[test]
    fn totals_add_up() {
        let pack = pack_of(vec![
            rule("a", "{\"a\":1}", true),
            rule("b", "{\"b\":1}", true),
        ]);
        let live = vec![
            live_of(rule("b", "{\"b\":1}", true), Some("auth-pack")),
            live_of(rule("gone", "{\"g\":1}", true), Some("auth-pack")),
        ];

        let plan = evaluate_plan(
            &pack,
            &live,
            MatchBy::RuleId,
            &BTreeMap::new(),
            &ctx(),
            &cfg(),
        );
        let t = plan.totals;
        assert_eq!(t.create + t.update + t.disable + t.skip, pack.items.len() + 1);
    }

    #[test]
    fn fatal_warnings_fail_compilation_clean() {
        let pack = pack_of(vec![rule("bad", "not json", true)]);
        let mut compilations = BTreeMap::new();
        compilations.insert(
            "bad".to_string(),
            CompileOutcome {
                fragment: None,
                warnings: vec!["invalid native rule content".to_string()],
            },
        );

        let plan = evaluate_plan(&pack, &[], MatchBy::RuleId, &compilations, &ctx(), &cfg());
        assert!(!plan.guardrails.compilation_clean.ok);
        assert_eq!(plan.guardrails.failing(), vec!["compilation_clean"]);
        assert_eq!(plan.entries[0].warnings.len(), 1);
    }

    #[test]
    fn hot_disable_guards_the_last_rule_of_a_category() {
        let pack = pack_of(vec![rule("keep", "{\"k\":1}", true)]);
        let live = vec![
            live_of(rule("keep", "{\"k\":1}", true), Some("auth-pack")),
            live_of(rule("last-medium", "{\"m\":1}", true), Some("auth-pack")),
        ];
        let mut context = ctx();
        // "keep" and "last-medium" are both medium; disabling one leaves one.
        context.active_per_category.insert("medium".into(), 2);

        let plan = evaluate_plan(&pack, &live, MatchBy::RuleId, &BTreeMap::new(), &context, &cfg());
        assert!(plan.guardrails.hot_disable_safe.ok);

        // Now the disable target is the only active medium rule.
        let mut context = ctx();
        context.active_per_category.insert("medium".into(), 1);
        let plan = evaluate_plan(&pack, &live, MatchBy::RuleId, &BTreeMap::new(), &context, &cfg());
        assert!(!plan.guardrails.hot_disable_safe.ok);
    }

    #[test]
    fn quota_and_blast_radius_ceilings() {
        let pack = pack_of(vec![
            rule("a", "{\"a\":1}", true),
            rule("b", "{\"b\":1}", true),
            rule("c", "{\"c\":1}", true),
        ]);
        let tight = PlanConfig {
            tenant_rule_quota: 2,
            blast_radius_max: 2,
        };

        let plan = evaluate_plan(&pack, &[], MatchBy::RuleId, &BTreeMap::new(), &ctx(), &tight);
        assert!(!plan.guardrails.quota_ok.ok);
        assert!(!plan.guardrails.blast_radius_ok.ok);
        let failing = plan.guardrails.failing();
        assert!(failing.contains(&"quota_ok"));
        assert!(failing.contains(&"blast_radius_ok"));
    }

    #[test]
    fn plan_sha_is_invariant_across_apply() {
        let item = rule("a", "{\"a\":1}", true);
        let pack = pack_of(vec![item.clone()]);

        let before = evaluate_plan(&pack, &[], MatchBy::RuleId, &BTreeMap::new(), &ctx(), &cfg());
        assert_eq!(before.totals.create, 1);

        // After apply the same pack re-plans to all skips with the same sha,
        // so the recorded sha flags the duplicate.
        let live = vec![live_of(item, Some("auth-pack"))];
        let mut context = ctx();
        context.applied_plan_shas.insert(before.plan_sha.clone());
        let after = evaluate_plan(&pack, &live, MatchBy::RuleId, &BTreeMap::new(), &context, &cfg());

        assert_eq!(after.totals.skip, 1);
        assert_eq!(after.plan_sha, before.plan_sha);
        assert!(!after.guardrails.idempotency_ok.ok);
    }

    #[test]
    fn a_plan_gaining_a_disable_is_not_flagged_as_duplicate() {
        let item = rule("a", "{\"a\":1}", true);
        let pack = pack_of(vec![item.clone()]);

        let applied = evaluate_plan(&pack, &[], MatchBy::RuleId, &BTreeMap::new(), &ctx(), &cfg());
        let mut context = ctx();
        context.applied_plan_shas.insert(applied.plan_sha.clone());

        // An orphan owned by the pack has appeared since the apply; the
        // re-plan retires it and therefore makes a real change.
        let live = vec![
            live_of(item, Some("auth-pack")),
            live_of(rule("orphan", "{\"o\":1}", true), Some("auth-pack")),
        ];
        let plan = evaluate_plan(&pack, &live, MatchBy::RuleId, &BTreeMap::new(), &context, &cfg());

        assert_eq!(plan.totals.disable, 1);
        assert_ne!(plan.plan_sha, applied.plan_sha);
        assert!(plan.guardrails.idempotency_ok.ok);
    }

    #[test]
    fn idempotency_flags_an_already_applied_plan() {
        let pack = pack_of(vec![rule("a", "{\"a\":1}", true)]);
        let first = evaluate_plan(&pack, &[], MatchBy::RuleId, &BTreeMap::new(), &ctx(), &cfg());
        assert!(first.guardrails.idempotency_ok.ok);

        let mut context = ctx();
        context.applied_plan_shas.insert(first.plan_sha.clone());
        let second = evaluate_plan(&pack, &[], MatchBy::RuleId, &BTreeMap::new(), &context, &cfg());
        assert!(!second.guardrails.idempotency_ok.ok);
        // Identical inputs still hash identically.
        assert_eq!(first.plan_sha, second.plan_sha);
    }
}
