//! Structural inversion of an applied plan.
//!
//! Every CREATE becomes a removal, every UPDATE reverts to the captured
//! pre-image, every DISABLE is re-enabled. Rollback is all-or-nothing: if
//! any entry that needs a pre-image lacks one, the whole rollback fails and
//! reports the blocking entries.

use crate::{
    deploy::RuleMutation,
    error::{Result, ServiceError},
    pack::LiveRule,
    plan::{Action, PlanEntry, PlanTotals},
};

#[derive(Debug)]
pub struct InversePlan {
    pub entries: Vec<PlanEntry>,
    pub mutations: Vec<RuleMutation>,
    pub totals: PlanTotals,
}

pub fn invert_entries(entries: &[PlanEntry], source_pack: Option<&str>) -> Result<InversePlan> {
    let mut inverse_entries = Vec::new();
    let mut mutations = Vec::new();
    let mut totals = PlanTotals::default();
    let mut blockers: Vec<&str> = Vec::new();

    for entry in entries {
        match entry.action {
            Action::Skip => {}
            // A created rule has no prior state; it is simply removed.
            Action::Create => {
                totals.disable += 1;
                inverse_entries.push(PlanEntry {
                    rule_id: entry.rule_id.clone(),
                    name: entry.name.clone(),
                    action: Action::Disable,
                    warnings: Vec::new(),
                    from_sha: entry.to_sha.clone(),
                    to_sha: None,
                    pre_image: None,
                });
                mutations.push(RuleMutation::Remove {
                    rule_id: entry.rule_id.clone(),
                });
            }
            Action::Update => match &entry.pre_image {
                Some(pre_image) => {
                    totals.update += 1;
                    inverse_entries.push(PlanEntry {
                        rule_id: entry.rule_id.clone(),
                        name: entry.name.clone(),
                        action: Action::Update,
                        warnings: Vec::new(),
                        from_sha: entry.to_sha.clone(),
                        to_sha: entry.from_sha.clone(),
                        pre_image: None,
                    });
                    mutations.push(RuleMutation::Upsert {
                        rule: LiveRule {
                            definition: pre_image.clone(),
                            source_pack: source_pack.map(str::to_string),
                        },
                    });
                }
                None => blockers.push(entry.rule_id.as_str()),
            },
            Action::Disable => {
                totals.update += 1;
                inverse_entries.push(PlanEntry {
                    rule_id: entry.rule_id.clone(),
                    name: entry.name.clone(),
                    action: Action::Update,
                    warnings: Vec::new(),
                    from_sha: entry.from_sha.clone(),
                    to_sha: entry.from_sha.clone(),
                    pre_image: None,
                });
                mutations.push(RuleMutation::Enable {
                    rule_id: entry.rule_id.clone(),
                });
            }
        }
    }

    if !blockers.is_empty() {
        return Err(ServiceError::RollbackUnavailable(format!(
            "no pre-image captured for: {}",
            blockers.join(", ")
        )));
    }

    Ok(InversePlan {
        entries: inverse_entries,
        mutations,
        totals,
    })
}
