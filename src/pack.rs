//! Rule packs and rule definitions.
//!
//! A pack is an uploaded, immutable batch of rule definitions. Native rule
//! content is the structured detection DSL; SIGMA-style content is opaque
//! here and goes through an injected translator that must itself produce a
//! native detection tree before compilation.

use crate::{
    blocks::DetectionBlock,
    error::{Result, ServiceError},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Native,
    Sigma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub rule_id: String,
    pub name: String,
    pub kind: RuleKind,
    pub content: String,
    pub severity: Severity,
    pub enabled: bool,
}

impl RuleDefinition {
    /// Stable content digest used for diffing and rollback pre-images.
    pub fn content_sha(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulePack {
    pub pack_id: String,
    pub tenant: String,
    pub name: String,
    pub version: String,
    pub items: Vec<RuleDefinition>,
    pub source: String,
    pub uploader: String,
}

/// Upload payload; the service assigns the pack id.
#[derive(Debug, Clone, Deserialize)]
pub struct RulePackUpload {
    pub tenant: String,
    pub name: String,
    pub version: String,
    pub items: Vec<RuleDefinition>,
    #[serde(default)]
    pub source: Option<String>,
    pub uploader: String,
}

impl RulePack {
    pub fn from_upload(upload: RulePackUpload) -> Result<Self> {
        if upload.items.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "a rule pack must contain at least one rule".into(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for item in &upload.items {
            if !seen.insert(item.rule_id.as_str()) {
                return Err(ServiceError::InvalidRequest(format!(
                    "duplicate rule_id '{}' in pack",
                    item.rule_id
                )));
            }
        }

        Ok(Self {
            pack_id: Uuid::new_v4().to_string(),
            tenant: upload.tenant,
            name: upload.name,
            version: upload.version,
            items: upload.items,
            source: upload.source.unwrap_or_else(|| "upload".to_string()),
            uploader: upload.uploader,
        })
    }
}

/// Parsed native rule content: the table it reads plus its detection tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeRule {
    pub table: String,
    pub blocks: Vec<DetectionBlock>,
}

pub fn parse_native(content: &str) -> Result<NativeRule> {
    serde_json::from_str(content)
        .map_err(|err| ServiceError::InvalidRequest(format!("invalid native rule content: {err}")))
}

/// Translation seam for the alternate rule syntax. Implementations live
/// outside this crate; the service runs without one and surfaces untranslated
/// SIGMA items as per-rule compilation warnings.
pub trait SigmaTranslator: Send + Sync {
    fn translate(&self, content: &str) -> Result<NativeRule>;
}

/// A rule as the live store knows it, with pack provenance for diffing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveRule {
    pub definition: RuleDefinition,
    /// Name of the pack that last wrote this rule, if any.
    pub source_pack: Option<String>,
}
