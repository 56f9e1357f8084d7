//! Per-tenant schema snapshots with a TTL cache and per-scope load coalescing.

use crate::{
    error::{Result, ServiceError},
    fields,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::debug;

/// Cache key: one tenant's view of one log table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey {
    pub tenant: String,
    pub table: String,
}

impl ScopeKey {
    pub fn new(tenant: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            table: table.into(),
        }
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant, self.table)
    }
}

/// Immutable snapshot of one load. Columns and types come from the same
/// fetch, never mixed across loads.
#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub scope: ScopeKey,
    pub columns: BTreeSet<String>,
    pub types: BTreeMap<String, String>,
    pub loaded_at: Instant,
}

impl SchemaEntry {
    pub fn new(scope: ScopeKey, types: BTreeMap<String, String>) -> Self {
        let columns = types.keys().cloned().collect();
        Self {
            scope,
            columns,
            types,
            loaded_at: Instant::now(),
        }
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains(name)
    }
}

/// External metadata source. An absent table is a valid answer (empty map),
/// not an error.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn fetch(&self, scope: &ScopeKey) -> Result<BTreeMap<String, String>>;
}

/// Resolves a canonical field name against a concrete column set.
pub fn resolve(canonical: &str, columns: &BTreeSet<String>) -> Result<&'static str> {
    try_resolve(canonical, columns).ok_or_else(|| ServiceError::UnknownField(canonical.to_string()))
}

pub fn try_resolve(canonical: &str, columns: &BTreeSet<String>) -> Option<&'static str> {
    fields::candidates(canonical)
        .iter()
        .copied()
        .find(|candidate| columns.contains(*candidate))
}

struct Ready {
    entry: Arc<SchemaEntry>,
    expires_at: Instant,
}

/// TTL cache over a `SchemaSource`.
///
/// Reads of a fresh entry take a `RwLock` read over an `Arc` snapshot.
/// A miss or stale entry funnels through a per-scope async mutex so that
/// concurrent callers for the same scope collapse to one upstream fetch;
/// the waiters pick up the freshly published snapshot on re-check.
pub struct SchemaCache {
    source: Arc<dyn SchemaSource>,
    ttl: Duration,
    ready: RwLock<HashMap<ScopeKey, Ready>>,
    loading: Mutex<HashMap<ScopeKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SchemaCache {
    pub fn new(source: Arc<dyn SchemaSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            ready: RwLock::new(HashMap::new()),
            loading: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load(&self, scope: &ScopeKey) -> Result<Arc<SchemaEntry>> {
        if let Some(entry) = self.fresh(scope) {
            return Ok(entry);
        }

        let guard = self.load_guard(scope);
        let _held = guard.lock().await;

        // Another caller may have finished the load while we waited.
        if let Some(entry) = self.fresh(scope) {
            return Ok(entry);
        }

        debug!(scope = %scope, "loading schema from source");
        let types = self.source.fetch(scope).await?;
        let entry = Arc::new(SchemaEntry::new(scope.clone(), types));
        self.ready.write().insert(
            scope.clone(),
            Ready {
                entry: Arc::clone(&entry),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(entry)
    }

    fn fresh(&self, scope: &ScopeKey) -> Option<Arc<SchemaEntry>> {
        let ready = self.ready.read();
        ready.get(scope).and_then(|slot| {
            if slot.expires_at > Instant::now() {
                Some(Arc::clone(&slot.entry))
            } else {
                None
            }
        })
    }

    fn load_guard(&self, scope: &ScopeKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut loading = self.loading.lock();
        Arc::clone(
            loading
                .entry(scope.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

/// Schema source backed by an in-process table registry. Used by the
/// embedded service mode and the test suite; production deployments inject
/// a client for the real metadata service instead.
#[derive(Default)]
pub struct StaticSchemaSource {
    tables: RwLock<HashMap<ScopeKey, BTreeMap<String, String>>>,
}

impl StaticSchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_table(&self, scope: ScopeKey, columns: &[(&str, &str)]) {
        let types = columns
            .iter()
            .map(|(name, ty)| (name.to_string(), ty.to_string()))
            .collect();
        self.tables.write().insert(scope, types);
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn fetch(&self, scope: &ScopeKey) -> Result<BTreeMap<String, String>> {
        // An unknown table is an empty column set, not an error.
        Ok(self.tables.read().get(scope).cloned().unwrap_or_default())
    }
}
