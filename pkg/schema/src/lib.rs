use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

// ---------------------------------------------------------------------------
// Well-known labels, annotations and finalizers
// ---------------------------------------------------------------------------

pub const LABEL_SERVICE: &str = "tenancy.io/service";
pub const LABEL_STORAGE: &str = "tenancy.io/storage";
pub const LABEL_SHARD_KIND: &str = "tenancy.io/shard-kind";

pub const ANNOTATION_STATE: &str = "tenancy.io/state";
/// Absolute unix timestamp (seconds) after which a drained shard may be deleted.
pub const ANNOTATION_DELETING_TIME: &str = "tenancy.io/deleting-time";

pub const FINALIZER_SHARD_CLEANUP: &str = "tenancy.io/shard-cleanup";

// ---------------------------------------------------------------------------
// Object metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Unix seconds at which deletion was requested; set by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<u64>,
    /// Zero until the object has been persisted once.
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|value| value == finalizer)
    }

    /// Returns `true` when the finalizer was not present before.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns `true` when the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|value| value != finalizer);
        before != self.finalizers.len()
    }

    pub fn service_storage(&self) -> Option<ServiceStorage> {
        let service = self.label(LABEL_SERVICE)?.trim();
        let storage = self.label(LABEL_STORAGE)?.trim();
        if service.is_empty() || storage.is_empty() {
            return None;
        }
        Some(ServiceStorage::new(service, storage))
    }
}

/// Typed object kept in a resource store.
pub trait Resource: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.meta().name
    }
}

// ---------------------------------------------------------------------------
// Service/storage pair
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceStorage {
    pub service: String,
    pub storage: String,
}

impl ServiceStorage {
    pub fn new(service: &str, storage: &str) -> Self {
        Self {
            service: service.to_string(),
            storage: storage.to_string(),
        }
    }

    /// Key used by the routing reconciler work queue.
    pub fn key(&self) -> String {
        format!("{}/{}", self.service, self.storage)
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let (service, storage) = key.split_once('/')?;
        if service.is_empty() || storage.is_empty() {
            return None;
        }
        Some(Self::new(service, storage))
    }
}

// ---------------------------------------------------------------------------
// Shards
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardKind {
    Ingestion,
    Compaction,
}

impl ShardKind {
    pub const ALL: [ShardKind; 2] = [ShardKind::Ingestion, ShardKind::Compaction];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingestion => "ingester",
            Self::Compaction => "compactor",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ingester" => Some(Self::Ingestion),
            "compactor" => Some(Self::Compaction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Running,
    Deleting,
}

impl ShardState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Deleting => "Deleting",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub meta: ObjectMeta,
    pub kind: ShardKind,
    #[serde(default)]
    pub tenants: Vec<String>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

fn default_replicas() -> u32 {
    1
}

impl Resource for Shard {
    const KIND: &'static str = "Shard";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

impl Shard {
    pub fn new(pair: &ServiceStorage, kind: ShardKind, index: usize, replicas: u32) -> Self {
        let meta = ObjectMeta::new(shard_name(pair, kind, index))
            .with_label(LABEL_SERVICE, &pair.service)
            .with_label(LABEL_STORAGE, &pair.storage)
            .with_label(LABEL_SHARD_KIND, kind.as_str());
        let mut shard = Self {
            meta,
            kind,
            tenants: Vec::new(),
            replicas: replicas.max(1),
        };
        shard.mark_running();
        shard
    }

    /// Missing or unknown state annotations read as `Running`.
    pub fn state(&self) -> ShardState {
        match self.meta.annotation(ANNOTATION_STATE) {
            Some("Deleting") => ShardState::Deleting,
            _ => ShardState::Running,
        }
    }

    pub fn deadline(&self) -> Option<u64> {
        self.meta
            .annotation(ANNOTATION_DELETING_TIME)
            .and_then(|raw| raw.trim().parse::<u64>().ok())
    }

    pub fn mark_deleting(&mut self, deadline_unix_secs: u64) {
        self.meta.annotations.insert(
            ANNOTATION_STATE.to_string(),
            ShardState::Deleting.as_str().to_string(),
        );
        self.meta.annotations.insert(
            ANNOTATION_DELETING_TIME.to_string(),
            deadline_unix_secs.to_string(),
        );
    }

    pub fn mark_running(&mut self) {
        self.meta.annotations.insert(
            ANNOTATION_STATE.to_string(),
            ShardState::Running.as_str().to_string(),
        );
        self.meta.annotations.remove(ANNOTATION_DELETING_TIME);
    }

    pub fn service_storage(&self) -> Option<ServiceStorage> {
        self.meta.service_storage()
    }

    pub fn contains_tenant(&self, tenant: &str) -> bool {
        self.tenants.iter().any(|value| value == tenant)
    }

    /// Appends the tenant, keeping the set unique. A draining shard is revived.
    pub fn add_tenant(&mut self, tenant: &str) -> bool {
        if self.contains_tenant(tenant) {
            return false;
        }
        self.tenants.push(tenant.to_string());
        if self.state() == ShardState::Deleting {
            self.mark_running();
        }
        true
    }

    pub fn remove_tenant(&mut self, tenant: &str) -> bool {
        let before = self.tenants.len();
        self.tenants.retain(|value| value != tenant);
        before != self.tenants.len()
    }

    pub fn matches(&self, pair: &ServiceStorage, kind: ShardKind) -> bool {
        self.kind == kind
            && self.meta.label(LABEL_SHARD_KIND) == Some(kind.as_str())
            && self.service_storage().as_ref() == Some(pair)
    }
}

/// Deterministic shard name for `(service, storage, kind, index)`.
pub fn shard_name(pair: &ServiceStorage, kind: ShardKind, index: usize) -> String {
    format!("{}-{}-{index}", pair_stem(pair), kind.as_str())
}

/// Name prefix owned by one pair. Pairs made only of `[a-z0-9]` keep the
/// readable `service-storage` form; anything else gets a hash of the raw pair
/// appended, so the two forms differ in hyphen count and never meet.
fn pair_stem(pair: &ServiceStorage) -> String {
    let service = sanitize_name_component(&pair.service);
    let storage = sanitize_name_component(&pair.storage);
    if is_plain_component(&pair.service) && is_plain_component(&pair.storage) {
        return format!("{service}-{storage}");
    }
    let mut raw = Vec::with_capacity(pair.service.len() + pair.storage.len() + 1);
    raw.extend_from_slice(pair.service.as_bytes());
    raw.push(0);
    raw.extend_from_slice(pair.storage.as_bytes());
    format!("{service}-{storage}-{:08x}", fnv1a_hash64(&raw) as u32)
}

fn is_plain_component(raw: &str) -> bool {
    !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

fn fnv1a_hash64(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 14695981039346656037;
    const FNV_PRIME: u64 = 1099511628211;
    let mut hash = FNV_OFFSET;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub fn sanitize_name_component(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|ch| match ch {
            'a'..='z' | '0'..='9' | '-' => ch,
            'A'..='Z' => ch.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();
    if out.is_empty() {
        out.push('x');
    }
    out
}

// ---------------------------------------------------------------------------
// Tenants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRef {
    pub name: String,
}

impl ShardRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSpec {
    /// Tenant id used in routing tables; the object name when empty.
    #[serde(default)]
    pub tenant: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingester: Option<ShardRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compactor: Option<ShardRef>,
    /// Per-tenant rule evaluator, produced outside the scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruler: Option<ShardRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: TenantSpec,
    #[serde(default)]
    pub status: TenantStatus,
}

impl Resource for Tenant {
    const KIND: &'static str = "Tenant";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

impl Tenant {
    pub fn new(name: &str) -> Self {
        Self {
            meta: ObjectMeta::new(name),
            spec: TenantSpec::default(),
            status: TenantStatus::default(),
        }
    }

    pub fn with_service_storage(mut self, service: &str, storage: &str) -> Self {
        self.meta = self
            .meta
            .with_label(LABEL_SERVICE, service)
            .with_label(LABEL_STORAGE, storage);
        self
    }

    pub fn tenant_id(&self) -> &str {
        let tenant = self.spec.tenant.trim();
        if tenant.is_empty() {
            &self.meta.name
        } else {
            tenant
        }
    }

    pub fn service_storage(&self) -> Option<ServiceStorage> {
        self.meta.service_storage()
    }

    pub fn shard_ref(&self, kind: ShardKind) -> Option<&ShardRef> {
        match kind {
            ShardKind::Ingestion => self.status.ingester.as_ref(),
            ShardKind::Compaction => self.status.compactor.as_ref(),
        }
    }

    pub fn set_shard_ref(&mut self, kind: ShardKind, value: Option<ShardRef>) {
        match kind {
            ShardKind::Ingestion => self.status.ingester = value,
            ShardKind::Compaction => self.status.compactor = value,
        }
    }
}

// ---------------------------------------------------------------------------
// Published routing tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTableDocument {
    pub meta: ObjectMeta,
    /// Rendered routing table JSON consumed by the write router.
    pub data: String,
}

impl Resource for RoutingTableDocument {
    const KIND: &'static str = "RoutingTable";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

impl RoutingTableDocument {
    pub fn new(pair: &ServiceStorage, data: String) -> Self {
        Self {
            meta: ObjectMeta::new(routing_table_name(pair))
                .with_label(LABEL_SERVICE, &pair.service)
                .with_label(LABEL_STORAGE, &pair.storage),
            data,
        }
    }
}

pub fn routing_table_name(pair: &ServiceStorage) -> String {
    pair_stem(pair)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingField(&'static str),
    InvalidValue(&'static str),
}

pub fn validate_tenant(tenant: &Tenant) -> Result<(), ValidationError> {
    if tenant.meta.name.trim().is_empty() {
        return Err(ValidationError::MissingField("name"));
    }
    if tenant.meta.name.contains('/') {
        return Err(ValidationError::InvalidValue("name"));
    }
    // A half-labelled tenant is almost certainly a typo, not an unscheduled tenant.
    match (
        tenant.meta.label(LABEL_SERVICE).map(str::trim),
        tenant.meta.label(LABEL_STORAGE).map(str::trim),
    ) {
        (Some(service), Some(storage)) => {
            if service.is_empty() {
                return Err(ValidationError::MissingField("service"));
            }
            if storage.is_empty() {
                return Err(ValidationError::MissingField("storage"));
            }
            if service.contains('/') {
                return Err(ValidationError::InvalidValue("service"));
            }
        }
        (None, None) => {}
        (Some(_), None) => return Err(ValidationError::MissingField("storage")),
        (None, Some(_)) => return Err(ValidationError::MissingField("service")),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> ServiceStorage {
        ServiceStorage::new("svc", "store")
    }

    #[test]
    fn shard_name_is_deterministic_and_sanitized() {
        assert_eq!(
            shard_name(&pair(), ShardKind::Ingestion, 2),
            "svc-store-ingester-2"
        );
        assert_eq!(routing_table_name(&pair()), "svc-store");

        let pair = ServiceStorage::new("Monitoring", "kube-system/S3_Bucket");
        let name = shard_name(&pair, ShardKind::Compaction, 0);
        assert!(name.starts_with("monitoring-kube-system-s3-bucket-"));
        assert!(name.ends_with("-compactor-0"));
        assert_eq!(name, shard_name(&pair, ShardKind::Compaction, 0));
    }

    #[test]
    fn pairs_that_sanitize_alike_get_distinct_names() {
        let pairs = [
            ServiceStorage::new("a", "b-c"),
            ServiceStorage::new("a-b", "c"),
            ServiceStorage::new("svc_x", "store"),
            ServiceStorage::new("svc-x", "store"),
            ServiceStorage::new("SVC", "store"),
            ServiceStorage::new("svc", "store"),
        ];
        let shards: std::collections::HashSet<String> = pairs
            .iter()
            .map(|pair| shard_name(pair, ShardKind::Ingestion, 0))
            .collect();
        let tables: std::collections::HashSet<String> =
            pairs.iter().map(routing_table_name).collect();
        assert_eq!(shards.len(), pairs.len());
        assert_eq!(tables.len(), pairs.len());
    }

    #[test]
    fn new_shard_starts_running_with_labels() {
        let shard = Shard::new(&pair(), ShardKind::Ingestion, 0, 0);
        assert_eq!(shard.state(), ShardState::Running);
        assert_eq!(shard.deadline(), None);
        assert_eq!(shard.replicas, 1);
        assert!(shard.matches(&pair(), ShardKind::Ingestion));
        assert!(!shard.matches(&pair(), ShardKind::Compaction));
    }

    #[test]
    fn adding_tenant_revives_deleting_shard() {
        let mut shard = Shard::new(&pair(), ShardKind::Ingestion, 0, 1);
        shard.mark_deleting(1_000);
        assert_eq!(shard.state(), ShardState::Deleting);
        assert_eq!(shard.deadline(), Some(1_000));

        assert!(shard.add_tenant("acme"));
        assert!(!shard.add_tenant("acme"));
        assert_eq!(shard.state(), ShardState::Running);
        assert_eq!(shard.deadline(), None);
        assert_eq!(shard.tenants, vec!["acme".to_string()]);
    }

    #[test]
    fn tenant_without_both_labels_has_no_service_storage() {
        let tenant = Tenant::new("acme");
        assert_eq!(tenant.service_storage(), None);

        let mut half = Tenant::new("acme");
        half.meta.labels.insert(LABEL_SERVICE.into(), "svc".into());
        assert_eq!(half.service_storage(), None);
        assert_eq!(
            validate_tenant(&half),
            Err(ValidationError::MissingField("storage"))
        );

        let full = Tenant::new("acme").with_service_storage("svc", "store");
        assert_eq!(full.service_storage(), Some(pair()));
        assert_eq!(validate_tenant(&full), Ok(()));
    }

    #[test]
    fn tenant_id_falls_back_to_name() {
        let mut tenant = Tenant::new("acme");
        assert_eq!(tenant.tenant_id(), "acme");
        tenant.spec.tenant = "acme-prod".into();
        assert_eq!(tenant.tenant_id(), "acme-prod");
    }

    #[test]
    fn finalizer_helpers_report_changes() {
        let mut meta = ObjectMeta::new("acme");
        assert!(meta.add_finalizer(FINALIZER_SHARD_CLEANUP));
        assert!(!meta.add_finalizer(FINALIZER_SHARD_CLEANUP));
        assert!(meta.remove_finalizer(FINALIZER_SHARD_CLEANUP));
        assert!(!meta.remove_finalizer(FINALIZER_SHARD_CLEANUP));
    }

    #[test]
    fn service_storage_key_round_trips() {
        let key = pair().key();
        assert_eq!(key, "svc/store");
        assert_eq!(ServiceStorage::from_key(&key), Some(pair()));
        assert_eq!(ServiceStorage::from_key("no-separator"), None);
    }
}
