//! File-backed simulated control plane.
//!
//! Models the parts of the platform the adapters depend on: name
//! uniqueness, asynchronous status transitions, dependency checks (a role
//! with attached policies cannot be deleted, a bucket must be empty, a
//! collection needs an encryption policy), and eventually consistent role
//! visibility. Resources settle one observation after each transition, so
//! every status wait is exercised.
//!
//! Tests use the call counters and fault injection; the CLI persists the
//! state as JSON so `deploy`, `test` and `cleanup` work across processes.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ActionGroupInfo, ActionGroupSpec, AgentApi, AgentInfo, AgentSpec, AgentSummary, AliasInfo,
    CallerIdentity, CollaboratorInfo, Collaboration, CollectionInfo, DataSourceSpec,
    DataSourceSummary, FunctionApi, FunctionInfo, FunctionSpec, IamApi, IdentityApi,
    IngestionJob, InvokePermission, KnowledgeBaseApi, KnowledgeBaseInfo, KnowledgeBaseSpec,
    KnowledgeBaseSummary, ManagedPolicyInfo, ObjectVersion, PolicyVersionInfo, RoleInfo,
    SearchApi, SearchPolicy, StorageApi,
};
use crate::collaborators::{
    dispatch_payload, ActionRequest, ActionResponse, Domain, HandlerRegistry, Parameter, DOMAIN_ENV,
};
use crate::error::{ApiError, ApiErrorKind, ProvisionError};
use crate::names::TEST_ALIAS_ID;
use crate::package::code_sha256;
use crate::policy::CollectionPolicyKind;
use crate::wait::DELETING;

const MAX_POLICY_VERSIONS: usize = 5;

/// Internal status after `DELETING`; the resource is dropped on next access.
const REMOVED: &str = "REMOVED";

/// A status plus the statuses it will move through on later observations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Lifecycle {
    status: String,
    #[serde(default)]
    upcoming: VecDeque<String>,
}

impl Lifecycle {
    fn settled(status: &str) -> Self {
        Self {
            status: status.to_string(),
            upcoming: VecDeque::new(),
        }
    }

    fn begin(&mut self, now: &str, then: &[&str]) {
        self.status = now.to_string();
        self.upcoming = then.iter().map(|s| s.to_string()).collect();
    }

    /// Report the current status, then advance.
    fn observe(&mut self) -> String {
        let current = self.status.clone();
        if let Some(next) = self.upcoming.pop_front() {
            self.status = next;
        }
        current
    }

    fn peek(&self) -> &str {
        &self.status
    }

    /// Report `DELETING` once more, then disappear.
    fn begin_delete(&mut self) {
        self.begin(DELETING, &[REMOVED]);
    }

    fn is_deleting(&self) -> bool {
        self.status == DELETING
    }

    fn is_removed(&self) -> bool {
        self.status == REMOVED
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimRole {
    name: String,
    arn: String,
    trust_policy: String,
    #[serde(default)]
    attached: BTreeSet<String>,
    #[serde(default)]
    inline: BTreeMap<String, String>,
    /// Reads that still miss the role after creation
    #[serde(default)]
    hidden_reads: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimPolicyVersion {
    version_id: String,
    document: String,
    is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimPolicy {
    name: String,
    arn: String,
    versions: Vec<SimPolicyVersion>,
    next_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimObjectVersion {
    version_id: String,
    delete_marker: bool,
    size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimBucket {
    region: String,
    versioning: bool,
    #[serde(default)]
    objects: BTreeMap<String, Vec<SimObjectVersion>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimFunction {
    info: FunctionInfo,
    state: Lifecycle,
    update: Lifecycle,
    #[serde(default)]
    permissions: BTreeMap<String, InvokePermission>,
}

impl SimFunction {
    fn observe(&mut self) -> FunctionInfo {
        self.info.state = self.state.observe();
        self.info.last_update_status = self.update.observe();
        self.info.clone()
    }

    /// Updates and invocations bring an idle function back.
    fn reactivate(&mut self) {
        if self.state.peek() == "Inactive" {
            self.state.begin("Pending", &["Active"]);
        }
    }

    fn peek(&self) -> FunctionInfo {
        let mut info = self.info.clone();
        info.state = self.state.peek().to_string();
        info.last_update_status = self.update.peek().to_string();
        info
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimCollection {
    info: CollectionInfo,
    lifecycle: Lifecycle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimDataSource {
    summary: DataSourceSummary,
    spec: DataSourceSpec,
    #[serde(default)]
    jobs: BTreeMap<String, Lifecycle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimKnowledgeBase {
    info: KnowledgeBaseInfo,
    lifecycle: Lifecycle,
    spec: KnowledgeBaseSpec,
    #[serde(default)]
    data_sources: BTreeMap<String, SimDataSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimAlias {
    info: AliasInfo,
    lifecycle: Lifecycle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimAgent {
    info: AgentInfo,
    lifecycle: Lifecycle,
    #[serde(default)]
    action_groups: Vec<ActionGroupInfo>,
    #[serde(default)]
    aliases: BTreeMap<String, SimAlias>,
    #[serde(default)]
    knowledge_bases: BTreeSet<String>,
    #[serde(default)]
    collaborators: Vec<CollaboratorInfo>,
    #[serde(default)]
    version: u32,
}

impl SimAgent {
    /// Any change to the working draft leaves it unprepared.
    fn draft_changed(&mut self) {
        self.lifecycle = Lifecycle::settled("NOT_PREPARED");
    }
}

/// Everything the simulator persists.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SimState {
    #[serde(default)]
    roles: BTreeMap<String, SimRole>,
    #[serde(default)]
    policies: BTreeMap<String, SimPolicy>,
    #[serde(default)]
    buckets: BTreeMap<String, SimBucket>,
    #[serde(default)]
    functions: BTreeMap<String, SimFunction>,
    /// Keyed by `{kind}/{name}`
    #[serde(default)]
    search_policies: BTreeMap<String, SearchPolicy>,
    #[serde(default)]
    collections: BTreeMap<String, SimCollection>,
    /// Keyed by `{endpoint}|{index}`
    #[serde(default)]
    indexes: BTreeMap<String, Value>,
    #[serde(default)]
    knowledge_bases: BTreeMap<String, SimKnowledgeBase>,
    #[serde(default)]
    agents: BTreeMap<String, SimAgent>,
}

impl SimState {
    /// Drop resources whose deletion has completed.
    fn purge_removed(&mut self) {
        self.collections.retain(|_, c| !c.lifecycle.is_removed());
        self.knowledge_bases.retain(|_, kb| !kb.lifecycle.is_removed());
        self.agents.retain(|_, a| !a.lifecycle.is_removed());
    }

    fn collection_by_endpoint(&self, endpoint: &str) -> Option<&SimCollection> {
        self.collections
            .values()
            .find(|c| c.info.endpoint.as_deref() == Some(endpoint))
    }

    fn attachment_count(&self, policy_arn: &str) -> u32 {
        self.roles
            .values()
            .filter(|r| r.attached.contains(policy_arn))
            .count() as u32
    }
}

/// In-memory control plane with optional JSON persistence.
pub struct MemoryControlPlane {
    region: String,
    account_id: String,
    state: Mutex<SimState>,
    calls: Mutex<HashMap<String, u32>>,
    faults: Mutex<HashMap<String, ApiError>>,
    role_visibility_lag: u32,
    handlers: HandlerRegistry,
    path: Option<PathBuf>,
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_uppercase()
}

fn is_aws_managed(policy_arn: &str) -> bool {
    policy_arn.starts_with("arn:aws:iam::aws:policy/")
}

/// Whether any string inside a JSON document equals `resource`.
fn covers(document: &Value, resource: &str) -> bool {
    match document {
        Value::String(s) => s == resource,
        Value::Array(items) => items.iter().any(|v| covers(v, resource)),
        Value::Object(map) => map.values().any(|v| covers(v, resource)),
        _ => false,
    }
}

fn not_found(op: &str, what: impl std::fmt::Display) -> ApiError {
    ApiError::not_found(op, format!("{} not found", what))
}

fn policy_key(kind: CollectionPolicyKind, name: &str) -> String {
    format!("{}/{}", kind, name)
}

impl MemoryControlPlane {
    pub fn new(region: &str, account_id: &str) -> Self {
        Self {
            region: region.to_string(),
            account_id: account_id.to_string(),
            state: Mutex::new(SimState::default()),
            calls: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            role_visibility_lag: 0,
            handlers: HandlerRegistry::new(),
            path: None,
        }
    }

    /// Open a simulator persisted at `path`, starting empty when the file
    /// does not exist yet.
    pub fn open(path: &Path, region: &str, account_id: &str) -> Result<Self, ProvisionError> {
        let mut plane = Self::new(region, account_id);
        plane.path = Some(path.to_path_buf());
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let state: SimState = serde_json::from_str(&text)?;
                info!("Loaded simulated control plane from {}", path.display());
                plane.state = Mutex::new(state);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No simulator state at {}, starting empty", path.display());
            }
            Err(e) => return Err(e.into()),
        }
        Ok(plane)
    }

    /// Newly created roles stay invisible for this many reads.
    pub fn with_role_visibility_lag(mut self, reads: u32) -> Self {
        self.role_visibility_lag = reads;
        self
    }

    /// Write the state back to the file it was opened from.
    pub fn save(&self) -> Result<(), ProvisionError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&*self.lock())?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved simulated control plane to {}", path.display());
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.purge_removed();
        st
    }

    /// Count a call and apply any injected fault.
    fn call(&self, op: &str) -> Result<(), ApiError> {
        {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            *calls.entry(op.to_string()).or_insert(0) += 1;
        }
        let faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        match faults.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    // ==================== Test controls ====================

    /// Number of calls made to an operation.
    pub fn calls(&self, op: &str) -> u32 {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.get(op).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Make every call to `op` fail with `error` until cleared.
    pub fn fail_on(&self, op: &str, error: ApiError) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(op.to_string(), error);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Put a function into the idle `Inactive` state.
    pub fn deactivate_function(&self, name: &str) {
        if let Some(f) = self.lock().functions.get_mut(name) {
            f.state = Lifecycle::settled("Inactive");
        }
    }

    // ==================== Inspection ====================

    pub fn live_roles(&self) -> Vec<String> {
        self.lock().roles.keys().cloned().collect()
    }

    pub fn live_policies(&self) -> Vec<String> {
        self.lock().policies.values().map(|p| p.name.clone()).collect()
    }

    pub fn live_buckets(&self) -> Vec<String> {
        self.lock().buckets.keys().cloned().collect()
    }

    pub fn object_keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn live_functions(&self) -> Vec<String> {
        self.lock().functions.keys().cloned().collect()
    }

    pub fn live_collections(&self) -> Vec<String> {
        self.lock().collections.keys().cloned().collect()
    }

    pub fn live_search_policies(&self) -> Vec<String> {
        self.lock().search_policies.keys().cloned().collect()
    }

    pub fn live_indexes(&self) -> Vec<String> {
        self.lock().indexes.keys().cloned().collect()
    }

    pub fn live_knowledge_bases(&self) -> Vec<String> {
        self.lock()
            .knowledge_bases
            .values()
            .map(|kb| kb.info.name.clone())
            .collect()
    }

    pub fn live_agents(&self) -> Vec<String> {
        self.lock()
            .agents
            .values()
            .map(|a| a.info.name.clone())
            .collect()
    }

    /// Names of the collaborators associated with the agent called `name`.
    pub fn collaborator_names(&self, name: &str) -> BTreeSet<String> {
        self.lock()
            .agents
            .values()
            .find(|a| a.info.name == name)
            .map(|a| a.collaborators.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    // ==================== ARNs ====================

    fn role_arn(&self, name: &str) -> String {
        format!("arn:aws:iam::{}:role/{}", self.account_id, name)
    }

    fn policy_arn(&self, name: &str) -> String {
        format!("arn:aws:iam::{}:policy/{}", self.account_id, name)
    }

    fn function_arn(&self, name: &str) -> String {
        format!(
            "arn:aws:lambda:{}:{}:function:{}",
            self.region, self.account_id, name
        )
    }

    fn bedrock_arn(&self, resource: &str) -> String {
        format!(
            "arn:aws:bedrock:{}:{}:{}",
            self.region, self.account_id, resource
        )
    }

    // ==================== Agent routing ====================

    /// Domain and action group behind a collaborator alias.
    fn collaborator_target(
        &self,
        st: &SimState,
        alias_arn: &str,
    ) -> Option<(Domain, ActionGroupInfo)> {
        let agent_id = alias_arn.rsplit('/').nth(1)?;
        let agent = st.agents.get(agent_id)?;
        let group = agent.action_groups.first()?;
        let function = group.function_arn.rsplit(':').next()?;
        let domain = st
            .functions
            .get(function)?
            .info
            .environment
            .get(DOMAIN_ENV)?
            .parse()
            .ok()?;
        Some((domain, group.clone()))
    }

    /// Route a prompt the way a supervisor would: to the first collaborator
    /// whose domain the prompt mentions.
    fn route(&self, st: &SimState, agent: &SimAgent, input: &str) -> String {
        let lowered = input.to_lowercase();
        let subject = input
            .split_whitespace()
            .last()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|w| !w.is_empty())
            .unwrap_or(input);

        for collaborator in &agent.collaborators {
            let Some((domain, group)) = self.collaborator_target(st, &collaborator.alias_arn) else {
                continue;
            };
            if !domain_keywords(domain).iter().any(|k| lowered.contains(k)) {
                continue;
            }
            let Some(schema) = group.functions.first() else {
                continue;
            };
            let params = schema
                .parameters
                .iter()
                .filter(|p| p.required)
                .map(|p| Parameter::new(&p.name, subject))
                .collect();
            let request = ActionRequest::new(&group.name, &schema.name, params);
            let payload = serde_json::to_vec(&request).unwrap_or_default();
            let out = dispatch_payload(&self.handlers, domain, &payload);
            let body = serde_json::from_slice::<ActionResponse>(&out)
                .map(|r| r.body().to_string())
                .unwrap_or_default();
            return format!("{} answered with {}: {}", collaborator.name, schema.name, body);
        }

        if !agent.knowledge_bases.is_empty() {
            let ids: Vec<&str> = agent.knowledge_bases.iter().map(|s| s.as_str()).collect();
            return format!(
                "No collaborator matched; searched knowledge base {} for \"{}\".",
                ids.join(", "),
                input
            );
        }
        "I can help with weather, stock market and news questions.".to_string()
    }
}

fn domain_keywords(domain: Domain) -> &'static [&'static str] {
    match domain {
        Domain::Weather => &["weather", "forecast", "temperature", "rain", "alert"],
        Domain::Stock => &["stock", "price", "market", "share", "ticker"],
        Domain::News => &["news", "headline", "article"],
    }
}

// ==================== Identity ====================

#[async_trait]
impl IdentityApi for MemoryControlPlane {
    async fn caller_identity(&self) -> Result<CallerIdentity, ApiError> {
        self.call("get_caller_identity")?;
        Ok(CallerIdentity {
            account_id: self.account_id.clone(),
            arn: format!("arn:aws:iam::{}:user/local-operator", self.account_id),
        })
    }
}

// ==================== IAM ====================

#[async_trait]
impl IamApi for MemoryControlPlane {
    async fn get_role(&self, name: &str) -> Result<RoleInfo, ApiError> {
        self.call("get_role")?;
        let mut st = self.lock();
        let role = st
            .roles
            .get_mut(name)
            .ok_or_else(|| not_found("get_role", format!("role {}", name)))?;
        if role.hidden_reads > 0 {
            role.hidden_reads -= 1;
            return Err(not_found("get_role", format!("role {}", name)));
        }
        Ok(RoleInfo {
            name: role.name.clone(),
            arn: role.arn.clone(),
        })
    }

    async fn create_role(
        &self,
        name: &str,
        trust_policy: &str,
        _description: &str,
    ) -> Result<RoleInfo, ApiError> {
        self.call("create_role")?;
        let mut st = self.lock();
        if st.roles.contains_key(name) {
            return Err(ApiError::already_exists(
                "create_role",
                format!("role {} already exists", name),
            ));
        }
        let arn = self.role_arn(name);
        st.roles.insert(
            name.to_string(),
            SimRole {
                name: name.to_string(),
                arn: arn.clone(),
                trust_policy: trust_policy.to_string(),
                attached: BTreeSet::new(),
                inline: BTreeMap::new(),
                hidden_reads: self.role_visibility_lag,
            },
        );
        Ok(RoleInfo {
            name: name.to_string(),
            arn,
        })
    }

    async fn update_assume_role_policy(
        &self,
        name: &str,
        trust_policy: &str,
    ) -> Result<(), ApiError> {
        self.call("update_assume_role_policy")?;
        let mut st = self.lock();
        let role = st
            .roles
            .get_mut(name)
            .ok_or_else(|| not_found("update_assume_role_policy", format!("role {}", name)))?;
        role.trust_policy = trust_policy.to_string();
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> Result<(), ApiError> {
        self.call("delete_role")?;
        let mut st = self.lock();
        let role = st
            .roles
            .get(name)
            .ok_or_else(|| not_found("delete_role", format!("role {}", name)))?;
        if !role.attached.is_empty() || !role.inline.is_empty() {
            return Err(ApiError::conflict(
                "delete_role",
                format!("role {} must have no policies before deletion", name),
            ));
        }
        st.roles.remove(name);
        Ok(())
    }

    async fn get_policy(&self, arn: &str) -> Result<ManagedPolicyInfo, ApiError> {
        self.call("get_policy")?;
        let st = self.lock();
        let policy = st
            .policies
            .get(arn)
            .ok_or_else(|| not_found("get_policy", format!("policy {}", arn)))?;
        let default_version_id = policy
            .versions
            .iter()
            .find(|v| v.is_default)
            .map(|v| v.version_id.clone())
            .unwrap_or_default();
        Ok(ManagedPolicyInfo {
            name: policy.name.clone(),
            arn: policy.arn.clone(),
            default_version_id,
            attachment_count: st.attachment_count(arn),
        })
    }

    async fn get_policy_version(&self, arn: &str, version_id: &str) -> Result<String, ApiError> {
        self.call("get_policy_version")?;
        let st = self.lock();
        st.policies
            .get(arn)
            .and_then(|p| p.versions.iter().find(|v| v.version_id == version_id))
            .map(|v| v.document.clone())
            .ok_or_else(|| not_found("get_policy_version", format!("{} {}", arn, version_id)))
    }

    async fn create_policy(
        &self,
        name: &str,
        document: &str,
        _description: &str,
    ) -> Result<ManagedPolicyInfo, ApiError> {
        self.call("create_policy")?;
        let arn = self.policy_arn(name);
        let mut st = self.lock();
        if st.policies.contains_key(&arn) {
            return Err(ApiError::already_exists(
                "create_policy",
                format!("policy {} already exists", name),
            ));
        }
        st.policies.insert(
            arn.clone(),
            SimPolicy {
                name: name.to_string(),
                arn: arn.clone(),
                versions: vec![SimPolicyVersion {
                    version_id: "v1".to_string(),
                    document: document.to_string(),
                    is_default: true,
                }],
                next_version: 2,
            },
        );
        Ok(ManagedPolicyInfo {
            name: name.to_string(),
            arn,
            default_version_id: "v1".to_string(),
            attachment_count: 0,
        })
    }

    async fn create_policy_version(
        &self,
        arn: &str,
        document: &str,
        set_as_default: bool,
    ) -> Result<PolicyVersionInfo, ApiError> {
        self.call("create_policy_version")?;
        let mut st = self.lock();
        let policy = st
            .policies
            .get_mut(arn)
            .ok_or_else(|| not_found("create_policy_version", format!("policy {}", arn)))?;
        if policy.versions.len() >= MAX_POLICY_VERSIONS {
            return Err(ApiError::validation(
                "create_policy_version",
                format!("policy {} already has {} versions", arn, MAX_POLICY_VERSIONS),
            ));
        }
        let version_id = format!("v{}", policy.next_version);
        policy.next_version += 1;
        if set_as_default {
            for v in &mut policy.versions {
                v.is_default = false;
            }
        }
        policy.versions.push(SimPolicyVersion {
            version_id: version_id.clone(),
            document: document.to_string(),
            is_default: set_as_default,
        });
        Ok(PolicyVersionInfo {
            version_id,
            is_default: set_as_default,
        })
    }

    async fn list_policy_versions(&self, arn: &str) -> Result<Vec<PolicyVersionInfo>, ApiError> {
        self.call("list_policy_versions")?;
        let st = self.lock();
        let policy = st
            .policies
            .get(arn)
            .ok_or_else(|| not_found("list_policy_versions", format!("policy {}", arn)))?;
        Ok(policy
            .versions
            .iter()
            .map(|v| PolicyVersionInfo {
                version_id: v.version_id.clone(),
                is_default: v.is_default,
            })
            .collect())
    }

    async fn delete_policy_version(&self, arn: &str, version_id: &str) -> Result<(), ApiError> {
        self.call("delete_policy_version")?;
        let mut st = self.lock();
        let policy = st
            .policies
            .get_mut(arn)
            .ok_or_else(|| not_found("delete_policy_version", format!("policy {}", arn)))?;
        let index = policy
            .versions
            .iter()
            .position(|v| v.version_id == version_id)
            .ok_or_else(|| not_found("delete_policy_version", version_id))?;
        if policy.versions[index].is_default {
            return Err(ApiError::validation(
                "delete_policy_version",
                "cannot delete the default version",
            ));
        }
        policy.versions.remove(index);
        Ok(())
    }

    async fn delete_policy(&self, arn: &str) -> Result<(), ApiError> {
        self.call("delete_policy")?;
        let mut st = self.lock();
        let policy = st
            .policies
            .get(arn)
            .ok_or_else(|| not_found("delete_policy", format!("policy {}", arn)))?;
        if policy.versions.len() > 1 {
            return Err(ApiError::conflict(
                "delete_policy",
                format!("policy {} has non-default versions", arn),
            ));
        }
        if st.attachment_count(arn) > 0 {
            return Err(ApiError::conflict(
                "delete_policy",
                format!("policy {} is still attached", arn),
            ));
        }
        st.policies.remove(arn);
        Ok(())
    }

    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> Result<(), ApiError> {
        self.call("attach_role_policy")?;
        let mut st = self.lock();
        if !is_aws_managed(policy_arn) && !st.policies.contains_key(policy_arn) {
            return Err(not_found("attach_role_policy", format!("policy {}", policy_arn)));
        }
        let role = st
            .roles
            .get_mut(role)
            .ok_or_else(|| not_found("attach_role_policy", format!("role {}", role)))?;
        role.attached.insert(policy_arn.to_string());
        Ok(())
    }

    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> Result<(), ApiError> {
        self.call("detach_role_policy")?;
        let mut st = self.lock();
        let r = st
            .roles
            .get_mut(role)
            .ok_or_else(|| not_found("detach_role_policy", format!("role {}", role)))?;
        if !r.attached.remove(policy_arn) {
            return Err(not_found(
                "detach_role_policy",
                format!("attachment of {} to {}", policy_arn, role),
            ));
        }
        Ok(())
    }

    async fn list_attached_role_policies(&self, role: &str) -> Result<Vec<String>, ApiError> {
        self.call("list_attached_role_policies")?;
        let st = self.lock();
        st.roles
            .get(role)
            .map(|r| r.attached.iter().cloned().collect())
            .ok_or_else(|| not_found("list_attached_role_policies", format!("role {}", role)))
    }

    async fn list_role_policies(&self, role: &str) -> Result<Vec<String>, ApiError> {
        self.call("list_role_policies")?;
        let st = self.lock();
        st.roles
            .get(role)
            .map(|r| r.inline.keys().cloned().collect())
            .ok_or_else(|| not_found("list_role_policies", format!("role {}", role)))
    }

    async fn delete_role_policy(&self, role: &str, name: &str) -> Result<(), ApiError> {
        self.call("delete_role_policy")?;
        let mut st = self.lock();
        let r = st
            .roles
            .get_mut(role)
            .ok_or_else(|| not_found("delete_role_policy", format!("role {}", role)))?;
        r.inline
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("delete_role_policy", format!("inline policy {}", name)))
    }
}

// ==================== Storage ====================

#[async_trait]
impl StorageApi for MemoryControlPlane {
    async fn head_bucket(&self, bucket: &str) -> Result<(), ApiError> {
        self.call("head_bucket")?;
        if self.lock().buckets.contains_key(bucket) {
            Ok(())
        } else {
            Err(not_found("head_bucket", format!("bucket {}", bucket)))
        }
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), ApiError> {
        self.call("create_bucket")?;
        let mut st = self.lock();
        if st.buckets.contains_key(bucket) {
            return Err(ApiError::already_exists(
                "create_bucket",
                format!("bucket {} already owned by you", bucket),
            ));
        }
        st.buckets.insert(
            bucket.to_string(),
            SimBucket {
                region: region.to_string(),
                versioning: false,
                objects: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn put_bucket_versioning(&self, bucket: &str, enabled: bool) -> Result<(), ApiError> {
        self.call("put_bucket_versioning")?;
        let mut st = self.lock();
        let b = st
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| not_found("put_bucket_versioning", format!("bucket {}", bucket)))?;
        b.versioning = enabled;
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), ApiError> {
        self.call("put_object")?;
        let mut st = self.lock();
        let b = st
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| not_found("put_object", format!("bucket {}", bucket)))?;
        let version = SimObjectVersion {
            version_id: if b.versioning {
                short_id()
            } else {
                "null".to_string()
            },
            delete_marker: false,
            size: body.len(),
        };
        let versions = b.objects.entry(key.to_string()).or_default();
        if !b.versioning {
            versions.clear();
        }
        versions.push(version);
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<String>, ApiError> {
        self.call("list_objects")?;
        let st = self.lock();
        let b = st
            .buckets
            .get(bucket)
            .ok_or_else(|| not_found("list_objects", format!("bucket {}", bucket)))?;
        Ok(b.objects
            .iter()
            .filter(|(key, versions)| {
                prefix.map_or(true, |p| key.starts_with(p))
                    && versions.last().map_or(false, |v| !v.delete_marker)
            })
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn list_object_versions(&self, bucket: &str) -> Result<Vec<ObjectVersion>, ApiError> {
        self.call("list_object_versions")?;
        let st = self.lock();
        let b = st
            .buckets
            .get(bucket)
            .ok_or_else(|| not_found("list_object_versions", format!("bucket {}", bucket)))?;
        Ok(b.objects
            .iter()
            .flat_map(|(key, versions)| {
                versions.iter().map(move |v| ObjectVersion {
                    key: key.clone(),
                    version_id: Some(v.version_id.clone()),
                    is_delete_marker: v.delete_marker,
                })
            })
            .collect())
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        objects: &[ObjectVersion],
    ) -> Result<usize, ApiError> {
        self.call("delete_objects")?;
        let mut st = self.lock();
        let b = st
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| not_found("delete_objects", format!("bucket {}", bucket)))?;
        let mut removed = 0;
        for object in objects {
            match &object.version_id {
                Some(version_id) => {
                    if let Some(versions) = b.objects.get_mut(&object.key) {
                        let before = versions.len();
                        versions.retain(|v| &v.version_id != version_id);
                        removed += before - versions.len();
                    }
                }
                None if b.versioning => {
                    b.objects
                        .entry(object.key.clone())
                        .or_default()
                        .push(SimObjectVersion {
                            version_id: short_id(),
                            delete_marker: true,
                            size: 0,
                        });
                    removed += 1;
                }
                None => {
                    if b.objects.remove(&object.key).is_some() {
                        removed += 1;
                    }
                }
            }
        }
        b.objects.retain(|_, versions| !versions.is_empty());
        Ok(removed)
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), ApiError> {
        self.call("delete_bucket")?;
        let mut st = self.lock();
        let b = st
            .buckets
            .get(bucket)
            .ok_or_else(|| not_found("delete_bucket", format!("bucket {}", bucket)))?;
        if !b.objects.is_empty() {
            return Err(ApiError::conflict(
                "delete_bucket",
                format!("bucket {} is not empty", bucket),
            ));
        }
        st.buckets.remove(bucket);
        Ok(())
    }
}

// ==================== Functions ====================

#[async_trait]
impl FunctionApi for MemoryControlPlane {
    async fn get_function(&self, name: &str) -> Result<FunctionInfo, ApiError> {
        self.call("get_function")?;
        let mut st = self.lock();
        st.functions
            .get_mut(name)
            .map(|f| f.observe())
            .ok_or_else(|| not_found("get_function", format!("function {}", name)))
    }

    async fn create_function(
        &self,
        spec: &FunctionSpec,
        package: Vec<u8>,
    ) -> Result<FunctionInfo, ApiError> {
        self.call("create_function")?;
        let mut st = self.lock();
        if st.functions.contains_key(&spec.name) {
            return Err(ApiError::already_exists(
                "create_function",
                format!("function {} already exists", spec.name),
            ));
        }
        let assumable = st
            .roles
            .values()
            .any(|r| r.arn == spec.role_arn && r.hidden_reads == 0);
        if !assumable {
            return Err(ApiError::validation(
                "create_function",
                format!("role {} cannot be assumed by the function service", spec.role_arn),
            ));
        }
        let info = FunctionInfo {
            name: spec.name.clone(),
            arn: self.function_arn(&spec.name),
            state: "Pending".to_string(),
            last_update_status: "Successful".to_string(),
            code_sha256: code_sha256(&package),
            role_arn: spec.role_arn.clone(),
            runtime: spec.runtime.clone(),
            handler: spec.handler.clone(),
            timeout_secs: spec.timeout_secs,
            memory_mb: spec.memory_mb,
            environment: spec.environment.clone(),
        };
        let mut state = Lifecycle::default();
        state.begin("Pending", &["Active"]);
        st.functions.insert(
            spec.name.clone(),
            SimFunction {
                info: info.clone(),
                state,
                update: Lifecycle::settled("Successful"),
                permissions: BTreeMap::new(),
            },
        );
        Ok(info)
    }

    async fn update_function_code(
        &self,
        name: &str,
        package: Vec<u8>,
    ) -> Result<FunctionInfo, ApiError> {
        self.call("update_function_code")?;
        let mut st = self.lock();
        let f = st
            .functions
            .get_mut(name)
            .ok_or_else(|| not_found("update_function_code", format!("function {}", name)))?;
        if f.update.peek() == "InProgress" {
            return Err(ApiError::conflict(
                "update_function_code",
                format!("an update is in progress for function {}", name),
            ));
        }
        f.info.code_sha256 = code_sha256(&package);
        f.reactivate();
        f.update.begin("InProgress", &["Successful"]);
        Ok(f.peek())
    }

    async fn update_function_configuration(
        &self,
        spec: &FunctionSpec,
    ) -> Result<FunctionInfo, ApiError> {
        self.call("update_function_configuration")?;
        let mut st = self.lock();
        let f = st.functions.get_mut(&spec.name).ok_or_else(|| {
            not_found("update_function_configuration", format!("function {}", spec.name))
        })?;
        if f.update.peek() == "InProgress" {
            return Err(ApiError::conflict(
                "update_function_configuration",
                format!("an update is in progress for function {}", spec.name),
            ));
        }
        f.info.role_arn = spec.role_arn.clone();
        f.info.runtime = spec.runtime.clone();
        f.info.handler = spec.handler.clone();
        f.info.timeout_secs = spec.timeout_secs;
        f.info.memory_mb = spec.memory_mb;
        f.info.environment = spec.environment.clone();
        f.reactivate();
        f.update.begin("InProgress", &["Successful"]);
        Ok(f.peek())
    }

    async fn list_functions(&self) -> Result<Vec<FunctionInfo>, ApiError> {
        self.call("list_functions")?;
        Ok(self.lock().functions.values().map(|f| f.peek()).collect())
    }

    async fn delete_function(&self, name: &str) -> Result<(), ApiError> {
        self.call("delete_function")?;
        self.lock()
            .functions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("delete_function", format!("function {}", name)))
    }

    async fn add_permission(
        &self,
        name: &str,
        permission: &InvokePermission,
    ) -> Result<(), ApiError> {
        self.call("add_permission")?;
        let mut st = self.lock();
        let f = st
            .functions
            .get_mut(name)
            .ok_or_else(|| not_found("add_permission", format!("function {}", name)))?;
        if f.permissions.contains_key(&permission.statement_id) {
            return Err(ApiError::conflict(
                "add_permission",
                format!("statement {} already exists", permission.statement_id),
            ));
        }
        f.permissions
            .insert(permission.statement_id.clone(), permission.clone());
        Ok(())
    }

    async fn remove_permission(&self, name: &str, statement_id: &str) -> Result<(), ApiError> {
        self.call("remove_permission")?;
        let mut st = self.lock();
        let f = st
            .functions
            .get_mut(name)
            .ok_or_else(|| not_found("remove_permission", format!("function {}", name)))?;
        f.permissions
            .remove(statement_id)
            .map(|_| ())
            .ok_or_else(|| not_found("remove_permission", format!("statement {}", statement_id)))
    }

    async fn invoke(&self, name: &str, payload: Vec<u8>) -> Result<Vec<u8>, ApiError> {
        self.call("invoke")?;
        let mut st = self.lock();
        let f = st
            .functions
            .get_mut(name)
            .ok_or_else(|| not_found("invoke", format!("function {}", name)))?;
        f.reactivate();
        if f.state.peek() != "Active" {
            return Err(ApiError::conflict(
                "invoke",
                format!("function {} is {}", name, f.state.peek()),
            ));
        }
        let domain = f
            .info
            .environment
            .get(DOMAIN_ENV)
            .ok_or_else(|| ApiError::service("invoke", format!("{} is not set", DOMAIN_ENV)))?
            .parse::<Domain>()
            .map_err(|e| ApiError::service("invoke", e))?;
        Ok(dispatch_payload(&self.handlers, domain, &payload))
    }
}

// ==================== Vector search ====================

#[async_trait]
impl SearchApi for MemoryControlPlane {
    async fn list_policies(
        &self,
        kind: CollectionPolicyKind,
        resource: &str,
    ) -> Result<Vec<SearchPolicy>, ApiError> {
        self.call("list_search_policies")?;
        let st = self.lock();
        Ok(st
            .search_policies
            .values()
            .filter(|p| p.kind == kind)
            .filter(|p| {
                serde_json::from_str::<Value>(&p.document)
                    .map(|doc| covers(&doc, resource))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn get_policy(
        &self,
        kind: CollectionPolicyKind,
        name: &str,
    ) -> Result<SearchPolicy, ApiError> {
        self.call("get_search_policy")?;
        self.lock()
            .search_policies
            .get(&policy_key(kind, name))
            .cloned()
            .ok_or_else(|| not_found("get_search_policy", format!("{} policy {}", kind, name)))
    }

    async fn create_policy(
        &self,
        kind: CollectionPolicyKind,
        name: &str,
        document: &str,
        _description: &str,
    ) -> Result<SearchPolicy, ApiError> {
        self.call("create_search_policy")?;
        if serde_json::from_str::<Value>(document).is_err() {
            return Err(ApiError::validation(
                "create_search_policy",
                "policy document is not valid JSON",
            ));
        }
        let mut st = self.lock();
        let key = policy_key(kind, name);
        if st.search_policies.contains_key(&key) {
            return Err(ApiError::conflict(
                "create_search_policy",
                format!("{} policy {} already exists", kind, name),
            ));
        }
        let policy = SearchPolicy {
            name: name.to_string(),
            kind,
            version: short_id(),
            document: document.to_string(),
        };
        st.search_policies.insert(key, policy.clone());
        Ok(policy)
    }

    async fn update_policy(
        &self,
        kind: CollectionPolicyKind,
        name: &str,
        version: &str,
        document: &str,
    ) -> Result<SearchPolicy, ApiError> {
        self.call("update_search_policy")?;
        let mut st = self.lock();
        let policy = st
            .search_policies
            .get_mut(&policy_key(kind, name))
            .ok_or_else(|| not_found("update_search_policy", format!("{} policy {}", kind, name)))?;
        if policy.version != version {
            return Err(ApiError::conflict(
                "update_search_policy",
                format!("{} policy {} changed since it was read", kind, name),
            ));
        }
        policy.document = document.to_string();
        policy.version = short_id();
        Ok(policy.clone())
    }

    async fn delete_policy(&self, kind: CollectionPolicyKind, name: &str) -> Result<(), ApiError> {
        self.call("delete_search_policy")?;
        self.lock()
            .search_policies
            .remove(&policy_key(kind, name))
            .map(|_| ())
            .ok_or_else(|| not_found("delete_search_policy", format!("{} policy {}", kind, name)))
    }

    async fn get_collection(&self, name: &str) -> Result<CollectionInfo, ApiError> {
        self.call("get_collection")?;
        let mut st = self.lock();
        let c = st
            .collections
            .get_mut(name)
            .ok_or_else(|| not_found("get_collection", format!("collection {}", name)))?;
        let mut info = c.info.clone();
        info.status = c.lifecycle.observe();
        Ok(info)
    }

    async fn create_collection(
        &self,
        name: &str,
        _description: &str,
    ) -> Result<CollectionInfo, ApiError> {
        self.call("create_collection")?;
        let mut st = self.lock();
        if st.collections.contains_key(name) {
            return Err(ApiError::conflict(
                "create_collection",
                format!("collection {} already exists", name),
            ));
        }
        let resource = format!("collection/{}", name);
        let encrypted = st.search_policies.values().any(|p| {
            p.kind == CollectionPolicyKind::Encryption
                && serde_json::from_str::<Value>(&p.document)
                    .map(|doc| covers(&doc, &resource))
                    .unwrap_or(false)
        });
        if !encrypted {
            return Err(ApiError::validation(
                "create_collection",
                format!("no matching encryption policy found for collection {}", name),
            ));
        }
        let id = Uuid::new_v4().simple().to_string()[..20].to_string();
        let info = CollectionInfo {
            arn: format!("arn:aws:aoss:{}:{}:collection/{}", self.region, self.account_id, id),
            endpoint: Some(format!("https://{}.{}.aoss.amazonaws.com", id, self.region)),
            id,
            name: name.to_string(),
            status: "CREATING".to_string(),
        };
        let mut lifecycle = Lifecycle::default();
        lifecycle.begin("CREATING", &["ACTIVE"]);
        st.collections.insert(
            name.to_string(),
            SimCollection {
                info: info.clone(),
                lifecycle,
            },
        );
        Ok(info)
    }

    async fn delete_collection(&self, id: &str) -> Result<(), ApiError> {
        self.call("delete_collection")?;
        let mut st = self.lock();
        let c = st
            .collections
            .values_mut()
            .find(|c| c.info.id == id)
            .ok_or_else(|| not_found("delete_collection", format!("collection {}", id)))?;
        if c.lifecycle.is_deleting() {
            return Err(ApiError::conflict(
                "delete_collection",
                format!("collection {} is already being deleted", id),
            ));
        }
        c.lifecycle.begin_delete();
        let endpoint = c.info.endpoint.clone().unwrap_or_default();
        let prefix = format!("{}|", endpoint);
        st.indexes.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    async fn index_exists(&self, endpoint: &str, index: &str) -> Result<bool, ApiError> {
        self.call("index_exists")?;
        let st = self.lock();
        if st.collection_by_endpoint(endpoint).is_none() {
            return Err(not_found("index_exists", format!("endpoint {}", endpoint)));
        }
        Ok(st.indexes.contains_key(&format!("{}|{}", endpoint, index)))
    }

    async fn create_index(
        &self,
        endpoint: &str,
        index: &str,
        body: &Value,
    ) -> Result<(), ApiError> {
        self.call("create_index")?;
        let mut st = self.lock();
        if st.collection_by_endpoint(endpoint).is_none() {
            return Err(not_found("create_index", format!("endpoint {}", endpoint)));
        }
        if !body["mappings"]["properties"].is_object() {
            return Err(ApiError::validation("create_index", "index body has no mappings"));
        }
        let key = format!("{}|{}", endpoint, index);
        if st.indexes.contains_key(&key) {
            return Err(ApiError::already_exists(
                "create_index",
                format!("index {} already exists", index),
            ));
        }
        st.indexes.insert(key, body.clone());
        Ok(())
    }
}

// ==================== Knowledge bases ====================

#[async_trait]
impl KnowledgeBaseApi for MemoryControlPlane {
    async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBaseSummary>, ApiError> {
        self.call("list_knowledge_bases")?;
        Ok(self
            .lock()
            .knowledge_bases
            .values()
            .map(|kb| KnowledgeBaseSummary {
                id: kb.info.id.clone(),
                name: kb.info.name.clone(),
                status: kb.lifecycle.peek().to_string(),
            })
            .collect())
    }

    async fn get_knowledge_base(&self, id: &str) -> Result<KnowledgeBaseInfo, ApiError> {
        self.call("get_knowledge_base")?;
        let mut st = self.lock();
        let kb = st
            .knowledge_bases
            .get_mut(id)
            .ok_or_else(|| not_found("get_knowledge_base", format!("knowledge base {}", id)))?;
        let mut info = kb.info.clone();
        info.status = kb.lifecycle.observe();
        Ok(info)
    }

    async fn create_knowledge_base(
        &self,
        spec: &KnowledgeBaseSpec,
    ) -> Result<KnowledgeBaseInfo, ApiError> {
        self.call("create_knowledge_base")?;
        let mut st = self.lock();
        if st.knowledge_bases.values().any(|kb| kb.info.name == spec.name) {
            return Err(ApiError::conflict(
                "create_knowledge_base",
                format!("knowledge base {} already exists", spec.name),
            ));
        }
        let endpoint = st
            .collections
            .values()
            .find(|c| c.info.arn == spec.collection_arn)
            .and_then(|c| c.info.endpoint.clone())
            .ok_or_else(|| {
                ApiError::validation(
                    "create_knowledge_base",
                    format!("collection {} does not exist", spec.collection_arn),
                )
            })?;
        if !st
            .indexes
            .contains_key(&format!("{}|{}", endpoint, spec.vector_index))
        {
            return Err(ApiError::validation(
                "create_knowledge_base",
                format!("vector index {} does not exist", spec.vector_index),
            ));
        }
        let id = short_id();
        let info = KnowledgeBaseInfo {
            arn: self.bedrock_arn(&format!("knowledge-base/{}", id)),
            id: id.clone(),
            name: spec.name.clone(),
            status: "CREATING".to_string(),
            failure_reasons: Vec::new(),
        };
        let mut lifecycle = Lifecycle::default();
        lifecycle.begin("CREATING", &["ACTIVE"]);
        st.knowledge_bases.insert(
            id,
            SimKnowledgeBase {
                info: info.clone(),
                lifecycle,
                spec: spec.clone(),
                data_sources: BTreeMap::new(),
            },
        );
        Ok(info)
    }

    async fn delete_knowledge_base(&self, id: &str) -> Result<(), ApiError> {
        self.call("delete_knowledge_base")?;
        let mut st = self.lock();
        let kb = st
            .knowledge_bases
            .get_mut(id)
            .ok_or_else(|| not_found("delete_knowledge_base", format!("knowledge base {}", id)))?;
        if kb.lifecycle.is_deleting() {
            return Err(ApiError::conflict(
                "delete_knowledge_base",
                format!("knowledge base {} is already being deleted", id),
            ));
        }
        kb.lifecycle.begin_delete();
        for agent in st.agents.values_mut() {
            agent.knowledge_bases.remove(id);
        }
        Ok(())
    }

    async fn list_data_sources(&self, kb_id: &str) -> Result<Vec<DataSourceSummary>, ApiError> {
        self.call("list_data_sources")?;
        let st = self.lock();
        let kb = st
            .knowledge_bases
            .get(kb_id)
            .ok_or_else(|| not_found("list_data_sources", format!("knowledge base {}", kb_id)))?;
        Ok(kb.data_sources.values().map(|d| d.summary.clone()).collect())
    }

    async fn create_data_source(
        &self,
        kb_id: &str,
        spec: &DataSourceSpec,
    ) -> Result<DataSourceSummary, ApiError> {
        self.call("create_data_source")?;
        let mut st = self.lock();
        let kb = st
            .knowledge_bases
            .get_mut(kb_id)
            .ok_or_else(|| not_found("create_data_source", format!("knowledge base {}", kb_id)))?;
        if kb.data_sources.values().any(|d| d.summary.name == spec.name) {
            return Err(ApiError::conflict(
                "create_data_source",
                format!("data source {} already exists", spec.name),
            ));
        }
        let summary = DataSourceSummary {
            id: short_id(),
            name: spec.name.clone(),
            status: "AVAILABLE".to_string(),
        };
        kb.data_sources.insert(
            summary.id.clone(),
            SimDataSource {
                summary: summary.clone(),
                spec: spec.clone(),
                jobs: BTreeMap::new(),
            },
        );
        Ok(summary)
    }

    async fn delete_data_source(&self, kb_id: &str, ds_id: &str) -> Result<(), ApiError> {
        self.call("delete_data_source")?;
        let mut st = self.lock();
        st.knowledge_bases
            .get_mut(kb_id)
            .and_then(|kb| kb.data_sources.remove(ds_id))
            .map(|_| ())
            .ok_or_else(|| not_found("delete_data_source", format!("data source {}", ds_id)))
    }

    async fn start_ingestion_job(
        &self,
        kb_id: &str,
        ds_id: &str,
    ) -> Result<IngestionJob, ApiError> {
        self.call("start_ingestion_job")?;
        let mut st = self.lock();
        let ds = st
            .knowledge_bases
            .get_mut(kb_id)
            .and_then(|kb| kb.data_sources.get_mut(ds_id))
            .ok_or_else(|| not_found("start_ingestion_job", format!("data source {}", ds_id)))?;
        let job_id = short_id();
        let mut lifecycle = Lifecycle::default();
        lifecycle.begin("STARTING", &["IN_PROGRESS", "COMPLETE"]);
        ds.jobs.insert(job_id.clone(), lifecycle);
        Ok(IngestionJob {
            job_id,
            status: "STARTING".to_string(),
            failure_reasons: Vec::new(),
        })
    }

    async fn get_ingestion_job(
        &self,
        kb_id: &str,
        ds_id: &str,
        job_id: &str,
    ) -> Result<IngestionJob, ApiError> {
        self.call("get_ingestion_job")?;
        let mut st = self.lock();
        let job = st
            .knowledge_bases
            .get_mut(kb_id)
            .and_then(|kb| kb.data_sources.get_mut(ds_id))
            .and_then(|ds| ds.jobs.get_mut(job_id))
            .ok_or_else(|| not_found("get_ingestion_job", format!("ingestion job {}", job_id)))?;
        Ok(IngestionJob {
            job_id: job_id.to_string(),
            status: job.observe(),
            failure_reasons: Vec::new(),
        })
    }
}

// ==================== Agents ====================

impl MemoryControlPlane {
    fn agent_mut<'a>(
        st: &'a mut SimState,
        op: &str,
        id: &str,
    ) -> Result<&'a mut SimAgent, ApiError> {
        st.agents
            .get_mut(id)
            .ok_or_else(|| not_found(op, format!("agent {}", id)))
    }

    fn new_alias_version(agent: &mut SimAgent, op: &str) -> Result<String, ApiError> {
        if agent.lifecycle.peek() != "PREPARED" {
            return Err(ApiError::validation(
                op,
                format!(
                    "agent {} is {} and must be prepared first",
                    agent.info.id,
                    agent.lifecycle.peek()
                ),
            ));
        }
        agent.version += 1;
        Ok(agent.version.to_string())
    }
}

#[async_trait]
impl AgentApi for MemoryControlPlane {
    async fn list_agents(&self) -> Result<Vec<AgentSummary>, ApiError> {
        self.call("list_agents")?;
        Ok(self
            .lock()
            .agents
            .values()
            .map(|a| AgentSummary {
                id: a.info.id.clone(),
                name: a.info.name.clone(),
                status: a.lifecycle.peek().to_string(),
            })
            .collect())
    }

    async fn get_agent(&self, id: &str) -> Result<AgentInfo, ApiError> {
        self.call("get_agent")?;
        let mut st = self.lock();
        let agent = Self::agent_mut(&mut st, "get_agent", id)?;
        let mut info = agent.info.clone();
        info.status = agent.lifecycle.observe();
        Ok(info)
    }

    async fn create_agent(&self, spec: &AgentSpec) -> Result<AgentInfo, ApiError> {
        self.call("create_agent")?;
        let mut st = self.lock();
        if st.agents.values().any(|a| a.info.name == spec.name) {
            return Err(ApiError::conflict(
                "create_agent",
                format!("agent {} already exists", spec.name),
            ));
        }
        let id = short_id();
        let info = AgentInfo {
            arn: self.bedrock_arn(&format!("agent/{}", id)),
            id: id.clone(),
            name: spec.name.clone(),
            status: "CREATING".to_string(),
            role_arn: spec.role_arn.clone(),
            foundation_model: spec.foundation_model.clone(),
            instruction: spec.instruction.clone(),
            collaboration: spec.collaboration,
            memory_days: spec.memory_days,
            failure_reasons: Vec::new(),
        };
        let mut lifecycle = Lifecycle::default();
        lifecycle.begin("CREATING", &["NOT_PREPARED"]);

        let mut aliases = BTreeMap::new();
        aliases.insert(
            TEST_ALIAS_ID.to_string(),
            SimAlias {
                info: AliasInfo {
                    id: TEST_ALIAS_ID.to_string(),
                    name: "AgentTestAlias".to_string(),
                    arn: self.bedrock_arn(&format!("agent-alias/{}/{}", id, TEST_ALIAS_ID)),
                    status: "PREPARED".to_string(),
                    routing_version: Some("DRAFT".to_string()),
                },
                lifecycle: Lifecycle::settled("PREPARED"),
            },
        );

        st.agents.insert(
            id,
            SimAgent {
                info: info.clone(),
                lifecycle,
                action_groups: Vec::new(),
                aliases,
                knowledge_bases: BTreeSet::new(),
                collaborators: Vec::new(),
                version: 0,
            },
        );
        Ok(info)
    }

    async fn update_agent(&self, id: &str, spec: &AgentSpec) -> Result<AgentInfo, ApiError> {
        self.call("update_agent")?;
        let mut st = self.lock();
        let agent = Self::agent_mut(&mut st, "update_agent", id)?;
        if spec.collaboration == Collaboration::Disabled && !agent.collaborators.is_empty() {
            return Err(ApiError::validation(
                "update_agent",
                "cannot disable collaboration while collaborators are associated",
            ));
        }
        agent.info.name = spec.name.clone();
        agent.info.role_arn = spec.role_arn.clone();
        agent.info.foundation_model = spec.foundation_model.clone();
        agent.info.instruction = spec.instruction.clone();
        agent.info.collaboration = spec.collaboration;
        agent.info.memory_days = spec.memory_days;
        agent.lifecycle.begin("UPDATING", &["NOT_PREPARED"]);
        let mut info = agent.info.clone();
        info.status = "UPDATING".to_string();
        Ok(info)
    }

    async fn delete_agent(&self, id: &str) -> Result<(), ApiError> {
        self.call("delete_agent")?;
        let mut st = self.lock();
        let agent = Self::agent_mut(&mut st, "delete_agent", id)?;
        if agent.aliases.keys().any(|a| a != TEST_ALIAS_ID) {
            return Err(ApiError::conflict(
                "delete_agent",
                format!("agent {} still has aliases", id),
            ));
        }
        if agent.lifecycle.is_deleting() {
            return Err(ApiError::conflict(
                "delete_agent",
                format!("agent {} is already being deleted", id),
            ));
        }
        agent.lifecycle.begin_delete();
        Ok(())
    }

    async fn prepare_agent(&self, id: &str) -> Result<String, ApiError> {
        self.call("prepare_agent")?;
        let mut st = self.lock();
        let agent = Self::agent_mut(&mut st, "prepare_agent", id)?;
        match agent.lifecycle.peek() {
            "CREATING" | "UPDATING" | "PREPARING" => Err(ApiError::conflict(
                "prepare_agent",
                format!("agent {} is {}", id, agent.lifecycle.peek()),
            )),
            _ => {
                agent.lifecycle.begin("PREPARING", &["PREPARED"]);
                Ok("PREPARING".to_string())
            }
        }
    }

    async fn list_action_groups(&self, agent_id: &str) -> Result<Vec<ActionGroupInfo>, ApiError> {
        self.call("list_action_groups")?;
        let mut st = self.lock();
        Ok(Self::agent_mut(&mut st, "list_action_groups", agent_id)?
            .action_groups
            .clone())
    }

    async fn create_action_group(
        &self,
        agent_id: &str,
        spec: &ActionGroupSpec,
    ) -> Result<ActionGroupInfo, ApiError> {
        self.call("create_action_group")?;
        let mut st = self.lock();
        if !st
            .functions
            .values()
            .any(|f| f.info.arn == spec.function_arn)
        {
            return Err(ApiError::validation(
                "create_action_group",
                format!("function {} does not exist", spec.function_arn),
            ));
        }
        let agent = Self::agent_mut(&mut st, "create_action_group", agent_id)?;
        if agent.action_groups.iter().any(|g| g.name == spec.name) {
            return Err(ApiError::conflict(
                "create_action_group",
                format!("action group {} already exists", spec.name),
            ));
        }
        let group = ActionGroupInfo {
            id: short_id(),
            name: spec.name.clone(),
            function_arn: spec.function_arn.clone(),
            functions: spec.functions.clone(),
        };
        agent.action_groups.push(group.clone());
        agent.draft_changed();
        Ok(group)
    }

    async fn update_action_group(
        &self,
        agent_id: &str,
        action_group_id: &str,
        spec: &ActionGroupSpec,
    ) -> Result<ActionGroupInfo, ApiError> {
        self.call("update_action_group")?;
        let mut st = self.lock();
        let agent = Self::agent_mut(&mut st, "update_action_group", agent_id)?;
        let group = agent
            .action_groups
            .iter_mut()
            .find(|g| g.id == action_group_id)
            .ok_or_else(|| {
                not_found("update_action_group", format!("action group {}", action_group_id))
            })?;
        group.name = spec.name.clone();
        group.function_arn = spec.function_arn.clone();
        group.functions = spec.functions.clone();
        let updated = group.clone();
        agent.draft_changed();
        Ok(updated)
    }

    async fn list_aliases(&self, agent_id: &str) -> Result<Vec<AliasInfo>, ApiError> {
        self.call("list_aliases")?;
        let mut st = self.lock();
        let agent = Self::agent_mut(&mut st, "list_aliases", agent_id)?;
        Ok(agent
            .aliases
            .values()
            .map(|a| {
                let mut info = a.info.clone();
                info.status = a.lifecycle.peek().to_string();
                info
            })
            .collect())
    }

    async fn get_alias(&self, agent_id: &str, alias_id: &str) -> Result<AliasInfo, ApiError> {
        self.call("get_alias")?;
        let mut st = self.lock();
        let agent = Self::agent_mut(&mut st, "get_alias", agent_id)?;
        let alias = agent
            .aliases
            .get_mut(alias_id)
            .ok_or_else(|| not_found("get_alias", format!("alias {}", alias_id)))?;
        let mut info = alias.info.clone();
        info.status = alias.lifecycle.observe();
        Ok(info)
    }

    async fn create_alias(
        &self,
        agent_id: &str,
        name: &str,
        _description: &str,
    ) -> Result<AliasInfo, ApiError> {
        self.call("create_alias")?;
        let arn_prefix = self.bedrock_arn(&format!("agent-alias/{}", agent_id));
        let mut st = self.lock();
        let agent = Self::agent_mut(&mut st, "create_alias", agent_id)?;
        if agent.aliases.values().any(|a| a.info.name == name) {
            return Err(ApiError::conflict(
                "create_alias",
                format!("alias {} already exists", name),
            ));
        }
        let version = Self::new_alias_version(agent, "create_alias")?;
        let id = short_id();
        let info = AliasInfo {
            arn: format!("{}/{}", arn_prefix, id),
            id: id.clone(),
            name: name.to_string(),
            status: "CREATING".to_string(),
            routing_version: Some(version),
        };
        let mut lifecycle = Lifecycle::default();
        lifecycle.begin("CREATING", &["PREPARED"]);
        agent.aliases.insert(
            id,
            SimAlias {
                info: info.clone(),
                lifecycle,
            },
        );
        Ok(info)
    }

    async fn update_alias(
        &self,
        agent_id: &str,
        alias_id: &str,
        name: &str,
    ) -> Result<AliasInfo, ApiError> {
        self.call("update_alias")?;
        let mut st = self.lock();
        let agent = Self::agent_mut(&mut st, "update_alias", agent_id)?;
        if !agent.aliases.contains_key(alias_id) {
            return Err(not_found("update_alias", format!("alias {}", alias_id)));
        }
        let version = Self::new_alias_version(agent, "update_alias")?;
        let alias = agent
            .aliases
            .get_mut(alias_id)
            .ok_or_else(|| not_found("update_alias", format!("alias {}", alias_id)))?;
        alias.info.name = name.to_string();
        alias.info.routing_version = Some(version);
        alias.lifecycle.begin("UPDATING", &["PREPARED"]);
        let mut info = alias.info.clone();
        info.status = "UPDATING".to_string();
        Ok(info)
    }

    async fn delete_alias(&self, agent_id: &str, alias_id: &str) -> Result<(), ApiError> {
        self.call("delete_alias")?;
        if alias_id == TEST_ALIAS_ID {
            return Err(ApiError::validation("delete_alias", "the test alias cannot be deleted"));
        }
        let mut st = self.lock();
        let agent = Self::agent_mut(&mut st, "delete_alias", agent_id)?;
        agent
            .aliases
            .remove(alias_id)
            .map(|_| ())
            .ok_or_else(|| not_found("delete_alias", format!("alias {}", alias_id)))
    }

    async fn list_agent_knowledge_bases(&self, agent_id: &str) -> Result<Vec<String>, ApiError> {
        self.call("list_agent_knowledge_bases")?;
        let mut st = self.lock();
        Ok(Self::agent_mut(&mut st, "list_agent_knowledge_bases", agent_id)?
            .knowledge_bases
            .iter()
            .cloned()
            .collect())
    }

    async fn associate_knowledge_base(
        &self,
        agent_id: &str,
        kb_id: &str,
        _description: &str,
    ) -> Result<(), ApiError> {
        self.call("associate_knowledge_base")?;
        let mut st = self.lock();
        if !st.knowledge_bases.contains_key(kb_id) {
            return Err(ApiError::validation(
                "associate_knowledge_base",
                format!("knowledge base {} does not exist", kb_id),
            ));
        }
        let agent = Self::agent_mut(&mut st, "associate_knowledge_base", agent_id)?;
        if !agent.knowledge_bases.insert(kb_id.to_string()) {
            return Err(ApiError::conflict(
                "associate_knowledge_base",
                format!("knowledge base {} is already associated", kb_id),
            ));
        }
        agent.draft_changed();
        Ok(())
    }

    async fn list_collaborators(&self, agent_id: &str) -> Result<Vec<CollaboratorInfo>, ApiError> {
        self.call("list_collaborators")?;
        let mut st = self.lock();
        Ok(Self::agent_mut(&mut st, "list_collaborators", agent_id)?
            .collaborators
            .clone())
    }

    async fn associate_collaborator(
        &self,
        agent_id: &str,
        name: &str,
        alias_arn: &str,
        _instruction: &str,
    ) -> Result<CollaboratorInfo, ApiError> {
        self.call("associate_collaborator")?;
        let mut st = self.lock();
        let alias_exists = st.agents.values().any(|a| {
            a.aliases
                .values()
                .any(|al| al.info.arn == alias_arn && al.info.id != TEST_ALIAS_ID)
        });
        if !alias_exists {
            return Err(ApiError::validation(
                "associate_collaborator",
                format!("alias {} does not exist", alias_arn),
            ));
        }
        let agent = Self::agent_mut(&mut st, "associate_collaborator", agent_id)?;
        if agent.info.collaboration == Collaboration::Disabled {
            return Err(ApiError::validation(
                "associate_collaborator",
                format!("agent {} is not a supervisor", agent_id),
            ));
        }
        if agent.collaborators.iter().any(|c| c.name == name) {
            return Err(ApiError::conflict(
                "associate_collaborator",
                format!("collaborator {} is already associated", name),
            ));
        }
        let collaborator = CollaboratorInfo {
            id: short_id(),
            name: name.to_string(),
            alias_arn: alias_arn.to_string(),
        };
        agent.collaborators.push(collaborator.clone());
        agent.draft_changed();
        Ok(collaborator)
    }

    async fn disassociate_collaborator(
        &self,
        agent_id: &str,
        collaborator_id: &str,
    ) -> Result<(), ApiError> {
        self.call("disassociate_collaborator")?;
        let mut st = self.lock();
        let agent = Self::agent_mut(&mut st, "disassociate_collaborator", agent_id)?;
        let before = agent.collaborators.len();
        agent.collaborators.retain(|c| c.id != collaborator_id);
        if agent.collaborators.len() == before {
            return Err(not_found(
                "disassociate_collaborator",
                format!("collaborator {}", collaborator_id),
            ));
        }
        agent.draft_changed();
        Ok(())
    }

    async fn invoke_agent(
        &self,
        agent_id: &str,
        alias_id: &str,
        session_id: &str,
        input: &str,
    ) -> Result<String, ApiError> {
        self.call("invoke_agent")?;
        let st = self.lock();
        let agent = st
            .agents
            .get(agent_id)
            .ok_or_else(|| not_found("invoke_agent", format!("agent {}", agent_id)))?;
        let alias = agent
            .aliases
            .get(alias_id)
            .ok_or_else(|| not_found("invoke_agent", format!("alias {}", alias_id)))?;
        if alias.lifecycle.peek() != "PREPARED" {
            return Err(ApiError::new(
                ApiErrorKind::Conflict,
                "invoke_agent",
                format!("alias {} is {}", alias_id, alias.lifecycle.peek()),
            ));
        }
        debug!(agent_id, alias_id, session_id, "Simulated agent invocation");
        Ok(self.route(&st, agent, input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane() -> MemoryControlPlane {
        MemoryControlPlane::new("us-east-1", "123456789012")
    }

    #[test]
    fn lifecycle_reports_then_advances() {
        let mut l = Lifecycle::default();
        l.begin("STARTING", &["IN_PROGRESS", "COMPLETE"]);
        assert_eq!(l.observe(), "STARTING");
        assert_eq!(l.observe(), "IN_PROGRESS");
        assert_eq!(l.observe(), "COMPLETE");
        assert_eq!(l.observe(), "COMPLETE");
    }

    #[tokio::test]
    async fn counts_calls_and_injects_faults() {
        let p = plane();
        p.create_bucket("b", "us-east-1").await.unwrap();
        assert_eq!(p.calls("create_bucket"), 1);

        p.fail_on("head_bucket", ApiError::throttled("head_bucket", "slow down"));
        assert!(p.head_bucket("b").await.unwrap_err().is_transient());
        p.clear_faults();
        p.head_bucket("b").await.unwrap();
        assert_eq!(p.calls("head_bucket"), 2);

        p.reset_calls();
        assert_eq!(p.calls("head_bucket"), 0);
    }

    #[tokio::test]
    async fn role_with_policies_cannot_be_deleted() {
        let p = plane();
        p.create_role("r", "{}", "").await.unwrap();
        let policy = IamApi::create_policy(&p, "pol", "{}", "").await.unwrap();
        p.attach_role_policy("r", &policy.arn).await.unwrap();

        assert!(p.delete_role("r").await.unwrap_err().is_conflict());
        assert!(IamApi::delete_policy(&p, &policy.arn)
            .await
            .unwrap_err()
            .is_conflict());

        p.detach_role_policy("r", &policy.arn).await.unwrap();
        p.delete_role("r").await.unwrap();
        IamApi::delete_policy(&p, &policy.arn).await.unwrap();
    }

    #[tokio::test]
    async fn role_visibility_lag_hides_new_roles() {
        let p = plane().with_role_visibility_lag(2);
        p.create_role("r", "{}", "").await.unwrap();
        assert!(p.get_role("r").await.unwrap_err().is_not_found());
        assert!(p.get_role("r").await.unwrap_err().is_not_found());
        assert_eq!(p.get_role("r").await.unwrap().name, "r");
    }

    #[tokio::test]
    async fn versioned_bucket_leaves_delete_markers() {
        let p = plane();
        p.create_bucket("b", "us-east-1").await.unwrap();
        p.put_bucket_versioning("b", true).await.unwrap();
        p.put_object("b", "k", b"1".to_vec()).await.unwrap();
        p.put_object("b", "k", b"2".to_vec()).await.unwrap();
        p.delete_objects(
            "b",
            &[ObjectVersion {
                key: "k".into(),
                version_id: None,
                is_delete_marker: false,
            }],
        )
        .await
        .unwrap();

        assert!(p.list_objects("b", None).await.unwrap().is_empty());
        let versions = p.list_object_versions("b").await.unwrap();
        assert_eq!(versions.len(), 3);
        assert_eq!(versions.iter().filter(|v| v.is_delete_marker).count(), 1);
        assert!(p.delete_bucket("b").await.unwrap_err().is_conflict());

        p.delete_objects("b", &versions).await.unwrap();
        p.delete_bucket("b").await.unwrap();
    }

    #[tokio::test]
    async fn collection_requires_encryption_policy() {
        let p = plane();
        let err = p.create_collection("kb-collection", "").await.unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Validation);

        let doc = crate::policy::encryption_policy("kb-collection")
            .unwrap()
            .to_json()
            .unwrap();
        SearchApi::create_policy(&p, CollectionPolicyKind::Encryption, "enc", &doc, "")
            .await
            .unwrap();
        let c = p.create_collection("kb-collection", "").await.unwrap();
        assert_eq!(c.status, "CREATING");
        assert_eq!(p.get_collection("kb-collection").await.unwrap().status, "CREATING");
        assert_eq!(p.get_collection("kb-collection").await.unwrap().status, "ACTIVE");
    }

    #[tokio::test]
    async fn deleted_collection_lingers_as_deleting() {
        let p = plane();
        let doc = crate::policy::encryption_policy("c").unwrap().to_json().unwrap();
        SearchApi::create_policy(&p, CollectionPolicyKind::Encryption, "enc", &doc, "")
            .await
            .unwrap();
        let c = p.create_collection("c", "").await.unwrap();

        p.delete_collection(&c.id).await.unwrap();
        assert!(p.delete_collection(&c.id).await.unwrap_err().is_conflict());
        assert_eq!(p.get_collection("c").await.unwrap().status, DELETING);
        assert!(p.get_collection("c").await.unwrap_err().is_not_found());
        assert!(p.live_collections().is_empty());
    }

    #[tokio::test]
    async fn inactive_function_is_restored_by_invoke() {
        let p = plane();
        p.create_role("fn", "{}", "").await.unwrap();
        let spec = FunctionSpec {
            name: "f".into(),
            description: String::new(),
            role_arn: "arn:aws:iam::123456789012:role/fn".into(),
            runtime: "provided.al2023".into(),
            handler: "bootstrap".into(),
            timeout_secs: 30,
            memory_mb: 128,
            environment: [(DOMAIN_ENV.to_string(), "weather".to_string())].into(),
        };
        p.create_function(&spec, b"code".to_vec()).await.unwrap();
        p.deactivate_function("f");
        assert_eq!(p.get_function("f").await.unwrap().state, "Inactive");

        assert!(p.invoke("f", b"{}".to_vec()).await.unwrap_err().is_conflict());
        assert_eq!(p.get_function("f").await.unwrap().state, "Pending");
        assert_eq!(p.get_function("f").await.unwrap().state, "Active");
    }

    #[tokio::test]
    async fn state_survives_save_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("sim.json");

        let p = MemoryControlPlane::open(&path, "us-east-1", "123456789012").unwrap();
        p.create_bucket("persisted", "us-east-1").await.unwrap();
        p.save().unwrap();

        let reopened = MemoryControlPlane::open(&path, "us-east-1", "123456789012").unwrap();
        assert_eq!(reopened.live_buckets(), vec!["persisted".to_string()]);
        assert_eq!(reopened.calls("create_bucket"), 0);
    }
}
