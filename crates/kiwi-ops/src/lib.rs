// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-ops
#![deny(unsafe_code)]

pub mod handlers;
pub mod help;
pub mod registry;
pub mod session;

pub use registry::{NullRegistry, RegistryClient, RegistryItem};
pub use session::Session;

use handlers::TypeHandler;
use kiwi_chain::ChainResolver;
use kiwi_core::{ItemType, Origin};
use kiwi_error::{KernelError, KernelResult};
use kiwi_exec::{SubprocessConfig, subprocess};
use kiwi_policy::{AuditDecision, Decision, IntersectionPolicy};
use kiwi_search::{SearchHit, SearchRouter, Strategy, VectorBackend};
use kiwi_signature::{CommentStyle, KeyStore, VerifyMode};
use kiwi_store::{ContentStore, PRELOAD_RUNTIMES, parse};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Which index `search` consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceFilter {
    /// Project + user + bundled layers.
    Local,
    /// The remote registry index.
    Registry,
    /// Both, merged and deduplicated.
    #[default]
    All,
}

/// Layer a loaded item may be copied into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    /// `<project>/.ai/`.
    Project,
    /// The user root.
    User,
}

impl From<Destination> for Origin {
    fn from(d: Destination) -> Self {
        match d {
            Destination::Project => Origin::Project,
            Destination::User => Origin::User,
        }
    }
}

fn default_limit() -> usize {
    20
}

/// Input to the `search` operation.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchRequest {
    /// Restrict to one item type; absent means all types.
    #[serde(default)]
    pub item_type: Option<ItemType>,
    /// Query text.
    pub query: String,
    /// Index selection.
    #[serde(default)]
    pub source: SourceFilter,
    /// Maximum results.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Engine selection; `auto` prefers hybrid when a vector backend is up.
    #[serde(default)]
    pub strategy: Strategy,
    /// Project whose `.ai/` layer participates.
    pub project_path: PathBuf,
}

/// Input to the `load` operation.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct LoadRequest {
    /// Item kind.
    pub item_type: ItemType,
    /// Item id.
    pub item_id: String,
    /// Layer to load from.
    pub source: Origin,
    /// Optional layer to copy the verified item into.
    #[serde(default)]
    pub destination: Option<Destination>,
    /// Project whose `.ai/` layer participates.
    pub project_path: PathBuf,
}

/// Input to the `execute` operation.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExecuteRequest {
    /// Item kind (including the virtual `system` type).
    pub item_type: ItemType,
    /// Action, e.g. `run`, `create`, `read`, `publish`.
    pub action: String,
    /// Item id.
    pub item_id: String,
    /// Runtime parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Project whose `.ai/` layer participates.
    pub project_path: PathBuf,
    /// Resolve and validate without executing.
    #[serde(default)]
    pub dry_run: bool,
}

/// Input to the `sign` operation.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SignRequest {
    /// Item kind.
    pub item_type: ItemType,
    /// Item id.
    pub item_id: String,
    /// Project whose `.ai/` layer participates.
    pub project_path: PathBuf,
    /// Sign with the namespace's private key as well as the content hash.
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Input to the `help` operation (the only one without `project_path`).
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct HelpRequest {
    /// `guidance` (default), `stuck`, `escalate`, or `checkpoint`.
    #[serde(default)]
    pub action: Option<String>,
    /// Documentation topic for `guidance`.
    #[serde(default)]
    pub topic: Option<String>,
    /// Why the agent is stuck / escalating.
    #[serde(default)]
    pub reason: Option<String>,
    /// How many attempts the agent has made.
    #[serde(default)]
    pub attempts: Option<u32>,
    /// Decision options for `escalate`.
    #[serde(default)]
    pub options: Option<Vec<String>>,
    /// Freeform context (may carry `project_path` for checkpoints).
    #[serde(default)]
    pub context: Option<Value>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// State shared by the operation layer and its type handlers.
pub struct Shared {
    /// Three-layer content store.
    pub store: Arc<ContentStore>,
    /// Memoizing chain resolver.
    pub resolver: ChainResolver,
    /// Search strategy router.
    pub search: SearchRouter,
    /// Remote registry seam.
    pub registry: Arc<dyn RegistryClient>,
    /// Connection-scoped session.
    pub session: Session,
    /// Child-permission policy.
    pub intersection: IntersectionPolicy,
}

/// Builder for [`Operations`].
pub struct OperationsBuilder {
    store: Arc<ContentStore>,
    registry: Arc<dyn RegistryClient>,
    vector: Option<Arc<dyn VectorBackend>>,
    intersection: IntersectionPolicy,
}

impl OperationsBuilder {
    /// Attach a remote registry client.
    #[must_use]
    pub fn registry(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = registry;
        self
    }

    /// Attach a vector backend.
    #[must_use]
    pub fn vector(mut self, backend: Arc<dyn VectorBackend>) -> Self {
        self.vector = Some(backend);
        self
    }

    /// Override the child-permission intersection policy.
    #[must_use]
    pub fn intersection(mut self, policy: IntersectionPolicy) -> Self {
        self.intersection = policy;
        self
    }

    /// Finish.
    pub fn build(self) -> Operations {
        let mut search = SearchRouter::new();
        if let Some(backend) = self.vector {
            search = search.with_vector(backend);
        }
        let session = Session::new(&self.store.user_root().join("logs").join("audit"));
        let shared = Arc::new(Shared {
            resolver: ChainResolver::new(self.store.clone()),
            search,
            registry: self.registry,
            session,
            intersection: self.intersection,
            store: self.store,
        });
        let handlers = handlers::default_handlers(shared.clone());
        Operations { shared, handlers }
    }
}

/// The five meta-operations, wired over one session.
pub struct Operations {
    shared: Arc<Shared>,
    handlers: HashMap<ItemType, Arc<dyn TypeHandler>>,
}

impl Operations {
    /// Start building over a content store.
    pub fn builder(store: Arc<ContentStore>) -> OperationsBuilder {
        OperationsBuilder {
            store,
            registry: Arc::new(NullRegistry),
            vector: None,
            intersection: IntersectionPolicy::default(),
        }
    }

    /// Default wiring: null registry, keyword-only search.
    pub fn new(store: Arc<ContentStore>) -> Self {
        Self::builder(store).build()
    }

    /// The connection session (loop/rate/audit state).
    pub fn session(&self) -> &Session {
        &self.shared.session
    }

    /// Shared kernel state, for inspection in tests and the server shell.
    pub fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Preload the common runtime chains in one batch lookup.
    pub fn preload_runtimes(&self, project: &Path) -> usize {
        let ids: Vec<String> = PRELOAD_RUNTIMES.iter().map(|s| s.to_string()).collect();
        self.shared.resolver.preload(project, &ids)
    }

    /// Gatekeeping common to every operation: the active context's
    /// `kiwi-mcp` rules plus the session rate limit.
    async fn check_action(&self, action: &str) -> KernelResult<()> {
        let decision = self.shared.session.active_context().check_kiwi_action(action);
        if let Decision::Deny { rule } = decision {
            self.shared
                .session
                .log(
                    &format!("mcp.{action}"),
                    AuditDecision::Denied { rule: rule.clone() },
                )
                .await;
            return Err(Decision::Deny { rule }.into_error());
        }
        if let Err(e) = self.shared.session.rate.check(&format!("mcp.{action}")) {
            self.shared
                .session
                .log(
                    &format!("mcp.{action}"),
                    AuditDecision::RateLimited {
                        pattern: format!("mcp.{action}"),
                    },
                )
                .await;
            return Err(e);
        }
        Ok(())
    }

    // -- search -------------------------------------------------------------

    /// `search(item_type, query, source, limit, strategy, project_path)`.
    pub async fn search(&self, req: SearchRequest) -> KernelResult<Value> {
        self.check_action("search").await?;

        let mut hits: Vec<SearchHit> = Vec::new();
        let mut search_type = kiwi_search::SearchKind::Keyword;
        let mut quality = kiwi_search::Quality::Good;

        if req.source != SourceFilter::Registry {
            let items = self.collect_items(&req.project_path, req.item_type);
            self.shared.search.reindex(&items).await;
            let (local, kind, q) = self
                .shared
                .search
                .search(&req.query, req.item_type, req.limit, req.strategy)
                .await;
            hits = local;
            search_type = kind;
            quality = q;
        }

        if req.source != SourceFilter::Local && self.shared.registry.is_configured() {
            match self
                .shared
                .registry
                .search(&req.query, req.item_type, req.limit)
                .await
            {
                Ok(remote) => {
                    for hit in remote {
                        if !hits
                            .iter()
                            .any(|h| h.id == hit.id && h.item_type == hit.item_type)
                        {
                            hits.push(hit);
                        }
                    }
                    hits.sort_by(|a, b| {
                        b.score
                            .partial_cmp(&a.score)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                    hits.truncate(req.limit);
                }
                Err(e) => {
                    warn!(target: "kiwi.ops", error = %e, "registry search failed; local results only");
                }
            }
        }

        self.shared.session.log("mcp.search", AuditDecision::Allowed).await;
        Ok(json!({
            "items": hits,
            "search_type": search_type,
            "quality": quality,
            "total": hits.len(),
        }))
    }

    fn collect_items(
        &self,
        project: &Path,
        item_type: Option<ItemType>,
    ) -> Vec<kiwi_core::Item> {
        let types = match item_type {
            Some(t) => vec![t],
            None => ItemType::storable().to_vec(),
        };
        types
            .into_iter()
            .flat_map(|t| self.shared.store.list(project, t, None))
            .collect()
    }

    // -- load ---------------------------------------------------------------

    /// `load(item_type, item_id, source, destination?, project_path)`.
    pub async fn load(&self, req: LoadRequest) -> KernelResult<Value> {
        self.check_action("load").await?;

        let response = match req.source {
            Origin::Registry => {
                let fetched = self
                    .shared
                    .registry
                    .fetch(req.item_type, &req.item_id)
                    .await?;
                // Registry content must verify, no exceptions.
                let signature = kiwi_signature::verify_required(
                    &fetched.source,
                    &req.item_id,
                    VerifyMode::Strict,
                )?;
                let manifest = parse_manifest(req.item_type, &req.item_id, &fetched.source)?;

                let copied_to = match req.destination {
                    Some(dest) => Some(self.copy_into(
                        dest,
                        &req,
                        &fetched.category,
                        &fetched.source,
                        &fetched.files,
                    )?),
                    None => None,
                };

                json!({
                    "manifest": manifest,
                    "files": fetched.files,
                    "signature": signature,
                    "origin": Origin::Registry,
                    "copied_to": copied_to,
                })
            }
            origin => {
                let item = self.shared.store.get_from(
                    origin,
                    &req.project_path,
                    req.item_type,
                    &req.item_id,
                    None,
                )?;
                let copied_to = match req.destination {
                    Some(dest) => Some(self.copy_into(
                        dest,
                        &req,
                        &item.category,
                        &item.source,
                        &item.files,
                    )?),
                    None => None,
                };
                json!({
                    "manifest": item.manifest,
                    "files": item.files,
                    "content": item.source,
                    "signature": item.signature,
                    "origin": item.origin,
                    "copied_to": copied_to,
                })
            }
        };

        self.shared.session.log("mcp.load", AuditDecision::Allowed).await;
        Ok(response)
    }

    fn copy_into(
        &self,
        dest: Destination,
        req: &LoadRequest,
        category: &str,
        source: &str,
        files: &BTreeMap<String, String>,
    ) -> KernelResult<String> {
        let path = self.shared.store.write_item(
            dest.into(),
            &req.project_path,
            req.item_type,
            category,
            &req.item_id,
            source,
            files,
        )?;
        self.shared.resolver.clear_cache();
        Ok(path.display().to_string())
    }

    // -- execute ------------------------------------------------------------

    /// `execute(item_type, action, item_id, parameters?, project_path, dry_run?)`.
    pub async fn execute(&self, req: ExecuteRequest) -> KernelResult<Value> {
        self.check_action("execute").await?;
        let handler = self
            .handlers
            .get(&req.item_type)
            .ok_or_else(|| {
                KernelError::invalid_item(format!(
                    "no handler registered for item type '{}'",
                    req.item_type
                ))
            })?
            .clone();
        handler.execute(&req).await
    }

    // -- sign ---------------------------------------------------------------

    /// `sign(item_type, item_id, project_path)`.
    pub async fn sign(&self, req: SignRequest) -> KernelResult<Value> {
        self.check_action("sign").await?;

        let (layer, path) = match self.shared.store.source_path(
            Origin::Project,
            &req.project_path,
            req.item_type,
            &req.item_id,
        ) {
            Ok(p) => (Origin::Project, p),
            Err(_) => (
                Origin::User,
                self.shared.store.source_path(
                    Origin::User,
                    &req.project_path,
                    req.item_type,
                    &req.item_id,
                )?,
            ),
        };

        let source = std::fs::read_to_string(&path).map_err(|e| {
            KernelError::not_found(format!("cannot read '{}': {e}", path.display()))
        })?;
        let style = CommentStyle::for_path(&path.display().to_string());

        let keystore;
        let keys = match &req.namespace {
            Some(ns) => {
                keystore = KeyStore::open(self.shared.store.user_root().join("keys"))
                    .map_err(|e| KernelError::execution_failed(format!("keystore: {e}")))?;
                Some((&keystore, ns.as_str()))
            }
            None => None,
        };

        let signed = kiwi_signature::sign_source(&source, style, keys)?;
        std::fs::write(&path, &signed).map_err(|e| {
            KernelError::execution_failed(format!("cannot write '{}': {e}", path.display()))
        })?;
        self.shared.resolver.clear_cache();

        let info = kiwi_signature::parse_marker(&signed).ok_or_else(|| {
            KernelError::signature_invalid("freshly emitted marker failed to parse")
        })?;

        self.shared.session.log("mcp.sign", AuditDecision::Allowed).await;
        debug!(target: "kiwi.ops", item = %req.item_id, layer = %layer, "item signed");
        Ok(json!({
            "status": "signed",
            "signature": {"hash": info.hash, "timestamp": info.timestamp},
            "path": path.display().to_string(),
        }))
    }

    // -- help ---------------------------------------------------------------

    /// `help(action, topic?, reason?, attempts?, options?, context?)`.
    pub async fn help(&self, req: HelpRequest) -> KernelResult<Value> {
        let action = req.action.as_deref().unwrap_or("guidance");
        match action {
            "guidance" => {
                let topic = req.topic.as_deref().unwrap_or("overview");
                Ok(json!({"topic": topic, "content": help::topic(topic)?}))
            }
            "stuck" => {
                let reason = req.reason.as_deref().unwrap_or("unspecified");
                let count = self.shared.session.record_stuck(reason);
                let attempts = req.attempts.unwrap_or(count);
                self.shared
                    .session
                    .log("help.stuck", AuditDecision::Signal { kind: "stuck".into() })
                    .await;

                let escalated = attempts >= help::STUCK_ESCALATION_THRESHOLD;
                let request_id = if escalated {
                    Some(help::enqueue_intervention(
                        &self.shared.store.user_root().join("queue"),
                        "stuck",
                        json!({
                            "reason": reason,
                            "attempts": attempts,
                            "session": self.shared.session.id,
                            "context": req.context,
                        }),
                    )?)
                } else {
                    None
                };
                Ok(json!({
                    "signal_acknowledged": true,
                    "attempts": attempts,
                    "escalated": escalated,
                    "request_id": request_id,
                }))
            }
            "escalate" => {
                self.shared
                    .session
                    .log("help.escalate", AuditDecision::Signal { kind: "escalate".into() })
                    .await;
                let request_id = help::enqueue_intervention(
                    &self.shared.store.user_root().join("queue"),
                    "escalate",
                    json!({
                        "reason": req.reason,
                        "options": req.options,
                        "session": self.shared.session.id,
                        "context": req.context,
                    }),
                )?;
                Ok(json!({"signal_acknowledged": true, "request_id": request_id}))
            }
            "checkpoint" => {
                self.shared
                    .session
                    .log("help.checkpoint", AuditDecision::Signal { kind: "checkpoint".into() })
                    .await;
                let id = format!("ckpt-{}", Uuid::new_v4());

                let git_sha = match req
                    .context
                    .as_ref()
                    .and_then(|c| c.get("project_path"))
                    .and_then(Value::as_str)
                {
                    Some(project) => git_head(project).await,
                    None => None,
                };

                let dir = self.shared.store.user_root().join("checkpoints");
                std::fs::create_dir_all(&dir).map_err(|e| {
                    KernelError::execution_failed(format!("cannot create checkpoint dir: {e}"))
                })?;
                let snapshot = json!({
                    "id": id,
                    "session": self.shared.session.id,
                    "created_at": chrono::Utc::now().to_rfc3339(),
                    "git_sha": git_sha,
                    "context": req.context,
                });
                std::fs::write(
                    dir.join(format!("{id}.json")),
                    serde_json::to_string_pretty(&snapshot).unwrap_or_default(),
                )
                .map_err(|e| {
                    KernelError::execution_failed(format!("cannot write checkpoint: {e}"))
                })?;

                Ok(json!({"checkpoint_id": id, "git_sha": git_sha}))
            }
            other => Err(KernelError::invalid_item(format!(
                "unknown help action '{other}'"
            ))
            .with_suggestion("actions: guidance, stuck, escalate, checkpoint")),
        }
    }
}

/// Current git HEAD of `project`, when it is a repository.
async fn git_head(project: &str) -> Option<String> {
    let config = SubprocessConfig {
        command: "git".to_string(),
        args: vec!["rev-parse".to_string(), "HEAD".to_string()],
        env: BTreeMap::new(),
        cwd: Some(project.to_string()),
        timeout: 10.0,
        capture_output: true,
        input_data: None,
    };
    match subprocess::execute(&config, &BTreeMap::new()).await {
        Ok(out) if out.success => Some(out.stdout.trim().to_string()),
        _ => None,
    }
}

fn parse_manifest(
    item_type: ItemType,
    id: &str,
    source: &str,
) -> KernelResult<kiwi_core::Manifest> {
    Ok(match item_type {
        ItemType::Tool => kiwi_core::Manifest::Tool(parse::parse_tool(id, source)?),
        ItemType::Directive => kiwi_core::Manifest::Directive(parse::parse_directive(id, source)?),
        ItemType::Knowledge => {
            kiwi_core::Manifest::Knowledge(parse::parse_knowledge(id, source)?.0)
        }
        ItemType::System => {
            return Err(KernelError::invalid_item("system items are virtual"));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        project: PathBuf,
        ops: Operations,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().expect("tempdir");
        let project = tmp.path().join("proj");
        std::fs::create_dir_all(&project).expect("mk project");
        let store = Arc::new(ContentStore::new(tmp.path().join("user-ai")));
        Fixture {
            ops: Operations::new(store),
            project,
            _tmp: tmp,
        }
    }

    fn write_tool(project: &Path, category: &str, id: &str, yaml: &str) {
        let dir = project.join(".ai").join("tools").join(category);
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join(format!("{id}.yaml")), yaml).expect("write tool");
    }

    #[tokio::test]
    async fn search_finds_bundled_knowledge() {
        let f = fixture();
        let out = f
            .ops
            .search(SearchRequest {
                item_type: Some(ItemType::Knowledge),
                query: "executor chains primitives".into(),
                source: SourceFilter::Local,
                limit: 10,
                strategy: Strategy::Auto,
                project_path: f.project.clone(),
            })
            .await
            .expect("search");
        assert_eq!(out["search_type"], "keyword");
        assert_eq!(out["quality"], "good");
        assert!(out["total"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn load_bundled_tool_inline() {
        let f = fixture();
        let out = f
            .ops
            .load(LoadRequest {
                item_type: ItemType::Tool,
                item_id: "subprocess".into(),
                source: Origin::Bundled,
                destination: None,
                project_path: f.project.clone(),
            })
            .await
            .expect("load");
        assert_eq!(out["origin"], "bundled");
        assert_eq!(out["manifest"]["tool_type"], "primitive");
        assert!(out["signature"]["hash"].is_string());
    }

    #[tokio::test]
    async fn load_refuses_copying_protected_items() {
        let f = fixture();
        let err = f
            .ops
            .load(LoadRequest {
                item_type: ItemType::Tool,
                item_id: "subprocess".into(),
                source: Origin::Bundled,
                destination: Some(Destination::Project),
                project_path: f.project.clone(),
            })
            .await
            .expect_err("protected copy refused");
        assert_eq!(err.kind, kiwi_error::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn execute_system_items() {
        let f = fixture();
        for id in ["paths", "runtime", "rag", "mcp"] {
            let out = f
                .ops
                .execute(ExecuteRequest {
                    item_type: ItemType::System,
                    action: "read".into(),
                    item_id: id.into(),
                    parameters: BTreeMap::new(),
                    project_path: f.project.clone(),
                    dry_run: false,
                })
                .await
                .unwrap_or_else(|e| panic!("system {id}: {e}"));
            assert_eq!(out["status"], "ok");
        }
    }

    #[tokio::test]
    async fn execute_tool_dry_run_returns_chain() {
        let f = fixture();
        write_tool(
            &f.project,
            "demo",
            "greet",
            "title: Greet\ndescription: d\ntool_type: script\nexecutor: python_runtime\n",
        );
        let out = f
            .ops
            .execute(ExecuteRequest {
                item_type: ItemType::Tool,
                action: "run".into(),
                item_id: "greet".into(),
                parameters: BTreeMap::new(),
                project_path: f.project.clone(),
                dry_run: true,
            })
            .await
            .expect("dry run");
        assert_eq!(out["status"], "dry_run");
        assert_eq!(
            out["executor_chain"],
            json!(["greet", "python_runtime", "subprocess"])
        );
        assert!(out["merged_config"]["command"].is_string());
    }

    #[tokio::test]
    async fn sign_then_reload_verifies() {
        let f = fixture();
        write_tool(
            &f.project,
            "demo",
            "greet",
            "title: Greet\ndescription: d\ntool_type: script\nexecutor: python_runtime\n",
        );
        let out = f
            .ops
            .sign(SignRequest {
                item_type: ItemType::Tool,
                item_id: "greet".into(),
                project_path: f.project.clone(),
                namespace: None,
            })
            .await
            .expect("sign");
        assert_eq!(out["status"], "signed");
        let hash = out["signature"]["hash"].as_str().expect("hash");
        assert_eq!(hash.len(), 64);

        let loaded = f
            .ops
            .load(LoadRequest {
                item_type: ItemType::Tool,
                item_id: "greet".into(),
                source: Origin::Project,
                destination: None,
                project_path: f.project.clone(),
            })
            .await
            .expect("reload");
        assert_eq!(loaded["signature"]["hash"], hash);
    }

    #[tokio::test]
    async fn sign_twice_is_idempotent_on_hash() {
        let f = fixture();
        write_tool(
            &f.project,
            "demo",
            "greet",
            "title: Greet\ndescription: d\ntool_type: script\nexecutor: python_runtime\n",
        );
        let req = SignRequest {
            item_type: ItemType::Tool,
            item_id: "greet".into(),
            project_path: f.project.clone(),
            namespace: None,
        };
        let first = f.ops.sign(req.clone()).await.expect("first sign");
        let second = f.ops.sign(req).await.expect("second sign");
        assert_eq!(first["signature"]["hash"], second["signature"]["hash"]);
    }

    #[tokio::test]
    async fn help_guidance_and_unknown_topic() {
        let f = fixture();
        let out = f.ops.help(HelpRequest::default()).await.expect("overview");
        assert!(out["content"].as_str().unwrap().contains("kiwi-mcp"));

        let err = f
            .ops
            .help(HelpRequest {
                topic: Some("nonsense".into()),
                ..HelpRequest::default()
            })
            .await
            .expect_err("unknown topic");
        assert_eq!(err.kind, kiwi_error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn help_stuck_escalates_past_threshold() {
        let f = fixture();
        let out = f
            .ops
            .help(HelpRequest {
                action: Some("stuck".into()),
                reason: Some("tests keep failing".into()),
                attempts: Some(1),
                ..HelpRequest::default()
            })
            .await
            .expect("stuck 1");
        assert_eq!(out["escalated"], false);

        let out = f
            .ops
            .help(HelpRequest {
                action: Some("stuck".into()),
                reason: Some("tests keep failing".into()),
                attempts: Some(4),
                ..HelpRequest::default()
            })
            .await
            .expect("stuck 4");
        assert_eq!(out["escalated"], true);
        assert!(out["request_id"].is_string());
    }

    #[tokio::test]
    async fn help_checkpoint_returns_id() {
        let f = fixture();
        let out = f
            .ops
            .help(HelpRequest {
                action: Some("checkpoint".into()),
                context: Some(json!({"step": 3})),
                ..HelpRequest::default()
            })
            .await
            .expect("checkpoint");
        let id = out["checkpoint_id"].as_str().expect("id");
        assert!(id.starts_with("ckpt-"));
    }

    #[tokio::test]
    async fn preload_populates_chain_cache() {
        let f = fixture();
        assert_eq!(f.ops.shared().resolver.cached(), 0);
        let loaded = f.ops.preload_runtimes(&f.project);
        assert_eq!(loaded, kiwi_store::PRELOAD_RUNTIMES.len());
    }
}
