//! Vigil declaration store: the poll loop that keeps declared references
//! resolved against live cluster state.
//!
//! Per declaration the life cycle is: declared, metadata known (discovery),
//! resolved (templates evaluated, exactly once), then observed/absent
//! toggling on every tick from the latest read. Every per-declaration
//! failure inside a tick is contained: the object is marked absent and the
//! next tick retries, so one broken declaration never halts the others.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use serde_json::Value as Json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vigil_cluster::{call_with_retry, CallError, KindCache, ObjectClient};
use vigil_core::{Declaration, VigilError, VigilResult};
use vigil_expr::EvalContext;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub poll_interval: Duration,
    pub default_namespace: String,
    /// Ambient run parameters exposed to expressions by name.
    pub params: BTreeMap<String, Json>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            default_namespace: "default".to_string(),
            params: BTreeMap::new(),
        }
    }
}

struct Inner {
    order: Vec<String>,
    decls: HashMap<String, Declaration>,
    /// Last failure per alias, to log each distinct failure once.
    last_failure: HashMap<String, FailureRecord>,
}

struct FailureRecord {
    message: String,
    /// Ticks the same failure has repeated since it was logged.
    repeats: u64,
}

pub struct DeclStore {
    objects: Arc<dyn ObjectClient>,
    cache: Arc<KindCache>,
    cfg: StoreConfig,
    inner: Mutex<Inner>,
    tick_tx: watch::Sender<u64>,
    stop_tx: watch::Sender<bool>,
    poll_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DeclStore {
    pub fn new(objects: Arc<dyn ObjectClient>, cache: Arc<KindCache>, cfg: StoreConfig) -> Self {
        let (tick_tx, _) = watch::channel(0u64);
        let (stop_tx, _) = watch::channel(false);
        Self {
            objects,
            cache,
            cfg,
            inner: Mutex::new(Inner {
                order: Vec::new(),
                decls: HashMap::new(),
                last_failure: HashMap::new(),
            }),
            tick_tx,
            stop_tx,
            poll_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Record a new declaration. Synchronous; nothing is fetched until the
    /// poll loop picks it up.
    pub fn add(
        &self,
        alias: &str,
        kind: &str,
        api_version: &str,
        name_template: &str,
        namespace_template: Option<&str>,
    ) -> VigilResult<()> {
        for (field, value) in [
            ("alias", alias),
            ("kind", kind),
            ("apiVersion", api_version),
            ("name", name_template),
        ] {
            if value.trim().is_empty() {
                return Err(VigilError::Validation(format!("{field} must not be empty")));
            }
        }
        let mut inner = self.inner.lock().expect("store lock");
        if inner.decls.contains_key(alias) {
            return Err(VigilError::AlreadyDeclared(alias.to_string()));
        }
        inner.order.push(alias.to_string());
        inner.decls.insert(
            alias.to_string(),
            Declaration::new(alias, kind, api_version, name_template, namespace_template),
        );
        debug!(alias, kind, api_version, "declaration added");
        Ok(())
    }

    pub fn get(&self, alias: &str) -> Option<Declaration> {
        self.inner.lock().expect("store lock").decls.get(alias).cloned()
    }

    pub fn observed(&self, alias: &str) -> Option<Json> {
        self.inner
            .lock()
            .expect("store lock")
            .decls
            .get(alias)
            .and_then(|d| d.obj.clone())
    }

    /// Evaluation context over the latest completed state.
    pub fn snapshot(&self) -> EvalContext {
        let inner = self.inner.lock().expect("store lock");
        let mut ctx = EvalContext::new(&self.cfg.default_namespace);
        for (k, v) in &self.cfg.params {
            ctx = ctx.with_param(k, v.clone());
        }
        for alias in &inner.order {
            if let Some(d) = inner.decls.get(alias) {
                ctx.insert_decl(alias, d.info(), d.obj.clone());
            }
        }
        ctx
    }

    /// Start the poll loop if not already running, then block until a full
    /// poll cycle issued after this call has completed. Declarations added
    /// before this call are therefore part of the snapshot on return.
    pub async fn start_polling(self: &Arc<Self>) {
        let mut tick_rx = self.tick_tx.subscribe();
        let observed = *tick_rx.borrow();
        let freshly_started = {
            let mut task = self.poll_task.lock().await;
            if task.is_none() {
                self.stop_tx.send_replace(false);
                let store = Arc::clone(self);
                *task = Some(tokio::spawn(async move { store.poll_loop().await }));
                true
            } else {
                false
            }
        };
        // A tick may already be mid-flight when the loop was running.
        let target = observed + if freshly_started { 1 } else { 2 };
        while *tick_rx.borrow() < target {
            if tick_rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Signal the loop to stop and wait for it to exit. No declaration is
    /// mutated after this returns.
    pub async fn stop_polling(&self) {
        self.stop_tx.send_replace(true);
        let task = self.poll_task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn poll_loop(&self) {
        info!(interval_ms = self.cfg.poll_interval.as_millis() as u64, "poll loop started");
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow() {
                break;
            }
            self.tick().await;
            self.tick_tx.send_modify(|t| *t += 1);
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                _ = stop_rx.changed() => {}
            }
        }
        info!("poll loop stopped");
    }

    /// One pass over all declarations in insertion order.
    async fn tick(&self) {
        counter!("vigil_poll_ticks_total", 1u64);
        let aliases: Vec<String> = self.inner.lock().expect("store lock").order.clone();
        for alias in aliases {
            self.tick_one(&alias).await;
        }
    }

    async fn tick_one(&self, alias: &str) {
        let Some(decl) = self.get(alias) else { return };

        // Discovery, until resource metadata is known.
        let meta = match decl.meta {
            Some(meta) => meta,
            None => {
                match self.cache.resolve_kind(&decl.api_version, &decl.kind).await {
                    Ok(Some(meta)) => {
                        self.with_decl(alias, |d| d.meta = Some(meta.clone()));
                        meta
                    }
                    Ok(None) => {
                        self.fail(alias, format!(
                            "kind {} not served by {}",
                            decl.kind, decl.api_version
                        ));
                        return;
                    }
                    Err(e) => {
                        self.fail(alias, format!("discovery for {}: {e}", decl.api_version));
                        return;
                    }
                }
            }
        };

        // Template resolution, exactly once. The context is built fresh so
        // it sees objects already fetched earlier in this same tick.
        if !decl.evaluated {
            let ctx = self.snapshot();
            let name = match vigil_expr::render_template(&decl.name_template, &ctx) {
                Ok(name) => name,
                Err(e) => {
                    self.fail(alias, format!("name template: {e}"));
                    return;
                }
            };
            let namespace = if meta.namespaced {
                match &decl.namespace_template {
                    Some(tpl) => match vigil_expr::render_template(tpl, &ctx) {
                        Ok(ns) => Some(ns),
                        Err(e) => {
                            self.fail(alias, format!("namespace template: {e}"));
                            return;
                        }
                    },
                    None => Some(self.cfg.default_namespace.clone()),
                }
            } else {
                None
            };
            info!(alias, name, namespace = namespace.as_deref().unwrap_or("-"), "declaration resolved");
            self.with_decl(alias, |d| {
                d.name = Some(name.clone());
                d.namespace = namespace.clone();
                d.evaluated = true;
            });
        }

        // Fetch the latest object state.
        let Some(decl) = self.get(alias) else { return };
        let (Some(name), api_version) = (decl.name.clone(), decl.api_version.clone()) else {
            return;
        };
        let namespace = decl.namespace.clone();
        let result = call_with_retry(alias, || {
            self.objects.read(&api_version, &meta, namespace.as_deref(), &name)
        })
        .await;
        match result {
            Ok(obj) => {
                self.clear_failure(alias);
                self.with_decl(alias, |d| {
                    if d.obj.is_none() {
                        counter!("vigil_transitions_total", 1u64);
                        info!(alias = %d.alias, name = %name, "object observed");
                    }
                    d.obj = Some(obj.clone());
                });
            }
            Err(e) if e.is_not_found() => {
                self.clear_failure(alias);
                self.mark_absent(alias, None);
            }
            Err(e) => {
                self.fail(alias, format!("read {name}: {e}"));
            }
        }
    }

    fn with_decl(&self, alias: &str, f: impl FnOnce(&mut Declaration)) {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(d) = inner.decls.get_mut(alias) {
            f(d);
        }
    }

    fn mark_absent(&self, alias: &str, reason: Option<&str>) {
        self.with_decl(alias, |d| {
            if d.obj.is_some() {
                counter!("vigil_transitions_total", 1u64);
                info!(alias = %d.alias, reason = reason.unwrap_or("not found"), "object absent");
            }
            d.obj = None;
        });
    }

    /// Contain a per-declaration failure: mark absent and log the failure
    /// text once per distinct message so repeated ticks stay quiet.
    fn fail(&self, alias: &str, message: String) {
        self.mark_absent(alias, Some(&message));
        let mut inner = self.inner.lock().expect("store lock");
        match inner.last_failure.get_mut(alias) {
            Some(rec) if rec.message == message => rec.repeats += 1,
            _ => {
                warn!(alias, %message, "declaration not resolvable this tick");
                inner
                    .last_failure
                    .insert(alias.to_string(), FailureRecord { message, repeats: 1 });
            }
        }
    }

    #[cfg(test)]
    fn failure_record(&self, alias: &str) -> Option<(String, u64)> {
        self.inner
            .lock()
            .expect("store lock")
            .last_failure
            .get(alias)
            .map(|r| (r.message.clone(), r.repeats))
    }

    fn clear_failure(&self, alias: &str) {
        self.inner.lock().expect("store lock").last_failure.remove(alias);
    }

    fn map_call_error(e: CallError) -> VigilError {
        match e.code() {
            Some(404) => VigilError::NotFound(e.to_string()),
            Some(code) if code >= 500 => VigilError::Transient { code, message: e.to_string() },
            Some(_) => VigilError::Internal(e.to_string()),
            None => VigilError::Transient { code: 0, message: e.to_string() },
        }
    }

    fn resolved_identity(&self, alias: &str) -> VigilResult<Declaration> {
        let decl = self
            .get(alias)
            .ok_or_else(|| VigilError::Validation(format!("resource {alias} is not declared")))?;
        if decl.meta.is_none() || decl.name.is_none() {
            return Err(VigilError::TemplateUnresolved {
                alias: alias.to_string(),
                message: "declaration is not resolved yet".to_string(),
            });
        }
        Ok(decl)
    }

    /// Server-side-apply an object under a declaration's resolved identity
    /// and mark the declaration for teardown.
    pub async fn apply(&self, alias: &str, mut obj: Json) -> VigilResult<Json> {
        let decl = self.resolved_identity(alias)?;
        stamp_identity(&mut obj, &decl)?;
        let meta = decl.meta.clone().expect("resolved");
        let name = decl.name.clone().expect("resolved");
        let out = call_with_retry(alias, || {
            self.objects
                .apply(&decl.api_version, &meta, decl.namespace.as_deref(), &name, &obj)
        })
        .await
        .map_err(Self::map_call_error)?;
        self.with_decl(alias, |d| d.created = true);
        Ok(out)
    }

    /// Replace an object under a declaration's resolved identity.
    pub async fn replace(&self, alias: &str, mut obj: Json) -> VigilResult<Json> {
        let decl = self.resolved_identity(alias)?;
        stamp_identity(&mut obj, &decl)?;
        let meta = decl.meta.clone().expect("resolved");
        let name = decl.name.clone().expect("resolved");
        call_with_retry(alias, || {
            self.objects
                .replace(&decl.api_version, &meta, decl.namespace.as_deref(), &name, &obj)
        })
        .await
        .map_err(Self::map_call_error)
    }

    /// Delete the object behind a declaration.
    pub async fn delete(&self, alias: &str) -> VigilResult<()> {
        let decl = self.resolved_identity(alias)?;
        let meta = decl.meta.clone().expect("resolved");
        let name = decl.name.clone().expect("resolved");
        call_with_retry(alias, || {
            self.objects
                .delete(&decl.api_version, &meta, decl.namespace.as_deref(), &name)
        })
        .await
        .map_err(Self::map_call_error)
    }

    /// Teardown pass: delete every declaration created through this store,
    /// in insertion order. An object already gone counts as deleted; any
    /// other failure is logged, the pass continues, and the first failure
    /// is reported once the pass completes.
    pub async fn delete_created(&self) -> VigilResult<()> {
        let aliases: Vec<String> = {
            let inner = self.inner.lock().expect("store lock");
            inner
                .order
                .iter()
                .filter(|a| inner.decls.get(*a).map(|d| d.created).unwrap_or(false))
                .cloned()
                .collect()
        };
        let mut first_err = None;
        for alias in aliases {
            let decl = self.get(&alias).expect("listed above");
            info!(alias = %alias, kind = %decl.kind, "deleting created resource");
            match self.delete(&alias).await {
                Ok(()) => {}
                Err(VigilError::NotFound(_)) => {
                    debug!(alias = %alias, "created resource already gone");
                }
                Err(e) => {
                    let e = VigilError::Internal(format!(
                        "deleting {alias} of kind {} in {}: {e}",
                        decl.kind, decl.api_version
                    ));
                    warn!(error = %e, "teardown delete failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Stamp a declaration's resolved identity onto an object before a write,
/// then insist the required fields are present.
fn stamp_identity(obj: &mut Json, decl: &Declaration) -> VigilResult<()> {
    if !obj.is_object() {
        return Err(VigilError::Validation("object manifest must be a mapping".into()));
    }
    let map = obj.as_object_mut().expect("checked above");
    if !map.contains_key("apiVersion") {
        map.insert("apiVersion".into(), Json::String(decl.api_version.clone()));
    }
    if !map.contains_key("kind") {
        map.insert("kind".into(), Json::String(decl.kind.clone()));
    }
    let meta = map
        .entry("metadata")
        .or_insert_with(|| Json::Object(Default::default()));
    let Some(meta) = meta.as_object_mut() else {
        return Err(VigilError::Validation("metadata must be a mapping".into()));
    };
    if let Some(name) = &decl.name {
        meta.insert("name".into(), Json::String(name.clone()));
    }
    if let Some(ns) = &decl.namespace {
        meta.insert("namespace".into(), Json::String(ns.clone()));
    }
    for (field, present) in [
        ("apiVersion", map.get("apiVersion").is_some()),
        ("kind", map.get("kind").is_some()),
    ] {
        if !present {
            return Err(VigilError::Validation(format!("required field missing: {field}")));
        }
    }
    if map
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Json::as_str)
        .map(str::is_empty)
        .unwrap_or(true)
    {
        return Err(VigilError::Validation("required field missing: metadata.name".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use vigil_cluster::DiscoveryClient;
    use vigil_core::{ManualClock, ResourceMeta};

    struct FixedDiscovery;

    #[async_trait]
    impl DiscoveryClient for FixedDiscovery {
        async fn list_resource_kinds(
            &self,
            api_version: &str,
        ) -> Result<Vec<ResourceMeta>, CallError> {
            match api_version {
                "v1" => Ok(vec![
                    ResourceMeta {
                        kind: "ConfigMap".into(),
                        plural: "configmaps".into(),
                        namespaced: true,
                    },
                    ResourceMeta {
                        kind: "Namespace".into(),
                        plural: "namespaces".into(),
                        namespaced: false,
                    },
                ]),
                other => Err(CallError::Status {
                    code: 404,
                    message: format!("unknown apiVersion {other}"),
                }),
            }
        }
    }

    #[derive(Default)]
    struct FakeObjects {
        map: Mutex<HashMap<String, Json>>,
    }

    impl FakeObjects {
        fn key(namespace: Option<&str>, name: &str) -> String {
            format!("{}/{name}", namespace.unwrap_or(""))
        }

        fn put(&self, namespace: Option<&str>, name: &str, obj: Json) {
            self.map.lock().unwrap().insert(Self::key(namespace, name), obj);
        }

        fn has(&self, namespace: Option<&str>, name: &str) -> bool {
            self.map.lock().unwrap().contains_key(&Self::key(namespace, name))
        }

        fn remove(&self, namespace: Option<&str>, name: &str) {
            self.map.lock().unwrap().remove(&Self::key(namespace, name));
        }
    }

    #[async_trait]
    impl ObjectClient for FakeObjects {
        async fn read(
            &self,
            _api_version: &str,
            _meta: &ResourceMeta,
            namespace: Option<&str>,
            name: &str,
        ) -> Result<Json, CallError> {
            self.map
                .lock()
                .unwrap()
                .get(&Self::key(namespace, name))
                .cloned()
                .ok_or(CallError::Status { code: 404, message: format!("{name} not found") })
        }

        async fn apply(
            &self,
            _api_version: &str,
            _meta: &ResourceMeta,
            namespace: Option<&str>,
            name: &str,
            obj: &Json,
        ) -> Result<Json, CallError> {
            self.put(namespace, name, obj.clone());
            Ok(obj.clone())
        }

        async fn replace(
            &self,
            api_version: &str,
            meta: &ResourceMeta,
            namespace: Option<&str>,
            name: &str,
            obj: &Json,
        ) -> Result<Json, CallError> {
            if !self.has(namespace, name) {
                return Err(CallError::Status { code: 404, message: format!("{name} not found") });
            }
            self.apply(api_version, meta, namespace, name, obj).await
        }

        async fn delete(
            &self,
            _api_version: &str,
            _meta: &ResourceMeta,
            namespace: Option<&str>,
            name: &str,
        ) -> Result<(), CallError> {
            self.map
                .lock()
                .unwrap()
                .remove(&Self::key(namespace, name))
                .map(|_| ())
                .ok_or(CallError::Status { code: 404, message: format!("{name} not found") })
        }
    }

    fn store_with(objects: Arc<FakeObjects>) -> Arc<DeclStore> {
        let cache = Arc::new(KindCache::new(
            Arc::new(FixedDiscovery),
            Arc::new(ManualClock::new(0)),
        ));
        let cfg = StoreConfig {
            poll_interval: Duration::from_millis(50),
            ..StoreConfig::default()
        };
        Arc::new(DeclStore::new(objects, cache, cfg))
    }

    #[tokio::test]
    async fn duplicate_alias_is_rejected() {
        let store = store_with(Arc::new(FakeObjects::default()));
        store.add("cm", "ConfigMap", "v1", "a", None).unwrap();
        let err = store.add("cm", "ConfigMap", "v1", "b", None).unwrap_err();
        assert!(matches!(err, VigilError::AlreadyDeclared(a) if a == "cm"));
    }

    #[tokio::test]
    async fn empty_fields_are_rejected() {
        let store = store_with(Arc::new(FakeObjects::default()));
        assert!(matches!(
            store.add("", "ConfigMap", "v1", "a", None),
            Err(VigilError::Validation(_))
        ));
        assert!(matches!(
            store.add("x", "ConfigMap", "v1", " ", None),
            Err(VigilError::Validation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn start_polling_incorporates_prior_declarations() {
        let objects = Arc::new(FakeObjects::default());
        objects.put(Some("default"), "seed", json!({"metadata": {"name": "seed"}}));
        let store = store_with(objects);
        store.add("cm", "ConfigMap", "v1", "seed", None).unwrap();

        store.start_polling().await;
        // visible without waiting for any further tick
        let decl = store.get("cm").unwrap();
        assert!(decl.evaluated);
        assert_eq!(decl.name.as_deref(), Some("seed"));
        assert_eq!(decl.namespace.as_deref(), Some("default"));
        assert!(store.observed("cm").is_some());
        store.stop_polling().await;
    }

    #[tokio::test(start_paused = true)]
    async fn later_declaration_reads_earlier_one_in_same_tick() {
        let objects = Arc::new(FakeObjects::default());
        objects.put(
            Some("default"),
            "seed",
            json!({"metadata": {"name": "seed", "labels": {"pick": "target"}}}),
        );
        objects.put(Some("default"), "target", json!({"metadata": {"name": "target"}}));
        let store = store_with(objects);
        store.add("a", "ConfigMap", "v1", "seed", None).unwrap();
        store
            .add("b", "ConfigMap", "v1", "`${a.metadata.labels.pick}`", None)
            .unwrap();

        store.start_polling().await;
        let b = store.get("b").unwrap();
        assert_eq!(b.name.as_deref(), Some("target"));
        assert!(store.observed("b").is_some());
        store.stop_polling().await;
    }

    #[tokio::test(start_paused = true)]
    async fn templates_evaluate_exactly_once() {
        let objects = Arc::new(FakeObjects::default());
        let store = store_with(objects);
        store.add("cm", "ConfigMap", "v1", "`cm-${id(6)}`", None).unwrap();

        store.start_polling().await;
        let first = store.get("cm").unwrap().name.unwrap();
        store.start_polling().await; // at least one more full cycle
        let second = store.get("cm").unwrap().name.unwrap();
        assert_eq!(first, second);
        store.stop_polling().await;
    }

    #[tokio::test(start_paused = true)]
    async fn absent_until_backing_object_appears() {
        let objects = Arc::new(FakeObjects::default());
        let store = store_with(objects.clone());
        store.add("cm", "ConfigMap", "v1", "late", None).unwrap();

        store.start_polling().await;
        assert!(store.snapshot().object("cm").is_none());

        objects.put(Some("default"), "late", json!({"metadata": {"name": "late"}}));
        // observed within one poll period plus slack
        let mut seen = false;
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if store.snapshot().object("cm").is_some() {
                seen = true;
                break;
            }
        }
        assert!(seen, "object did not become observed within slack");
        store.stop_polling().await;
    }

    #[tokio::test(start_paused = true)]
    async fn broken_declaration_does_not_halt_others() {
        let objects = Arc::new(FakeObjects::default());
        objects.put(Some("default"), "good", json!({"metadata": {"name": "good"}}));
        let store = store_with(objects);
        store.add("bad", "Gizmo", "nope.io/v1", "x", None).unwrap();
        store.add("good", "ConfigMap", "v1", "good", None).unwrap();

        store.start_polling().await;
        assert!(store.observed("bad").is_none());
        assert!(store.observed("good").is_some());
        store.stop_polling().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cluster_scoped_kind_gets_no_namespace() {
        let objects = Arc::new(FakeObjects::default());
        objects.put(None, "prod", json!({"metadata": {"name": "prod"}}));
        let store = store_with(objects);
        store.add("ns", "Namespace", "v1", "prod", None).unwrap();

        store.start_polling().await;
        let decl = store.get("ns").unwrap();
        assert_eq!(decl.namespace, None);
        assert!(store.observed("ns").is_some());
        store.stop_polling().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_polling_freezes_state() {
        let objects = Arc::new(FakeObjects::default());
        let store = store_with(objects.clone());
        store.add("cm", "ConfigMap", "v1", "frozen", None).unwrap();
        store.start_polling().await;
        store.stop_polling().await;

        objects.put(Some("default"), "frozen", json!({"metadata": {"name": "frozen"}}));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.observed("cm").is_none(), "no mutation after stop_polling returned");
    }

    #[tokio::test(start_paused = true)]
    async fn apply_stamps_identity_and_marks_created() {
        let objects = Arc::new(FakeObjects::default());
        let store = store_with(objects.clone());
        store.add("cm", "ConfigMap", "v1", "made", None).unwrap();
        store.start_polling().await;

        let out = store
            .apply("cm", json!({"data": {"k": "v"}}))
            .await
            .unwrap();
        assert_eq!(out["apiVersion"], "v1");
        assert_eq!(out["kind"], "ConfigMap");
        assert_eq!(out["metadata"]["name"], "made");
        assert_eq!(out["metadata"]["namespace"], "default");
        assert!(store.get("cm").unwrap().created);
        assert!(objects.has(Some("default"), "made"));

        store.delete_created().await.unwrap();
        assert!(!objects.has(Some("default"), "made"));
        store.stop_polling().await;
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_tolerates_already_deleted_objects() {
        let objects = Arc::new(FakeObjects::default());
        let store = store_with(objects.clone());
        store.add("a", "ConfigMap", "v1", "first", None).unwrap();
        store.add("b", "ConfigMap", "v1", "second", None).unwrap();
        store.start_polling().await;
        store.apply("a", json!({"data": {}})).await.unwrap();
        store.apply("b", json!({"data": {}})).await.unwrap();

        // first object vanishes out of band before teardown
        objects.remove(Some("default"), "first");

        store.delete_created().await.unwrap();
        assert!(!objects.has(Some("default"), "second"), "teardown pass stopped early");
        store.stop_polling().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_identical_failures_are_recorded_once() {
        let store = store_with(Arc::new(FakeObjects::default()));
        store.add("bad", "Gizmo", "nope.io/v1", "x", None).unwrap();

        store.start_polling().await;
        let (message, _) = store.failure_record("bad").unwrap();
        assert!(message.contains("nope.io/v1"));

        store.start_polling().await; // at least two more full cycles
        store.start_polling().await;
        let (same, repeats) = store.failure_record("bad").unwrap();
        assert_eq!(same, message);
        // a fresh record per tick would reset this to 1 every time
        assert!(repeats >= 2, "identical failure was re-recorded, repeats = {repeats}");
        store.stop_polling().await;
    }

    #[tokio::test(start_paused = true)]
    async fn apply_before_resolution_is_an_error() {
        let store = store_with(Arc::new(FakeObjects::default()));
        store.add("cm", "ConfigMap", "v1", "early", None).unwrap();
        let err = store.apply("cm", json!({})).await.unwrap_err();
        assert!(matches!(err, VigilError::TemplateUnresolved { .. }));
    }
}
