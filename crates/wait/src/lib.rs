//! Blocking wait primitives over the live declaration snapshot.
//!
//! `wait_until` polls a success expression and fails early only when an
//! "unless" expression has held continuously for a full debounce window.
//! Cluster conditions flap during reconciliation, so one true reading of a
//! failure predicate is not treated as evidence of permanent failure.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use vigil_cluster::KindCache;
use vigil_core::{Clock, VigilError, VigilResult};
use vigil_expr::EvalContext;
use vigil_store::DeclStore;

/// Read access to the latest completed snapshot. Implemented by
/// [`DeclStore`]; tests substitute scripted sources.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> EvalContext;
}

impl SnapshotSource for DeclStore {
    fn snapshot(&self) -> EvalContext {
        DeclStore::snapshot(self)
    }
}

#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Interval between snapshot evaluations.
    pub period: Duration,
    /// How long an "unless" expression must hold before the wait fails.
    pub debounce: Duration,
    /// Overall bound on any single wait.
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(500),
            debounce: Duration::from_secs(300),
            timeout: Duration::from_secs(3600),
        }
    }
}

pub struct Waiter {
    source: Arc<dyn SnapshotSource>,
    cache: Arc<KindCache>,
    clock: Arc<dyn Clock>,
    cfg: WaitConfig,
    stopped: AtomicBool,
}

impl Waiter {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        cache: Arc<KindCache>,
        clock: Arc<dyn Clock>,
        cfg: WaitConfig,
    ) -> Self {
        Self { source, cache, clock, cfg, stopped: AtomicBool::new(false) }
    }

    /// Cooperative cancellation: in-flight waits return successfully at
    /// their next check. Waits are read-only, nothing needs unwinding.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// One-shot assertion that an expression is truthy right now.
    pub fn assert_ok(&self, expr: &str) -> VigilResult<()> {
        let ctx = self.source.snapshot();
        if vigil_expr::evaluate(expr, &ctx).truthy() {
            Ok(())
        } else {
            Err(VigilError::Expr(format!("expression {expr:?} is not ok")))
        }
    }

    /// Block until `success` evaluates truthy. Each `unless` expression
    /// keeps its own debounce timer: continuously true past the window
    /// fails the wait naming that expression; transient trues are cleared.
    pub async fn wait_until(&self, success: &str, unless: &[&str]) -> VigilResult<()> {
        let debounce_ms = self.cfg.debounce.as_millis() as u64;
        let deadline = self.deadline();
        let mut since: Vec<Option<u64>> = vec![None; unless.len()];
        debug!(success, ?unless, "waiting for expression");
        loop {
            if self.is_stopped() {
                return Ok(());
            }
            let ctx = self.source.snapshot();
            if vigil_expr::evaluate(success, &ctx).truthy() {
                info!(success, "wait satisfied");
                return Ok(());
            }
            let now = self.clock.now_millis();
            for (i, expr) in unless.iter().enumerate() {
                if vigil_expr::evaluate(expr, &ctx).truthy() {
                    let started = *since[i].get_or_insert(now);
                    if now.saturating_sub(started) >= debounce_ms {
                        return Err(VigilError::UnlessHeld((*expr).to_string()));
                    }
                } else {
                    since[i] = None;
                }
            }
            if now >= deadline {
                return Err(VigilError::WaitTimeout(format!(
                    "expression {success:?} did not become ok"
                )));
            }
            tokio::time::sleep(self.cfg.period).await;
        }
    }

    /// Block until a declaration's observed object becomes absent.
    pub async fn wait_for_absence(&self, alias: &str) -> VigilResult<()> {
        let deadline = self.deadline();
        loop {
            if self.is_stopped() {
                return Ok(());
            }
            let ctx = self.source.snapshot();
            if !ctx.has_alias(alias) {
                return Err(VigilError::Validation(format!("resource {alias} is not declared")));
            }
            if ctx.object(alias).is_none() {
                return Ok(());
            }
            if self.clock.now_millis() >= deadline {
                return Err(VigilError::WaitTimeout(format!(
                    "waiting for {alias} to be deleted"
                )));
            }
            tokio::time::sleep(self.cfg.period).await;
        }
    }

    /// Block until discovery reports the kind under the apiVersion.
    pub async fn wait_for_kind_presence(&self, kind: &str, api_version: &str) -> VigilResult<()> {
        self.wait_for_kind(kind, api_version, true).await
    }

    /// Block until discovery stops reporting the kind (an unknown
    /// apiVersion counts as absent).
    pub async fn wait_for_kind_absence(&self, kind: &str, api_version: &str) -> VigilResult<()> {
        self.wait_for_kind(kind, api_version, false).await
    }

    async fn wait_for_kind(&self, kind: &str, api_version: &str, present: bool) -> VigilResult<()> {
        let deadline = self.deadline();
        loop {
            if self.is_stopped() {
                return Ok(());
            }
            // Discovery failures are treated as "kind not served" and
            // retried silently, like the poll loop does.
            let served = matches!(self.cache.resolve_kind(api_version, kind).await, Ok(Some(_)));
            if served == present {
                return Ok(());
            }
            if self.clock.now_millis() >= deadline {
                return Err(VigilError::WaitTimeout(format!(
                    "kind {kind} of {api_version} did not become {}",
                    if present { "present" } else { "absent" }
                )));
            }
            tokio::time::sleep(self.cfg.period).await;
        }
    }

    fn deadline(&self) -> u64 {
        self.clock
            .now_millis()
            .saturating_add(self.cfg.timeout.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use vigil_cluster::{CallError, DiscoveryClient};
    use vigil_core::{Declaration, ManualClock, ResourceMeta};

    /// Replays a script of snapshots, repeating the last one, and advances
    /// the manual clock by one period per snapshot so debounce windows and
    /// deadlines see time passing without real sleeps.
    struct ScriptedSource {
        script: Mutex<Vec<EvalContext>>,
        taken: AtomicUsize,
        clock: Arc<ManualClock>,
        advance_ms: u64,
    }

    impl ScriptedSource {
        fn new(script: Vec<EvalContext>, clock: Arc<ManualClock>, advance_ms: u64) -> Self {
            Self { script: Mutex::new(script), taken: AtomicUsize::new(0), clock, advance_ms }
        }

        fn taken(&self) -> usize {
            self.taken.load(Ordering::SeqCst)
        }
    }

    impl SnapshotSource for ScriptedSource {
        fn snapshot(&self) -> EvalContext {
            let n = self.taken.fetch_add(1, Ordering::SeqCst);
            if n > 0 {
                self.clock.advance(self.advance_ms);
            }
            let script = self.script.lock().unwrap();
            let idx = n.min(script.len() - 1);
            script[idx].clone()
        }
    }

    fn ctx(alias: &str, obj: Option<serde_json::Value>) -> EvalContext {
        let mut decl = Declaration::new(alias, "Pod", "v1", alias, None);
        decl.evaluated = true;
        decl.name = Some(alias.to_string());
        let mut c = EvalContext::new("default");
        c.insert_decl(alias, decl.info(), obj);
        c
    }

    struct NoDiscovery;

    #[async_trait]
    impl DiscoveryClient for NoDiscovery {
        async fn list_resource_kinds(&self, _: &str) -> Result<Vec<ResourceMeta>, CallError> {
            Ok(vec![])
        }
    }

    fn waiter(source: Arc<dyn SnapshotSource>, clock: Arc<ManualClock>, cfg: WaitConfig) -> Waiter {
        let cache = Arc::new(KindCache::new(Arc::new(NoDiscovery), clock.clone()));
        Waiter::new(source, cache, clock, cfg)
    }

    fn cfg_fast() -> WaitConfig {
        WaitConfig {
            period: Duration::from_millis(500),
            debounce: Duration::from_millis(2000),
            timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_three_ticks() {
        let clock = Arc::new(ManualClock::new(0));
        let not_yet = ctx("pod", Some(json!({"status": {"phase": "Pending"}})));
        let done = ctx("pod", Some(json!({"status": {"phase": "Succeeded"}})));
        let source = Arc::new(ScriptedSource::new(
            vec![not_yet.clone(), not_yet.clone(), not_yet, done],
            clock.clone(),
            500,
        ));
        let w = waiter(source.clone(), clock, cfg_fast());

        let start = tokio::time::Instant::now();
        w.wait_until("pod.status.phase == 'Succeeded'", &[]).await.unwrap();
        // three sleeps of one period each before the fourth snapshot
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
        assert_eq!(source.taken(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_unless_is_tolerated() {
        let clock = Arc::new(ManualClock::new(0));
        let failing = ctx("pod", Some(json!({"status": {"phase": "Failed"}})));
        let pending = ctx("pod", Some(json!({"status": {"phase": "Pending"}})));
        let done = ctx("pod", Some(json!({"status": {"phase": "Succeeded"}})));
        // unless true for two ticks, then recovers before the debounce
        // window (2000 ms at 500 ms per tick) elapses
        let source = Arc::new(ScriptedSource::new(
            vec![failing.clone(), failing, pending.clone(), pending, done],
            clock.clone(),
            500,
        ));
        let w = waiter(source, clock, cfg_fast());
        w.wait_until(
            "pod.status.phase == 'Succeeded'",
            &["pod.status.phase == 'Failed'"],
        )
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_unless_fails_naming_the_expression() {
        let clock = Arc::new(ManualClock::new(0));
        let failing = ctx("pod", Some(json!({"status": {"phase": "Failed"}})));
        let source = Arc::new(ScriptedSource::new(vec![failing], clock.clone(), 500));
        let w = waiter(source, clock, cfg_fast());

        let err = w
            .wait_until(
                "pod.status.phase == 'Succeeded'",
                &["pod.status.phase == 'Failed'"],
            )
            .await
            .unwrap_err();
        match err {
            VigilError::UnlessHeld(expr) => {
                assert_eq!(expr, "pod.status.phase == 'Failed'");
            }
            other => panic!("expected UnlessHeld, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_times_out() {
        let clock = Arc::new(ManualClock::new(0));
        let pending = ctx("pod", Some(json!({"status": {"phase": "Pending"}})));
        let source = Arc::new(ScriptedSource::new(vec![pending], clock.clone(), 500));
        let mut cfg = cfg_fast();
        cfg.timeout = Duration::from_millis(3000);
        let w = waiter(source, clock, cfg);

        let err = w
            .wait_until("pod.status.phase == 'Succeeded'", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, VigilError::WaitTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn absence_resolves_when_object_goes_away() {
        let clock = Arc::new(ManualClock::new(0));
        let there = ctx("pod", Some(json!({"metadata": {"name": "pod"}})));
        let gone = ctx("pod", None);
        let source = Arc::new(ScriptedSource::new(
            vec![there.clone(), there, gone],
            clock.clone(),
            500,
        ));
        let w = waiter(source, clock, cfg_fast());
        w.wait_for_absence("pod").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn absence_of_undeclared_alias_is_an_error() {
        let clock = Arc::new(ManualClock::new(0));
        let source = Arc::new(ScriptedSource::new(vec![EvalContext::new("default")], clock.clone(), 500));
        let w = waiter(source, clock, cfg_fast());
        let err = w.wait_for_absence("ghost").await.unwrap_err();
        assert!(matches!(err, VigilError::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn absence_times_out() {
        let clock = Arc::new(ManualClock::new(0));
        let there = ctx("pod", Some(json!({"metadata": {"name": "pod"}})));
        let source = Arc::new(ScriptedSource::new(vec![there], clock.clone(), 500));
        let mut cfg = cfg_fast();
        cfg.timeout = Duration::from_millis(2000);
        let w = waiter(source, clock, cfg);
        let err = w.wait_for_absence("pod").await.unwrap_err();
        assert!(matches!(err, VigilError::WaitTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_waiter_returns_immediately() {
        let clock = Arc::new(ManualClock::new(0));
        let pending = ctx("pod", Some(json!({"status": {"phase": "Pending"}})));
        let source = Arc::new(ScriptedSource::new(vec![pending], clock.clone(), 500));
        let w = waiter(source.clone(), clock, cfg_fast());
        w.stop();
        w.wait_until("pod.status.phase == 'Succeeded'", &[]).await.unwrap();
        assert_eq!(source.taken(), 0);
    }

    mod kind_waits {
        use super::*;
        use std::sync::atomic::AtomicU64;

        /// Advances one millisecond per reading, so the zero-TTL cache
        /// below re-fetches on every poll without any real sleeping.
        struct TickingClock {
            t: AtomicU64,
        }

        impl Clock for TickingClock {
            fn now_millis(&self) -> u64 {
                self.t.fetch_add(1, Ordering::SeqCst)
            }
        }

        /// Discovery whose served kinds change after a number of calls.
        struct FlippingDiscovery {
            calls: AtomicUsize,
            flip_after: usize,
            before: Vec<ResourceMeta>,
            after: Vec<ResourceMeta>,
        }

        #[async_trait]
        impl DiscoveryClient for FlippingDiscovery {
            async fn list_resource_kinds(
                &self,
                _api_version: &str,
            ) -> Result<Vec<ResourceMeta>, CallError> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.flip_after {
                    Ok(self.before.clone())
                } else {
                    Ok(self.after.clone())
                }
            }
        }

        fn widget() -> ResourceMeta {
            ResourceMeta { kind: "Widget".into(), plural: "widgets".into(), namespaced: true }
        }

        fn kind_waiter(disc: Arc<dyn DiscoveryClient>) -> Waiter {
            let clock = Arc::new(TickingClock { t: AtomicU64::new(0) });
            // zero TTL so every poll asks discovery again
            let cache = Arc::new(KindCache::with_ttl(disc, clock.clone(), 0));
            let source = Arc::new(ScriptedSource::new(
                vec![EvalContext::new("default")],
                Arc::new(ManualClock::new(0)),
                0,
            ));
            Waiter::new(source, cache, clock, cfg_fast())
        }

        #[tokio::test(start_paused = true)]
        async fn kind_presence_after_crd_appears() {
            let disc = Arc::new(FlippingDiscovery {
                calls: AtomicUsize::new(0),
                flip_after: 3,
                before: vec![],
                after: vec![widget()],
            });
            let w = kind_waiter(disc);
            w.wait_for_kind_presence("Widget", "example.io/v1").await.unwrap();
        }

        #[tokio::test(start_paused = true)]
        async fn kind_absence_when_api_version_vanishes() {
            let disc = Arc::new(FlippingDiscovery {
                calls: AtomicUsize::new(0),
                flip_after: 2,
                before: vec![widget()],
                after: vec![],
            });
            let w = kind_waiter(disc);
            w.wait_for_kind_absence("Widget", "example.io/v1").await.unwrap();
        }
    }
}
