use crate::{synthesize::Changes, Request};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

/// Reconcile pass metrics, shared by every pass.
#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    passes: Family<PassLabels, Counter>,
    duration: Family<KindLabels, Histogram>,
    loops: Family<KindLabels, Counter>,
    evictions: Family<KindLabels, Counter>,
    derived: Family<DerivedLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PassLabels {
    kind: &'static str,
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DerivedLabels {
    op: &'static str,
}

/// How a pass ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PassResult {
    Done,
    Requeued,
    Error,
    Timeout,
}

// === impl ReconcileMetrics ===

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            passes: Family::default(),
            duration: Family::new_with_constructor(|| {
                // Passes are bounded by the reconcile timeout, 30s by default.
                Histogram::new([0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0])
            }),
            loops: Family::default(),
            evictions: Family::default(),
            derived: Family::default(),
        }
    }
}

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "passes",
            "Count of reconcile passes by resource kind and result",
            metrics.passes.clone(),
        );
        reg.register_with_unit(
            "pass_duration",
            "Histogram of reconcile pass durations",
            Unit::Seconds,
            metrics.duration.clone(),
        );
        reg.register(
            "loops_detected",
            "Count of folder loops detected while resolving a folder's contents",
            metrics.loops.clone(),
        );
        reg.register(
            "loop_evictions",
            "Count of folders removed from their parent to break a loop",
            metrics.evictions.clone(),
        );
        reg.register(
            "derived_objects",
            "Count of derived RBAC object writes by operation",
            metrics.derived.clone(),
        );
        metrics
    }

    pub(crate) fn pass(&self, request: &Request, result: PassResult, started: time::Instant) {
        let kind = request.kind();
        self.passes
            .get_or_create(&PassLabels {
                kind,
                result: result.as_str(),
            })
            .inc();
        self.duration
            .get_or_create(&KindLabels { kind })
            .observe(started.elapsed().as_secs_f64());
    }

    pub(crate) fn loop_detected(&self, kind: &'static str, evicted: bool) {
        self.loops.get_or_create(&KindLabels { kind }).inc();
        if evicted {
            self.evictions.get_or_create(&KindLabels { kind }).inc();
        }
    }

    pub(crate) fn changes(&self, changes: Changes) {
        for (op, n) in [
            ("create", changes.created),
            ("update", changes.updated),
            ("delete", changes.deleted),
        ] {
            if n > 0 {
                self.derived.get_or_create(&DerivedLabels { op }).inc_by(n as u64);
            }
        }
    }
}

// === impl PassResult ===

impl PassResult {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Requeued => "requeued",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}
