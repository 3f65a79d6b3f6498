//! Installed tier-2 traces, keyed by entry id, with dependency-driven invalidation.

use std::collections::BTreeMap;

use kestrel_types::ObjRef;
use tracing::{debug, trace};

use crate::error::CacheError;
use crate::exec::{run_trace, Machine, TraceExit};
use crate::native::{CompileOutcome, NativeBackend};
use crate::stats::UopCounters;
use crate::tier2::{optimize_trace, OptConfig, OptReport};
use crate::uop::Trace;

pub type TraceId = u64;

#[derive(Debug)]
pub struct CompiledTrace<H> {
    pub trace: Trace,
    pub report: OptReport,
    pub native: Option<H>,
}

/// Owns optimized traces and the native handles compiled from them.
///
/// A trace is discarded (and its handle freed) as soon as an object in its dependency set may have
/// changed. Dropping the cache frees every outstanding handle.
pub struct TraceCache<B: NativeBackend> {
    backend: B,
    config: OptConfig,
    traces: BTreeMap<TraceId, CompiledTrace<B::Handle>>,
    counters: UopCounters,
}

impl<B: NativeBackend> TraceCache<B> {
    pub fn new(backend: B, config: OptConfig) -> Self {
        Self {
            backend,
            config,
            traces: BTreeMap::new(),
            counters: UopCounters::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &OptConfig {
        &self.config
    }

    pub fn counters(&self) -> &UopCounters {
        &self.counters
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn contains(&self, id: TraceId) -> bool {
        self.traces.contains_key(&id)
    }

    pub fn get(&self, id: TraceId) -> Option<&CompiledTrace<B::Handle>> {
        self.traces.get(&id)
    }

    pub fn native_handle(&self, id: TraceId) -> Option<&B::Handle> {
        self.traces.get(&id).and_then(|t| t.native.as_ref())
    }

    /// Optimizes `trace`, offers it to the backend and installs it under `id`, replacing (and
    /// freeing) any previous trace with that id.
    pub fn install(&mut self, id: TraceId, mut trace: Trace) -> &OptReport {
        let report = optimize_trace(&mut trace, &self.config);
        let native = match self.backend.compile(&trace) {
            CompileOutcome::Native(handle) => Some(handle),
            CompileOutcome::Declined => {
                trace!(id, "native backend declined trace");
                None
            }
        };
        if let Some(old) = self.traces.remove(&id) {
            self.release(old);
        }
        &self
            .traces
            .entry(id)
            .or_insert(CompiledTrace {
                trace,
                report,
                native,
            })
            .report
    }

    /// Executes the uop form of trace `id`, then drops every trace that relied on a function the
    /// run mutated.
    pub fn run(
        &mut self,
        id: TraceId,
        machine: &mut Machine,
        max_iterations: u64,
    ) -> Result<TraceExit, CacheError> {
        let compiled = self.traces.get(&id).ok_or(CacheError::NotInstalled(id))?;
        let exit = run_trace(&compiled.trace, machine, &mut self.counters, max_iterations);
        for obj in std::mem::take(&mut machine.modified) {
            self.invalidate_dependency(&obj);
        }
        Ok(exit?)
    }

    /// Discards every trace whose dependency set may contain `obj`. Returns how many were dropped.
    pub fn invalidate_dependency(&mut self, obj: &ObjRef) -> usize {
        let stale: Vec<TraceId> = self
            .traces
            .iter()
            .filter(|(_, t)| t.report.dependencies.may_contain(obj))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(old) = self.traces.remove(id) {
                debug!(id, "invalidating tier-2 trace");
                self.release(old);
            }
        }
        stale.len()
    }

    pub fn remove(&mut self, id: TraceId) -> bool {
        match self.traces.remove(&id) {
            Some(old) => {
                self.release(old);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        for (_, old) in std::mem::take(&mut self.traces) {
            self.release(old);
        }
    }

    fn release(&mut self, compiled: CompiledTrace<B::Handle>) {
        if let Some(handle) = compiled.native {
            self.backend.free(handle);
        }
    }
}

impl<B: NativeBackend> Drop for TraceCache<B> {
    fn drop(&mut self) {
        self.clear();
    }
}
