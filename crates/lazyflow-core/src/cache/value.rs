//! Whole-value cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{LazyflowError, Result};
use crate::graph::{InputId, Operator, OperatorContext, OutputId, SetupContext, SlotSpec};
use crate::request::{Request, RequestState};
use crate::roi::Roi;
use crate::value::Value;

#[derive(Default)]
struct ValueState {
    value: Option<Value>,
    /// Generation the in-flight computation was started for.
    in_flight: Option<(u64, Request)>,
    generation: u64,
    frozen: bool,
    dirty_while_frozen: bool,
}

/// Caches the complete value of a parameter input.
///
/// The first read computes the whole input once; concurrent readers share
/// that computation. Any dirty notification drops the value unless
/// `FixAtCurrent` is set.
pub struct OpValueCache {
    state: Arc<Mutex<ValueState>>,
    fetches: Arc<AtomicU64>,
}

impl Default for OpValueCache {
    fn default() -> Self {
        Self::new()
    }
}

impl OpValueCache {
    /// Value to cache.
    pub const INPUT: InputId = InputId(0);
    /// Freeze flag.
    pub const FIX_AT_CURRENT: InputId = InputId(1);
    /// Cached value.
    pub const OUTPUT: OutputId = OutputId(0);

    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ValueState::default())),
            fetches: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Upstream computations started so far.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// True if a value is held.
    pub fn has_value(&self) -> bool {
        self.state.lock().value.is_some()
    }

    /// Replace the cached value without consulting the input.
    pub fn force_value(&self, value: Value) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.in_flight = None;
        state.value = Some(value);
    }

    /// Drop the cached value.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.in_flight = None;
        state.value = None;
    }

    fn whole(&self, ctx: &OperatorContext<'_>) -> Result<Value> {
        let request = {
            let mut state = self.state.lock();
            if let Some(value) = &state.value {
                return Ok(value.clone());
            }
            let stale = state.in_flight.as_ref().is_some_and(|(_, request)| {
                matches!(request.state(), RequestState::Cancelled | RequestState::Failed)
            });
            if stale {
                state.in_flight = None;
            }
            if state.frozen && state.in_flight.is_none() {
                return Err(LazyflowError::not_ready(ctx.output(Self::OUTPUT).qualified_name()));
            }
            let existing = state.in_flight.as_ref().map(|(_, request)| request.clone());
            match existing {
                Some(request) => request,
                None => {
                    let generation = state.generation;
                    let input = ctx.input(Self::INPUT).clone();
                    let shared = Arc::clone(&self.state);
                    let request = Request::new(Some(ctx.context().pool()), move || {
                        let value = input.value()?;
                        let mut state = shared.lock();
                        if state.generation == generation {
                            state.value = Some(value.clone());
                            state.in_flight = None;
                        }
                        Ok(value)
                    });
                    self.fetches.fetch_add(1, Ordering::Relaxed);
                    state.in_flight = Some((generation, request.clone()));
                    request
                }
            }
        };
        request.submit();
        request.wait()
    }
}

impl Operator for OpValueCache {
    fn name(&self) -> &'static str {
        "OpValueCache"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::value("Input"),
            SlotSpec::value("FixAtCurrent").with_default(false),
        ]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::value("Output")]
    }

    fn setup_outputs(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        let fix = ctx.input_value(Self::FIX_AT_CURRENT)?.as_bool()?;
        self.state.lock().frozen = fix;
        ctx.copy_meta(Self::INPUT, Self::OUTPUT)?;
        Ok(())
    }

    fn execute(
        &self,
        ctx: &OperatorContext<'_>,
        _output: OutputId,
        _roi: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        *result = self.whole(ctx)?;
        Ok(())
    }

    fn propagate_dirty(&self, ctx: &OperatorContext<'_>, input: InputId, _roi: &Roi) {
        let output = ctx.output(Self::OUTPUT);
        match input {
            Self::INPUT => {
                let mut state = self.state.lock();
                if state.frozen {
                    state.dirty_while_frozen = true;
                    return;
                }
                state.generation += 1;
                state.in_flight = None;
                state.value = None;
                drop(state);
                output.set_dirty_all();
            }
            Self::FIX_AT_CURRENT => {
                let fix = ctx
                    .input_value(Self::FIX_AT_CURRENT)
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let mut state = self.state.lock();
                if fix {
                    state.frozen = true;
                    return;
                }
                state.frozen = false;
                if std::mem::take(&mut state.dirty_while_frozen) {
                    state.generation += 1;
                    state.in_flight = None;
                    state.value = None;
                    drop(state);
                    output.set_dirty_all();
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, GraphConfig, OperatorHandle};

    /// Counts how often its parameter is computed.
    struct OpCountedParam {
        calls: Arc<AtomicU64>,
    }

    impl Operator for OpCountedParam {
        fn name(&self) -> &'static str {
            "OpCountedParam"
        }

        fn inputs(&self) -> Vec<SlotSpec> {
            vec![SlotSpec::value("Base")]
        }

        fn outputs(&self) -> Vec<SlotSpec> {
            vec![SlotSpec::value("Output")]
        }

        fn setup_outputs(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
            ctx.copy_meta(InputId(0), OutputId(0))?;
            Ok(())
        }

        fn execute(
            &self,
            ctx: &OperatorContext<'_>,
            _output: OutputId,
            _roi: &Roi,
            result: &mut Value,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *result = Value::Int(ctx.input_value(InputId(0))?.as_int()? * 10);
            Ok(())
        }
    }

    fn build() -> (Graph, OperatorHandle, OperatorHandle, Arc<AtomicU64>) {
        let graph = Graph::new(GraphConfig::synchronous());
        let calls = Arc::new(AtomicU64::new(0));
        let param = graph
            .add(OpCountedParam {
                calls: Arc::clone(&calls),
            })
            .unwrap();
        let cache = graph.add(OpValueCache::new()).unwrap();
        param.input(InputId(0)).set_value(4i64).unwrap();
        cache
            .input(OpValueCache::INPUT)
            .connect(param.output(OutputId(0)))
            .unwrap();
        (graph, param, cache, calls)
    }

    #[test]
    fn computes_once() {
        let (_graph, _param, cache, calls) = build();
        let out = cache.output(OpValueCache::OUTPUT);
        assert_eq!(out.value().unwrap(), Value::Int(40));
        assert_eq!(out.value().unwrap(), Value::Int(40));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dirty_input_recomputes() {
        let (_graph, param, cache, calls) = build();
        let out = cache.output(OpValueCache::OUTPUT);
        out.value().unwrap();
        param.input(InputId(0)).set_value(5i64).unwrap();
        assert_eq!(out.value().unwrap(), Value::Int(50));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn frozen_value_survives_changes() {
        let (_graph, param, cache, _calls) = build();
        let out = cache.output(OpValueCache::OUTPUT);
        out.value().unwrap();
        cache.input(OpValueCache::FIX_AT_CURRENT).set_value(true).unwrap();
        param.input(InputId(0)).set_value(6i64).unwrap();
        assert_eq!(out.value().unwrap(), Value::Int(40));
        cache.input(OpValueCache::FIX_AT_CURRENT).set_value(false).unwrap();
        assert_eq!(out.value().unwrap(), Value::Int(60));
    }

    #[test]
    fn forced_value_wins() {
        let (_graph, _param, cache, calls) = build();
        cache
            .with_op(|c: &OpValueCache| c.force_value(Value::Int(-1)))
            .unwrap();
        assert_eq!(cache.output(OpValueCache::OUTPUT).value().unwrap(), Value::Int(-1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        cache.with_op(|c: &OpValueCache| c.reset()).unwrap();
        assert_eq!(cache.output(OpValueCache::OUTPUT).value().unwrap(), Value::Int(40));
    }
}
