//! Function registry (§4.3): scalar/string/conversion/math functions plus
//! stateful aggregate/analytical/window accumulators, all addressed by a
//! case-insensitive name.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::error::{EngineError, Result};
use crate::types::NestedValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Scalar,
    String,
    Conversion,
    Math,
    Aggregate,
    Analytical,
    Window,
    Custom,
}

impl FunctionKind {
    /// Functions of these kinds make a SELECT expression "aggregate-aware"
    /// (§4.2): the field's aggregate kind becomes the outermost such call.
    pub fn is_stateful(self) -> bool {
        matches!(self, FunctionKind::Aggregate | FunctionKind::Analytical | FunctionKind::Window)
    }
}

/// Per-group/per-window accumulator state for a stateful function.
pub trait Accumulator: Send {
    fn add(&mut self, value: &NestedValue);
    fn result(&self) -> NestedValue;
    fn reset(&mut self) {}
}

type ScalarImpl = Arc<dyn Fn(&[NestedValue]) -> NestedValue + Send + Sync>;
type AccumulatorFactory = Arc<dyn Fn() -> Box<dyn Accumulator> + Send + Sync>;

#[derive(Clone)]
enum FunctionImpl {
    Scalar(ScalarImpl),
    Accumulator(AccumulatorFactory),
}

#[derive(Clone)]
pub struct FunctionSpec {
    pub canonical_name: String,
    pub kind: FunctionKind,
    pub arity_min: usize,
    pub arity_max: usize,
    implementation: FunctionImpl,
}

impl FunctionSpec {
    pub fn call_scalar(&self, args: &[NestedValue]) -> NestedValue {
        match &self.implementation {
            FunctionImpl::Scalar(f) => f(args),
            FunctionImpl::Accumulator(_) => NestedValue::Null,
        }
    }

    pub fn new_accumulator(&self) -> Option<Box<dyn Accumulator>> {
        match &self.implementation {
            FunctionImpl::Accumulator(factory) => Some(factory()),
            FunctionImpl::Scalar(_) => None,
        }
    }
}

/// A process-wide, concurrently-readable registry of function definitions.
/// Lookup is case-insensitive; registration preserves canonical case.
pub struct FunctionRegistry {
    functions: DashMap<String, FunctionSpec>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        let registry = FunctionRegistry { functions: DashMap::new() };
        registry.register_builtins();
        registry
    }

    pub fn register(
        &self,
        name: &str,
        kind: FunctionKind,
        arity_min: usize,
        arity_max: usize,
        f: impl Fn(&[NestedValue]) -> NestedValue + Send + Sync + 'static,
    ) {
        self.functions.insert(
            name.to_ascii_lowercase(),
            FunctionSpec {
                canonical_name: name.to_string(),
                kind,
                arity_min,
                arity_max,
                implementation: FunctionImpl::Scalar(Arc::new(f)),
            },
        );
    }

    pub fn register_accumulator(
        &self,
        name: &str,
        kind: FunctionKind,
        arity_min: usize,
        arity_max: usize,
        factory: impl Fn() -> Box<dyn Accumulator> + Send + Sync + 'static,
    ) {
        self.functions.insert(
            name.to_ascii_lowercase(),
            FunctionSpec {
                canonical_name: name.to_string(),
                kind,
                arity_min,
                arity_max,
                implementation: FunctionImpl::Accumulator(Arc::new(factory)),
            },
        );
    }

    pub fn remove(&self, name: &str) -> bool {
        self.functions.remove(&name.to_ascii_lowercase()).is_some()
    }

    pub fn list(&self) -> Vec<String> {
        self.functions.iter().map(|e| e.value().canonical_name.clone()).collect()
    }

    pub fn lookup(&self, name: &str) -> Result<FunctionSpec> {
        self.functions
            .get(&name.to_ascii_lowercase())
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::compile(format!("unknown function '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(&name.to_ascii_lowercase())
    }

    fn register_builtins(&self) {
        register_math_fallback(self);
        register_string_functions(self);
        register_conversion_functions(self);
        register_aggregates(self);
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide default registry. `Engine::new` takes an immutable snapshot
/// of this (by cloning the relevant `FunctionSpec`s it needs at `execute`
/// time) so a running pipeline isn't affected by concurrent registrations
/// (§5, §9 "Global mutable state").
pub static GLOBAL_REGISTRY: Lazy<FunctionRegistry> = Lazy::new(FunctionRegistry::new);

fn num_arg(args: &[NestedValue], i: usize) -> f64 {
    args.get(i).and_then(NestedValue::as_f64).unwrap_or(0.0)
}

fn register_math_fallback(r: &FunctionRegistry) {
    r.register("abs", FunctionKind::Math, 1, 1, |a| NestedValue::Float(num_arg(a, 0).abs()));
    r.register("sqrt", FunctionKind::Math, 1, 1, |a| NestedValue::Float(num_arg(a, 0).sqrt()));
    r.register("sin", FunctionKind::Math, 1, 1, |a| NestedValue::Float(num_arg(a, 0).sin()));
    r.register("cos", FunctionKind::Math, 1, 1, |a| NestedValue::Float(num_arg(a, 0).cos()));
    r.register("tan", FunctionKind::Math, 1, 1, |a| NestedValue::Float(num_arg(a, 0).tan()));
    r.register("floor", FunctionKind::Math, 1, 1, |a| NestedValue::Float(num_arg(a, 0).floor()));
    r.register("ceil", FunctionKind::Math, 1, 1, |a| NestedValue::Float(num_arg(a, 0).ceil()));
    r.register("round", FunctionKind::Math, 1, 1, |a| NestedValue::Float(num_arg(a, 0).round()));
    r.register("log", FunctionKind::Math, 1, 1, |a| NestedValue::Float(num_arg(a, 0).ln()));
    r.register("log10", FunctionKind::Math, 1, 1, |a| NestedValue::Float(num_arg(a, 0).log10()));
    r.register("exp", FunctionKind::Math, 1, 1, |a| NestedValue::Float(num_arg(a, 0).exp()));
    r.register("pow", FunctionKind::Math, 2, 2, |a| NestedValue::Float(num_arg(a, 0).powf(num_arg(a, 1))));
    r.register("mod", FunctionKind::Math, 2, 2, |a| NestedValue::Float(num_arg(a, 0) % num_arg(a, 1)));
}

fn register_string_functions(r: &FunctionRegistry) {
    r.register("upper", FunctionKind::String, 1, 1, |a| {
        NestedValue::String(a.get(0).map(NestedValue::to_canonical_string).unwrap_or_default().to_uppercase())
    });
    r.register("lower", FunctionKind::String, 1, 1, |a| {
        NestedValue::String(a.get(0).map(NestedValue::to_canonical_string).unwrap_or_default().to_lowercase())
    });
    r.register("concat", FunctionKind::String, 0, usize::MAX, |a| {
        NestedValue::String(a.iter().map(NestedValue::to_canonical_string).collect())
    });
    r.register("length", FunctionKind::String, 1, 1, |a| {
        NestedValue::Int(a.get(0).map(NestedValue::to_canonical_string).unwrap_or_default().chars().count() as i64)
    });
}

fn register_conversion_functions(r: &FunctionRegistry) {
    r.register("to_string", FunctionKind::Conversion, 1, 1, |a| {
        NestedValue::String(a.get(0).map(NestedValue::to_canonical_string).unwrap_or_default())
    });
    r.register("to_int", FunctionKind::Conversion, 1, 1, |a| {
        NestedValue::Int(a.get(0).and_then(NestedValue::as_i64).unwrap_or(0))
    });
    r.register("to_float", FunctionKind::Conversion, 1, 1, |a| {
        NestedValue::Float(a.get(0).and_then(NestedValue::as_f64).unwrap_or(0.0))
    });
}

// ---- built-in aggregate accumulators ----

struct CountAcc(i64);
impl Accumulator for CountAcc {
    fn add(&mut self, _value: &NestedValue) {
        self.0 += 1;
    }
    fn result(&self) -> NestedValue {
        NestedValue::Int(self.0)
    }
    fn reset(&mut self) {
        self.0 = 0;
    }
}

#[derive(Default)]
struct SumAcc {
    int_sum: i64,
    float_sum: f64,
    saw_float: bool,
    saw_any: bool,
}
impl Accumulator for SumAcc {
    fn add(&mut self, value: &NestedValue) {
        match value {
            NestedValue::Int(i) => {
                self.saw_any = true;
                if self.saw_float {
                    self.float_sum += *i as f64;
                } else {
                    match self.int_sum.checked_add(*i) {
                        Some(v) => self.int_sum = v,
                        None => {
                            self.saw_float = true;
                            self.float_sum = self.int_sum as f64 + *i as f64;
                        }
                    }
                }
            }
            NestedValue::Float(f) => {
                self.saw_any = true;
                if !self.saw_float {
                    self.saw_float = true;
                    self.float_sum = self.int_sum as f64;
                }
                self.float_sum += f;
            }
            _ => {}
        }
    }
    fn result(&self) -> NestedValue {
        if !self.saw_any {
            return NestedValue::Int(0);
        }
        if self.saw_float {
            NestedValue::Float(self.float_sum)
        } else {
            NestedValue::Int(self.int_sum)
        }
    }
    fn reset(&mut self) {
        *self = SumAcc::default();
    }
}

#[derive(Default)]
struct AvgAcc {
    sum: f64,
    count: u64,
}
impl Accumulator for AvgAcc {
    fn add(&mut self, value: &NestedValue) {
        if let Some(n) = value.as_f64() {
            self.sum += n;
            self.count += 1;
        }
    }
    fn result(&self) -> NestedValue {
        if self.count == 0 {
            NestedValue::Null
        } else {
            NestedValue::Float(self.sum / self.count as f64)
        }
    }
    fn reset(&mut self) {
        *self = AvgAcc::default();
    }
}

struct MinMaxAcc {
    want_max: bool,
    current: Option<f64>,
}
impl Accumulator for MinMaxAcc {
    fn add(&mut self, value: &NestedValue) {
        if let Some(n) = value.as_f64() {
            self.current = Some(match self.current {
                None => n,
                Some(cur) => {
                    if self.want_max {
                        cur.max(n)
                    } else {
                        cur.min(n)
                    }
                }
            });
        }
    }
    fn result(&self) -> NestedValue {
        match self.current {
            Some(n) => NestedValue::Float(n),
            None => NestedValue::Null,
        }
    }
    fn reset(&mut self) {
        self.current = None;
    }
}

#[derive(Default)]
struct DistinctCountAcc {
    seen: std::collections::HashSet<String>,
}
impl Accumulator for DistinctCountAcc {
    fn add(&mut self, value: &NestedValue) {
        self.seen.insert(value.to_canonical_string());
    }
    fn result(&self) -> NestedValue {
        NestedValue::Int(self.seen.len() as i64)
    }
    fn reset(&mut self) {
        self.seen.clear();
    }
}

/// Bounded top/bottom-k accumulator, backed by a small binary heap kept
/// inverted for the bottom-k case (§9/§10: TopN/BottomN are ordinary
/// aggregate accumulators, independent of the pipeline).
struct TopNAcc {
    k: usize,
    want_max: bool,
    heap: BinaryHeap<OrdF64>,
}

#[derive(PartialEq)]
struct OrdF64(f64);
impl Eq for OrdF64 {}
impl PartialOrd for OrdF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrdF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.partial_cmp(&self.0).unwrap_or(Ordering::Equal)
    }
}

impl TopNAcc {
    fn new(k: usize, want_max: bool) -> Self {
        TopNAcc { k: k.max(1), want_max, heap: BinaryHeap::new() }
    }
}

impl Accumulator for TopNAcc {
    fn add(&mut self, value: &NestedValue) {
        let Some(n) = value.as_f64() else { return };
        let n = if self.want_max { n } else { -n };
        self.heap.push(OrdF64(-n));
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }
    fn result(&self) -> NestedValue {
        let mut values: Vec<f64> = self.heap.iter().map(|o| if self.want_max { -o.0 } else { o.0 }).collect();
        values.sort_by(|a, b| if self.want_max { b.partial_cmp(a).unwrap() } else { a.partial_cmp(b).unwrap() });
        NestedValue::List(values.into_iter().map(NestedValue::Float).collect())
    }
    fn reset(&mut self) {
        self.heap.clear();
    }
}

fn register_aggregates(r: &FunctionRegistry) {
    r.register_accumulator("count", FunctionKind::Aggregate, 0, 1, || Box::new(CountAcc(0)));
    r.register_accumulator("sum", FunctionKind::Aggregate, 1, 1, || Box::<SumAcc>::default());
    r.register_accumulator("avg", FunctionKind::Aggregate, 1, 1, || Box::<AvgAcc>::default());
    r.register_accumulator("max", FunctionKind::Aggregate, 1, 1, || {
        Box::new(MinMaxAcc { want_max: true, current: None })
    });
    r.register_accumulator("min", FunctionKind::Aggregate, 1, 1, || {
        Box::new(MinMaxAcc { want_max: false, current: None })
    });
    r.register_accumulator("distinct_count", FunctionKind::Aggregate, 1, 1, || Box::<DistinctCountAcc>::default());
    r.register_accumulator("topn", FunctionKind::Analytical, 1, 1, || Box::new(TopNAcc::new(5, true)));
    r.register_accumulator("bottomn", FunctionKind::Analytical, 1, 1, || Box::new(TopNAcc::new(5, false)));
}
