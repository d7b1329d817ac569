//! Loop induction variable handling
//!
//! A loop nest is a forest of induction variables. Each variable is one digit
//! of a generalized odometer: it advances only when every variable nested
//! inside it has reached its reset condition, and advancing it sends all of
//! those nested variables back to their start value.
//!
//! [`LivHandler`] holds the nest structure and is shared by reference between
//! every generator of a nest. Hardware generators bind it to a
//! [`CounterBank`], a set of counter registers owned by a single process.
//! [`LoopNestState`] is the behavioral model used to simulate the same
//! sequence in software.

use std::cell::OnceCell;
use std::collections::BTreeMap;

use log::debug;

use crate::descriptor::{EndValue, LoopNest};
use crate::error::{SynthesisError, SynthesisResult};
use crate::netlist::{Entity, Expr, PortDirection, Process, Stmt};

#[derive(Debug, Clone)]
struct Axis {
    id: String,
    step: i64,
    start: i64,
    end: Option<EndValue>,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Structure of one loop nest
#[derive(Debug, Clone, Default)]
pub struct LivHandler {
    axes: Vec<Axis>,
}

impl LivHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a handler from a nest descriptor
    pub fn from_nest(nest: &LoopNest) -> SynthesisResult<Self> {
        let mut handler = Self::new();
        handler.set_indexes(nest.livs.iter().map(|l| (l.id.as_str(), l.step, l.start)));
        for liv in &nest.livs {
            handler.set_children(&liv.id, &liv.children)?;
        }
        let mut ends = BTreeMap::new();
        for liv in &nest.livs {
            match &liv.end {
                Some(end) => {
                    ends.insert(liv.id.clone(), end.clone());
                }
                None => return Err(SynthesisError::MissingEndValue { liv: liv.id.clone() }),
            }
        }
        handler.set_end_values(&ends)?;
        handler.validate()?;
        debug!(
            "Loop nest {}: {} induction variables, innermost {}",
            nest.name,
            handler.len(),
            handler.innermost()?
        );
        Ok(handler)
    }

    /// Declare the induction variables as `(id, step, start)`, outer to inner
    pub fn set_indexes<'s>(&mut self, indexes: impl IntoIterator<Item = (&'s str, i64, i64)>) {
        self.axes = indexes
            .into_iter()
            .map(|(id, step, start)| Axis {
                id: id.to_string(),
                step,
                start,
                end: None,
                parent: None,
                children: Vec::new(),
            })
            .collect();
    }

    /// Record the direct children of `parent`
    pub fn set_children(&mut self, parent: &str, children: &[String]) -> SynthesisResult<()> {
        let p = self.index_of(parent)?;
        for child in children {
            let c = self.index_of(child)?;
            if c == p {
                return Err(SynthesisError::invalid_forest(format!(
                    "`{}` cannot be its own child",
                    parent
                )));
            }
            match self.axes[c].parent {
                Some(existing) if existing != p => {
                    return Err(SynthesisError::invalid_forest(format!(
                        "`{}` is a child of both `{}` and `{}`",
                        child, self.axes[existing].id, parent
                    )));
                }
                Some(_) => {}
                None => {
                    self.axes[c].parent = Some(p);
                    self.axes[p].children.push(c);
                }
            }
        }
        Ok(())
    }

    pub fn set_end_values(&mut self, ends: &BTreeMap<String, EndValue>) -> SynthesisResult<()> {
        for (liv, end) in ends {
            let i = self.index_of(liv)?;
            self.axes[i].end = Some(end.clone());
        }
        Ok(())
    }

    /// Check the structure is a forest with exactly one innermost variable
    /// and that every variable has an end value
    pub fn validate(&self) -> SynthesisResult<()> {
        if self.axes.is_empty() {
            return Err(SynthesisError::invalid_forest("the nest has no induction variables"));
        }
        for (i, axis) in self.axes.iter().enumerate() {
            if axis.end.is_none() {
                return Err(SynthesisError::MissingEndValue { liv: axis.id.clone() });
            }
            let mut cursor = axis.parent;
            let mut hops = 0;
            while let Some(p) = cursor {
                hops += 1;
                if p == i || hops > self.axes.len() {
                    return Err(SynthesisError::invalid_forest(format!(
                        "`{}` is nested inside itself",
                        axis.id
                    )));
                }
                cursor = self.axes[p].parent;
            }
        }
        let leaves = self.axes.iter().filter(|a| a.children.is_empty()).count();
        if leaves != 1 {
            return Err(SynthesisError::invalid_forest(format!(
                "expected exactly one innermost induction variable, found {}",
                leaves
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.axes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.axes.iter().map(|a| a.id.as_str())
    }

    pub fn contains(&self, liv: &str) -> bool {
        self.axes.iter().any(|a| a.id == liv)
    }

    pub fn index_of(&self, liv: &str) -> SynthesisResult<usize> {
        self.axes
            .iter()
            .position(|a| a.id == liv)
            .ok_or_else(|| SynthesisError::unknown_liv(liv))
    }

    /// The unique induction variable with no children
    pub fn innermost(&self) -> SynthesisResult<&str> {
        self.axes
            .iter()
            .find(|a| a.children.is_empty())
            .map(|a| a.id.as_str())
            .ok_or_else(|| SynthesisError::invalid_forest("no innermost induction variable"))
    }

    pub fn step(&self, liv: &str) -> SynthesisResult<i64> {
        Ok(self.axes[self.index_of(liv)?].step)
    }

    pub fn start(&self, liv: &str) -> SynthesisResult<i64> {
        Ok(self.axes[self.index_of(liv)?].start)
    }

    pub fn end_value(&self, liv: &str) -> SynthesisResult<&EndValue> {
        let axis = &self.axes[self.index_of(liv)?];
        axis.end
            .as_ref()
            .ok_or_else(|| SynthesisError::MissingEndValue { liv: axis.id.clone() })
    }

    /// End bound as an expression, `None` for an infinite loop
    pub fn end_expr(&self, liv: &str) -> SynthesisResult<Option<Expr>> {
        Ok(match self.end_value(liv)? {
            EndValue::Constant { value } => Some(Expr::int(*value)),
            EndValue::Runtime { port } => Some(Expr::name(port.clone())),
            EndValue::Infinite => None,
        })
    }

    /// Every `(liv, port)` pair whose bound is supplied at run time
    pub fn runtime_ports(&self) -> Vec<(&str, &str)> {
        self.axes
            .iter()
            .filter_map(|a| match &a.end {
                Some(EndValue::Runtime { port }) => Some((a.id.as_str(), port.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Add an input port for every runtime bound
    pub fn declare_runtime_ports(&self, entity: &mut Entity, width: u32) {
        for (_, port) in self.runtime_ports() {
            entity.add_port(port, width, PortDirection::In);
        }
    }

    /// Indices of every variable nested (at any depth) inside `i`
    fn descendants(&self, i: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut pending = self.axes[i].children.clone();
        while let Some(c) = pending.pop() {
            out.push(c);
            pending.extend(self.axes[c].children.iter().copied());
        }
        out.sort_unstable();
        out
    }

    /// Ids of every variable nested (at any depth) inside `liv`
    pub fn descendants_of(&self, liv: &str) -> SynthesisResult<Vec<&str>> {
        let i = self.index_of(liv)?;
        Ok(self
            .descendants(i)
            .into_iter()
            .map(|d| self.axes[d].id.as_str())
            .collect())
    }

    /// Bind the nest to counter registers named `{prefix}_{liv}`
    pub fn bank(&self, prefix: impl Into<String>, width: u32) -> CounterBank<'_> {
        CounterBank {
            handler: self,
            prefix: prefix.into(),
            width,
            increment: OnceCell::new(),
        }
    }
}

/// A set of counter registers walking one nest
///
/// Every bank is written by exactly one process; banks built from the same
/// handler step through the same sequence.
#[derive(Debug)]
pub struct CounterBank<'a> {
    handler: &'a LivHandler,
    prefix: String,
    width: u32,
    increment: OnceCell<Vec<Stmt>>,
}

impl<'a> CounterBank<'a> {
    pub fn handler(&self) -> &'a LivHandler {
        self.handler
    }

    pub fn counter(&self, liv: &str) -> SynthesisResult<String> {
        self.handler.index_of(liv)?;
        Ok(format!("{}_{}", self.prefix, liv))
    }

    fn counter_at(&self, i: usize) -> String {
        format!("{}_{}", self.prefix, self.handler.axes[i].id)
    }

    pub fn counter_expr(&self, liv: &str) -> SynthesisResult<Expr> {
        self.counter(liv).map(Expr::Name)
    }

    /// Declare the counter registers on `entity`
    pub fn declare(&self, entity: &mut Entity) {
        for i in 0..self.handler.axes.len() {
            entity.add_signal(self.counter_at(i), self.width);
        }
    }

    /// Reset every counter to its start value when the process resets
    pub fn reset_into(&self, process: &mut Process) {
        for (i, axis) in self.handler.axes.iter().enumerate() {
            if axis.start != 0 {
                process.reset_to(self.counter_at(i), Expr::int(axis.start));
            }
        }
    }

    fn reset_condition_at(&self, i: usize) -> Expr {
        let axis = &self.handler.axes[i];
        match &axis.end {
            Some(EndValue::Constant { value }) => {
                (Expr::name(self.counter_at(i)) + Expr::int(axis.step)).ge(Expr::int(*value))
            }
            Some(EndValue::Runtime { port }) => {
                (Expr::name(self.counter_at(i)) + Expr::int(axis.step)).ge(Expr::name(port.clone()))
            }
            Some(EndValue::Infinite) | None => Expr::Bool(false),
        }
    }

    /// `counter + step >= end`, false for an infinite loop
    pub fn reset_condition(&self, liv: &str) -> SynthesisResult<Expr> {
        Ok(self.reset_condition_at(self.handler.index_of(liv)?))
    }

    fn should_increment_at(&self, i: usize) -> Expr {
        let carried = self
            .handler
            .descendants(i)
            .into_iter()
            .map(|d| self.reset_condition_at(d));
        (!self.reset_condition_at(i)).and(Expr::all(carried))
    }

    /// True when `liv` has room left and every nested variable has wrapped
    pub fn should_increment(&self, liv: &str) -> SynthesisResult<Expr> {
        Ok(self.should_increment_at(self.handler.index_of(liv)?))
    }

    /// True exactly when the last index combination is current
    pub fn done_condition(&self) -> Expr {
        Expr::all((0..self.handler.axes.len()).map(|i| self.reset_condition_at(i)))
    }

    /// Synchronous odometer update, built once per bank
    pub fn increment_statement(&self) -> &[Stmt] {
        self.increment.get_or_init(|| {
            (0..self.handler.axes.len())
                .map(|i| {
                    let axis = &self.handler.axes[i];
                    let counter = self.counter_at(i);
                    let mut then = vec![Stmt::assign(
                        counter.clone(),
                        Expr::name(counter) + Expr::int(axis.step),
                    )];
                    for d in self.handler.descendants(i) {
                        then.push(Stmt::assign(
                            self.counter_at(d),
                            Expr::int(self.handler.axes[d].start),
                        ));
                    }
                    Stmt::when(self.should_increment_at(i), then)
                })
                .collect()
        })
    }
}

/// Software model of one walk through a nest
#[derive(Debug, Clone)]
pub struct LoopNestState<'a> {
    handler: &'a LivHandler,
    ends: Vec<Option<i64>>,
    counters: Vec<i64>,
}

impl<'a> LoopNestState<'a> {
    /// Start a walk, resolving runtime bounds from `bindings` (port to value)
    pub fn new(handler: &'a LivHandler, bindings: &BTreeMap<String, i64>) -> SynthesisResult<Self> {
        let ends = handler
            .axes
            .iter()
            .map(|a| match &a.end {
                Some(EndValue::Constant { value }) => Ok(Some(*value)),
                Some(EndValue::Runtime { port }) => bindings.get(port).copied().map(Some).ok_or_else(|| {
                    SynthesisError::MissingRuntimeBound {
                        liv: a.id.clone(),
                        port: port.clone(),
                    }
                }),
                Some(EndValue::Infinite) => Ok(None),
                None => Err(SynthesisError::MissingEndValue { liv: a.id.clone() }),
            })
            .collect::<SynthesisResult<Vec<_>>>()?;
        let counters = handler.axes.iter().map(|a| a.start).collect();
        Ok(Self {
            handler,
            ends,
            counters,
        })
    }

    pub fn handler(&self) -> &'a LivHandler {
        self.handler
    }

    pub fn counter(&self, liv: &str) -> SynthesisResult<i64> {
        Ok(self.counters[self.handler.index_of(liv)?])
    }

    /// Counters in declaration order
    pub fn counters(&self) -> &[i64] {
        &self.counters
    }

    /// Resolved end bound, `None` for an infinite loop
    pub fn end(&self, liv: &str) -> SynthesisResult<Option<i64>> {
        Ok(self.ends[self.handler.index_of(liv)?])
    }

    fn reset_condition_at(&self, i: usize) -> bool {
        match self.ends[i] {
            Some(end) => self.counters[i] + self.handler.axes[i].step >= end,
            None => false,
        }
    }

    fn should_increment_at(&self, i: usize) -> bool {
        !self.reset_condition_at(i)
            && self
                .handler
                .descendants(i)
                .into_iter()
                .all(|d| self.reset_condition_at(d))
    }

    pub fn should_increment(&self, liv: &str) -> SynthesisResult<bool> {
        Ok(self.should_increment_at(self.handler.index_of(liv)?))
    }

    pub fn done_condition(&self) -> bool {
        (0..self.counters.len()).all(|i| self.reset_condition_at(i))
    }

    /// Apply one increment, every decision taken from the pre-edge counters
    pub fn advance(&mut self) {
        let fire: Vec<bool> = (0..self.counters.len())
            .map(|i| self.should_increment_at(i))
            .collect();
        let before = self.counters.clone();
        for (i, fired) in fire.into_iter().enumerate() {
            if fired {
                self.counters[i] = before[i] + self.handler.axes[i].step;
                for d in self.handler.descendants(i) {
                    self.counters[d] = self.handler.axes[d].start;
                }
            }
        }
    }
}

/// Condition on the nest position guarding a state transition
///
/// `done` is the nest done condition and `row_continues` is
/// `should_increment` of the axis a stream rows along; `None` ignores one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Guard {
    pub done: Option<bool>,
    pub row_continues: Option<bool>,
}

impl Guard {
    pub const ALWAYS: Guard = Guard {
        done: None,
        row_continues: None,
    };

    pub fn done(done: bool) -> Self {
        Guard {
            done: Some(done),
            row_continues: None,
        }
    }

    pub fn row_continues(row_continues: bool) -> Self {
        Guard {
            done: None,
            row_continues: Some(row_continues),
        }
    }

    pub fn holds(&self, done: bool, row_continues: bool) -> bool {
        self.done.map_or(true, |d| d == done)
            && self.row_continues.map_or(true, |r| r == row_continues)
    }

    pub fn to_expr(&self, done: &Expr, row_continues: &Expr) -> Expr {
        let lit = |want: Option<bool>, e: &Expr| match want {
            None => Expr::Bool(true),
            Some(true) => e.clone(),
            Some(false) => !e.clone(),
        };
        lit(self.done, done).and(lit(self.row_continues, row_continues))
    }
}

/// One outgoing transition; the first edge whose guard holds is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge<S> {
    pub guard: Guard,
    pub next: S,
    /// Apply the odometer increment on this transition
    pub increment: bool,
}

impl<S> Edge<S> {
    pub fn new(guard: Guard, next: S, increment: bool) -> Self {
        Self {
            guard,
            next,
            increment,
        }
    }

    pub fn goto(next: S) -> Self {
        Self::new(Guard::ALWAYS, next, false)
    }
}

/// Pick the edge taken from the current position
pub fn select_edge<S: Copy>(edges: &[Edge<S>], done: bool, row_continues: bool) -> Option<Edge<S>> {
    edges
        .iter()
        .find(|e| e.guard.holds(done, row_continues))
        .copied()
}

/// Lower an edge list to an if/else chain
pub fn lower_edges<S: Copy>(
    edges: &[Edge<S>],
    done: &Expr,
    row_continues: &Expr,
    increment: &[Stmt],
    goto: &dyn Fn(S) -> Stmt,
) -> Vec<Stmt> {
    let Some((first, rest)) = edges.split_first() else {
        return Vec::new();
    };
    let mut body = Vec::new();
    if first.increment {
        body.extend(increment.iter().cloned());
    }
    body.push(goto(first.next));
    match first.guard.to_expr(done, row_continues) {
        Expr::Bool(true) => body,
        cond => vec![Stmt::when_else(
            cond,
            body,
            lower_edges(rest, done, row_continues, increment, goto),
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::LivDescriptor;
    use crate::netlist::BinOp;
    use pretty_assertions::assert_eq;

    fn nest_2x3() -> LoopNest {
        LoopNest::perfect(
            "nest",
            vec![
                LivDescriptor::new("i", 1, EndValue::constant(2)),
                LivDescriptor::new("j", 1, EndValue::constant(3)),
            ],
        )
    }

    #[test]
    fn test_odometer_order_and_done() {
        let handler = LivHandler::from_nest(&nest_2x3()).unwrap();
        let mut state = LoopNestState::new(&handler, &BTreeMap::new()).unwrap();
        let mut tuples = Vec::new();
        let mut dones = Vec::new();
        loop {
            tuples.push((state.counter("i").unwrap(), state.counter("j").unwrap()));
            dones.push(state.done_condition());
            if state.done_condition() {
                break;
            }
            state.advance();
        }
        assert_eq!(tuples, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
        assert_eq!(dones, vec![false, false, false, false, false, true]);
    }

    #[test]
    fn test_three_level_carry_with_start_and_step() {
        let nest = LoopNest::perfect(
            "deep",
            vec![
                LivDescriptor::new("a", 1, EndValue::constant(2)),
                LivDescriptor::new("b", 2, EndValue::constant(4)),
                LivDescriptor::new("c", 1, EndValue::constant(3)).with_start(1),
            ],
        );
        let handler = LivHandler::from_nest(&nest).unwrap();
        let mut state = LoopNestState::new(&handler, &BTreeMap::new()).unwrap();
        let mut count = 1;
        let mut seen = vec![state.counters().to_vec()];
        while !state.done_condition() {
            state.advance();
            seen.push(state.counters().to_vec());
            count += 1;
        }
        // a in {0,1}, b in {0,2}, c in {1,2}
        assert_eq!(count, 8);
        assert_eq!(seen[2], vec![0, 2, 1]);
        assert_eq!(seen[4], vec![1, 0, 1]);
        assert_eq!(seen.last().unwrap(), &vec![1, 2, 2]);
    }

    #[test]
    fn test_infinite_axis_never_done() {
        let nest = LoopNest::perfect(
            "stream",
            vec![
                LivDescriptor::new("t", 1, EndValue::Infinite),
                LivDescriptor::new("x", 1, EndValue::constant(2)),
            ],
        );
        let handler = LivHandler::from_nest(&nest).unwrap();
        let mut state = LoopNestState::new(&handler, &BTreeMap::new()).unwrap();
        for _ in 0..20 {
            assert!(!state.done_condition());
            state.advance();
        }
        assert_eq!(state.counter("t").unwrap(), 10);
    }

    #[test]
    fn test_runtime_bound_requires_binding() {
        let nest = LoopNest::perfect(
            "rt",
            vec![LivDescriptor::new("n", 1, EndValue::runtime("n_end"))],
        );
        let handler = LivHandler::from_nest(&nest).unwrap();
        assert!(matches!(
            LoopNestState::new(&handler, &BTreeMap::new()),
            Err(SynthesisError::MissingRuntimeBound { .. })
        ));
        let bindings = BTreeMap::from([("n_end".to_string(), 3)]);
        let mut state = LoopNestState::new(&handler, &bindings).unwrap();
        state.advance();
        state.advance();
        assert!(state.done_condition());
        assert_eq!(handler.runtime_ports(), vec![("n", "n_end")]);
    }

    #[test]
    fn test_missing_end_value_rejected() {
        let mut nest = nest_2x3();
        nest.livs[1].end = None;
        assert!(matches!(
            LivHandler::from_nest(&nest),
            Err(SynthesisError::MissingEndValue { liv }) if liv == "j"
        ));
    }

    #[test]
    fn test_forest_validation() {
        let nest = LoopNest::new(
            "two_leaves",
            vec![
                LivDescriptor::new("i", 1, EndValue::constant(2)),
                LivDescriptor::new("j", 1, EndValue::constant(2)),
            ],
        );
        assert!(matches!(
            LivHandler::from_nest(&nest),
            Err(SynthesisError::InvalidForest { .. })
        ));

        let nest = LoopNest::new(
            "shared_child",
            vec![
                LivDescriptor::new("i", 1, EndValue::constant(2)).with_children(["k"]),
                LivDescriptor::new("j", 1, EndValue::constant(2)).with_children(["k"]),
                LivDescriptor::new("k", 1, EndValue::constant(2)),
            ],
        );
        assert!(matches!(
            LivHandler::from_nest(&nest),
            Err(SynthesisError::InvalidForest { .. })
        ));
    }

    #[test]
    fn test_increment_statement_built_once() {
        let handler = LivHandler::from_nest(&nest_2x3()).unwrap();
        let bank = handler.bank("A_buff", 32);
        let first = bank.increment_statement().as_ptr();
        assert_eq!(bank.increment_statement().as_ptr(), first);
        assert_eq!(bank.increment_statement().len(), 2);
        assert_eq!(bank.counter("j").unwrap(), "A_buff_j");
        match &bank.increment_statement()[0] {
            Stmt::If { then, .. } => {
                assert_eq!(then.len(), 2);
                assert_eq!(then[1], Stmt::assign("A_buff_j", Expr::int(0)));
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_edges_select_and_lower() {
        let edges = [
            Edge::new(Guard::done(true), 'd', false),
            Edge::new(Guard::row_continues(true), 's', true),
            Edge::new(Guard::ALWAYS, 'w', true),
        ];
        assert_eq!(select_edge(&edges, true, false).map(|e| e.next), Some('d'));
        assert_eq!(select_edge(&edges, false, true).map(|e| e.next), Some('s'));
        assert_eq!(select_edge(&edges, false, false).map(|e| e.next), Some('w'));

        let inc = vec![Stmt::assign("c", Expr::int(1))];
        let goto = |s: char| Stmt::assign("state", Expr::State(s.to_string()));
        let lowered = lower_edges(&edges, &Expr::high("done"), &Expr::high("row"), &inc, &goto);
        assert_eq!(lowered.len(), 1);
        match &lowered[0] {
            Stmt::If { then, otherwise, .. } => {
                assert_eq!(then, &vec![goto('d')]);
                match &otherwise[0] {
                    Stmt::If { otherwise, .. } => {
                        assert_eq!(otherwise, &vec![inc[0].clone(), goto('w')]);
                    }
                    other => panic!("unexpected statement {:?}", other),
                }
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_reset_condition_expression() {
        let handler = LivHandler::from_nest(&nest_2x3()).unwrap();
        let bank = handler.bank("c", 8);
        match bank.reset_condition("j").unwrap() {
            Expr::Binary { op, rhs, .. } => {
                assert_eq!(op, BinOp::Ge);
                assert_eq!(*rhs, Expr::int(3));
            }
            other => panic!("unexpected expression {:?}", other),
        }
    }
}
