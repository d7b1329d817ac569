//! In-memory circuit description
//!
//! A small register-transfer netlist: entities with ports and signals,
//! clocked processes made of statements, concurrent conditional
//! assignments and component instances. The generators in this crate
//! build an [`Entity`] and the [`vhdl`](crate::vhdl) module renders it.

use std::ops::{Add, Mul, Not, Sub};

use serde::Serialize;

/// Port direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PortDirection {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Port {
    pub name: String,
    pub width: u32,
    pub direction: PortDirection,
}

/// What a declared signal holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SignalKind {
    /// A bit (`width == 1`) or bit vector
    Logic { width: u32 },
    /// A register file
    Array { len: usize, width: u32 },
    /// An enumerated state register; the first state is the reset state
    State { states: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signal {
    pub name: String,
    pub kind: SignalKind,
}

impl Signal {
    pub fn logic(name: impl Into<String>, width: u32) -> Self {
        Self {
            name: name.into(),
            kind: SignalKind::Logic { width },
        }
    }

    /// Width of one value held by this signal, `None` for state registers
    pub fn width(&self) -> Option<u32> {
        match &self.kind {
            SignalKind::Logic { width } | SignalKind::Array { width, .. } => Some(*width),
            SignalKind::State { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Eq,
    Ne,
    Lt,
    Le,
    Ge,
    And,
    Or,
}

/// Expressions, both values and conditions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    Int(i64),
    Bit(bool),
    Bool(bool),
    Name(String),
    /// An enumerated state literal
    State(String),
    Slice { name: String, hi: u32, lo: u32 },
    Element { array: String, index: Box<Expr> },
    /// Most significant part first
    Concat(Vec<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Not(Box<Expr>),
}

impl Expr {
    pub fn name(name: impl Into<String>) -> Self {
        Expr::Name(name.into())
    }

    pub fn int(value: i64) -> Self {
        Expr::Int(value)
    }

    /// `name = '1'`
    pub fn high(name: impl Into<String>) -> Self {
        Expr::name(name).eq_to(Expr::Bit(true))
    }

    /// `name = '0'`
    pub fn low(name: impl Into<String>) -> Self {
        Expr::name(name).eq_to(Expr::Bit(false))
    }

    fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn eq_to(self, rhs: Expr) -> Self {
        Expr::binary(BinOp::Eq, self, rhs)
    }

    pub fn ne_to(self, rhs: Expr) -> Self {
        Expr::binary(BinOp::Ne, self, rhs)
    }

    pub fn ge(self, rhs: Expr) -> Self {
        Expr::binary(BinOp::Ge, self, rhs)
    }

    pub fn le(self, rhs: Expr) -> Self {
        Expr::binary(BinOp::Le, self, rhs)
    }

    pub fn and(self, rhs: Expr) -> Self {
        match (self, rhs) {
            (Expr::Bool(true), e) | (e, Expr::Bool(true)) => e,
            (lhs, rhs) => Expr::binary(BinOp::And, lhs, rhs),
        }
    }

    pub fn or(self, rhs: Expr) -> Self {
        match (self, rhs) {
            (Expr::Bool(false), e) | (e, Expr::Bool(false)) => e,
            (lhs, rhs) => Expr::binary(BinOp::Or, lhs, rhs),
        }
    }

    /// Conjunction of every condition, `true` when empty
    pub fn all(conditions: impl IntoIterator<Item = Expr>) -> Self {
        conditions.into_iter().fold(Expr::Bool(true), Expr::and)
    }

    /// Disjunction of every condition, `false` when empty
    pub fn any(conditions: impl IntoIterator<Item = Expr>) -> Self {
        conditions.into_iter().fold(Expr::Bool(false), Expr::or)
    }
}

impl Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Add, self, rhs)
    }
}

impl Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Sub, self, rhs)
    }
}

impl Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Mul, self, rhs)
    }
}

impl Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        match self {
            Expr::Bool(b) => Expr::Bool(!b),
            e => Expr::Not(Box::new(e)),
        }
    }
}

/// Assignment target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LValue {
    Name(String),
    Element { array: String, index: Expr },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Stmt {
    Assign {
        target: LValue,
        value: Expr,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    Case {
        selector: String,
        arms: Vec<(String, Vec<Stmt>)>,
    },
}

impl Stmt {
    pub fn assign(target: impl Into<String>, value: Expr) -> Self {
        Stmt::Assign {
            target: LValue::Name(target.into()),
            value,
        }
    }

    pub fn assign_element(array: impl Into<String>, index: Expr, value: Expr) -> Self {
        Stmt::Assign {
            target: LValue::Element {
                array: array.into(),
                index,
            },
            value,
        }
    }

    pub fn when(cond: Expr, then: Vec<Stmt>) -> Self {
        Stmt::If {
            cond,
            then,
            otherwise: Vec::new(),
        }
    }

    pub fn when_else(cond: Expr, then: Vec<Stmt>, otherwise: Vec<Stmt>) -> Self {
        Stmt::If {
            cond,
            then,
            otherwise,
        }
    }

    /// Every plain name assigned by this statement, in first-assignment order
    pub fn collect_targets(&self, out: &mut Vec<String>) {
        match self {
            Stmt::Assign {
                target: LValue::Name(name),
                ..
            } => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Stmt::Assign { .. } => {}
            Stmt::If {
                then, otherwise, ..
            } => {
                for s in then.iter().chain(otherwise) {
                    s.collect_targets(out);
                }
            }
            Stmt::Case { arms, .. } => {
                for (_, body) in arms {
                    for s in body {
                        s.collect_targets(out);
                    }
                }
            }
        }
    }
}

/// A clocked process with synchronous body and reset branch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Process {
    pub label: String,
    /// Process-local variables; assignments to them take effect immediately
    pub variables: Vec<Signal>,
    pub body: Vec<Stmt>,
    /// Reset values that differ from all-zero
    pub resets: Vec<(String, Expr)>,
}

impl Process {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            variables: Vec::new(),
            body: Vec::new(),
            resets: Vec::new(),
        }
    }

    /// Override the reset value of `name`
    pub fn reset_to(&mut self, name: impl Into<String>, value: Expr) {
        let name = name.into();
        self.resets.retain(|(n, _)| n != &name);
        self.resets.push((name, value));
    }

    /// Declare a process variable, returning its name
    pub fn variable(&mut self, name: impl Into<String>, width: u32) -> String {
        let name = name.into();
        if !self.is_variable(&name) {
            self.variables.push(Signal::logic(name.clone(), width));
        }
        name
    }

    pub fn is_variable(&self, name: &str) -> bool {
        self.variables.iter().any(|v| v.name == name)
    }

    pub fn push(&mut self, stmt: Stmt) {
        self.body.push(stmt);
    }

    pub fn targets(&self) -> Vec<String> {
        let mut out = Vec::new();
        for s in &self.body {
            s.collect_targets(&mut out);
        }
        out
    }
}

/// `target <= v0 when c0 else v1 when c1 else vN;`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionalAssign {
    pub target: String,
    pub cases: Vec<(Expr, Option<Expr>)>,
}

/// Instance of a separately generated entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instance {
    pub label: String,
    pub component: String,
    pub generics: Vec<(String, i64)>,
    /// Formal ports of the component, needed for its declaration
    pub ports: Vec<Port>,
    /// Formal name to actual signal
    pub port_map: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub name: String,
    pub clock: String,
    pub reset: String,
    pub generics: Vec<(String, i64)>,
    pub ports: Vec<Port>,
    pub signals: Vec<Signal>,
    pub processes: Vec<Process>,
    pub concurrent: Vec<ConditionalAssign>,
    pub instances: Vec<Instance>,
}

impl Entity {
    /// Create an entity with its clock and reset input ports
    pub fn new(name: impl Into<String>, clock: &str, reset: &str) -> Self {
        let mut entity = Self {
            name: name.into(),
            clock: clock.to_string(),
            reset: reset.to_string(),
            generics: Vec::new(),
            ports: Vec::new(),
            signals: Vec::new(),
            processes: Vec::new(),
            concurrent: Vec::new(),
            instances: Vec::new(),
        };
        entity.add_port(clock, 1, PortDirection::In);
        entity.add_port(reset, 1, PortDirection::In);
        entity
    }

    /// Add a port; adding an existing name is a no-op
    pub fn add_port(&mut self, name: impl Into<String>, width: u32, direction: PortDirection) -> String {
        let name = name.into();
        if self.port(&name).is_none() {
            self.ports.push(Port {
                name: name.clone(),
                width,
                direction,
            });
        }
        name
    }

    pub fn port(&self, name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.name == name)
    }

    pub fn signal(&self, name: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Declare a signal; adding an existing name is a no-op
    pub fn add_signal(&mut self, name: impl Into<String>, width: u32) -> String {
        let name = name.into();
        if self.signal(&name).is_none() {
            self.signals.push(Signal::logic(name.clone(), width));
        }
        name
    }

    pub fn add_array(&mut self, name: impl Into<String>, len: usize, width: u32) -> String {
        let name = name.into();
        if self.signal(&name).is_none() {
            self.signals.push(Signal {
                name: name.clone(),
                kind: SignalKind::Array { len, width },
            });
        }
        name
    }

    /// Width of a port or logic signal
    pub fn width_of(&self, name: &str) -> Option<u32> {
        self.port(name)
            .map(|p| p.width)
            .or_else(|| self.signal(name).and_then(Signal::width))
    }

    pub fn add_process(&mut self, process: Process) {
        self.processes.push(process);
    }

    /// Unconditional concurrent assignment
    pub fn connect(&mut self, target: impl Into<String>, value: Expr) {
        self.concurrent.push(ConditionalAssign {
            target: target.into(),
            cases: vec![(value, None)],
        });
    }

    /// Concurrent assignment selecting the first case whose condition holds
    pub fn assign_when(&mut self, target: impl Into<String>, cases: Vec<(Expr, Option<Expr>)>) {
        self.concurrent.push(ConditionalAssign {
            target: target.into(),
            cases,
        });
    }

    /// Single-bit flag: `'1'` when `cond` holds, `'0'` otherwise
    pub fn flag(&mut self, target: impl Into<String>, cond: Expr) {
        self.assign_when(
            target,
            vec![(Expr::Bit(true), Some(cond)), (Expr::Bit(false), None)],
        );
    }

    pub fn instantiate(&mut self, instance: Instance) {
        self.instances.push(instance);
    }

    /// Names driven by more than one process or concurrent statement
    pub fn multiply_driven(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        let mut dups = Vec::new();
        let drivers = self
            .processes
            .iter()
            .map(|p| {
                p.targets()
                    .into_iter()
                    .filter(|t| !p.is_variable(t))
                    .collect::<Vec<_>>()
            })
            .chain(self.concurrent.iter().map(|c| vec![c.target.clone()]));
        for targets in drivers {
            for t in targets {
                if seen.contains(&t) {
                    if !dups.contains(&t) {
                        dups.push(t);
                    }
                } else {
                    seen.push(t);
                }
            }
        }
        dups
    }
}

/// Handle to one state of a [`StateMachine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId(usize);

/// An ordered set of named, mutually exclusive states with one register
///
/// States are only ever added. Each state owns the list of statements that
/// run while the register holds it; [`StateMachine::into_case`] lowers the
/// whole machine to a `case` over the register.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMachine {
    register: String,
    states: Vec<String>,
    arms: Vec<Vec<Stmt>>,
}

impl StateMachine {
    pub fn new(register: impl Into<String>) -> Self {
        Self {
            register: register.into(),
            states: Vec::new(),
            arms: Vec::new(),
        }
    }

    pub fn register(&self) -> &str {
        &self.register
    }

    pub fn add_state(&mut self, name: impl Into<String>) -> StateId {
        self.states.push(name.into());
        self.arms.push(Vec::new());
        StateId(self.states.len() - 1)
    }

    pub fn name(&self, id: StateId) -> &str {
        &self.states[id.0]
    }

    pub fn states(&self) -> &[String] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn push(&mut self, id: StateId, stmt: Stmt) {
        self.arms[id.0].push(stmt);
    }

    pub fn extend(&mut self, id: StateId, stmts: impl IntoIterator<Item = Stmt>) {
        self.arms[id.0].extend(stmts);
    }

    /// Next-state assignment
    pub fn goto(&self, id: StateId) -> Stmt {
        Stmt::assign(self.register.clone(), Expr::State(self.name(id).to_string()))
    }

    /// `register = state`
    pub fn is_in(&self, id: StateId) -> Expr {
        Expr::name(self.register.clone()).eq_to(Expr::State(self.name(id).to_string()))
    }

    /// Declare the state register on `entity`
    pub fn declare(&self, entity: &mut Entity) {
        if entity.signal(&self.register).is_none() {
            entity.signals.push(Signal {
                name: self.register.clone(),
                kind: SignalKind::State {
                    states: self.states.clone(),
                },
            });
        }
    }

    pub fn into_case(self) -> Stmt {
        Stmt::Case {
            selector: self.register,
            arms: self.states.into_iter().zip(self.arms).collect(),
        }
    }
}
