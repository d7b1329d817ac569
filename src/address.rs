//! Address generators
//!
//! An address generator walks the loop nest in lock-step with its smart
//! buffer and issues one burst descriptor `(base, count)` per buffer row and
//! channel. Bases are row-major linear addresses:
//!
//! ```text
//! base = sum_k (counter_k + offset_k) * factor_k
//! factor_inner = 1
//! factor_k     = factor_{k+1} * (end_{k+1} + W_{k+1} - 1)
//! ```
//!
//! Factors are computed once in the initialization states, innermost axis
//! first; an infinite inner bound makes every outer factor `-1`. Each base
//! goes through a three stage pipeline (index plus offset, multiply by the
//! factor, sum across axes) and `address_rdy_out` strobes on the cycle it
//! leaves the last stage. `address_stall_in` freezes both the state machine
//! and the pipeline.

use std::collections::BTreeMap;
use std::ops::Range;

use log::debug;
use serde::Serialize;

use crate::descriptor::{EndValue, StreamDirection};
use crate::error::{SynthesisError, SynthesisResult};
use crate::geometry::{coordinate_suffix, Region, StreamGeometry};
use crate::hardware::SynthesisConfig;
use crate::liv::{lower_edges, select_edge, Edge, Guard, LivHandler, LoopNestState};
use crate::netlist::{Entity, Expr, PortDirection, Process, StateMachine, Stmt};

/// One contiguous memory range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Burst {
    pub channel: usize,
    pub base: i64,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressState {
    /// Computes the factor of one access axis, innermost first
    Initialize(usize),
    Window(usize),
    Step(usize),
    Done,
}

/// Row-major linear address of `offsets` relative to `counters`
pub fn linear_address(counters: &[i64], offsets: &[usize], factors: &[i64]) -> i64 {
    counters
        .iter()
        .zip(offsets)
        .zip(factors)
        .map(|((c, o), f)| (c + *o as i64) * f)
        .sum()
}

/// State layout and transition rules shared by the model and the netlist
#[derive(Debug, Clone)]
pub struct AddressLayout {
    direction: StreamDirection,
    axes: usize,
    window: Vec<Vec<Vec<usize>>>,
    step: Vec<Vec<Vec<usize>>>,
    window_range: Range<usize>,
    step_range: Range<usize>,
}

impl AddressLayout {
    pub fn new(geometry: &StreamGeometry) -> Self {
        Self {
            direction: geometry.direction,
            axes: geometry.access_order.len(),
            window: geometry.row_batches(Region::Window),
            step: geometry.row_batches(Region::Step),
            window_range: geometry.inner_range(Region::Window),
            step_range: geometry.inner_range(Region::Step),
        }
    }

    /// Every state in declaration order
    pub fn states(&self) -> Vec<AddressState> {
        (0..self.axes)
            .map(AddressState::Initialize)
            .chain((0..self.window.len()).map(AddressState::Window))
            .chain((0..self.step.len()).map(AddressState::Step))
            .chain(std::iter::once(AddressState::Done))
            .collect()
    }

    /// State entered at the start of a row
    fn row_start(&self) -> AddressState {
        match self.direction {
            StreamDirection::Input if !self.window.is_empty() => AddressState::Window(0),
            _ => AddressState::Step(0),
        }
    }

    pub fn edges(&self, state: AddressState) -> Vec<Edge<AddressState>> {
        use AddressState::*;
        match state {
            Initialize(j) if j + 1 < self.axes => vec![Edge::goto(Initialize(j + 1))],
            Initialize(_) => vec![Edge::goto(self.row_start())],
            Window(i) if i + 1 < self.window.len() => vec![Edge::goto(Window(i + 1))],
            Step(i) if i + 1 < self.step.len() => vec![Edge::goto(Step(i + 1))],
            Window(_) => match self.direction {
                StreamDirection::Input => vec![Edge::goto(Step(0))],
                StreamDirection::Output => vec![
                    Edge::new(Guard::done(true), Done, false),
                    Edge::new(Guard::ALWAYS, Step(0), true),
                ],
            },
            Step(_) => match self.direction {
                StreamDirection::Input => vec![
                    Edge::new(Guard::done(true), Done, false),
                    Edge::new(Guard::row_continues(true), Step(0), true),
                    Edge::new(Guard::ALWAYS, self.row_start(), true),
                ],
                StreamDirection::Output if !self.window.is_empty() => vec![
                    Edge::new(Guard::row_continues(true), Step(0), true),
                    Edge::new(Guard::ALWAYS, Window(0), false),
                ],
                StreamDirection::Output => vec![
                    Edge::new(Guard::done(true), Done, false),
                    Edge::new(Guard::ALWAYS, Step(0), true),
                ],
            },
            Done => vec![Edge::goto(Done)],
        }
    }

    /// Rows handled by a fill state, one per channel, with their inner span
    pub fn batch(&self, state: AddressState) -> Option<(&[Vec<usize>], Range<usize>)> {
        match state {
            AddressState::Window(i) => Some((self.window.get(i)?, self.window_range.clone())),
            AddressState::Step(i) => Some((self.step.get(i)?, self.step_range.clone())),
            _ => None,
        }
    }

    /// Name of `state` in the generated state register
    pub fn state_name(&self, geometry: &StreamGeometry, state: AddressState) -> String {
        match state {
            AddressState::Initialize(j) => {
                format!("S_{}_INITIALIZE", geometry.access_order[self.axes - 1 - j])
            }
            AddressState::Done => "S_DONE".to_string(),
            AddressState::Window(_) | AddressState::Step(_) => {
                let region = if matches!(state, AddressState::Window(_)) {
                    Region::Window
                } else {
                    Region::Step
                };
                let first = self
                    .batch(state)
                    .and_then(|(rows, range)| {
                        rows.first().map(|r| {
                            let mut coord = r.clone();
                            coord.push(range.start);
                            coord
                        })
                    })
                    .unwrap_or_default();
                format!("S_{}_{}", region.label(), coordinate_suffix(&first))
            }
        }
    }
}

/// Address factors of every access axis for resolved end bounds
pub fn address_factors(geometry: &StreamGeometry, nest: &LoopNestState<'_>) -> SynthesisResult<Vec<i64>> {
    let n = geometry.access_order.len();
    let window = geometry.window();
    let mut factors = vec![1i64; n];
    for k in (0..n.saturating_sub(1)).rev() {
        let inner = k + 1;
        factors[k] = match nest.end(&geometry.access_order[inner])? {
            Some(end) if factors[inner] != -1 => factors[inner] * (end + window[inner] as i64 - 1),
            _ => -1,
        };
    }
    Ok(factors)
}

/// What the generator put on its outputs during one cycle
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddressTick {
    pub address_rdy: bool,
    pub bursts: Vec<Burst>,
}

/// Cycle-level model of a generated address generator
#[derive(Debug, Clone)]
pub struct AddressGenerator<'a> {
    geometry: &'a StreamGeometry,
    layout: AddressLayout,
    nest: LoopNestState<'a>,
    factors: Vec<i64>,
    state: AddressState,
    pipeline: [Option<Vec<Burst>>; 3],
}

impl<'a> AddressGenerator<'a> {
    pub fn new(
        geometry: &'a StreamGeometry,
        handler: &'a LivHandler,
        bindings: &BTreeMap<String, i64>,
    ) -> SynthesisResult<Self> {
        if geometry.is_pass_through() {
            return Err(SynthesisError::configuration(
                &geometry.stream_id,
                "pass-through streams have no address generator",
            ));
        }
        let nest = LoopNestState::new(handler, bindings)?;
        let factors = address_factors(geometry, &nest)?;
        Ok(Self {
            geometry,
            layout: AddressLayout::new(geometry),
            nest,
            factors,
            state: AddressState::Initialize(0),
            pipeline: [None, None, None],
        })
    }

    pub fn state(&self) -> AddressState {
        self.state
    }

    pub fn factors(&self) -> &[i64] {
        &self.factors
    }

    pub fn channels(&self) -> usize {
        self.geometry.address_channels
    }

    /// State machine parked in done with nothing left in the pipeline
    pub fn is_finished(&self) -> bool {
        self.state == AddressState::Done && self.pipeline.iter().all(Option::is_none)
    }

    /// Bursts a fill state issues from the current nest position
    pub fn bursts_for(&self, state: AddressState) -> SynthesisResult<Vec<Burst>> {
        let Some((rows, range)) = self.layout.batch(state) else {
            return Ok(Vec::new());
        };
        let counters = self
            .geometry
            .access_order
            .iter()
            .map(|axis| self.nest.counter(axis))
            .collect::<SynthesisResult<Vec<_>>>()?;
        Ok(rows
            .iter()
            .enumerate()
            .map(|(channel, row)| {
                let mut offsets = row.clone();
                offsets.push(range.start);
                Burst {
                    channel,
                    base: linear_address(&counters, &offsets, &self.factors),
                    count: range.len(),
                }
            })
            .collect())
    }

    /// One clock edge
    pub fn tick(&mut self, stall: bool) -> SynthesisResult<AddressTick> {
        if stall {
            return Ok(AddressTick::default());
        }
        let leaving = self.pipeline[2].take();
        self.pipeline[2] = self.pipeline[1].take();
        self.pipeline[1] = self.pipeline[0].take();
        if self.layout.batch(self.state).is_some() {
            self.pipeline[0] = Some(self.bursts_for(self.state)?);
        }

        let edges = self.layout.edges(self.state);
        let done = self.nest.done_condition();
        let row = self.nest.should_increment(self.geometry.innermost_accessed())?;
        if let Some(edge) = select_edge(&edges, done, row) {
            if edge.increment {
                self.nest.advance();
            }
            self.state = edge.next;
        }

        Ok(match leaving {
            Some(bursts) => AddressTick {
                address_rdy: true,
                bursts,
            },
            None => AddressTick::default(),
        })
    }
}

/// Ports of a generated address generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressGeneratorPorts {
    pub address_rdy_out: String,
    pub address_stall_in: String,
    pub base_out: Vec<String>,
    pub count_out: Vec<String>,
    pub state_register: String,
    pub states: usize,
}

impl AddressGeneratorPorts {
    /// Check the generator drives as many channels as the buffer expects
    pub fn verify_channels(&self, stream: &str, expected: usize) -> SynthesisResult<()> {
        if self.base_out.len() != expected {
            return Err(SynthesisError::AddressChannelMismatch {
                stream: stream.to_string(),
                generator: self.base_out.len(),
                buffer: expected,
            });
        }
        Ok(())
    }
}

/// Generate the address generator of `geometry` into `entity`
pub fn create_vhdl(
    entity: &mut Entity,
    handler: &LivHandler,
    geometry: &StreamGeometry,
    config: &SynthesisConfig,
) -> SynthesisResult<AddressGeneratorPorts> {
    if geometry.is_pass_through() {
        return Err(SynthesisError::configuration(
            &geometry.stream_id,
            "pass-through streams have no address generator",
        ));
    }
    let s = geometry.stream_id.as_str();
    let layout = AddressLayout::new(geometry);
    let axes = geometry.access_order.len();
    let window = geometry.window();
    let cw = config.counter_width;
    let aw = config.address_width;
    let pw = cw + aw;

    let ports = AddressGeneratorPorts {
        address_rdy_out: entity.add_port(format!("{}_address_rdy_out", s), 1, PortDirection::Out),
        address_stall_in: entity.add_port(format!("{}_address_stall_in", s), 1, PortDirection::In),
        base_out: (0..geometry.address_channels)
            .map(|c| entity.add_port(format!("{}_base_out_{}", s, c), aw, PortDirection::Out))
            .collect(),
        count_out: (0..geometry.address_channels)
            .map(|c| entity.add_port(format!("{}_count_out_{}", s, c), config.count_width, PortDirection::Out))
            .collect(),
        state_register: format!("{}_address_state", s),
        states: layout.states().len(),
    };

    let bank = handler.bank(format!("{}_address", s), cw);
    bank.declare(entity);
    handler.declare_runtime_ports(entity, cw);

    let factor: Vec<String> = (0..axes)
        .map(|k| entity.add_signal(format!("{}_factor_{}", s, k), aw))
        .collect();
    let sum = |c: usize, k: usize| format!("{}_sum_{}_{}", s, c, k);
    let product = |c: usize, k: usize| format!("{}_product_{}_{}", s, c, k);
    for c in 0..geometry.address_channels {
        for k in 0..axes {
            entity.add_signal(sum(c, k), cw);
            entity.add_signal(product(c, k), pw);
        }
        entity.add_signal(format!("{}_count_s1_{}", s, c), config.count_width);
        entity.add_signal(format!("{}_count_s2_{}", s, c), config.count_width);
    }
    let s1_valid = entity.add_signal(format!("{}_s1_valid", s), 1);
    let s2_valid = entity.add_signal(format!("{}_s2_valid", s), 1);

    let mut p = Process::new(format!("{}_address_proc", s));
    bank.reset_into(&mut p);
    let factor_tmp = p.variable(format!("{}_factor_tmp", s), pw);

    let mut sm = StateMachine::new(ports.state_register.clone());
    let states = layout.states();
    let ids: Vec<_> = states
        .iter()
        .map(|&st| sm.add_state(layout.state_name(geometry, st)))
        .collect();
    let id_of = |st: AddressState| states.iter().position(|&x| x == st).map(|i| ids[i]);

    let done = bank.done_condition();
    let row = bank.should_increment(geometry.innermost_accessed())?;
    let increment = bank.increment_statement().to_vec();
    let goto_states = sm.clone();
    let goto = |st: AddressState| match id_of(st) {
        Some(id) => goto_states.goto(id),
        None => Stmt::assign(ports.state_register.clone(), Expr::State("S_DONE".to_string())),
    };

    // factors known at generation time, `None` once a runtime bound is involved
    let mut known: Vec<Option<i64>> = vec![None; axes];
    for (i, &st) in states.iter().enumerate() {
        let mut arm = Vec::new();
        match st {
            AddressState::Initialize(j) => {
                let k = axes - 1 - j;
                if k == axes - 1 {
                    known[k] = Some(1);
                    arm.push(Stmt::assign(&factor[k], Expr::int(1)));
                } else {
                    let inner = k + 1;
                    let extra = window[inner] as i64 - 1;
                    match handler.end_value(&geometry.access_order[inner])? {
                        EndValue::Infinite => {
                            known[k] = Some(-1);
                            arm.push(Stmt::assign(&factor[k], Expr::int(-1)));
                        }
                        _ if known[inner] == Some(-1) => {
                            known[k] = Some(-1);
                            arm.push(Stmt::assign(&factor[k], Expr::int(-1)));
                        }
                        EndValue::Constant { value } if known[inner].is_some() => {
                            let f = known[inner].unwrap_or(1) * (value + extra);
                            known[k] = Some(f);
                            arm.push(Stmt::assign(&factor[k], Expr::int(f)));
                        }
                        end => {
                            let extent = match end {
                                EndValue::Runtime { port } => Expr::name(port.clone()) + Expr::int(extra),
                                EndValue::Constant { value } => {
                                    let name = entity.add_signal(format!("{}_extent_{}", s, inner), cw);
                                    entity.connect(&name, Expr::int(value + extra));
                                    Expr::Name(name)
                                }
                                EndValue::Infinite => Expr::int(-1),
                            };
                            arm.push(Stmt::assign(&factor_tmp, Expr::name(&factor[inner]) * extent));
                            arm.push(Stmt::assign(
                                &factor[k],
                                Expr::Slice {
                                    name: factor_tmp.clone(),
                                    hi: aw - 1,
                                    lo: 0,
                                },
                            ));
                        }
                    }
                }
            }
            AddressState::Window(_) | AddressState::Step(_) => {
                if let Some((rows, range)) = layout.batch(st) {
                    for (c, r) in rows.iter().enumerate() {
                        for (k, axis) in geometry.access_order.iter().enumerate() {
                            let offset = if k + 1 == axes { range.start } else { r[k] };
                            arm.push(Stmt::assign(
                                sum(c, k),
                                bank.counter_expr(axis)? + Expr::int(offset as i64),
                            ));
                        }
                        arm.push(Stmt::assign(
                            format!("{}_count_s1_{}", s, c),
                            Expr::int(range.len() as i64),
                        ));
                    }
                    arm.push(Stmt::assign(&s1_valid, Expr::Bit(true)));
                }
            }
            AddressState::Done => {}
        }
        if st != AddressState::Done {
            arm.extend(lower_edges(&layout.edges(st), &done, &row, &increment, &goto));
        }
        sm.extend(ids[i], arm);
    }
    sm.declare(entity);

    let mut running = Vec::new();
    for c in 0..geometry.address_channels {
        let total = p.variable(format!("{}_total_{}", s, c), pw);
        let products = (0..axes).map(|k| Expr::name(product(c, k)));
        let sum_expr = products
            .reduce(|a, b| a + b)
            .unwrap_or(Expr::int(0));
        running.push(Stmt::assign(&total, sum_expr));
        running.push(Stmt::assign(
            &ports.base_out[c],
            Expr::Slice {
                name: total,
                hi: aw - 1,
                lo: 0,
            },
        ));
        running.push(Stmt::assign(
            &ports.count_out[c],
            Expr::name(format!("{}_count_s2_{}", s, c)),
        ));
    }
    running.push(Stmt::assign(&ports.address_rdy_out, Expr::name(&s2_valid)));
    for c in 0..geometry.address_channels {
        for k in 0..axes {
            running.push(Stmt::assign(
                product(c, k),
                Expr::name(sum(c, k)) * Expr::name(&factor[k]),
            ));
        }
        running.push(Stmt::assign(
            format!("{}_count_s2_{}", s, c),
            Expr::name(format!("{}_count_s1_{}", s, c)),
        ));
    }
    running.push(Stmt::assign(&s2_valid, Expr::name(&s1_valid)));
    running.push(Stmt::assign(&s1_valid, Expr::Bit(false)));
    running.push(sm.into_case());

    p.push(Stmt::when_else(
        Expr::low(&ports.address_stall_in),
        running,
        vec![Stmt::assign(&ports.address_rdy_out, Expr::Bit(false))],
    ));
    entity.add_process(p);

    debug!(
        "Address generator {}: {} states, {} channels, factors known {:?}",
        s, ports.states, geometry.address_channels, known
    );
    Ok(ports)
}
