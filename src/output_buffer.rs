//! Output smart buffer
//!
//! The datapath pushes complete output windows into a datapath-side
//! MicroFifo. For each window the buffer waits in `S_READY` until one is
//! available, loads it in `S_READ`, then emits elements toward memory
//! through an outgoing MicroFifo: the step region on every iteration, and
//! the rest of the window only when the row ends. Window slots without a
//! computed value are loaded from constant filler bindings instead.
//!
//! The emitted element order matches the bursts of the output address
//! generator: row by row within each region, step region first.

use std::collections::BTreeMap;

use log::debug;
use serde::Serialize;

use crate::descriptor::FillerBinding;
use crate::error::{SynthesisError, SynthesisResult};
use crate::fifo::{emit_micro_fifo, map_input_and_output_vector, FifoParams, FifoSignals, MicroFifo};
use crate::geometry::{coordinate_suffix, BufferArena, Region, StreamGeometry};
use crate::hardware::SynthesisConfig;
use crate::interface::{OutputChannel, ProducerChannel};
use crate::liv::{lower_edges, select_edge, Edge, Guard, LivHandler, LoopNestState};
use crate::netlist::{Entity, Expr, Process, StateMachine, Stmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputBufferState {
    /// Waiting for a datapath window
    Ready,
    /// Loading the window just read
    Read,
    Step(usize),
    Window(usize),
    Done,
}

/// State layout and transition rules shared by the model and the netlist
#[derive(Debug, Clone)]
pub struct OutputBufferLayout {
    step: Vec<Vec<Vec<usize>>>,
    window: Vec<Vec<Vec<usize>>>,
}

impl OutputBufferLayout {
    pub fn new(geometry: &StreamGeometry) -> Self {
        Self {
            step: geometry.element_batches(Region::Step),
            window: geometry.element_batches(Region::Window),
        }
    }

    pub fn states(&self) -> Vec<OutputBufferState> {
        [OutputBufferState::Ready, OutputBufferState::Read]
            .into_iter()
            .chain((0..self.step.len()).map(OutputBufferState::Step))
            .chain((0..self.window.len()).map(OutputBufferState::Window))
            .chain(std::iter::once(OutputBufferState::Done))
            .collect()
    }

    pub fn edges(&self, state: OutputBufferState) -> Vec<Edge<OutputBufferState>> {
        use OutputBufferState::*;
        match state {
            Ready => vec![Edge::goto(Read)],
            Read => vec![Edge::goto(Step(0))],
            Step(i) if i + 1 < self.step.len() => vec![Edge::goto(Step(i + 1))],
            Window(i) if i + 1 < self.window.len() => vec![Edge::goto(Window(i + 1))],
            Step(_) if !self.window.is_empty() => vec![
                Edge::new(Guard::row_continues(true), Ready, true),
                Edge::new(Guard::ALWAYS, Window(0), false),
            ],
            Step(_) | Window(_) => vec![
                Edge::new(Guard::done(true), Done, false),
                Edge::new(Guard::ALWAYS, Ready, true),
            ],
            Done => vec![Edge::goto(Done)],
        }
    }

    pub fn batch(&self, state: OutputBufferState) -> Option<(Region, &[Vec<usize>])> {
        match state {
            OutputBufferState::Step(i) => Some((Region::Step, self.step.get(i)?)),
            OutputBufferState::Window(i) => Some((Region::Window, self.window.get(i)?)),
            _ => None,
        }
    }

    pub fn state_name(&self, state: OutputBufferState) -> String {
        match state {
            OutputBufferState::Ready => "S_READY".to_string(),
            OutputBufferState::Read => "S_READ".to_string(),
            OutputBufferState::Done => "S_DONE".to_string(),
            _ => match self.batch(state) {
                Some((region, batch)) => {
                    let first = batch.first().map(Vec::as_slice).unwrap_or(&[]);
                    format!("S_{}_{}", region.label(), coordinate_suffix(first))
                }
                None => "S_DONE".to_string(),
            },
        }
    }
}

/// Datapath-side MicroFifo sizing
pub fn datapath_fifo_params(geometry: &StreamGeometry, config: &SynthesisConfig) -> SynthesisResult<FifoParams> {
    sized(
        geometry,
        geometry.data_width * geometry.elements() as u32,
        config.datapath_fifo_almost_full,
    )
}

/// Memory-side MicroFifo sizing: room for every lane plus two in flight
pub fn outgoing_fifo_params(geometry: &StreamGeometry) -> SynthesisResult<FifoParams> {
    sized(
        geometry,
        geometry.data_width * geometry.num_channels as u32,
        geometry.num_channels + 2,
    )
}

fn sized(geometry: &StreamGeometry, data_width: u32, threshold: usize) -> SynthesisResult<FifoParams> {
    FifoParams::sized_above(data_width, threshold).ok_or_else(|| {
        SynthesisError::configuration(
            &geometry.stream_id,
            format!("a MicroFifo holding back {} entries is too large", threshold),
        )
    })
}

/// Resolve filler coordinates to buffer slots
fn filler_slots(geometry: &StreamGeometry, fillers: &[FillerBinding]) -> SynthesisResult<Vec<(usize, i64)>> {
    let slots = BufferArena::for_stream(geometry, ());
    fillers
        .iter()
        .map(|f| Ok((slots.index(&f.coordinate)?, f.value)))
        .collect()
}

/// Outputs of one clock edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBufferTick<T> {
    /// Datapath-side full flag before the edge
    pub dp_full_out: bool,
    /// The datapath window offered on this edge was stored
    pub accepted: bool,
    /// Word handed to the memory side on this edge
    pub data_out: Option<Vec<T>>,
    pub empty_out: bool,
}

/// Cycle-level model of a generated output smart buffer
#[derive(Debug, Clone)]
pub struct OutputSmartBuffer<'a, T> {
    geometry: &'a StreamGeometry,
    layout: OutputBufferLayout,
    nest: LoopNestState<'a>,
    arena: BufferArena<T>,
    fillers: Vec<(usize, i64)>,
    state: OutputBufferState,
    loaded: Option<Vec<T>>,
    dp_fifo: MicroFifo<Vec<T>>,
    out_fifo: MicroFifo<Vec<T>>,
}

impl<'a, T: Clone + From<i64>> OutputSmartBuffer<'a, T> {
    pub fn new(
        geometry: &'a StreamGeometry,
        handler: &'a LivHandler,
        bindings: &BTreeMap<String, i64>,
        fillers: &[FillerBinding],
        config: &SynthesisConfig,
    ) -> SynthesisResult<Self> {
        config.validate(&geometry.stream_id)?;
        Ok(Self {
            geometry,
            layout: OutputBufferLayout::new(geometry),
            nest: LoopNestState::new(handler, bindings)?,
            arena: BufferArena::for_stream(geometry, T::from(0)),
            fillers: filler_slots(geometry, fillers)?,
            state: OutputBufferState::Ready,
            loaded: None,
            dp_fifo: MicroFifo::new(datapath_fifo_params(geometry, config)?),
            out_fifo: MicroFifo::new(outgoing_fifo_params(geometry)?),
        })
    }

    pub fn state(&self) -> OutputBufferState {
        self.state
    }

    /// Done with every element handed to the memory side
    pub fn is_done(&self) -> bool {
        self.state == OutputBufferState::Done && self.out_fifo.occupancy() == 0
    }

    pub fn dp_full_out(&self) -> bool {
        self.dp_fifo.full_out()
    }

    fn take_transition(&mut self) -> SynthesisResult<()> {
        let edges = self.layout.edges(self.state);
        let done = self.nest.done_condition();
        let row = self.nest.should_increment(self.geometry.innermost_accessed())?;
        if let Some(edge) = select_edge(&edges, done, row) {
            if edge.increment {
                self.nest.advance();
            }
            self.state = edge.next;
        }
        Ok(())
    }

    /// One clock edge. `window` is `Some` when the datapath asserts valid;
    /// it must hold one value per buffer element in row-major order.
    pub fn tick(&mut self, window: Option<Vec<T>>, read_enable_in: bool) -> SynthesisResult<OutputBufferTick<T>> {
        if let Some(w) = &window {
            if w.len() != self.arena.len() {
                return Err(SynthesisError::configuration(
                    &self.geometry.stream_id,
                    format!("expected a window of {} values, got {}", self.arena.len(), w.len()),
                ));
            }
        }
        let dp_full_out = self.dp_fifo.full_out();
        let mut dp_read = false;
        let mut push = None;

        match self.state {
            OutputBufferState::Ready => {
                if !self.dp_fifo.empty_out() {
                    dp_read = true;
                    self.take_transition()?;
                }
            }
            OutputBufferState::Read => {
                if let Some(word) = self.loaded.take() {
                    let coords = self.geometry.all_coordinates();
                    for (coord, value) in coords.iter().zip(word) {
                        self.arena.set(coord, value)?;
                    }
                    for &(slot, value) in &self.fillers {
                        let coord = &coords[slot];
                        self.arena.set(coord, T::from(value))?;
                    }
                }
                self.take_transition()?;
            }
            OutputBufferState::Step(_) | OutputBufferState::Window(_) => {
                if !self.out_fifo.full_out() {
                    if let Some((_, batch)) = self.layout.batch(self.state) {
                        let lanes = batch
                            .iter()
                            .map(|c| self.arena.get(c).cloned())
                            .collect::<SynthesisResult<Vec<_>>>()?;
                        push = Some(lanes);
                    }
                    self.take_transition()?;
                }
            }
            OutputBufferState::Done => {}
        }

        let dp = self.dp_fifo.tick(window, dp_read);
        if dp.data_out.is_some() {
            self.loaded = dp.data_out;
        }
        let out = self.out_fifo.tick(push, read_enable_in);
        Ok(OutputBufferTick {
            dp_full_out,
            accepted: dp.accepted,
            data_out: out.data_out,
            empty_out: out.empty_out,
        })
    }
}

/// Signals of a generated output smart buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputBufferPorts {
    pub state_register: String,
    pub done_state: String,
    pub states: usize,
    pub elements: Vec<String>,
    pub datapath_fifo: FifoSignals,
    pub outgoing_fifo: FifoSignals,
}

/// Generate the output smart buffer of `geometry` into `entity`
///
/// Returns any MicroFifo component entities that are too large to inline.
pub fn create_vhdl(
    entity: &mut Entity,
    handler: &LivHandler,
    geometry: &StreamGeometry,
    fillers: &[FillerBinding],
    datapath: &ProducerChannel,
    memory: &OutputChannel,
    config: &SynthesisConfig,
) -> SynthesisResult<(OutputBufferPorts, Vec<Entity>)> {
    let s = geometry.stream_id.as_str();
    config.validate(s)?;
    if memory.data_out.len() != geometry.num_channels {
        return Err(SynthesisError::configuration(
            s,
            format!(
                "memory interface has {} lanes for {} channels",
                memory.data_out.len(),
                geometry.num_channels
            ),
        ));
    }
    let layout = OutputBufferLayout::new(geometry);
    let dw = geometry.data_width;
    let coords = geometry.all_coordinates();
    let fillers = filler_slots(geometry, fillers)?;
    let mut components = Vec::new();

    let mut names = BufferArena::for_stream(geometry, String::new());
    for coord in &coords {
        let name = entity.add_signal(geometry.element_name(coord), dw);
        names.set(coord, name)?;
    }
    let elements = names.values().to_vec();

    let (dp_fifo, component) = emit_micro_fifo(
        entity,
        &format!("{}_dp_fifo", s),
        datapath_fifo_params(geometry, config)?,
        config,
    );
    components.extend(component);
    let dp_word: Vec<String> = (0..elements.len())
        .map(|i| entity.add_signal(format!("{}_dp_word_{}", s, i), dw))
        .collect();
    map_input_and_output_vector(entity, &dp_fifo, &datapath.data_in, &dp_word, dw);
    entity.connect(&dp_fifo.valid_in, Expr::name(&datapath.valid_in));
    entity.connect(&datapath.full_out, Expr::name(&dp_fifo.full_out));

    let (out_fifo, component) = emit_micro_fifo(
        entity,
        &format!("{}_out_fifo", s),
        outgoing_fifo_params(geometry)?,
        config,
    );
    components.extend(component);
    let out_lane: Vec<String> = (0..geometry.num_channels)
        .map(|c| entity.add_signal(format!("{}_out_lane_{}", s, c), dw))
        .collect();
    map_input_and_output_vector(entity, &out_fifo, &out_lane, &memory.data_out, dw);
    entity.connect(&out_fifo.read_enable_in, Expr::name(&memory.read_enable_in));
    entity.connect(&memory.empty_out, Expr::name(&out_fifo.empty_out));
    let out_valid = entity.add_signal(format!("{}_out_valid", s), 1);
    entity.connect(&out_fifo.valid_in, Expr::name(&out_valid));

    let bank = handler.bank(format!("{}_buff", s), config.counter_width);
    bank.declare(entity);
    handler.declare_runtime_ports(entity, config.counter_width);
    let done = bank.done_condition();
    let row = bank.should_increment(geometry.innermost_accessed())?;
    let increment = bank.increment_statement().to_vec();

    let mut sm = StateMachine::new(format!("{}_buff_state", s));
    let states = layout.states();
    let ids: Vec<_> = states
        .iter()
        .map(|&st| sm.add_state(layout.state_name(st)))
        .collect();
    let names_sm = sm.clone();
    let goto = |st: OutputBufferState| {
        let i = states.iter().position(|&x| x == st).unwrap_or(states.len() - 1);
        names_sm.goto(ids[i])
    };
    let ready_id = ids[0];

    entity.flag(
        &dp_fifo.read_enable_in,
        names_sm.is_in(ready_id).and(Expr::low(&dp_fifo.empty_out)),
    );

    for (i, &st) in states.iter().enumerate() {
        let edges = lower_edges(&layout.edges(st), &done, &row, &increment, &goto);
        let arm = match st {
            OutputBufferState::Ready => vec![Stmt::when(Expr::low(&dp_fifo.empty_out), edges)],
            OutputBufferState::Read => {
                let mut arm: Vec<Stmt> = elements
                    .iter()
                    .zip(&dp_word)
                    .enumerate()
                    .map(|(slot, (element, word))| {
                        let value = match fillers.iter().find(|(f, _)| *f == slot) {
                            Some((_, v)) => Expr::int(*v),
                            None => Expr::name(word),
                        };
                        Stmt::assign(element, value)
                    })
                    .collect();
                arm.extend(edges);
                arm
            }
            OutputBufferState::Step(_) | OutputBufferState::Window(_) => {
                let mut body = Vec::new();
                if let Some((_, batch)) = layout.batch(st) {
                    for (lane, coord) in batch.iter().enumerate() {
                        body.push(Stmt::assign(&out_lane[lane], Expr::name(names.get(coord)?)));
                    }
                }
                body.push(Stmt::assign(&out_valid, Expr::Bit(true)));
                body.extend(edges);
                vec![Stmt::when(Expr::low(&out_fifo.full_out), body)]
            }
            OutputBufferState::Done => Vec::new(),
        };
        sm.extend(ids[i], arm);
    }
    sm.declare(entity);

    let ports = OutputBufferPorts {
        state_register: sm.register().to_string(),
        done_state: "S_DONE".to_string(),
        states: sm.len(),
        elements,
        datapath_fifo: dp_fifo,
        outgoing_fifo: out_fifo,
    };

    let mut p = Process::new(format!("{}_buff_proc", s));
    bank.reset_into(&mut p);
    p.push(Stmt::assign(&out_valid, Expr::Bit(false)));
    p.push(sm.into_case());
    entity.add_process(p);

    debug!(
        "Output smart buffer {}: {} states, {} fillers, {} components",
        s,
        ports.states,
        fillers.len(),
        components.len()
    );
    Ok((ports, components))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EndValue, LivDescriptor, LoopNest, StreamDescriptor, StreamDirection};
    use crate::interface::FifoInterfaceBlock;
    use pretty_assertions::assert_eq;

    fn line(end: i64) -> LivHandler {
        LivHandler::from_nest(&LoopNest::perfect(
            "line",
            vec![LivDescriptor::new("x", 1, EndValue::constant(end))],
        ))
        .unwrap()
    }

    fn run(sb: &mut OutputSmartBuffer<'_, i64>, windows: Vec<Vec<i64>>) -> Vec<i64> {
        let mut pending = windows.into_iter().peekable();
        let mut out = Vec::new();
        for _ in 0..300 {
            let offer = if sb.dp_full_out() { None } else { pending.peek().cloned() };
            let tick = sb.tick(offer, true).unwrap();
            if tick.accepted {
                pending.next();
            }
            if let Some(word) = tick.data_out {
                out.extend(word);
            }
        }
        assert!(pending.peek().is_none());
        out
    }

    #[test]
    fn test_step_every_iteration_tail_at_row_end() {
        let h = line(3);
        let stream = StreamDescriptor::new("B", StreamDirection::Output, &[("x", 2)], 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let mut sb = OutputSmartBuffer::new(&g, &h, &BTreeMap::new(), &[], &SynthesisConfig::default()).unwrap();
        let out = run(&mut sb, vec![vec![10, 11], vec![20, 21], vec![30, 31]]);
        assert_eq!(out, vec![10, 20, 30, 31]);
        assert!(sb.is_done());
    }

    #[test]
    fn test_fillers_replace_datapath_values() {
        let h = line(2);
        let mut stream = StreamDescriptor::new("B", StreamDirection::Output, &[("x", 3)], 1);
        stream.fillers.push(FillerBinding {
            coordinate: vec![2],
            value: -1,
        });
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let mut sb =
            OutputSmartBuffer::new(&g, &h, &BTreeMap::new(), &stream.fillers, &SynthesisConfig::default()).unwrap();
        let out = run(&mut sb, vec![vec![1, 2, 3], vec![4, 5, 6]]);
        assert_eq!(out, vec![1, 4, 5, -1]);
    }

    #[test]
    fn test_unknown_filler_coordinate() {
        let h = line(2);
        let mut stream = StreamDescriptor::new("B", StreamDirection::Output, &[("x", 3)], 1);
        stream.fillers.push(FillerBinding {
            coordinate: vec![3],
            value: 0,
        });
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let err = OutputSmartBuffer::<i64>::new(&g, &h, &BTreeMap::new(), &stream.fillers, &SynthesisConfig::default())
            .unwrap_err();
        assert!(matches!(err, SynthesisError::CoordinateNotFound { coordinate, .. } if coordinate == vec![3]));
    }

    #[test]
    fn test_fifo_sizing() {
        let h = line(4);
        let stream = StreamDescriptor::new("B", StreamDirection::Output, &[("x", 2)], 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let out = outgoing_fifo_params(&g).unwrap();
        assert_eq!(out.capacity(), 4);
        assert_eq!(out.almost_full, 3);
        let dp = datapath_fifo_params(&g, &SynthesisConfig::default()).unwrap();
        assert_eq!(dp.almost_full, 5);
        assert_eq!(dp.capacity(), 8);
    }

    #[test]
    fn test_datapath_fifo_without_margin_rejected() {
        let h = line(4);
        let stream = StreamDescriptor::new("B", StreamDirection::Output, &[("x", 2)], 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let config = SynthesisConfig {
            datapath_fifo_almost_full: 0,
            ..SynthesisConfig::default()
        };
        let err = OutputSmartBuffer::<i64>::new(&g, &h, &BTreeMap::new(), &[], &config).unwrap_err();
        assert!(matches!(err, SynthesisError::Configuration { stream, .. } if stream == "B"));
    }

    #[test]
    fn test_oversized_lane_count_is_an_error() {
        let h = line(4);
        let stream = StreamDescriptor::new("B", StreamDirection::Output, &[("x", 2)], 1);
        let mut g = StreamGeometry::resolve(&stream, &h).unwrap();
        g.num_channels = 1 << 20;
        assert!(matches!(outgoing_fifo_params(&g), Err(SynthesisError::Configuration { .. })));
    }

    #[test]
    fn test_generated_netlist() {
        let h = line(8);
        let mut stream = StreamDescriptor::new("B", StreamDirection::Output, &[("x", 3)], 1);
        stream.fillers.push(FillerBinding {
            coordinate: vec![2],
            value: 7,
        });
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let mut e = Entity::new("top", "clk", "rst");
        let dp = FifoInterfaceBlock::new("B", 3, 32).initialize_producer_interface_ports(&mut e);
        let mem = FifoInterfaceBlock::new("B", 1, 32).initialize_output_interface_ports(&mut e);
        let (ports, components) =
            create_vhdl(&mut e, &h, &g, &stream.fillers, &dp, &mem, &SynthesisConfig::default()).unwrap();
        assert!(components.is_empty());
        // ready, read, 1 step, 2 window, done
        assert_eq!(ports.states, 6);
        assert!(e.multiply_driven().is_empty());
        let vhdl = e.to_vhdl();
        assert!(vhdl.contains("(S_READY, S_READ, S_STEP_0, S_WINDOW_1, S_WINDOW_2, S_DONE)"));
        assert!(vhdl.contains("B_2 <= conv_std_logic_vector(7, 32);"));
        assert!(vhdl.contains("B_0 <= B_dp_word_0;"));
        assert!(vhdl.contains("B_out_lane_0 <= B_1;"));
        assert!(vhdl.contains("B_dp_fifo_read_enable_in <= '1' when ((B_buff_state = S_READY) and (B_dp_fifo_empty_out = '0')) else '0';"));
    }
}
