//! Input smart buffer
//!
//! Holds the sliding window of an input stream in registers. At the start of
//! a row the window region is prefilled; after that every iteration only
//! loads the step region, shifting each row toward slot 0 and writing the
//! new element into the last slot. Once the last step element of an
//! iteration is in, the whole window is published into a MicroFifo toward
//! the datapath.
//!
//! Upstream words are read whenever the MicroFifo has room and upstream is
//! not empty; the data arrives one cycle later, flagged by a delayed copy of
//! the read enable. The state machine only moves on cycles where data
//! arrives. Reading stops once the word completing the last window is in,
//! so nothing past the nest is taken from a shared upstream.

use std::collections::{BTreeMap, VecDeque};

use log::debug;
use serde::Serialize;

use crate::error::{SynthesisError, SynthesisResult};
use crate::fifo::{emit_micro_fifo, map_input_and_output_vector, FifoParams, FifoSignals, MicroFifo};
use crate::geometry::{coordinate_suffix, BufferArena, Region, StreamGeometry};
use crate::hardware::SynthesisConfig;
use crate::interface::{InputChannel, OutputChannel};
use crate::liv::{lower_edges, select_edge, Edge, Guard, LivHandler, LoopNestState};
use crate::netlist::{Entity, Expr, Process, StateMachine, Stmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputBufferState {
    Window(usize),
    Step(usize),
    Done,
}

/// State layout and transition rules shared by the model and the netlist
#[derive(Debug, Clone)]
pub struct InputBufferLayout {
    window: Vec<Vec<Vec<usize>>>,
    step: Vec<Vec<Vec<usize>>>,
}

impl InputBufferLayout {
    pub fn new(geometry: &StreamGeometry) -> Self {
        Self {
            window: geometry.element_batches(Region::Window),
            step: geometry.element_batches(Region::Step),
        }
    }

    pub fn states(&self) -> Vec<InputBufferState> {
        (0..self.window.len())
            .map(InputBufferState::Window)
            .chain((0..self.step.len()).map(InputBufferState::Step))
            .chain(std::iter::once(InputBufferState::Done))
            .collect()
    }

    pub fn row_start(&self) -> InputBufferState {
        if self.window.is_empty() {
            InputBufferState::Step(0)
        } else {
            InputBufferState::Window(0)
        }
    }

    pub fn edges(&self, state: InputBufferState) -> Vec<Edge<InputBufferState>> {
        use InputBufferState::*;
        match state {
            Window(i) if i + 1 < self.window.len() => vec![Edge::goto(Window(i + 1))],
            Window(_) => vec![Edge::goto(Step(0))],
            Step(i) if i + 1 < self.step.len() => vec![Edge::goto(Step(i + 1))],
            Step(_) => vec![
                Edge::new(Guard::done(true), Done, false),
                Edge::new(Guard::row_continues(true), Step(0), true),
                Edge::new(Guard::ALWAYS, self.row_start(), true),
            ],
            Done => vec![Edge::goto(Done)],
        }
    }

    pub fn batch(&self, state: InputBufferState) -> Option<(Region, &[Vec<usize>])> {
        match state {
            InputBufferState::Window(i) => Some((Region::Window, self.window.get(i)?)),
            InputBufferState::Step(i) => Some((Region::Step, self.step.get(i)?)),
            InputBufferState::Done => None,
        }
    }

    /// The last step state completes a window
    pub fn publishes(&self, state: InputBufferState) -> bool {
        state == InputBufferState::Step(self.step.len().saturating_sub(1))
    }

    pub fn state_name(&self, state: InputBufferState) -> String {
        match self.batch(state) {
            Some((region, batch)) => {
                let first = batch.first().map(Vec::as_slice).unwrap_or(&[]);
                format!("S_{}_{}", region.label(), coordinate_suffix(first))
            }
            None => "S_DONE".to_string(),
        }
    }
}

/// Slot a prefill element is stored in before the step shifts move it home
fn prefill_slot(coord: &[usize], step_extent: usize) -> Vec<usize> {
    let mut slot = coord.to_vec();
    if let Some(last) = slot.last_mut() {
        *last += step_extent;
    }
    slot
}

/// Step elements of one batch grouped by row, lanes in arrival order
fn rows_of(batch: &[Vec<usize>]) -> Vec<(Vec<usize>, Vec<usize>)> {
    let mut rows: Vec<(Vec<usize>, Vec<usize>)> = Vec::new();
    for (lane, coord) in batch.iter().enumerate() {
        let row = coord[..coord.len() - 1].to_vec();
        match rows.iter_mut().find(|(r, _)| *r == row) {
            Some((_, lanes)) => lanes.push(lane),
            None => rows.push((row, vec![lane])),
        }
    }
    rows
}

/// Outputs of one clock edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBufferTick<T> {
    pub read_enable_out: bool,
    /// Window handed to the datapath on this edge
    pub data_out: Option<Vec<T>>,
    pub empty_out: bool,
}

/// Cycle-level model of a generated input smart buffer
#[derive(Debug, Clone)]
pub struct InputSmartBuffer<'a, T> {
    geometry: &'a StreamGeometry,
    layout: InputBufferLayout,
    nest: LoopNestState<'a>,
    arena: BufferArena<T>,
    state: InputBufferState,
    in_flight: Option<Vec<T>>,
    publish: Option<Vec<T>>,
    fifo: MicroFifo<Vec<T>>,
}

impl<'a, T: Clone> InputSmartBuffer<'a, T> {
    pub fn new(
        geometry: &'a StreamGeometry,
        handler: &'a LivHandler,
        bindings: &BTreeMap<String, i64>,
        fill: T,
        config: &SynthesisConfig,
    ) -> SynthesisResult<Self> {
        config.validate(&geometry.stream_id)?;
        let layout = InputBufferLayout::new(geometry);
        let params = FifoParams::new(
            geometry.data_width * geometry.elements() as u32,
            config.input_fifo_address_width,
            config.input_fifo_almost_full,
            config.input_fifo_almost_empty,
        );
        Ok(Self {
            geometry,
            state: layout.row_start(),
            layout,
            nest: LoopNestState::new(handler, bindings)?,
            arena: BufferArena::for_stream(geometry, fill),
            in_flight: None,
            publish: None,
            fifo: MicroFifo::new(params),
        })
    }

    pub fn state(&self) -> InputBufferState {
        self.state
    }

    /// Current buffer contents in row-major order
    pub fn window(&self) -> &[T] {
        self.arena.values()
    }

    /// Done with no window still on its way into the MicroFifo
    pub fn is_done(&self) -> bool {
        self.state == InputBufferState::Done && self.publish.is_none()
    }

    /// Windows waiting for the datapath
    pub fn pending(&self) -> usize {
        self.fifo.occupancy()
    }

    fn store(&mut self, region: Region, batch: &[Vec<usize>], word: Vec<T>) -> SynthesisResult<()> {
        if word.len() != batch.len() {
            return Err(SynthesisError::configuration(
                &self.geometry.stream_id,
                format!("expected {} data lanes, got {}", batch.len(), word.len()),
            ));
        }
        let step = self.geometry.step();
        let step_extent = step.last().copied().unwrap_or(1);
        for (coord, value) in batch.iter().zip(word) {
            match region {
                Region::Window => self.arena.set(&prefill_slot(coord, step_extent), value)?,
                Region::Step => self.arena.shift_row(&coord[..coord.len() - 1], value)?,
            }
        }
        Ok(())
    }

    /// One clock edge. `upstream` is the memory-side FIFO, one word of
    /// `num_channels` lanes per entry.
    pub fn tick(
        &mut self,
        upstream: &mut VecDeque<Vec<T>>,
        read_enable_in: bool,
    ) -> SynthesisResult<InputBufferTick<T>> {
        let valid = self.in_flight.take();
        let finishing = valid.is_some() && self.layout.publishes(self.state) && self.nest.done_condition();
        let read_enable_out = self.state != InputBufferState::Done
            && !finishing
            && !(self.fifo.full_out() || upstream.is_empty());
        if read_enable_out {
            self.in_flight = upstream.pop_front();
        }

        let mut published = None;
        if let Some(word) = valid {
            if let Some((region, batch)) = self.layout.batch(self.state) {
                let batch = batch.to_vec();
                self.store(region, &batch, word)?;
                if self.layout.publishes(self.state) {
                    published = Some(self.arena.values().to_vec());
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
            }
        }

        let fifo = self.fifo.tick(self.publish.take(), read_enable_in);
        self.publish = published;
        Ok(InputBufferTick {
            read_enable_out,
            data_out: fifo.data_out,
            empty_out: fifo.empty_out,
        })
    }
}

/// Signals of a generated input smart buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputBufferPorts {
    pub state_register: String,
    pub done_state: String,
    pub states: usize,
    pub elements: Vec<String>,
    pub fifo: FifoSignals,
}

/// Generate the input smart buffer of `geometry` into `entity`
///
/// `memory` carries `num_channels` lanes from the memory side and `datapath`
/// one lane per buffer element. Returns the MicroFifo component entity when
/// the FIFO is too large to inline.
pub fn create_vhdl(
    entity: &mut Entity,
    handler: &LivHandler,
    geometry: &StreamGeometry,
    memory: &InputChannel,
    datapath: &OutputChannel,
    config: &SynthesisConfig,
) -> SynthesisResult<(InputBufferPorts, Option<Entity>)> {
    let s = geometry.stream_id.as_str();
    config.validate(s)?;
    if memory.data_in.len() != geometry.num_channels {
        return Err(SynthesisError::configuration(
            s,
            format!(
                "memory interface has {} lanes for {} channels",
                memory.data_in.len(),
                geometry.num_channels
            ),
        ));
    }
    let layout = InputBufferLayout::new(geometry);
    let dw = geometry.data_width;
    let window = geometry.window();
    let row_len = geometry.row_len();
    let step_extent = geometry.step().last().copied().unwrap_or(1);

    let mut names = BufferArena::for_stream(geometry, String::new());
    for coord in geometry.all_coordinates() {
        let name = entity.add_signal(geometry.element_name(&coord), dw);
        names.set(&coord, name)?;
    }
    let elements = names.values().to_vec();

    let params = FifoParams::new(
        dw * elements.len() as u32,
        config.input_fifo_address_width,
        config.input_fifo_almost_full,
        config.input_fifo_almost_empty,
    );
    let (fifo, component) = emit_micro_fifo(entity, &format!("{}_fifo", s), params, config);
    map_input_and_output_vector(entity, &fifo, &elements, &datapath.data_out, dw);
    entity.connect(&fifo.read_enable_in, Expr::name(&datapath.read_enable_in));
    entity.connect(&datapath.empty_out, Expr::name(&fifo.empty_out));

    let read_enable = entity.add_signal(format!("{}_read_enable", s), 1);
    entity.connect(&memory.read_enable_out, Expr::name(&read_enable));
    let valid = entity.add_signal(format!("{}_valid", s), 1);
    let publish = entity.add_signal(format!("{}_publish", s), 1);
    entity.connect(&fifo.valid_in, Expr::name(&publish));

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
    let goto = |st: InputBufferState| {
        let i = states.iter().position(|&x| x == st).unwrap_or(states.len() - 1);
        names_sm.goto(ids[i])
    };

    for (i, &st) in states.iter().enumerate() {
        let Some((region, batch)) = layout.batch(st) else {
            continue;
        };
        let mut arm = Vec::new();
        match region {
            Region::Window => {
                for (lane, coord) in batch.iter().enumerate() {
                    let slot = prefill_slot(coord, step_extent);
                    arm.push(Stmt::assign(
                        names.get(&slot)?,
                        Expr::name(&memory.data_in[lane]),
                    ));
                }
            }
            Region::Step => {
                for (row_coord, lanes) in rows_of(batch) {
                    let k = lanes.len();
                    let at = |x: usize| {
                        let mut c = row_coord.clone();
                        c.push(x);
                        c
                    };
                    for x in 0..row_len - k {
                        arm.push(Stmt::assign(
                            names.get(&at(x))?,
                            Expr::name(names.get(&at(x + k))?),
                        ));
                    }
                    for (t, lane) in lanes.iter().enumerate() {
                        arm.push(Stmt::assign(
                            names.get(&at(row_len - k + t))?,
                            Expr::name(&memory.data_in[*lane]),
                        ));
                    }
                }
            }
        }
        if layout.publishes(st) {
            arm.push(Stmt::assign(&publish, Expr::Bit(true)));
        }
        arm.extend(lower_edges(&layout.edges(st), &done, &row, &increment, &goto));
        sm.extend(ids[i], arm);
    }
    sm.declare(entity);

    let last_step = states
        .iter()
        .position(|&st| layout.publishes(st))
        .map(|i| sm.is_in(ids[i]))
        .unwrap_or(Expr::Bool(false));
    let finishing = Expr::high(&valid).and(last_step).and(done.clone());
    let in_done = Expr::name(sm.register()).eq_to(Expr::State("S_DONE".to_string()));
    entity.flag(
        &read_enable,
        (!Expr::high(&fifo.full_out).or(Expr::high(&memory.empty_in)))
            .and(!in_done)
            .and(!finishing),
    );

    let ports = InputBufferPorts {
        state_register: sm.register().to_string(),
        done_state: "S_DONE".to_string(),
        states: sm.len(),
        elements,
        fifo,
    };

    let mut p = Process::new(format!("{}_buff_proc", s));
    bank.reset_into(&mut p);
    p.push(Stmt::assign(&valid, Expr::name(&read_enable)));
    p.push(Stmt::assign(&publish, Expr::Bit(false)));
    p.push(Stmt::when(Expr::high(&valid), vec![sm.into_case()]));
    entity.add_process(p);

    debug!(
        "Input smart buffer {}: window {:?}, {} states, {} elements",
        s,
        window,
        ports.states,
        ports.elements.len()
    );
    Ok((ports, component))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EndValue, LivDescriptor, LoopNest, StreamDescriptor, StreamDirection};
    use crate::interface::FifoInterfaceBlock;
    use pretty_assertions::assert_eq;

    fn line_nest(end: i64) -> LivHandler {
        LivHandler::from_nest(&LoopNest::perfect(
            "line",
            vec![LivDescriptor::new("x", 1, EndValue::constant(end))],
        ))
        .unwrap()
    }

    fn drain<T: Clone>(sb: &mut InputSmartBuffer<'_, T>, mut words: VecDeque<Vec<T>>) -> Vec<Vec<T>> {
        let mut out = Vec::new();
        for _ in 0..200 {
            let tick = sb.tick(&mut words, true).unwrap();
            out.extend(tick.data_out);
        }
        out
    }

    #[test]
    fn test_sliding_window_1d() {
        let h = line_nest(4);
        let stream = StreamDescriptor::new("A", StreamDirection::Input, &[("x", 3)], 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let mut sb = InputSmartBuffer::new(&g, &h, &BTreeMap::new(), 0, &SynthesisConfig::default()).unwrap();
        // prefill 0, 1 then one new element per iteration
        let words: VecDeque<Vec<i32>> = (0..6).map(|v| vec![v]).collect();
        let windows = drain(&mut sb, words);
        assert_eq!(
            windows,
            vec![vec![0, 1, 2], vec![1, 2, 3], vec![2, 3, 4], vec![3, 4, 5]]
        );
        assert!(sb.is_done());
    }

    #[test]
    fn test_datapath_backpressure_holds_reads() {
        let h = line_nest(20);
        let stream = StreamDescriptor::new("A", StreamDirection::Input, &[("x", 2)], 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let mut sb = InputSmartBuffer::new(&g, &h, &BTreeMap::new(), 0, &SynthesisConfig::default()).unwrap();
        let mut words: VecDeque<Vec<i32>> = (0..21).map(|v| vec![v]).collect();
        for _ in 0..50 {
            sb.tick(&mut words, false).unwrap();
            assert!(sb.pending() <= 8);
        }
        // the MicroFifo filled up and reading stopped
        assert!(!words.is_empty());
        let mut out = Vec::new();
        for _ in 0..200 {
            out.extend(sb.tick(&mut words, true).unwrap().data_out);
        }
        let expected: Vec<Vec<i32>> = (0..20).map(|x| vec![x, x + 1]).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_reads_stop_after_last_window() {
        let h = line_nest(4);
        let stream = StreamDescriptor::new("A", StreamDirection::Input, &[("x", 3)], 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let mut sb = InputSmartBuffer::new(&g, &h, &BTreeMap::new(), 0, &SynthesisConfig::default()).unwrap();
        let mut words: VecDeque<Vec<i32>> = (0..9).map(|v| vec![v]).collect();
        let mut windows = Vec::new();
        for _ in 0..50 {
            let tick = sb.tick(&mut words, true).unwrap();
            if sb.state() == InputBufferState::Done {
                assert!(!tick.read_enable_out);
            }
            windows.extend(tick.data_out);
        }
        assert_eq!(windows.len(), 4);
        // words 6, 7 and 8 belong to whoever shares the upstream
        assert_eq!(words, VecDeque::from(vec![vec![6], vec![7], vec![8]]));
    }

    #[test]
    fn test_fifo_without_publish_margin_rejected() {
        let h = line_nest(20);
        let stream = StreamDescriptor::new("A", StreamDirection::Input, &[("x", 2)], 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let config = SynthesisConfig {
            input_fifo_almost_full: 0,
            ..SynthesisConfig::default()
        };
        let err = InputSmartBuffer::new(&g, &h, &BTreeMap::new(), 0, &config).unwrap_err();
        assert!(matches!(err, SynthesisError::Configuration { stream, .. } if stream == "A"));

        let mut e = Entity::new("top", "clk", "rst");
        let memory = FifoInterfaceBlock::new("A", 1, 32).initialize_input_interface_ports(&mut e);
        let datapath = FifoInterfaceBlock::new("A", 2, 32).initialize_gated_output_interface(&mut e);
        assert!(create_vhdl(&mut e, &h, &g, &memory, &datapath, &config).is_err());
    }

    #[test]
    fn test_two_channel_step() {
        let h = LivHandler::from_nest(&LoopNest::perfect(
            "wide",
            vec![LivDescriptor::new("x", 2, EndValue::constant(4))],
        ))
        .unwrap();
        let stream = StreamDescriptor::new("A", StreamDirection::Input, &[("x", 4)], 2).with_channels(2, 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let mut sb = InputSmartBuffer::new(&g, &h, &BTreeMap::new(), 0, &SynthesisConfig::default()).unwrap();
        let words: VecDeque<Vec<i32>> = vec![vec![0, 1], vec![2, 3], vec![4, 5]].into();
        let windows = drain(&mut sb, words);
        assert_eq!(windows, vec![vec![0, 1, 2, 3], vec![2, 3, 4, 5]]);
    }

    #[test]
    fn test_generated_netlist() {
        let h = LivHandler::from_nest(&LoopNest::perfect(
            "n",
            vec![
                LivDescriptor::new("y", 1, EndValue::constant(4)),
                LivDescriptor::new("x", 1, EndValue::constant(4)),
            ],
        ))
        .unwrap();
        let stream = StreamDescriptor::new("A", StreamDirection::Input, &[("y", 3), ("x", 3)], 1)
            .with_data_width(8);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let mut e = Entity::new("top", "clk", "rst");
        let memory = FifoInterfaceBlock::new("A", 1, 8).initialize_input_interface_ports(&mut e);
        let datapath = FifoInterfaceBlock::new("A", 9, 8).initialize_gated_output_interface(&mut e);
        let (ports, component) =
            create_vhdl(&mut e, &h, &g, &memory, &datapath, &SynthesisConfig::default()).unwrap();
        assert!(component.is_none());
        assert_eq!(ports.elements.len(), 9);
        assert_eq!(ports.elements[5], "A_1_2");
        // 6 prefill + 3 step + done
        assert_eq!(ports.states, 10);
        assert!(e.multiply_driven().is_empty());
        let vhdl = e.to_vhdl();
        assert!(vhdl.contains("A_read_enable <= '1' when (((not ((A_fifo_full_out = '1') or (A_empty_in = '1'))) and (not (A_buff_state = S_DONE))) and (not (((A_valid = '1') and (A_buff_state = S_STEP_2_2)) and "));
        assert!(vhdl.contains("A_valid <= A_read_enable;"));
        assert!(vhdl.contains("when S_STEP_0_2 =>"));
        assert!(vhdl.contains("A_0_0 <= A_0_1;"));
        assert!(vhdl.contains("A_0_2 <= A_data_in_0;"));
        // prefill of offset 0 lands one slot further in
        assert!(vhdl.contains("A_1_1 <= A_data_in_0;"));
    }
}
