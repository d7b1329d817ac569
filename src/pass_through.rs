//! Pass-through streams
//!
//! When every window extent is 1 nothing needs buffering, so the memory and
//! datapath interfaces are wired straight together. Completion is still
//! tracked by a bare counter bank that advances once per transfer. Transfers
//! reach the bank through a short delay line.

use std::collections::{BTreeMap, VecDeque};

use log::debug;
use serde::Serialize;

use crate::error::{SynthesisError, SynthesisResult};
use crate::geometry::StreamGeometry;
use crate::hardware::SynthesisConfig;
use crate::interface::{wire_producer_through, wire_through, InputChannel, OutputChannel, ProducerChannel};
use crate::liv::{lower_edges, select_edge, Edge, Guard, LivHandler, LoopNestState};
use crate::netlist::{Entity, Expr, Process, StateMachine, Stmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassThroughState {
    Ready,
    Done,
}

impl PassThroughState {
    pub fn name(self) -> &'static str {
        match self {
            PassThroughState::Ready => "S_READY",
            PassThroughState::Done => "S_DONE",
        }
    }
}

fn edges(state: PassThroughState) -> Vec<Edge<PassThroughState>> {
    match state {
        PassThroughState::Ready => vec![
            Edge::new(Guard::done(true), PassThroughState::Done, false),
            Edge::new(Guard::ALWAYS, PassThroughState::Ready, true),
        ],
        PassThroughState::Done => vec![Edge::goto(PassThroughState::Done)],
    }
}

fn check_lanes(geometry: &StreamGeometry) -> SynthesisResult<()> {
    if !geometry.is_pass_through() {
        return Err(SynthesisError::configuration(
            &geometry.stream_id,
            "stream is windowed and needs a smart buffer",
        ));
    }
    if geometry.num_channels != 1 {
        return Err(SynthesisError::ChannelMismatch {
            stream: geometry.stream_id.clone(),
            region: "window".to_string(),
            channels: geometry.num_channels,
            count: 1,
            unit: "elements",
        });
    }
    Ok(())
}

/// Cycle-level model of pass-through done detection
#[derive(Debug, Clone)]
pub struct DoneCounter<'a> {
    nest: LoopNestState<'a>,
    delay: VecDeque<bool>,
    state: PassThroughState,
}

impl<'a> DoneCounter<'a> {
    pub fn new(
        handler: &'a LivHandler,
        bindings: &BTreeMap<String, i64>,
        config: &SynthesisConfig,
    ) -> SynthesisResult<Self> {
        Ok(Self {
            nest: LoopNestState::new(handler, bindings)?,
            delay: std::iter::repeat(false).take(config.pass_through_done_delay).collect(),
            state: PassThroughState::Ready,
        })
    }

    pub fn state(&self) -> PassThroughState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == PassThroughState::Done
    }

    /// Iteration position of the bank
    pub fn nest(&self) -> &LoopNestState<'a> {
        &self.nest
    }

    /// One clock edge; `transfer` is high when a value crossed this cycle
    pub fn tick(&mut self, transfer: bool) -> bool {
        let seen = match self.delay.back() {
            Some(&oldest) => oldest,
            None => transfer,
        };
        if seen {
            let done = self.nest.done_condition();
            if let Some(edge) = select_edge(&edges(self.state), done, false) {
                if edge.increment {
                    self.nest.advance();
                }
                self.state = edge.next;
            }
        }
        if !self.delay.is_empty() {
            self.delay.pop_back();
            self.delay.push_front(transfer);
        }
        self.is_done()
    }
}

/// Outputs of one clock edge of a pass-through input stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassThroughTick<T> {
    pub data_out: Option<T>,
    pub empty_out: bool,
    pub done: bool,
}

/// Cycle-level model of a pass-through input stream
#[derive(Debug, Clone)]
pub struct PassThroughStream<'a> {
    counter: DoneCounter<'a>,
}

impl<'a> PassThroughStream<'a> {
    pub fn new(
        geometry: &StreamGeometry,
        handler: &'a LivHandler,
        bindings: &BTreeMap<String, i64>,
        config: &SynthesisConfig,
    ) -> SynthesisResult<Self> {
        check_lanes(geometry)?;
        Ok(Self {
            counter: DoneCounter::new(handler, bindings, config)?,
        })
    }

    pub fn is_done(&self) -> bool {
        self.counter.is_done()
    }

    /// Forward upstream to the datapath on cycles where it reads
    pub fn tick<T>(&mut self, upstream: &mut VecDeque<T>, read_enable_in: bool) -> PassThroughTick<T> {
        let empty_out = upstream.is_empty();
        let data_out = if read_enable_in { upstream.pop_front() } else { None };
        let done = self.counter.tick(data_out.is_some());
        PassThroughTick {
            data_out,
            empty_out,
            done,
        }
    }
}

/// Signals of generated pass-through done detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassThroughPorts {
    pub state_register: String,
    pub done_state: String,
    pub states: usize,
    pub delay_line: Vec<String>,
}

fn create_done_counter(
    entity: &mut Entity,
    handler: &LivHandler,
    geometry: &StreamGeometry,
    transfer: Expr,
    config: &SynthesisConfig,
) -> SynthesisResult<PassThroughPorts> {
    let s = geometry.stream_id.as_str();
    let bank = handler.bank(format!("{}_pass", s), config.counter_width);
    bank.declare(entity);
    handler.declare_runtime_ports(entity, config.counter_width);

    let delay_line: Vec<String> = (0..config.pass_through_done_delay)
        .map(|i| entity.add_signal(format!("{}_transfer_{}", s, i), 1))
        .collect();
    let mut p = Process::new(format!("{}_pass_proc", s));
    bank.reset_into(&mut p);
    let seen = match delay_line.first() {
        Some(first) => {
            p.push(Stmt::when_else(
                transfer,
                vec![Stmt::assign(first, Expr::Bit(true))],
                vec![Stmt::assign(first, Expr::Bit(false))],
            ));
            for pair in delay_line.windows(2) {
                p.push(Stmt::assign(&pair[1], Expr::name(&pair[0])));
            }
            delay_line.last().map(Expr::high).unwrap_or(Expr::Bool(false))
        }
        None => transfer,
    };

    let mut sm = StateMachine::new(format!("{}_pass_state", s));
    let ready = sm.add_state(PassThroughState::Ready.name());
    let done_id = sm.add_state(PassThroughState::Done.name());
    let names_sm = sm.clone();
    let goto = |st: PassThroughState| match st {
        PassThroughState::Ready => names_sm.goto(ready),
        PassThroughState::Done => names_sm.goto(done_id),
    };
    let done = bank.done_condition();
    let increment = bank.increment_statement().to_vec();
    let arm = lower_edges(
        &edges(PassThroughState::Ready),
        &done,
        &Expr::Bool(false),
        &increment,
        &goto,
    );
    sm.push(ready, Stmt::when(seen, arm));
    sm.declare(entity);

    let ports = PassThroughPorts {
        state_register: sm.register().to_string(),
        done_state: PassThroughState::Done.name().to_string(),
        states: sm.len(),
        delay_line,
    };
    p.push(sm.into_case());
    entity.add_process(p);
    debug!(
        "Pass-through {}: done detection {} cycles behind the last transfer",
        s, config.pass_through_done_delay
    );
    Ok(ports)
}

/// Wire a pass-through input stream from `memory` to `datapath`
pub fn create_input_vhdl(
    entity: &mut Entity,
    handler: &LivHandler,
    geometry: &StreamGeometry,
    memory: &InputChannel,
    datapath: &OutputChannel,
    config: &SynthesisConfig,
) -> SynthesisResult<PassThroughPorts> {
    check_lanes(geometry)?;
    wire_through(entity, memory, datapath);
    create_done_counter(entity, handler, geometry, memory.transfer(), config)
}

/// Wire a pass-through output stream from `datapath` to `memory`
pub fn create_output_vhdl(
    entity: &mut Entity,
    handler: &LivHandler,
    geometry: &StreamGeometry,
    datapath: &ProducerChannel,
    memory: &OutputChannel,
    config: &SynthesisConfig,
) -> SynthesisResult<PassThroughPorts> {
    check_lanes(geometry)?;
    wire_producer_through(entity, datapath, memory);
    create_done_counter(entity, handler, geometry, datapath.transfer(), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EndValue, LivDescriptor, LoopNest, StreamDescriptor, StreamDirection};
    use crate::interface::FifoInterfaceBlock;
    use pretty_assertions::assert_eq;

    fn nest() -> LivHandler {
        LivHandler::from_nest(&LoopNest::perfect(
            "copy",
            vec![
                LivDescriptor::new("i", 1, EndValue::constant(2)),
                LivDescriptor::new("j", 1, EndValue::constant(3)),
            ],
        ))
        .unwrap()
    }

    fn geometry(h: &LivHandler) -> StreamGeometry {
        let stream = StreamDescriptor::new("P", StreamDirection::Input, &[("i", 1), ("j", 1)], 1);
        StreamGeometry::resolve(&stream, h).unwrap()
    }

    #[test]
    fn test_forwarding_is_identity_and_done_follows_last_transfer() {
        let h = nest();
        let g = geometry(&h);
        let config = SynthesisConfig::default();
        let mut stream = PassThroughStream::new(&g, &h, &BTreeMap::new(), &config).unwrap();
        let pushed: Vec<u8> = vec![9, 8, 7, 6, 5, 4];
        let mut upstream: VecDeque<u8> = pushed.iter().copied().collect();
        let mut out = Vec::new();
        let mut done_at = None;
        for cycle in 0..20 {
            let tick = stream.tick(&mut upstream, cycle % 2 == 0);
            out.extend(tick.data_out);
            if tick.done && done_at.is_none() {
                done_at = Some(cycle);
            }
        }
        assert_eq!(out, pushed);
        // last transfer on cycle 10, counted 4 cycles later
        assert_eq!(done_at, Some(14));
    }

    #[test]
    fn test_counter_walks_every_iteration() {
        let h = nest();
        let config = SynthesisConfig {
            pass_through_done_delay: 0,
            ..SynthesisConfig::default()
        };
        let mut counter = DoneCounter::new(&h, &BTreeMap::new(), &config).unwrap();
        let mut seen = Vec::new();
        while !counter.is_done() {
            seen.push(counter.nest().counters().to_vec());
            counter.tick(true);
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(seen.last(), Some(&vec![1, 2]));
    }

    #[test]
    fn test_windowed_stream_rejected() {
        let h = nest();
        let stream = StreamDescriptor::new("W", StreamDirection::Input, &[("j", 2)], 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        assert!(PassThroughStream::new(&g, &h, &BTreeMap::new(), &SynthesisConfig::default()).is_err());
    }

    #[test]
    fn test_generated_wiring() {
        let h = nest();
        let g = geometry(&h);
        let mut e = Entity::new("top", "clk", "rst");
        let block = FifoInterfaceBlock::new("P", 1, 32);
        let memory = block.initialize_input_interface_ports(&mut e);
        let datapath = block.initialize_gated_output_interface(&mut e);
        let ports = create_input_vhdl(&mut e, &h, &g, &memory, &datapath, &SynthesisConfig::default()).unwrap();
        assert_eq!(ports.states, 2);
        assert_eq!(ports.delay_line.len(), 4);
        assert!(e.multiply_driven().is_empty());
        let vhdl = e.to_vhdl();
        assert!(vhdl.contains("P_data_out_0 <= P_data_in_0;"));
        assert!(vhdl.contains("P_transfer_3 <= P_transfer_2;"));
        assert!(vhdl.contains("when S_READY =>"));
        assert!(vhdl.contains("P_pass_state <= S_DONE;"));
        assert!(vhdl.contains("if ((P_read_enable_out = '1') and (P_empty_in = '0')) then"));
    }

    #[test]
    fn test_output_counts_accepted_producer_words() {
        let h = nest();
        let stream = StreamDescriptor::new("Q", StreamDirection::Output, &[("i", 1), ("j", 1)], 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let mut e = Entity::new("top", "clk", "rst");
        let datapath = FifoInterfaceBlock::new("Q", 1, 32).initialize_producer_interface_ports(&mut e);
        let memory = FifoInterfaceBlock::new("Q", 1, 32).initialize_output_interface_ports(&mut e);
        create_output_vhdl(&mut e, &h, &g, &datapath, &memory, &SynthesisConfig::default()).unwrap();
        assert!(e.multiply_driven().is_empty());
        let vhdl = e.to_vhdl();
        assert!(vhdl.contains("Q_data_out_0 <= Q_dp_data_in_0;"));
        assert!(vhdl.contains("if ((Q_dp_valid_in = '1') and (Q_dp_full_out = '0')) then"));
    }
}
