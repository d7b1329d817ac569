//! MicroFifo: small synchronous FIFO with almost-full/almost-empty flags
//!
//! The behavioral [`MicroFifo`] is the reference model; [`emit_micro_fifo`]
//! generates the register-level version. Small FIFOs are generated inline as
//! a register file in the parent entity. FIFOs holding more than
//! [`SynthesisConfig::fifo_inline_limit`] bits become a separate
//! `MicroFifo` entity with generics that is instantiated as a component.
//! Both behave identically.

use std::collections::VecDeque;

use log::{debug, warn};
use serde::Serialize;

use crate::hardware::SynthesisConfig;
use crate::netlist::{Entity, Expr, Instance, Port, PortDirection, Process, Stmt};

/// Widest MicroFifo address the generator emits
pub const MAX_ADDRESS_WIDTH: u32 = 16;

/// Sizing of one MicroFifo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FifoParams {
    pub data_width: u32,
    pub address_width: u32,
    pub almost_full: usize,
    pub almost_empty: usize,
}

impl FifoParams {
    pub fn new(data_width: u32, address_width: u32, almost_full: usize, almost_empty: usize) -> Self {
        Self {
            data_width,
            address_width,
            almost_full,
            almost_empty,
        }
    }

    /// Smallest FIFO with room for `threshold` entries plus one, flagging
    /// full once `threshold` are held back from capacity. `None` when that
    /// needs more than [`MAX_ADDRESS_WIDTH`] address bits.
    pub fn sized_above(data_width: u32, threshold: usize) -> Option<Self> {
        let address_width = (0..=MAX_ADDRESS_WIDTH).find(|&w| (1usize << w) > threshold)?;
        Some(Self::new(data_width, address_width, threshold, 0))
    }

    pub fn capacity(&self) -> usize {
        1usize.checked_shl(self.address_width).unwrap_or(usize::MAX)
    }

    /// Storage in bits
    pub fn bits(&self) -> usize {
        (self.data_width as usize).saturating_mul(self.capacity())
    }
}

/// Flags and data after one clock edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FifoTick<T> {
    /// Registered head value, present on the cycle after a pop
    pub data_out: Option<T>,
    pub full_out: bool,
    pub empty_out: bool,
    /// The write on this edge was stored
    pub accepted: bool,
}

/// Behavioral MicroFifo
#[derive(Debug, Clone)]
pub struct MicroFifo<T> {
    params: FifoParams,
    items: VecDeque<T>,
}

impl<T: Clone> MicroFifo<T> {
    pub fn new(params: FifoParams) -> Self {
        Self {
            params,
            items: VecDeque::new(),
        }
    }

    pub fn params(&self) -> FifoParams {
        self.params
    }

    pub fn occupancy(&self) -> usize {
        self.items.len()
    }

    pub fn full_out(&self) -> bool {
        self.items.len().saturating_add(self.params.almost_full) >= self.params.capacity()
    }

    pub fn empty_out(&self) -> bool {
        self.items.len() <= self.params.almost_empty
    }

    /// Oldest stored value
    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    /// One clock edge. `data_in` is `Some` when `valid_in` is asserted.
    /// A write is stored unless the FIFO is completely full; a read pops
    /// when anything is stored.
    pub fn tick(&mut self, data_in: Option<T>, read_enable_in: bool) -> FifoTick<T> {
        let push = data_in.is_some() && self.items.len() < self.params.capacity();
        let data_out = if read_enable_in {
            self.items.pop_front()
        } else {
            None
        };
        let accepted = match data_in {
            Some(v) if push => {
                self.items.push_back(v);
                true
            }
            _ => false,
        };
        FifoTick {
            data_out,
            full_out: self.full_out(),
            empty_out: self.empty_out(),
            accepted,
        }
    }
}

/// Names of the signals through which a generated FIFO is used
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FifoSignals {
    pub valid_in: String,
    pub data_in: String,
    pub full_out: String,
    pub read_enable_in: String,
    pub data_out: String,
    pub empty_out: String,
}

impl FifoSignals {
    fn prefixed(prefix: &str) -> Self {
        Self {
            valid_in: format!("{}_valid_in", prefix),
            data_in: format!("{}_data_in", prefix),
            full_out: format!("{}_full_out", prefix),
            read_enable_in: format!("{}_read_enable_in", prefix),
            data_out: format!("{}_data_out", prefix),
            empty_out: format!("{}_empty_out", prefix),
        }
    }

    fn declare(&self, entity: &mut Entity, width: u32) {
        entity.add_signal(&self.valid_in, 1);
        entity.add_signal(&self.data_in, width);
        entity.add_signal(&self.full_out, 1);
        entity.add_signal(&self.read_enable_in, 1);
        entity.add_signal(&self.data_out, width);
        entity.add_signal(&self.empty_out, 1);
    }
}

/// Storage, pointers and flags of one FIFO inside `entity`
fn build_fifo(
    entity: &mut Entity,
    prefix: &str,
    io: &FifoSignals,
    params: FifoParams,
    full_threshold: Expr,
    empty_threshold: Expr,
) {
    let capacity = params.capacity() as i64;
    let mem = entity.add_array(format!("{}_mem", prefix), params.capacity(), params.data_width);
    let wr = entity.add_signal(format!("{}_wr_ptr", prefix), params.address_width.max(1));
    let rd = entity.add_signal(format!("{}_rd_ptr", prefix), params.address_width.max(1));
    let count = entity.add_signal(format!("{}_count", prefix), params.address_width + 1);

    entity.flag(&io.full_out, Expr::name(&count).ge(full_threshold));
    entity.flag(&io.empty_out, Expr::name(&count).le(empty_threshold));

    let mut p = Process::new(format!("{}_proc", prefix));
    let push = p.variable(format!("{}_push", prefix), 1);
    let pop = p.variable(format!("{}_pop", prefix), 1);
    p.push(Stmt::assign(&push, Expr::Bit(false)));
    p.push(Stmt::assign(&pop, Expr::Bit(false)));
    p.push(Stmt::when(
        Expr::high(&io.valid_in).and(Expr::name(&count).ne_to(Expr::int(capacity))),
        vec![
            Stmt::assign_element(&mem, Expr::name(&wr), Expr::name(&io.data_in)),
            Stmt::assign(&wr, Expr::name(&wr) + Expr::int(1)),
            Stmt::assign(&push, Expr::Bit(true)),
        ],
    ));
    p.push(Stmt::when(
        Expr::high(&io.read_enable_in).and(Expr::name(&count).ne_to(Expr::int(0))),
        vec![
            Stmt::assign(
                &io.data_out,
                Expr::Element {
                    array: mem.clone(),
                    index: Box::new(Expr::name(&rd)),
                },
            ),
            Stmt::assign(&rd, Expr::name(&rd) + Expr::int(1)),
            Stmt::assign(&pop, Expr::Bit(true)),
        ],
    ));
    p.push(Stmt::when_else(
        Expr::high(&push).and(Expr::low(&pop)),
        vec![Stmt::assign(&count, Expr::name(&count) + Expr::int(1))],
        vec![Stmt::when(
            Expr::low(&push).and(Expr::high(&pop)),
            vec![Stmt::assign(&count, Expr::name(&count) - Expr::int(1))],
        )],
    ));
    entity.add_process(p);
}

/// Name of the separately generated entity for `params`
pub fn component_name(params: FifoParams) -> String {
    format!("MicroFifo{}x{}", params.data_width, params.capacity())
}

/// Standalone FIFO entity with sizing generics
pub fn component_entity(params: FifoParams, config: &SynthesisConfig) -> Entity {
    let mut e = Entity::new(component_name(params), &config.clock, &config.reset);
    e.generics = component_generics(params);
    let io = FifoSignals {
        valid_in: e.add_port("valid_in", 1, PortDirection::In),
        data_in: e.add_port("data_in", params.data_width, PortDirection::In),
        full_out: e.add_port("full_out", 1, PortDirection::Out),
        read_enable_in: e.add_port("read_enable_in", 1, PortDirection::In),
        data_out: e.add_port("data_out", params.data_width, PortDirection::Out),
        empty_out: e.add_port("empty_out", 1, PortDirection::Out),
    };
    build_fifo(
        &mut e,
        "fifo",
        &io,
        params,
        Expr::int(params.capacity() as i64) - Expr::name("ALMOST_FULL_COUNT"),
        Expr::name("ALMOST_EMPTY_COUNT"),
    );
    e
}

fn component_generics(params: FifoParams) -> Vec<(String, i64)> {
    vec![
        ("ADDRESS_WIDTH".to_string(), params.address_width as i64),
        ("DATA_WIDTH".to_string(), params.data_width as i64),
        ("ALMOST_FULL_COUNT".to_string(), params.almost_full as i64),
        ("ALMOST_EMPTY_COUNT".to_string(), params.almost_empty as i64),
    ]
}

/// Generate a MicroFifo named `prefix` inside `entity`
///
/// Returns the handshake signals and, when the FIFO is too large to inline,
/// the component entity the caller must add to the design.
pub fn emit_micro_fifo(
    entity: &mut Entity,
    prefix: &str,
    params: FifoParams,
    config: &SynthesisConfig,
) -> (FifoSignals, Option<Entity>) {
    let io = FifoSignals::prefixed(prefix);
    io.declare(entity, params.data_width);

    if params.bits() <= config.fifo_inline_limit {
        debug!(
            "MicroFifo {}: {} x {} bits inline",
            prefix,
            params.capacity(),
            params.data_width
        );
        build_fifo(
            entity,
            prefix,
            &io,
            params,
            Expr::int((params.capacity() - params.almost_full.min(params.capacity())) as i64),
            Expr::int(params.almost_empty as i64),
        );
        return (io, None);
    }

    warn!(
        "MicroFifo {} holds {} bits, above the inline limit of {}; emitting component {}",
        prefix,
        params.bits(),
        config.fifo_inline_limit,
        component_name(params)
    );
    let component = component_entity(params, config);
    let ports: Vec<Port> = component.ports.clone();
    let port_map = vec![
        (config.clock.clone(), config.clock.clone()),
        (config.reset.clone(), config.reset.clone()),
        ("valid_in".to_string(), io.valid_in.clone()),
        ("data_in".to_string(), io.data_in.clone()),
        ("full_out".to_string(), io.full_out.clone()),
        ("read_enable_in".to_string(), io.read_enable_in.clone()),
        ("data_out".to_string(), io.data_out.clone()),
        ("empty_out".to_string(), io.empty_out.clone()),
    ];
    entity.instantiate(Instance {
        label: format!("{}_inst", prefix),
        component: component.name.clone(),
        generics: component_generics(params),
        ports,
        port_map,
    });
    (io, Some(component))
}

/// Pack `inputs` into the FIFO word (first input in the low bits) and
/// unpack the FIFO output word into `outputs`
pub fn map_input_and_output_vector(
    entity: &mut Entity,
    fifo: &FifoSignals,
    inputs: &[String],
    outputs: &[String],
    width: u32,
) {
    if !inputs.is_empty() {
        let parts: Vec<Expr> = inputs.iter().rev().map(Expr::name).collect();
        let word = if parts.len() == 1 {
            parts.into_iter().next().unwrap_or(Expr::Int(0))
        } else {
            Expr::Concat(parts)
        };
        entity.connect(&fifo.data_in, word);
    }
    for (i, out) in outputs.iter().enumerate() {
        let lo = i as u32 * width;
        entity.connect(
            out,
            Expr::Slice {
                name: fifo.data_out.clone(),
                hi: lo + width - 1,
                lo,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fifo_order_under_backpressure() {
        let mut fifo = MicroFifo::new(FifoParams::new(8, 2, 1, 0));
        let mut next = 0;
        let mut popped = Vec::new();
        for cycle in 0..40 {
            let write = if fifo.full_out() { None } else { Some(next) };
            let read = cycle % 3 == 0;
            let tick = fifo.tick(write, read);
            if tick.accepted {
                next += 1;
            }
            if let Some(v) = tick.data_out {
                popped.push(v);
            }
            assert!(fifo.occupancy() <= fifo.params().capacity());
        }
        assert!(next > fifo.params().capacity());
        let expected: Vec<usize> = (0..popped.len()).collect();
        assert_eq!(popped, expected);
    }

    #[test]
    fn test_full_out_threshold() {
        let mut fifo = MicroFifo::new(FifoParams::new(8, 3, 2, 0));
        for v in 0..8 {
            let full_before = fifo.full_out();
            assert_eq!(full_before, fifo.occupancy() >= 6);
            let tick = fifo.tick(Some(v), false);
            assert!(tick.accepted);
        }
        assert!(fifo.full_out());
        assert!(!fifo.tick(Some(99), false).accepted);
        assert_eq!(fifo.peek(), Some(&0));
    }

    #[test]
    fn test_empty_out_threshold() {
        let mut fifo = MicroFifo::new(FifoParams::new(8, 3, 0, 1));
        assert!(fifo.empty_out());
        fifo.tick(Some(1), false);
        assert!(fifo.empty_out());
        fifo.tick(Some(2), false);
        assert!(!fifo.empty_out());
        let tick = fifo.tick(None, true);
        assert_eq!(tick.data_out, Some(1));
        assert!(tick.empty_out);
    }

    #[test]
    fn test_sized_above() {
        let p = FifoParams::sized_above(16, 3).unwrap();
        assert_eq!(p.capacity(), 4);
        let p = FifoParams::sized_above(16, 4).unwrap();
        assert_eq!(p.capacity(), 8);
        assert_eq!(p.almost_full, 4);
        assert_eq!(FifoParams::sized_above(16, 1 << MAX_ADDRESS_WIDTH), None);
        assert_eq!(FifoParams::sized_above(16, usize::MAX), None);
        assert_eq!(FifoParams::new(8, 200, 2, 0).capacity(), usize::MAX);
    }

    #[test]
    fn test_inline_and_component_strategies() {
        let config = SynthesisConfig::default();
        let mut top = Entity::new("top", "clk", "rst");
        let (io, component) = emit_micro_fifo(&mut top, "A_fifo", FifoParams::new(32, 3, 2, 0), &config);
        assert!(component.is_none());
        assert_eq!(io.full_out, "A_fifo_full_out");
        assert!(top.signal("A_fifo_mem").is_some());
        assert!(top.multiply_driven().is_empty());

        let big = FifoParams::new(512, 5, 2, 0);
        assert!(big.bits() > config.fifo_inline_limit);
        let (_, component) = emit_micro_fifo(&mut top, "B_fifo", big, &config);
        let component = component.unwrap();
        assert_eq!(component.name, "MicroFifo512x32");
        assert_eq!(top.instances.len(), 1);
        assert!(top.signal("B_fifo_mem").is_none());
        let vhdl = component.to_vhdl();
        assert!(vhdl.contains("ALMOST_FULL_COUNT : integer := 2"));
    }

    #[test]
    fn test_wide_word_mapping() {
        let mut top = Entity::new("top", "clk", "rst");
        let io = FifoSignals::prefixed("w");
        io.declare(&mut top, 24);
        let ins: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let outs: Vec<String> = vec!["x".into(), "y".into(), "z".into()];
        map_input_and_output_vector(&mut top, &io, &ins, &outs, 8);
        let vhdl = top.to_vhdl();
        assert!(vhdl.contains("w_data_in <= (c & b & a);"));
        assert!(vhdl.contains("y <= w_data_out(15 downto 8);"));
    }
}
