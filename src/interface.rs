//! FIFO handshake interfaces
//!
//! Every stream talks to its neighbours through one of three channel shapes:
//!
//! - [`InputChannel`]: reads from an upstream FIFO (`data_in`, `empty_in`,
//!   `read_enable_out`)
//! - [`OutputChannel`]: is read like a FIFO by a downstream consumer
//!   (`data_out`, `empty_out`, `read_enable_in`)
//! - [`ProducerChannel`]: is written like a FIFO by an upstream producer
//!   (`valid_in`, `data_in`, `full_out`)
//!
//! A value moves across an input or output channel on every cycle where the
//! read enable is high and empty is low, and across a producer channel when
//! valid is high and full is low.

use serde::Serialize;

use crate::netlist::{Entity, Expr, PortDirection};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputChannel {
    pub data_in: Vec<String>,
    pub empty_in: String,
    pub read_enable_out: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputChannel {
    pub data_out: Vec<String>,
    pub empty_out: String,
    pub read_enable_in: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerChannel {
    pub valid_in: String,
    pub data_in: Vec<String>,
    pub full_out: String,
}

/// Creates the handshake ports of one stream
#[derive(Debug, Clone)]
pub struct FifoInterfaceBlock {
    stream_id: String,
    lanes: usize,
    width: u32,
}

impl FifoInterfaceBlock {
    pub fn new(stream_id: impl Into<String>, lanes: usize, width: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            lanes,
            width,
        }
    }

    fn data_ports(&self, entity: &mut Entity, stem: &str, direction: PortDirection) -> Vec<String> {
        (0..self.lanes)
            .map(|i| entity.add_port(format!("{}_{}_{}", self.stream_id, stem, i), self.width, direction))
            .collect()
    }

    /// `{s}_data_in_{i}`, `{s}_empty_in`, `{s}_read_enable_out`
    pub fn initialize_input_interface_ports(&self, entity: &mut Entity) -> InputChannel {
        InputChannel {
            data_in: self.data_ports(entity, "data_in", PortDirection::In),
            empty_in: entity.add_port(format!("{}_empty_in", self.stream_id), 1, PortDirection::In),
            read_enable_out: entity.add_port(
                format!("{}_read_enable_out", self.stream_id),
                1,
                PortDirection::Out,
            ),
        }
    }

    /// `{s}_data_out_{i}`, `{s}_empty_out`, `{s}_read_enable_in`
    pub fn initialize_output_interface_ports(&self, entity: &mut Entity) -> OutputChannel {
        OutputChannel {
            data_out: self.data_ports(entity, "data_out", PortDirection::Out),
            empty_out: entity.add_port(format!("{}_empty_out", self.stream_id), 1, PortDirection::Out),
            read_enable_in: entity.add_port(
                format!("{}_read_enable_in", self.stream_id),
                1,
                PortDirection::In,
            ),
        }
    }

    /// Output data ports whose flow control stays internal, to be merged
    /// with sibling streams
    pub fn initialize_gated_output_interface(&self, entity: &mut Entity) -> OutputChannel {
        OutputChannel {
            data_out: self.data_ports(entity, "data_out", PortDirection::Out),
            empty_out: entity.add_signal(format!("{}_empty_out", self.stream_id), 1),
            read_enable_in: entity.add_signal(format!("{}_read_enable_in", self.stream_id), 1),
        }
    }

    /// `{s}_dp_valid_in`, `{s}_dp_data_in_{i}`, `{s}_dp_full_out`
    pub fn initialize_producer_interface_ports(&self, entity: &mut Entity) -> ProducerChannel {
        ProducerChannel {
            valid_in: entity.add_port(format!("{}_dp_valid_in", self.stream_id), 1, PortDirection::In),
            data_in: self.data_ports(entity, "dp_data_in", PortDirection::In),
            full_out: entity.add_port(format!("{}_dp_full_out", self.stream_id), 1, PortDirection::Out),
        }
    }
}

impl InputChannel {
    /// High on cycles where a value is taken from upstream
    pub fn transfer(&self) -> Expr {
        Expr::high(&self.read_enable_out).and(Expr::low(&self.empty_in))
    }
}

impl ProducerChannel {
    /// High on cycles where upstream's value is accepted
    pub fn transfer(&self) -> Expr {
        Expr::high(&self.valid_in).and(Expr::low(&self.full_out))
    }
}

/// Forward an upstream FIFO straight to a downstream consumer
pub fn wire_through(entity: &mut Entity, from: &InputChannel, to: &OutputChannel) {
    for (d_out, d_in) in to.data_out.iter().zip(&from.data_in) {
        entity.connect(d_out, Expr::name(d_in));
    }
    entity.connect(&to.empty_out, Expr::name(&from.empty_in));
    entity.connect(&from.read_enable_out, Expr::name(&to.read_enable_in));
}

/// Forward a producer straight to a downstream consumer; the producer sees
/// full whenever the consumer is not reading
pub fn wire_producer_through(entity: &mut Entity, from: &ProducerChannel, to: &OutputChannel) {
    for (d_out, d_in) in to.data_out.iter().zip(&from.data_in) {
        entity.connect(d_out, Expr::name(d_in));
    }
    entity.flag(&to.empty_out, Expr::low(&from.valid_in));
    entity.flag(&from.full_out, Expr::low(&to.read_enable_in));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_port_names() {
        let mut e = Entity::new("top", "clk", "rst");
        let block = FifoInterfaceBlock::new("A", 2, 16);
        let input = block.initialize_input_interface_ports(&mut e);
        let output = block.initialize_output_interface_ports(&mut e);
        assert_eq!(input.data_in, vec!["A_data_in_0".to_string(), "A_data_in_1".to_string()]);
        assert_eq!(input.read_enable_out, "A_read_enable_out");
        assert_eq!(output.empty_out, "A_empty_out");
        assert_eq!(e.width_of("A_data_out_1"), Some(16));
        assert_eq!(
            e.port("A_read_enable_in").map(|p| p.direction),
            Some(PortDirection::In)
        );
    }

    #[test]
    fn test_wire_through() {
        let mut e = Entity::new("top", "clk", "rst");
        let block = FifoInterfaceBlock::new("B", 1, 8);
        let input = block.initialize_input_interface_ports(&mut e);
        let output = block.initialize_output_interface_ports(&mut e);
        wire_through(&mut e, &input, &output);
        let vhdl = e.to_vhdl();
        assert!(vhdl.contains("B_data_out_0 <= B_data_in_0;"));
        assert!(vhdl.contains("B_empty_out <= B_empty_in;"));
        assert!(vhdl.contains("B_read_enable_out <= B_read_enable_in;"));
        assert!(e.multiply_driven().is_empty());
    }

    #[test]
    fn test_gated_output_keeps_flow_control_internal() {
        let mut e = Entity::new("top", "clk", "rst");
        let out = FifoInterfaceBlock::new("C", 1, 8).initialize_gated_output_interface(&mut e);
        assert!(e.port(&out.empty_out).is_none());
        assert!(e.signal(&out.read_enable_in).is_some());
        assert!(e.port("C_data_out_0").is_some());
    }
}
