//! Code generator for streaming loop nests
//!
//! Resolves every stream of a nest against one shared `LivHandler` and
//! generates, per stream, either an address generator and smart buffer pair
//! or pass-through wiring, all inside one top-level entity.

use std::collections::BTreeSet;

use log::{debug, info};

use crate::address;
use crate::descriptor::{LoopNest, StreamDescriptor, StreamDirection};
use crate::error::{SynthesisError, SynthesisResult};
use crate::geometry::{Region, StreamGeometry};
use crate::hardware::{HardwareModule, StreamKind, StreamSummary, SynthesisConfig};
use crate::input_buffer;
use crate::interface::FifoInterfaceBlock;
use crate::liv::LivHandler;
use crate::netlist::{Entity, Expr, PortDirection};
use crate::output_buffer;
use crate::pass_through;

/// Port shared by every input stream's datapath side
pub const INPUT_READ_ENABLE: &str = "input_read_enable_in";
/// High while any input stream has no window ready
pub const INPUTS_EMPTY: &str = "inputs_empty_out";

/// Code generator for stream hardware
pub struct CodeGenerator {
    config: SynthesisConfig,
}

/// Per-stream results collected while generating
struct Generated {
    summary: StreamSummary,
    done_terms: Vec<Expr>,
    empty_out: Option<String>,
    components: Vec<Entity>,
}

fn in_done(register: &str, done_state: &str) -> Expr {
    Expr::name(register).eq_to(Expr::State(done_state.to_string()))
}

impl CodeGenerator {
    pub fn new(config: SynthesisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Generate the hardware for one nest and the streams it drives
    pub fn generate(&self, nest: &LoopNest, streams: &[StreamDescriptor]) -> SynthesisResult<HardwareModule> {
        info!("Synthesizing nest {} with {} streams", nest.name, streams.len());
        self.config.validate(&nest.name)?;
        if streams.is_empty() {
            return Err(SynthesisError::configuration(&nest.name, "nest drives no streams"));
        }
        let mut seen = BTreeSet::new();
        for stream in streams {
            if !seen.insert(stream.stream_id.as_str()) {
                return Err(SynthesisError::configuration(&stream.stream_id, "duplicate stream id"));
            }
        }

        let handler = LivHandler::from_nest(nest)?;
        let geometries = streams
            .iter()
            .map(|s| StreamGeometry::resolve(s, &handler))
            .collect::<SynthesisResult<Vec<_>>>()?;

        let config = &self.config;
        let mut top = Entity::new(&nest.name, &config.clock, &config.reset);
        handler.declare_runtime_ports(&mut top, config.counter_width);
        let has_inputs = geometries.iter().any(|g| g.direction == StreamDirection::Input);
        if has_inputs {
            top.add_port(INPUT_READ_ENABLE, 1, PortDirection::In);
            top.add_port(INPUTS_EMPTY, 1, PortDirection::Out);
        }

        let mut summaries = Vec::new();
        let mut components = Vec::new();
        let mut done_terms = Vec::new();
        let mut empties = Vec::new();
        for (stream, geometry) in streams.iter().zip(&geometries) {
            let generated = match geometry.direction {
                StreamDirection::Input => self.generate_input(&mut top, &handler, geometry)?,
                StreamDirection::Output => self.generate_output(&mut top, &handler, stream, geometry)?,
            };
            info!(
                "Stream {} ({:?}, {:?}): {} elements, {} address states, {} buffer states",
                generated.summary.stream_id,
                generated.summary.direction,
                generated.summary.kind,
                generated.summary.elements,
                generated.summary.address_states,
                generated.summary.buffer_states
            );
            summaries.push(generated.summary);
            components.extend(generated.components);
            done_terms.extend(generated.done_terms);
            empties.extend(generated.empty_out);
        }

        if has_inputs {
            top.flag(INPUTS_EMPTY, Expr::any(empties.iter().map(Expr::high)));
        }
        let mut module = HardwareModule::new(config.clone(), top);
        let done_port = module.done_port.clone();
        module.top.add_port(&done_port, 1, PortDirection::Out);
        module.top.flag(&done_port, Expr::all(done_terms));
        for component in components {
            module.add_component(component);
        }
        module.streams = summaries;

        let conflicts = module.top.multiply_driven();
        if !conflicts.is_empty() {
            return Err(SynthesisError::configuration(
                &nest.name,
                format!("signals driven from more than one place: {}", conflicts.join(", ")),
            ));
        }
        debug!(
            "Nest {}: {} ports, {} signals, {} processes, {} components",
            nest.name,
            module.top.ports.len(),
            module.top.signals.len(),
            module.top.processes.len(),
            module.components.len()
        );
        Ok(module)
    }

    fn generate_input(
        &self,
        top: &mut Entity,
        handler: &LivHandler,
        geometry: &StreamGeometry,
    ) -> SynthesisResult<Generated> {
        let config = &self.config;
        let s = geometry.stream_id.as_str();
        let dw = geometry.data_width;
        let memory = FifoInterfaceBlock::new(s, geometry.num_channels, dw).initialize_input_interface_ports(top);
        let datapath = FifoInterfaceBlock::new(s, geometry.elements(), dw).initialize_gated_output_interface(top);
        top.connect(&datapath.read_enable_in, Expr::name(INPUT_READ_ENABLE));

        if geometry.is_pass_through() {
            let ports = pass_through::create_input_vhdl(top, handler, geometry, &memory, &datapath, config)?;
            return Ok(Generated {
                summary: summary(geometry, StreamKind::PassThrough, 0, ports.states),
                done_terms: vec![in_done(&ports.state_register, &ports.done_state)],
                empty_out: Some(datapath.empty_out),
                components: Vec::new(),
            });
        }

        let generator = address::create_vhdl(top, handler, geometry, config)?;
        generator.verify_channels(s, geometry.address_channels)?;
        let (buffer, component) = input_buffer::create_vhdl(top, handler, geometry, &memory, &datapath, config)?;
        Ok(Generated {
            summary: summary(geometry, StreamKind::Windowed, generator.states, buffer.states),
            done_terms: vec![
                in_done(&generator.state_register, "S_DONE"),
                in_done(&buffer.state_register, &buffer.done_state),
            ],
            empty_out: Some(datapath.empty_out),
            components: component.into_iter().collect(),
        })
    }

    fn generate_output(
        &self,
        top: &mut Entity,
        handler: &LivHandler,
        stream: &StreamDescriptor,
        geometry: &StreamGeometry,
    ) -> SynthesisResult<Generated> {
        let config = &self.config;
        let s = geometry.stream_id.as_str();
        let dw = geometry.data_width;
        let datapath = FifoInterfaceBlock::new(s, geometry.elements(), dw).initialize_producer_interface_ports(top);
        let memory = FifoInterfaceBlock::new(s, geometry.num_channels, dw).initialize_output_interface_ports(top);

        if geometry.is_pass_through() {
            let ports = pass_through::create_output_vhdl(top, handler, geometry, &datapath, &memory, config)?;
            return Ok(Generated {
                summary: summary(geometry, StreamKind::PassThrough, 0, ports.states),
                done_terms: vec![in_done(&ports.state_register, &ports.done_state)],
                empty_out: None,
                components: Vec::new(),
            });
        }

        let generator = address::create_vhdl(top, handler, geometry, config)?;
        generator.verify_channels(s, geometry.address_channels)?;
        let (buffer, components) =
            output_buffer::create_vhdl(top, handler, geometry, &stream.fillers, &datapath, &memory, config)?;
        Ok(Generated {
            summary: summary(geometry, StreamKind::Windowed, generator.states, buffer.states),
            done_terms: vec![
                in_done(&generator.state_register, "S_DONE"),
                in_done(&buffer.state_register, &buffer.done_state),
            ],
            empty_out: None,
            components,
        })
    }
}

fn summary(geometry: &StreamGeometry, kind: StreamKind, address_states: usize, buffer_states: usize) -> StreamSummary {
    let (elements, bursts_per_step) = match kind {
        StreamKind::PassThrough => (0, 0),
        StreamKind::Windowed => (
            geometry.elements(),
            geometry.row_batches(Region::Step).iter().map(Vec::len).sum(),
        ),
    };
    StreamSummary {
        stream_id: geometry.stream_id.clone(),
        direction: geometry.direction,
        kind,
        elements,
        address_states,
        buffer_states,
        bursts_per_step,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EndValue, FillerBinding, LivDescriptor};
    use pretty_assertions::assert_eq;

    fn nest() -> LoopNest {
        LoopNest::perfect(
            "blur",
            vec![
                LivDescriptor::new("y", 1, EndValue::constant(6)),
                LivDescriptor::new("x", 1, EndValue::constant(6)),
            ],
        )
    }

    #[test]
    fn test_stencil_with_output() {
        let mut output = StreamDescriptor::new("B", StreamDirection::Output, &[("y", 1), ("x", 2)], 1);
        output.fillers.push(FillerBinding {
            coordinate: vec![0, 1],
            value: 0,
        });
        let streams = vec![
            StreamDescriptor::new("A", StreamDirection::Input, &[("y", 3), ("x", 3)], 1),
            output,
        ];
        let module = CodeGenerator::new(SynthesisConfig::default())
            .generate(&nest(), &streams)
            .unwrap();
        let a = module.stream("A").unwrap();
        assert_eq!(a.kind, StreamKind::Windowed);
        assert_eq!(a.elements, 9);
        assert_eq!(a.bursts_per_step, 3);
        assert_eq!(module.stream("B").unwrap().elements, 2);
        assert!(module.top.port(INPUT_READ_ENABLE).is_some());
        assert!(module.top.port("done").is_some());

        let vhdl = module.to_vhdl();
        assert!(vhdl.contains("entity blur is"));
        assert!(vhdl.contains("A_read_enable_in <= input_read_enable_in;"));
        assert!(vhdl.contains("inputs_empty_out <= '1' when (A_empty_out = '1') else '0';"));
        assert!(vhdl.contains("(A_address_state = S_DONE)"));
        assert!(vhdl.contains("(B_buff_state = S_DONE)"));
    }

    #[test]
    fn test_pass_through_streams() {
        let streams = vec![
            StreamDescriptor::new("P", StreamDirection::Input, &[("x", 1)], 1),
            StreamDescriptor::new("Q", StreamDirection::Output, &[("x", 1)], 1),
        ];
        let module = CodeGenerator::new(SynthesisConfig::default())
            .generate(&nest(), &streams)
            .unwrap();
        assert_eq!(module.stream("P").unwrap().kind, StreamKind::PassThrough);
        assert_eq!(module.stream("Q").unwrap().address_states, 0);
        assert!(module.components.is_empty());
        let vhdl = module.to_vhdl();
        assert!(vhdl.contains("P_data_out_0 <= P_data_in_0;"));
        assert!(vhdl.contains("Q_data_out_0 <= Q_dp_data_in_0;"));
    }

    #[test]
    fn test_duplicate_and_empty_streams_rejected() {
        let generator = CodeGenerator::new(SynthesisConfig::default());
        assert!(matches!(
            generator.generate(&nest(), &[]),
            Err(SynthesisError::Configuration { .. })
        ));
        let stream = StreamDescriptor::new("A", StreamDirection::Input, &[("x", 2)], 1);
        assert!(matches!(
            generator.generate(&nest(), &[stream.clone(), stream]),
            Err(SynthesisError::Configuration { .. })
        ));
    }

    #[test]
    fn test_config_without_fifo_margin_rejected() {
        let config = SynthesisConfig {
            input_fifo_almost_full: 0,
            ..SynthesisConfig::default()
        };
        let streams = vec![StreamDescriptor::new("A", StreamDirection::Input, &[("x", 2)], 1)];
        let err = CodeGenerator::new(config).generate(&nest(), &streams).unwrap_err();
        assert!(matches!(err, SynthesisError::Configuration { stream, .. } if stream == "blur"));
    }

    #[test]
    fn test_oversized_fifo_becomes_component() {
        let config = SynthesisConfig {
            fifo_inline_limit: 64,
            ..SynthesisConfig::default()
        };
        let streams = vec![StreamDescriptor::new("A", StreamDirection::Input, &[("x", 2)], 1)];
        let module = CodeGenerator::new(config).generate(&nest(), &streams).unwrap();
        assert_eq!(module.components.len(), 1);
        assert_eq!(module.components[0].name, "MicroFifo64x8");
        assert_eq!(module.top.instances.len(), 1);
    }
}
