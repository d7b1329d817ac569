//! Streaming window buffers and address generators for synthesized loop nests
//!
//! This library takes an elaborated loop nest (induction variables with
//! steps and end values) and the streams its body reads and writes, and
//! generates the circuitry that moves data between memory-side FIFOs and the
//! datapath: per stream an address generator issuing burst descriptors and a
//! smart buffer holding the sliding access window in registers, so that only
//! newly needed elements are fetched on each iteration.
//!
//! # Example
//!
//! ```rust
//! use stencil_stream::{synthesize, EndValue, LivDescriptor, LoopNest, StreamDescriptor, StreamDirection, SynthesisConfig};
//!
//! let nest = LoopNest::perfect(
//!     "blur",
//!     vec![
//!         LivDescriptor::new("y", 1, EndValue::constant(62)),
//!         LivDescriptor::new("x", 1, EndValue::constant(62)),
//!     ],
//! );
//! let streams = vec![StreamDescriptor::new("A", StreamDirection::Input, &[("y", 3), ("x", 3)], 1)];
//! let module = synthesize(&nest, &streams, &SynthesisConfig::default()).unwrap();
//! println!("{}", module);
//! ```

pub mod address;
pub mod codegen;
pub mod descriptor;
pub mod error;
pub mod fifo;
pub mod geometry;
pub mod hardware;
pub mod input_buffer;
pub mod interface;
pub mod liv;
pub mod netlist;
pub mod output_buffer;
pub mod pass_through;
pub mod sim;
pub mod vhdl;

pub use address::{AddressGenerator, Burst};
pub use codegen::CodeGenerator;
pub use descriptor::{EndValue, FillerBinding, LivDescriptor, LoopNest, StreamDescriptor, StreamDirection, SynthesisRequest};
pub use error::{SynthesisError, SynthesisResult};
pub use fifo::{FifoParams, MicroFifo};
pub use geometry::{AccessGeometry, StreamGeometry};
pub use hardware::{HardwareModule, StreamKind, StreamSummary, SynthesisConfig};
pub use input_buffer::InputSmartBuffer;
pub use interface::FifoInterfaceBlock;
pub use liv::{LivHandler, LoopNestState};
pub use output_buffer::OutputSmartBuffer;
pub use sim::{simulate_input_stream, simulate_output_stream};

/// Generate the stream hardware of one loop nest
pub fn synthesize(
    nest: &LoopNest,
    streams: &[StreamDescriptor],
    config: &SynthesisConfig,
) -> SynthesisResult<HardwareModule> {
    CodeGenerator::new(config.clone()).generate(nest, streams)
}

/// Generate from a JSON `SynthesisRequest`
pub fn synthesize_json(json: &str, config: &SynthesisConfig) -> SynthesisResult<HardwareModule> {
    let request = SynthesisRequest::from_json(json)?;
    synthesize(&request.nest, &request.streams, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesize_json() {
        let json = r#"{
            "nest": {
                "name": "smooth",
                "livs": [
                    {"id": "i", "step": 1, "end": {"kind": "runtime", "port": "n_end"}}
                ]
            },
            "streams": [
                {
                    "stream_id": "X",
                    "direction": "input",
                    "access_order": ["i"],
                    "window": {"i": 3},
                    "num_invalidated_per_step": 1
                },
                {
                    "stream_id": "Y",
                    "direction": "output",
                    "access_order": ["i"],
                    "window": {"i": 1},
                    "num_invalidated_per_step": 1
                }
            ]
        }"#;
        let module = synthesize_json(json, &SynthesisConfig::default()).unwrap();
        assert_eq!(module.streams.len(), 2);
        assert_eq!(module.stream("Y").unwrap().kind, StreamKind::PassThrough);
        assert!(module.top.port("n_end").is_some());
        assert!(module.to_json().unwrap().contains("\"stream_id\": \"X\""));
    }

    #[test]
    fn test_bad_json_is_a_descriptor_error() {
        let err = synthesize_json("{", &SynthesisConfig::default()).unwrap_err();
        assert!(matches!(err, SynthesisError::Deserialize(_)));
    }
}
