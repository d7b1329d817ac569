//! Cycle-level co-simulation of an address generator and its smart buffer
//!
//! Both machines walk the nest independently from their own counters; the
//! memory model turns every burst into a run of consecutive elements.

use std::collections::{BTreeMap, VecDeque};

use log::debug;

use crate::address::{AddressGenerator, Burst};
use crate::descriptor::FillerBinding;
use crate::error::{SynthesisError, SynthesisResult};
use crate::geometry::StreamGeometry;
use crate::hardware::SynthesisConfig;
use crate::input_buffer::InputSmartBuffer;
use crate::liv::LivHandler;
use crate::output_buffer::OutputSmartBuffer;

/// Cycles after which a simulation is abandoned
pub const MAX_CYCLES: usize = 1_000_000;

fn addresses(stream: &str, bursts: &[Burst], memory_len: usize) -> SynthesisResult<Vec<usize>> {
    let mut out = Vec::new();
    for burst in bursts {
        for k in 0..burst.count as i64 {
            let address = burst.base + k;
            if address < 0 || address as usize >= memory_len {
                return Err(SynthesisError::configuration(
                    stream,
                    format!("burst address {} outside a memory image of {}", address, memory_len),
                ));
            }
            out.push(address as usize);
        }
    }
    Ok(out)
}

fn unfinished(stream: &str) -> SynthesisError {
    SynthesisError::configuration(stream, format!("simulation did not finish within {} cycles", MAX_CYCLES))
}

/// Stream `memory` through the input address generator and smart buffer,
/// returning every window handed to the datapath in order
pub fn simulate_input_stream(
    handler: &LivHandler,
    geometry: &StreamGeometry,
    memory: &[i64],
    bindings: &BTreeMap<String, i64>,
    config: &SynthesisConfig,
) -> SynthesisResult<Vec<Vec<i64>>> {
    let s = geometry.stream_id.as_str();
    let mut generator = AddressGenerator::new(geometry, handler, bindings)?;
    let mut buffer = InputSmartBuffer::new(geometry, handler, bindings, 0i64, config)?;
    let mut elements: VecDeque<i64> = VecDeque::new();
    let mut upstream: VecDeque<Vec<i64>> = VecDeque::new();
    let mut windows = Vec::new();

    for cycle in 0..MAX_CYCLES {
        let tick = generator.tick(false)?;
        for address in addresses(s, &tick.bursts, memory.len())? {
            elements.push_back(memory[address]);
        }
        while elements.len() >= geometry.num_channels {
            upstream.push_back(elements.drain(..geometry.num_channels).collect());
        }

        let out = buffer.tick(&mut upstream, true)?;
        windows.extend(out.data_out);

        if generator.is_finished() && buffer.is_done() && buffer.pending() == 0 && upstream.is_empty() {
            debug!("Input stream {}: {} windows in {} cycles", s, windows.len(), cycle + 1);
            return Ok(windows);
        }
    }
    Err(unfinished(s))
}

/// Write datapath `windows` through the output smart buffer and address
/// generator into `memory`
pub fn simulate_output_stream(
    handler: &LivHandler,
    geometry: &StreamGeometry,
    fillers: &[FillerBinding],
    windows: &[Vec<i64>],
    memory: &mut [i64],
    bindings: &BTreeMap<String, i64>,
    config: &SynthesisConfig,
) -> SynthesisResult<()> {
    let s = geometry.stream_id.as_str();
    let mut generator = AddressGenerator::new(geometry, handler, bindings)?;
    let mut buffer = OutputSmartBuffer::new(geometry, handler, bindings, fillers, config)?;
    let mut targets: VecDeque<usize> = VecDeque::new();
    let mut values: VecDeque<i64> = VecDeque::new();
    let mut offered = windows.iter().peekable();
    let mut written = 0;

    for cycle in 0..MAX_CYCLES {
        let tick = generator.tick(false)?;
        targets.extend(addresses(s, &tick.bursts, memory.len())?);

        let window = if buffer.dp_full_out() { None } else { offered.peek().map(|w| w.to_vec()) };
        let out = buffer.tick(window, true)?;
        if out.accepted {
            offered.next();
        }
        values.extend(out.data_out.into_iter().flatten());

        let pairs = targets.len().min(values.len());
        for (address, value) in targets.drain(..pairs).zip(values.drain(..pairs)) {
            memory[address] = value;
            written += 1;
        }

        if generator.is_finished() && buffer.is_done() {
            if !values.is_empty() || !targets.is_empty() {
                return Err(SynthesisError::configuration(
                    s,
                    format!(
                        "{} values and {} addresses left unpaired",
                        values.len(),
                        targets.len()
                    ),
                ));
            }
            debug!("Output stream {}: {} elements written in {} cycles", s, written, cycle + 1);
            return Ok(());
        }
    }
    Err(unfinished(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EndValue, LivDescriptor, LoopNest, StreamDescriptor, StreamDirection};
    use pretty_assertions::assert_eq;

    fn nest(ends: &[(&str, i64)]) -> LivHandler {
        let livs = ends
            .iter()
            .map(|(id, end)| LivDescriptor::new(*id, 1, EndValue::constant(*end)))
            .collect();
        LivHandler::from_nest(&LoopNest::perfect("nest", livs)).unwrap()
    }

    #[test]
    fn test_stencil_3x3_windows() {
        let h = nest(&[("y", 2), ("x", 2)]);
        let stream = StreamDescriptor::new("A", StreamDirection::Input, &[("y", 3), ("x", 3)], 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let memory: Vec<i64> = (0..16).collect();
        let windows =
            simulate_input_stream(&h, &g, &memory, &BTreeMap::new(), &SynthesisConfig::default()).unwrap();
        assert_eq!(
            windows,
            vec![
                vec![0, 1, 2, 4, 5, 6, 8, 9, 10],
                vec![1, 2, 3, 5, 6, 7, 9, 10, 11],
                vec![4, 5, 6, 8, 9, 10, 12, 13, 14],
                vec![5, 6, 7, 9, 10, 11, 13, 14, 15],
            ]
        );
    }

    #[test]
    fn test_sliding_line_windows() {
        let h = nest(&[("x", 5)]);
        let stream = StreamDescriptor::new("L", StreamDirection::Input, &[("x", 4)], 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let memory: Vec<i64> = (100..108).collect();
        let windows =
            simulate_input_stream(&h, &g, &memory, &BTreeMap::new(), &SynthesisConfig::default()).unwrap();
        let expected: Vec<Vec<i64>> = (0..5).map(|x| (100 + x..104 + x).collect()).collect();
        assert_eq!(windows, expected);
    }

    #[test]
    fn test_runtime_bound_simulation() {
        let livs = vec![LivDescriptor::new("x", 1, EndValue::runtime("n_end"))];
        let h = LivHandler::from_nest(&LoopNest::perfect("nest", livs)).unwrap();
        let stream = StreamDescriptor::new("R", StreamDirection::Input, &[("x", 2)], 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let memory: Vec<i64> = (0..4).collect();
        let bindings = BTreeMap::from([("n_end".to_string(), 3)]);
        let windows = simulate_input_stream(&h, &g, &memory, &bindings, &SynthesisConfig::default()).unwrap();
        assert_eq!(windows, vec![vec![0, 1], vec![1, 2], vec![2, 3]]);
    }

    #[test]
    fn test_output_stream_tail_flush() {
        let h = nest(&[("x", 3)]);
        let stream = StreamDescriptor::new("B", StreamDirection::Output, &[("x", 2)], 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let mut memory = vec![0i64; 4];
        let windows = vec![vec![10, 11], vec![20, 21], vec![30, 31]];
        simulate_output_stream(&h, &g, &[], &windows, &mut memory, &BTreeMap::new(), &SynthesisConfig::default())
            .unwrap();
        assert_eq!(memory, vec![10, 20, 30, 31]);
    }

    #[test]
    fn test_memory_too_small() {
        let h = nest(&[("x", 3)]);
        let stream = StreamDescriptor::new("S", StreamDirection::Input, &[("x", 2)], 1);
        let g = StreamGeometry::resolve(&stream, &h).unwrap();
        let err = simulate_input_stream(&h, &g, &[1, 2], &BTreeMap::new(), &SynthesisConfig::default())
            .unwrap_err();
        assert!(matches!(err, SynthesisError::Configuration { .. }));
    }
}
