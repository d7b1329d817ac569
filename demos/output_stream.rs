//! Example: 1-D output stream with a tail flush
//!
//! A loop over 8 points produces a 3-wide output window per iteration. The
//! first element of each window is written back on every iteration; the
//! remaining two are flushed when the row ends. The last slot has no
//! computed value and is filled with a constant.
//!
//! Run with: cargo run --example output_stream

use std::collections::BTreeMap;

use colored::Colorize;
use stencil_stream::{
    simulate_output_stream, synthesize, EndValue, FillerBinding, LivDescriptor, LivHandler, LoopNest,
    StreamDescriptor, StreamDirection, StreamGeometry, SynthesisConfig,
};

fn main() {
    env_logger::init();
    println!("{}", "=== Output Stream ===".bold().blue());
    println!();

    let config = SynthesisConfig::default();
    let nest = LoopNest::perfect("scan", vec![LivDescriptor::new("i", 1, EndValue::constant(8))]);
    let mut stream = StreamDescriptor::new("out", StreamDirection::Output, &[("i", 3)], 1);
    stream.fillers.push(FillerBinding {
        coordinate: vec![2],
        value: -1,
    });

    let module = synthesize(&nest, &[stream.clone()], &config).unwrap();
    println!("{}", module);

    let handler = LivHandler::from_nest(&nest).unwrap();
    let geometry = StreamGeometry::resolve(&stream, &handler).unwrap();
    let windows: Vec<Vec<i64>> = (0..8).map(|i| vec![10 * i, 10 * i + 1, 10 * i + 2]).collect();
    let mut memory = vec![0i64; 10];
    simulate_output_stream(
        &handler,
        &geometry,
        &stream.fillers,
        &windows,
        &mut memory,
        &BTreeMap::new(),
        &config,
    )
    .unwrap();

    println!("{} {:?}", "Memory after the sweep:".green(), memory);
}
