//! Example: 3x3 stencil input stream
//!
//! Synthesizes the input side of a 3x3 blur over a 6x6 image and
//! co-simulates the address generator and smart buffer to show the windows
//! handed to the datapath.
//!
//! Run with: cargo run --example stencil_3x3

use std::collections::BTreeMap;

use colored::Colorize;
use stencil_stream::{
    simulate_input_stream, synthesize, EndValue, LivDescriptor, LivHandler, LoopNest, StreamDescriptor,
    StreamDirection, StreamGeometry, SynthesisConfig,
};

fn main() {
    env_logger::init();
    println!("{}", "=== 3x3 Stencil Input Stream ===".bold().blue());
    println!();

    let config = SynthesisConfig::default();
    let nest = LoopNest::perfect(
        "blur",
        vec![
            LivDescriptor::new("y", 1, EndValue::constant(4)),
            LivDescriptor::new("x", 1, EndValue::constant(4)),
        ],
    );
    let stream = StreamDescriptor::new("img", StreamDirection::Input, &[("y", 3), ("x", 3)], 1);

    let module = synthesize(&nest, &[stream.clone()], &config).unwrap();
    println!("{}", module);

    // 6x6 image, one value per pixel
    let handler = LivHandler::from_nest(&nest).unwrap();
    let geometry = StreamGeometry::resolve(&stream, &handler).unwrap();
    let image: Vec<i64> = (0..36).collect();
    let windows = simulate_input_stream(&handler, &geometry, &image, &BTreeMap::new(), &config).unwrap();

    println!("{} {}", "Windows published:".green(), windows.len());
    for (i, window) in windows.iter().take(4).enumerate() {
        println!("  {}: {:?}", i, window);
    }
    println!("  ...");
    println!();

    println!("{}", "Generated VHDL (first 40 lines):".yellow());
    for line in module.to_vhdl().lines().take(40) {
        println!("{}", line);
    }
}
