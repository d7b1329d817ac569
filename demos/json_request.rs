//! Example: synthesize from a JSON request
//!
//! The loop transformation layer hands over its nest and stream geometry as
//! JSON. Here the inner bound is supplied at run time, and a second stream
//! needs no windowing at all.
//!
//! Run with: cargo run --example json_request

use colored::Colorize;
use stencil_stream::{synthesize_json, SynthesisConfig};

const REQUEST: &str = r#"{
    "nest": {
        "name": "fir",
        "livs": [
            {"id": "n", "step": 1, "end": {"kind": "runtime", "port": "n_end"}}
        ]
    },
    "streams": [
        {
            "stream_id": "samples",
            "direction": "input",
            "access_order": ["n"],
            "window": {"n": 5},
            "num_invalidated_per_step": 1,
            "data_width": 16
        },
        {
            "stream_id": "result",
            "direction": "output",
            "access_order": ["n"],
            "window": {"n": 1},
            "num_invalidated_per_step": 1,
            "data_width": 16
        }
    ]
}"#;

fn main() {
    env_logger::init();
    println!("{}", "=== JSON Request ===".bold().blue());
    println!();

    let config = SynthesisConfig::from_json(r#"{"counter_width": 16, "address_width": 24}"#).unwrap();
    let module = match synthesize_json(REQUEST, &config) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}: {}", "Synthesis error".red(), e);
            std::process::exit(1);
        }
    };

    println!("{}", module);
    println!("{}", "JSON output:".yellow());
    println!("{}", module.to_json().unwrap());
}
