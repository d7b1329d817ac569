//! Hardware configuration and the synthesized result
//!
//! `SynthesisConfig` carries the knobs of the generated circuit that are not
//! part of a nest or stream description. `HardwareModule` is what one call to
//! the synthesizer produces: the top-level entity, any separately generated
//! component entities, and a per-stream summary.

use serde::{Deserialize, Serialize};

use crate::descriptor::StreamDirection;
use crate::error::{SynthesisError, SynthesisResult};
use crate::fifo::MAX_ADDRESS_WIDTH;
use crate::netlist::Entity;

/// Cycles between the read that completes an input window and its write
/// into the MicroFifo; this many entries must stay free once full is flagged
pub const PUBLISH_LATENCY: usize = 2;

/// Configuration for the generated streaming hardware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Width of every loop counter register
    pub counter_width: u32,
    /// Width of the burst base address ports
    pub address_width: u32,
    /// Width of the burst count ports
    pub count_width: u32,
    /// Address width of the MicroFifo inside an input smart buffer
    pub input_fifo_address_width: u32,
    pub input_fifo_almost_full: usize,
    pub input_fifo_almost_empty: usize,
    /// Almost-full count of the datapath-side MicroFifo of an output stream
    pub datapath_fifo_almost_full: usize,
    /// MicroFifos holding more bits than this are emitted as a separate
    /// parameterized component instead of inline registers
    pub fifo_inline_limit: usize,
    /// Depth of the transfer delay line feeding pass-through done detection
    pub pass_through_done_delay: usize,
    pub clock: String,
    pub reset: String,
}

impl SynthesisConfig {
    pub fn new(counter_width: u32, address_width: u32) -> Self {
        Self {
            counter_width,
            address_width,
            count_width: address_width,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> SynthesisResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Capacity of the input smart buffer MicroFifo
    pub fn input_fifo_capacity(&self) -> usize {
        1usize.checked_shl(self.input_fifo_address_width).unwrap_or(usize::MAX)
    }

    /// Reject MicroFifo settings under which a write could reach a full FIFO
    /// or whose sizes do not fit a MicroFifo at all. `owner` names the nest
    /// or stream in the error.
    pub fn validate(&self, owner: &str) -> SynthesisResult<()> {
        let width = self.input_fifo_address_width;
        if width == 0 || width > MAX_ADDRESS_WIDTH {
            return Err(SynthesisError::configuration(
                owner,
                format!("input_fifo_address_width {} is outside 1..={}", width, MAX_ADDRESS_WIDTH),
            ));
        }
        let capacity = self.input_fifo_capacity();
        if self.input_fifo_almost_full < PUBLISH_LATENCY || self.input_fifo_almost_full >= capacity {
            return Err(SynthesisError::configuration(
                owner,
                format!(
                    "input_fifo_almost_full {} must be at least {} and below the capacity {}",
                    self.input_fifo_almost_full, PUBLISH_LATENCY, capacity
                ),
            ));
        }
        if self.input_fifo_almost_empty >= capacity {
            return Err(SynthesisError::configuration(
                owner,
                format!(
                    "input_fifo_almost_empty {} must be below the capacity {}",
                    self.input_fifo_almost_empty, capacity
                ),
            ));
        }
        let max_threshold = (1usize << MAX_ADDRESS_WIDTH) - 1;
        if self.datapath_fifo_almost_full < PUBLISH_LATENCY || self.datapath_fifo_almost_full > max_threshold {
            return Err(SynthesisError::configuration(
                owner,
                format!(
                    "datapath_fifo_almost_full {} is outside {}..={}",
                    self.datapath_fifo_almost_full, PUBLISH_LATENCY, max_threshold
                ),
            ));
        }
        Ok(())
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            counter_width: 32,
            address_width: 32,
            count_width: 32,
            input_fifo_address_width: 3,
            input_fifo_almost_full: 2,
            input_fifo_almost_empty: 0,
            datapath_fifo_almost_full: 5,
            fifo_inline_limit: 10000,
            pass_through_done_delay: 4,
            clock: "clk".to_string(),
            reset: "rst".to_string(),
        }
    }
}

/// How a stream was realized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Windowed,
    PassThrough,
}

/// What was generated for one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub stream_id: String,
    pub direction: StreamDirection,
    pub kind: StreamKind,
    /// Buffer elements allocated (zero for pass-through)
    pub elements: usize,
    pub address_states: usize,
    pub buffer_states: usize,
    /// Burst descriptors issued per step iteration
    pub bursts_per_step: usize,
}

/// A synthesized loop nest
#[derive(Debug, Clone, Serialize)]
pub struct HardwareModule {
    pub config: SynthesisConfig,
    pub top: Entity,
    /// Separately generated entities instantiated by `top`
    pub components: Vec<Entity>,
    pub streams: Vec<StreamSummary>,
    /// Name of the nest-level done output
    pub done_port: String,
}

impl HardwareModule {
    pub fn new(config: SynthesisConfig, top: Entity) -> Self {
        Self {
            config,
            top,
            components: Vec::new(),
            streams: Vec::new(),
            done_port: "done".to_string(),
        }
    }

    pub fn add_component(&mut self, component: Entity) {
        if !self.components.iter().any(|c| c.name == component.name) {
            self.components.push(component);
        }
    }

    pub fn stream(&self, stream_id: &str) -> Option<&StreamSummary> {
        self.streams.iter().find(|s| s.stream_id == stream_id)
    }

    /// Export to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Render every entity, components first
    pub fn to_vhdl(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("-- Auto-generated streaming interface for {}\n\n", self.top.name));
        for component in &self.components {
            output.push_str(&component.to_vhdl());
            output.push('\n');
        }
        output.push_str(&self.top.to_vhdl());
        output
    }
}

impl std::fmt::Display for HardwareModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Hardware Module {}", self.top.name)?;
        writeln!(f, "================")?;
        writeln!(f, "Counter width: {}-bit, Address: {}-bit", self.config.counter_width, self.config.address_width)?;
        writeln!(f, "Ports: {}", self.top.ports.len())?;
        writeln!(f, "Signals: {}", self.top.signals.len())?;
        writeln!(f, "Processes: {}", self.top.processes.len())?;
        writeln!(f, "Components: {}", self.components.len())?;
        writeln!(f)?;

        for stream in &self.streams {
            writeln!(f, "Stream {} ({:?}, {:?}):", stream.stream_id, stream.direction, stream.kind)?;
            writeln!(f, "  Buffer elements: {}", stream.elements)?;
            writeln!(f, "  Address states: {}", stream.address_states)?;
            writeln!(f, "  Buffer states: {}", stream.buffer_states)?;
            writeln!(f, "  Bursts per step: {}", stream.bursts_per_step)?;
            writeln!(f)?;
        }

        Ok(())
    }
}
