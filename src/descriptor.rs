//! Descriptors consumed from the loop transformation layer
//!
//! These are the already-analyzed inputs: the loop induction variable forest
//! of one nest and, per stream, the window/step geometry of its accesses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SynthesisResult;

fn default_width() -> u32 {
    32
}

fn default_channels() -> usize {
    1
}

/// End bound of a loop induction variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndValue {
    /// Compile-time constant bound
    Constant { value: i64 },
    /// Bound supplied at run time through an input port
    Runtime { port: String },
    /// The loop never terminates
    Infinite,
}

impl EndValue {
    pub fn constant(value: i64) -> Self {
        EndValue::Constant { value }
    }

    pub fn runtime(port: impl Into<String>) -> Self {
        EndValue::Runtime { port: port.into() }
    }
}

/// One loop nesting level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivDescriptor {
    pub id: String,
    /// Signed step added to the counter on every increment
    pub step: i64,
    /// Value the counter resets to when an ancestor advances
    #[serde(default)]
    pub start: i64,
    /// `None` is a configuration error for the nest
    #[serde(default)]
    pub end: Option<EndValue>,
    /// Directly nested (faster-changing) induction variables
    #[serde(default)]
    pub children: Vec<String>,
}

impl LivDescriptor {
    pub fn new(id: impl Into<String>, step: i64, end: EndValue) -> Self {
        Self {
            id: id.into(),
            step,
            start: 0,
            end: Some(end),
            children: Vec::new(),
        }
    }

    pub fn with_start(mut self, start: i64) -> Self {
        self.start = start;
        self
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children = children.into_iter().map(Into::into).collect();
        self
    }
}

/// A synthesized loop nest, its induction variables listed outer to inner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopNest {
    pub name: String,
    pub livs: Vec<LivDescriptor>,
}

impl LoopNest {
    pub fn new(name: impl Into<String>, livs: Vec<LivDescriptor>) -> Self {
        Self {
            name: name.into(),
            livs,
        }
    }

    /// Convenience for the common perfectly nested case: each induction
    /// variable is the only child of the one before it.
    pub fn perfect(name: impl Into<String>, livs: Vec<LivDescriptor>) -> Self {
        let mut livs = livs;
        for i in 0..livs.len().saturating_sub(1) {
            let child = livs[i + 1].id.clone();
            livs[i].children = vec![child];
        }
        Self::new(name, livs)
    }
}

/// Which side of memory a stream sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamDirection {
    Input,
    Output,
}

/// Constant for an output window slot with no computed value behind it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillerBinding {
    /// Window coordinate in access order
    pub coordinate: Vec<usize>,
    pub value: i64,
}

/// Per-stream access geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub stream_id: String,
    pub direction: StreamDirection,
    /// Induction variables indexing the stream, outer to inner
    pub access_order: Vec<String>,
    /// Full buffered extent along each accessed axis
    pub window: BTreeMap<String, usize>,
    /// Newly introduced extent along each axis; axes left out default to
    /// the window extent, the innermost to `num_invalidated_per_step`
    #[serde(default)]
    pub step: BTreeMap<String, usize>,
    pub num_invalidated_per_step: usize,
    /// Data lanes moved per buffer state
    #[serde(default = "default_channels")]
    pub num_channels: usize,
    /// Bursts issued per address generator state
    #[serde(default = "default_channels")]
    pub address_channels: usize,
    #[serde(default = "default_width")]
    pub data_width: u32,
    #[serde(default)]
    pub fillers: Vec<FillerBinding>,
}

impl StreamDescriptor {
    pub fn new(
        stream_id: impl Into<String>,
        direction: StreamDirection,
        access: &[(&str, usize)],
        num_invalidated_per_step: usize,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            direction,
            access_order: access.iter().map(|(liv, _)| liv.to_string()).collect(),
            window: access
                .iter()
                .map(|(liv, extent)| (liv.to_string(), *extent))
                .collect(),
            step: BTreeMap::new(),
            num_invalidated_per_step,
            num_channels: 1,
            address_channels: 1,
            data_width: default_width(),
            fillers: Vec::new(),
        }
    }

    pub fn with_channels(mut self, data: usize, address: usize) -> Self {
        self.num_channels = data;
        self.address_channels = address;
        self
    }

    pub fn with_data_width(mut self, width: u32) -> Self {
        self.data_width = width;
        self
    }
}

/// A complete request: one nest and the streams it drives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub nest: LoopNest,
    pub streams: Vec<StreamDescriptor>,
}

impl SynthesisRequest {
    pub fn from_json(json: &str) -> SynthesisResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_nest_links_children() {
        let nest = LoopNest::perfect(
            "nest",
            vec![
                LivDescriptor::new("i", 1, EndValue::constant(4)),
                LivDescriptor::new("j", 1, EndValue::constant(8)),
            ],
        );
        assert_eq!(nest.livs[0].children, vec!["j".to_string()]);
        assert!(nest.livs[1].children.is_empty());
    }

    #[test]
    fn test_request_from_json() {
        let json = r#"{
            "nest": {
                "name": "blur",
                "livs": [
                    {"id": "i", "step": 1, "end": {"kind": "constant", "value": 6}, "children": ["j"]},
                    {"id": "j", "step": 1, "end": {"kind": "runtime", "port": "j_end"}},
                    {"id": "k", "step": 1, "end": {"kind": "infinite"}}
                ]
            },
            "streams": [{
                "stream_id": "A",
                "direction": "input",
                "access_order": ["i", "j"],
                "window": {"i": 3, "j": 3},
                "num_invalidated_per_step": 1
            }]
        }"#;
        let request = SynthesisRequest::from_json(json).unwrap();
        assert_eq!(request.nest.livs[1].end, Some(EndValue::runtime("j_end")));
        assert!(request.nest.livs[2].end.as_ref().unwrap() == &EndValue::Infinite);
        let stream = &request.streams[0];
        assert_eq!(stream.num_channels, 1);
        assert_eq!(stream.data_width, 32);
        assert!(stream.step.is_empty());
    }
}
