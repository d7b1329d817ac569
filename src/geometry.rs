//! Window and step geometry of a stream
//!
//! A stream accesses memory through a set of loop induction variables, its
//! access order. Along every accessed axis the loop body needs a *window* of
//! `W` consecutive elements resident at once; when the innermost accessed
//! axis advances, `S` of them are new (the *step*). Non-innermost axes are
//! always reloaded in full, so `S == W` there.
//!
//! The buffer is split into two regions along the innermost accessed axis.
//! The coordinates with the other axes fixed form a *row*.
//!
//! | direction | window region     | step region       |
//! |-----------|-------------------|-------------------|
//! | input     | `[0, W - S)`      | `[W - S, W)`      |
//! | output    | `[S, W)`          | `[0, S)`          |
//!
//! Input streams fill the window region once per row and the step region on
//! every iteration. Output streams write the step region on every iteration
//! and flush the window region when the row ends.

use std::ops::Range;

use log::debug;
use serde::Serialize;

use crate::descriptor::{StreamDescriptor, StreamDirection};
use crate::error::{SynthesisError, SynthesisResult};
use crate::liv::LivHandler;

/// How a stream is realized
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AccessGeometry {
    /// Every window and step extent is 1, so data can be forwarded directly
    PassThrough,
    /// Extents per accessed axis, in access order
    Windowed { window: Vec<usize>, step: Vec<usize> },
}

/// One of the two buffer regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Region {
    Window,
    Step,
}

impl Region {
    pub fn label(self) -> &'static str {
        match self {
            Region::Window => "WINDOW",
            Region::Step => "STEP",
        }
    }
}

/// Resolved and validated geometry of one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamGeometry {
    pub stream_id: String,
    pub direction: StreamDirection,
    pub access_order: Vec<String>,
    pub geometry: AccessGeometry,
    pub num_channels: usize,
    pub address_channels: usize,
    pub data_width: u32,
}

impl StreamGeometry {
    /// Resolve a stream descriptor against its nest
    pub fn resolve(stream: &StreamDescriptor, handler: &LivHandler) -> SynthesisResult<Self> {
        let id = stream.stream_id.as_str();
        if stream.access_order.is_empty() {
            return Err(SynthesisError::configuration(id, "stream accesses no induction variable"));
        }
        if stream.num_channels == 0 || stream.address_channels == 0 {
            return Err(SynthesisError::configuration(id, "channel counts must be at least 1"));
        }
        for axis in stream.window.keys().chain(stream.step.keys()) {
            if !stream.access_order.contains(axis) {
                return Err(SynthesisError::geometry(id, axis, "axis is not in the access order"));
            }
        }

        let last = stream.access_order.len() - 1;
        let mut window = Vec::with_capacity(stream.access_order.len());
        let mut step = Vec::with_capacity(stream.access_order.len());
        for (k, axis) in stream.access_order.iter().enumerate() {
            if !handler.contains(axis) {
                return Err(SynthesisError::unknown_liv(axis.clone()));
            }
            let w = *stream
                .window
                .get(axis)
                .ok_or_else(|| SynthesisError::geometry(id, axis, "no window extent"))?;
            let default_step = if k == last { stream.num_invalidated_per_step } else { w };
            let s = stream.step.get(axis).copied().unwrap_or(default_step);
            if w == 0 || s == 0 {
                return Err(SynthesisError::geometry(id, axis, "extents must be at least 1"));
            }
            if s > w {
                return Err(SynthesisError::geometry(
                    id,
                    axis,
                    format!("step extent {} exceeds window extent {}", s, w),
                ));
            }
            if k != last && s != w {
                return Err(SynthesisError::geometry(
                    id,
                    axis,
                    format!("only the innermost accessed axis may step by less than its window ({} < {})", s, w),
                ));
            }
            window.push(w);
            step.push(s);
        }

        let mut resolved = Self {
            stream_id: stream.stream_id.clone(),
            direction: stream.direction,
            access_order: stream.access_order.clone(),
            geometry: AccessGeometry::PassThrough,
            num_channels: stream.num_channels,
            address_channels: stream.address_channels,
            data_width: stream.data_width,
        };
        if window.iter().all(|&w| w == 1) {
            debug!("Stream {}: pass-through", id);
            return Ok(resolved);
        }

        resolved.geometry = AccessGeometry::Windowed { window, step };
        resolved.check_nesting(handler)?;
        resolved.check_channels()?;
        debug!(
            "Stream {}: window {:?}, step {:?}, {} elements",
            id,
            resolved.window(),
            resolved.step(),
            resolved.elements()
        );
        Ok(resolved)
    }

    fn check_nesting(&self, handler: &LivHandler) -> SynthesisResult<()> {
        let accessed = self.innermost_accessed();
        let innermost = handler.innermost()?;
        let windowed_axes = self.window().iter().filter(|&&w| w > 1).count();
        let mismatch = accessed != innermost;
        let reject = match self.direction {
            StreamDirection::Input => mismatch && windowed_axes > 1,
            StreamDirection::Output => mismatch,
        };
        if reject {
            return Err(SynthesisError::InnermostMismatch {
                stream: self.stream_id.clone(),
                accessed: accessed.to_string(),
                innermost: innermost.to_string(),
            });
        }

        let nested = handler.descendants_of(accessed)?;
        if let Some(axis) = self.access_order.iter().find(|a| nested.contains(&a.as_str())) {
            return Err(SynthesisError::geometry(
                &self.stream_id,
                axis,
                format!("axis is nested inside the innermost accessed axis `{}`", accessed),
            ));
        }

        let loop_step = handler.step(accessed)?;
        let w = self.window()[self.inner_axis()];
        let s = self.step()[self.inner_axis()];
        if loop_step < 1 || s as i64 != loop_step.min(w as i64) {
            return Err(SynthesisError::geometry(
                &self.stream_id,
                accessed,
                format!(
                    "step extent {} does not match the loop step {} for a window of {}",
                    s, loop_step, w
                ),
            ));
        }
        Ok(())
    }

    fn check_channels(&self) -> SynthesisResult<()> {
        for region in [Region::Window, Region::Step] {
            let count = self.region_len(region);
            if count == 0 {
                continue;
            }
            if count % self.num_channels != 0 {
                return Err(SynthesisError::ChannelMismatch {
                    stream: self.stream_id.clone(),
                    region: region.label().to_lowercase(),
                    channels: self.num_channels,
                    count,
                    unit: "elements",
                });
            }
            let rows = self.row_count();
            if rows % self.address_channels != 0 {
                return Err(SynthesisError::ChannelMismatch {
                    stream: self.stream_id.clone(),
                    region: region.label().to_lowercase(),
                    channels: self.address_channels,
                    count: rows,
                    unit: "rows",
                });
            }
        }
        Ok(())
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self.geometry, AccessGeometry::PassThrough)
    }

    /// Window extents in access order, all 1 for pass-through
    pub fn window(&self) -> Vec<usize> {
        match &self.geometry {
            AccessGeometry::Windowed { window, .. } => window.clone(),
            AccessGeometry::PassThrough => vec![1; self.access_order.len()],
        }
    }

    pub fn step(&self) -> Vec<usize> {
        match &self.geometry {
            AccessGeometry::Windowed { step, .. } => step.clone(),
            AccessGeometry::PassThrough => vec![1; self.access_order.len()],
        }
    }

    fn inner_axis(&self) -> usize {
        self.access_order.len() - 1
    }

    pub fn innermost_accessed(&self) -> &str {
        &self.access_order[self.inner_axis()]
    }

    /// Total buffer elements
    pub fn elements(&self) -> usize {
        self.window().iter().product()
    }

    /// Length of a full row along the innermost accessed axis
    pub fn row_len(&self) -> usize {
        self.window()[self.inner_axis()]
    }

    pub fn row_count(&self) -> usize {
        self.window()[..self.inner_axis()].iter().product()
    }

    /// Every row, as its coordinates along the non-innermost axes
    pub fn rows(&self) -> Vec<Vec<usize>> {
        let window = self.window();
        let mut rows = vec![Vec::new()];
        for &w in &window[..self.inner_axis()] {
            rows = rows
                .into_iter()
                .flat_map(|prefix| {
                    (0..w).map(move |c| {
                        let mut row = prefix.clone();
                        row.push(c);
                        row
                    })
                })
                .collect();
        }
        rows
    }

    /// Innermost-axis span of a region
    pub fn inner_range(&self, region: Region) -> Range<usize> {
        let w = self.row_len();
        let s = self.step()[self.inner_axis()];
        match (self.direction, region) {
            (StreamDirection::Input, Region::Window) => 0..w - s,
            (StreamDirection::Input, Region::Step) => w - s..w,
            (StreamDirection::Output, Region::Step) => 0..s,
            (StreamDirection::Output, Region::Window) => s..w,
        }
    }

    /// Elements in a region
    pub fn region_len(&self, region: Region) -> usize {
        self.row_count() * self.inner_range(region).len()
    }

    /// Coordinates of a region, row by row
    pub fn coordinates(&self, region: Region) -> Vec<Vec<usize>> {
        let inner = self.inner_range(region);
        self.rows()
            .into_iter()
            .flat_map(|row| {
                inner.clone().map(move |x| {
                    let mut coord = row.clone();
                    coord.push(x);
                    coord
                })
            })
            .collect()
    }

    /// Every buffer coordinate in row-major order
    pub fn all_coordinates(&self) -> Vec<Vec<usize>> {
        let w = self.row_len();
        self.rows()
            .into_iter()
            .flat_map(|row| {
                (0..w).map(move |x| {
                    let mut coord = row.clone();
                    coord.push(x);
                    coord
                })
            })
            .collect()
    }

    /// Region coordinates grouped into smart buffer states
    pub fn element_batches(&self, region: Region) -> Vec<Vec<Vec<usize>>> {
        self.coordinates(region)
            .chunks(self.num_channels)
            .map(<[Vec<usize>]>::to_vec)
            .collect()
    }

    /// Region rows grouped into address generator states; empty when the
    /// region has no elements
    pub fn row_batches(&self, region: Region) -> Vec<Vec<Vec<usize>>> {
        if self.inner_range(region).is_empty() {
            return Vec::new();
        }
        self.rows()
            .chunks(self.address_channels)
            .map(<[Vec<usize>]>::to_vec)
            .collect()
    }

    /// Register name of the element at `coord`
    pub fn element_name(&self, coord: &[usize]) -> String {
        let mut name = self.stream_id.clone();
        for c in coord {
            name.push('_');
            name.push_str(&c.to_string());
        }
        name
    }
}

/// Coordinate suffix used in state names
pub fn coordinate_suffix(coord: &[usize]) -> String {
    coord
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("_")
}

/// Buffer elements of one stream, stored flat in row-major order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferArena<T> {
    stream_id: String,
    extents: Vec<usize>,
    slots: Vec<T>,
}

impl<T: Clone> BufferArena<T> {
    pub fn new(stream_id: impl Into<String>, extents: &[usize], fill: T) -> Self {
        Self {
            stream_id: stream_id.into(),
            extents: extents.to_vec(),
            slots: vec![fill; extents.iter().product()],
        }
    }

    pub fn for_stream(geometry: &StreamGeometry, fill: T) -> Self {
        Self::new(geometry.stream_id.clone(), &geometry.window(), fill)
    }

    /// Row-major flat index of `coord`
    pub fn index(&self, coord: &[usize]) -> SynthesisResult<usize> {
        if coord.len() != self.extents.len()
            || coord.iter().zip(&self.extents).any(|(c, e)| c >= e)
        {
            return Err(SynthesisError::coordinate_not_found(&self.stream_id, coord));
        }
        Ok(coord
            .iter()
            .zip(&self.extents)
            .fold(0, |acc, (c, e)| acc * e + c))
    }

    pub fn get(&self, coord: &[usize]) -> SynthesisResult<&T> {
        let i = self.index(coord)?;
        Ok(&self.slots[i])
    }

    pub fn set(&mut self, coord: &[usize], value: T) -> SynthesisResult<()> {
        let i = self.index(coord)?;
        self.slots[i] = value;
        Ok(())
    }

    /// Shift the row holding `coord` one place toward 0 and write `value`
    /// into its last slot
    pub fn shift_row(&mut self, row: &[usize], value: T) -> SynthesisResult<()> {
        let len = *self.extents.last().unwrap_or(&1);
        let mut first = row.to_vec();
        first.push(0);
        let start = self.index(&first)?;
        self.slots[start..start + len].rotate_left(1);
        self.slots[start + len - 1] = value;
        Ok(())
    }

    /// Every slot in row-major order
    pub fn values(&self) -> &[T] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
