//! The nested encoder-decoder topology.
//!
//! Feature blocks sit in a triangular grid indexed by `(level, stage)`:
//! going down a level halves the spatial resolution and doubles the channel
//! width, going right a stage refines a level's features by mixing everything
//! the level has produced so far with an upsampled view from the level below.
//! The grid is a dependency DAG, so the model holds an explicit list of nodes
//! and a precomputed evaluation order rather than a hand-written call chain.

use std::ops::Range;

use ndarray::prelude::*;

use crate::array_util::concat_channels;
use crate::layers::{DsConv2d, FeatureBlock, MaxPool2d, Sigmoid, Upsample2d};
use crate::{seed, ActivationFn, Layer};

/// Channel width at each depth level of the grid.
pub const WIDTHS: [usize; 5] = [64, 128, 256, 512, 1024];

const LEVELS: usize = WIDTHS.len();

/// One node of the topology grid: a feature block plus the region of the
/// model's flat parameter vector that belongs to it.
#[derive(Debug)]
struct GridNode {
    level: usize,
    stage: usize,
    block: FeatureBlock,
    params: Range<usize>,
}

/// A 1×1 projection from a top-row node down to `num_classes` channels.
#[derive(Debug)]
struct Head {
    conv: DsConv2d,
    params: Range<usize>,
}

/// What a forward pass returns, fixed at construction time.
#[derive(Debug)]
pub enum Prediction {
    /// Per-pixel probabilities from the most refined node, each in (0, 1).
    Mask(Array4<f32>),
    /// Raw multi-scale outputs for deep supervision, ordered least to most
    /// refined. No sigmoid is applied; the training loss is expected to
    /// bring its own.
    DeepSupervision(Vec<Array4<f32>>),
}

/// Nested U-Net with depthwise-separable convolutions.
#[derive(Debug)]
pub struct NestedUnet {
    num_classes: usize,
    input_channels: usize,
    deep_supervision: bool,
    nodes: Vec<GridNode>,
    heads: Vec<Head>,
    eval_order: Vec<(usize, usize)>,
    pool: MaxPool2d,
    up: Upsample2d,
    params: Array1<f32>,
}

/// Number of input channels the block at `(level, stage)` takes.
///
/// A stage-0 block consumes the previous level's (pooled) output; a later
/// stage concatenates all earlier outputs of its own level with one upsampled
/// output from the level below.
fn grid_in_channels(level: usize, stage: usize, input_channels: usize) -> usize {
    if stage == 0 {
        if level == 0 {
            input_channels
        } else {
            WIDTHS[level - 1]
        }
    } else {
        stage * WIDTHS[level] + WIDTHS[level + 1]
    }
}

impl NestedUnet {
    /// Build the model and initialize its parameters from the process-wide
    /// generator (see [`crate::seed`]). For a reproducible initialization,
    /// call [`crate::seed::make_deterministic`] first.
    pub fn new(num_classes: usize, input_channels: usize, deep_supervision: bool) -> Self {
        assert!(num_classes > 0, "num_classes must be positive");
        assert!(input_channels > 0, "input_channels must be positive");

        // Stage-major order is a topological sort of the grid: (d, s) reads
        // from (d, 0..s) and (d+1, s-1), all of which come earlier.
        let mut eval_order = Vec::new();
        for stage in 0..LEVELS {
            for level in 0..LEVELS - stage {
                eval_order.push((level, stage));
            }
        }

        let mut offset = 0;
        let nodes: Vec<GridNode> = eval_order
            .iter()
            .map(|&(level, stage)| {
                let in_channels = grid_in_channels(level, stage, input_channels);
                let block = FeatureBlock::new(in_channels, WIDTHS[level], WIDTHS[level]);
                let params = offset..offset + block.num_params();
                offset = params.end;
                GridNode {
                    level,
                    stage,
                    block,
                    params,
                }
            })
            .collect();

        let head_stages: &[usize] = if deep_supervision { &[1, 2, 3, 4] } else { &[4] };
        let heads: Vec<Head> = head_stages
            .iter()
            .map(|_| {
                let conv = DsConv2d::new(WIDTHS[0], num_classes, 1, 0);
                let params = offset..offset + conv.num_params();
                offset = params.end;
                Head { conv, params }
            })
            .collect();

        let mut params = Array1::zeros(offset);
        seed::with_rng(|rng| {
            for node in &nodes {
                node.block
                    .init_params(params.slice_mut(s![node.params.clone()]), rng);
            }
            for head in &heads {
                head.conv
                    .init_params(params.slice_mut(s![head.params.clone()]), rng);
            }
        });

        NestedUnet {
            num_classes,
            input_channels,
            deep_supervision,
            nodes,
            heads,
            eval_order,
            pool: MaxPool2d::new(2),
            up: Upsample2d::new(2),
            params,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    pub fn deep_supervision(&self) -> bool {
        self.deep_supervision
    }

    /// The feature block at grid position `(level, stage)`.
    pub fn block(&self, level: usize, stage: usize) -> &FeatureBlock {
        &self.node(level, stage).block
    }

    /// The order nodes are evaluated in, a topological sort of the grid.
    pub fn eval_order(&self) -> &[(usize, usize)] {
        &self.eval_order
    }

    /// Total number of learned parameters, heads included.
    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    /// The flat parameter vector. Mutation is the training procedure's job;
    /// this crate only initializes and reads it.
    pub fn params(&self) -> ArrayView1<'_, f32> {
        self.params.view()
    }

    pub fn params_mut(&mut self) -> ArrayViewMut1<'_, f32> {
        self.params.view_mut()
    }

    fn node(&self, level: usize, stage: usize) -> &GridNode {
        self.nodes
            .iter()
            .find(|n| n.level == level && n.stage == stage)
            .unwrap_or_else(|| panic!("no grid node at ({level}, {stage})"))
    }

    fn node_params(&self, node: &GridNode) -> ArrayView1<'_, f32> {
        self.params.slice(s![node.params.clone()])
    }

    /// Run the model on a batch of images shaped
    /// `(batch, input_channels, height, width)`.
    ///
    /// Height and width must be divisible by 16: the encoder halves the
    /// resolution four times, and an indivisible size makes the upsampled
    /// tensors one pixel short at concatenation, which panics there with a
    /// shape mismatch.
    pub fn forward(&self, x: ArrayView4<'_, f32>) -> Prediction {
        assert_eq!(
            x.len_of(Axis(1)),
            self.input_channels,
            "incompatible number of channels: images={}, model={}",
            x.len_of(Axis(1)),
            self.input_channels
        );

        let no_params = self.params.slice(s![0..0]);
        let mut grid: Vec<Vec<Option<Array4<f32>>>> =
            (0..LEVELS).map(|level| vec![None; LEVELS - level]).collect();

        for &(level, stage) in &self.eval_order {
            let input = if stage == 0 {
                if level == 0 {
                    x.to_owned()
                } else {
                    let above = grid[level - 1][0].as_ref().expect("evaluated earlier");
                    self.pool.forward(no_params, above.view())
                }
            } else {
                let below = grid[level + 1][stage - 1].as_ref().expect("evaluated earlier");
                let upsampled = self.up.forward(no_params, below.view());
                // Argument order is a correctness invariant: same-level
                // outputs by stage, then the upsampled deeper output.
                let mut parts: Vec<ArrayView4<'_, f32>> = (0..stage)
                    .map(|s| grid[level][s].as_ref().expect("evaluated earlier").view())
                    .collect();
                parts.push(upsampled.view());
                concat_channels(&parts)
            };
            let node = self.node(level, stage);
            grid[level][stage] = Some(node.block.forward(self.node_params(node), input.view()));
        }

        if self.deep_supervision {
            let outputs = self
                .heads
                .iter()
                .zip(1..)
                .map(|(head, stage)| {
                    let x = grid[0][stage].as_ref().expect("evaluated earlier");
                    head.conv
                        .forward(self.params.slice(s![head.params.clone()]), x.view())
                })
                .collect();
            Prediction::DeepSupervision(outputs)
        } else {
            let head = &self.heads[0];
            let x = grid[0][LEVELS - 1].as_ref().expect("evaluated earlier");
            let mut out = head
                .conv
                .forward(self.params.slice(s![head.params.clone()]), x.view());
            out.mapv_inplace(|v| Sigmoid.f(v));
            Prediction::Mask(out)
        }
    }
}

impl Default for NestedUnet {
    /// Binary segmentation of RGB images, single output.
    fn default() -> Self {
        NestedUnet::new(1, 3, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_is_lower_triangular() {
        let model = NestedUnet::default();
        assert_eq!(model.eval_order().len(), 15);
        for &(level, stage) in model.eval_order() {
            assert!(level + stage < LEVELS);
        }
    }

    #[test]
    fn eval_order_is_topological() {
        let model = NestedUnet::default();
        let position = |level: usize, stage: usize| {
            model
                .eval_order()
                .iter()
                .position(|&n| n == (level, stage))
                .unwrap()
        };
        for &(level, stage) in model.eval_order() {
            let here = position(level, stage);
            if stage == 0 {
                if level > 0 {
                    assert!(position(level - 1, 0) < here);
                }
            } else {
                for s in 0..stage {
                    assert!(position(level, s) < here);
                }
                assert!(position(level + 1, stage - 1) < here);
            }
        }
    }

    #[test]
    fn interior_channel_counts_follow_the_width_table() {
        let model = NestedUnet::new(1, 3, false);
        for &(level, stage) in model.eval_order() {
            if stage == 0 {
                continue;
            }
            assert_eq!(
                model.block(level, stage).in_channels(),
                stage * WIDTHS[level] + WIDTHS[level + 1],
                "wrong input width at ({level}, {stage})"
            );
        }
    }

    #[test]
    fn stage_zero_channel_counts() {
        let model = NestedUnet::new(1, 7, false);
        assert_eq!(model.block(0, 0).in_channels(), 7);
        for level in 1..LEVELS {
            assert_eq!(model.block(level, 0).in_channels(), WIDTHS[level - 1]);
        }
        for &(level, stage) in model.eval_order() {
            assert_eq!(model.block(level, stage).out_channels(), WIDTHS[level]);
        }
    }

    #[test]
    fn head_count_follows_output_mode() {
        assert_eq!(NestedUnet::new(2, 3, false).heads.len(), 1);
        assert_eq!(NestedUnet::new(2, 3, true).heads.len(), 4);
    }

    #[test]
    fn parameter_regions_tile_the_vector() {
        let model = NestedUnet::new(1, 3, true);
        let mut end = 0;
        for node in &model.nodes {
            assert_eq!(node.params.start, end);
            assert_eq!(node.params.len(), node.block.num_params());
            end = node.params.end;
        }
        for head in &model.heads {
            assert_eq!(head.params.start, end);
            end = head.params.end;
        }
        assert_eq!(end, model.num_params());
    }

    #[test]
    #[should_panic(expected = "num_classes must be positive")]
    fn zero_classes_rejected() {
        NestedUnet::new(0, 3, false);
    }
}
