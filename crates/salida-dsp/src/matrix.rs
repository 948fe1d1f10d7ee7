//! Channel up/downmix.
//!
//! The mix is described by an `out_channels x in_channels` gain matrix cut
//! from a full 18x18 speaker table. The table starts as identity over the
//! input layout and then reroutes channels the output layout lacks:
//!
//! 1. sides fold into backs;
//! 2. back-center splits into both backs; backs fold into back-center at
//!    0.7071, else into sides, else into fronts at 0.7071;
//! 3. front-center splits into left/right at 0.7071; a missing front left
//!    or right is pulled from the center at 0.7071.
//!
//! When the input and output layouts match, the stage is a pass-through and
//! never touches the chunk.

use salida_core::{ChannelMask, Chunk, SampleFormat, Speaker, SPEAKERS};

use crate::stage::{Stage, StageParams};

fn feed(table: &mut [f32; 18 * 18], source: Speaker, target: Speaker, multiplier: f32) {
    let src_row: [f32; 18] = table[18 * source.index()..18 * (source.index() + 1)]
        .try_into()
        .unwrap_or([0.0; 18]);
    let dst = &mut table[18 * target.index()..18 * (target.index() + 1)];
    for (d, s) in dst.iter_mut().zip(src_row) {
        *d += s * multiplier;
    }
}

fn clear(table: &mut [f32; 18 * 18], target: Speaker) {
    table[18 * target.index()..18 * (target.index() + 1)].fill(0.0);
}

fn build_full_table(input: ChannelMask, output: ChannelMask) -> [f32; 18 * 18] {
    use Speaker::*;

    let mut table = [0.0_f32; 18 * 18];
    for speaker in SPEAKERS {
        if input.contains(speaker) {
            table[18 * speaker.index() + speaker.index()] = 1.0;
        }
    }

    // Mix side
    if !output.contains(SideLeft) {
        feed(&mut table, SideLeft, BackLeft, 1.0);
        clear(&mut table, SideLeft);
    }
    if !output.contains(SideRight) {
        feed(&mut table, SideRight, BackRight, 1.0);
        clear(&mut table, SideRight);
    }

    // Mix back
    if !output.contains(BackCenter) {
        feed(&mut table, BackCenter, BackLeft, 1.0);
        feed(&mut table, BackCenter, BackRight, 1.0);
        clear(&mut table, BackCenter);
    }
    if !output.contains(BackLeft) {
        if output.contains(BackCenter) {
            feed(&mut table, BackLeft, BackCenter, 0.7071);
        } else if output.contains(SideLeft) {
            feed(&mut table, BackLeft, SideLeft, 1.0);
        } else {
            feed(&mut table, BackLeft, FrontLeft, 0.7071);
        }
        clear(&mut table, BackLeft);
    }
    if !output.contains(BackRight) {
        if output.contains(BackCenter) {
            feed(&mut table, BackRight, BackCenter, 0.7071);
        } else if output.contains(SideRight) {
            feed(&mut table, BackRight, SideRight, 1.0);
        } else {
            feed(&mut table, BackRight, FrontRight, 0.7071);
        }
        clear(&mut table, BackRight);
    }

    // Mix front
    if !output.contains(FrontCenter) {
        feed(&mut table, FrontCenter, FrontLeft, 0.7071);
        feed(&mut table, FrontCenter, FrontRight, 0.7071);
        clear(&mut table, FrontCenter);
    }
    if !output.contains(FrontLeft) && output.contains(FrontCenter) {
        feed(&mut table, FrontLeft, FrontCenter, 0.7071);
        clear(&mut table, FrontLeft);
    }
    if !output.contains(FrontRight) && output.contains(FrontCenter) {
        feed(&mut table, FrontRight, FrontCenter, 0.7071);
        clear(&mut table, FrontRight);
    }

    table
}

fn build_matrix(
    input_channels: usize,
    input_mask: ChannelMask,
    output_channels: usize,
    output_mask: ChannelMask,
) -> Vec<f32> {
    let full = build_full_table(input_mask, output_mask);
    let mut matrix = vec![0.0_f32; input_channels * output_channels];

    for (y, out_speaker) in output_mask.speakers().take(output_channels).enumerate() {
        for (x, in_speaker) in input_mask.speakers().take(input_channels).enumerate() {
            matrix[y * input_channels + x] = full[out_speaker.index() * 18 + in_speaker.index()];
        }
    }

    matrix
}

/// The channel mixing stage.
#[derive(Default)]
pub struct ChannelMatrix {
    matrix: Option<Vec<f32>>,
    input_channels: u32,
    output_channels: u32,
}

impl ChannelMatrix {
    /// An uninitialized (pass-through) matrix.
    pub fn new() -> ChannelMatrix {
        ChannelMatrix::default()
    }

    /// Precompute the gain matrix for an input/output layout pair.
    pub fn initialize(
        &mut self,
        input_channels: u32,
        input_mask: ChannelMask,
        output_channels: u32,
        output_mask: ChannelMask,
    ) {
        self.matrix = (input_channels != output_channels || input_mask != output_mask).then(|| {
            build_matrix(
                input_channels as usize,
                input_mask,
                output_channels as usize,
                output_mask,
            )
        });
        self.input_channels = input_channels;
        self.output_channels = output_channels;
    }
}

impl Stage for ChannelMatrix {
    fn name(&self) -> &'static str {
        "matrix"
    }

    fn active(&self) -> bool {
        self.matrix.is_some()
    }

    fn process(&mut self, chunk: &mut Chunk, _params: &StageParams) {
        let Some(matrix) = &self.matrix else {
            return;
        };
        if chunk.is_empty() {
            return;
        }

        chunk.to_float();
        debug_assert_eq!(chunk.channels(), self.input_channels);

        let in_ch = self.input_channels as usize;
        let out_ch = self.output_channels as usize;
        let frames = chunk.frame_count();

        let mut output = Chunk::new(SampleFormat::Float32, self.output_channels, frames, chunk.rate());
        {
            let input_data = chunk.samples_f32();
            let output_data = output.samples_f32_mut();
            for frame in 0..frames {
                for y in 0..out_ch {
                    let mut acc = 0.0_f32;
                    for x in 0..in_ch {
                        acc += input_data[frame * in_ch + x] * matrix[y * in_ch + x];
                    }
                    output_data[frame * out_ch + y] = acc;
                }
            }
        }

        *chunk = output;
    }
}
