//! The pipeline stage interface.
//!
//! Every DSP stage consumes a [`Chunk`] in place: a stage may rewrite the
//! samples, replace the chunk with a differently-sized one (resampling,
//! mixing), hold frames back (lookahead limiting), or leave the chunk
//! untouched when inactive. `finish` flushes whatever a stage holds back;
//! for stateless stages it is just another `process` call.
//!
//! Per-call parameters arrive as a [`StageParams`] snapshot taken by the
//! renderer under its lock, so stages never reach back into the renderer.

use salida_core::Chunk;

/// Parameter snapshot passed to every stage invocation.
#[derive(Clone, Copy, Debug)]
pub struct StageParams {
    /// Master volume in `[0, 1]`.
    pub volume: f32,
    /// Stereo balance in `[-1, 1]`; `0` is centered.
    pub balance: f32,
}

impl Default for StageParams {
    fn default() -> StageParams {
        StageParams {
            volume: 1.0,
            balance: 0.0,
        }
    }
}

/// A stage of the DSP pipeline.
pub trait Stage {
    /// Stage name for diagnostics.
    fn name(&self) -> &'static str;

    /// Whether the stage will touch audio in its current configuration.
    fn active(&self) -> bool;

    /// Run the stage over one chunk in place.
    fn process(&mut self, chunk: &mut Chunk, params: &StageParams);

    /// Flush internal state at end of stream. The chunk carries any frames
    /// produced by upstream stages' own flushes; stages append to it.
    fn finish(&mut self, chunk: &mut Chunk, params: &StageParams) {
        self.process(chunk, params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inverter;

    impl Stage for Inverter {
        fn name(&self) -> &'static str {
            "invert"
        }
        fn active(&self) -> bool {
            true
        }
        fn process(&mut self, chunk: &mut Chunk, _params: &StageParams) {
            for sample in chunk.samples_f32_mut() {
                *sample = -*sample;
            }
        }
    }

    #[test]
    fn test_default_finish_processes() {
        use salida_core::SampleFormat;

        let mut chunk = Chunk::new(SampleFormat::Float32, 1, 4, 48_000);
        chunk.samples_f32_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);

        let mut stage = Inverter;
        stage.finish(&mut chunk, &StageParams::default());
        assert_eq!(chunk.samples_f32(), &[-1.0, -2.0, -3.0, -4.0]);
    }
}
