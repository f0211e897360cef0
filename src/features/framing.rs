//! Data-framing contract of the audio front end.
//!
//! The spectral/cepstral pipeline itself (windowing, FFT, mel filterbank,
//! DCT) runs outside this engine; what the convolution consumes is its
//! output tensor, and this module pins down that boundary: how raw samples
//! map to frames, how many frames a buffer yields, and the rank-4 shapes the
//! frames arrive in. Feature tensors use the same row-major addressing as
//! every kernel, with frames on the height axis and coefficients on the
//! width axis.

use crate::tensor::offset;

/// Framing geometry of the feature extractor feeding the reference network.
/// Fixed at model-compile time; these are configuration, not engine
/// behavior.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Samples per analysis window.
    pub window_length: usize,
    /// Samples the window advances between frames.
    pub step_length: usize,
    /// Transform length; at least `window_length`.
    pub fft_length: usize,
    /// Squared-magnitude spectral energies per frame, `fft_length / 2 + 1`.
    pub frequency_channels: usize,
    /// Cepstral coefficients kept per frame after the DCT.
    pub cepstral_coefficients: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            window_length: 640,
            step_length: 320,
            fft_length: 1024,
            frequency_channels: 513,
            cepstral_coefficients: 30,
        }
    }
}

impl FrameConfig {
    pub fn new(
        window_length: usize,
        step_length: usize,
        fft_length: usize,
        cepstral_coefficients: usize,
    ) -> Self {
        assert!(window_length >= 2, "window must hold at least two samples");
        assert!(step_length >= 1, "step must advance");
        assert!(fft_length >= window_length, "transform shorter than window");
        Self {
            window_length,
            step_length,
            fft_length,
            frequency_channels: frequency_channels_for(fft_length),
            cepstral_coefficients,
        }
    }

    /// Complete frames a sample buffer yields: one per full window, advancing
    /// by the step length.
    pub fn num_frames(&self, samples: usize) -> usize {
        if samples < self.window_length {
            return 0;
        }
        (samples - self.window_length) / self.step_length + 1
    }

    /// First sample index of a frame.
    pub fn frame_start(&self, frame: usize) -> usize {
        frame * self.step_length
    }

    /// Shape of the squared-magnitude spectrogram tensor for a sample buffer.
    pub fn spectrogram_shape(&self, samples: usize) -> [usize; 4] {
        [1, self.num_frames(samples), self.frequency_channels, 1]
    }

    /// Shape of the cepstral feature tensor handed to the convolution engine.
    pub fn feature_shape(&self, samples: usize) -> [usize; 4] {
        [1, self.num_frames(samples), self.cepstral_coefficients, 1]
    }
}

/// Frequency channels a real transform of the given length produces.
pub fn frequency_channels_for(fft_length: usize) -> usize {
    fft_length / 2 + 1
}

/// Linear offset of one coefficient in a feature tensor, through the same
/// addressing the kernels use.
pub fn feature_offset(shape: &[usize], frame: usize, coefficient: usize) -> usize {
    offset(shape, 0, frame, coefficient, 0)
}
