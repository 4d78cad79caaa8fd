//! Quantized Convolution Kernels
//!
//! # Overview
//!
//! 2D convolution over 4-bit quantized filters for the image models:
//! - [`conv2d_q4`]: standard convolution, every output channel sees every
//!   input channel
//! - [`depthwise_conv2d_q4`]: one filter per channel, channels stay
//!   independent
//!
//! # Layout
//!
//! Activations are CHW (`channel * h * w + y * w + x`). Standard filters
//! are stored im2col style: one matrix row per output channel holding
//! `in_channels * kernel_h * kernel_w` weights, so each output position is
//! one quantized matrix-vector product against the gathered patch.
//! Depthwise filters are one matrix row of `kernel_h * kernel_w` weights
//! per channel. Padding is zero-fill.

use crate::errors::{EngineError, EngineResult};
use crate::quantize::QuantizedMatrix4;
use crate::simd::Kernels;

/// Convolution geometry
#[derive(Debug, Clone, Copy)]
pub struct Conv2dParams {
    pub in_h: usize,
    pub in_w: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2dParams {
    /// Output height and width
    pub fn output_dims(&self) -> EngineResult<(usize, usize)> {
        if self.stride == 0 {
            return Err(EngineError::InvalidArgument {
                what: "stride must be non-zero".into(),
            });
        }
        let padded_h = self.in_h + 2 * self.padding;
        let padded_w = self.in_w + 2 * self.padding;
        if self.kernel_h == 0 || self.kernel_w == 0 || padded_h < self.kernel_h || padded_w < self.kernel_w
        {
            return Err(EngineError::InvalidShape {
                context: format!(
                    "kernel {}x{} over padded input {}x{}",
                    self.kernel_h, self.kernel_w, padded_h, padded_w
                ),
            });
        }
        Ok((
            (padded_h - self.kernel_h) / self.stride + 1,
            (padded_w - self.kernel_w) / self.stride + 1,
        ))
    }
}

/// Standard quantized convolution
///
/// `weights` is `(out_channels, in_channels * kernel_h * kernel_w)`;
/// `input` is CHW; `out` receives `(out_channels, out_h, out_w)` CHW.
/// `bias`, when present, has one entry per output channel.
pub fn conv2d_q4(
    kernels: &Kernels,
    out: &mut [f32],
    input: &[f32],
    weights: &QuantizedMatrix4,
    bias: Option<&[f32]>,
    p: &Conv2dParams,
) -> EngineResult<()> {
    let (out_h, out_w) = p.output_dims()?;
    let patch_len = p.in_channels * p.kernel_h * p.kernel_w;

    if weights.rows != p.out_channels || weights.cols != patch_len {
        return Err(EngineError::InvalidShape {
            context: format!(
                "conv filter {}x{}, expected {}x{}",
                weights.rows, weights.cols, p.out_channels, patch_len
            ),
        });
    }
    if input.len() != p.in_channels * p.in_h * p.in_w {
        return Err(EngineError::InvalidShape {
            context: format!("conv input {} for {:?}", input.len(), p),
        });
    }
    if out.len() != p.out_channels * out_h * out_w {
        return Err(EngineError::InvalidShape {
            context: format!(
                "conv output {} for {}x{}x{}",
                out.len(),
                p.out_channels,
                out_h,
                out_w
            ),
        });
    }
    if let Some(b) = bias {
        if b.len() != p.out_channels {
            return Err(EngineError::InvalidShape {
                context: format!("conv bias {} for {} channels", b.len(), p.out_channels),
            });
        }
    }

    let mut patch = vec![0.0f32; patch_len];
    let mut column = vec![0.0f32; p.out_channels];
    for oy in 0..out_h {
        for ox in 0..out_w {
            gather_patch(&mut patch, input, p, oy, ox, None);
            kernels.matmul_q4_vec(&mut column, weights, &patch)?;
            for oc in 0..p.out_channels {
                let mut v = column[oc];
                if let Some(b) = bias {
                    v += b[oc];
                }
                out[oc * out_h * out_w + oy * out_w + ox] = v;
            }
        }
    }
    Ok(())
}

/// Depthwise quantized convolution
///
/// `weights` is `(channels, kernel_h * kernel_w)`; channel `c` of the
/// output depends only on channel `c` of the input.
/// `out_channels` must equal `in_channels`.
pub fn depthwise_conv2d_q4(
    kernels: &Kernels,
    out: &mut [f32],
    input: &[f32],
    weights: &QuantizedMatrix4,
    bias: Option<&[f32]>,
    p: &Conv2dParams,
) -> EngineResult<()> {
    if p.out_channels != p.in_channels {
        return Err(EngineError::InvalidShape {
            context: format!(
                "depthwise convolution with {} in, {} out channels",
                p.in_channels, p.out_channels
            ),
        });
    }
    let (out_h, out_w) = p.output_dims()?;
    let filter_len = p.kernel_h * p.kernel_w;

    if weights.rows != p.in_channels || weights.cols != filter_len {
        return Err(EngineError::InvalidShape {
            context: format!(
                "depthwise filter {}x{}, expected {}x{}",
                weights.rows, weights.cols, p.in_channels, filter_len
            ),
        });
    }
    if input.len() != p.in_channels * p.in_h * p.in_w {
        return Err(EngineError::InvalidShape {
            context: format!("depthwise input {} for {:?}", input.len(), p),
        });
    }
    if out.len() != p.in_channels * out_h * out_w {
        return Err(EngineError::InvalidShape {
            context: format!("depthwise output {}", out.len()),
        });
    }
    if let Some(b) = bias {
        if b.len() != p.in_channels {
            return Err(EngineError::InvalidShape {
                context: format!("depthwise bias {} for {} channels", b.len(), p.in_channels),
            });
        }
    }

    let mut patch = vec![0.0f32; filter_len];
    let mut filter = vec![0.0f32; filter_len];
    for c in 0..p.in_channels {
        // Decode this channel's filter row once
        for (i, slot) in filter.iter_mut().enumerate() {
            *slot = weights.value(c * filter_len + i);
        }
        for oy in 0..out_h {
            for ox in 0..out_w {
                gather_patch(&mut patch, input, p, oy, ox, Some(c));
                let mut v = kernels.dot(&filter, &patch);
                if let Some(b) = bias {
                    v += b[c];
                }
                out[c * out_h * out_w + oy * out_w + ox] = v;
            }
        }
    }
    Ok(())
}

/// Gather one receptive field into `patch`, zero-filling padding
///
/// `only_channel` restricts the gather to a single channel (depthwise).
fn gather_patch(
    patch: &mut [f32],
    input: &[f32],
    p: &Conv2dParams,
    oy: usize,
    ox: usize,
    only_channel: Option<usize>,
) {
    let channels: Box<dyn Iterator<Item = usize>> = match only_channel {
        Some(c) => Box::new(std::iter::once(c)),
        None => Box::new(0..p.in_channels),
    };

    let mut w_idx = 0;
    for c in channels {
        for ky in 0..p.kernel_h {
            for kx in 0..p.kernel_w {
                let iy = (oy * p.stride + ky) as isize - p.padding as isize;
                let ix = (ox * p.stride + kx) as isize - p.padding as isize;
                patch[w_idx] = if iy >= 0
                    && ix >= 0
                    && (iy as usize) < p.in_h
                    && (ix as usize) < p.in_w
                {
                    input[c * p.in_h * p.in_w + iy as usize * p.in_w + ix as usize]
                } else {
                    0.0
                };
                w_idx += 1;
            }
        }
    }
}
