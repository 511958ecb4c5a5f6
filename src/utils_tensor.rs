use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Shape, Tensor, WithDType};
use tracing::span;

// Get the device to use for the tensor operations
// Originally from: https://github.com/huggingface/candle/blob/314630638d8f6886c07d73211d6c35f8cf05d56a/candle-examples/src/lib.rs#L9
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::info!(
                "Running on CPU, to run on GPU(metal), build with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::info!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

pub fn full<S: Into<Shape>, D: WithDType>(
    shape: S,
    fill_value: D,
    dtype: DType,
    device: &Device,
) -> candle_core::Result<Tensor> {
    Tensor::new(&[fill_value], device)?
        .to_dtype(dtype)?
        .broadcast_as(shape)
}

// Replace the entries of xs where mask is non zero by value
pub fn masked_fill<D: WithDType>(
    xs: &Tensor,
    mask: &Tensor,
    value: D,
) -> candle_core::Result<Tensor> {
    let span = span!(tracing::Level::TRACE, "masked-fill");
    let _enter = span.enter();

    let on_true = full(xs.shape(), value, xs.dtype(), xs.device())?;
    mask.broadcast_as(xs.shape())?.where_cond(&on_true, xs)
}

// (t, t) u8 mask, 1 above the diagonal where a position would see the future
pub fn causal_mask(t: usize, device: &Device) -> candle_core::Result<Tensor> {
    let mask: Vec<u8> = (0..t)
        .flat_map(|i| (0..t).map(move |j| u8::from(j > i)))
        .collect();
    Tensor::from_slice(&mask, (t, t), device)
}

#[cfg(test)]
mod utils_tensor_tests {
    use super::*;

    #[test]
    fn causal_mask_hides_the_future() -> candle_core::Result<()> {
        let mask = causal_mask(3, &Device::Cpu)?;
        assert_eq!(
            mask.to_vec2::<u8>()?,
            vec![vec![0, 1, 1], vec![0, 0, 1], vec![0, 0, 0]]
        );
        Ok(())
    }

    #[test]
    fn masked_fill_replaces_masked_entries() -> candle_core::Result<()> {
        let xs = Tensor::ones((2, 2), DType::F32, &Device::Cpu)?;
        let mask = causal_mask(2, &Device::Cpu)?;
        let out = masked_fill(&xs, &mask, f32::NEG_INFINITY)?;
        let out = out.to_vec2::<f32>()?;
        assert_eq!(out[0][0], 1.0);
        assert_eq!(out[0][1], f32::NEG_INFINITY);
        assert_eq!(out[1], vec![1.0, 1.0]);
        Ok(())
    }
}
