use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;

use crate::Result;

pub const DEFAULT_STRENGTH: f64 = 0.75;

/// Mode-specific inputs next to the prompt.
#[derive(Debug, Clone)]
pub struct ExtraInputs {
    /// Source image for image-to-image and inpainting.
    pub init_image: Option<DynamicImage>,
    /// White marks the region to repaint.
    pub mask: Option<DynamicImage>,
    /// How far from the source image the result may move, in [0, 1].
    pub strength: f64,
}

impl Default for ExtraInputs {
    fn default() -> Self {
        Self {
            init_image: None,
            mask: None,
            strength: DEFAULT_STRENGTH,
        }
    }
}

/// Resizes `image` to `width` x `height` and returns a `(1, 3, h, w)` tensor in [-1, 1].
pub fn image_to_tensor(image: &DynamicImage, width: usize, height: usize, device: &Device) -> Result<Tensor> {
    let rgb = image
        .resize_exact(width as u32, height as u32, FilterType::Triangle)
        .to_rgb8()
        .into_raw();
    let tensor = Tensor::from_vec(rgb, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    let tensor = ((tensor / 127.5)? - 1.0)?.unsqueeze(0)?;
    Ok(tensor.to_device(device)?)
}

/// Binarized `(1, 1, h, w)` mask, 1.0 where the image is repainted.
pub fn mask_to_tensor(mask: &DynamicImage, width: usize, height: usize, device: &Device) -> Result<Tensor> {
    let luma = mask
        .resize_exact(width as u32, height as u32, FilterType::Nearest)
        .to_luma8()
        .into_raw();
    let values: Vec<f32> = luma.into_iter().map(|v| if v >= 128 { 1.0 } else { 0.0 }).collect();
    Ok(Tensor::from_vec(values, (1, 1, height, width), &Device::Cpu)?.to_device(device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    #[test]
    fn images_become_signed_tensors() -> Result<()> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([255, 0, 255])));
        let tensor = image_to_tensor(&image, 8, 16, &Device::Cpu)?;
        assert_eq!(tensor.dims(), &[1, 3, 16, 8]);
        let pixel = tensor.flatten_from(2)?.narrow(2, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(pixel, vec![1.0, -1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn masks_are_binarized() -> Result<()> {
        let mut mask = GrayImage::from_pixel(2, 1, Luma([0]));
        mask.put_pixel(1, 0, Luma([200]));
        let tensor = mask_to_tensor(&DynamicImage::ImageLuma8(mask), 2, 1, &Device::Cpu)?;
        assert_eq!(tensor.flatten_all()?.to_vec1::<f32>()?, vec![0.0, 1.0]);
        Ok(())
    }
}
