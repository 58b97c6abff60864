use image::DynamicImage;
use image_hasher::{HashAlg, HasherConfig};

pub fn compute_phash(frame: &DynamicImage) -> String {
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::DoubleGradient)
        .hash_size(8, 8)
        .to_hasher();

    hasher.hash_image(frame).to_base64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn identical_frames_hash_identically() {
        let frame = DynamicImage::ImageRgb8(RgbImage::from_fn(64, 48, |x, y| {
            Rgb([(x * 4) as u8, (y * 5) as u8, 128])
        }));
        assert_eq!(compute_phash(&frame), compute_phash(&frame.clone()));
        assert!(!compute_phash(&frame).is_empty());
    }
}
