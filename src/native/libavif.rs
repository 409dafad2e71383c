// SPDX-License-Identifier: MPL-2.0

//! [`NativeDecoder`] backed by libavif (dav1d codec).

use std::{ffi::CStr, ptr::NonNull, sync::Arc, time::Duration};

use libavif_sys::*;

use super::{DecodedImage, DecoderFactory, ImageInfo, NativeDecoder, detection::sniff_brand};
use crate::error::DecodeFailure;

pub struct LibavifDecoder {
    decoder: NonNull<avifDecoder>,
    // libavif reads from this buffer for the lifetime of the decoder.
    data: Vec<u8>,
    parsed: bool,
}

impl LibavifDecoder {
    pub fn new() -> Result<Self, String> {
        let decoder = unsafe { avifDecoderCreate() };
        let decoder =
            NonNull::new(decoder).ok_or_else(|| "failed to create AVIF decoder".to_string())?;
        Ok(Self {
            decoder,
            data: Vec::new(),
            parsed: false,
        })
    }
}

/// Factory producing a fresh [`LibavifDecoder`] on the worker thread.
#[must_use]
pub fn factory() -> DecoderFactory {
    Arc::new(|| LibavifDecoder::new().map(|decoder| Box::new(decoder) as Box<dyn NativeDecoder>))
}

fn result_message(result: avifResult) -> String {
    let ptr = unsafe { avifResultToString(result) };
    if ptr.is_null() {
        format!("libavif error {result}")
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }
}

impl NativeDecoder for LibavifDecoder {
    fn version(&self) -> String {
        let ptr = unsafe { avifVersion() };
        if ptr.is_null() {
            return "libavif".to_string();
        }
        let version = unsafe { CStr::from_ptr(ptr) }.to_string_lossy();
        format!("libavif {version}")
    }

    fn parse(&mut self, data: Vec<u8>) -> Result<ImageInfo, DecodeFailure> {
        if self.parsed {
            return Err(DecodeFailure::Parse("decoder already holds an image".into()));
        }
        let sequence = sniff_brand(&data).is_some_and(|brand| brand.sequence);
        self.data = data;
        let decoder = self.decoder.as_ptr();

        unsafe {
            let result = avifDecoderSetIOMemory(decoder, self.data.as_ptr(), self.data.len());
            if result != AVIF_RESULT_OK {
                return Err(DecodeFailure::Parse(result_message(result)));
            }

            let result = avifDecoderParse(decoder);
            if result != AVIF_RESULT_OK {
                return Err(DecodeFailure::Parse(result_message(result)));
            }
            self.parsed = true;

            let image = (*decoder).image;
            if image.is_null() {
                return Err(DecodeFailure::Parse("missing image header".into()));
            }

            let frame_count = usize::try_from((*decoder).imageCount).unwrap_or(0);
            tracing::debug!(frame_count, sequence, "AVIF parsed");

            Ok(ImageInfo {
                width: (*image).width,
                height: (*image).height,
                depth: (*image).depth,
                frame_count,
                sequence,
            })
        }
    }

    fn next_frame(&mut self, index: usize) -> Result<Option<DecodedImage>, DecodeFailure> {
        let decoder = self.decoder.as_ptr();
        let failure = |reason: String| DecodeFailure::Frame { index, reason };

        unsafe {
            let result = avifDecoderNextImage(decoder);
            if result == AVIF_RESULT_NO_IMAGES_REMAINING {
                return Ok(None);
            }
            if result != AVIF_RESULT_OK {
                return Err(failure(result_message(result)));
            }

            let avif_image = (*decoder).image;
            if avif_image.is_null() {
                return Err(failure("null image pointer".into()));
            }

            let width = (*avif_image).width;
            let height = (*avif_image).height;

            let mut rgb: avifRGBImage = std::mem::zeroed();
            avifRGBImageSetDefaults(&mut rgb, avif_image);
            rgb.format = AVIF_RGB_FORMAT_RGBA;
            rgb.depth = 8;

            avifRGBImageAllocatePixels(&mut rgb);

            struct RgbGuard(*mut avifRGBImage);
            impl Drop for RgbGuard {
                fn drop(&mut self) {
                    unsafe { avifRGBImageFreePixels(self.0) };
                }
            }
            let _rgb_guard = RgbGuard(&mut rgb);

            let result = avifImageYUVToRGB(avif_image, &mut rgb);
            if result != AVIF_RESULT_OK {
                return Err(failure(format!(
                    "RGB conversion failed: {}",
                    result_message(result)
                )));
            }
            if rgb.pixels.is_null() {
                return Err(failure("RGB buffer allocation failed".into()));
            }

            // Rows may be padded; repack tightly.
            let packed = width as usize * 4;
            let stride = rgb.rowBytes as usize;
            let mut pixels = Vec::with_capacity(packed * height as usize);
            for row in 0..height as usize {
                let src = std::slice::from_raw_parts(rgb.pixels.add(row * stride), packed);
                pixels.extend_from_slice(src);
            }

            // imageTiming.duration is in seconds
            let seconds = (*decoder).imageTiming.duration;
            let duration = if seconds.is_finite() && seconds > 0.0 {
                Duration::from_secs_f64(seconds)
            } else {
                Duration::ZERO
            };

            Ok(Some(DecodedImage {
                pixels,
                width,
                height,
                duration,
            }))
        }
    }
}

impl Drop for LibavifDecoder {
    fn drop(&mut self) {
        unsafe { avifDecoderDestroy(self.decoder.as_ptr()) };
    }
}
