// SPDX-License-Identifier: MPL-2.0

//! Painting decoded frames onto a display surface.
//!
//! Surfaces expose an XRGB8888 canvas (little endian, the layout of
//! `wl_shm::Format::Xrgb8888`). A [`RenderSink`] converts an RGBA frame into
//! that canvas; the surface is then asked to present it.

use std::{cell::RefCell, collections::HashMap, fmt, rc::Rc};

use image::RgbaImage;
use rayon::prelude::*;

use crate::session::FrameRecord;

/// A drawable area owned by the host application.
pub trait Surface {
    fn size(&self) -> (u32, u32);

    /// Reallocate the canvas for `width` x `height`.
    fn resize(&mut self, width: u32, height: u32);

    /// Row-major XRGB8888 pixels, `width * height * 4` bytes.
    fn canvas_mut(&mut self) -> &mut [u8];

    /// Frame `index` has been painted onto the canvas.
    fn present(&mut self, index: usize);
}

pub type SharedSurface = Rc<RefCell<dyn Surface>>;

/// Converts a frame into a surface's canvas.
pub trait RenderSink {
    fn paint(&self, frame: &RgbaImage, surface: &mut dyn Surface);
}

/// Row layout of the overlap between a frame and a surface. Frames larger
/// than the surface are clipped at the right and bottom edges.
struct Overlap {
    src_stride: usize,
    dst_stride: usize,
    row_bytes: usize,
    rows: usize,
}

impl Overlap {
    fn new(frame: &RgbaImage, (width, height): (u32, u32)) -> Option<Self> {
        let copy_width = frame.width().min(width) as usize;
        let rows = frame.height().min(height) as usize;
        if copy_width == 0 || rows == 0 {
            return None;
        }
        Some(Self {
            src_stride: frame.width() as usize * 4,
            dst_stride: width as usize * 4,
            row_bytes: copy_width * 4,
            rows,
        })
    }
}

fn xrgb8888_row(dst: &mut [u8], src: &[u8]) {
    for (out, pixel) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        let r = u32::from(pixel[0]) << 16;
        let g = u32::from(pixel[1]) << 8;
        let b = u32::from(pixel[2]);

        out.copy_from_slice(&(r | g | b).to_le_bytes());
    }
}

/// Single-threaded blit.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlitSink;

impl RenderSink for BlitSink {
    fn paint(&self, frame: &RgbaImage, surface: &mut dyn Surface) {
        let Some(overlap) = Overlap::new(frame, surface.size()) else {
            return;
        };
        surface
            .canvas_mut()
            .chunks_exact_mut(overlap.dst_stride)
            .zip(frame.as_raw().chunks_exact(overlap.src_stride))
            .take(overlap.rows)
            .for_each(|(dst, src)| {
                xrgb8888_row(&mut dst[..overlap.row_bytes], &src[..overlap.row_bytes]);
            });
    }
}

/// Row-parallel blit on the rayon pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParallelSink;

impl RenderSink for ParallelSink {
    fn paint(&self, frame: &RgbaImage, surface: &mut dyn Surface) {
        let Some(overlap) = Overlap::new(frame, surface.size()) else {
            return;
        };
        surface
            .canvas_mut()
            .par_chunks_exact_mut(overlap.dst_stride)
            .zip(frame.as_raw().par_chunks_exact(overlap.src_stride))
            .take(overlap.rows)
            .for_each(|(dst, src)| {
                xrgb8888_row(&mut dst[..overlap.row_bytes], &src[..overlap.row_bytes]);
            });
    }
}

/// Pick the sink for the `webgl` option: accelerated when set.
#[must_use]
pub fn sink_for(accelerated: bool) -> Box<dyn RenderSink> {
    if accelerated {
        Box::new(ParallelSink)
    } else {
        Box::new(BlitSink)
    }
}

/// A sink bound to the surface it paints on.
pub struct Renderer {
    sink: Box<dyn RenderSink>,
    surface: SharedSurface,
}

impl Renderer {
    pub fn new(sink: Box<dyn RenderSink>, surface: SharedSurface) -> Self {
        Self { sink, surface }
    }

    pub fn render(&self, frame: &FrameRecord) {
        let mut surface = self.surface.borrow_mut();
        self.sink.paint(&frame.image, &mut *surface);
        surface.present(frame.index);
    }

    pub fn surface(&self) -> &SharedSurface {
        &self.surface
    }
}

impl fmt::Debug for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer")
            .field("size", &self.surface.borrow().size())
            .finish_non_exhaustive()
    }
}

/// Off-screen surface that records what was presented.
#[derive(Debug, Default)]
pub struct MemorySurface {
    width: u32,
    height: u32,
    canvas: Vec<u8>,
    presented: Vec<usize>,
    resizes: usize,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame indices in presentation order.
    pub fn presented(&self) -> &[usize] {
        &self.presented
    }

    pub fn resize_count(&self) -> usize {
        self.resizes
    }

    pub fn canvas(&self) -> &[u8] {
        &self.canvas
    }

    /// XRGB8888 value at (`x`, `y`).
    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let bytes = self.canvas.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl Surface for MemorySurface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.canvas = vec![0; width as usize * height as usize * 4];
        self.resizes += 1;
    }

    fn canvas_mut(&mut self) -> &mut [u8] {
        &mut self.canvas
    }

    fn present(&mut self, index: usize) {
        self.presented.push(index);
    }
}

/// Surfaces addressable by element id.
#[derive(Default)]
pub struct SurfaceRegistry {
    surfaces: RefCell<HashMap<String, SharedSurface>>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `surface` under `id`, returning any surface it replaces.
    pub fn register(&self, id: impl Into<String>, surface: SharedSurface) -> Option<SharedSurface> {
        self.surfaces.borrow_mut().insert(id.into(), surface)
    }

    pub fn unregister(&self, id: &str) -> Option<SharedSurface> {
        self.surfaces.borrow_mut().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<SharedSurface> {
        self.surfaces.borrow().get(id).cloned()
    }
}

impl fmt::Debug for SurfaceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.surfaces.borrow().keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use image::Rgba;

    use super::*;

    fn frame(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| Rgba([x as u8, y as u8, 0x80, 0xff]))
    }

    #[test]
    fn blit_converts_to_xrgb() {
        let mut surface = MemorySurface::new();
        surface.resize(3, 2);
        BlitSink.paint(&frame(3, 2), &mut surface);

        assert_eq!(surface.pixel(0, 0), Some(0x0000_0080));
        assert_eq!(surface.pixel(2, 1), Some(0x0002_0180));
    }

    #[test]
    fn parallel_matches_sequential() {
        let image = frame(17, 9);
        let mut sequential = MemorySurface::new();
        sequential.resize(17, 9);
        let mut parallel = MemorySurface::new();
        parallel.resize(17, 9);

        BlitSink.paint(&image, &mut sequential);
        ParallelSink.paint(&image, &mut parallel);

        assert_eq!(sequential.canvas(), parallel.canvas());
    }

    #[test]
    fn oversized_frames_are_clipped() {
        let mut surface = MemorySurface::new();
        surface.resize(2, 2);
        BlitSink.paint(&frame(4, 4), &mut surface);

        assert_eq!(surface.pixel(1, 1), Some(0x0001_0180));
        assert_eq!(surface.canvas().len(), 2 * 2 * 4);
    }

    #[test]
    fn unsized_surface_is_left_alone() {
        let mut surface = MemorySurface::new();
        ParallelSink.paint(&frame(2, 2), &mut surface);
        assert!(surface.canvas().is_empty());
    }

    #[test]
    fn renderer_presents_frame_index() {
        let memory = Rc::new(RefCell::new(MemorySurface::new()));
        memory.borrow_mut().resize(2, 2);
        let renderer = Renderer::new(sink_for(false), memory.clone());

        renderer.render(&FrameRecord {
            index: 3,
            duration: Duration::from_millis(50),
            image: frame(2, 2),
        });

        assert_eq!(memory.borrow().presented(), &[3]);
    }
}
