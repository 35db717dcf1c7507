//! DMA-BUF import and NV12 normalization.
//!
//! The encoder consumes packed NV12. Frames arrive as DMA-BUF
//! descriptors in NV12 (canonical) or one of the alternates a hardware
//! decoder may emit; this module maps the buffer and rewrites it into
//! the packed layout, honoring per-plane offset and pitch.
//!
//! NV12 and NV21 are row copies. RGB24/BGR24 go through a scalar
//! software conversion path (see DESIGN.md on the absence of libyuv);
//! hardware decoders emit NV12 on every supported SoC, so these
//! formats are off the steady-state path.

use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::error::{AppError, Result};
use crate::video::frame::{DmaFormat, DmaFrame};

/// Read-only mapping of a DMA-BUF, unmapped on drop.
pub struct DmaMapping {
    ptr: NonNull<std::ffi::c_void>,
    len: usize,
}

impl DmaMapping {
    pub fn map(fd: BorrowedFd<'_>, len: usize) -> Result<Self> {
        let len_nz = NonZeroUsize::new(len)
            .ok_or_else(|| AppError::Video("cannot map an empty DMA buffer".into()))?;
        let ptr = unsafe {
            mmap(
                None,
                len_nz,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|e| AppError::Video(format!("DMA-BUF import failed: {}", e)))?;
        Ok(Self { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }
}

impl Drop for DmaMapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}

// the mapping is read-only shared memory
unsafe impl Send for DmaMapping {}

/// Import a frame and write it into `out` as packed NV12
/// (width*height luma followed by width*height/2 interleaved chroma).
pub fn import_nv12(frame: &DmaFrame, out: &mut Vec<u8>) -> Result<()> {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let mapping = DmaMapping::map(frame.borrow_fd(), frame.mapped_len())?;
    let data = mapping.as_slice();

    out.clear();
    out.reserve(width * height * 3 / 2);

    match frame.format {
        DmaFormat::Nv12 | DmaFormat::Nv21 => {
            copy_plane(
                data,
                out,
                frame.offset[0] as usize,
                frame.pitch[0] as usize,
                width,
                height,
            )?;
            let chroma_start = out.len();
            copy_plane(
                data,
                out,
                frame.offset[1] as usize,
                frame.pitch[1] as usize,
                width,
                height / 2,
            )?;
            if frame.format == DmaFormat::Nv21 {
                // VU -> UV
                for pair in out[chroma_start..].chunks_exact_mut(2) {
                    pair.swap(0, 1);
                }
            }
        }
        DmaFormat::Rgb24 | DmaFormat::Bgr24 => {
            rgb24_to_nv12_sw(
                data,
                out,
                frame.offset[0] as usize,
                frame.pitch[0] as usize,
                width,
                height,
                frame.format == DmaFormat::Bgr24,
            )?;
        }
    }
    Ok(())
}

fn copy_plane(
    data: &[u8],
    out: &mut Vec<u8>,
    offset: usize,
    pitch: usize,
    row_bytes: usize,
    rows: usize,
) -> Result<()> {
    let pitch = pitch.max(row_bytes);
    for row in 0..rows {
        let start = offset + row * pitch;
        let end = start + row_bytes;
        let slice = data
            .get(start..end)
            .ok_or_else(|| AppError::Video("frame layout exceeds the mapped buffer".into()))?;
        out.extend_from_slice(slice);
    }
    Ok(())
}

/// Software conversion for RGB24/BGR24: BT.601 limited-range with 2x2
/// chroma averaging.
fn rgb24_to_nv12_sw(
    data: &[u8],
    out: &mut Vec<u8>,
    offset: usize,
    pitch: usize,
    width: usize,
    height: usize,
    bgr: bool,
) -> Result<()> {
    let pitch = pitch.max(width * 3);
    let pixel = |x: usize, y: usize| -> Result<(i32, i32, i32)> {
        let base = offset + y * pitch + x * 3;
        let px = data
            .get(base..base + 3)
            .ok_or_else(|| AppError::Video("frame layout exceeds the mapped buffer".into()))?;
        Ok(if bgr {
            (px[2] as i32, px[1] as i32, px[0] as i32)
        } else {
            (px[0] as i32, px[1] as i32, px[2] as i32)
        })
    };

    out.resize(width * height * 3 / 2, 0);
    let (luma, chroma) = out.split_at_mut(width * height);

    for y in 0..height {
        for x in 0..width {
            let (r, g, b) = pixel(x, y)?;
            let value = (66 * r + 129 * g + 25 * b + 128) >> 8;
            luma[y * width + x] = (value + 16).clamp(0, 255) as u8;
        }
    }
    for cy in 0..height / 2 {
        for cx in 0..width / 2 {
            let mut sum_r = 0;
            let mut sum_g = 0;
            let mut sum_b = 0;
            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let (r, g, b) = pixel(cx * 2 + dx, cy * 2 + dy)?;
                sum_r += r;
                sum_g += g;
                sum_b += b;
            }
            let (r, g, b) = (sum_r / 4, sum_g / 4, sum_b / 4);
            let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
            let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
            chroma[cy * width + cx * 2] = u.clamp(0, 255) as u8;
            chroma[cy * width + cx * 2 + 1] = v.clamp(0, 255) as u8;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::frame::test_support::memfd_frame;

    #[test]
    fn nv12_passthrough_honors_pitch() {
        // 4x2 frame with pitch 8: rows carry 4 payload + 4 padding bytes
        let width = 4u32;
        let height = 2u32;
        let pitch = 8u32;
        let mut bytes = Vec::new();
        // luma rows
        bytes.extend_from_slice(&[1, 2, 3, 4, 0, 0, 0, 0]);
        bytes.extend_from_slice(&[5, 6, 7, 8, 0, 0, 0, 0]);
        // chroma row (height/2)
        bytes.extend_from_slice(&[9, 10, 11, 12, 0, 0, 0, 0]);

        let frame = memfd_frame(
            &bytes,
            width,
            height,
            DmaFormat::Nv12,
            [0, pitch * height],
            [pitch, pitch],
            0,
        );
        let mut out = Vec::new();
        import_nv12(&frame, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn nv21_swaps_chroma() {
        let width = 2u32;
        let height = 2u32;
        let mut bytes = vec![0u8; 4]; // luma
        bytes.extend_from_slice(&[30, 40]); // V, U interleaved
        let frame = memfd_frame(
            &bytes,
            width,
            height,
            DmaFormat::Nv21,
            [0, 4],
            [2, 2],
            0,
        );
        let mut out = Vec::new();
        import_nv12(&frame, &mut out).unwrap();
        assert_eq!(&out[4..], [40, 30]);
    }

    #[test]
    fn rgb_grey_maps_to_neutral_chroma() {
        // uniform mid-grey: luma well inside range, chroma at 128
        let width = 2u32;
        let height = 2u32;
        let bytes = vec![128u8; (width * height * 3) as usize];
        let frame = memfd_frame(
            &bytes,
            width,
            height,
            DmaFormat::Rgb24,
            [0, 0],
            [width * 3, 0],
            0,
        );
        let mut out = Vec::new();
        import_nv12(&frame, &mut out).unwrap();
        for &y in &out[..4] {
            assert!((120..=130).contains(&y), "luma {} out of range", y);
        }
        assert_eq!(&out[4..], [128, 128]);
    }

}
