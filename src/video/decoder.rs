//! Hardware decode through the V4L2 stateful M2M interface.
//!
//! Access units go into the OUTPUT queue; decoded NV12 pictures come
//! back on the CAPTURE queue. Every capture buffer is exported as a
//! DMA-BUF once at setup; a dequeued picture hands off a dup of that
//! descriptor wrapped in a [`DmaFrame`], so downstream owns its copy
//! and the decoder can recycle the buffer.

use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};
use v4l2r::bindings::v4l2_requestbuffers;
use v4l2r::ioctl::{
    self, Capabilities, Capability as V4l2rCapability, ExpbufFlags, MemoryConsistency,
    PlaneMapping, QBufPlane, QBuffer, QueryBuffer, V4l2Buffer,
};
use v4l2r::memory::{MemoryType, MmapHandle};
use v4l2r::{Format as V4l2rFormat, PixelFormat as V4l2rPixelFormat, QueueType};

use crate::error::{AppError, Result};
use crate::rtsp::VideoCodec;
use crate::video::frame::{DmaFormat, DmaFrame};

/// Largest access unit we hand the decoder in one buffer.
const OUTPUT_BUFFER_SIZE: u32 = 2 * 1024 * 1024;
const OUTPUT_BUFFER_COUNT: u32 = 4;
const DEQUEUE_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// V4L2 stateful M2M video decoder with DMA-BUF export.
pub struct M2mDecoder {
    fd: File,
    device_path: PathBuf,
    output_queue: QueueType,
    capture_queue: QueueType,
    /// mmap'd OUTPUT buffers the access units are copied into.
    output_mappings: Vec<PlaneMapping>,
    output_free: Vec<usize>,
    /// One exported descriptor per CAPTURE buffer, dup'd per frame.
    capture_exports: Vec<OwnedFd>,
    capture_queued: Vec<bool>,
    width: u32,
    height: u32,
    pitch: u32,
    chroma_offset: u32,
    /// FIFO pairing of submitted PTS with dequeued pictures.
    pts_fifo: std::collections::VecDeque<i64>,
}

impl M2mDecoder {
    /// Open the first M2M decoder device accepting this codec, set the
    /// coded format and negotiate NV12 capture buffers.
    pub fn open(codec: VideoCodec, width: u32, height: u32, capture_buffers: u32) -> Result<Self> {
        let device_path = find_decoder_device(codec)?;
        Self::open_device(&device_path, codec, width, height, capture_buffers)
    }

    fn open_device(
        device_path: &Path,
        codec: VideoCodec,
        width: u32,
        height: u32,
        capture_buffers: u32,
    ) -> Result<Self> {
        let mut fd = File::options()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(|e| AppError::Video(format!("failed to open decoder device: {}", e)))?;

        let caps: V4l2rCapability = ioctl::querycap(&fd)
            .map_err(|e| AppError::Video(format!("failed to query capabilities: {}", e)))?;
        let caps_flags = caps.device_caps();
        if !caps_flags.contains(Capabilities::VIDEO_M2M_MPLANE) {
            return Err(AppError::Video(format!(
                "{} is not a multiplanar M2M device",
                device_path.display()
            )));
        }

        let output_queue = QueueType::VideoOutputMplane;
        let capture_queue = QueueType::VideoCaptureMplane;

        // coded side: H264/HEVC byte stream
        let mut out_fmt: V4l2rFormat = ioctl::g_fmt(&fd, output_queue)
            .map_err(|e| AppError::Video(format!("failed to get OUTPUT format: {}", e)))?;
        out_fmt.width = width;
        out_fmt.height = height;
        out_fmt.pixelformat = V4l2rPixelFormat::from_fourcc(match codec {
            VideoCodec::H264 => b"H264",
            VideoCodec::H265 => b"HEVC",
        });
        if let Some(plane) = out_fmt.plane_fmt.get_mut(0) {
            plane.sizeimage = OUTPUT_BUFFER_SIZE;
        }
        ioctl::s_fmt::<_, V4l2rFormat>(&mut fd, (output_queue, &out_fmt))
            .map_err(|e| AppError::Video(format!("failed to set OUTPUT format: {}", e)))?;

        // picture side: NV12
        let mut cap_fmt: V4l2rFormat = ioctl::g_fmt(&fd, capture_queue)
            .map_err(|e| AppError::Video(format!("failed to get CAPTURE format: {}", e)))?;
        cap_fmt.width = width;
        cap_fmt.height = height;
        cap_fmt.pixelformat = V4l2rPixelFormat::from_fourcc(b"NV12");
        let actual: V4l2rFormat = ioctl::s_fmt(&mut fd, (capture_queue, &cap_fmt))
            .map_err(|e| AppError::Video(format!("failed to set CAPTURE format: {}", e)))?;

        if actual.pixelformat != V4l2rPixelFormat::from_fourcc(b"NV12") {
            return Err(AppError::Video(format!(
                "decoder refused NV12 capture (got {})",
                actual.pixelformat
            )));
        }
        let pitch = actual
            .plane_fmt
            .first()
            .map(|p| p.bytesperline)
            .filter(|&bpl| bpl > 0)
            .unwrap_or(actual.width);
        // coded height may exceed the display height; the chroma plane
        // starts after the full luma allocation
        let chroma_offset = pitch * actual.height;

        // OUTPUT buffers: MMAP, access units copied in
        let out_req: v4l2_requestbuffers = ioctl::reqbufs(
            &fd,
            output_queue,
            MemoryType::Mmap,
            OUTPUT_BUFFER_COUNT,
            MemoryConsistency::empty(),
        )
        .map_err(|e| AppError::Video(format!("failed to request OUTPUT buffers: {}", e)))?;
        if out_req.count == 0 {
            return Err(AppError::Video("driver returned zero OUTPUT buffers".into()));
        }

        let mut output_mappings = Vec::with_capacity(out_req.count as usize);
        let mut output_free = Vec::with_capacity(out_req.count as usize);
        for index in 0..out_req.count as usize {
            let query: QueryBuffer = ioctl::querybuf(&fd, output_queue, index)
                .map_err(|e| AppError::Video(format!("failed to query OUTPUT buffer: {}", e)))?;
            let plane = query
                .planes
                .first()
                .ok_or_else(|| AppError::Video("OUTPUT buffer has no planes".into()))?;
            let mapping = ioctl::mmap(&fd, plane.mem_offset, plane.length)
                .map_err(|e| AppError::Video(format!("failed to mmap OUTPUT buffer: {}", e)))?;
            output_mappings.push(mapping);
            output_free.push(index);
        }

        // CAPTURE buffers: MMAP, exported as DMA-BUF once
        let cap_req: v4l2_requestbuffers = ioctl::reqbufs(
            &fd,
            capture_queue,
            MemoryType::Mmap,
            capture_buffers.max(2),
            MemoryConsistency::empty(),
        )
        .map_err(|e| AppError::Video(format!("failed to request CAPTURE buffers: {}", e)))?;
        if cap_req.count == 0 {
            return Err(AppError::Video("driver returned zero CAPTURE buffers".into()));
        }

        let mut capture_exports = Vec::with_capacity(cap_req.count as usize);
        for index in 0..cap_req.count as usize {
            // read-only export; the encoder side only ever maps it
            let dmabuf: OwnedFd = ioctl::expbuf(&fd, capture_queue, index, 0, ExpbufFlags::empty())
                .map_err(|e| {
                    AppError::Video(format!("failed to export CAPTURE buffer {}: {}", index, e))
                })?;
            capture_exports.push(dmabuf);
        }

        // downstream sees the display size, not the coded size
        let mut decoder = Self {
            fd,
            device_path: device_path.to_path_buf(),
            output_queue,
            capture_queue,
            output_mappings,
            output_free,
            capture_exports,
            capture_queued: vec![false; cap_req.count as usize],
            width,
            height,
            pitch,
            chroma_offset,
            pts_fifo: std::collections::VecDeque::new(),
        };

        decoder.queue_all_capture()?;
        ioctl::streamon(&decoder.fd, decoder.output_queue)
            .map_err(|e| AppError::Video(format!("failed to start OUTPUT stream: {}", e)))?;
        ioctl::streamon(&decoder.fd, decoder.capture_queue)
            .map_err(|e| AppError::Video(format!("failed to start CAPTURE stream: {}", e)))?;

        info!(
            "M2M decoder ready on {}: {:?} {}x{} pitch {}",
            device_path.display(),
            codec,
            width,
            height,
            pitch
        );
        Ok(decoder)
    }

    /// Submit one Annex B access unit and collect any pictures the
    /// decoder has finished.
    pub fn decode(&mut self, access_unit: &[u8], pts_ms: i64) -> Result<Vec<DmaFrame>> {
        if access_unit.len() as u32 > OUTPUT_BUFFER_SIZE {
            warn!(
                "access unit of {} bytes exceeds the OUTPUT buffer, dropped",
                access_unit.len()
            );
            return Ok(Vec::new());
        }

        // recycle finished OUTPUT buffers first
        while let Ok(done) = ioctl::dqbuf::<V4l2Buffer>(&self.fd, self.output_queue) {
            self.output_free.push(done.as_v4l2_buffer().index as usize);
        }

        let index = match self.output_free.pop() {
            Some(i) => i,
            None => {
                self.wait_ready(PollFlags::POLLOUT)?;
                let done: V4l2Buffer = ioctl::dqbuf(&self.fd, self.output_queue)
                    .map_err(|e| AppError::Video(format!("OUTPUT dequeue failed: {}", e)))?;
                done.as_v4l2_buffer().index as usize
            }
        };

        let mapping = &mut self.output_mappings[index];
        mapping.as_mut()[..access_unit.len()].copy_from_slice(access_unit);

        let handle = MmapHandle::default();
        let mut plane = QBufPlane::new_from_handle(&handle, 0);
        plane.0.bytesused = access_unit.len() as u32;
        plane.0.length = mapping.len() as u32;
        let mut qbuf: QBuffer<MmapHandle> = QBuffer::new(self.output_queue, index as u32);
        qbuf.planes = vec![plane];
        ioctl::qbuf::<_, ()>(&self.fd, qbuf)
            .map_err(|e| AppError::Video(format!("OUTPUT queue failed: {}", e)))?;
        self.pts_fifo.push_back(pts_ms);

        self.collect_pictures()
    }

    /// Dequeue every finished picture without blocking.
    fn collect_pictures(&mut self) -> Result<Vec<DmaFrame>> {
        let mut frames = Vec::new();
        loop {
            let buf: V4l2Buffer = match ioctl::dqbuf(&self.fd, self.capture_queue) {
                Ok(buf) => buf,
                Err(_) => break, // EAGAIN: nothing ready yet
            };
            let index = buf.as_v4l2_buffer().index as usize;
            self.capture_queued[index] = false;

            let pts_ms = self.pts_fifo.pop_front().unwrap_or(0);
            let fd = self.capture_exports[index]
                .try_clone()
                .map_err(AppError::Io)?;
            frames.push(DmaFrame::new(
                fd,
                self.width,
                self.height,
                DmaFormat::Nv12,
                [0, self.chroma_offset],
                [self.pitch, self.pitch],
                pts_ms,
            ));

            // hand the buffer straight back; the dup'd descriptor keeps
            // the pages alive for the consumer
            self.queue_capture(index)?;
        }
        Ok(frames)
    }

    fn queue_all_capture(&mut self) -> Result<()> {
        for index in 0..self.capture_exports.len() {
            self.queue_capture(index)?;
        }
        Ok(())
    }

    fn queue_capture(&mut self, index: usize) -> Result<()> {
        if self.capture_queued[index] {
            return Ok(());
        }
        let handle = MmapHandle::default();
        let plane = QBufPlane::new_from_handle(&handle, 0);
        let mut qbuf: QBuffer<MmapHandle> = QBuffer::new(self.capture_queue, index as u32);
        qbuf.planes = vec![plane];
        ioctl::qbuf::<_, ()>(&self.fd, qbuf)
            .map_err(|e| AppError::Video(format!("CAPTURE queue failed: {}", e)))?;
        self.capture_queued[index] = true;
        Ok(())
    }

    fn wait_ready(&self, flags: PollFlags) -> Result<()> {
        let mut fds = [PollFd::new(self.fd.as_fd(), flags)];
        let timeout_ms = DEQUEUE_POLL_TIMEOUT.as_millis().min(u16::MAX as u128) as u16;
        let ready = poll(&mut fds, PollTimeout::from(timeout_ms)).map_err(std::io::Error::from)?;
        if ready == 0 {
            return Err(AppError::Video("decoder stalled".into()));
        }
        Ok(())
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }
}

impl Drop for M2mDecoder {
    fn drop(&mut self) {
        if let Err(e) = ioctl::streamoff(&self.fd, self.output_queue) {
            debug!("failed to stop OUTPUT stream: {}", e);
        }
        if let Err(e) = ioctl::streamoff(&self.fd, self.capture_queue) {
            debug!("failed to stop CAPTURE stream: {}", e);
        }
    }
}

/// Scan /dev/video* for an M2M device whose OUTPUT side accepts the
/// codec. Rockchip and generic v4l2m2m decoders both surface this way.
fn find_decoder_device(codec: VideoCodec) -> Result<PathBuf> {
    let wanted = V4l2rPixelFormat::from_fourcc(match codec {
        VideoCodec::H264 => b"H264",
        VideoCodec::H265 => b"HEVC",
    });

    for index in 0..32 {
        let path = PathBuf::from(format!("/dev/video{}", index));
        if !path.exists() {
            continue;
        }
        let fd = match File::options().read(true).write(true).open(&path) {
            Ok(fd) => fd,
            Err(_) => continue,
        };
        let caps: V4l2rCapability = match ioctl::querycap(&fd) {
            Ok(caps) => caps,
            Err(_) => continue,
        };
        if !caps.device_caps().contains(Capabilities::VIDEO_M2M_MPLANE) {
            continue;
        }
        let accepts = ioctl::FormatIterator::new(&fd, QueueType::VideoOutputMplane)
            .any(|desc| V4l2rPixelFormat::from(desc.pixelformat) == wanted);
        if accepts {
            debug!("decoder device for {:?}: {}", codec, path.display());
            return Ok(path);
        }
    }

    Err(AppError::Video(format!(
        "no V4L2 M2M decoder accepts {:?}",
        codec
    )))
}
