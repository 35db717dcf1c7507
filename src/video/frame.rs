//! Decoded video frames backed by DMA-BUF descriptors.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Pixel layout of a decoded frame. NV12 is canonical; the alternates
/// are what the hardware decoders on supported SoCs may emit instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaFormat {
    Nv12,
    Nv21,
    Rgb24,
    Bgr24,
}

impl DmaFormat {
    /// Number of planes this layout occupies in the DMA buffer.
    pub fn planes(&self) -> usize {
        match self {
            DmaFormat::Nv12 | DmaFormat::Nv21 => 2,
            DmaFormat::Rgb24 | DmaFormat::Bgr24 => 1,
        }
    }

    /// Total payload size for a tightly packed frame.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = (width * height) as usize;
        match self {
            DmaFormat::Nv12 | DmaFormat::Nv21 => pixels * 3 / 2,
            DmaFormat::Rgb24 | DmaFormat::Bgr24 => pixels * 3,
        }
    }
}

impl std::fmt::Display for DmaFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DmaFormat::Nv12 => "NV12",
            DmaFormat::Nv21 => "NV21",
            DmaFormat::Rgb24 => "RGB24",
            DmaFormat::Bgr24 => "BGR24",
        };
        write!(f, "{}", name)
    }
}

/// A decoded frame living in a DMA-BUF.
///
/// The descriptor is exclusively owned: dropping the frame closes it,
/// and hand-off across components goes through [`DmaFrame::duplicate`]
/// so the receiver closes its own copy. Deliberately not `Clone`.
#[derive(Debug)]
pub struct DmaFrame {
    fd: OwnedFd,
    pub width: u32,
    pub height: u32,
    pub format: DmaFormat,
    pub offset: [u32; 2],
    pub pitch: [u32; 2],
    pub planes: usize,
    /// Presentation timestamp in the stream time base, milliseconds.
    pub pts_ms: i64,
}

impl DmaFrame {
    pub fn new(
        fd: OwnedFd,
        width: u32,
        height: u32,
        format: DmaFormat,
        offset: [u32; 2],
        pitch: [u32; 2],
        pts_ms: i64,
    ) -> Self {
        let planes = format.planes();
        Self {
            fd,
            width,
            height,
            format,
            offset,
            pitch,
            planes,
            pts_ms,
        }
    }

    /// Duplicate the frame for hand-off. The new frame owns a dup'd
    /// descriptor; both copies close independently.
    pub fn duplicate(&self) -> std::io::Result<DmaFrame> {
        let fd = self.fd.try_clone()?;
        Ok(DmaFrame {
            fd,
            width: self.width,
            height: self.height,
            format: self.format,
            offset: self.offset,
            pitch: self.pitch,
            planes: self.planes,
            pts_ms: self.pts_ms,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn borrow_fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.fd.as_fd()
    }

    /// Size in bytes of the mapped region needed to read the full frame.
    pub fn mapped_len(&self) -> usize {
        let mut end = 0usize;
        for i in 0..self.planes {
            let plane_height = if i == 0 { self.height } else { self.height / 2 };
            let plane_end = self.offset[i] as usize + (self.pitch[i] * plane_height) as usize;
            end = end.max(plane_end);
        }
        // Single-plane RGB layouts cover the full height.
        if self.planes == 1 {
            end = self.offset[0] as usize + (self.pitch[0] * self.height) as usize;
        }
        end
    }
}

/// Bounded wait-and-pop queue. When full the oldest item is dropped;
/// for [`DmaFrame`]s the eviction closes the descriptor.
pub struct WaitQueue<T> {
    inner: Mutex<QueueState<T>>,
    cv: Condvar,
    max_len: usize,
}

struct QueueState<T> {
    items: std::collections::VecDeque<T>,
    closed: bool,
}

impl<T> WaitQueue<T> {
    pub fn new(max_len: usize) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                items: std::collections::VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
            max_len: max_len.max(1),
        }
    }

    /// Push an item, evicting the oldest when the bound is hit.
    pub fn push(&self, item: T) {
        let mut state = self.inner.lock();
        if state.closed {
            return; // dropped on the floor
        }
        if state.items.len() >= self.max_len {
            state.items.pop_front();
        }
        state.items.push_back(item);
        drop(state);
        self.cv.notify_one();
    }

    /// Block until an item is available or the queue is closed.
    pub fn wait_and_pop(&self) -> Option<T> {
        let mut state = self.inner.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.cv.wait(&mut state);
        }
    }

    /// Like [`Self::wait_and_pop`] but bounded, for shutdown-polling loops.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut state = self.inner.lock();
        if let Some(item) = state.items.pop_front() {
            return Some(item);
        }
        if state.closed {
            return None;
        }
        self.cv.wait_for(&mut state, timeout);
        state.items.pop_front()
    }

    /// Close the queue and drop everything pending.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        state.items.clear();
        drop(state);
        self.cv.notify_all();
    }

    /// Reopen after a source reconnect.
    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The queue between the decode thread and the frame-push worker.
pub type FrameQueue = WaitQueue<DmaFrame>;

/// Test stand-ins for decoder-exported DMA buffers, built on memfd.
#[cfg(test)]
pub(crate) mod test_support {
    use super::{DmaFormat, DmaFrame};
    use std::io::Write;
    use std::os::fd::OwnedFd;

    pub(crate) fn memfd_frame(
        bytes: &[u8],
        width: u32,
        height: u32,
        format: DmaFormat,
        offset: [u32; 2],
        pitch: [u32; 2],
        pts_ms: i64,
    ) -> DmaFrame {
        let fd = nix::sys::memfd::memfd_create(
            c"camgate-test-frame",
            nix::sys::memfd::MemFdCreateFlag::empty(),
        )
        .unwrap();
        let owned: OwnedFd = fd;
        let file = std::fs::File::from(owned.try_clone().unwrap());
        // size the backing file generously so the mapping never trips
        // on the declared layout
        file.set_len(bytes.len().max(1 << 16) as u64).unwrap();
        let mut file = file;
        file.write_all(bytes).unwrap();
        DmaFrame::new(owned, width, height, format, offset, pitch, pts_ms)
    }

    /// A packed NV12 frame of the given geometry, zero-filled.
    pub(crate) fn blank_nv12(width: u32, height: u32, pts_ms: i64) -> DmaFrame {
        let bytes = vec![0u8; (width * height * 3 / 2) as usize];
        memfd_frame(
            &bytes,
            width,
            height,
            DmaFormat::Nv12,
            [0, width * height],
            [width, width],
            pts_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_fd() -> OwnedFd {
        std::fs::File::open("/dev/null").unwrap().into()
    }

    fn test_frame(pts: i64) -> DmaFrame {
        DmaFrame::new(
            test_fd(),
            1920,
            1080,
            DmaFormat::Nv12,
            [0, 1920 * 1080],
            [1920, 1920],
            pts,
        )
    }

    fn fd_is_open(fd: RawFd) -> bool {
        nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).is_ok()
    }

    #[test]
    fn drop_closes_descriptor_once() {
        let frame = test_frame(0);
        let raw = frame.raw_fd();
        assert!(fd_is_open(raw));
        drop(frame);
        assert!(!fd_is_open(raw));
    }

    #[test]
    fn duplicate_is_independent() {
        let frame = test_frame(0);
        let copy = frame.duplicate().unwrap();
        assert_ne!(frame.raw_fd(), copy.raw_fd());
        let copy_raw = copy.raw_fd();
        drop(frame);
        // the dup survives the original
        assert!(fd_is_open(copy_raw));
        drop(copy);
        assert!(!fd_is_open(copy_raw));
    }

    #[test]
    fn duplicate_preserves_layout() {
        let frame = test_frame(42);
        let copy = frame.duplicate().unwrap();
        assert_eq!(copy.width, 1920);
        assert_eq!(copy.height, 1080);
        assert_eq!(copy.planes, 2);
        assert_eq!(copy.offset, frame.offset);
        assert_eq!(copy.pitch, frame.pitch);
        assert_eq!(copy.pts_ms, 42);
    }

    #[test]
    fn queue_evicts_oldest_and_closes_fd() {
        let queue = FrameQueue::new(2);
        let first = test_frame(1);
        let first_raw = first.raw_fd();
        queue.push(first);
        queue.push(test_frame(2));
        queue.push(test_frame(3));
        // the pts=1 frame was evicted and its fd closed
        assert!(!fd_is_open(first_raw));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.wait_and_pop().unwrap().pts_ms, 2);
        assert_eq!(queue.wait_and_pop().unwrap().pts_ms, 3);
    }

    #[test]
    fn close_drains_and_unblocks() {
        let queue = std::sync::Arc::new(FrameQueue::new(4));
        let frame = test_frame(7);
        let raw = frame.raw_fd();
        queue.push(frame);

        let q = queue.clone();
        let waiter = std::thread::spawn(move || {
            // drain the one queued frame, then block until close
            let first = q.wait_and_pop();
            let second = q.wait_and_pop();
            (first.is_some(), second.is_none())
        });
        std::thread::sleep(Duration::from_millis(50));
        queue.close();
        let (got_first, unblocked_empty) = waiter.join().unwrap();
        assert!(got_first);
        assert!(unblocked_empty);
        let _ = raw;
    }

    #[test]
    fn mapped_len_covers_both_planes() {
        let frame = test_frame(0);
        assert_eq!(frame.mapped_len(), 1920 * 1080 * 3 / 2);
    }
}
