use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// One encoded unit written by the capture device
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Presentation time relative to the start of capture
    pub pts: Duration,
    /// Whether decoding can start at this chunk
    pub keyframe: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Ring {
    chunks: VecDeque<Chunk>,
    bytes: usize,
}

/// Circular buffer holding the most recent `window` of encoded capture.
///
/// Chunks older than `window` relative to the newest chunk are evicted on
/// every write. Writers are capture threads; readers are the flush protocol.
#[derive(Debug)]
pub struct PrerollBuffer {
    window: Duration,
    ring: Mutex<Ring>,
}

impl PrerollBuffer {
    pub fn new(seconds: u64) -> Self {
        Self {
            window: Duration::from_secs(seconds),
            ring: Mutex::new(Ring::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn ring(&self) -> std::sync::MutexGuard<'_, Ring> {
        match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn write(&self, chunk: Chunk) {
        let mut ring = self.ring();
        let newest = chunk.pts;
        ring.bytes += chunk.data.len();
        ring.chunks.push_back(chunk);

        while let Some(oldest) = ring.chunks.front() {
            if newest.saturating_sub(oldest.pts) <= self.window {
                break;
            }
            if let Some(evicted) = ring.chunks.pop_front() {
                ring.bytes -= evicted.data.len();
            }
        }
    }

    /// Copy the buffered capture to `path`, starting at the oldest keyframe.
    ///
    /// Returns the number of bytes written.
    pub fn copy_to(&self, path: &Path) -> Result<usize> {
        let ring = self.ring();
        let file = File::create(path)
            .with_context(|| format!("Failed to create segment {:?}", path))?;
        let mut writer = BufWriter::new(file);
        let mut written = 0;
        for chunk in ring.chunks.iter().skip_while(|chunk| !chunk.keyframe) {
            writer.write_all(&chunk.data)?;
            written += chunk.data.len();
        }
        writer.flush()?;
        Ok(written)
    }

    pub fn clear(&self) {
        let mut ring = self.ring();
        ring.chunks.clear();
        ring.bytes = 0;
    }

    pub fn len_bytes(&self) -> usize {
        self.ring().bytes
    }

    /// Time spanned by the buffered chunks
    pub fn span(&self) -> Duration {
        let ring = self.ring();
        match (ring.chunks.front(), ring.chunks.back()) {
            (Some(first), Some(last)) => last.pts.saturating_sub(first.pts),
            _ => Duration::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ring().chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(ms: u64, keyframe: bool, byte: u8) -> Chunk {
        Chunk {
            pts: Duration::from_millis(ms),
            keyframe,
            data: vec![byte; 4],
        }
    }

    #[test]
    fn evicts_chunks_outside_window() {
        let buffer = PrerollBuffer::new(2);
        for second in 0..6 {
            buffer.write(chunk(second * 1000, true, second as u8));
        }
        assert_eq!(buffer.span(), Duration::from_secs(2));
        assert_eq!(buffer.len_bytes(), 12);
    }

    #[test]
    fn copy_starts_at_first_keyframe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.before.h264");
        let buffer = PrerollBuffer::new(10);
        buffer.write(chunk(0, false, 1));
        buffer.write(chunk(100, true, 2));
        buffer.write(chunk(200, false, 3));

        let written = buffer.copy_to(&path).unwrap();
        assert_eq!(written, 8);
        assert_eq!(std::fs::read(&path).unwrap(), vec![2, 2, 2, 2, 3, 3, 3, 3]);
    }

    #[test]
    fn clear_empties_buffer() {
        let buffer = PrerollBuffer::new(10);
        buffer.write(chunk(0, true, 1));
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.len_bytes(), 0);
    }
}
