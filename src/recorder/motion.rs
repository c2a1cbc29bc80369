use crate::messaging::{EventDispatcher, EventType};
use log::debug;
use serde_json::json;
use std::sync::Arc;

/// Vector magnitude above which a block counts as moving
pub const MAGNITUDE_THRESHOLD: f64 = 60.0;

/// Motion estimate for one macroblock
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionVector {
    pub x: i8,
    pub y: i8,
    /// Sum of absolute differences for the matched block
    pub sad: u16,
}

impl MotionVector {
    pub fn magnitude(&self) -> f64 {
        let x = self.x as f64;
        let y = self.y as f64;
        (x * x + y * y).sqrt().min(255.0)
    }
}

/// Edge of a square block in the analysis frame
pub const BLOCK_SIZE: usize = 8;
/// Search radius in analysis pixels
pub const SEARCH_RADIUS: i32 = 3;

/// Estimate one vector per block between two greyscale frames.
///
/// Frames are `width * height` bytes, one byte per pixel. The winning
/// offset is multiplied by `scale` so vectors are expressed in the units
/// of the full-resolution stream. Ties keep the smaller offset, so a still
/// scene yields zero vectors.
pub fn block_vectors(
    previous: &[u8],
    current: &[u8],
    width: usize,
    height: usize,
    scale: f64,
) -> Vec<MotionVector> {
    let area = width * height;
    if previous.len() < area || current.len() < area {
        return Vec::new();
    }
    let sad_at = |bx: usize, by: usize, dx: i32, dy: i32| -> Option<u32> {
        let mut sad = 0u32;
        for y in by..by + BLOCK_SIZE {
            for x in bx..bx + BLOCK_SIZE {
                let px = x as i32 + dx;
                let py = y as i32 + dy;
                if px < 0 || py < 0 || px as usize >= width || py as usize >= height {
                    return None;
                }
                let reference = previous[py as usize * width + px as usize];
                sad += (current[y * width + x] as i32 - reference as i32).unsigned_abs();
            }
        }
        Some(sad)
    };

    let mut vectors = Vec::with_capacity((width / BLOCK_SIZE) * (height / BLOCK_SIZE));
    for by in (0..=height.saturating_sub(BLOCK_SIZE)).step_by(BLOCK_SIZE) {
        for bx in (0..=width.saturating_sub(BLOCK_SIZE)).step_by(BLOCK_SIZE) {
            let mut best: (i32, i32, u32) = (0, 0, sad_at(bx, by, 0, 0).unwrap_or(u32::MAX));
            for dy in -SEARCH_RADIUS..=SEARCH_RADIUS {
                for dx in -SEARCH_RADIUS..=SEARCH_RADIUS {
                    let Some(sad) = sad_at(bx, by, dx, dy) else {
                        continue;
                    };
                    let closer = dx.abs() + dy.abs() < best.0.abs() + best.1.abs();
                    if sad < best.2 || (sad == best.2 && closer) {
                        best = (dx, dy, sad);
                    }
                }
            }
            let scaled = |offset: i32| (offset as f64 * scale).round().clamp(-127.0, 127.0) as i8;
            vectors.push(MotionVector {
                x: scaled(best.0),
                y: scaled(best.1),
                sad: best.2.min(u16::MAX as u32) as u16,
            });
        }
    }
    vectors
}

/// Counts moving blocks per frame and fires `motion_start` when the count
/// exceeds the configured sensitivity.
pub struct MotionDetector {
    events: Arc<EventDispatcher>,
    sensitivity: u32,
}

impl MotionDetector {
    pub fn new(events: Arc<EventDispatcher>, sensitivity: u32) -> Self {
        Self {
            events,
            sensitivity,
        }
    }

    pub fn sensitivity(&self) -> u32 {
        self.sensitivity
    }

    /// Number of blocks moving faster than the magnitude threshold
    pub fn moving_blocks(vectors: &[MotionVector]) -> u32 {
        vectors
            .iter()
            .filter(|vector| vector.magnitude() > MAGNITUDE_THRESHOLD)
            .count() as u32
    }

    /// Analyse one frame of vectors; returns whether motion was signalled
    pub fn analyze(&self, vectors: &[MotionVector]) -> bool {
        let moving = Self::moving_blocks(vectors);
        if moving > self.sensitivity {
            debug!(
                "Detected motion in {} blocks (sensitivity {})",
                moving, self.sensitivity
            );
            let timestamp = chrono::Utc::now().timestamp();
            self.events
                .fire(EventType::MotionStart, json!({ "timestamp": timestamp }));
            return true;
        }
        false
    }
}
