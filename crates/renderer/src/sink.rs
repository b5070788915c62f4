//! Hand-off of captured frames to the snapshot writer.

use std::path::PathBuf;

use tracing::{info, warn};

use restir_resources::snapshot::{SaveWorker, SnapshotRequest, save_blocking};

use crate::error::RendererResult;

/// Receiver of captured frames.
pub trait SnapshotSink {
    /// Takes ownership of one captured frame.
    fn save(&mut self, request: SnapshotRequest) -> RendererResult<()>;

    /// Waits for outstanding writes.
    fn finish(&mut self) -> RendererResult<()>;
}

/// Writes snapshots into a directory.
///
/// Interactive runs write on a detached worker thread; offline runs write
/// on the calling thread so the process can exit right after.
pub struct DiskSink {
    dir: PathBuf,
    blocking: bool,
    workers: Vec<SaveWorker>,
}

impl DiskSink {
    pub fn new(dir: impl Into<PathBuf>, blocking: bool) -> Self {
        Self {
            dir: dir.into(),
            blocking,
            workers: Vec::new(),
        }
    }

    /// Number of background writes still running.
    pub fn pending(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_finished()).count()
    }
}

impl SnapshotSink for DiskSink {
    fn save(&mut self, request: SnapshotRequest) -> RendererResult<()> {
        if self.blocking {
            let path = save_blocking(&request, &self.dir)?;
            info!("Offline capture written to {:?}", path);
        } else {
            info!("Saving {} in the background", request.file_name());
            self.workers.push(SaveWorker::spawn(request, self.dir.clone()));
        }
        Ok(())
    }

    fn finish(&mut self) -> RendererResult<()> {
        for worker in self.workers.drain(..) {
            // failures were already logged by the worker
            if let Err(e) = worker.join() {
                warn!("Background snapshot failed: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(frame: u64) -> SnapshotRequest {
        SnapshotRequest {
            pixels: vec![10, 20, 30, 255, 40, 50, 60, 255],
            row_pitch: 8,
            width: 2,
            height: 1,
            method: "restir".to_string(),
            samples: 1,
            tolerance: 0,
            frame,
        }
    }

    #[test]
    fn test_blocking_sink_writes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = DiskSink::new(dir.path(), true);
        sink.save(request(3)).unwrap();
        assert!(dir.path().join("screenshot_restir_0-3_1.ppm").exists());
        assert_eq!(sink.pending(), 0);
    }

    #[test]
    fn test_background_sink_finishes_on_join() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = DiskSink::new(dir.path(), false);
        sink.save(request(4)).unwrap();
        sink.finish().unwrap();
        assert!(dir.path().join("screenshot_restir_0-4_1.ppm").exists());
    }
}
