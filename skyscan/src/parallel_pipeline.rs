// THEORY:
// Block-parallel classification. When landcover windows tile image blocks
// exactly, every block can be classified on its own, so reading and classifying
// overlap: blocks stream in from the image (concurrently, bounded by the
// connection limit) and are handed to a pool of workers as soon as they arrive.
//
// The pool is a dispatcher in front of per-worker channels. Each task carries a
// oneshot sender for its result; workers run the CPU-bound chipping and
// classification on the blocking thread pool.

use crate::core_modules::geometry::PixelRect;
use crate::core_modules::model::{Model, PredictionBox};
use crate::core_modules::progress::ProgressDisplay;
use crate::core_modules::raster::{GeoImage, blocks_intersecting};
use crate::core_modules::region_filter::{PassthroughRegionFilter, RegionFilter};
use crate::core_modules::sliding_window::{Chipper, WindowSpec};
use crate::error::{Error, Result};
use crate::pipeline::classify_chips;
use futures::stream::{self, FuturesUnordered, StreamExt};
use image::RgbImage;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// What every worker needs to turn a block into predictions.
#[derive(Clone)]
pub struct BlockJob {
    pub model: Arc<dyn Model>,
    pub windows: Vec<WindowSpec>,
    pub resampled_size: Option<(u32, u32)>,
}

impl BlockJob {
    /// Classifies every window of `block` and moves the results to image coordinates.
    pub fn classify(&self, origin: PixelRect, block: &RgbImage) -> Result<Vec<PredictionBox>> {
        let chipper = Chipper::new(
            block,
            self.windows.clone(),
            self.resampled_size,
            self.model.metadata().model_size,
            Box::new(PassthroughRegionFilter),
        );
        let batch_size = self.model.batch_size().max(1);
        let mut chips = chipper.iter();
        let mut boxes = Vec::new();
        loop {
            let batch: Vec<_> = chips.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            boxes.extend(classify_chips(self.model.as_ref(), batch)?);
        }
        for prediction_box in &mut boxes {
            prediction_box.window = prediction_box.window.translate(origin.x, origin.y);
        }
        Ok(boxes)
    }
}

pub struct BlockTask {
    /// Block rectangle in image coordinates.
    pub origin: PixelRect,
    pub block: RgbImage,
    pub result_sender: oneshot::Sender<Result<Vec<PredictionBox>>>,
}

pub struct WorkerPool {
    task_sender: mpsc::UnboundedSender<BlockTask>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(job: BlockJob, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<BlockTask>();

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..worker_count)
            .map(|_| mpsc::unbounded_channel::<BlockTask>())
            .unzip();

        // Round-robin dispatcher
        tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                let _ = worker_senders[worker_idx].send(task);
                worker_idx = (worker_idx + 1) % worker_count;
            }
        });

        let mut workers = Vec::with_capacity(worker_count);
        for mut worker_receiver in worker_receivers {
            let worker_job = job.clone();
            let worker = tokio::spawn(async move {
                while let Some(task) = worker_receiver.recv().await {
                    let BlockTask { origin, block, result_sender } = task;
                    let job = worker_job.clone();
                    let result = tokio::task::spawn_blocking(move || job.classify(origin, &block))
                        .await
                        .map_err(Error::from)
                        .and_then(|result| result);
                    let _ = result_sender.send(result);
                }
            });
            workers.push(worker);
        }

        Self { task_sender, workers }
    }

    /// Queues a block and returns the receiver for its predictions.
    pub fn submit(
        &self,
        origin: PixelRect,
        block: RgbImage,
    ) -> Result<oneshot::Receiver<Result<Vec<PredictionBox>>>> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.task_sender
            .send(BlockTask { origin, block, result_sender })
            .map_err(|_| Error::Worker("Failed to send task to worker pool".to_string()))?;
        Ok(result_receiver)
    }

    pub async fn process_block(&self, origin: PixelRect, block: RgbImage) -> Result<Vec<PredictionBox>> {
        self.submit(origin, block)?
            .await
            .map_err(|_| Error::Worker("Failed to receive result from worker".to_string()))?
    }

    /// Stops accepting tasks and waits for the workers to drain.
    pub async fn shutdown(self) {
        drop(self.task_sender);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// Progress categories reported by `BlockProcessor::run`.
#[derive(Clone, Copy)]
pub struct BlockProgress<'a> {
    pub display: Option<&'a dyn ProgressDisplay>,
    pub reading: &'a str,
    pub classifying: &'a str,
}

impl BlockProgress<'_> {
    fn update(&self, category: &str, progress: f32) -> Result<()> {
        if let Some(display) = self.display {
            display.update(category, progress);
            if display.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }
        Ok(())
    }
}

/// Outcome of a block-parallel run.
#[derive(Debug, Default)]
pub struct BlockRun {
    pub boxes: Vec<PredictionBox>,
    pub blocks: usize,
}

pub struct BlockProcessor {
    pool: WorkerPool,
    max_connections: usize,
}

impl BlockProcessor {
    pub fn new(job: BlockJob, max_connections: usize) -> Self {
        Self {
            pool: WorkerPool::new(job, num_cpus::get()),
            max_connections: max_connections.max(1),
        }
    }

    /// Reads every block of `image` the filter accepts and classifies it in the pool.
    /// Prediction windows are in image coordinates.
    pub async fn run(
        self,
        image: &dyn GeoImage,
        filter: &dyn RegionFilter,
        progress: BlockProgress<'_>,
    ) -> Result<BlockRun> {
        let blocks = blocks_intersecting(image, &image.bounds(), filter);
        let total = blocks.len();
        debug!(blocks = total, workers = self.pool.workers.len(), "block-parallel run");

        let mut reads = stream::iter(blocks)
            .map(|block| async move {
                let pixels = image.read_block(block.col, block.row).await?;
                Ok::<_, Error>((block, pixels))
            })
            .buffer_unordered(self.max_connections);
        let mut pending = FuturesUnordered::new();
        let mut run = BlockRun::default();
        let (mut read, mut reading_done) = (0usize, total == 0);

        loop {
            tokio::select! {
                next = reads.next(), if !reading_done => match next {
                    Some(result) => {
                        let (block, pixels) = result?;
                        read += 1;
                        progress.update(progress.reading, read as f32 / total as f32)?;
                        pending.push(self.pool.submit(block.rect, pixels)?);
                    }
                    None => reading_done = true,
                },
                Some(result) = pending.next(), if !pending.is_empty() => {
                    let boxes = result
                        .map_err(|_| Error::Worker("Failed to receive result from worker".to_string()))??;
                    run.boxes.extend(boxes);
                    run.blocks += 1;
                    progress.update(progress.classifying, run.blocks as f32 / total as f32)?;
                }
                else => break,
            }
        }

        self.pool.shutdown().await;
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::model::{LinearModel, ModelPackage, tests::water_field_json};
    use crate::core_modules::raster::LocalImage;
    use crate::core_modules::transform::{AffineTransform, SpatialReference};
    use image::Rgb;
    use std::path::PathBuf;

    fn job(size: u32) -> BlockJob {
        let model = LinearModel::new(ModelPackage::from_json(&water_field_json(size)).unwrap()).unwrap();
        BlockJob {
            model: Arc::new(model),
            windows: vec![WindowSpec::new((size, size), (size, size))],
            resampled_size: None,
        }
    }

    #[tokio::test]
    async fn worker_pool_offsets_windows() {
        let pool = WorkerPool::new(job(8), 2);
        let block = RgbImage::from_pixel(16, 16, Rgb([10, 20, 200]));
        let boxes = pool
            .process_block(PixelRect::new(512, 0, 16, 16), block)
            .await
            .unwrap();
        assert_eq!(boxes.len(), 4);
        assert!(boxes.iter().all(|b| b.window.x >= 512));
        assert_eq!(boxes[0].top().unwrap().label, "water");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn block_processor_covers_every_block() {
        let mut pixels = RgbImage::from_pixel(1024, 600, Rgb([10, 20, 200]));
        for x in 512..1024 {
            for y in 0..600 {
                pixels.put_pixel(x, y, Rgb([200, 220, 40]));
            }
        }
        let image = LocalImage::from_pixels(
            PathBuf::from("memory.png"),
            pixels,
            AffineTransform::identity(),
            SpatialReference::Local,
        );
        let processor = BlockProcessor::new(job(64), 4);
        let progress = BlockProgress {
            display: None,
            reading: "Reading",
            classifying: "Classifying",
        };
        let run = processor
            .run(&image, &PassthroughRegionFilter, progress)
            .await
            .unwrap();
        assert_eq!(run.blocks, 4);
        // 8 x 8 windows in the full top blocks, 8 x 1 in the 88 pixel high bottom blocks.
        assert_eq!(run.boxes.len(), 2 * 64 + 2 * 8);
        for b in &run.boxes {
            let expected = if b.window.x >= 512 { "field" } else { "water" };
            assert_eq!(b.top().unwrap().label, expected);
        }
    }
}
