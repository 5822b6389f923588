use std::collections::BTreeMap;
use std::ops::Range;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info};
use ndarray::{stack, Array3, Array4, ArrayView3, Axis};

use crate::dataset::TileDataset;
use crate::error::{KelpError, Result};
use crate::io::RasterOpener;
use crate::tiling::Tile;

/// Loader settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    pub batch_size: usize,
    /// Reader threads. `0` reads on the calling thread.
    pub workers: usize,
    /// Batches that may be read ahead of the one being consumed.
    pub prefetch: usize,
}

impl LoaderOptions {
    /// Upper bound on tiles read but not yet handed to the consumer.
    pub fn window(&self) -> usize {
        self.batch_size * self.prefetch.max(1)
    }
}

/// A contiguous run of tiles, stacked into a `(batch, bands, crop, crop)`
/// tensor in grid order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub index: usize,
    pub tiles: Vec<Tile>,
    pub data: Array4<f32>,
}

enum Fetched {
    Tile(usize, Array3<f32>),
    Failed(KelpError),
}

/// Items released by a [`Resequencer`]: batch `index` covering `tiles`.
#[derive(Debug, PartialEq)]
pub struct ReadyBatch<T> {
    pub index: usize,
    pub tiles: Range<usize>,
    pub items: Vec<T>,
}

/// Reorders tiles arriving from parallel readers into contiguous batches.
pub struct Resequencer<T> {
    total: usize,
    batch_size: usize,
    next: usize,
    next_batch: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> Resequencer<T> {
    pub fn new(total: usize, batch_size: usize) -> Self {
        Self {
            total,
            batch_size: batch_size.max(1),
            next: 0,
            next_batch: 0,
            pending: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, index: usize, item: T) {
        self.pending.insert(index, item);
    }

    /// First tile index not yet released.
    pub fn next_index(&self) -> usize {
        self.next
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_finished(&self) -> bool {
        self.next >= self.total
    }

    /// Release the next batch once every tile in it has arrived. The last
    /// batch may be short.
    pub fn pop_batch(&mut self) -> Option<ReadyBatch<T>> {
        if self.is_finished() {
            return None;
        }
        let end = (self.next + self.batch_size).min(self.total);
        if !(self.next..end).all(|i| self.pending.contains_key(&i)) {
            return None;
        }

        let items = (self.next..end)
            .filter_map(|i| self.pending.remove(&i))
            .collect();
        let ready = ReadyBatch {
            index: self.next_batch,
            tiles: self.next..end,
            items,
        };
        self.next = end;
        self.next_batch += 1;
        Some(ready)
    }
}

/// Read every tile of `dataset` and hand batches to `on_batch` in grid order.
///
/// With `workers > 0`, reader threads each open their own handle and fetch
/// tiles out of order, at most [`LoaderOptions::window`] ahead of the batch
/// being consumed. The first error from a reader or from `on_batch` stops
/// the loop.
pub fn for_each_batch<O, F>(dataset: &TileDataset<O>, options: LoaderOptions, mut on_batch: F) -> Result<()>
where
    O: RasterOpener,
    F: FnMut(Batch) -> Result<()>,
{
    if options.batch_size == 0 {
        return Err(KelpError::InvalidConfig("batch_size must be > 0".to_string()));
    }

    info!(
        "Loading {} tiles in batches of {} ({} worker(s), prefetch {})",
        dataset.len(),
        options.batch_size,
        options.workers,
        options.prefetch
    );

    if options.workers == 0 {
        return load_sequential(dataset, options.batch_size, &mut on_batch);
    }

    let window = options.window();
    let (job_tx, job_rx) = bounded::<usize>(window);
    let (result_tx, result_rx) = bounded::<Fetched>(window);

    thread::scope(|scope| {
        for worker in 0..options.workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                let mut reader = match dataset.reader() {
                    Ok(reader) => reader,
                    Err(e) => {
                        let _ = result_tx.send(Fetched::Failed(e));
                        return;
                    }
                };
                for index in job_rx.iter() {
                    let fetched = match reader.get(index) {
                        Ok(tile) => Fetched::Tile(index, tile),
                        Err(e) => Fetched::Failed(e),
                    };
                    if result_tx.send(fetched).is_err() {
                        break;
                    }
                }
                debug!("Reader worker {} finished", worker);
            });
        }
        drop(job_rx);
        drop(result_tx);

        let outcome = drive(dataset, options.batch_size, window, &job_tx, &result_rx, &mut on_batch);

        // Closing both ends releases any worker blocked on a send or a receive.
        drop(job_tx);
        drop(result_rx);
        outcome
    })
}

fn drive<O, F>(
    dataset: &TileDataset<O>,
    batch_size: usize,
    window: usize,
    jobs: &Sender<usize>,
    results: &Receiver<Fetched>,
    on_batch: &mut F,
) -> Result<()>
where
    O: RasterOpener,
    F: FnMut(Batch) -> Result<()>,
{
    let total = dataset.len();
    let mut resequencer = Resequencer::new(total, batch_size);
    let mut dispatched = 0;

    loop {
        while dispatched < total && dispatched < resequencer.next_index() + window {
            jobs.send(dispatched)
                .map_err(|_| KelpError::Loader("all reader workers exited".to_string()))?;
            dispatched += 1;
        }

        while let Some(ready) = resequencer.pop_batch() {
            on_batch(assemble(dataset, ready)?)?;
        }
        if resequencer.is_finished() {
            return Ok(());
        }

        match results.recv() {
            Ok(Fetched::Tile(index, tile)) => resequencer.push(index, tile),
            Ok(Fetched::Failed(e)) => return Err(e),
            Err(_) => {
                return Err(KelpError::Loader(format!(
                    "reader workers exited with {} tile(s) outstanding",
                    total - resequencer.next_index()
                )))
            }
        }
    }
}

fn load_sequential<O, F>(dataset: &TileDataset<O>, batch_size: usize, on_batch: &mut F) -> Result<()>
where
    O: RasterOpener,
    F: FnMut(Batch) -> Result<()>,
{
    let mut reader = dataset.reader()?;
    let mut resequencer = Resequencer::new(dataset.len(), batch_size);
    for index in 0..dataset.len() {
        resequencer.push(index, reader.get(index)?);
        if let Some(ready) = resequencer.pop_batch() {
            on_batch(assemble(dataset, ready)?)?;
        }
    }
    Ok(())
}

fn assemble<O: RasterOpener>(dataset: &TileDataset<O>, ready: ReadyBatch<Array3<f32>>) -> Result<Batch> {
    let tiles = ready
        .tiles
        .clone()
        .map(|i| dataset.tile(i))
        .collect::<Result<Vec<_>>>()?;
    let views: Vec<ArrayView3<f32>> = ready.items.iter().map(|t| t.view()).collect();
    let data = stack(Axis(0), &views)?;
    debug!(
        "Batch {}: tiles {}..{}",
        ready.index, ready.tiles.start, ready.tiles.end
    );
    Ok(Batch {
        index: ready.index,
        tiles,
        data,
    })
}
