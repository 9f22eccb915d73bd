//! The reader / workers / writer pipeline shared by all three tools.
//!
//! One reader thread feeds a bounded channel of numbered parts, a set of
//! worker threads transforms them, and the calling thread drains the output
//! channel in arrival order. Errors poison the pipeline: the failing stage
//! drops its channel end, every other stage unblocks and exits, and the
//! first error is reported.

use crossbeam_channel::bounded;

use crate::error::*;

/// Queue and pool capacity for a given worker count.
pub fn queue_capacity(threads: usize) -> usize {
    threads + threads / 4 + 1
}

/// Per-thread transformation state.
pub trait Worker<I, O> {
    fn process(&mut self, part_id: u64, item: I) -> FastoreResult<O>;

    /// Called once after the input is drained; may emit one trailing part
    /// (used to flush worker-local deferred state).
    fn finish(&mut self) -> FastoreResult<Option<O>> {
        Ok(None)
    }
}

/// Run a full pipeline; the writer runs on the calling thread.
pub fn run<I, O, W, MkW, R, Wr>(threads: usize,
                                mut read: R,
                                make_worker: MkW,
                                mut write: Wr)
                                -> FastoreResult<()>
where
    I: Send,
    O: Send,
    W: Worker<I, O>,
    MkW: Fn() -> W + Sync,
    R: FnMut() -> FastoreResult<Option<I>> + Send,
    Wr: FnMut(O) -> FastoreResult<()>,
{
    let threads = threads.max(1);
    let capacity = queue_capacity(threads);
    let (in_tx, in_rx) = bounded::<(u64, I)>(capacity);
    let (out_tx, out_rx) = bounded::<FastoreResult<O>>(capacity);

    std::thread::scope(|scope| {
        let reader = scope.spawn(move || -> FastoreResult<()> {
            let mut part_id = 0u64;
            loop {
                match read()? {
                    Some(item) => {
                        if in_tx.send((part_id, item)).is_err() {
                            // a downstream stage died; it reports the error
                            return Ok(());
                        }
                        part_id += 1;
                    },
                    None => return Ok(()),
                }
            }
        });

        for _ in 0..threads {
            let rx = in_rx.clone();
            let tx = out_tx.clone();
            let make_worker = &make_worker;
            scope.spawn(move || {
                let mut worker = make_worker();
                for (part_id, item) in rx {
                    let result = worker.process(part_id, item);
                    let failed = result.is_err();
                    if tx.send(result).is_err() || failed {
                        return;
                    }
                }
                match worker.finish() {
                    Ok(Some(extra)) => {
                        let _ = tx.send(Ok(extra));
                    },
                    Ok(None) => {},
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    },
                }
            });
        }
        drop(in_rx);
        drop(out_tx);

        let mut first_error = None;
        for result in &out_rx {
            match result {
                Ok(output) => {
                    if let Err(e) = write(output) {
                        first_error = Some(e);
                        break;
                    }
                },
                Err(e) => {
                    first_error = Some(e);
                    break;
                },
            }
        }
        drop(out_rx);

        let reader_result = reader.join().expect("reader thread panicked");
        match first_error {
            Some(e) => Err(e),
            None => reader_result,
        }
    })
}
