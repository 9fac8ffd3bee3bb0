//! Adaptive Parallel Merger (§4.5): concatenates an ordered sequence of
//! sub-resources into one seekable stream, coping with inaccurate per-part
//! sizes by fanning reads out across tasks (one per sub-resource touched by
//! a call) and consuming their results in request order.
//!
//! Per reader: `{sub_readers[], active_sub_index, active_sub_offset, index}`.
//! On every return path, `sum_{i<active_sub_index}(true_size_i) +
//! active_sub_offset == index` (§4.5 invariant).
//!
//! Note on the "three zero-length reads" stall rule from the design this
//! was adapted from: under tokio's `AsyncRead` contract a `read` returning
//! `Ok(0)` always means end-of-stream (never a spurious retry-me signal),
//! so there is no stall state distinct from EOF to detect here — a `0` is
//! simply treated as that sub-reader's true end.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex as SyncMutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, ReadBuf};
use tokio::sync::Mutex as AsyncMutex;

use crate::resource::{resolve_seek, Reader, Resource};

struct Shared {
    sub_readers: Vec<Arc<AsyncMutex<Box<dyn Reader>>>>,
    subs: Arc<Vec<Arc<dyn Resource>>>,
    true_sizes: Arc<Vec<SyncMutex<Option<u64>>>>,
}

impl Shared {
    fn declared_size(&self, idx: usize) -> u64 {
        self.true_sizes[idx]
            .lock()
            .unwrap()
            .unwrap_or_else(|| self.subs[idx].size())
    }

    fn is_accurate(&self, idx: usize) -> bool {
        self.true_sizes[idx].lock().unwrap().is_some() || self.subs[idx].is_size_accurate()
    }

    fn mark_true_size(&self, idx: usize, size: u64) {
        *self.true_sizes[idx].lock().unwrap() = Some(size);
    }

    fn len(&self) -> usize {
        self.sub_readers.len()
    }
}

pub struct MergerResource {
    subs: Arc<Vec<Arc<dyn Resource>>>,
    true_sizes: Arc<Vec<SyncMutex<Option<u64>>>>,
}

impl MergerResource {
    pub fn new(subs: Vec<Arc<dyn Resource>>) -> Self {
        let true_sizes = Arc::new(subs.iter().map(|_| SyncMutex::new(None)).collect());
        Self {
            subs: Arc::new(subs),
            true_sizes,
        }
    }
}

#[async_trait]
impl Resource for MergerResource {
    async fn open(&self) -> io::Result<Box<dyn Reader>> {
        let mut sub_readers = Vec::with_capacity(self.subs.len());
        for s in self.subs.iter() {
            sub_readers.push(Arc::new(AsyncMutex::new(s.open().await?)));
        }
        let shared = Arc::new(Shared {
            sub_readers,
            subs: self.subs.clone(),
            true_sizes: self.true_sizes.clone(),
        });
        Ok(Box::new(MergerReader {
            shared,
            active_sub_index: 0,
            active_sub_offset: 0,
            index: 0,
            read_fut: None,
            seek_fut: None,
            pending_seek: None,
        }))
    }

    fn size(&self) -> u64 {
        (0..self.subs.len())
            .map(|i| {
                self.true_sizes[i]
                    .lock()
                    .unwrap()
                    .unwrap_or_else(|| self.subs[i].size())
            })
            .sum()
    }

    fn is_size_accurate(&self) -> bool {
        (0..self.subs.len())
            .all(|i| self.true_sizes[i].lock().unwrap().is_some() || self.subs[i].is_size_accurate())
    }
}

/// Reads `target` bytes (or to EOF) from one sub-reader, starting at
/// `offset`. Size-accurate subs read once per loop turn to fill the known
/// target; inaccurate ones grow their local buffer 10% whenever it fills
/// before EOF, since a part may return more than its hinted size.
async fn read_sub_task(
    reader: Arc<AsyncMutex<Box<dyn Reader>>>,
    offset: u64,
    target: usize,
    accurate: bool,
) -> io::Result<Vec<u8>> {
    let mut r = reader.lock().await;
    r.seek(io::SeekFrom::Start(offset)).await?;

    let mut buf = vec![0u8; target.max(1)];
    let mut filled = 0usize;
    loop {
        if filled >= target {
            break;
        }
        if filled == buf.len() {
            if accurate {
                break;
            }
            let grown = ((buf.len() as f64) * 1.1).ceil() as usize;
            buf.resize(grown.max(buf.len() + 1), 0);
        }
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Plans and spawns one task per sub-resource needed to satisfy `want`
/// bytes starting at `(start_idx, start_off)`, then drains the tasks in
/// request order. A task that fills its planned target without confirming
/// the sub's true EOF (i.e. its size isn't known accurate and it didn't
/// read a trailing `0`) halts consumption there, since a later sub's
/// bytes can only be treated as validly contiguous once this one is known
/// to have truly ended; every later (unconsumed) task's sub is seeked
/// back to where it started so it's re-read from scratch next call.
async fn do_fill(
    shared: Arc<Shared>,
    start_idx: usize,
    start_off: u64,
    want: usize,
) -> io::Result<(Vec<u8>, usize, u64)> {
    if want == 0 || start_idx >= shared.len() {
        return Ok((Vec::new(), start_idx, start_off));
    }

    let mut plan: Vec<(usize, u64, u64)> = Vec::new();
    {
        let mut idx = start_idx;
        let mut offset = start_off;
        let mut outstanding = want as u64;
        while idx < shared.len() && outstanding > 0 {
            let remaining_hint = shared.declared_size(idx).saturating_sub(offset).max(1);
            let target = remaining_hint.min(outstanding);
            plan.push((idx, offset, target));
            outstanding -= target;
            idx += 1;
            offset = 0;
        }
    }

    let mut tasks = Vec::with_capacity(plan.len());
    for &(idx, offset, target) in &plan {
        let reader = shared.sub_readers[idx].clone();
        let accurate = shared.is_accurate(idx);
        tasks.push(tokio::spawn(read_sub_task(reader, offset, target as usize, accurate)));
    }

    let mut out = vec![0u8; want];
    let mut filled = 0usize;
    let mut active_idx = start_idx;
    let mut active_off = start_off;
    let mut stop = false;
    let mut last_err: Option<io::Error> = None;

    for (pos, task) in tasks.into_iter().enumerate() {
        let (idx, plan_offset, target) = plan[pos];
        let outcome = task
            .await
            .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)));

        if stop {
            if outcome.is_ok() {
                let mut r = shared.sub_readers[idx].lock().await;
                let _ = r.seek(io::SeekFrom::Start(plan_offset)).await;
            }
            continue;
        }

        match outcome {
            Ok(data) => {
                let room = want - filled;
                let take = data.len().min(room);
                out[filled..filled + take].copy_from_slice(&data[..take]);
                filled += take;
                active_idx = idx;
                active_off = plan_offset + take as u64;

                if (data.len() as u64) < target {
                    // Fewer bytes than planned: read_sub_task only stops
                    // short of target on a confirmed `0`-byte read, so this
                    // sub has truly ended here.
                    shared.mark_true_size(idx, active_off);
                    active_idx = idx + 1;
                    active_off = 0;
                } else if !shared.is_accurate(idx) && pos + 1 < plan.len() {
                    // Hit the planned target without confirming EOF, and
                    // the hint for an inaccurate sub is only a guess: this
                    // sub may have more data than we read, so whatever
                    // later subs' tasks already fetched can't be trusted
                    // as truly following it.
                    stop = true;
                }
            }
            Err(e) => last_err = Some(e),
        }
    }

    out.truncate(filled);
    if filled == 0 {
        if let Some(e) = last_err {
            return Err(e);
        }
    }
    Ok((out, active_idx, active_off))
}

async fn learn_true_size(shared: &Shared, idx: usize) -> io::Result<u64> {
    if let Some(sz) = *shared.true_sizes[idx].lock().unwrap() {
        return Ok(sz);
    }
    let mut r = shared.sub_readers[idx].lock().await;
    let sz = r.seek(io::SeekFrom::End(0)).await?;
    drop(r);
    shared.mark_true_size(idx, sz);
    Ok(sz)
}

/// Forward/backward walk by `target - index`, learning true sub sizes only
/// as needed (never touches a sub-reader's cursor directly — `read_sub_task`
/// always seeks to its assigned offset first, so landing here just has to
/// get `(active_sub_index, active_sub_offset)` right).
async fn move_to(
    shared: Arc<Shared>,
    index: u64,
    mut active_idx: usize,
    mut active_off: u64,
    target: u64,
) -> io::Result<(u64, usize, u64)> {
    if target == index {
        return Ok((target, active_idx, active_off));
    }
    if target > index {
        let mut delta = target - index;
        while delta > 0 && active_idx < shared.len() {
            let true_size = learn_true_size(&shared, active_idx).await?;
            let remaining = true_size.saturating_sub(active_off);
            if delta <= remaining {
                active_off += delta;
                delta = 0;
            } else {
                delta -= remaining;
                active_idx += 1;
                active_off = 0;
            }
        }
    } else {
        let mut delta = index - target;
        if active_off >= delta {
            active_off -= delta;
            delta = 0;
        } else {
            delta -= active_off;
            active_off = 0;
            while delta > 0 && active_idx > 0 {
                active_idx -= 1;
                let true_size = learn_true_size(&shared, active_idx).await?;
                if delta <= true_size {
                    active_off = true_size - delta;
                    delta = 0;
                } else {
                    delta -= true_size;
                }
            }
        }
    }
    Ok((target, active_idx, active_off))
}

async fn do_seek(
    shared: Arc<Shared>,
    index: u64,
    active_idx: usize,
    active_off: u64,
    whence: io::SeekFrom,
) -> io::Result<(u64, usize, u64)> {
    match whence {
        io::SeekFrom::End(delta) => {
            let mut handles = Vec::with_capacity(shared.len());
            for idx in 0..shared.len() {
                let shared = shared.clone();
                handles.push(tokio::spawn(async move { learn_true_size(&shared, idx).await }));
            }
            let mut total = 0u64;
            for h in handles {
                total += h.await.map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
            }
            let target = resolve_seek(io::SeekFrom::End(delta), index, Some(total))?;
            move_to(shared, index, active_idx, active_off, target).await
        }
        other => {
            let target = resolve_seek(other, index, None)?;
            move_to(shared, index, active_idx, active_off, target).await
        }
    }
}

type FillFuture = Pin<Box<dyn Future<Output = io::Result<(Vec<u8>, usize, u64)>> + Send>>;
type SeekFuture = Pin<Box<dyn Future<Output = io::Result<(u64, usize, u64)>> + Send>>;

pub struct MergerReader {
    shared: Arc<Shared>,
    active_sub_index: usize,
    active_sub_offset: u64,
    index: u64,
    read_fut: Option<FillFuture>,
    seek_fut: Option<SeekFuture>,
    pending_seek: Option<io::SeekFrom>,
}

impl AsyncRead for MergerReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.read_fut.is_none() {
            let want = out.remaining();
            let shared = this.shared.clone();
            this.read_fut = Some(Box::pin(do_fill(
                shared,
                this.active_sub_index,
                this.active_sub_offset,
                want,
            )));
        }

        let fut = this.read_fut.as_mut().unwrap();
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => {
                this.read_fut = None;
                Poll::Ready(Err(e))
            }
            Poll::Ready(Ok((data, new_idx, new_off))) => {
                this.read_fut = None;
                this.active_sub_index = new_idx;
                this.active_sub_offset = new_off;
                this.index += data.len() as u64;
                out.put_slice(&data);
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl AsyncSeek for MergerReader {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        this.read_fut = None;
        this.pending_seek = Some(position);
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        if this.seek_fut.is_none() {
            let Some(position) = this.pending_seek.take() else {
                return Poll::Ready(Ok(this.index));
            };
            let shared = this.shared.clone();
            this.seek_fut = Some(Box::pin(do_seek(
                shared,
                this.index,
                this.active_sub_index,
                this.active_sub_offset,
                position,
            )));
        }

        let fut = this.seek_fut.as_mut().unwrap();
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => {
                this.seek_fut = None;
                Poll::Ready(Err(e))
            }
            Poll::Ready(Ok((new_index, new_idx, new_off))) => {
                this.seek_fut = None;
                this.index = new_index;
                this.active_sub_index = new_idx;
                this.active_sub_offset = new_off;
                Poll::Ready(Ok(new_index))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};

    struct VecResource {
        data: Vec<u8>,
        accurate: bool,
    }

    #[async_trait]
    impl Resource for VecResource {
        async fn open(&self) -> io::Result<Box<dyn Reader>> {
            Ok(Box::new(io::Cursor::new(self.data.clone())))
        }

        fn size(&self) -> u64 {
            self.data.len() as u64
        }

        fn is_size_accurate(&self) -> bool {
            self.accurate
        }
    }

    fn part(data: &[u8], accurate: bool) -> Arc<dyn Resource> {
        Arc::new(VecResource {
            data: data.to_vec(),
            accurate,
        })
    }

    #[tokio::test]
    async fn concatenates_parts_in_order() {
        let merger = MergerResource::new(vec![part(b"foo", true), part(b"bar", true), part(b"baz", true)]);
        let mut reader = merger.open().await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"foobarbaz");
    }

    #[tokio::test]
    async fn handles_inaccurate_parts_that_overshoot_hint() {
        // declared "size" hints are deliberately wrong (too small).
        let parts: Vec<Arc<dyn Resource>> = vec![
            Arc::new(VecResource {
                data: b"0123456789".to_vec(),
                accurate: false,
            }),
            Arc::new(VecResource {
                data: b"ABCDE".to_vec(),
                accurate: false,
            }),
        ];
        let merger = MergerResource::new(parts);
        let mut reader = merger.open().await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"0123456789ABCDE");
    }

    /// A `VecResource` that reports a declared size smaller than its real
    /// data, same as `VecResource` with `accurate: false`, but used here to
    /// spell out the `size()` vs `data.len()` mismatch explicitly.
    fn part_with_hint(real_data: &[u8], declared_hint: usize) -> Arc<dyn Resource> {
        struct HintedResource {
            data: Vec<u8>,
            hint: usize,
        }

        #[async_trait]
        impl Resource for HintedResource {
            async fn open(&self) -> io::Result<Box<dyn Reader>> {
                Ok(Box::new(io::Cursor::new(self.data.clone())))
            }

            fn size(&self) -> u64 {
                self.hint as u64
            }

            fn is_size_accurate(&self) -> bool {
                false
            }
        }

        Arc::new(HintedResource {
            data: real_data.to_vec(),
            hint: declared_hint,
        })
    }

    #[tokio::test]
    async fn touched_sub_exceeding_its_declared_hint_is_not_dropped() {
        // declared sizes 1/1/2, real sizes 3/2/5 -> "HelloWorld".
        let merger = MergerResource::new(vec![
            part_with_hint(b"Hel", 1),
            part_with_hint(b"lo", 1),
            part_with_hint(b"World", 2),
        ]);
        let mut reader = merger.open().await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"HelloWorld");
    }

    #[tokio::test]
    async fn seek_start_lands_in_second_part() {
        let merger = MergerResource::new(vec![part(b"hello", true), part(b"world", true)]);
        let mut reader = merger.open().await.unwrap();
        reader.seek(io::SeekFrom::Start(6)).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"orld");
    }

    #[tokio::test]
    async fn seek_end_computes_total_across_parts() {
        let merger = MergerResource::new(vec![part(b"hello", false), part(b"world!", false)]);
        let mut reader = merger.open().await.unwrap();
        let size = reader.seek(io::SeekFrom::End(-3)).await.unwrap();
        assert_eq!(size, 8);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ld!");
    }

    #[tokio::test]
    async fn seek_backward_across_part_boundary() {
        let merger = MergerResource::new(vec![part(b"hello", true), part(b"world", true)]);
        let mut reader = merger.open().await.unwrap();
        let mut out = [0u8; 8];
        reader.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hellowor");
        reader.seek(io::SeekFrom::Start(3)).await.unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"loworld");
    }

    #[tokio::test]
    async fn small_reads_respect_invariant_across_boundary() {
        let merger = MergerResource::new(vec![part(b"ab", true), part(b"cd", true), part(b"ef", true)]);
        let mut reader = merger.open().await.unwrap();
        let mut collected = Vec::new();
        let mut buf = [0u8; 1];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.push(buf[0]);
        }
        assert_eq!(collected, b"abcdef");
    }
}
