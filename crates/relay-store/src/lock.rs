//! Many-readers / one-writer locks usable from both OS threads and tokio tasks.
//!
//! Neither acquisition path has a timeout. Releasing a lock that was never
//! acquired, or acquiring twice on one thread, blocks forever.

use std::future::Future;
use std::pin::pin;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

pub trait ReadWriteLock: Send + Sync {
    fn acquire_read(&self);
    fn release_read(&self);
    fn acquire_write(&self);
    fn release_write(&self);

    /// Cooperative acquisition. Dropping the future before it resolves leaves
    /// the lock state as if it had never been called.
    fn acquire_read_async(&self) -> impl Future<Output = ()> + Send;
    fn acquire_write_async(&self) -> impl Future<Output = ()> + Send;

    fn read(&self) -> ReadGuard<'_, Self>
    where
        Self: Sized,
    {
        self.acquire_read();
        ReadGuard { lock: self }
    }

    fn write(&self) -> WriteGuard<'_, Self>
    where
        Self: Sized,
    {
        self.acquire_write();
        WriteGuard { lock: self }
    }

    fn read_async(&self) -> impl Future<Output = ReadGuard<'_, Self>> + Send
    where
        Self: Sized,
    {
        async move {
            self.acquire_read_async().await;
            ReadGuard { lock: self }
        }
    }

    fn write_async(&self) -> impl Future<Output = WriteGuard<'_, Self>> + Send
    where
        Self: Sized,
    {
        async move {
            self.acquire_write_async().await;
            WriteGuard { lock: self }
        }
    }
}

/// Shared access; released on drop, including during unwinding.
#[must_use = "the read lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a, L: ReadWriteLock> {
    lock: &'a L,
}

impl<L: ReadWriteLock> Drop for ReadGuard<'_, L> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive access; released on drop, including during unwinding.
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a, L: ReadWriteLock> {
    lock: &'a L,
}

impl<L: ReadWriteLock> Drop for WriteGuard<'_, L> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct LockState {
    readers: usize,
    writers_waiting: usize,
    writer_active: bool,
}

impl LockState {
    fn reader_may_enter(&self) -> bool {
        !self.writer_active && self.writers_waiting == 0
    }

    fn writer_may_enter(&self) -> bool {
        !self.writer_active && self.readers == 0
    }
}

/// Readers share, writers exclude, and a waiting writer blocks new readers so
/// writers cannot starve.
///
/// Blocked threads park on condvars; blocked tasks wait on [`Notify`]. Every
/// state change signals both, so threads and tasks may contend for one lock.
#[derive(Default)]
pub struct WriterPriorityLock {
    state: Mutex<LockState>,
    reader_cv: Condvar,
    writer_cv: Condvar,
    reader_notify: Notify,
    writer_notify: Notify,
}

impl WriterPriorityLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn wake_one_writer(&self) {
        self.writer_cv.notify_one();
        self.writer_notify.notify_one();
    }

    fn wake_all_readers(&self) {
        self.reader_cv.notify_all();
        self.reader_notify.notify_waiters();
    }

    #[cfg(test)]
    fn snapshot(&self) -> LockState {
        *self.state.lock()
    }
}

/// Withdraws a queued async writer whose future was dropped.
struct PendingWriter<'a> {
    lock: &'a WriterPriorityLock,
    queued: bool,
}

impl Drop for PendingWriter<'_> {
    fn drop(&mut self) {
        if !self.queued {
            return;
        }
        let mut state = self.lock.state.lock();
        state.writers_waiting -= 1;
        let wake_readers = state.writers_waiting == 0 && !state.writer_active;
        let pass_turn = state.writers_waiting > 0 && state.writer_may_enter();
        drop(state);

        if wake_readers {
            self.lock.wake_all_readers();
        } else if pass_turn {
            self.lock.wake_one_writer();
        }
    }
}

impl ReadWriteLock for WriterPriorityLock {
    fn acquire_read(&self) {
        let mut state = self.state.lock();
        while !state.reader_may_enter() {
            self.reader_cv.wait(&mut state);
        }
        state.readers += 1;
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "release_read without a reader");
        state.readers -= 1;
        let last = state.readers == 0;
        drop(state);

        if last {
            self.wake_one_writer();
        }
    }

    fn acquire_write(&self) {
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        while !state.writer_may_enter() {
            self.writer_cv.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writer_active = true;
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer_active, "release_write without a writer");
        state.writer_active = false;
        let writers_waiting = state.writers_waiting > 0;
        drop(state);

        if writers_waiting {
            self.wake_one_writer();
        } else {
            self.wake_all_readers();
        }
    }

    fn acquire_read_async(&self) -> impl Future<Output = ()> + Send {
        async move {
            loop {
                // Register before checking so a release in between is not missed.
                let mut notified = pin!(self.reader_notify.notified());
                notified.as_mut().enable();
                {
                    let mut state = self.state.lock();
                    if state.reader_may_enter() {
                        state.readers += 1;
                        return;
                    }
                }
                notified.await;
            }
        }
    }

    fn acquire_write_async(&self) -> impl Future<Output = ()> + Send {
        async move {
            self.state.lock().writers_waiting += 1;
            let mut pending = PendingWriter {
                lock: self,
                queued: true,
            };
            loop {
                let mut notified = pin!(self.writer_notify.notified());
                notified.as_mut().enable();
                {
                    let mut state = self.state.lock();
                    if state.writer_may_enter() {
                        state.writers_waiting -= 1;
                        state.writer_active = true;
                        pending.queued = false;
                        return;
                    }
                }
                notified.await;
            }
        }
    }
}

/// Same interface, no exclusion. For backends that synchronize on their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLock;

impl ReadWriteLock for NullLock {
    fn acquire_read(&self) {}
    fn release_read(&self) {}
    fn acquire_write(&self) {}
    fn release_write(&self) {}

    fn acquire_read_async(&self) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn acquire_write_async(&self) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const UNIT: Duration = Duration::from_millis(100);

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn spawn_reader<L: ReadWriteLock + 'static>(
        lock: &Arc<L>,
        log: &Log,
        units: u32,
        label: &'static str,
    ) -> thread::JoinHandle<()> {
        let (lock, log) = (lock.clone(), log.clone());
        thread::spawn(move || {
            let _guard = lock.read();
            thread::sleep(UNIT * units);
            log.lock().push(label);
        })
    }

    fn spawn_writer<L: ReadWriteLock + 'static>(
        lock: &Arc<L>,
        log: &Log,
        units: u32,
        label: &'static str,
    ) -> thread::JoinHandle<()> {
        let (lock, log) = (lock.clone(), log.clone());
        thread::spawn(move || {
            let _guard = lock.write();
            thread::sleep(UNIT * units);
            log.lock().push(label);
        })
    }

    #[test]
    fn waiting_writers_go_before_new_readers() {
        let lock = Arc::new(WriterPriorityLock::new());
        let log: Log = Arc::default();

        let mut handles = vec![
            spawn_reader(&lock, &log, 4, "read_2"),
            spawn_reader(&lock, &log, 3, "read_1"),
        ];
        thread::sleep(UNIT);
        handles.push(spawn_writer(&lock, &log, 3, "write_1"));
        thread::sleep(UNIT);
        handles.push(spawn_reader(&lock, &log, 1, "read_3"));
        handles.push(spawn_writer(&lock, &log, 1, "write_2"));

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(
            *log.lock(),
            vec!["read_1", "read_2", "write_1", "write_2", "read_3"]
        );
        assert_eq!(lock.snapshot(), LockState::default());
    }

    #[test]
    fn null_lock_follows_sleep_order() {
        let lock = Arc::new(NullLock);
        let log: Log = Arc::default();

        let mut handles = vec![spawn_reader(&lock, &log, 1, "read_1")];
        thread::sleep(UNIT);
        handles.push(spawn_writer(&lock, &log, 2, "write_1"));
        handles.push(spawn_reader(&lock, &log, 1, "read_2"));

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*log.lock(), vec!["read_1", "read_2", "write_1"]);
    }

    #[test]
    fn guard_released_when_holder_panics() {
        let lock = Arc::new(WriterPriorityLock::new());
        let holder = lock.clone();
        let result = thread::spawn(move || {
            let _guard = holder.write();
            panic!("boom");
        })
        .join();
        assert!(result.is_err());

        let _read = lock.read();
        assert_eq!(lock.snapshot().readers, 1);
        assert!(!lock.snapshot().writer_active);
    }

    async fn read_task(lock: Arc<WriterPriorityLock>, log: Log, units: u32, label: &'static str) {
        let _guard = lock.read_async().await;
        tokio::time::sleep(UNIT * units).await;
        log.lock().push(label);
    }

    async fn write_task(lock: Arc<WriterPriorityLock>, log: Log, units: u32, label: &'static str) {
        let _guard = lock.write_async().await;
        tokio::time::sleep(UNIT * units).await;
        log.lock().push(label);
    }

    #[tokio::test(start_paused = true)]
    async fn async_waiting_writers_go_before_new_readers() {
        let lock = Arc::new(WriterPriorityLock::new());
        let log: Log = Arc::default();

        let mut handles = vec![
            tokio::spawn(read_task(lock.clone(), log.clone(), 4, "read_2")),
            tokio::spawn(read_task(lock.clone(), log.clone(), 3, "read_1")),
        ];
        tokio::time::sleep(UNIT).await;
        handles.push(tokio::spawn(write_task(lock.clone(), log.clone(), 3, "write_1")));
        tokio::time::sleep(UNIT).await;
        handles.push(tokio::spawn(read_task(lock.clone(), log.clone(), 1, "read_3")));
        handles.push(tokio::spawn(write_task(lock.clone(), log.clone(), 1, "write_2")));

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(
            *log.lock(),
            vec!["read_1", "read_2", "write_1", "write_2", "read_3"]
        );
        assert_eq!(lock.snapshot(), LockState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_writer_unblocks_readers() {
        let lock = Arc::new(WriterPriorityLock::new());
        let held = lock.read_async().await;

        let queued = lock.clone();
        let writer = tokio::spawn(async move {
            let _guard = queued.write_async().await;
        });
        tokio::time::sleep(UNIT).await;
        assert_eq!(lock.snapshot().writers_waiting, 1);

        let blocked_reader = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _guard = lock.read_async().await;
            })
        };
        tokio::time::sleep(UNIT).await;
        assert!(!blocked_reader.is_finished());

        writer.abort();
        let _ = writer.await;
        assert_eq!(lock.snapshot().writers_waiting, 0);

        tokio::time::timeout(UNIT, blocked_reader)
            .await
            .expect("reader should be admitted once the writer withdrew")
            .unwrap();
        drop(held);
        assert_eq!(lock.snapshot(), LockState::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn thread_and_task_share_one_lock() {
        let lock = Arc::new(WriterPriorityLock::new());
        let guard = lock.write_async().await;

        let blocking = lock.clone();
        let reader = tokio::task::spawn_blocking(move || {
            let _guard = blocking.read();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        drop(guard);
        reader.await.unwrap();
        assert_eq!(lock.snapshot(), LockState::default());
    }

    #[tokio::test]
    async fn null_lock_async_is_immediate() {
        let lock = NullLock;
        let _w = lock.write_async().await;
        let _r = lock.read_async().await;
    }
}
