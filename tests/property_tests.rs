//! Property-based tests for transcode_pool using proptest

use proptest::prelude::*;
use transcode_pool::prelude::*;
use transcode_pool::{MAX_QUALITY, MAX_SPEED};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// ============================================================================
// Option validation
// ============================================================================

proptest! {
    /// Quality and speed inside their ranges always validate
    #[test]
    fn test_options_in_range_validate(
        quality in 0u8..=MAX_QUALITY,
        speed in 0u8..=MAX_SPEED,
        width in 0u32..10_000,
        height in 0u32..10_000,
    ) {
        let options = ConvertOptions::new(ImageFormat::Avif)
            .with_quality(quality)
            .with_speed(speed)
            .with_size(width, height);
        prop_assert!(options.validate().is_ok());

        let normalized = options.normalized().unwrap();
        prop_assert_eq!(normalized.width, (width > 0).then_some(width));
        prop_assert_eq!(normalized.height, (height > 0).then_some(height));
    }

    /// Out-of-range quality is a validation error
    #[test]
    fn test_quality_out_of_range(quality in (MAX_QUALITY + 1)..=u8::MAX) {
        let err = ConvertOptions::default().with_quality(quality).validate().unwrap_err();
        prop_assert_eq!(err.kind(), ErrorKind::Validation);
    }

    /// Out-of-range speed is a validation error
    #[test]
    fn test_speed_out_of_range(speed in (MAX_SPEED + 1)..=u8::MAX) {
        let err = ConvertOptions::default().with_speed(speed).validate().unwrap_err();
        prop_assert_eq!(err.kind(), ErrorKind::Validation);
    }

    /// Any format name the crate prints parses back
    #[test]
    fn test_format_names_parse(index in 0usize..ImageFormat::ALL.len()) {
        let format = ImageFormat::ALL[index];
        prop_assert_eq!(format.as_str().parse::<ImageFormat>().unwrap(), format);
        prop_assert_eq!(format.as_str().to_uppercase().parse::<ImageFormat>().unwrap(), format);
    }
}

// ============================================================================
// Scheduling
// ============================================================================

/// Codec with a random per-conversion delay that records overlap and order
struct Jitter {
    active: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<u64>>,
}

impl Jitter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        })
    }
}

impl Codec for Jitter {
    fn convert(
        &self,
        input: &[u8],
        options: &ConvertOptions,
        _token: &CancellationToken,
    ) -> std::result::Result<ConvertOutput, CodecError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let mut id = [0u8; 8];
        id.copy_from_slice(&input[..8]);
        self.started.lock().unwrap().push(u64::from_le_bytes(id));

        thread::sleep(Duration::from_millis(fastrand::u64(0..4)));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(ConvertOutput::new(input.to_vec(), options.format))
    }
}

fn run_batch(capacity: usize, tasks: usize) -> (Arc<Jitter>, Vec<TaskHandle>, TranscodePool) {
    let jitter = Jitter::new();
    let codec: Arc<dyn Codec> = jitter.clone();
    let pool = TranscodePool::with_shared_codec(PoolConfig::new(capacity), codec)
        .expect("Failed to create pool");

    let handles = (0..tasks as u64)
        .map(|i| {
            pool.submit(i.to_le_bytes().to_vec(), ConvertOptions::default())
                .expect("Failed to submit")
        })
        .collect();
    (jitter, handles, pool)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Running tasks never exceed capacity and every task completes once
    #[test]
    fn test_capacity_bound(capacity in 1usize..5, tasks in 1usize..24) {
        let (jitter, handles, pool) = run_batch(capacity, tasks);

        for handle in &handles {
            prop_assert!(handle.wait().is_ok());
        }
        pool.close(CloseMode::Graceful).unwrap();

        prop_assert!(jitter.peak.load(Ordering::SeqCst) <= capacity);
        let stats = pool.stats();
        prop_assert_eq!(stats.tasks_completed, tasks as u64);
        prop_assert_eq!(stats.tasks_finished(), tasks as u64);
        prop_assert!(stats.units_started <= capacity as u64);
        prop_assert_eq!(jitter.started.lock().unwrap().len(), tasks);
    }

    /// With a single unit, conversions start in submission order
    #[test]
    fn test_fifo_single_unit(tasks in 1usize..24) {
        let (jitter, handles, pool) = run_batch(1, tasks);

        for handle in &handles {
            prop_assert!(handle.wait().is_ok());
        }
        pool.close(CloseMode::Graceful).unwrap();

        let started = jitter.started.lock().unwrap().clone();
        prop_assert_eq!(started, (0..tasks as u64).collect::<Vec<_>>());
    }

    /// Resizing in the middle of a batch loses nothing
    #[test]
    fn test_resize_mid_batch(
        initial in 0usize..4,
        resizes in proptest::collection::vec(0usize..5, 1..4),
        tasks in 1usize..16,
    ) {
        let (_jitter, handles, pool) = run_batch(initial, tasks);

        for capacity in resizes {
            pool.set_capacity(capacity);
            thread::sleep(Duration::from_millis(fastrand::u64(0..3)));
        }
        pool.set_capacity(2);

        for handle in &handles {
            prop_assert!(handle.wait().is_ok());
        }
        pool.close(CloseMode::Graceful).unwrap();
        prop_assert_eq!(pool.stats().tasks_completed, tasks as u64);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Submitters on many threads racing with resizes: no input runs twice,
    /// none is lost, and the unit bound holds
    #[test]
    fn test_concurrent_submission_with_resizes(
        capacity in 1usize..5,
        submitters in 2usize..6,
        per_thread in 1usize..30,
        resizes in proptest::collection::vec(1usize..5, 0..4),
    ) {
        let jitter = Jitter::new();
        let codec: Arc<dyn Codec> = jitter.clone();
        let pool = Arc::new(
            TranscodePool::with_shared_codec(PoolConfig::new(capacity), codec)
                .expect("Failed to create pool"),
        );

        let workers: Vec<_> = (0..submitters as u64)
            .map(|t| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    (0..per_thread as u64)
                        .map(|i| {
                            if fastrand::u8(..4) == 0 {
                                thread::sleep(Duration::from_millis(1));
                            }
                            let id = t * 1_000 + i;
                            let handle = pool
                                .submit(id.to_le_bytes().to_vec(), ConvertOptions::default())
                                .expect("Failed to submit");
                            (id, handle)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let bound = resizes.iter().copied().chain(std::iter::once(capacity)).max().unwrap();
        for &size in &resizes {
            pool.set_capacity(size);
            thread::sleep(Duration::from_millis(fastrand::u64(0..3)));
        }

        let submitted: Vec<(u64, TaskHandle)> = workers
            .into_iter()
            .flat_map(|w| w.join().expect("submitter panicked"))
            .collect();
        let total = submitters * per_thread;
        prop_assert_eq!(submitted.len(), total);

        for (id, handle) in &submitted {
            let output = handle.wait().expect("conversion failed");
            prop_assert_eq!(output.data(), &id.to_le_bytes()[..]);
            // A second look sees the same single outcome
            let second = handle.wait().expect("outcome changed");
            prop_assert_eq!(second.data(), output.data());
        }
        pool.close(CloseMode::Graceful).unwrap();

        prop_assert!(jitter.peak.load(Ordering::SeqCst) <= bound);
        let stats = pool.stats();
        prop_assert_eq!(stats.tasks_completed, total as u64);
        prop_assert_eq!(stats.tasks_finished(), total as u64);

        let mut started = jitter.started.lock().unwrap().clone();
        started.sort_unstable();
        let mut expected: Vec<u64> = submitted.iter().map(|(id, _)| *id).collect();
        expected.sort_unstable();
        prop_assert_eq!(started, expected);
    }
}
