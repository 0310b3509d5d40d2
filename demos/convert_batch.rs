//! Batch conversion example
//!
//! Converts a batch of fake images with a simulated codec, resizes the pool
//! while it works, and prints statistics at the end.
//!
//! Run with: RUST_LOG=debug cargo run --example convert_batch

use std::thread;
use std::time::Duration;
use transcode_pool::prelude::*;

/// Pretends to decode a square greyscale image and re-encode it
struct FakeCodec;

impl Codec for FakeCodec {
    fn warm_up(&self) -> std::result::Result<(), CodecError> {
        // Encoder tables, model weights and so on
        thread::sleep(Duration::from_millis(30));
        Ok(())
    }

    fn convert(
        &self,
        input: &[u8],
        options: &ConvertOptions,
        token: &CancellationToken,
    ) -> std::result::Result<ConvertOutput, CodecError> {
        if input.is_empty() {
            return Err(CodecError::new("empty input"));
        }
        let side = (input.len() as f64).sqrt() as u32;
        let width = options.width.unwrap_or(side);
        let height = options.height.unwrap_or(side);

        // Work in slices so that cancellation is noticed quickly
        for _ in 0..10 {
            token.check()?;
            thread::sleep(Duration::from_millis(5));
        }

        let keep = input.len() * usize::from(options.quality.max(1)) / 100;
        Ok(ConvertOutput::new(input[..keep.max(1)].to_vec(), options.format)
            .with_dimensions(width, height)
            .with_original_dimensions(side, side))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

fn main() -> Result<()> {
    env_logger::init();
    println!("=== Transcode Pool - Batch Conversion Example ===\n");

    let config = PoolConfig::from_env()?.with_task_timeout(Duration::from_secs(2));
    let pool = TranscodePool::new(config, FakeCodec)?;
    println!("1. Pool created with capacity {}", pool.capacity());

    pool.launch()?;
    pool.ready().wait();
    println!("   First unit is warm");

    println!("\n2. Submitting 24 conversions:");
    let formats = [ImageFormat::Webp, ImageFormat::Avif, ImageFormat::Jpeg];
    let handles = (0..24usize)
        .map(|i| {
            let options = ConvertOptions::new(formats[i % formats.len()])
                .with_quality(70)
                .with_width(128);
            pool.submit(vec![i as u8; 256 * 256], options)
        })
        .collect::<Result<Vec<_>>>()?;

    // One bad request and one that gets cancelled
    let bad = pool.submit(Vec::new(), ConvertOptions::default())?;
    let cancelled = pool.submit(vec![1; 64], ConvertOptions::default())?;
    cancelled.cancel();

    println!("\n3. Resizing while busy: {} -> 2 -> 6", pool.capacity());
    pool.set_capacity(2);
    thread::sleep(Duration::from_millis(50));
    pool.set_capacity(6);

    for handle in &handles {
        let output = handle.wait()?;
        println!(
            "   {} -> {} {}x{} ({} bytes)",
            handle.id(),
            output.format,
            output.width,
            output.height,
            output.len()
        );
    }
    println!("   bad input: {:?}", bad.wait().map(|o| o.len()));
    println!("   cancelled: {:?}", cancelled.wait().map(|o| o.len()));

    pool.close(CloseMode::Graceful)?;

    let stats = pool.stats();
    println!("\n4. Statistics:");
    println!("   submitted: {}", stats.tasks_submitted);
    println!("   completed: {}", stats.tasks_completed);
    println!("   failed:    {}", stats.tasks_failed);
    println!("   cancelled: {}", stats.tasks_cancelled);
    println!("   units started: {}", stats.units_started);
    println!("   avg conversion: {:?}", stats.avg_processing_time);
    println!("   success rate: {:.1}%", stats.success_rate());

    println!("\n=== Example completed successfully ===");
    Ok(())
}
