//! Execution units
//!
//! A unit is one OS thread that warms the codec up once and then runs one
//! task at a time. It keeps nothing between tasks: it receives a task, runs
//! the codec, reports the outcome to the manager and goes back to waiting
//! for its next command.

use crate::core::{Codec, ConvertOutput, PoolError, Task};
use crate::pool::manager::{Shared, UnitId};
use crossbeam_channel::Receiver;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use ::tracing::{debug, span, Level};

/// Messages from the manager to a unit
pub(crate) enum UnitCommand {
    /// Run this task, then report back
    Run(Task),
    /// Exit after the current command
    Retire,
}

/// Result of one guarded codec call
pub(crate) enum Execution {
    /// The codec returned, successfully or not
    Finished {
        outcome: std::result::Result<ConvertOutput, PoolError>,
        elapsed: Duration,
    },
    /// The codec panicked
    Panicked { message: String, elapsed: Duration },
}

/// Start a unit thread
pub(crate) fn spawn(
    shared: Arc<Shared>,
    id: UnitId,
    name: String,
    commands: Receiver<UnitCommand>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(name)
        .spawn(move || run(shared, id, commands))
}

/// Reports a unit whose thread unwinds past the codec boundary
struct ExitGuard {
    shared: Arc<Shared>,
    id: UnitId,
    armed: bool,
}

impl ExitGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shared
                .unit_lost(self.id, "unit thread exited unexpectedly".to_string());
        }
    }
}

/// Unit main loop
fn run(shared: Arc<Shared>, id: UnitId, commands: Receiver<UnitCommand>) {
    #[cfg(feature = "tracing")]
    let unit_span = span!(Level::DEBUG, "unit", id = id.as_usize());
    #[cfg(feature = "tracing")]
    let _guard = unit_span.enter();

    let mut guard = ExitGuard {
        shared: Arc::clone(&shared),
        id,
        armed: true,
    };

    let codec = shared.codec();
    let warmed = catch_unwind(AssertUnwindSafe(|| codec.warm_up()));
    match warmed {
        Ok(Ok(())) => {
            #[cfg(feature = "tracing")]
            debug!("unit warmed up");
            shared.unit_ready(id);
        }
        Ok(Err(e)) => {
            guard.disarm();
            shared.unit_start_failed(id, e.to_string());
            return;
        }
        Err(panic) => {
            guard.disarm();
            shared.unit_start_failed(id, panic_message(panic.as_ref()));
            return;
        }
    }

    while let Ok(command) = commands.recv() {
        match command {
            UnitCommand::Run(task) => {
                #[cfg(feature = "tracing")]
                crate::tracing::metrics::record_unit_busy(id.as_usize());

                match execute(codec.as_ref(), task) {
                    Execution::Finished { outcome, elapsed } => {
                        shared.task_finished(id, outcome, elapsed);
                    }
                    Execution::Panicked { message, elapsed } => {
                        log::error!("{} crashed after {:?}: {}", id, elapsed, message);
                        guard.disarm();
                        shared.record_processing(elapsed);
                        shared.unit_lost(id, message);
                        return;
                    }
                }

                #[cfg(feature = "tracing")]
                crate::tracing::metrics::record_unit_idle(id.as_usize());
            }
            UnitCommand::Retire => break,
        }
    }

    guard.disarm();
    log::debug!("{} exited", id);
}

/// Run the codec for one task with panic protection
///
/// The input buffer is released as soon as the codec returns.
pub(crate) fn execute(codec: &dyn Codec, task: Task) -> Execution {
    #[cfg(feature = "tracing")]
    let _task_guard = task.span.enter();

    let task_id = task.id().as_u64();
    let start = Instant::now();
    let result = catch_unwind(AssertUnwindSafe(|| {
        codec.convert(&task.input, &task.options, task.shared.token())
    }));
    let elapsed = start.elapsed();

    match result {
        Ok(Ok(output)) => {
            #[cfg(feature = "tracing")]
            crate::tracing::metrics::record_completion(elapsed, true);
            Execution::Finished {
                outcome: Ok(output),
                elapsed,
            }
        }
        Ok(Err(e)) => {
            #[cfg(feature = "tracing")]
            crate::tracing::metrics::record_completion(elapsed, false);
            log::debug!("task {} rejected by codec: {}", task_id, e);
            Execution::Finished {
                outcome: Err(PoolError::codec(task_id, e.message())),
                elapsed,
            }
        }
        Err(panic) => {
            #[cfg(feature = "tracing")]
            crate::tracing::metrics::record_crash(elapsed);
            Execution::Panicked {
                message: panic_message(panic.as_ref()),
                elapsed,
            }
        }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        CancellationToken, CodecError, ConvertOptions, FnCodec, ImageFormat, TaskId, TaskShared,
    };

    fn task(id: u64, input: &[u8]) -> Task {
        Task {
            input: input.to_vec(),
            options: ConvertOptions::new(ImageFormat::Png),
            timeout: None,
            shared: Arc::new(TaskShared::new(TaskId(id), CancellationToken::new())),
            #[cfg(feature = "tracing")]
            span: ::tracing::Span::none(),
        }
    }

    #[test]
    fn test_execute_success() {
        let codec = FnCodec::new(|input, options, _| {
            Ok(ConvertOutput::new(input.iter().rev().copied().collect(), options.format))
        });
        match execute(&codec, task(1, &[1, 2, 3])) {
            Execution::Finished { outcome, .. } => {
                assert_eq!(outcome.unwrap().data(), &[3, 2, 1]);
            }
            Execution::Panicked { .. } => panic!("codec should not panic"),
        }
    }

    #[test]
    fn test_execute_codec_error() {
        let codec = FnCodec::new(|_, _, _| Err(CodecError::new("unrecognized input format")));
        match execute(&codec, task(9, b"garbage")) {
            Execution::Finished { outcome, .. } => {
                let err = outcome.unwrap_err();
                assert_eq!(err, PoolError::codec(9, "unrecognized input format"));
            }
            Execution::Panicked { .. } => panic!("codec should not panic"),
        }
    }

    #[test]
    fn test_execute_contains_panic() {
        let codec = FnCodec::new(|_, _, _| -> Result<ConvertOutput, CodecError> {
            panic!("decoder blew up")
        });
        match execute(&codec, task(2, b"x")) {
            Execution::Panicked { message, .. } => assert_eq!(message, "decoder blew up"),
            Execution::Finished { .. } => panic!("panic should be reported"),
        }
    }

    #[test]
    fn test_panic_message_formats() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(other.as_ref()), "Unknown panic");
    }
}
