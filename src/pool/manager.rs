//! Pool manager
//!
//! All scheduling decisions happen under one lock around [`PoolState`]:
//! taking the queue head, binding it to an idle unit, starting units,
//! retiring units and deciding who resolves a task. Whoever removes a task
//! from the queue or from a unit slot while holding the lock is the only
//! party allowed to resolve it. Resolutions are applied after the lock is
//! released.

use crate::core::{
    CancelHook, CancellationReason, CancellationToken, Codec, ConvertOptions, ImageFormat,
    OnceSignal, PoolError, Result, SharedCodec, Task, TaskHandle, TaskId, TaskOutcome,
    TaskShared,
};
use crate::pool::config::{CloseMode, PoolConfig, ZeroCapacityPolicy};
use crate::pool::readiness::ReadySignal;
use crate::pool::stats::{PoolCounters, PoolStats};
use crate::pool::unit::{self, Execution, UnitCommand};
use crate::pool::watchdog::Watchdog;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use crate::pool::stats::FormatStats;

/// Identifier of an execution unit
///
/// Unit numbers start at 1 and are never reused within a pool. Unit 0 stands
/// for the submitting thread when tasks run inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub(crate) usize);

impl UnitId {
    /// Raw value
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

const INLINE_UNIT: UnitId = UnitId(0);

/// Lifecycle of an execution unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitStatus {
    /// Thread spawned, codec warming up
    Starting,
    /// Waiting for a task
    Idle,
    /// Running a task
    Busy,
    /// Over capacity; exits once its current task or warm-up ends
    Draining,
    /// Gone
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Terminated,
}

/// A task bound to a unit or to the inline runner
struct Running {
    task: Arc<TaskShared>,
    format: ImageFormat,
    input_len: usize,
    timed_out: bool,
}

impl Running {
    fn of(task: &Task) -> Self {
        Self {
            task: Arc::clone(&task.shared),
            format: task.options.format,
            input_len: task.input.len(),
            timed_out: false,
        }
    }
}

struct UnitSlot {
    status: UnitStatus,
    commands: Sender<UnitCommand>,
    current: Option<Running>,
    thread: Option<JoinHandle<()>>,
}

impl UnitSlot {
    /// Counts toward capacity
    fn is_counted(&self) -> bool {
        matches!(
            self.status,
            UnitStatus::Starting | UnitStatus::Idle | UnitStatus::Busy
        )
    }
}

struct PoolState {
    phase: Phase,
    capacity: usize,
    launched: bool,
    next_task_id: u64,
    next_unit_id: usize,
    queue: VecDeque<Task>,
    units: BTreeMap<UnitId, UnitSlot>,
    inline_active: bool,
    inline_current: Option<Running>,
    exited: Vec<(UnitId, JoinHandle<()>)>,
    watchdog: Option<Watchdog>,
}

impl PoolState {
    fn counted_units(&self) -> usize {
        self.units.values().filter(|u| u.is_counted()).count()
    }

    fn starting_units(&self) -> usize {
        self.units
            .values()
            .filter(|u| u.status == UnitStatus::Starting)
            .count()
    }

    fn idle_unit(&self) -> Option<UnitId> {
        self.units
            .iter()
            .find(|(_, u)| u.status == UnitStatus::Idle)
            .map(|(id, _)| *id)
    }

    fn running_tasks(&self) -> usize {
        self.units.values().filter(|u| u.current.is_some()).count()
            + usize::from(self.inline_current.is_some())
    }

    fn has_running(&self) -> bool {
        self.running_tasks() > 0
    }

    /// Keep a retired unit's thread for joining at close
    fn park_thread(&mut self, id: UnitId, slot: &mut UnitSlot) {
        self.exited.retain(|(_, handle)| !handle.is_finished());
        if let Some(handle) = slot.thread.take() {
            self.exited.push((id, handle));
        }
    }
}

/// Side effects collected under the lock, applied after it is released
#[derive(Default)]
struct Effects {
    resolutions: Vec<(Arc<TaskShared>, TaskOutcome)>,
    ready: bool,
    cancel_all: bool,
    terminated: bool,
}

/// State shared by the pool handle, its units, its watchdog and task handles
pub(crate) struct Shared {
    config: PoolConfig,
    codec: SharedCodec,
    state: Mutex<PoolState>,
    counters: PoolCounters,
    ready: Arc<OnceSignal<()>>,
    terminated: OnceSignal<()>,
    root_token: CancellationToken,
    self_ref: Weak<Shared>,
}

impl Shared {
    pub(crate) fn codec(&self) -> SharedCodec {
        Arc::clone(&self.codec)
    }

    pub(crate) fn record_processing(&self, elapsed: Duration) {
        self.counters.record_processing(elapsed);
    }

    fn apply(&self, fx: Effects) {
        if fx.cancel_all {
            self.root_token
                .cancel_with_reason(CancellationReason::PoolClosed);
        }
        for (task, outcome) in fx.resolutions {
            task.resolve(outcome);
        }
        if fx.ready {
            self.ready.set(());
        }
        if fx.terminated {
            self.terminated.set(());
        }
    }

    /// Count and queue the resolution of a task this caller owns
    fn settle(&self, running: Running, outcome: TaskOutcome, fx: &mut Effects) {
        match &outcome {
            Ok(output) => {
                self.counters
                    .record_completed(running.format, running.input_len, output.len())
            }
            Err(e) => self.counters.record_failure(e.kind(), running.format),
        }
        fx.resolutions.push((running.task, outcome));
    }

    /// Fail a task that never left the queue
    fn fail_queued(&self, task: Task, error: PoolError, fx: &mut Effects) {
        let running = Running::of(&task);
        drop(task);
        self.settle(running, Err(error), fx);
    }

    fn abandon_queue(&self, state: &mut PoolState, reason: &str, fx: &mut Effects) -> usize {
        let abandoned = state.queue.len();
        while let Some(task) = state.queue.pop_front() {
            self.fail_queued(task, PoolError::pool_closed(reason), fx);
        }
        abandoned
    }

    /// Reconcile a codec result with cancellation that happened meanwhile
    fn reconcile(task: &TaskShared, outcome: TaskOutcome) -> TaskOutcome {
        let id = task.id().as_u64();
        match task.token().reason() {
            None => outcome,
            Some(CancellationReason::Manual) => {
                Err(PoolError::cancelled(id, "cancelled while running"))
            }
            Some(CancellationReason::Custom(reason)) => Err(PoolError::cancelled(id, reason)),
            Some(CancellationReason::Timeout(d)) => {
                Err(PoolError::timeout(id, d.as_millis() as u64))
            }
            Some(CancellationReason::PoolClosed) => {
                Err(PoolError::pool_closed("abandoned by immediate close"))
            }
        }
    }

    fn arm_deadline(&self, state: &mut PoolState, task: &Task) {
        let Some(timeout) = task.timeout else {
            return;
        };
        if state.watchdog.is_none() {
            let name = format!("{}-watchdog", self.config.thread_name_prefix);
            match Watchdog::spawn(name, self.self_ref.clone()) {
                Ok(watchdog) => state.watchdog = Some(watchdog),
                Err(e) => {
                    log::error!("failed to start watchdog, {} has no deadline: {}", task.id(), e);
                    return;
                }
            }
        }
        if let Some(watchdog) = &state.watchdog {
            watchdog.arm(task.id(), timeout);
        }
    }

    fn spawn_unit(&self, state: &mut PoolState, fx: &mut Effects) {
        let Some(shared) = self.self_ref.upgrade() else {
            return;
        };
        let id = UnitId(state.next_unit_id);
        state.next_unit_id += 1;

        let (sender, receiver) = crossbeam_channel::unbounded();
        let name = format!("{}-{}", self.config.thread_name_prefix, id.0);
        match unit::spawn(shared, id, name, receiver) {
            Ok(handle) => {
                self.counters.record_unit_started();
                log::debug!("{} starting", id);
                state.units.insert(
                    id,
                    UnitSlot {
                        status: UnitStatus::Starting,
                        commands: sender,
                        current: None,
                        thread: Some(handle),
                    },
                );
            }
            Err(e) => {
                log::error!("failed to spawn {}: {}", id, e);
                if let Some(task) = state.queue.pop_front() {
                    self.fail_queued(task, PoolError::spawn(id.0, e.to_string()), fx);
                }
            }
        }
    }

    /// Bind queued tasks to idle units and start units for what is left
    fn dispatch(&self, state: &mut PoolState, fx: &mut Effects) {
        if state.phase == Phase::Terminated {
            return;
        }

        while !state.queue.is_empty() {
            let Some(id) = state.idle_unit() else {
                break;
            };
            let Some(task) = state.queue.pop_front() else {
                break;
            };
            self.assign(state, id, task);
        }

        if !state.queue.is_empty() {
            let headroom = state.capacity.saturating_sub(state.counted_units());
            let demand = state.queue.len().saturating_sub(state.starting_units());
            for _ in 0..headroom.min(demand) {
                self.spawn_unit(state, fx);
            }
        }

        if state.phase == Phase::Closing {
            self.finish_closing(state, fx);
        }
    }

    fn assign(&self, state: &mut PoolState, id: UnitId, task: Task) {
        task.shared.mark_running();
        self.arm_deadline(state, &task);
        let running = Running::of(&task);

        let Some(slot) = state.units.get_mut(&id) else {
            state.queue.push_front(task);
            return;
        };
        match slot.commands.send(UnitCommand::Run(task)) {
            Ok(()) => {
                slot.status = UnitStatus::Busy;
                slot.current = Some(running);
            }
            Err(crossbeam_channel::SendError(command)) => {
                // The thread is gone without having reported; its exit guard
                // finds no slot later.
                log::warn!("{} stopped receiving work", id);
                if let UnitCommand::Run(task) = command {
                    state.queue.push_front(task);
                }
                if let Some(mut slot) = state.units.remove(&id) {
                    self.counters.record_unit_retired();
                    state.park_thread(id, &mut slot);
                }
            }
        }
    }

    fn retire(&self, state: &mut PoolState, id: UnitId) {
        if let Some(mut slot) = state.units.remove(&id) {
            let _ = slot.commands.send(UnitCommand::Retire);
            self.counters.record_unit_retired();
            log::debug!("{} retired", id);
            state.park_thread(id, &mut slot);
        }
    }

    /// Graceful close bookkeeping: give up on a stalled queue, and stop
    /// every unit once nothing is left to run
    fn finish_closing(&self, state: &mut PoolState, fx: &mut Effects) {
        if state.capacity == 0 && !state.inline_active && !state.queue.is_empty() {
            let abandoned = self.abandon_queue(state, "pool closed with zero capacity", fx);
            log::warn!("graceful close abandoned {} queued tasks", abandoned);
        }
        if !state.queue.is_empty() || state.has_running() || state.inline_active {
            return;
        }
        let ids: Vec<UnitId> = state.units.keys().copied().collect();
        for id in ids {
            self.retire(state, id);
        }
        state.phase = Phase::Terminated;
        fx.terminated = true;
    }

    pub(crate) fn unit_ready(&self, id: UnitId) {
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            let Some(slot) = state.units.get_mut(&id) else {
                return;
            };
            if slot.status == UnitStatus::Draining {
                self.retire(&mut state, id);
            } else {
                slot.status = UnitStatus::Idle;
                fx.ready = true;
                log::debug!("{} ready", id);
            }
            self.dispatch(&mut state, &mut fx);
        }
        self.apply(fx);
    }

    pub(crate) fn unit_start_failed(&self, id: UnitId, message: String) {
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            if state.units.contains_key(&id) {
                log::error!("{} failed to warm up: {}", id, message);
                self.retire(&mut state, id);
                // Starting units may fail too; the head is charged unless a
                // warmed-up unit can take it
                let served = state
                    .units
                    .values()
                    .any(|u| matches!(u.status, UnitStatus::Idle | UnitStatus::Busy));
                if served {
                    log::debug!("queue head left for warmed-up units");
                } else if let Some(task) = state.queue.pop_front() {
                    let error =
                        PoolError::worker_crash(id.0, format!("codec warm-up failed: {}", message));
                    self.fail_queued(task, error, &mut fx);
                }
                self.dispatch(&mut state, &mut fx);
            }
        }
        self.apply(fx);
    }

    pub(crate) fn task_finished(&self, id: UnitId, outcome: TaskOutcome, elapsed: Duration) {
        self.counters.record_processing(elapsed);
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            let Some(slot) = state.units.get_mut(&id) else {
                return;
            };
            if let Some(running) = slot.current.take() {
                if !running.timed_out {
                    let outcome = Self::reconcile(&running.task, outcome);
                    self.settle(running, outcome, &mut fx);
                }
            }
            if slot.status == UnitStatus::Draining {
                self.retire(&mut state, id);
            } else {
                slot.status = UnitStatus::Idle;
            }
            self.dispatch(&mut state, &mut fx);
        }
        self.apply(fx);
    }

    /// A unit thread died; fail its task and replace it at once if the pool
    /// was launched, otherwise when work arrives
    pub(crate) fn unit_lost(&self, id: UnitId, message: String) {
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            let Some(mut slot) = state.units.remove(&id) else {
                return;
            };
            self.counters.record_unit_retired();
            if let Some(running) = slot.current.take() {
                if !running.timed_out {
                    self.settle(running, Err(PoolError::worker_crash(id.0, &message)), &mut fx);
                }
            }
            let was_counted = slot.is_counted();
            state.park_thread(id, &mut slot);

            if was_counted
                && state.launched
                && state.phase == Phase::Open
                && state.counted_units() < state.capacity
            {
                log::info!("replacing crashed {}", id);
                self.spawn_unit(&mut state, &mut fx);
            }
            self.dispatch(&mut state, &mut fx);
        }
        self.apply(fx);
    }

    /// Watchdog callback
    pub(crate) fn deadline_expired(&self, task_id: TaskId, timeout: Duration) {
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let running = state
                .units
                .values_mut()
                .filter_map(|u| u.current.as_mut())
                .chain(state.inline_current.as_mut())
                .find(|r| r.task.id() == task_id && !r.timed_out);
            let Some(running) = running else {
                return;
            };

            running.timed_out = true;
            running
                .task
                .token()
                .cancel_with_reason(CancellationReason::Timeout(timeout));
            let expired = Running {
                task: Arc::clone(&running.task),
                format: running.format,
                input_len: running.input_len,
                timed_out: true,
            };
            log::warn!("{} exceeded its {:?} deadline", task_id, timeout);
            #[cfg(feature = "tracing")]
            crate::tracing::metrics::record_timeout(task_id.as_u64(), timeout);
            let error = PoolError::timeout(task_id.as_u64(), timeout.as_millis() as u64);
            self.settle(expired, Err(error), &mut fx);
        }
        self.apply(fx);
    }

    /// Drain the queue on the calling thread while capacity is zero
    fn run_inline(&self) {
        loop {
            let task = {
                let mut fx = Effects::default();
                let mut state = self.state.lock();
                let next = if state.phase == Phase::Terminated || state.capacity > 0 {
                    None
                } else {
                    state.queue.pop_front()
                };
                match next {
                    Some(task) => {
                        task.shared.mark_running();
                        self.arm_deadline(&mut state, &task);
                        state.inline_current = Some(Running::of(&task));
                        task
                    }
                    None => {
                        state.inline_active = false;
                        self.dispatch(&mut state, &mut fx);
                        drop(state);
                        self.apply(fx);
                        return;
                    }
                }
            };

            let execution = unit::execute(self.codec.as_ref(), task);
            let (outcome, elapsed) = match execution {
                Execution::Finished { outcome, elapsed } => (outcome, elapsed),
                Execution::Panicked { message, elapsed } => {
                    log::error!("inline conversion panicked: {}", message);
                    (Err(PoolError::worker_crash(INLINE_UNIT.0, message)), elapsed)
                }
            };
            self.counters.record_processing(elapsed);

            let mut fx = Effects::default();
            {
                let mut state = self.state.lock();
                if let Some(running) = state.inline_current.take() {
                    if !running.timed_out {
                        let outcome = Self::reconcile(&running.task, outcome);
                        self.settle(running, outcome, &mut fx);
                    }
                }
            }
            self.apply(fx);
        }
    }

    fn join_all(&self, handles: Vec<(UnitId, JoinHandle<()>)>) -> Result<()> {
        let mut result = Ok(());
        for (id, handle) in handles {
            if let Err(panic) = handle.join() {
                let message = unit::panic_message(panic.as_ref());
                log::error!("{} panicked during shutdown: {}", id, message);
                result = Err(PoolError::worker_crash(id.0, message));
            }
        }
        result
    }

    /// Join threads until `timeout` runs out; stragglers are left running
    fn join_with_timeout(&self, handles: Vec<(UnitId, JoinHandle<()>)>, timeout: Duration) {
        let start = Instant::now();
        let mut pending = handles;
        while !pending.is_empty() {
            let (finished, rest): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|(_, h)| h.is_finished());
            for (id, handle) in finished {
                if let Err(panic) = handle.join() {
                    log::error!(
                        "{} panicked during shutdown: {}",
                        id,
                        unit::panic_message(panic.as_ref())
                    );
                }
            }
            pending = rest;
            if pending.is_empty() {
                break;
            }
            if start.elapsed() >= timeout {
                for (id, _) in &pending {
                    log::warn!(
                        "{} did not finish within {:?} of close; leaving its thread behind",
                        id,
                        timeout
                    );
                }
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl CancelHook for Shared {
    fn cancel_task(&self, id: TaskId) {
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            let Some(index) = state.queue.iter().position(|t| t.id() == id) else {
                return;
            };
            if let Some(task) = state.queue.remove(index) {
                log::debug!("{} cancelled while queued", id);
                self.fail_queued(
                    task,
                    PoolError::cancelled(id.as_u64(), "cancelled while queued"),
                    &mut fx,
                );
            }
        }
        self.apply(fx);
    }
}

/// A bounded, resizable pool of image conversion units
///
/// Units are started lazily, only when a task is waiting and no unit is idle,
/// and never beyond the current capacity. Tasks are handed out strictly in
/// submission order. Capacity can be changed at any time; lowering it never
/// interrupts a running conversion.
///
/// Dropping the pool performs a graceful close.
pub struct TranscodePool {
    shared: Arc<Shared>,
}

impl TranscodePool {
    /// Create a pool around `codec`; no unit is started yet
    pub fn new(config: PoolConfig, codec: impl Codec + 'static) -> Result<Self> {
        Self::with_shared_codec(config, Arc::new(codec))
    }

    /// Create a pool with a default configuration of `capacity` units
    pub fn with_capacity(capacity: usize, codec: impl Codec + 'static) -> Result<Self> {
        Self::new(PoolConfig::new(capacity), codec)
    }

    /// Create a pool around a codec that is already shared
    pub fn with_shared_codec(config: PoolConfig, codec: SharedCodec) -> Result<Self> {
        config.validate()?;
        log::info!(
            "transcode pool created: capacity={}, codec={}, zero-capacity={:?}",
            config.capacity,
            codec.name(),
            config.zero_capacity_policy
        );

        let capacity = config.capacity;
        let shared = Arc::new_cyclic(|weak| Shared {
            config,
            codec,
            state: Mutex::new(PoolState {
                phase: Phase::Open,
                capacity,
                launched: false,
                next_task_id: 1,
                next_unit_id: 1,
                queue: VecDeque::new(),
                units: BTreeMap::new(),
                inline_active: false,
                inline_current: None,
                exited: Vec::new(),
                watchdog: None,
            }),
            counters: PoolCounters::default(),
            ready: Arc::new(OnceSignal::new()),
            terminated: OnceSignal::new(),
            root_token: CancellationToken::new(),
            self_ref: weak.clone(),
        });
        Ok(Self { shared })
    }

    /// Submit a conversion
    ///
    /// Options are validated here; invalid options are rejected with
    /// [`PoolError::Validation`] and no task is created. The pool-wide task
    /// timeout applies, if configured.
    pub fn submit(&self, input: Vec<u8>, options: ConvertOptions) -> Result<TaskHandle> {
        self.submit_task(input, options, None)
    }

    /// Submit a conversion with its own deadline
    ///
    /// The deadline counts from the moment a unit picks the task up.
    pub fn submit_with_timeout(
        &self,
        input: Vec<u8>,
        options: ConvertOptions,
        timeout: Duration,
    ) -> Result<TaskHandle> {
        if timeout.is_zero() {
            return Err(PoolError::validation("timeout", "must be greater than 0"));
        }
        self.submit_task(input, options, Some(timeout))
    }

    fn submit_task(
        &self,
        input: Vec<u8>,
        options: ConvertOptions,
        timeout: Option<Duration>,
    ) -> Result<TaskHandle> {
        let options = options.normalized()?;
        let shared = &self.shared;
        let mut fx = Effects::default();

        let (handle, run_inline) = {
            let mut state = shared.state.lock();
            if state.phase != Phase::Open {
                return Err(PoolError::pool_closed("pool is closed to new submissions"));
            }

            let id = TaskId(state.next_task_id);
            state.next_task_id += 1;
            let task_shared = Arc::new(TaskShared::new(id, shared.root_token.child()));
            let hook: Weak<dyn CancelHook> = shared.self_ref.clone();
            let handle = TaskHandle::new(Arc::clone(&task_shared), hook);

            state.queue.push_back(Task {
                input,
                options,
                timeout: timeout.or(shared.config.task_timeout),
                shared: task_shared,
                #[cfg(feature = "tracing")]
                span: ::tracing::Span::current(),
            });
            shared.counters.record_submission();
            #[cfg(feature = "tracing")]
            crate::tracing::metrics::record_submission(state.queue.len());

            let run_inline = state.capacity == 0
                && shared.config.zero_capacity_policy == ZeroCapacityPolicy::Inline
                && !state.inline_active;
            if run_inline {
                state.inline_active = true;
            } else {
                shared.dispatch(&mut state, &mut fx);
            }
            (handle, run_inline)
        };

        shared.apply(fx);
        if run_inline {
            shared.run_inline();
        }
        Ok(handle)
    }

    /// Change the target number of units
    ///
    /// Raising it starts units only if tasks are waiting. Lowering it retires
    /// idle units at once and lets busy ones finish their task first. Has no
    /// effect once the pool has terminated.
    pub fn set_capacity(&self, capacity: usize) {
        let shared = &self.shared;
        let mut fx = Effects::default();
        {
            let mut state = shared.state.lock();
            if state.phase == Phase::Terminated {
                return;
            }
            let previous = std::mem::replace(&mut state.capacity, capacity);
            if previous != capacity {
                log::info!("capacity {} -> {}", previous, capacity);
                #[cfg(feature = "tracing")]
                crate::tracing::metrics::record_capacity_change(previous, capacity);
            }

            let counted = state.counted_units();
            if counted > capacity {
                shared.shrink(&mut state, counted - capacity);
            } else {
                shared.revive(&mut state, capacity - counted);
            }
            shared.dispatch(&mut state, &mut fx);
        }
        shared.apply(fx);
    }

    /// Start units up to capacity without waiting for work
    ///
    /// Calling it again while those units are alive does nothing.
    pub fn launch(&self) -> Result<()> {
        let shared = &self.shared;
        let mut fx = Effects::default();
        {
            let mut state = shared.state.lock();
            if state.phase != Phase::Open {
                return Err(PoolError::pool_closed("cannot launch a closed pool"));
            }
            state.launched = true;
            let missing = state.capacity.saturating_sub(state.counted_units());
            for _ in 0..missing {
                shared.spawn_unit(&mut state, &mut fx);
            }
        }
        shared.apply(fx);
        Ok(())
    }

    /// Signal that resolves once the first unit is idle
    pub fn ready(&self) -> ReadySignal {
        ReadySignal::new(Arc::clone(&self.shared.ready))
    }

    /// Close the pool
    ///
    /// Blocks until the pool has terminated. A graceful close waits for
    /// every queued and running task; if capacity is 0 at that point the
    /// queue is failed with [`PoolError::PoolClosed`] instead. An immediate
    /// close fails all outstanding work right away and waits at most
    /// [`PoolConfig::shutdown_timeout`] for unit threads to exit. Closing
    /// again is a no-op, except that an immediate close cuts short a graceful
    /// close in progress on another thread.
    pub fn close(&self, mode: CloseMode) -> Result<()> {
        match mode {
            CloseMode::Graceful => self.close_graceful(),
            CloseMode::Immediate => {
                self.close_immediate();
                Ok(())
            }
        }
    }

    fn close_graceful(&self) -> Result<()> {
        let shared = &self.shared;
        let mut fx = Effects::default();
        {
            let mut state = shared.state.lock();
            if state.phase == Phase::Open {
                state.phase = Phase::Closing;
                log::info!(
                    "closing gracefully with {} queued and {} running",
                    state.queue.len(),
                    state.running_tasks()
                );
                shared.dispatch(&mut state, &mut fx);
            }
        }
        shared.apply(fx);

        shared.terminated.wait();

        let (threads, watchdog) = {
            let mut state = shared.state.lock();
            (std::mem::take(&mut state.exited), state.watchdog.take())
        };
        if let Some(watchdog) = watchdog {
            let _ = watchdog.stop().join();
        }
        let joined = shared.join_all(threads);
        #[cfg(feature = "tracing")]
        crate::tracing::metrics::record_pool_close("graceful", 0);
        joined
    }

    fn close_immediate(&self) {
        let shared = &self.shared;
        let mut fx = Effects::default();
        let (threads, watchdog, abandoned) = {
            let mut state = shared.state.lock();
            if state.phase == Phase::Terminated {
                return;
            }
            state.phase = Phase::Terminated;

            let mut abandoned =
                shared.abandon_queue(&mut state, "abandoned by immediate close", &mut fx);
            let units = std::mem::take(&mut state.units);
            let mut threads = std::mem::take(&mut state.exited);
            for (id, mut slot) in units {
                if let Some(running) = slot.current.take() {
                    abandoned += 1;
                    if !running.timed_out {
                        let error = PoolError::pool_closed("abandoned by immediate close");
                        shared.settle(running, Err(error), &mut fx);
                    }
                }
                let _ = slot.commands.send(UnitCommand::Retire);
                shared.counters.record_unit_retired();
                if let Some(handle) = slot.thread.take() {
                    threads.push((id, handle));
                }
            }
            if let Some(running) = state.inline_current.take() {
                abandoned += 1;
                if !running.timed_out {
                    let error = PoolError::pool_closed("abandoned by immediate close");
                    shared.settle(running, Err(error), &mut fx);
                }
            }

            fx.cancel_all = true;
            fx.terminated = true;
            (threads, state.watchdog.take(), abandoned)
        };
        log::info!("closing immediately, abandoned {} tasks", abandoned);
        shared.apply(fx);

        if let Some(watchdog) = watchdog {
            let _ = watchdog.stop().join();
        }
        shared.join_with_timeout(threads, shared.config.shutdown_timeout);
        #[cfg(feature = "tracing")]
        crate::tracing::metrics::record_pool_close("immediate", abandoned);
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().phase != Phase::Open
    }

    /// Whether the pool has terminated and every outstanding task resolved
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.is_set()
    }

    /// Current target capacity
    pub fn capacity(&self) -> usize {
        self.shared.state.lock().capacity
    }

    /// Tasks waiting for a unit
    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Tasks currently running
    pub fn running_tasks(&self) -> usize {
        self.shared.state.lock().running_tasks()
    }

    /// Live units and their status, in unit order
    pub fn unit_statuses(&self) -> Vec<(UnitId, UnitStatus)> {
        self.shared
            .state
            .lock()
            .units
            .iter()
            .map(|(id, slot)| (*id, slot.status))
            .collect()
    }

    /// Status of one unit; units that no longer exist are `Terminated`
    pub fn unit_status(&self, id: UnitId) -> UnitStatus {
        self.shared
            .state
            .lock()
            .units
            .get(&id)
            .map_or(UnitStatus::Terminated, |slot| slot.status)
    }

    /// The configuration the pool was created with
    ///
    /// `capacity` here is the initial value; see [`capacity`](Self::capacity).
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Total tasks accepted so far
    pub fn tasks_submitted(&self) -> u64 {
        self.shared.counters.tasks_submitted()
    }

    /// Snapshot of pool statistics
    pub fn stats(&self) -> PoolStats {
        let mut stats = {
            let state = self.shared.state.lock();
            PoolStats {
                capacity: state.capacity,
                live_units: state.units.len(),
                idle_units: state
                    .units
                    .values()
                    .filter(|u| u.status == UnitStatus::Idle)
                    .count(),
                running_tasks: state.running_tasks(),
                queued_tasks: state.queue.len(),
                ..Default::default()
            }
        };
        self.shared.counters.fill(&mut stats);
        stats
    }

    /// Counters for one output format
    #[cfg(feature = "metrics")]
    pub fn format_stats(&self, format: ImageFormat) -> FormatStats {
        self.shared.counters.format_stats(format)
    }
}

impl Shared {
    /// Take `excess` units out of capacity: idle first, then starting, then busy
    fn shrink(&self, state: &mut PoolState, excess: usize) {
        let mut remaining = excess;
        for wanted in [UnitStatus::Idle, UnitStatus::Starting, UnitStatus::Busy] {
            let ids: Vec<UnitId> = state
                .units
                .iter()
                .rev()
                .filter(|(_, u)| u.status == wanted)
                .map(|(id, _)| *id)
                .take(remaining)
                .collect();
            for id in ids {
                remaining -= 1;
                if wanted == UnitStatus::Idle {
                    self.retire(state, id);
                } else if let Some(slot) = state.units.get_mut(&id) {
                    log::debug!("{} draining", id);
                    slot.status = UnitStatus::Draining;
                }
            }
            if remaining == 0 {
                break;
            }
        }
    }

    /// Put up to `room` draining units back into service
    fn revive(&self, state: &mut PoolState, room: usize) {
        let draining = state
            .units
            .values_mut()
            .filter(|u| u.status == UnitStatus::Draining)
            .take(room);
        for slot in draining {
            slot.status = if slot.current.is_some() {
                UnitStatus::Busy
            } else {
                UnitStatus::Starting
            };
        }
    }
}

impl fmt::Debug for TranscodePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TranscodePool")
            .field("capacity", &state.capacity)
            .field("phase", &state.phase)
            .field("units", &state.units.len())
            .field("queued", &state.queue.len())
            .field("codec", &self.shared.codec.name())
            .finish()
    }
}

impl Drop for TranscodePool {
    fn drop(&mut self) {
        if self.is_terminated() {
            return;
        }
        if let Err(e) = self.close(CloseMode::Graceful) {
            log::error!("error while closing pool on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CodecError, ConvertOutput, FnCodec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo() -> impl Codec {
        FnCodec::new(|input, options, _token| {
            Ok(ConvertOutput::new(input.to_vec(), options.format))
        })
    }

    fn png() -> ConvertOptions {
        ConvertOptions::new(ImageFormat::Png)
    }

    #[test]
    fn test_no_units_before_work() {
        let pool = TranscodePool::with_capacity(4, echo()).unwrap();
        assert!(pool.unit_statuses().is_empty());
        pool.set_capacity(5);
        pool.set_capacity(1);
        assert!(pool.unit_statuses().is_empty());
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn test_submit_and_wait() {
        let pool = TranscodePool::with_capacity(2, echo()).unwrap();
        let handle = pool.submit(vec![1, 2, 3], png()).unwrap();
        let output = handle.wait().unwrap();
        assert_eq!(output.data(), &[1, 2, 3]);
        assert_eq!(output.format, ImageFormat::Png);
        assert!(pool.unit_statuses().len() <= 1);
        pool.close(CloseMode::Graceful).unwrap();
        assert!(pool.is_terminated());
    }

    #[test]
    fn test_validation_rejects_without_task() {
        let pool = TranscodePool::with_capacity(1, echo()).unwrap();
        let err = pool.submit(vec![1], png().with_quality(150)).unwrap_err();
        assert!(matches!(err, PoolError::Validation { .. }));
        assert_eq!(pool.tasks_submitted(), 0);
        assert!(pool.unit_statuses().is_empty());
    }

    #[test]
    fn test_submit_after_close_is_rejected() {
        let pool = TranscodePool::with_capacity(1, echo()).unwrap();
        pool.close(CloseMode::Graceful).unwrap();
        let err = pool.submit(vec![1], png()).unwrap_err();
        assert!(matches!(err, PoolError::PoolClosed { .. }));
        assert!(pool.launch().is_err());
    }

    #[test]
    fn test_zero_capacity_stalls_until_raised() {
        let pool = TranscodePool::with_capacity(0, echo()).unwrap();
        let handle = pool.submit(vec![9], png()).unwrap();
        assert!(handle.wait_timeout(Duration::from_millis(50)).is_none());
        assert!(pool.unit_statuses().is_empty());
        assert_eq!(pool.queue_len(), 1);

        pool.set_capacity(1);
        assert_eq!(handle.wait().unwrap().data(), &[9]);
    }

    #[test]
    fn test_inline_policy_runs_on_submitter() {
        let config = PoolConfig::new(0).with_zero_capacity_policy(ZeroCapacityPolicy::Inline);
        let caller = thread::current().id();
        let codec = FnCodec::new(move |input: &[u8], options: &ConvertOptions, _: &CancellationToken| {
            assert_eq!(thread::current().id(), caller);
            Ok(ConvertOutput::new(input.to_vec(), options.format))
        });
        let pool = TranscodePool::new(config, codec).unwrap();
        let handle = pool.submit(vec![4, 2], png()).unwrap();
        assert!(handle.is_finished());
        assert_eq!(handle.wait().unwrap().data(), &[4, 2]);
        assert!(pool.unit_statuses().is_empty());
    }

    #[test]
    fn test_graceful_close_with_zero_capacity_abandons_queue() {
        let pool = TranscodePool::with_capacity(0, echo()).unwrap();
        let handles: Vec<_> = (0..3).map(|i| pool.submit(vec![i], png()).unwrap()).collect();
        pool.close(CloseMode::Graceful).unwrap();
        for handle in handles {
            assert!(matches!(handle.wait(), Err(PoolError::PoolClosed { .. })));
        }
        assert_eq!(pool.stats().tasks_abandoned, 3);
    }

    #[test]
    fn test_cancel_queued_task() {
        let pool = TranscodePool::with_capacity(0, echo()).unwrap();
        let first = pool.submit(vec![1], png()).unwrap();
        let second = pool.submit(vec![2], png()).unwrap();
        second.cancel();
        assert!(matches!(second.wait(), Err(PoolError::Cancelled { .. })));
        assert_eq!(pool.queue_len(), 1);

        pool.set_capacity(1);
        assert_eq!(first.wait().unwrap().data(), &[1]);
        assert_eq!(pool.stats().tasks_cancelled, 1);
    }

    #[test]
    fn test_warm_up_failure_fails_head_with_crash() {
        struct Broken;
        impl Codec for Broken {
            fn warm_up(&self) -> std::result::Result<(), CodecError> {
                Err(CodecError::new("missing encoder"))
            }
            fn convert(
                &self,
                _: &[u8],
                _: &ConvertOptions,
                _: &CancellationToken,
            ) -> std::result::Result<ConvertOutput, CodecError> {
                unreachable!("never warmed up")
            }
        }

        let pool = TranscodePool::with_capacity(1, Broken).unwrap();
        let handle = pool.submit(vec![1], png()).unwrap();
        let err = handle.wait().unwrap_err();
        assert!(matches!(err, PoolError::WorkerCrash { .. }));
        assert!(!pool.ready().is_ready());
    }

    #[test]
    fn test_crashed_unit_is_replaced() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let codec = FnCodec::new(move |input: &[u8], options: &ConvertOptions, _: &CancellationToken| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("corrupt frame");
            }
            Ok(ConvertOutput::new(input.to_vec(), options.format))
        });
        let pool = TranscodePool::with_capacity(1, codec).unwrap();

        let crashed = pool.submit(vec![1], png()).unwrap();
        match crashed.wait() {
            Err(PoolError::WorkerCrash { message, .. }) => assert_eq!(message, "corrupt frame"),
            other => panic!("expected crash, got {:?}", other),
        }

        let next = pool.submit(vec![2], png()).unwrap();
        assert_eq!(next.wait().unwrap().data(), &[2]);

        let stats = pool.stats();
        assert_eq!(stats.tasks_crashed, 1);
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.units_started, 2);
    }

    #[test]
    fn test_launched_pool_replaces_crashed_unit_eagerly() {
        let codec = FnCodec::new(|_input: &[u8], _options: &ConvertOptions, _: &CancellationToken| -> std::result::Result<ConvertOutput, CodecError> {
            panic!("segfault in encoder")
        });
        let pool = TranscodePool::with_capacity(1, codec).unwrap();
        pool.launch().unwrap();
        pool.ready().wait();

        let handle = pool.submit(vec![1], png()).unwrap();
        assert!(matches!(handle.wait(), Err(PoolError::WorkerCrash { .. })));

        // The replacement exists before any new work arrives
        assert_eq!(pool.unit_statuses().len(), 1);
        assert_eq!(pool.stats().units_started, 2);
    }

    #[test]
    fn test_deadline_resolves_timeout() {
        let codec = FnCodec::new(|input: &[u8], options: &ConvertOptions, _: &CancellationToken| {
            thread::sleep(Duration::from_millis(200));
            Ok(ConvertOutput::new(input.to_vec(), options.format))
        });
        let pool = TranscodePool::with_capacity(1, codec).unwrap();
        let handle = pool
            .submit_with_timeout(vec![1], png(), Duration::from_millis(30))
            .unwrap();
        let err = handle.wait().unwrap_err();
        assert_eq!(err, PoolError::timeout(handle.id().as_u64(), 30));
        // The unit stays busy until the codec returns
        assert_eq!(pool.running_tasks(), 1);
        pool.close(CloseMode::Graceful).unwrap();
        assert_eq!(pool.stats().tasks_timed_out, 1);
        assert_eq!(pool.stats().tasks_completed, 0);
    }

    #[test]
    fn test_unit_status_of_unknown_unit() {
        let pool = TranscodePool::with_capacity(1, echo()).unwrap();
        assert_eq!(pool.unit_status(UnitId(42)), UnitStatus::Terminated);
    }

    #[test]
    fn test_huge_timeout_runs_without_deadline() {
        let pool = TranscodePool::with_capacity(1, echo()).unwrap();
        let handle = pool
            .submit_with_timeout(vec![1, 2], png(), Duration::MAX)
            .unwrap();
        let output = handle
            .wait_timeout(Duration::from_secs(5))
            .expect("task never resolved");
        assert_eq!(output.unwrap().data(), &[1, 2]);

        // The unit survived and takes more work
        assert!(pool.submit(vec![3], png()).unwrap().wait().is_ok());
        assert_eq!(pool.stats().units_started, 1);
        pool.close(CloseMode::Graceful).unwrap();
    }

    #[test]
    fn test_huge_pool_timeout_runs_without_deadline() {
        let config = PoolConfig::new(1).with_task_timeout(Duration::MAX);
        let pool = TranscodePool::new(config, echo()).unwrap();
        let handle = pool.submit(vec![7], png()).unwrap();
        let output = handle
            .wait_timeout(Duration::from_secs(5))
            .expect("task never resolved");
        assert!(output.is_ok());
        pool.close(CloseMode::Graceful).unwrap();
    }

    #[test]
    fn test_warm_up_failure_spares_task_a_live_unit_can_take() {
        struct Flaky {
            warm_ups: AtomicUsize,
        }
        impl Codec for Flaky {
            fn warm_up(&self) -> std::result::Result<(), CodecError> {
                if self.warm_ups.fetch_add(1, Ordering::SeqCst) == 1 {
                    thread::sleep(Duration::from_millis(30));
                    return Err(CodecError::new("missing encoder"));
                }
                Ok(())
            }
            fn convert(
                &self,
                input: &[u8],
                options: &ConvertOptions,
                _: &CancellationToken,
            ) -> std::result::Result<ConvertOutput, CodecError> {
                thread::sleep(Duration::from_millis(100));
                Ok(ConvertOutput::new(input.to_vec(), options.format))
            }
        }

        let codec = Flaky {
            warm_ups: AtomicUsize::new(0),
        };
        let pool = TranscodePool::with_capacity(2, codec).unwrap();
        let first = pool.submit(vec![1], png()).unwrap();
        let second = pool.submit(vec![2], png()).unwrap();

        assert_eq!(first.wait().unwrap().data(), &[1]);
        assert_eq!(second.wait().unwrap().data(), &[2]);
        assert_eq!(pool.stats().tasks_crashed, 0);
        pool.close(CloseMode::Graceful).unwrap();
    }
}
