//! Sandboxed execution of user-submitted bot programs.
//!
//! Bots are WebAssembly modules (WAT text or binary). The sandbox enforces
//! the bot contract:
//!
//! - the only importable modules are `math` (sin, cos, tan, atan2, sqrt,
//!   pow, pi) and `sense` (the read-only sensor view); anything else is a
//!   security error at load time,
//! - every guest call runs under a hard wall-clock deadline via epoch
//!   interruption (a watchdog thread ticks the engine every millisecond),
//! - linear-memory growth past the configured limit is denied; a guest
//!   that traps after a denied growth is classified as a memory violation
//!   (best-effort, as growth denial alone is recoverable by the guest),
//! - guest traps that are neither deadline nor memory violations are bot
//!   logic errors: `on_tick` falls back to the all-false action set and
//!   callbacks are dropped silently.
//!
//! Guest ABI: the module must export a constructor function named after
//! the submitted class (`() -> ()`), plus `on_tick() -> i32` returning an
//! action bitmask, and optionally `on_collision(i32, f64, f64)`,
//! `on_checkpoint(i32, f64)` and `on_finish(f64, i32)`. A 256-slot f64
//! key-value memory persists across hooks for the duration of a race via
//! `sense.memory_load` / `sense.memory_store`.

use crate::bot_api::{hit_code, surface_code, BotActions, BotGameState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use wasmtime::{Caller, Config, Engine, Linker, Module, ResourceLimiter, Store, Trap, TypedFunc};

/// Milliseconds per engine epoch tick.
const EPOCH_TICK_MS: u64 = 1;

/// Slots in the per-bot key-value memory.
pub const BOT_MEMORY_SLOTS: usize = 256;

/// Modules a bot is allowed to import from.
const ALLOWED_IMPORTS: [&str; 2] = ["math", "sense"];

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("security violation: {0}")]
    Security(String),
    #[error("bot exceeded execution time limit")]
    Timeout,
    #[error("bot exceeded memory limit")]
    Memory,
    #[error("invalid bot: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub timeout_ms: u64,
    pub memory_limit_mb: usize,
    pub max_code_size_kb: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 10,
            memory_limit_mb: 50,
            max_code_size_kb: 100,
        }
    }
}

/// Denies linear-memory growth past the limit and remembers that it did.
#[derive(Debug)]
struct BotLimiter {
    max_memory_bytes: usize,
    limit_hit: bool,
}

impl ResourceLimiter for BotLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.max_memory_bytes {
            self.limit_hit = true;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= 100_000)
    }
}

/// Host-side state visible to the guest's `sense` imports.
struct StoreData {
    view: BotGameState,
    kv: Vec<f64>,
    limiter: BotLimiter,
}

/// Keeps the engine epoch advancing so deadlines fire.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !thread_stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(EPOCH_TICK_MS));
                engine.increment_epoch();
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct BotSandbox {
    engine: Engine,
    limits: SandboxLimits,
    _ticker: EpochTicker,
}

impl BotSandbox {
    pub fn new(limits: SandboxLimits) -> Result<Self, SandboxError> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config)
            .map_err(|e| SandboxError::Validation(format!("sandbox engine: {e}")))?;
        let ticker = EpochTicker::start(engine.clone());
        Ok(Self {
            engine,
            limits,
            _ticker: ticker,
        })
    }

    fn deadline_ticks(&self) -> u64 {
        (self.limits.timeout_ms / EPOCH_TICK_MS).max(1)
    }

    /// Compile, link, instantiate and construct a bot.
    pub fn load(&self, code: &str, class_name: &str) -> Result<BotInstance, SandboxError> {
        if code.len() > self.limits.max_code_size_kb * 1024 {
            return Err(SandboxError::Validation(format!(
                "bot code exceeds maximum size of {}KB",
                self.limits.max_code_size_kb
            )));
        }

        let module = Module::new(&self.engine, code.as_bytes())
            .map_err(|e| SandboxError::Validation(format!("bot code does not compile: {e}")))?;

        // Reject forbidden imports before anything runs.
        for import in module.imports() {
            if !ALLOWED_IMPORTS.contains(&import.module()) {
                return Err(SandboxError::Security(format!(
                    "import of module '{}' is not allowed",
                    import.module()
                )));
            }
        }

        let data = StoreData {
            view: BotGameState::default(),
            kv: vec![0.0; BOT_MEMORY_SLOTS],
            limiter: BotLimiter {
                max_memory_bytes: self.limits.memory_limit_mb * 1024 * 1024,
                limit_hit: false,
            },
        };

        let mut store = Store::new(&self.engine, data);
        store.limiter(|data| &mut data.limiter);

        let linker = build_linker(&self.engine)
            .map_err(|e| SandboxError::Validation(format!("sandbox linker: {e}")))?;

        // Instantiation runs the module's start section and data segments.
        store.set_epoch_deadline(self.deadline_ticks());
        let instance = match linker.instantiate(&mut store, &module) {
            Ok(instance) => instance,
            Err(e) => return Err(classify_load_error(&mut store, e)),
        };

        let constructor = instance
            .get_typed_func::<(), ()>(&mut store, class_name)
            .map_err(|_| {
                SandboxError::Validation(format!("bot class '{class_name}' not found in module"))
            })?;

        store.set_epoch_deadline(self.deadline_ticks());
        if let Err(e) = constructor.call(&mut store, ()) {
            return Err(classify_load_error(&mut store, e));
        }

        let on_tick = instance
            .get_typed_func::<(), i32>(&mut store, "on_tick")
            .map_err(|_| SandboxError::Validation("bot does not export on_tick".to_string()))?;
        let on_collision = instance
            .get_typed_func::<(i32, f64, f64), ()>(&mut store, "on_collision")
            .ok();
        let on_checkpoint = instance
            .get_typed_func::<(i32, f64), ()>(&mut store, "on_checkpoint")
            .ok();
        let on_finish = instance
            .get_typed_func::<(f64, i32), ()>(&mut store, "on_finish")
            .ok();

        Ok(BotInstance {
            store,
            on_tick,
            on_collision,
            on_checkpoint,
            on_finish,
            deadline_ticks: self.deadline_ticks(),
        })
    }
}

/// A loaded, constructed bot. Owns the wasm store; all calls are
/// synchronous and bounded by the sandbox deadline.
pub struct BotInstance {
    store: Store<StoreData>,
    on_tick: TypedFunc<(), i32>,
    on_collision: Option<TypedFunc<(i32, f64, f64), ()>>,
    on_checkpoint: Option<TypedFunc<(i32, f64), ()>>,
    on_finish: Option<TypedFunc<(f64, i32), ()>>,
    deadline_ticks: u64,
}

impl std::fmt::Debug for BotInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotInstance")
            .field("deadline_ticks", &self.deadline_ticks)
            .finish_non_exhaustive()
    }
}

impl BotInstance {
    /// Run the bot's per-tick decision against the given sensor view.
    ///
    /// Logic errors inside the bot produce the safe all-false default;
    /// deadline and memory violations propagate.
    pub fn call_on_tick(&mut self, view: BotGameState) -> Result<BotActions, SandboxError> {
        self.store.data_mut().view = view;
        self.store.set_epoch_deadline(self.deadline_ticks);

        match self.on_tick.call(&mut self.store, ()) {
            Ok(bits) => Ok(BotActions::from_bits(bits)),
            Err(e) => match classify_call_error(&mut self.store, e) {
                CallFailure::Fatal(err) => Err(err),
                CallFailure::Logic => Ok(BotActions::default()),
            },
        }
    }

    pub fn call_on_collision(
        &mut self,
        kind: i32,
        impact_speed: f64,
        direction: f64,
    ) -> Result<(), SandboxError> {
        let Some(ref hook) = self.on_collision else {
            return Ok(());
        };
        self.store.set_epoch_deadline(self.deadline_ticks);
        match hook.call(&mut self.store, (kind, impact_speed, direction)) {
            Ok(()) => Ok(()),
            Err(e) => match classify_call_error(&mut self.store, e) {
                CallFailure::Fatal(err) => Err(err),
                CallFailure::Logic => Ok(()),
            },
        }
    }

    pub fn call_on_checkpoint(
        &mut self,
        checkpoint_index: i32,
        split_time: f64,
    ) -> Result<(), SandboxError> {
        let Some(ref hook) = self.on_checkpoint else {
            return Ok(());
        };
        self.store.set_epoch_deadline(self.deadline_ticks);
        match hook.call(&mut self.store, (checkpoint_index, split_time)) {
            Ok(()) => Ok(()),
            Err(e) => match classify_call_error(&mut self.store, e) {
                CallFailure::Fatal(err) => Err(err),
                CallFailure::Logic => Ok(()),
            },
        }
    }

    pub fn call_on_finish(
        &mut self,
        finish_time: f64,
        final_position: i32,
    ) -> Result<(), SandboxError> {
        let Some(ref hook) = self.on_finish else {
            return Ok(());
        };
        self.store.set_epoch_deadline(self.deadline_ticks);
        match hook.call(&mut self.store, (finish_time, final_position)) {
            Ok(()) => Ok(()),
            Err(e) => match classify_call_error(&mut self.store, e) {
                CallFailure::Fatal(err) => Err(err),
                CallFailure::Logic => Ok(()),
            },
        }
    }
}

enum CallFailure {
    /// Deadline or memory violation; the bot must be disqualified.
    Fatal(SandboxError),
    /// Plain bot bug (unreachable, division by zero, bad index).
    Logic,
}

fn classify_call_error(store: &mut Store<StoreData>, error: wasmtime::Error) -> CallFailure {
    if store.data().limiter.limit_hit {
        return CallFailure::Fatal(SandboxError::Memory);
    }
    match error.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => CallFailure::Fatal(SandboxError::Timeout),
        Some(_) => CallFailure::Logic,
        // Host-side failures should not happen; treat as a logic error so a
        // single bot cannot take the session down.
        None => CallFailure::Logic,
    }
}

/// During load every failure is fatal; map it to the right kind.
fn classify_load_error(store: &mut Store<StoreData>, error: wasmtime::Error) -> SandboxError {
    if store.data().limiter.limit_hit {
        return SandboxError::Memory;
    }
    match error.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => SandboxError::Timeout,
        Some(trap) => SandboxError::Security(format!("bot initialization failed: {trap}")),
        None => SandboxError::Security(format!("bot failed to link: {error}")),
    }
}

fn build_linker(engine: &Engine) -> wasmtime::Result<Linker<StoreData>> {
    let mut linker: Linker<StoreData> = Linker::new(engine);

    // The mathematics allow-list.
    linker.func_wrap("math", "sin", |x: f64| x.sin())?;
    linker.func_wrap("math", "cos", |x: f64| x.cos())?;
    linker.func_wrap("math", "tan", |x: f64| x.tan())?;
    linker.func_wrap("math", "atan2", |y: f64, x: f64| y.atan2(x))?;
    linker.func_wrap("math", "sqrt", |x: f64| x.sqrt())?;
    linker.func_wrap("math", "pow", |x: f64, y: f64| x.powf(y))?;
    linker.func_wrap("math", "pi", || std::f64::consts::PI)?;

    // Own car.
    linker.func_wrap("sense", "self_x", |c: Caller<'_, StoreData>| {
        c.data().view.car.position.x
    })?;
    linker.func_wrap("sense", "self_y", |c: Caller<'_, StoreData>| {
        c.data().view.car.position.y
    })?;
    linker.func_wrap("sense", "heading", |c: Caller<'_, StoreData>| {
        c.data().view.car.heading
    })?;
    linker.func_wrap("sense", "speed", |c: Caller<'_, StoreData>| {
        c.data().view.car.speed
    })?;
    linker.func_wrap("sense", "vel_x", |c: Caller<'_, StoreData>| {
        c.data().view.car.velocity.x
    })?;
    linker.func_wrap("sense", "vel_y", |c: Caller<'_, StoreData>| {
        c.data().view.car.velocity.y
    })?;
    linker.func_wrap("sense", "angular_velocity", |c: Caller<'_, StoreData>| {
        c.data().view.car.angular_velocity
    })?;
    linker.func_wrap("sense", "nitro_charges", |c: Caller<'_, StoreData>| {
        c.data().view.car.nitro_charges as i32
    })?;
    linker.func_wrap("sense", "nitro_active", |c: Caller<'_, StoreData>| {
        c.data().view.car.nitro_active as i32
    })?;
    linker.func_wrap("sense", "surface", |c: Caller<'_, StoreData>| {
        surface_code(c.data().view.car.current_surface)
    })?;
    linker.func_wrap("sense", "off_track", |c: Caller<'_, StoreData>| {
        c.data().view.car.off_track as i32
    })?;

    // Vision rays.
    linker.func_wrap("sense", "ray_distance", |c: Caller<'_, StoreData>, i: i32| {
        c.data()
            .view
            .rays
            .get(i as usize)
            .map(|r| r.distance)
            .unwrap_or(0.0)
    })?;
    linker.func_wrap("sense", "ray_hit", |c: Caller<'_, StoreData>, i: i32| {
        c.data()
            .view
            .rays
            .get(i as usize)
            .map(|r| hit_code(r.hit_kind))
            .unwrap_or(0)
    })?;

    // Track.
    linker.func_wrap("sense", "checkpoint_count", |c: Caller<'_, StoreData>| {
        c.data().view.track.checkpoints.len() as i32
    })?;
    linker.func_wrap("sense", "checkpoint_x", |c: Caller<'_, StoreData>, i: i32| {
        c.data()
            .view
            .track
            .checkpoints
            .get(i as usize)
            .map(|p| p.x)
            .unwrap_or(0.0)
    })?;
    linker.func_wrap("sense", "checkpoint_y", |c: Caller<'_, StoreData>, i: i32| {
        c.data()
            .view
            .track
            .checkpoints
            .get(i as usize)
            .map(|p| p.y)
            .unwrap_or(0.0)
    })?;
    linker.func_wrap("sense", "next_checkpoint", |c: Caller<'_, StoreData>| {
        c.data().view.track.next_checkpoint as i32
    })?;

    // Race progress.
    linker.func_wrap("sense", "race_position", |c: Caller<'_, StoreData>| {
        c.data().view.race.position as i32
    })?;
    linker.func_wrap("sense", "total_cars", |c: Caller<'_, StoreData>| {
        c.data().view.race.total_cars as i32
    })?;
    linker.func_wrap("sense", "total_checkpoints", |c: Caller<'_, StoreData>| {
        c.data().view.race.total_checkpoints as i32
    })?;
    linker.func_wrap("sense", "elapsed_time", |c: Caller<'_, StoreData>| {
        c.data().view.race.elapsed_time
    })?;
    linker.func_wrap("sense", "distance_to_finish", |c: Caller<'_, StoreData>| {
        c.data().view.race.distance_to_finish
    })?;

    // Opponents under fog of war.
    linker.func_wrap("sense", "opponent_count", |c: Caller<'_, StoreData>| {
        c.data().view.opponents.len() as i32
    })?;
    linker.func_wrap("sense", "opponent_x", |c: Caller<'_, StoreData>, i: i32| {
        c.data()
            .view
            .opponents
            .get(i as usize)
            .map(|o| o.position.x)
            .unwrap_or(0.0)
    })?;
    linker.func_wrap("sense", "opponent_y", |c: Caller<'_, StoreData>, i: i32| {
        c.data()
            .view
            .opponents
            .get(i as usize)
            .map(|o| o.position.y)
            .unwrap_or(0.0)
    })?;
    linker.func_wrap("sense", "opponent_vx", |c: Caller<'_, StoreData>, i: i32| {
        c.data()
            .view
            .opponents
            .get(i as usize)
            .map(|o| o.velocity.x)
            .unwrap_or(0.0)
    })?;
    linker.func_wrap("sense", "opponent_vy", |c: Caller<'_, StoreData>, i: i32| {
        c.data()
            .view
            .opponents
            .get(i as usize)
            .map(|o| o.velocity.y)
            .unwrap_or(0.0)
    })?;
    linker.func_wrap(
        "sense",
        "opponent_heading",
        |c: Caller<'_, StoreData>, i: i32| {
            c.data()
                .view
                .opponents
                .get(i as usize)
                .map(|o| o.heading)
                .unwrap_or(0.0)
        },
    )?;
    linker.func_wrap(
        "sense",
        "opponent_distance",
        |c: Caller<'_, StoreData>, i: i32| {
            c.data()
                .view
                .opponents
                .get(i as usize)
                .map(|o| o.distance)
                .unwrap_or(0.0)
        },
    )?;
    linker.func_wrap(
        "sense",
        "opponent_angle",
        |c: Caller<'_, StoreData>, i: i32| {
            c.data()
                .view
                .opponents
                .get(i as usize)
                .map(|o| o.relative_angle)
                .unwrap_or(0.0)
        },
    )?;

    // Per-race key-value memory.
    linker.func_wrap("sense", "memory_load", |c: Caller<'_, StoreData>, slot: i32| {
        c.data().kv.get(slot as usize).copied().unwrap_or(0.0)
    })?;
    linker.func_wrap(
        "sense",
        "memory_store",
        |mut c: Caller<'_, StoreData>, slot: i32, value: f64| {
            if let Some(cell) = c.data_mut().kv.get_mut(slot as usize) {
                *cell = value;
            }
        },
    )?;

    Ok(linker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot_api::{BotCarState, BotRaceState};
    use crate::physics::Vec2;

    fn sandbox() -> BotSandbox {
        BotSandbox::new(SandboxLimits {
            timeout_ms: 20,
            memory_limit_mb: 4,
            max_code_size_kb: 100,
        })
        .unwrap()
    }

    const SIMPLE_BOT: &str = r#"
        (module
          (func (export "Racer"))
          (func (export "on_tick") (result i32)
            i32.const 1))
    "#;

    #[test]
    fn test_load_and_tick_simple_bot() {
        let sandbox = sandbox();
        let mut bot = sandbox.load(SIMPLE_BOT, "Racer").unwrap();
        let actions = bot.call_on_tick(BotGameState::default()).unwrap();
        assert!(actions.accelerate);
        assert!(!actions.brake);
    }

    #[test]
    fn test_bot_reads_sensor_view() {
        let sandbox = sandbox();
        // Accelerate only when speed is below 100.
        let code = r#"
            (module
              (import "sense" "speed" (func $speed (result f64)))
              (func (export "Racer"))
              (func (export "on_tick") (result i32)
                (if (result i32) (f64.lt (call $speed) (f64.const 100))
                  (then (i32.const 1))
                  (else (i32.const 2)))))
        "#;
        let mut bot = sandbox.load(code, "Racer").unwrap();

        let mut view = BotGameState::default();
        view.car = BotCarState {
            speed: 50.0,
            ..Default::default()
        };
        assert!(bot.call_on_tick(view).unwrap().accelerate);

        let mut view = BotGameState::default();
        view.car = BotCarState {
            speed: 120.0,
            ..Default::default()
        };
        assert!(bot.call_on_tick(view).unwrap().brake);
    }

    #[test]
    fn test_math_imports_allowed() {
        let sandbox = sandbox();
        let code = r#"
            (module
              (import "math" "sqrt" (func $sqrt (param f64) (result f64)))
              (import "math" "atan2" (func $atan2 (param f64 f64) (result f64)))
              (func (export "Racer"))
              (func (export "on_tick") (result i32)
                (drop (call $sqrt (f64.const 2)))
                (drop (call $atan2 (f64.const 1) (f64.const 1)))
                i32.const 0))
        "#;
        let mut bot = sandbox.load(code, "Racer").unwrap();
        assert_eq!(bot.call_on_tick(BotGameState::default()).unwrap(), BotActions::default());
    }

    #[test]
    fn test_forbidden_import_rejected() {
        let sandbox = sandbox();
        let code = r#"
            (module
              (import "env" "exfiltrate" (func $bad))
              (func (export "Racer"))
              (func (export "on_tick") (result i32) i32.const 0))
        "#;
        match sandbox.load(code, "Racer") {
            Err(SandboxError::Security(msg)) => assert!(msg.contains("env")),
            other => panic!("expected security error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_class_is_validation_error() {
        let sandbox = sandbox();
        match sandbox.load(SIMPLE_BOT, "NoSuchBot") {
            Err(SandboxError::Validation(msg)) => assert!(msg.contains("NoSuchBot")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_code_is_validation_error() {
        let sandbox = sandbox();
        assert!(matches!(
            sandbox.load("import os", "Racer"),
            Err(SandboxError::Validation(_))
        ));
    }

    #[test]
    fn test_oversized_code_rejected() {
        let sandbox = BotSandbox::new(SandboxLimits {
            timeout_ms: 20,
            memory_limit_mb: 4,
            max_code_size_kb: 1,
        })
        .unwrap();
        let padded = format!("{SIMPLE_BOT}{}", ";;".repeat(2000));
        assert!(matches!(
            sandbox.load(&padded, "Racer"),
            Err(SandboxError::Validation(_))
        ));
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let sandbox = sandbox();
        let code = r#"
            (module
              (func (export "Racer"))
              (func (export "on_tick") (result i32)
                (loop $spin (br $spin))
                i32.const 0))
        "#;
        let mut bot = sandbox.load(code, "Racer").unwrap();
        assert!(matches!(
            bot.call_on_tick(BotGameState::default()),
            Err(SandboxError::Timeout)
        ));
    }

    #[test]
    fn test_infinite_constructor_times_out() {
        let sandbox = sandbox();
        let code = r#"
            (module
              (func (export "Racer")
                (loop $spin (br $spin)))
              (func (export "on_tick") (result i32) i32.const 0))
        "#;
        assert!(matches!(
            sandbox.load(code, "Racer"),
            Err(SandboxError::Timeout)
        ));
    }

    #[test]
    fn test_memory_hog_hits_memory_limit() {
        let sandbox = sandbox();
        // Grow until denied, then trap.
        let code = r#"
            (module
              (memory 1)
              (func (export "Racer"))
              (func (export "on_tick") (result i32)
                (loop $grow
                  (if (i32.ne (memory.grow (i32.const 16)) (i32.const -1))
                    (then (br $grow))))
                unreachable))
        "#;
        let mut bot = sandbox.load(code, "Racer").unwrap();
        assert!(matches!(
            bot.call_on_tick(BotGameState::default()),
            Err(SandboxError::Memory)
        ));
    }

    #[test]
    fn test_logic_trap_returns_safe_default() {
        let sandbox = sandbox();
        let code = r#"
            (module
              (func (export "Racer"))
              (func (export "on_tick") (result i32)
                unreachable))
        "#;
        let mut bot = sandbox.load(code, "Racer").unwrap();
        let actions = bot.call_on_tick(BotGameState::default()).unwrap();
        assert_eq!(actions, BotActions::default());
    }

    #[test]
    fn test_callback_logic_trap_is_silent() {
        let sandbox = sandbox();
        let code = r#"
            (module
              (func (export "Racer"))
              (func (export "on_tick") (result i32) i32.const 0)
              (func (export "on_checkpoint") (param i32 f64)
                unreachable))
        "#;
        let mut bot = sandbox.load(code, "Racer").unwrap();
        assert!(bot.call_on_checkpoint(0, 12.5).is_ok());
    }

    #[test]
    fn test_missing_callbacks_are_noops() {
        let sandbox = sandbox();
        let mut bot = sandbox.load(SIMPLE_BOT, "Racer").unwrap();
        assert!(bot.call_on_collision(0, 25.0, 0.4).is_ok());
        assert!(bot.call_on_checkpoint(1, 5.0).is_ok());
        assert!(bot.call_on_finish(61.2, 1).is_ok());
    }

    #[test]
    fn test_kv_memory_persists_across_calls() {
        let sandbox = sandbox();
        let code = r#"
            (module
              (import "sense" "memory_load" (func $load (param i32) (result f64)))
              (import "sense" "memory_store" (func $store (param i32 f64)))
              (func (export "Racer"))
              (func (export "on_tick") (result i32)
                (call $store (i32.const 0)
                  (f64.add (call $load (i32.const 0)) (f64.const 1)))
                (i32.trunc_f64_s (call $load (i32.const 0)))))
        "#;
        let mut bot = sandbox.load(code, "Racer").unwrap();
        // First call stores 1 (accelerate bit), second 2 (brake bit).
        assert!(bot.call_on_tick(BotGameState::default()).unwrap().accelerate);
        assert!(bot.call_on_tick(BotGameState::default()).unwrap().brake);
    }

    #[test]
    fn test_race_view_reaches_guest() {
        let sandbox = sandbox();
        let code = r#"
            (module
              (import "sense" "race_position" (func $pos (result i32)))
              (func (export "Racer"))
              (func (export "on_tick") (result i32)
                (call $pos)))
        "#;
        let mut bot = sandbox.load(code, "Racer").unwrap();
        let mut view = BotGameState::default();
        view.race = BotRaceState {
            position: 2,
            ..Default::default()
        };
        // Position 2 decodes as the brake bit.
        assert!(bot.call_on_tick(view).unwrap().brake);
    }

    #[test]
    fn test_opponent_view_indexing() {
        let sandbox = sandbox();
        let code = r#"
            (module
              (import "sense" "opponent_count" (func $count (result i32)))
              (func (export "Racer"))
              (func (export "on_tick") (result i32)
                (call $count)))
        "#;
        let mut bot = sandbox.load(code, "Racer").unwrap();
        let mut view = BotGameState::default();
        view.opponents.push(crate::bot_api::BotOpponent {
            position: Vec2::new(100.0, 0.0),
            velocity: Vec2::ZERO,
            heading: 0.0,
            distance: 100.0,
            relative_angle: 0.0,
        });
        assert!(bot.call_on_tick(view).unwrap().accelerate);
    }
}
