//! Engine — owns the arena, the scope stack, and the tape.
//!
//! An `Engine` is an explicit context value; there is no global singleton.
//! Tensors hold an `Arc<Engine>` back to the engine that owns their
//! storage, so the engine outlives every handle into it.
//!
//! Scope discipline: every tensor created while a scope is open is tracked
//! by the innermost scope. Closing a scope frees everything it tracked
//! except a designated escaping result, which bubbles out to the enclosing
//! scope. [`Engine::tidy`] packages that pattern with cleanup on the error
//! path too.

use std::sync::{Arc, Mutex, MutexGuard};

use rand::distributions::{Distribution, Uniform};
use rand_distr::StandardNormal;
use tracing::debug;

use crate::arena::{Arena, TensorId};
use crate::tape::{Tape, TapeNode};
use crate::tensor::Tensor;
use crate::types::{DType, Shape};
use crate::{Result, TangramError};

pub(crate) struct Scope {
    pub(crate) id: u64,
    pub(crate) name: Option<String>,
    pub(crate) tracked: Vec<TensorId>,
}

pub(crate) struct EngineState {
    pub(crate) arena: Arena,
    pub(crate) scopes: Vec<Scope>,
    pub(crate) next_scope_id: u64,
    pub(crate) recording: bool,
    pub(crate) tape: Tape,
}

/// Eager tensor engine.
pub struct Engine {
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EngineState {
                arena: Arena::new(),
                scopes: Vec::new(),
                next_scope_id: 0,
                recording: false,
                tape: Tape::new(),
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    // ── Constructors ────────────────────────────────────────────────────

    /// Create an f32 tensor from data.
    pub fn tensor(self: &Arc<Self>, data: &[f32], dims: &[i64]) -> Result<Tensor> {
        let shape = Shape::new(dims.to_vec());
        check_len(data.len(), &shape)?;
        self.create_f32(data.to_vec(), shape)
    }

    /// Create an i32 tensor from data.
    pub fn tensor_i32(self: &Arc<Self>, data: &[i32], dims: &[i64]) -> Result<Tensor> {
        let shape = Shape::new(dims.to_vec());
        check_len(data.len(), &shape)?;
        self.create_i32(data.to_vec(), shape)
    }

    /// Create an i8 or u8 tensor from raw bytes.
    pub fn tensor_bytes(self: &Arc<Self>, data: &[u8], dims: &[i64], dtype: DType) -> Result<Tensor> {
        if dtype.size_bytes() != 1 {
            return Err(TangramError::InvalidArgument(format!(
                "tensor_bytes expects a 1-byte dtype, got {dtype}"
            )));
        }
        let shape = Shape::new(dims.to_vec());
        check_len(data.len(), &shape)?;
        self.create_raw(data.to_vec(), shape, dtype)
    }

    /// Create a zero-filled tensor.
    pub fn zeros(self: &Arc<Self>, dims: &[i64], dtype: DType) -> Result<Tensor> {
        let shape = Shape::new(dims.to_vec());
        let numel = shape.numel() as usize;
        let bytes = vec![0u8; numel * dtype.size_bytes()];
        self.create_raw(bytes, shape, dtype)
    }

    /// Create a tensor filled with ones.
    pub fn ones(self: &Arc<Self>, dims: &[i64], dtype: DType) -> Result<Tensor> {
        let shape = Shape::new(dims.to_vec());
        let numel = shape.numel() as usize;
        match dtype {
            DType::F32 => self.create_f32(vec![1.0; numel], shape),
            DType::I32 => self.create_i32(vec![1; numel], shape),
            DType::I8 | DType::U8 => self.create_raw(vec![1u8; numel], shape, dtype),
        }
    }

    /// Create an f32 tensor filled with `value`.
    pub fn full(self: &Arc<Self>, dims: &[i64], value: f32) -> Result<Tensor> {
        let shape = Shape::new(dims.to_vec());
        let numel = shape.numel() as usize;
        self.create_f32(vec![value; numel], shape)
    }

    /// A `[1]`-shaped f32 tensor.
    pub fn scalar(self: &Arc<Self>, value: f32) -> Result<Tensor> {
        self.create_f32(vec![value], Shape::scalar())
    }

    /// A `[1]`-shaped i32 tensor.
    pub fn scalar_i32(self: &Arc<Self>, value: i32) -> Result<Tensor> {
        self.create_i32(vec![value], Shape::scalar())
    }

    /// Uniform random f32 tensor in `[lo, hi)`.
    pub fn rand(self: &Arc<Self>, dims: &[i64], lo: f32, hi: f32) -> Result<Tensor> {
        if !(lo < hi) {
            return Err(TangramError::InvalidArgument(format!(
                "rand bounds must satisfy lo < hi, got [{lo}, {hi})"
            )));
        }
        let shape = Shape::new(dims.to_vec());
        let numel = shape.numel() as usize;
        let mut rng = rand::thread_rng();
        let dist = Uniform::new(lo, hi);
        let data: Vec<f32> = (0..numel).map(|_| dist.sample(&mut rng)).collect();
        self.create_f32(data, shape)
    }

    /// Normally distributed random f32 tensor.
    pub fn randn(self: &Arc<Self>, dims: &[i64], mean: f32, std: f32) -> Result<Tensor> {
        let shape = Shape::new(dims.to_vec());
        let numel = shape.numel() as usize;
        let mut rng = rand::thread_rng();
        let data: Vec<f32> = (0..numel)
            .map(|_| {
                let z: f32 = StandardNormal.sample(&mut rng);
                mean + std * z
            })
            .collect();
        self.create_f32(data, shape)
    }

    /// 1-D f32 tensor of evenly spaced values in `[start, stop)`.
    pub fn arange(self: &Arc<Self>, start: f32, stop: f32, step: f32) -> Result<Tensor> {
        if step <= 0.0 {
            return Err(TangramError::InvalidArgument(format!(
                "arange step must be positive, got {step}"
            )));
        }
        let n = ((stop - start) / step).ceil().max(0.0) as usize;
        let data: Vec<f32> = (0..n).map(|i| start + i as f32 * step).collect();
        let shape = Shape::new(vec![n as i64]);
        self.create_f32(data, shape)
    }

    // ── Raw creation (alloc + scope tracking) ───────────────────────────

    pub(crate) fn create_f32(self: &Arc<Self>, data: Vec<f32>, shape: Shape) -> Result<Tensor> {
        let mut state = self.lock();
        let id = state.arena.alloc(data.len(), DType::F32);
        state.arena.write_f32(id, &data)?;
        track(&mut state, id)?;
        drop(state);
        Ok(Tensor::from_raw(id, shape, DType::F32, Arc::clone(self)))
    }

    pub(crate) fn create_i32(self: &Arc<Self>, data: Vec<i32>, shape: Shape) -> Result<Tensor> {
        let mut state = self.lock();
        let id = state.arena.alloc(data.len(), DType::I32);
        state.arena.write_i32(id, &data)?;
        track(&mut state, id)?;
        drop(state);
        Ok(Tensor::from_raw(id, shape, DType::I32, Arc::clone(self)))
    }

    pub(crate) fn create_raw(
        self: &Arc<Self>,
        bytes: Vec<u8>,
        shape: Shape,
        dtype: DType,
    ) -> Result<Tensor> {
        let mut state = self.lock();
        let id = state.arena.alloc(bytes.len() / dtype.size_bytes(), dtype);
        state.arena.bytes_mut(id)?.copy_from_slice(&bytes);
        track(&mut state, id)?;
        drop(state);
        Ok(Tensor::from_raw(id, shape, dtype, Arc::clone(self)))
    }

    // ── Scopes ──────────────────────────────────────────────────────────

    /// Open a scope: tensors created until the matching `end_scope` are
    /// tracked and freed when it closes.
    pub fn start_scope(&self, name: Option<&str>) {
        let mut state = self.lock();
        let id = state.next_scope_id;
        state.next_scope_id += 1;
        debug!(scope = id, name = name.unwrap_or(""), "start scope");
        state.scopes.push(Scope {
            id,
            name: name.map(String::from),
            tracked: Vec::new(),
        });
    }

    /// Close the innermost scope, freeing everything it tracked except
    /// `result`. A result tracked by the closing scope is re-tracked one
    /// level up, or becomes untracked at the top level.
    pub fn end_scope(&self, result: Option<&Tensor>) {
        let mut state = self.lock();
        let Some(scope) = state.scopes.pop() else {
            debug!("end scope called with no open scope");
            return;
        };
        let result_id = result.map(|t| t.id());

        let mut freed = 0usize;
        for id in scope.tracked {
            if Some(id) == result_id {
                continue;
            }
            if state.arena.free_if_live(id) {
                freed += 1;
            }
        }
        debug!(scope = scope.id, name = scope.name.as_deref().unwrap_or(""), freed, "end scope");

        // Bubble the escaping result outward.
        if let Some(id) = result_id {
            if state.arena.scope_of(id).ok().flatten() == Some(scope.id) {
                match state.scopes.last_mut() {
                    Some(parent) => {
                        let parent_id = parent.id;
                        parent.tracked.push(id);
                        let _ = state.arena.set_scope(id, Some(parent_id));
                    }
                    None => {
                        let _ = state.arena.set_scope(id, None);
                    }
                }
            }
        }
    }

    /// Run `f` inside a fresh scope; the returned tensor escapes, every
    /// other tensor created inside is freed. Cleans up on error as well.
    pub fn tidy<F>(&self, name: Option<&str>, f: F) -> Result<Tensor>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        self.start_scope(name);
        match f() {
            Ok(result) => {
                self.end_scope(Some(&result));
                Ok(result)
            }
            Err(e) => {
                self.end_scope(None);
                Err(e)
            }
        }
    }

    /// `tidy` without an escaping result.
    pub fn scoped<F>(&self, name: Option<&str>, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        self.start_scope(name);
        let out = f();
        self.end_scope(None);
        out
    }

    /// Remove `t` from scope tracking entirely; it now lives until
    /// explicitly disposed.
    pub fn keep(&self, t: &Tensor) -> Result<()> {
        let mut state = self.lock();
        let id = t.id();
        if let Some(scope_id) = state.arena.scope_of(id)? {
            if let Some(scope) = state.scopes.iter_mut().find(|s| s.id == scope_id) {
                scope.tracked.retain(|&tid| tid != id);
            }
            state.arena.set_scope(id, None)?;
        }
        Ok(())
    }

    /// Free `t` immediately. Erroring on an already-dead handle catches
    /// double-dispose.
    pub fn dispose(&self, t: &Tensor) -> Result<()> {
        self.lock().arena.free(t.id())
    }

    // ── Recording ───────────────────────────────────────────────────────

    /// Begin recording ops onto a fresh tape.
    pub fn start_recording(&self) {
        let mut state = self.lock();
        state.recording = true;
        state.tape = Tape::new();
    }

    /// Stop recording and take the tape.
    pub fn stop_recording(&self) -> Tape {
        let mut state = self.lock();
        state.recording = false;
        std::mem::take(&mut state.tape)
    }

    pub fn is_recording(&self) -> bool {
        self.lock().recording
    }

    pub(crate) fn record(&self, node: TapeNode) {
        let mut state = self.lock();
        if state.recording {
            state.tape.push(node);
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Number of live tensors in the arena.
    pub fn live_tensors(&self) -> usize {
        self.lock().arena.live_count()
    }

    /// Bytes currently reserved by live tensors.
    pub fn bytes_in_use(&self) -> usize {
        self.lock().arena.bytes_in_use()
    }

    /// Depth of the scope stack.
    pub fn scope_depth(&self) -> usize {
        self.lock().scopes.len()
    }
}

fn track(state: &mut EngineState, id: TensorId) -> Result<()> {
    if let Some(scope) = state.scopes.last_mut() {
        let scope_id = scope.id;
        scope.tracked.push(id);
        state.arena.set_scope(id, Some(scope_id))?;
    }
    Ok(())
}

fn check_len(len: usize, shape: &Shape) -> Result<()> {
    let expected = shape.numel() as usize;
    if len != expected {
        return Err(TangramError::InvalidArgument(format!(
            "data length {len} does not match shape {shape} (expected {expected})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_roundtrip() {
        let engine = Engine::new();
        let t = engine.tensor(&[1.0, 2.0, 3.0], &[3]).unwrap();
        assert_eq!(t.to_vec_f32().unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(t.shape(), &Shape::new(vec![3]));
        assert_eq!(t.dtype(), DType::F32);
    }

    #[test]
    fn test_tensor_length_mismatch() {
        let engine = Engine::new();
        assert!(engine.tensor(&[1.0, 2.0], &[3]).is_err());
    }

    #[test]
    fn test_zeros_ones_full() {
        let engine = Engine::new();
        let z = engine.zeros(&[2, 2], DType::F32).unwrap();
        assert_eq!(z.to_vec_f32().unwrap(), vec![0.0; 4]);
        let o = engine.ones(&[3], DType::I32).unwrap();
        assert_eq!(o.to_vec_i32().unwrap(), vec![1, 1, 1]);
        let f = engine.full(&[2], 7.5).unwrap();
        assert_eq!(f.to_vec_f32().unwrap(), vec![7.5, 7.5]);
    }

    #[test]
    fn test_rand_bounds() {
        let engine = Engine::new();
        let t = engine.rand(&[100], -1.0, 1.0).unwrap();
        for v in t.to_vec_f32().unwrap() {
            assert!((-1.0..1.0).contains(&v));
        }
        assert!(engine.rand(&[2], 1.0, 1.0).is_err());
    }

    #[test]
    fn test_arange() {
        let engine = Engine::new();
        let t = engine.arange(0.0, 5.0, 1.0).unwrap();
        assert_eq!(t.to_vec_f32().unwrap(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(t.shape(), &Shape::new(vec![5]));
    }

    #[test]
    fn test_scope_frees_intermediates() {
        let engine = Engine::new();
        engine.start_scope(Some("work"));
        let a = engine.tensor(&[1.0], &[1]).unwrap();
        let b = engine.tensor(&[2.0], &[1]).unwrap();
        assert_eq!(engine.live_tensors(), 2);
        engine.end_scope(None);
        assert_eq!(engine.live_tensors(), 0);
        assert!(a.to_vec_f32().is_err());
        assert!(b.to_vec_f32().is_err());
    }

    #[test]
    fn test_scope_result_escapes_and_retracks() {
        let engine = Engine::new();
        engine.start_scope(Some("outer"));
        engine.start_scope(Some("inner"));
        let junk = engine.tensor(&[0.0], &[1]).unwrap();
        let result = engine.tensor(&[42.0], &[1]).unwrap();
        engine.end_scope(Some(&result));

        assert!(junk.to_vec_f32().is_err());
        assert_eq!(result.to_vec_f32().unwrap(), vec![42.0]);

        // The result is now tracked by the outer scope.
        engine.end_scope(None);
        assert!(result.to_vec_f32().is_err());
        assert_eq!(engine.live_tensors(), 0);
    }

    #[test]
    fn test_tidy_cleans_up_on_error() {
        let engine = Engine::new();
        let eng = Arc::clone(&engine);
        let r: Result<Tensor> = engine.tidy(Some("failing"), || {
            let _junk = eng.tensor(&[1.0, 2.0], &[2])?;
            Err(TangramError::InvalidArgument("boom".into()))
        });
        assert!(r.is_err());
        assert_eq!(engine.live_tensors(), 0);
        assert_eq!(engine.scope_depth(), 0);
    }

    #[test]
    fn test_keep_survives_scope() {
        let engine = Engine::new();
        engine.start_scope(None);
        let t = engine.tensor(&[1.0], &[1]).unwrap();
        engine.keep(&t).unwrap();
        engine.end_scope(None);
        assert_eq!(t.to_vec_f32().unwrap(), vec![1.0]);
        engine.dispose(&t).unwrap();
    }

    #[test]
    fn test_double_dispose_is_error() {
        let engine = Engine::new();
        let t = engine.tensor(&[1.0], &[1]).unwrap();
        engine.dispose(&t).unwrap();
        assert!(matches!(engine.dispose(&t), Err(TangramError::DeadTensor)));
    }

    #[test]
    fn test_manual_dispose_inside_scope_is_fine() {
        let engine = Engine::new();
        engine.start_scope(None);
        let t = engine.tensor(&[1.0], &[1]).unwrap();
        engine.dispose(&t).unwrap();
        // The sweep must skip the already-freed id silently.
        engine.end_scope(None);
        assert_eq!(engine.live_tensors(), 0);
    }
}
