// Scope stack — nested naming, stateless, device, autocast and symbolic frames
//
// Every thread owns one ScopeStack (see `ScopeStack::current`). A frame is
// pushed when a scope is entered and popped when its guard is dropped, so a
// `?` early return or a panic inside the scope still releases the frame.
//
// FRAME KINDS:
//
//   Name       — path segment for variables created inside ("dense/kernel")
//   Stateless  — redirects variable reads/writes into a side table
//   Device     — placement hint for backends
//   Autocast   — dtype float variables are presented in on read
//   Symbolic   — operations produce SymbolicTensors instead of values
//
// INVARIANTS:
//
//   - Frames nest strictly (LIFO). Exiting a frame out of order releases
//     every frame above it as well.
//   - At most one Stateless and one Device frame are live at a time.
//   - current_path() joins the live Name frames with "/", restarting at the
//     innermost frame that carries an override_parent.
//   - A deduplicating Name frame is a no-op only when the top frame is a Name
//     frame with the same caller and name.
//
// Each stack also keeps the variables its stateless frames left pending,
// for `initialize_all_variables_on`. Entries are weak and unique per id.
//
// A ScopeStack is an Rc handle and therefore !Send: a frame entered on one
// thread can never be observed or exited from another. Threads that need an
// isolated chain create their own with `ScopeStack::new()` and pass it to the
// `*_on` variants of the variable and stateless APIs.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::stateless::StatelessScope;
use crate::variable::{VariableId, WeakVariable};

/// Opaque identity of the object that opened a name scope (usually a layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerId(u64);

impl CallerId {
    /// A fresh, process-unique caller identity.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        CallerId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CallerId {
    fn default() -> Self {
        Self::new()
    }
}

/// A naming frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameScope {
    name: String,
    caller: Option<CallerId>,
    deduplicate: bool,
    override_parent: Option<String>,
}

impl NameScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            caller: None,
            deduplicate: true,
            override_parent: None,
        }
    }

    /// Attach the identity of the object opening this scope.
    pub fn with_caller(mut self, caller: CallerId) -> Self {
        self.caller = Some(caller);
        self
    }

    /// Whether re-entering the same caller's scope should reuse it (default true).
    pub fn with_deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    /// Replace the inherited path prefix instead of appending to it.
    pub fn with_override_parent(mut self, parent: impl Into<String>) -> Self {
        self.override_parent = Some(parent.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn caller(&self) -> Option<CallerId> {
        self.caller
    }
}

/// Kind of compute device named by a device frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Tpu,
}

/// Device placement hint: `cpu`, `gpu:1`, `tpu:0` (`cuda` is accepted as `gpu`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    pub kind: DeviceKind,
    pub index: usize,
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let (kind, index) = match lower.split_once(':') {
            Some((k, i)) => (k, i.parse::<usize>().ok()),
            None => (lower.as_str(), Some(0)),
        };
        let kind = match kind {
            "cpu" => DeviceKind::Cpu,
            "gpu" | "cuda" => DeviceKind::Gpu,
            "tpu" => DeviceKind::Tpu,
            other => return Err(Error::msg(format!("unknown device kind {other:?} in {s:?}"))),
        };
        let index = index.ok_or_else(|| Error::msg(format!("invalid device index in {s:?}")))?;
        Ok(Device { kind, index })
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
            DeviceKind::Tpu => "tpu",
        };
        write!(f, "{kind}:{}", self.index)
    }
}

/// One entry on the scope stack.
pub enum Frame {
    Name(NameScope),
    Stateless(StatelessScope),
    Device(Device),
    Autocast(DType),
    Symbolic,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Name(_) => "name",
            Frame::Stateless(_) => "stateless",
            Frame::Device(_) => "device",
            Frame::Autocast(_) => "autocast",
            Frame::Symbolic => "symbolic",
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Name(n) => write!(f, "Name({:?})", n.name),
            Frame::Stateless(s) => write!(f, "Stateless({} updates)", s.updates().len()),
            Frame::Device(d) => write!(f, "Device({d})"),
            Frame::Autocast(dt) => write!(f, "Autocast({dt})"),
            Frame::Symbolic => write!(f, "Symbolic"),
        }
    }
}

thread_local! {
    static CURRENT: ScopeStack = ScopeStack::new();
}

/// Identifies one pushed frame; handed out inside [`ScopeGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Token(u64);

struct Entry {
    token: Token,
    frame: Frame,
}

#[derive(Default)]
struct StackInner {
    entries: RefCell<Vec<Entry>>,
    next_token: Cell<u64>,
    // Variables left pending by a stateless frame of this stack.
    deferred: RefCell<BTreeMap<VariableId, WeakVariable>>,
}

/// Handle to a chain of scope frames. Clones share the same chain.
#[derive(Clone, Default)]
pub struct ScopeStack {
    inner: Rc<StackInner>,
}

impl fmt::Debug for ScopeStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.inner.entries.borrow().iter().map(|e| &e.frame))
            .finish()
    }
}

impl ScopeStack {
    /// A new, empty, isolated stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// This thread's stack.
    pub fn current() -> Self {
        CURRENT.with(|s| s.clone())
    }

    /// Number of live frames.
    pub fn depth(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    /// Push a frame. The returned guard pops it on drop.
    ///
    /// Fails with [`Error::NestedScope`] for a second stateless or device
    /// frame, and with [`Error::InvalidName`] for an empty name. A name frame
    /// that repeats the frame directly below it (same caller, same name)
    /// pushes nothing and returns a no-op guard.
    pub fn enter(&self, frame: Frame) -> Result<ScopeGuard> {
        let mut entries = self.inner.entries.borrow_mut();
        match &frame {
            Frame::Name(scope) => {
                if scope.name.is_empty() {
                    return Err(Error::InvalidName {
                        name: String::new(),
                        reason: "scope names must be non-empty",
                    });
                }
                if scope.deduplicate && scope.caller.is_some() {
                    // only the frame directly below counts; any other kind breaks the run
                    let below = entries.last().and_then(|e| match &e.frame {
                        Frame::Name(n) => Some(n),
                        _ => None,
                    });
                    if let Some(parent) = below {
                        if parent.caller == scope.caller && parent.name == scope.name {
                            tracing::trace!(name = %scope.name, "reusing name scope");
                            return Ok(ScopeGuard::noop(self.clone()));
                        }
                    }
                }
            }
            Frame::Stateless(_) | Frame::Device(_) => {
                let kind = frame.kind();
                if entries.iter().any(|e| e.frame.kind() == kind) {
                    return Err(Error::NestedScope { kind });
                }
            }
            Frame::Autocast(_) | Frame::Symbolic => {}
        }
        let token = Token(self.inner.next_token.get());
        self.inner.next_token.set(token.0 + 1);
        tracing::debug!(kind = frame.kind(), depth = entries.len(), "entering scope");
        entries.push(Entry { token, frame });
        Ok(ScopeGuard {
            stack: self.clone(),
            token: Some(token),
        })
    }

    /// Pop the frame pushed under `token`, releasing any frames left above it.
    /// Returns `None` if that frame was already released.
    fn exit(&self, token: Token) -> Option<Frame> {
        let (popped, orphans) = {
            let mut entries = self.inner.entries.borrow_mut();
            let pos = entries.iter().rposition(|e| e.token == token)?;
            let mut orphans = entries.split_off(pos + 1);
            orphans.reverse();
            (entries.pop().map(|e| e.frame), orphans)
        };
        for orphan in &orphans {
            tracing::warn!(
                kind = orphan.frame.kind(),
                "releasing scope left open by an outer exit"
            );
        }
        drop(orphans);
        if let Some(frame) = &popped {
            tracing::debug!(kind = frame.kind(), "exiting scope");
        }
        popped
    }

    fn frames(&self) -> std::cell::Ref<'_, Vec<Entry>> {
        self.inner.entries.borrow()
    }

    /// Live name segments joined with "/"; empty when none.
    pub fn current_path(&self) -> String {
        let entries = self.frames();
        let mut parts: Vec<&str> = Vec::new();
        for entry in entries.iter() {
            if let Frame::Name(scope) = &entry.frame {
                if let Some(parent) = &scope.override_parent {
                    parts.clear();
                    if !parent.is_empty() {
                        parts.push(parent);
                    }
                }
                parts.push(&scope.name);
            }
        }
        parts.join("/")
    }

    pub fn in_stateless_scope(&self) -> bool {
        self.frames()
            .iter()
            .any(|e| matches!(e.frame, Frame::Stateless(_)))
    }

    /// Run `f` against the live stateless frame, if any.
    ///
    /// The stack stays borrowed while `f` runs, so `f` must not touch it.
    pub(crate) fn with_stateless<R>(&self, f: impl FnOnce(&mut StatelessScope) -> R) -> Option<R> {
        let mut entries = self.inner.entries.borrow_mut();
        entries
            .iter_mut()
            .rev()
            .find_map(|e| match &mut e.frame {
                Frame::Stateless(scope) => Some(scope),
                _ => None,
            })
            .map(f)
    }

    /// Remember a variable a stateless frame left pending. Returns false if
    /// it was already registered. Dropped variables are pruned here.
    pub(crate) fn defer(&self, var: WeakVariable) -> bool {
        let mut deferred = self.inner.deferred.borrow_mut();
        deferred.retain(|_, v| v.is_alive());
        deferred.insert(var.id(), var).is_none()
    }

    pub(crate) fn take_deferred(&self) -> Vec<WeakVariable> {
        std::mem::take(&mut *self.inner.deferred.borrow_mut())
            .into_values()
            .collect()
    }

    /// Number of variables waiting on `initialize_all_variables_on(self)`.
    pub fn deferred_count(&self) -> usize {
        self.inner
            .deferred
            .borrow()
            .values()
            .filter(|v| v.is_alive())
            .count()
    }

    pub fn current_device(&self) -> Option<Device> {
        self.frames().iter().rev().find_map(|e| match e.frame {
            Frame::Device(d) => Some(d),
            _ => None,
        })
    }

    /// Dtype of the innermost autocast frame.
    pub fn autocast_dtype(&self) -> Option<DType> {
        self.frames().iter().rev().find_map(|e| match e.frame {
            Frame::Autocast(dt) => Some(dt),
            _ => None,
        })
    }

    pub fn in_symbolic_scope(&self) -> bool {
        self.frames()
            .iter()
            .any(|e| matches!(e.frame, Frame::Symbolic))
    }
}

/// Releases a scope frame when dropped.
#[derive(Debug)]
#[must_use = "the scope is exited as soon as the guard is dropped"]
pub struct ScopeGuard {
    stack: ScopeStack,
    token: Option<Token>,
}

impl ScopeGuard {
    fn noop(stack: ScopeStack) -> Self {
        Self { stack, token: None }
    }

    /// True if entering pushed nothing (a deduplicated name scope).
    pub fn is_noop(&self) -> bool {
        self.token.is_none()
    }

    /// Pop the frame now and hand it back.
    pub fn exit(mut self) -> Option<Frame> {
        self.token.take().and_then(|t| self.stack.exit(t))
    }

    pub fn stack(&self) -> &ScopeStack {
        &self.stack
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.stack.exit(token);
        }
    }
}

// Convenience entry points on the current thread's stack.

/// Enter a name scope on this thread's stack.
pub fn name_scope(scope: impl Into<NameScope>) -> Result<ScopeGuard> {
    ScopeStack::current().enter(Frame::Name(scope.into()))
}

/// Run `f` inside a name scope; the frame is released however `f` returns.
pub fn with_name_scope<T>(scope: impl Into<NameScope>, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _guard = name_scope(scope)?;
    f()
}

/// Enter a device scope, e.g. `device_scope("gpu:0")`.
pub fn device_scope(device: &str) -> Result<ScopeGuard> {
    ScopeStack::current().enter(Frame::Device(device.parse()?))
}

/// Present float variables in `dtype` on read while the guard lives.
pub fn autocast_scope(dtype: DType) -> Result<ScopeGuard> {
    ScopeStack::current().enter(Frame::Autocast(dtype))
}

/// Make operations produce symbolic tensors while the guard lives.
pub fn symbolic_scope() -> Result<ScopeGuard> {
    ScopeStack::current().enter(Frame::Symbolic)
}

pub fn current_path() -> String {
    ScopeStack::current().current_path()
}

pub fn in_stateless_scope() -> bool {
    ScopeStack::current().in_stateless_scope()
}

pub fn in_symbolic_scope() -> bool {
    ScopeStack::current().in_symbolic_scope()
}

impl From<&str> for NameScope {
    fn from(name: &str) -> Self {
        NameScope::new(name)
    }
}

impl From<String> for NameScope {
    fn from(name: String) -> Self {
        NameScope::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(stack: &ScopeStack, n: &str) -> ScopeGuard {
        stack.enter(Frame::Name(NameScope::new(n))).unwrap()
    }

    #[test]
    fn test_paths_compose_left_to_right() {
        let stack = ScopeStack::new();
        assert_eq!(stack.current_path(), "");
        let _a = name(&stack, "a");
        let b = name(&stack, "b");
        assert_eq!(stack.current_path(), "a/b");
        drop(b);
        assert_eq!(stack.current_path(), "a");
    }

    #[test]
    fn test_dedup_same_caller() {
        let stack = ScopeStack::new();
        let caller = CallerId::new();
        let _a = stack
            .enter(Frame::Name(NameScope::new("a").with_caller(caller)))
            .unwrap();
        let again = stack
            .enter(Frame::Name(NameScope::new("a").with_caller(caller)))
            .unwrap();
        assert!(again.is_noop());
        assert_eq!(stack.current_path(), "a");
        drop(again);
        assert_eq!(stack.current_path(), "a");
    }

    #[test]
    fn test_no_dedup_across_other_frame_kinds() {
        let stack = ScopeStack::new();
        let caller = CallerId::new();
        let _a = stack
            .enter(Frame::Name(NameScope::new("a").with_caller(caller)))
            .unwrap();
        let _cast = stack.enter(Frame::Autocast(DType::F16)).unwrap();
        let again = stack
            .enter(Frame::Name(NameScope::new("a").with_caller(caller)))
            .unwrap();
        assert!(!again.is_noop());
        assert_eq!(stack.current_path(), "a/a");
    }

    #[test]
    fn test_no_dedup_for_other_caller_or_when_disabled() {
        let stack = ScopeStack::new();
        let caller = CallerId::new();
        let _a = stack
            .enter(Frame::Name(NameScope::new("a").with_caller(caller)))
            .unwrap();
        let _b = stack
            .enter(Frame::Name(NameScope::new("a").with_caller(CallerId::new())))
            .unwrap();
        assert_eq!(stack.current_path(), "a/a");
        let _c = stack
            .enter(Frame::Name(
                NameScope::new("a").with_caller(caller).with_deduplicate(false),
            ))
            .unwrap();
        assert_eq!(stack.current_path(), "a/a/a");
    }

    #[test]
    fn test_override_parent_replaces_prefix() {
        let stack = ScopeStack::new();
        let _a = name(&stack, "outer");
        let _b = stack
            .enter(Frame::Name(
                NameScope::new("layer").with_override_parent("model"),
            ))
            .unwrap();
        assert_eq!(stack.current_path(), "model/layer");
        let _c = name(&stack, "sub");
        assert_eq!(stack.current_path(), "model/layer/sub");
    }

    #[test]
    fn test_empty_name_rejected() {
        let stack = ScopeStack::new();
        assert!(matches!(
            stack.enter(Frame::Name(NameScope::new(""))),
            Err(Error::InvalidName { .. })
        ));
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_single_device_frame() {
        let stack = ScopeStack::new();
        let _d = stack.enter(Frame::Device("gpu:1".parse().unwrap())).unwrap();
        assert_eq!(stack.current_device().unwrap().to_string(), "gpu:1");
        let err = stack
            .enter(Frame::Device("cpu".parse().unwrap()))
            .unwrap_err();
        assert!(matches!(err, Error::NestedScope { kind: "device" }));
    }

    #[test]
    fn test_device_parse() {
        assert_eq!(
            "CUDA:2".parse::<Device>().unwrap(),
            Device {
                kind: DeviceKind::Gpu,
                index: 2
            }
        );
        assert!("npu".parse::<Device>().is_err());
        assert!("gpu:x".parse::<Device>().is_err());
    }

    #[test]
    fn test_autocast_innermost_wins() {
        let stack = ScopeStack::new();
        assert_eq!(stack.autocast_dtype(), None);
        let _a = stack.enter(Frame::Autocast(DType::F16)).unwrap();
        {
            let _b = stack.enter(Frame::Autocast(DType::BF16)).unwrap();
            assert_eq!(stack.autocast_dtype(), Some(DType::BF16));
        }
        assert_eq!(stack.autocast_dtype(), Some(DType::F16));
    }

    #[test]
    fn test_out_of_order_exit_releases_inner_frames() {
        let stack = ScopeStack::new();
        let a = name(&stack, "a");
        let _b = name(&stack, "b");
        let _c = stack.enter(Frame::Symbolic).unwrap();
        assert_eq!(stack.depth(), 3);
        let popped = a.exit();
        assert!(matches!(popped, Some(Frame::Name(_))));
        assert_eq!(stack.depth(), 0);
        assert!(!stack.in_symbolic_scope());
        // dropping the orphaned guards afterwards is harmless
    }

    #[test]
    fn test_release_on_error_path() {
        let stack = ScopeStack::new();
        let run = || -> Result<()> {
            let _g = name(&stack, "failing");
            Err(Error::msg("boom"))
        };
        assert!(run().is_err());
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_release_on_panic() {
        let stack = ScopeStack::new();
        let inner = stack.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _g = inner.enter(Frame::Symbolic).unwrap();
            panic!("inside scope");
        }));
        assert!(result.is_err());
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_thread_stacks_are_isolated() {
        let _g = name_scope("main_thread").unwrap();
        let other = std::thread::spawn(current_path).join().unwrap();
        assert_eq!(other, "");
        assert_eq!(current_path(), "main_thread");
    }
}
