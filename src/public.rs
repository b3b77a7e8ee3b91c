use core::fmt::Debug;
use std::fmt;
use std::ops::{Deref, Sub};
use std::rc::{Rc, Weak};

pub use crate::cutoff::{Cutoff, CutoffClosure};
pub use crate::incr::Incr;
pub use crate::internal_observer::{ObserverError, SubscriptionToken};
pub use crate::kind::{BeforeOrAfter, Timestamp};
pub use crate::node::NodeId;
pub use crate::node_update::NodeUpdate;
pub use crate::stabilisation_num::StabilisationNum;
#[doc(inline)]
pub use crate::Value;

use crate::clock;
use crate::internal_observer::{ErasedObserver, InternalObserver, ObserverState};
use crate::kind::{
    make_update_fn_from_inverse, next_interval_after, AtGen, AtId, AtIntervalsGen, AtIntervalsId,
    AtIntervalsNode, AtNode, Kind, SnapshotGen, SnapshotNode, StepFunctionGen, StepFunctionNode,
};
use crate::node::{ErasedNode, Incremental, Node};
use crate::node_update::OnUpdateHandler;
use crate::scope;
use crate::state::State;
use crate::var::{ErasedVariable, Var as InternalVar};
use crate::Invariant;

/// Reads values out of the graph and, by existing, keeps its part of the
/// graph alive and up to date.
#[derive(Clone)]
pub struct Observer<T: Value> {
    internal: Rc<InternalObserver<T>>,
    sentinel: Rc<()>,
}

/// What a subscription sees when its observed node updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update<T> {
    /// First visible value.
    Initialised(T),
    /// A subsequent change, along with the previous value where one was
    /// retained.
    Changed { old: Option<T>, new: T },
    /// The node was invalidated; no further updates will arrive.
    Invalidated,
}

impl<T> Update<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Self::Initialised(t) => Some(t),
            Self::Changed { new, .. } => Some(new),
            Self::Invalidated => None,
        }
    }
}

impl<T> Update<&T> {
    pub fn cloned(&self) -> Update<T>
    where
        T: Clone,
    {
        match *self {
            Self::Initialised(t) => Update::Initialised(t.clone()),
            Self::Changed { old, new } => Update::Changed {
                old: old.cloned(),
                new: new.clone(),
            },
            Self::Invalidated => Update::Invalidated,
        }
    }
}

impl<T: Value> Observer<T> {
    pub(crate) fn new(internal: Rc<InternalObserver<T>>) -> Self {
        Self {
            internal,
            sentinel: Rc::new(()),
        }
    }

    #[inline]
    pub fn try_get_value(&self) -> Result<T, ObserverError> {
        self.internal.try_get_value()
    }

    /// The observed node's current value.
    ///
    /// Panics when there is no value to give (never stabilised, disallowed,
    /// observing an invalid node); use [Observer::try_get_value] to handle
    /// those cases.
    #[inline]
    pub fn value(&self) -> T {
        self.internal.try_get_value().unwrap()
    }

    pub fn subscribe(&self, on_update: impl FnMut(Update<&T>) + 'static) -> SubscriptionToken {
        self.try_subscribe(on_update).unwrap()
    }

    pub fn try_subscribe(
        &self,
        mut on_update: impl FnMut(Update<&T>) + 'static,
    ) -> Result<SubscriptionToken, ObserverError> {
        let handler_fn = Box::new(move |node_update: NodeUpdate<&T>| {
            let update = match node_update {
                NodeUpdate::Necessary(t) => Update::Initialised(t),
                NodeUpdate::Changed { old, new } => Update::Changed { old, new },
                NodeUpdate::Invalidated => Update::Invalidated,
                NodeUpdate::Unnecessary => {
                    panic!("an observer subscription should never see an Unnecessary update")
                }
            };
            on_update(update)
        });
        let state = self
            .internal
            .incr_state()
            .ok_or(ObserverError::ObservingInvalid)?;
        let now = state.stabilisation_num.get();
        let handler = OnUpdateHandler::new(now, handler_fn);
        let token = self.internal.subscribe(handler)?;
        let node = self.internal.observing_erased();
        // deliver the current value after the next stabilisation
        node.handle_after_stabilisation(&state);
        Ok(token)
    }

    #[inline]
    pub fn unsubscribe(&self, token: SubscriptionToken) -> Result<(), ObserverError> {
        self.internal.unsubscribe(token)
    }

    #[inline]
    pub fn state(&self) -> WeakState {
        self.internal
            .incr_state()
            .map_or_else(|| WeakState { inner: Weak::new() }, |s| s.public_weak())
    }

    pub fn disallow_future_use(&self) {
        let Some(state) = self.internal.incr_state() else {
            return;
        };
        self.internal.disallow_future_use(&state);
    }

    pub fn save_dot_to_file(&self, named: &str) {
        let node = self.internal.observing_erased();
        crate::node::save_dot_to_file(&mut core::iter::once(node), named).unwrap();
    }

    pub fn save_dot_to_string(&self) -> String {
        let node = self.internal.observing_erased();
        let mut buf = String::new();
        crate::node::save_dot(&mut buf, &mut core::iter::once(node)).unwrap();
        buf
    }
}

impl<T: Value> Debug for Observer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("internal", &self.internal)
            .finish()
    }
}

impl<T: Value> Drop for Observer<T> {
    fn drop(&mut self) {
        /* all_observers holds another strong reference to internal, so use a
        sentinel Rc to detect the last *public* handle going away. */
        if Rc::strong_count(&self.sentinel) <= 1 {
            if let Some(state) = self.internal.incr_state() {
                // queues the unlink; the observer is dropped for real at the
                // start of the next stabilisation
                self.internal.disallow_future_use(&state);
            } else {
                // state is already dead (or being dropped); nothing to queue
                self.internal.state.set(ObserverState::Disallowed);
            }
        }
    }
}

/// A settable input to the graph. Dereferences to the [Incr] that watches it.
#[derive(Clone)]
pub struct Var<T: Value> {
    internal: Rc<InternalVar<T>>,
    sentinel: Rc<()>,
    // for the Deref impl
    watch: Incr<T>,
}

impl<T: Value> fmt::Debug for Var<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tuple = f.debug_tuple("Var");
        let internal = self.internal.value.borrow();
        tuple.field(&self.id()).field(&*internal).finish()
    }
}

impl<T: Value> PartialEq for Var<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl<T: Value> Deref for Var<T> {
    type Target = Incr<T>;
    fn deref(&self) -> &Self::Target {
        &self.watch
    }
}

impl<T: Value> Var<T> {
    pub(crate) fn new(internal: Rc<InternalVar<T>>) -> Self {
        Self {
            watch: internal.watch(),
            internal,
            sentinel: Rc::new(()),
        }
    }

    #[inline]
    pub fn set(&self, value: T) {
        self.internal.set(value)
    }

    /// True when a set happened during the current stabilisation and is
    /// waiting to be applied at its end.
    #[inline]
    pub fn was_changed_during_stabilisation(&self) -> bool {
        self.internal.was_changed_during_stabilisation()
    }

    /// Takes the current value, replaces it using `f`, and queues a
    /// recompute. `T: Default` lets this avoid a clone via `std::mem::take`.
    #[inline]
    pub fn update(&self, f: impl FnOnce(T) -> T)
    where
        T: Default,
    {
        self.internal.update(f)
    }

    /// Like `RefCell::replace_with`: mutate the old value, return a new one,
    /// get the old one back.
    #[inline]
    pub fn replace_with(&self, f: impl FnOnce(&mut T) -> T) -> T {
        self.internal.replace_with(f)
    }

    /// Like `RefCell::replace`.
    #[inline]
    pub fn replace(&self, value: T) -> T {
        self.internal.replace_with(|_| value)
    }

    /// Mutate the value in place and queue a recompute.
    #[inline]
    pub fn modify(&self, f: impl FnOnce(&mut T)) {
        self.internal.modify(f);
    }

    #[inline]
    pub fn get(&self) -> T {
        self.internal.get()
    }

    #[inline]
    pub fn watch(&self) -> Incr<T> {
        self.watch.clone()
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.internal.node_id.get()
    }
}

impl<T: Value> Drop for Var<T> {
    fn drop(&mut self) {
        tracing::trace!("dropping public::Var with id {:?}", self.id());
        /* One strong count is ours, one belongs to the watch node. When the
        last public::Var goes (checked via the sentinel), the Rc cycle
        between Var and its node must be broken, but only after any pending
        set_during_stabilisation use, hence the delay queue. */
        if Rc::strong_count(&self.sentinel) <= 1 {
            if let Some(state) = self.internal.state.upgrade() {
                let mut dead_vars = state.dead_vars.borrow_mut();
                dead_vars.push(self.internal.erased());
            } else {
                // no stabilise will ever run again; break the cycle directly
                self.internal.break_rc_cycle();
            }
        }
    }
}

/// The root handle of one incremental computation graph.
#[derive(Debug, Clone)]
pub struct IncrState {
    pub(crate) inner: Rc<State>,
}

impl Default for IncrState {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrState {
    pub fn new() -> Self {
        Self {
            inner: State::new(),
        }
    }

    /// As [IncrState::new], with a custom bound on node heights (the default
    /// is 128).
    pub fn new_with_height(max_height: usize) -> Self {
        Self {
            inner: State::new_with_height(max_height),
        }
    }

    pub fn weak(&self) -> WeakState {
        WeakState {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Brings every observed, out-of-date node up to date, in dependency
    /// order, then runs update handlers.
    pub fn stabilise(&self) {
        self.inner.stabilise();
    }

    /// True when another stabilise would have nothing to do. Lets callers
    /// drive a computation that sets variables during stabilisation to a
    /// fixed point.
    pub fn is_stable(&self) -> bool {
        self.inner.is_stable()
    }

    #[inline]
    pub fn constant<T: Value>(&self, value: T) -> Incr<T> {
        self.inner.constant(value)
    }

    /// Left fold over an array of inputs; refolds from scratch whenever any
    /// input changes.
    pub fn fold<F, T: Value, R: Value>(&self, vec: Vec<Incr<T>>, init: R, f: F) -> Incr<R>
    where
        F: FnMut(R, &T) -> R + 'static,
    {
        self.inner.fold(vec, init, f)
    }

    /// Fold for order-insensitive combining functions: on a change, the
    /// cached result is patched with `update(acc, old, new)` instead of
    /// refolding every input. `full_compute_every_n_changes` forces a
    /// periodic refold (useful against floating-point drift).
    pub fn unordered_fold<F, U, T: Value, R: Value>(
        &self,
        vec: Vec<Incr<T>>,
        init: R,
        fold: F,
        update: U,
        full_compute_every_n_changes: Option<u32>,
    ) -> Incr<R>
    where
        F: FnMut(R, &T) -> R + 'static,
        U: FnMut(R, &T, &T) -> R + 'static,
    {
        self.inner
            .unordered_fold(vec, init, fold, update, full_compute_every_n_changes)
    }

    /// [IncrState::unordered_fold] with the update function derived from
    /// `fold` and its inverse.
    pub fn unordered_fold_inverse<F, FInv, T: Value, R: Value>(
        &self,
        vec: Vec<Incr<T>>,
        init: R,
        fold: F,
        fold_inverse: FInv,
        full_compute_every_n_changes: Option<u32>,
    ) -> Incr<R>
    where
        F: FnMut(R, &T) -> R + Clone + 'static,
        FInv: FnMut(R, &T) -> R + 'static,
    {
        let update = make_update_fn_from_inverse(fold.clone(), fold_inverse);
        self.inner
            .unordered_fold(vec, init, fold, update, full_compute_every_n_changes)
    }

    pub fn var<T: Value>(&self, value: T) -> Var<T> {
        self.inner.var_in_scope(value, scope::Scope::Top)
    }

    /// A var owned by the scope that is currently being built (e.g. inside a
    /// bind), so it is torn down with that scope.
    pub fn var_current_scope<T: Value>(&self, value: T) -> Var<T> {
        self.inner.var_in_scope(value, self.inner.current_scope())
    }

    /// A manually-driven clock for the time-based combinators.
    pub fn clock(&self, start: Timestamp) -> Clock {
        Clock {
            internal: clock::Clock::new(Rc::downgrade(&self.inner), start),
        }
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.inner.unsubscribe(token)
    }

    pub fn is_stabilising(&self) -> bool {
        self.inner.is_stabilising()
    }

    pub fn set_max_height_allowed(&self, new_max_height: usize) {
        self.inner.set_max_height_allowed(new_max_height)
    }

    pub fn within_scope<R>(&self, scope: Scope, f: impl FnOnce() -> R) -> R {
        self.inner.within_scope(scope.0, f)
    }

    pub fn current_scope(&self) -> Scope {
        Scope(self.inner.current_scope())
    }

    pub fn save_dot_to_file(&self, named: &str) {
        self.inner.save_dot_to_file(named)
    }

    pub fn save_dot_to_string(&self) -> String {
        self.inner.save_dot_to_string()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            created: self.inner.num_nodes_created.get(),
            changed: self.inner.num_nodes_changed.get(),
            recomputed: self.inner.num_nodes_recomputed.get(),
            invalidated: self.inner.num_nodes_invalidated.get(),
            became_necessary: self.inner.num_nodes_became_necessary.get(),
            became_unnecessary: self.inner.num_nodes_became_unnecessary.get(),
            necessary: self.inner.num_nodes_became_necessary.get()
                - self.inner.num_nodes_became_unnecessary.get(),
        }
    }
}

impl Invariant for IncrState {
    /// Walks every observed node and its descendants, asserting the
    /// structural invariants. Intended for tests.
    fn invariant(&self) {
        self.inner.invariant()
    }
}

/// A non-owning [IncrState] handle, for closures that live inside the graph
/// and must not keep the graph alive.
#[derive(Debug, Clone)]
pub struct WeakState {
    pub(crate) inner: Weak<State>,
}

impl WeakState {
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.inner.ptr_eq(&other.inner)
    }

    pub(crate) fn upgrade(&self) -> Option<Rc<State>> {
        self.inner.upgrade()
    }

    #[inline]
    pub fn constant<T: Value>(&self, value: T) -> Incr<T> {
        self.upgrade().unwrap().constant(value)
    }

    pub fn fold<F, T: Value, R: Value>(&self, vec: Vec<Incr<T>>, init: R, f: F) -> Incr<R>
    where
        F: FnMut(R, &T) -> R + 'static,
    {
        self.upgrade().unwrap().fold(vec, init, f)
    }

    pub fn var<T: Value>(&self, value: T) -> Var<T> {
        self.upgrade()
            .unwrap()
            .var_in_scope(value, scope::Scope::Top)
    }

    pub fn var_current_scope<T: Value>(&self, value: T) -> Var<T> {
        let inner = self.upgrade().unwrap();
        inner.var_in_scope(value, inner.current_scope())
    }

    pub fn within_scope<R>(&self, scope: Scope, f: impl FnOnce() -> R) -> R {
        self.upgrade().unwrap().within_scope(scope.0, f)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.upgrade().unwrap().unsubscribe(token)
    }
}

/// A manually-advanced clock; see [IncrState::clock]. All the combinators
/// it creates live in the current scope and share this clock's time axis.
#[derive(Clone)]
pub struct Clock {
    internal: Rc<clock::Clock>,
}

impl Clock {
    pub fn now(&self) -> Timestamp {
        self.internal.now()
    }

    /// Moves time forward and fires every alarm that falls due. May only be
    /// called between stabilisations. Moving backwards is a no-op.
    pub fn advance_to(&self, to: Timestamp) {
        self.internal.advance_to(to)
    }

    /// `Before` until the clock reaches `at`, then `After`.
    pub fn at(&self, at: Timestamp) -> Incr<BeforeOrAfter> {
        let state = self.state();
        let node = Node::<AtGen>::create_rc(
            state.weak(),
            state.current_scope(),
            Kind::At {
                at: AtNode {
                    at,
                    clock: self.internal.clone(),
                },
                casts: AtId { r: refl::refl() },
            },
        );
        if at > self.internal.now() {
            self.internal.schedule(at, node.weak());
        }
        Incr { node }
    }

    /// A `()` value that changes every `interval_nanos` on this clock,
    /// aligned to multiples counted from the moment of creation.
    pub fn at_intervals(&self, interval_nanos: i64) -> Incr<()> {
        assert!(interval_nanos > 0, "at_intervals requires a positive interval");
        let state = self.state();
        let base = self.internal.now();
        let node = Node::<AtIntervalsGen>::create_rc(
            state.weak(),
            state.current_scope(),
            Kind::AtIntervals {
                at_intervals: AtIntervalsNode {
                    base,
                    interval: interval_nanos,
                    clock: self.internal.clone(),
                },
                casts: AtIntervalsId {
                    r_unit: refl::refl(),
                },
            },
        );
        // a unit value would otherwise cut off every tick
        node.set_cutoff(Cutoff::Never);
        self.internal.schedule(
            next_interval_after(base, interval_nanos, base),
            node.weak(),
        );
        Incr { node }
    }

    /// `before` until the clock reaches `at`; from then on, frozen to the
    /// value `value_at` has at that moment. Panics unless `at` is in this
    /// clock's future.
    pub fn snapshot<T: Value>(&self, value_at: &Incr<T>, at: Timestamp, before: T) -> Incr<T> {
        assert!(
            at > self.internal.now(),
            "snapshot time must be in the clock's future"
        );
        let state = self.state();
        let node = Node::<SnapshotGen<T>>::create_rc(
            state.weak(),
            state.current_scope(),
            Kind::Snapshot(SnapshotNode {
                child: value_at.node.clone(),
                at,
                before,
                clock: self.internal.clone(),
            }),
        );
        self.internal.schedule(at, node.weak());
        Incr { node }
    }

    /// A piecewise-constant function of this clock's time: `init` before the
    /// first step, then each step's value from its timestamp on. Steps must
    /// be in ascending time order.
    pub fn step_function<T: Value>(&self, init: T, steps: Vec<(Timestamp, T)>) -> Incr<T> {
        assert!(
            steps.windows(2).all(|w| w[0].0 <= w[1].0),
            "step_function steps must be in ascending time order"
        );
        let state = self.state();
        let now = self.internal.now();
        let next = steps.iter().map(|(t, _)| *t).find(|t| *t > now);
        let node = Node::<StepFunctionGen<T>>::create_rc(
            state.weak(),
            state.current_scope(),
            Kind::StepFunction(StepFunctionNode {
                init,
                steps,
                clock: self.internal.clone(),
            }),
        );
        if let Some(next) = next {
            self.internal.schedule(next, node.weak());
        }
        Incr { node }
    }

    fn state(&self) -> Rc<State> {
        self.internal
            .state
            .upgrade()
            .expect("used a clock whose state has been dropped")
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.internal.fmt(f)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Stats {
    pub created: usize,
    pub changed: usize,
    pub recomputed: usize,
    pub invalidated: usize,
    pub became_necessary: usize,
    pub became_unnecessary: usize,
    pub necessary: usize,
}

#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct StatsDiff {
    pub created: isize,
    pub changed: isize,
    pub recomputed: isize,
    pub invalidated: isize,
    pub became_necessary: isize,
    pub became_unnecessary: isize,
    pub necessary: isize,
}

impl Debug for StatsDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("StatsDiff");
        let mut field = |name: &str, x: isize| {
            if x != 0 {
                f.field(name, &x);
            }
        };
        field("created", self.created);
        field("changed", self.changed);
        field("recomputed", self.recomputed);
        field("invalidated", self.invalidated);
        field("became_necessary", self.became_necessary);
        field("became_unnecessary", self.became_unnecessary);
        field("necessary", self.necessary);
        f.finish()
    }
}

impl Stats {
    pub fn diff(&self, other: Self) -> StatsDiff {
        StatsDiff {
            created: self.created as isize - other.created as isize,
            changed: self.changed as isize - other.changed as isize,
            recomputed: self.recomputed as isize - other.recomputed as isize,
            invalidated: self.invalidated as isize - other.invalidated as isize,
            became_necessary: self.became_necessary as isize - other.became_necessary as isize,
            became_unnecessary: self.became_unnecessary as isize
                - other.became_unnecessary as isize,
            necessary: self.necessary as isize - other.necessary as isize,
        }
    }
}

impl Sub for Stats {
    type Output = StatsDiff;
    fn sub(self, rhs: Self) -> Self::Output {
        self.diff(rhs)
    }
}

/// A helper trait for accepting either Incr or Var. Var already derefs to
/// its watch Incr, so we may as well accept it anywhere we accept an Incr.
pub trait IntoIncr<T> {
    fn into_incr(self) -> Incr<T>;
}

impl<T: Value> AsRef<Incr<T>> for Var<T> {
    #[inline]
    fn as_ref(&self) -> &Incr<T> {
        self.deref()
    }
}

impl<T: Value> AsRef<Incr<T>> for Incr<T> {
    #[inline]
    fn as_ref(&self) -> &Incr<T> {
        self
    }
}

impl<T> IntoIncr<T> for Incr<T> {
    #[inline]
    fn into_incr(self) -> Incr<T> {
        self
    }
}

impl<T> IntoIncr<T> for &Incr<T> {
    #[inline]
    fn into_incr(self) -> Incr<T> {
        self.clone()
    }
}

impl<T: Value> IntoIncr<T> for Var<T> {
    #[inline]
    fn into_incr(self) -> Incr<T> {
        self.watch()
    }
}

/// And for var references, because we don't need to consume self.
impl<T: Value> IntoIncr<T> for &Var<T> {
    #[inline]
    fn into_incr(self) -> Incr<T> {
        self.watch()
    }
}

/// An opaque creation scope, as used by [IncrState::within_scope].
#[derive(Clone)]
pub struct Scope(scope::Scope);

impl Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Scope {
    pub const fn top() -> Self {
        Scope(scope::Scope::Top)
    }

    pub fn is_top(&self) -> bool {
        self.0.is_top()
    }
}
