use core::fmt::Debug;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::adjust_heights_heap::AdjustHeightsHeap;
use crate::config;
use crate::incr::Incr;
use crate::internal_observer::{
    ErasedObserver, InternalObserver, ObserverId, ObserverState, StrongObserver, SubscriptionToken,
    WeakObserver,
};
use crate::kind::{ConstantGen, Kind, UnorderedArrayFold};
use crate::node::{ErasedNode, Node, NodeId};
use crate::node_update::NodeUpdateDelayed;
use crate::recompute_heap::RecomputeHeap;
use crate::scope::Scope;
use crate::stabilisation_num::StabilisationNum;
use crate::var::{ErasedVariable, Var, VarGenerics, WeakVar};
use crate::{public, CellIncrement, Invariant, Value, WeakNode};

pub(crate) struct State {
    pub(crate) stabilisation_num: Cell<StabilisationNum>,
    pub(crate) adjust_heights_heap: RefCell<AdjustHeightsHeap>,
    pub(crate) recompute_heap: RecomputeHeap,
    pub(crate) status: Cell<IncrStatus>,
    pub(crate) num_var_sets: Cell<usize>,
    pub(crate) num_nodes_recomputed: Cell<usize>,
    pub(crate) num_nodes_created: Cell<usize>,
    pub(crate) num_nodes_changed: Cell<usize>,
    pub(crate) num_nodes_became_necessary: Cell<usize>,
    pub(crate) num_nodes_became_unnecessary: Cell<usize>,
    pub(crate) num_nodes_invalidated: Cell<usize>,
    pub(crate) num_active_observers: Cell<usize>,
    pub(crate) propagate_invalidity: RefCell<Vec<WeakNode>>,
    pub(crate) run_on_update_handlers: RefCell<Vec<(WeakNode, NodeUpdateDelayed)>>,
    pub(crate) handle_after_stabilisation: RefCell<Vec<WeakNode>>,
    pub(crate) new_observers: RefCell<Vec<WeakObserver>>,
    pub(crate) all_observers: RefCell<HashMap<ObserverId, StrongObserver>>,
    pub(crate) disallowed_observers: RefCell<Vec<WeakObserver>>,
    pub(crate) current_scope: RefCell<Scope>,
    pub(crate) set_during_stabilisation: RefCell<Vec<WeakVar>>,
    pub(crate) dead_vars: RefCell<Vec<WeakVar>>,
    /// Buffer for dropping vars.
    ///
    /// With a `Var<Var<i32>>`, dropping the outer one puts it in the
    /// dead_vars bucket; breaking its cycle then wants to push the inner Var
    /// onto the same list, so that list must not be borrowed while the drop
    /// code runs.
    pub(crate) dead_vars_alt: RefCell<Vec<WeakVar>>,
    pub(crate) weak_self: Weak<Self>,
}

impl Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("stabilisation_num", &self.stabilisation_num.get())
            .field("status", &self.status.get())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IncrStatus {
    RunningOnUpdateHandlers,
    NotStabilising,
    Stabilising,
}

impl State {
    pub(crate) fn public_weak(self: &Rc<Self>) -> public::WeakState {
        public::WeakState {
            inner: Rc::downgrade(self),
        }
    }

    pub(crate) fn weak(&self) -> Weak<Self> {
        self.weak_self.clone()
    }

    pub(crate) fn current_scope(&self) -> Scope {
        self.current_scope.borrow().clone()
    }

    pub(crate) fn within_scope<R>(&self, scope: Scope, f: impl FnOnce() -> R) -> R {
        if !scope.is_valid() {
            panic!("attempted to run a closure within an invalid scope");
        }
        let old = self.current_scope.replace(scope);
        let r = f();
        self.current_scope.replace(old);
        r
    }

    pub(crate) fn new() -> Rc<Self> {
        const DEFAULT_MAX_HEIGHT_ALLOWED: usize = 128;
        Self::new_with_height(DEFAULT_MAX_HEIGHT_ALLOWED)
    }

    pub(crate) fn new_with_height(max_height: usize) -> Rc<Self> {
        Rc::new_cyclic(|weak| State {
            weak_self: weak.clone(),
            recompute_heap: RecomputeHeap::new(max_height),
            adjust_heights_heap: RefCell::new(AdjustHeightsHeap::new(max_height)),
            stabilisation_num: Cell::new(StabilisationNum(0)),
            num_var_sets: Cell::new(0),
            num_nodes_recomputed: Cell::new(0),
            num_nodes_created: Cell::new(0),
            num_nodes_changed: Cell::new(0),
            num_nodes_became_necessary: Cell::new(0),
            num_nodes_became_unnecessary: Cell::new(0),
            num_nodes_invalidated: Cell::new(0),
            num_active_observers: Cell::new(0),
            propagate_invalidity: RefCell::new(vec![]),
            status: Cell::new(IncrStatus::NotStabilising),
            all_observers: RefCell::new(HashMap::new()),
            new_observers: RefCell::new(Vec::new()),
            disallowed_observers: RefCell::new(Vec::new()),
            current_scope: RefCell::new(Scope::Top),
            set_during_stabilisation: RefCell::new(vec![]),
            dead_vars: RefCell::new(vec![]),
            dead_vars_alt: RefCell::new(vec![]),
            handle_after_stabilisation: RefCell::new(vec![]),
            run_on_update_handlers: RefCell::new(vec![]),
        })
    }

    pub(crate) fn constant<T: Value>(self: &Rc<Self>, value: T) -> Incr<T> {
        let node = Node::<ConstantGen<T>>::create_rc(
            self.weak(),
            self.current_scope(),
            Kind::Constant(value),
        );
        Incr { node }
    }

    pub(crate) fn fold<F, T: Value, R: Value>(
        self: &Rc<Self>,
        vec: Vec<Incr<T>>,
        init: R,
        f: F,
    ) -> Incr<R>
    where
        F: FnMut(R, &T) -> R + 'static,
    {
        if vec.is_empty() {
            return self.constant(init);
        }
        let node = Node::<crate::kind::ArrayFold<F, T, R>>::create_rc(
            self.weak(),
            self.current_scope(),
            Kind::ArrayFold(crate::kind::ArrayFold {
                init,
                fold: RefCell::new(f),
                children: vec,
            }),
        );
        Incr { node }
    }

    pub(crate) fn unordered_fold<F, U, T: Value, R: Value>(
        self: &Rc<Self>,
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
        if vec.is_empty() {
            return self.constant(init);
        }
        let node = Node::<UnorderedArrayFold<F, U, T, R>>::create_rc(
            self.weak(),
            self.current_scope(),
            Kind::UnorderedArrayFold(UnorderedArrayFold::new(
                vec,
                init,
                fold,
                update,
                full_compute_every_n_changes,
            )),
        );
        Incr { node }
    }

    pub(crate) fn var_in_scope<T: Value>(
        self: &Rc<Self>,
        value: T,
        scope: Scope,
    ) -> public::Var<T> {
        let var = Rc::new(Var {
            state: self.weak(),
            set_at: Cell::new(self.stabilisation_num.get()),
            value: RefCell::new(value),
            node_id: NodeId(0).into(),
            node: RefCell::new(None),
            value_set_during_stabilisation: RefCell::new(None),
        });
        let node =
            Node::<VarGenerics<T>>::create_rc(self.weak(), scope, Kind::Var(var.clone()));
        {
            let mut slot = var.node.borrow_mut();
            var.node_id.set(node.id);
            slot.replace(node);
        }
        public::Var::new(var)
    }

    pub(crate) fn observe<T: Value>(&self, incr: Incr<T>) -> Rc<InternalObserver<T>> {
        let internal_observer = InternalObserver::new(incr);
        self.num_active_observers.increment();
        let mut no = self.new_observers.borrow_mut();
        no.push(Rc::downgrade(&internal_observer) as WeakObserver);
        internal_observer
    }

    fn add_new_observers(&self) {
        let mut no = self.new_observers.borrow_mut();
        for weak in no.drain(..) {
            let Some(obs) = weak.upgrade() else { continue };
            match obs.state().get() {
                ObserverState::InUse | ObserverState::Disallowed => panic!(),
                ObserverState::Unlinked => {}
                ObserverState::Created => {
                    obs.state().set(ObserverState::InUse);
                    let node = obs.observing_packed();
                    let was_necessary = node.is_necessary();
                    {
                        let mut ao = self.all_observers.borrow_mut();
                        ao.insert(obs.id(), obs.clone());
                    }
                    obs.add_to_observed_node();
                    /* By adding the observer to the node's table, we may have
                    added on-update handlers to it. We handle the node after
                    this stabilisation to give those handlers a chance to
                    run. */
                    node.handle_after_stabilisation(self);
                    debug_assert!(node.is_necessary());
                    if !was_necessary {
                        node.became_necessary_propagate(self);
                    }
                }
            }
        }
    }

    fn unlink_disallowed_observers(&self) {
        let mut disallowed = self.disallowed_observers.borrow_mut();
        for obs_weak in disallowed.drain(..) {
            let Some(obs) = obs_weak.upgrade() else {
                continue;
            };
            debug_assert_eq!(obs.state().get(), ObserverState::Disallowed);
            obs.state().set(ObserverState::Unlinked);
            // take a strong node ref before dropping the owning observer
            let observing = obs.observing_packed();
            {
                obs.remove_from_observed_node();
                // remove from all_observers; this finally drops the observer
                let mut ao = self.all_observers.borrow_mut();
                ao.remove(&obs.id());
                drop(obs);
            }
            observing.check_if_unnecessary(self);
        }
    }

    fn stabilise_start(&self) {
        self.status.set(IncrStatus::Stabilising);
        self.add_new_observers();
        self.unlink_disallowed_observers();
    }

    fn stabilise_end(&self) {
        self.stabilisation_num
            .set(self.stabilisation_num.get().add1());
        tracing::trace_span!("set_during_stabilisation").in_scope(|| {
            let mut stack = self.set_during_stabilisation.borrow_mut();
            while let Some(var) = stack.pop() {
                let Some(var) = var.upgrade() else { continue };
                tracing::debug!("set_during_stabilisation: found var {:?}", var.id());
                var.set_var_stabilise_end();
            }
        });
        /* A var can be in both the set_during_stabilisation stack and the
        dead_vars stack; that is fine. Being in dead_vars means it will never
        be set again, as the public::Var is gone and nobody can reach it. So
        severing the Var's reference to its watch node here is safe: the last
        use of that reference was set_var_stabilise_end above. */
        tracing::trace_span!("dead_vars").in_scope(|| {
            // double buffering handles Var<Var<..>>
            let mut alt = self.dead_vars_alt.borrow_mut();
            loop {
                let mut stack = self.dead_vars.borrow_mut();
                if stack.is_empty() {
                    break;
                }
                // swap the vecs, not the RefMuts
                std::mem::swap(&mut *stack, &mut *alt);
                drop(stack);
                for var in alt.drain(..) {
                    let Some(var) = var.upgrade() else { continue };
                    var.break_rc_cycle();
                }
            }
        });
        tracing::trace_span!("handle_after_stabilisation").in_scope(|| {
            let mut stack = self.handle_after_stabilisation.borrow_mut();
            for node in stack.drain(..).filter_map(|node| node.upgrade()) {
                node.is_in_handle_after_stabilisation().set(false);
                let node_update = node.node_update();
                let mut run_queue = self.run_on_update_handlers.borrow_mut();
                run_queue.push((node.weak(), node_update))
            }
        });
        tracing::trace_span!("run_on_update_handlers").in_scope(|| {
            self.status.set(IncrStatus::RunningOnUpdateHandlers);
            let now = self.stabilisation_num.get();
            let mut stack = self.run_on_update_handlers.borrow_mut();
            for (node, node_update) in stack
                .drain(..)
                .filter_map(|(node, node_update)| node.upgrade().map(|n| (n, node_update)))
            {
                node.run_on_update_handlers(node_update, now)
            }
        });
        self.status.set(IncrStatus::NotStabilising);
        if config::debug() {
            self.invariant();
        }
    }

    /// True when there is nothing left to do. Lets callers find a fixed
    /// point in a computation that sets variables during stabilisation.
    pub(crate) fn is_stable(&self) -> bool {
        self.recompute_heap.is_empty()
            && self.dead_vars.borrow().is_empty()
            && self.new_observers.borrow().is_empty()
    }

    pub(crate) fn stabilise(&self) {
        let span = tracing::debug_span!("stabilise");
        span.in_scope(|| {
            assert_eq!(self.status.get(), IncrStatus::NotStabilising);
            self.stabilise_start();
            while let Some(mut frontier) = self.recompute_heap.remove_min_layer() {
                for node in frontier.drain(..) {
                    /* Everything in the frontier was stale and necessary when
                    it was queued, but recomputing an earlier frontier entry
                    can restructure the graph under a later one (invalidate
                    it, disconnect it, or compute it directly), so re-check. */
                    if node.needs_to_be_computed() {
                        node.recompute(self);
                    }
                }
            }
            self.stabilise_end();
        });
    }

    pub(crate) fn propagate_invalidity(&self) {
        while let Some(node) = {
            let mut pi = self.propagate_invalidity.borrow_mut();
            pi.pop()
        } {
            let Some(node) = node.upgrade() else { continue };
            if node.is_valid() {
                if node.should_be_invalidated() {
                    node.invalidate_node(self);
                } else {
                    /* [needs_to_be_computed node] is true because
                    - the node is necessary: children only point at necessary
                      parents;
                    - the node is stale: either the invalidation was caused by
                      its lhs changing (the newer lhs-change node makes it
                      stale), or a child was invalidated this cycle (that
                      child's changed_at is the current stabilisation number),
                      or the node just became necessary and connected to an
                      already-invalid child (that child changed after our last
                      recomputation, else we would have been invalidated back
                      then). */
                    debug_assert!(node.needs_to_be_computed());
                    if !node.is_in_recompute_heap() {
                        self.recompute_heap.insert(node);
                    }
                }
            }
        }
    }

    pub(crate) fn unsubscribe(&self, token: SubscriptionToken) {
        let all_obs = self.all_observers.borrow();
        if let Some(obs) = all_obs.get(&token.observer_id()) {
            obs.unsubscribe_erased(token);
        }
    }

    pub(crate) fn is_stabilising(&self) -> bool {
        self.status.get() != IncrStatus::NotStabilising
    }

    pub(crate) fn set_max_height_allowed(&self, new_max_height: usize) {
        if self.status.get() == IncrStatus::Stabilising {
            panic!("tried to set_max_height_allowed during stabilisation");
        }
        let mut ah_heap = self.adjust_heights_heap.borrow_mut();
        ah_heap.set_max_height_allowed(new_max_height);
        drop(ah_heap);
        self.recompute_heap.set_max_height_allowed(new_max_height);
    }

    pub(crate) fn set_height(&self, node: crate::NodeRef, height: i32) {
        let mut ah_heap = self.adjust_heights_heap.borrow_mut();
        ah_heap.set_height(&node, height);
    }

    pub(crate) fn save_dot_to_file(&self, named: &str) {
        let observers = self.all_observers.borrow();
        let mut all_observed = observers.values().map(|o| o.observing_erased());
        crate::node::save_dot_to_file(&mut all_observed, named).unwrap();
    }

    pub(crate) fn save_dot_to_string(&self) -> String {
        let observers = self.all_observers.borrow();
        let mut all_observed = observers.values().map(|o| o.observing_erased());
        let mut buf = String::new();
        crate::node::save_dot(&mut buf, &mut all_observed).unwrap();
        buf
    }

    pub(crate) fn destroy(&self) {
        let mut dead_vars = self.dead_vars.take();
        for var in dead_vars.drain(..).filter_map(|x| x.upgrade()) {
            var.break_rc_cycle();
        }
        for obs in self.all_observers.borrow().values() {
            let state = obs.state().get();
            if state == ObserverState::InUse || state == ObserverState::Created {
                obs.disallow_future_use(self);
            }
        }
        self.unlink_disallowed_observers();
        self.all_observers.take().clear();
        self.disallowed_observers.take().clear();
        self.recompute_heap.clear();
        self.adjust_heights_heap.borrow_mut().clear();
    }
}

impl Invariant for State {
    fn invariant(&self) {
        assert_eq!(self.status.get(), IncrStatus::NotStabilising);
        self.adjust_heights_heap.borrow().invariant();
        let observers = self.all_observers.borrow();
        let mut roots = observers.values().map(|o| o.observing_erased());
        crate::node::iter_descendants_internal(&mut roots, &mut |node| node.invariant());
    }
}

impl Drop for State {
    fn drop(&mut self) {
        tracing::debug!("destroying incremental state");
        self.destroy();
    }
}
