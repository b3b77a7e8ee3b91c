use core::fmt::Debug;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::fmt::{self, Write};
use std::ops::ControlFlow;
use std::rc::{Rc, Weak};

use smallvec::{smallvec, SmallVec};

use crate::adjust_heights_heap::AdjustHeightsHeap;
use crate::config;
use crate::cutoff::Cutoff;
use crate::internal_observer::{ObserverId, StrongObserver, WeakObserver};
use crate::kind::{next_interval_after, FreezeNode, Kind, NodeGenerics};
use crate::node_update::{ErasedOnUpdateHandler, NodeUpdateDelayed, OnUpdateHandler};
use crate::scope::Scope;
use crate::stabilisation_num::StabilisationNum;
use crate::state::State;
use crate::{CellIncrement, NodeRef, Value, WeakNode};

mod id;
pub use self::id::NodeId;

pub(crate) struct Node<G: NodeGenerics> {
    pub id: NodeId,

    /* The fields from [recomputed_at] to [created_in] are grouped together
    and are in the same order as they are used by [State::recompute]. This
    has a positive performance impact due to cache effects. Don't change the
    order of these fields without performance testing. */
    // {{{
    /// The time at which we were last recomputed. -1 if never.
    pub recomputed_at: Cell<StabilisationNum>,
    /// Absent until the first recomputation, cleared again on invalidation.
    pub value_opt: RefCell<Option<G::R>>,
    /// What this node computes and who its children are. Mutable, but only
    /// along the restructuring edges (invalidate, snapshot->freeze,
    /// freeze->const); use [Node::set_kind] so the child-slot back-index
    /// array is resized along with it.
    pub kind: RefCell<Kind<G>>,
    /// Determines whether we set `changed_at = recomputed_at` during
    /// recomputation, which in turn determines whether our parents are stale
    /// and need recomputing themselves.
    pub cutoff: RefCell<Cutoff<G::R>>,
    /// The time at which our value last changed; -1 if never. Cutoff means
    /// changed_at stays put while recomputed_at advances.
    pub changed_at: Cell<StabilisationNum>,
    /// Our own handlers plus the handlers of every linked observer. Used
    /// during stabilisation to decide whether to put this node on the
    /// after-stabilisation handler queue at all.
    pub num_on_update_handlers: Cell<i32>,
    /// Most nodes have exactly one parent, so the parent array has one
    /// inline slot and only hits the allocator beyond that. The same parent
    /// may legitimately appear twice (e.g. `map2(n, n, ..)`).
    pub parents: RefCell<SmallVec<[WeakNode; 1]>>,
    /// Scope the node was created in. Never modified.
    pub created_in: Scope,
    // }}}
    /// A handy reference to ourselves, from which we can make Weak or Rc
    /// versions of our own trait objects at any time.
    pub weak_self: Weak<Self>,
    pub weak_state: Weak<State>,

    pub parent_child_indices: RefCell<ParentChildIndices>,
    /// Present only during a stabilisation, and only when
    /// `num_on_update_handlers > 0`: the pre-stabilisation value, so update
    /// handlers can see both sides of a change. Cleared after dispatch.
    pub old_value_opt: RefCell<Option<G::R>>,
    pub height: Cell<i32>,
    /// The recompute-heap bucket we currently sit in; -1 iff not in the
    /// heap. At most `height`; transiently less during height adjustment.
    pub height_in_recompute_heap: Cell<i32>,
    /// The pre-adjustment height while queued in the adjust-heights heap;
    /// -1 iff not queued there.
    pub height_in_adjust_heights_heap: Cell<i32>,
    /// Guards against double-enqueueing onto the post-stabilisation handler
    /// queue.
    pub is_in_handle_after_stabilisation: Cell<bool>,
    pub force_necessary: Cell<bool>,

    /// A node knows its own observers. To schedule a notification at the end
    /// of stabilisation, all you need to do is add the node to a queue.
    pub observers: RefCell<HashMap<ObserverId, WeakObserver>>,
    /// Newest first: handlers are prepended and dispatched from the front.
    pub on_update_handlers: RefCell<Vec<ErasedOnUpdateHandler>>,
    pub user_info: RefCell<Option<Box<dyn Debug>>>,
    pub creation_backtrace: Option<Backtrace>,
}

/// Recall that parents and children feel a bit backwards here. A child is an
/// input of self; a parent is a node derived from self.
#[derive(Debug)]
pub(crate) struct ParentChildIndices {
    /// For each of our child slots, at which index of that child's parent
    /// array do they know us? Length always equals
    /// `kind.max_num_children()`; -1 for unlinked slots.
    pub my_parent_index_in_child_at_index: SmallVec<[i32; 2]>,
    /// For each of our parents, which of their child slots holds us? Grows
    /// in lockstep with the parent array.
    pub my_child_index_in_parent_at_index: SmallVec<[i32; 1]>,
}

pub(crate) type Input<R> = Rc<dyn Incremental<R>>;

/// The typed face of a node: everything that needs to know the value type
/// `R`. The rest of the engine works through [ErasedNode].
pub(crate) trait Incremental<R>: ErasedNode + Debug {
    fn as_input(&self) -> Input<R>;
    fn latest(&self) -> R;
    fn value_opt(&self) -> Option<R>;
    fn value_as_ref(&self) -> Option<Ref<R>>;
    fn constant(&self) -> Option<R>;
    fn set_cutoff(&self, cutoff: Cutoff<R>);
    fn get_cutoff(&self) -> Cutoff<R>;
    fn add_observer(&self, id: ObserverId, weak: WeakObserver);
    fn remove_observer(&self, id: ObserverId);
    fn add_on_update_handler(&self, handler: OnUpdateHandler<R>);
    fn set_user_info(&self, info: Box<dyn Debug>);
}

impl<G: NodeGenerics> Incremental<G::R> for Node<G> {
    fn as_input(&self) -> Input<G::R> {
        self.weak_self.upgrade().unwrap() as Input<G::R>
    }
    fn latest(&self) -> G::R {
        let Some(v) = self.value_opt() else {
            panic!(
                "no value in node {:?} ({}); valid: {}, height: {}",
                self.id,
                self.kind_name(),
                self.is_valid(),
                self.height.get(),
            );
        };
        v
    }
    fn value_opt(&self) -> Option<G::R> {
        self.value_as_ref().map(|x| G::R::clone(&x))
    }
    fn value_as_ref(&self) -> Option<Ref<G::R>> {
        let v = self.value_opt.borrow();
        Ref::filter_map(v, |o| o.as_ref()).ok()
    }
    fn constant(&self) -> Option<G::R> {
        match &*self.kind.borrow() {
            Kind::Constant(value) => Some(value.clone()),
            _ => None,
        }
    }
    fn set_cutoff(&self, cutoff: Cutoff<G::R>) {
        self.cutoff.replace(cutoff);
    }
    fn get_cutoff(&self) -> Cutoff<G::R> {
        self.cutoff.borrow().clone()
    }
    fn add_observer(&self, id: ObserverId, weak: WeakObserver) {
        let mut os = self.observers.borrow_mut();
        os.insert(id, weak);
    }
    fn remove_observer(&self, id: ObserverId) {
        let mut os = self.observers.borrow_mut();
        os.remove(&id);
    }
    fn add_on_update_handler(&self, handler: OnUpdateHandler<G::R>) {
        self.num_on_update_handlers.increment();
        let mut handlers = self.on_update_handlers.borrow_mut();
        handlers.insert(0, Box::new(handler));
    }
    fn set_user_info(&self, info: Box<dyn Debug>) {
        self.user_info.borrow_mut().replace(info);
    }
}

/// The type-erased face of a node, as stored in parent arrays, heaps and
/// observer records. The engine never reads a value through this view except
/// as `dyn Any` for handler dispatch.
pub(crate) trait ErasedNode: Debug {
    fn id(&self) -> NodeId;
    fn weak_state(&self) -> &Weak<State>;
    fn kind_name(&self) -> &'static str;
    fn is_valid(&self) -> bool;
    fn is_const(&self) -> bool;
    fn value_as_any(&self) -> Option<Ref<dyn Any>>;
    fn old_value_as_any(&self) -> Option<Ref<dyn Any>>;
    fn should_be_invalidated(&self) -> bool;
    fn has_invalid_child(&self) -> bool;
    fn has_child(&self, child: &WeakNode) -> bool;
    fn has_parent(&self, parent: &WeakNode) -> bool;
    fn height(&self) -> i32;
    /// Only for use from the adjust-heights heap.
    fn set_height(&self, height: i32);
    fn height_in_recompute_heap(&self) -> &Cell<i32>;
    fn height_in_adjust_heights_heap(&self) -> &Cell<i32>;
    fn is_in_handle_after_stabilisation(&self) -> &Cell<bool>;
    fn ensure_parent_height_requirements(
        &self,
        ahh: &mut AdjustHeightsHeap,
        original_child: &NodeRef,
        original_parent: &NodeRef,
    );
    fn adjust_heights_bind_lhs_change(
        &self,
        ahh: &mut AdjustHeightsHeap,
        oc: &NodeRef,
        op: &NodeRef,
    );
    fn is_stale(&self) -> bool;
    fn is_stale_with_respect_to_a_child(&self) -> bool;
    fn edge_is_stale(&self, parent: &dyn ErasedNode) -> bool;
    fn is_necessary(&self) -> bool;
    fn force_necessary(&self) -> &Cell<bool>;
    fn needs_to_be_computed(&self) -> bool;
    fn became_necessary(&self, state: &State);
    fn became_necessary_propagate(&self, state: &State);
    fn became_unnecessary(&self, state: &State);
    fn check_if_unnecessary(&self, state: &State);
    fn is_in_recompute_heap(&self) -> bool;
    fn is_in_adjust_heights_heap(&self) -> bool;
    fn recompute(&self, state: &State);
    fn recompute_one(&self, state: &State) -> Option<NodeRef>;
    fn parent_iter_can_recompute_now(&self, child: &dyn ErasedNode, state: &State) -> bool;
    fn parent_child_indices(&self) -> &RefCell<ParentChildIndices>;
    fn state_opt(&self) -> Option<Rc<State>>;
    fn state(&self) -> Rc<State>;
    fn weak(&self) -> WeakNode;
    fn packed(&self) -> NodeRef;
    fn erased(&self) -> &(dyn ErasedNode + '_);
    fn num_parents(&self) -> usize;
    fn get_parent(&self, parent_index: usize) -> NodeRef;
    fn iteri_parents(&self, f: &mut dyn FnMut(i32, &NodeRef));
    fn max_num_children(&self) -> usize;
    fn max_num_parents(&self) -> usize;
    fn foreach_child(&self, f: &mut dyn FnMut(i32, NodeRef));
    fn slow_get_child(&self, child_index: i32) -> NodeRef;
    fn iter_descendants_internal_one(
        &self,
        seen: &mut HashMap<NodeId, i32>,
        f: &mut dyn FnMut(&NodeRef),
    );
    fn recomputed_at(&self) -> &Cell<StabilisationNum>;
    fn changed_at(&self) -> &Cell<StabilisationNum>;
    fn invalidate_node(&self, state: &State);
    fn created_in(&self) -> Scope;
    fn run_on_update_handlers(&self, node_update: NodeUpdateDelayed, now: StabilisationNum);
    fn maybe_handle_after_stabilisation(&self, state: &State);
    fn handle_after_stabilisation(&self, state: &State);
    fn num_on_update_handlers(&self) -> &Cell<i32>;
    fn node_update(&self) -> NodeUpdateDelayed;
    fn iter_observers(&self, f: &mut dyn FnMut(&StrongObserver));
    fn child_changed(&self, child: &dyn ErasedNode, child_index: i32, old_value_opt: Option<&dyn Any>);
    fn change_child(
        &self,
        old_child: Option<NodeRef>,
        new_child: NodeRef,
        child_index: i32,
        state: &State,
    );
    fn add_parent_without_adjusting_heights(
        &self,
        child_index: i32,
        parent_ref: &dyn ErasedNode,
        state: &State,
    );
    fn state_add_parent(&self, child_index: i32, parent_ref: &dyn ErasedNode, state: &State);
    fn remove_parent(&self, child_index: i32, parent_ref: &dyn ErasedNode);
    fn alarm_fired(&self, state: &State);
    fn invariant(&self);
    fn dot_label(&self, f: &mut dyn Write) -> fmt::Result;
    fn dot_node(&self, f: &mut dyn Write, name: &str) -> fmt::Result;
    fn dot_add_bind_edges(&self, bind_edges: &mut Vec<(NodeRef, NodeRef)>);
    fn dot_was_changed(&self) -> bool;
}

impl<G: NodeGenerics> Debug for Node<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &*self.kind.borrow())
            .field("height", &self.height.get())
            .finish()
    }
}

impl dyn ErasedNode + '_ {
    pub(crate) fn ptr_eq(&self, other: &dyn ErasedNode) -> bool {
        self.weak().ptr_eq(&other.weak())
    }

    /// Identity: two handles name the same node.
    pub(crate) fn same(&self, other: &dyn ErasedNode) -> bool {
        self.ptr_eq(other)
    }

    pub(crate) fn fold_observers<Acc>(
        &self,
        init: Acc,
        mut f: impl FnMut(Acc, &StrongObserver) -> Acc,
    ) -> Acc {
        let mut acc = Some(init);
        self.iter_observers(&mut |obs| {
            let prev = acc.take().unwrap();
            acc = Some(f(prev, obs));
        });
        acc.unwrap()
    }
}

impl<G: NodeGenerics> ErasedNode for Node<G> {
    fn id(&self) -> NodeId {
        self.id
    }
    fn weak_state(&self) -> &Weak<State> {
        &self.weak_state
    }
    fn kind_name(&self) -> &'static str {
        self.kind.borrow().name()
    }
    fn is_valid(&self) -> bool {
        !matches!(&*self.kind.borrow(), Kind::Invalid)
    }
    fn is_const(&self) -> bool {
        matches!(&*self.kind.borrow(), Kind::Constant(_))
    }
    fn value_as_any(&self) -> Option<Ref<dyn Any>> {
        let v = self.value_opt.borrow();
        Ref::filter_map(v, |o| o.as_ref().map(|v| v.as_any())).ok()
    }
    fn old_value_as_any(&self) -> Option<Ref<dyn Any>> {
        let v = self.old_value_opt.borrow();
        Ref::filter_map(v, |o| o.as_ref().map(|v| v.as_any())).ok()
    }
    fn should_be_invalidated(&self) -> bool {
        let kind = self.kind.borrow();
        match &*kind {
            Kind::Uninitialised => panic!("queried the validity of an uninitialised node"),
            Kind::Invalid => false,
            Kind::Constant(_) | Kind::Var(_) => false,
            Kind::At { .. } | Kind::AtIntervals { .. } => false,
            Kind::Snapshot(_) | Kind::StepFunction(_) => false,
            Kind::Map(..)
            | Kind::Map2(..)
            | Kind::Map3(..)
            | Kind::Map4(..)
            | Kind::Map5(..)
            | Kind::Map6(..)
            | Kind::Map7(..)
            | Kind::Map8(..)
            | Kind::Map9(..)
            | Kind::ArrayFold(..)
            | Kind::UnorderedArrayFold(..)
            | Kind::Freeze(..) => self.has_invalid_child(),
            /* A *_change node is invalid if the node it is watching for
            changes is invalid (same reason as above). This is equivalent to
            [has_invalid_child t]. */
            Kind::BindLhsChange { bind, .. } => !bind.lhs.is_valid(),
            Kind::IfTestChange { if_, .. } => !if_.test.is_valid(),
            Kind::JoinLhsChange { join, .. } => !join.lhs.is_valid(),
            /* [BindMain], [IfThenElse] and [JoinMain] are invalid if their
            *_change child is, but not necessarily if their other children
            are -- the graph may be restructured to avoid the invalidity of
            those. */
            Kind::BindMain { lhs_change, .. } => !lhs_change.is_valid(),
            Kind::IfThenElse { test_change, .. } => !test_change.is_valid(),
            Kind::JoinMain { lhs_change, .. } => !lhs_change.is_valid(),
        }
    }
    fn has_invalid_child(&self) -> bool {
        self.any_child(&|_ix, child| !child.is_valid())
    }
    fn has_child(&self, child: &WeakNode) -> bool {
        let Some(upgraded) = child.upgrade() else {
            return false;
        };
        self.any_child(&|_ix, c| crate::rc_thin_ptr_eq(&c, &upgraded))
    }
    fn has_parent(&self, parent: &WeakNode) -> bool {
        self.parents
            .borrow()
            .iter()
            .any(|p| crate::weak_thin_ptr_eq(p, parent))
    }
    fn height(&self) -> i32 {
        self.height.get()
    }
    fn set_height(&self, height: i32) {
        tracing::trace!("{:?} set height to {height}", self.id);
        self.height.set(height);
    }
    fn height_in_recompute_heap(&self) -> &Cell<i32> {
        &self.height_in_recompute_heap
    }
    fn height_in_adjust_heights_heap(&self) -> &Cell<i32> {
        &self.height_in_adjust_heights_heap
    }
    fn is_in_handle_after_stabilisation(&self) -> &Cell<bool> {
        &self.is_in_handle_after_stabilisation
    }
    fn ensure_parent_height_requirements(
        &self,
        ahh: &mut AdjustHeightsHeap,
        original_child: &NodeRef,
        original_parent: &NodeRef,
    ) {
        let ps = self.parents.borrow();
        for parent in ps.iter() {
            let parent = parent.upgrade().unwrap();
            ahh.ensure_height_requirement(original_child, original_parent, &self.packed(), &parent);
        }
    }
    fn adjust_heights_bind_lhs_change(
        &self,
        ahh: &mut AdjustHeightsHeap,
        oc: &NodeRef,
        op: &NodeRef,
    ) {
        if let Kind::BindLhsChange { bind, .. } = &*self.kind.borrow() {
            let all = bind.all_nodes_created_on_rhs.borrow();
            for rnode_weak in all.iter() {
                let Some(rnode) = rnode_weak.upgrade() else {
                    continue;
                };
                if rnode.is_necessary() {
                    ahh.ensure_height_requirement(oc, op, &self.packed(), &rnode)
                }
            }
        }
    }
    fn is_stale(&self) -> bool {
        let kind = self.kind.borrow();
        match &*kind {
            Kind::Uninitialised => panic!("queried the staleness of an uninitialised node"),
            /* Invalid nodes never re-enter the recompute heap. */
            Kind::Invalid => false,
            Kind::Var(var) => {
                let set_at = var.set_at.get();
                let recomputed_at = self.recomputed_at.get();
                set_at > recomputed_at
            }
            /* Leaves: stale only until first computed. The time-based leaves
            re-enter this state whenever their alarm fires. */
            Kind::Constant(_)
            | Kind::At { .. }
            | Kind::AtIntervals { .. }
            | Kind::Snapshot(_)
            | Kind::StepFunction(_) => self.recomputed_at.get().is_never(),
            /* Every children-bearing kind: never recomputed, or a child has
            changed more recently than our last recomputation. */
            Kind::Map(..)
            | Kind::Map2(..)
            | Kind::Map3(..)
            | Kind::Map4(..)
            | Kind::Map5(..)
            | Kind::Map6(..)
            | Kind::Map7(..)
            | Kind::Map8(..)
            | Kind::Map9(..)
            | Kind::ArrayFold(..)
            | Kind::UnorderedArrayFold(..)
            | Kind::Freeze(..)
            | Kind::BindLhsChange { .. }
            | Kind::BindMain { .. }
            | Kind::IfTestChange { .. }
            | Kind::IfThenElse { .. }
            | Kind::JoinLhsChange { .. }
            | Kind::JoinMain { .. } => {
                self.recomputed_at.get().is_never() || self.is_stale_with_respect_to_a_child()
            }
        }
    }
    fn is_stale_with_respect_to_a_child(&self) -> bool {
        self.any_child(&|_ix, child| child.changed_at().get() > self.recomputed_at.get())
    }
    fn edge_is_stale(&self, parent: &dyn ErasedNode) -> bool {
        self.changed_at.get() > parent.recomputed_at().get()
    }
    fn is_necessary(&self) -> bool {
        !self.parents.borrow().is_empty()
            || !self.observers.borrow().is_empty()
            || matches!(&*self.kind.borrow(), Kind::Freeze(_))
            || self.force_necessary.get()
    }
    fn force_necessary(&self) -> &Cell<bool> {
        &self.force_necessary
    }
    fn needs_to_be_computed(&self) -> bool {
        self.is_necessary() && self.is_stale()
    }
    // Used for `freeze`, `add_observers`.
    fn became_necessary_propagate(&self, state: &State) {
        self.became_necessary(state);
        state.propagate_invalidity();
    }
    fn became_necessary(&self, state: &State) {
        if self.is_valid() && !self.created_in.is_necessary() {
            panic!("trying to make a node necessary whose defining bind is not necessary");
        }
        tracing::debug!("node {:?} became necessary", self.id);
        state.num_nodes_became_necessary.increment();
        self.maybe_handle_after_stabilisation(state);
        /* Since [node] became necessary, to restore the invariant, we need
        to:
        - add parent pointers to [node] from its children,
        - set [node]'s height,
        - add [node] to the recompute heap, if necessary. */
        state.set_height(self.packed(), self.created_in.height() + 1);
        let h = &Cell::new(self.height());
        let pdyn = self.as_parent_dyn_ref();
        self.foreach_child(&mut move |index, child| {
            child.add_parent_without_adjusting_heights(index, pdyn, state);
            if child.height() >= h.get() {
                h.set(child.height() + 1);
            }
        });
        state.set_height(self.packed(), h.get());
        debug_assert!(!self.is_in_recompute_heap());
        debug_assert!(self.is_necessary());
        if self.is_stale() {
            state.recompute_heap.insert(self.packed());
        }
    }
    fn check_if_unnecessary(&self, state: &State) {
        if !self.is_necessary() {
            self.became_unnecessary(state);
        }
    }
    fn became_unnecessary(&self, state: &State) {
        tracing::debug!("node {:?} became unnecessary", self.id);
        state.num_nodes_became_unnecessary.increment();
        self.maybe_handle_after_stabilisation(state);
        state.set_height(self.packed(), -1);
        self.remove_children(state);
        if let Kind::UnorderedArrayFold(uaf) = &*self.kind.borrow() {
            /* With the parent edges gone, child changes stop flowing into the
            cached fold value, so it must be rebuilt from scratch if this node
            ever comes back. */
            uaf.force_full_compute();
        }
        debug_assert!(!self.needs_to_be_computed());
        if self.is_in_recompute_heap() {
            state.recompute_heap.remove(self.packed());
        }
    }
    fn is_in_recompute_heap(&self) -> bool {
        self.height_in_recompute_heap.get() >= 0
    }
    fn is_in_adjust_heights_heap(&self) -> bool {
        self.height_in_adjust_heights_heap.get() >= 0
    }
    fn recomputed_at(&self) -> &Cell<StabilisationNum> {
        &self.recomputed_at
    }
    fn changed_at(&self) -> &Cell<StabilisationNum> {
        &self.changed_at
    }

    fn recompute(&self, state: &State) {
        // A flattened version of what is a tail recursion in spirit: first
        // recompute self, then, as far as can_recompute_now allows, keep
        // recomputing the single-parent chain above us.
        let Some(mut parent) = self.recompute_one(state) else {
            return;
        };
        while let Some(next_parent) = parent.recompute_one(state) {
            parent = next_parent;
        }
    }

    fn recompute_one(&self, state: &State) -> Option<NodeRef> {
        if config::verbose() {
            tracing::debug!(height = %self.height(), id = ?self.id, kind = %self.kind_name(), "recompute");
        } else {
            tracing::trace!(height = %self.height(), id = ?self.id, kind = %self.kind_name(), "recompute");
        }
        state.num_nodes_recomputed.increment();
        self.recomputed_at.set(state.stabilisation_num.get());
        let kind = self.kind.borrow();
        match &*kind {
            Kind::Uninitialised => panic!("recomputing uninitialised node {:?}", self.id),
            /* Invalidation only ever touches nodes higher than the node being
            recomputed, and removes them from the recompute heap, so an
            invalid node here is a structural bug. */
            Kind::Invalid => panic!("recomputing invalid node {:?}", self.id),
            Kind::Constant(v) => {
                let v = v.clone();
                drop(kind);
                self.maybe_change_value(v, state)
            }
            Kind::Var(var) => {
                let v = var.value.borrow().clone();
                drop(kind);
                self.maybe_change_value(v, state)
            }
            Kind::Map(map) => {
                let new_value = {
                    let input = map.input.value_as_ref().unwrap();
                    let mut f = map.mapper.borrow_mut();
                    f(&input)
                };
                drop(kind);
                self.maybe_change_value(new_value, state)
            }
            Kind::Map2(map) => {
                let new_value = {
                    let i1 = map.one.value_as_ref().unwrap();
                    let i2 = map.two.value_as_ref().unwrap();
                    let mut f = map.mapper.borrow_mut();
                    f(&i1, &i2)
                };
                drop(kind);
                self.maybe_change_value(new_value, state)
            }
            Kind::Map3(map) => {
                let new_value = {
                    let i1 = map.one.value_as_ref().unwrap();
                    let i2 = map.two.value_as_ref().unwrap();
                    let i3 = map.three.value_as_ref().unwrap();
                    let mut f = map.mapper.borrow_mut();
                    f(&i1, &i2, &i3)
                };
                drop(kind);
                self.maybe_change_value(new_value, state)
            }
            Kind::Map4(map) => {
                let new_value = {
                    let i1 = map.one.value_as_ref().unwrap();
                    let i2 = map.two.value_as_ref().unwrap();
                    let i3 = map.three.value_as_ref().unwrap();
                    let i4 = map.four.value_as_ref().unwrap();
                    let mut f = map.mapper.borrow_mut();
                    f(&i1, &i2, &i3, &i4)
                };
                drop(kind);
                self.maybe_change_value(new_value, state)
            }
            Kind::Map5(map) => {
                let new_value = {
                    let i1 = map.one.value_as_ref().unwrap();
                    let i2 = map.two.value_as_ref().unwrap();
                    let i3 = map.three.value_as_ref().unwrap();
                    let i4 = map.four.value_as_ref().unwrap();
                    let i5 = map.five.value_as_ref().unwrap();
                    let mut f = map.mapper.borrow_mut();
                    f(&i1, &i2, &i3, &i4, &i5)
                };
                drop(kind);
                self.maybe_change_value(new_value, state)
            }
            Kind::Map6(map) => {
                let new_value = {
                    let i1 = map.one.value_as_ref().unwrap();
                    let i2 = map.two.value_as_ref().unwrap();
                    let i3 = map.three.value_as_ref().unwrap();
                    let i4 = map.four.value_as_ref().unwrap();
                    let i5 = map.five.value_as_ref().unwrap();
                    let i6 = map.six.value_as_ref().unwrap();
                    let mut f = map.mapper.borrow_mut();
                    f(&i1, &i2, &i3, &i4, &i5, &i6)
                };
                drop(kind);
                self.maybe_change_value(new_value, state)
            }
            Kind::Map7(map) => {
                let new_value = {
                    let i1 = map.one.value_as_ref().unwrap();
                    let i2 = map.two.value_as_ref().unwrap();
                    let i3 = map.three.value_as_ref().unwrap();
                    let i4 = map.four.value_as_ref().unwrap();
                    let i5 = map.five.value_as_ref().unwrap();
                    let i6 = map.six.value_as_ref().unwrap();
                    let i7 = map.seven.value_as_ref().unwrap();
                    let mut f = map.mapper.borrow_mut();
                    f(&i1, &i2, &i3, &i4, &i5, &i6, &i7)
                };
                drop(kind);
                self.maybe_change_value(new_value, state)
            }
            Kind::Map8(map) => {
                let new_value = {
                    let i1 = map.one.value_as_ref().unwrap();
                    let i2 = map.two.value_as_ref().unwrap();
                    let i3 = map.three.value_as_ref().unwrap();
                    let i4 = map.four.value_as_ref().unwrap();
                    let i5 = map.five.value_as_ref().unwrap();
                    let i6 = map.six.value_as_ref().unwrap();
                    let i7 = map.seven.value_as_ref().unwrap();
                    let i8 = map.eight.value_as_ref().unwrap();
                    let mut f = map.mapper.borrow_mut();
                    f(&i1, &i2, &i3, &i4, &i5, &i6, &i7, &i8)
                };
                drop(kind);
                self.maybe_change_value(new_value, state)
            }
            Kind::Map9(map) => {
                let new_value = {
                    let i1 = map.one.value_as_ref().unwrap();
                    let i2 = map.two.value_as_ref().unwrap();
                    let i3 = map.three.value_as_ref().unwrap();
                    let i4 = map.four.value_as_ref().unwrap();
                    let i5 = map.five.value_as_ref().unwrap();
                    let i6 = map.six.value_as_ref().unwrap();
                    let i7 = map.seven.value_as_ref().unwrap();
                    let i8 = map.eight.value_as_ref().unwrap();
                    let i9 = map.nine.value_as_ref().unwrap();
                    let mut f = map.mapper.borrow_mut();
                    f(&i1, &i2, &i3, &i4, &i5, &i6, &i7, &i8, &i9)
                };
                drop(kind);
                self.maybe_change_value(new_value, state)
            }
            Kind::ArrayFold(af) => {
                let new_value = af.compute();
                drop(kind);
                self.maybe_change_value(new_value, state)
            }
            Kind::UnorderedArrayFold(uaf) => {
                let new_value = uaf.compute();
                drop(kind);
                self.maybe_change_value(new_value, state)
            }
            Kind::Freeze(freeze) => {
                let child = freeze.child.clone();
                let v = child.latest();
                let freeze_now = (freeze.only_freeze_when.borrow_mut())(&v);
                drop(kind);
                if freeze_now {
                    /* Once frozen we are a constant: drop the child edge and
                    become one. The child enumeration comes from the kind, so
                    the edge must go before the kind does. */
                    self.remove_children(state);
                    self.set_kind(Kind::Constant(v.clone()));
                    if self.is_necessary() {
                        state.set_height(self.packed(), self.created_in.height() + 1);
                    } else {
                        self.became_unnecessary(state);
                    }
                }
                self.maybe_change_value(v, state)
            }
            Kind::BindLhsChange { casts, bind } => {
                let bind = bind.clone();
                let token = casts.r_unit;
                drop(kind);
                // leaves an empty vec for next time
                let mut old_all_nodes_created_on_rhs = bind.all_nodes_created_on_rhs.take();
                let rhs = {
                    let lhs_value = bind.lhs.value_as_ref().unwrap();
                    let old_scope = state.current_scope();
                    *state.current_scope.borrow_mut() = bind.rhs_scope.borrow().clone();
                    let mut f = bind.mapper.borrow_mut();
                    let rhs = f(&lhs_value);
                    *state.current_scope.borrow_mut() = old_scope;
                    // the returned rhs must belong to the same graph
                    assert!(crate::weak_thin_ptr_eq(
                        rhs.node.weak_state(),
                        &state.weak_self
                    ));
                    rhs.node
                };
                let mut old_rhs = Some(rhs.clone());
                {
                    let mut bind_rhs = bind.rhs.borrow_mut();
                    core::mem::swap(&mut *bind_rhs, &mut old_rhs);
                }
                /* Anticipate what [maybe_change_value] will do, to make sure
                the bind main node is stale right away. This way, if the new
                child is invalid, we will satisfy the invariant saying that
                [needs_to_be_computed bind_main] in [propagate_invalidity]. */
                self.changed_at.set(state.stabilisation_num.get());
                {
                    let main_ = bind.main.borrow();
                    if let Some(main) = main_.upgrade() {
                        main.change_child(
                            old_rhs.clone().map(|i| i.packed()),
                            rhs.packed(),
                            Kind::<G>::RHS_CHILD_INDEX,
                            state,
                        );
                    }
                }
                if old_rhs.is_some() {
                    /* We invalidate after [change_child], because invalidation
                    changes the kind to [Invalid], which means we can no
                    longer visit the children. Also, the [old_rhs] nodes are
                    typically made unnecessary by [change_child], and so by
                    invalidating afterwards we will not waste time adding them
                    to the recompute heap and then removing them. */
                    invalidate_nodes_created_on_rhs(&mut old_all_nodes_created_on_rhs, state);
                    state.propagate_invalidity();
                }
                /* [node] was valid at the start of this branch, and
                invalidation only visits higher nodes, so it is still valid. */
                debug_assert!(self.is_valid());
                self.maybe_change_value(token.cast(()), state)
            }
            Kind::BindMain { casts, bind, .. } => {
                let rhs = bind.rhs.borrow().clone().unwrap();
                let token = casts.rhs_r;
                drop(kind);
                self.copy_child(&rhs, token, state)
            }
            Kind::IfTestChange { casts, if_ } => {
                let if_ = if_.clone();
                let token = casts.r_unit;
                drop(kind);
                let test = *if_.test.value_as_ref().unwrap();
                let new_branch = if test {
                    if_.then_.clone()
                } else {
                    if_.else_.clone()
                };
                let old_branch = if_.current_branch.borrow_mut().replace(new_branch.clone());
                self.changed_at.set(state.stabilisation_num.get());
                {
                    let main_ = if_.main.borrow();
                    if let Some(main) = main_.upgrade() {
                        main.change_child(
                            old_branch.map(|i| i.packed()),
                            new_branch.packed(),
                            Kind::<G>::RHS_CHILD_INDEX,
                            state,
                        );
                    }
                }
                self.maybe_change_value(token.cast(()), state)
            }
            Kind::IfThenElse { casts, if_, .. } => {
                let branch = if_.current_branch.borrow().clone().unwrap();
                let token = casts.branch_r;
                drop(kind);
                self.copy_child(&branch, token, state)
            }
            Kind::JoinLhsChange { casts, join } => {
                let join = join.clone();
                let token = casts.r_unit;
                drop(kind);
                let inner = join.lhs.value_as_ref().unwrap().clone();
                let new_rhs = inner.node;
                let old_rhs = join.rhs.borrow_mut().replace(new_rhs.clone());
                self.changed_at.set(state.stabilisation_num.get());
                {
                    let main_ = join.main.borrow();
                    if let Some(main) = main_.upgrade() {
                        main.change_child(
                            old_rhs.map(|i| i.packed()),
                            new_rhs.packed(),
                            Kind::<G>::RHS_CHILD_INDEX,
                            state,
                        );
                    }
                }
                self.maybe_change_value(token.cast(()), state)
            }
            Kind::JoinMain { casts, join, .. } => {
                let rhs = join.rhs.borrow().clone().unwrap();
                let token = casts.rhs_r;
                drop(kind);
                self.copy_child(&rhs, token, state)
            }
            Kind::At { at, casts } => {
                let v = if at.clock.now() >= at.at {
                    crate::kind::BeforeOrAfter::After
                } else {
                    crate::kind::BeforeOrAfter::Before
                };
                let token = casts.r;
                drop(kind);
                self.maybe_change_value(token.cast(v), state)
            }
            Kind::AtIntervals { casts, .. } => {
                let token = casts.r_unit;
                drop(kind);
                self.maybe_change_value(token.cast(()), state)
            }
            Kind::Snapshot(snap) => {
                // Before the snapshot time this node yields `before`; the
                // alarm restructures it into a freeze of the child.
                let v = snap.before.clone();
                drop(kind);
                self.maybe_change_value(v, state)
            }
            Kind::StepFunction(sf) => {
                let v = sf.value_at(sf.clock.now()).clone();
                drop(kind);
                self.maybe_change_value(v, state)
            }
        }
    }

    /// Returns true if the parent (self) can be recomputed immediately.
    /// If it returns false, the parent has been put in the recompute heap.
    fn parent_iter_can_recompute_now(&self, child: &dyn ErasedNode, state: &State) -> bool {
        let parent = self;
        let kind = parent.kind.borrow();
        let can_recompute_now = match &*kind {
            Kind::Uninitialised => panic!("uninitialised node used as a parent"),
            Kind::Invalid => false,
            // these kinds are leaves; they are never parents
            Kind::Constant(_)
            | Kind::Var(_)
            | Kind::At { .. }
            | Kind::AtIntervals { .. }
            | Kind::Snapshot(_)
            | Kind::StepFunction(_) => panic!("leaf node used as a parent"),
            // these have more than one child; other children may need to
            // stabilise first
            Kind::Map2(..)
            | Kind::Map3(..)
            | Kind::Map4(..)
            | Kind::Map5(..)
            | Kind::Map6(..)
            | Kind::Map7(..)
            | Kind::Map8(..)
            | Kind::Map9(..)
            | Kind::ArrayFold(..)
            | Kind::UnorderedArrayFold(..) => false,
            /* We can immediately recompute [parent] if no other node needs
            to be stable before computing it. If [parent] has a single child
            (i.e. [node]), this amounts to checking that [parent] will not be
            invalidated, i.e. that [parent]'s scope has already stabilised. */
            Kind::Map(_)
            | Kind::Freeze(_)
            | Kind::BindLhsChange { .. }
            | Kind::IfTestChange { .. }
            | Kind::JoinLhsChange { .. } => child.height() > parent.created_in.height(),
            /* For these, we need to check that the change-sentinel child has
            already been evaluated (if needed). If so, this also implies that
            [node.height > Scope.height parent.created_in]. */
            Kind::BindMain { lhs_change, .. } => child.height() > lhs_change.height(),
            Kind::IfThenElse { test_change, .. } => child.height() > test_change.height(),
            Kind::JoinMain { lhs_change, .. } => child.height() > lhs_change.height(),
        };
        drop(kind);
        if can_recompute_now || parent.height() <= state.recompute_heap.min_height() {
            /* If [parent.height] is at or below the height of all nodes in
            the recompute heap (possibly because the heap is empty), then we
            can recompute [parent] immediately and save adding it to and then
            removing it from the recompute heap. */
            tracing::trace!("can_recompute_now {:?}", parent.id);
            true
        } else {
            // we already know that !parent.is_in_recompute_heap()
            debug_assert!(parent.needs_to_be_computed());
            debug_assert!(!parent.is_in_recompute_heap());
            state.recompute_heap.insert(parent.packed());
            false
        }
    }

    fn parent_child_indices(&self) -> &RefCell<ParentChildIndices> {
        &self.parent_child_indices
    }
    fn state_opt(&self) -> Option<Rc<State>> {
        self.weak_state.upgrade()
    }
    fn state(&self) -> Rc<State> {
        self.weak_state.upgrade().unwrap()
    }
    fn weak(&self) -> WeakNode {
        self.weak_self.clone() as WeakNode
    }
    fn packed(&self) -> NodeRef {
        self.weak_self.upgrade().unwrap() as NodeRef
    }
    fn erased(&self) -> &(dyn ErasedNode + '_) {
        self
    }
    fn num_parents(&self) -> usize {
        self.parents.borrow().len()
    }
    fn get_parent(&self, parent_index: usize) -> NodeRef {
        let parents = self.parents.borrow();
        let Some(parent) = parents.get(parent_index) else {
            panic!(
                "get_parent: index {parent_index} out of bounds (node {:?} has {} parents)",
                self.id,
                parents.len()
            );
        };
        parent.upgrade().unwrap()
    }
    fn iteri_parents(&self, f: &mut dyn FnMut(i32, &NodeRef)) {
        let parents = self.parents.borrow();
        for (ix, parent) in parents.iter().enumerate() {
            if let Some(parent) = parent.upgrade() {
                f(ix as i32, &parent);
            }
        }
    }
    fn max_num_children(&self) -> usize {
        self.kind.borrow().max_num_children()
    }
    fn max_num_parents(&self) -> usize {
        self.parent_child_indices
            .borrow()
            .my_child_index_in_parent_at_index
            .len()
    }
    fn foreach_child(&self, f: &mut dyn FnMut(i32, NodeRef)) {
        self.kind.borrow().iteri_children(f)
    }
    fn slow_get_child(&self, child_index: i32) -> NodeRef {
        self.kind.borrow().slow_get_child(child_index)
    }
    fn iter_descendants_internal_one(
        &self,
        seen: &mut HashMap<NodeId, i32>,
        f: &mut dyn FnMut(&NodeRef),
    ) {
        if let std::collections::hash_map::Entry::Vacant(e) = seen.entry(self.id) {
            e.insert(self.height.get());
            f(&self.packed());
            self.foreach_child(&mut |_ix, child| child.iter_descendants_internal_one(seen, f))
        }
    }

    fn invalidate_node(&self, state: &State) {
        if !self.is_valid() {
            return;
        }
        tracing::debug!("invalidating node {:?}", self.id);
        self.maybe_handle_after_stabilisation(state);
        self.value_opt.take();
        self.old_value_opt.take();
        self.changed_at.set(state.stabilisation_num.get());
        self.recomputed_at.set(state.stabilisation_num.get());
        state.num_nodes_invalidated.increment();
        if self.is_necessary() {
            self.remove_children(state);
            /* The node doesn't have children anymore, so we can lower its
            height as much as possible, to one greater than the scope it was
            created in. Also, because we are lowering the height, we don't
            need to adjust any of its ancestors' heights. We could leave the
            height alone, but we may as well lower it as much as possible to
            avoid making the heights of any future ancestors unnecessarily
            large. */
            let h = self.created_in.height() + 1;
            state.set_height(self.packed(), h);
            /* We don't change [node.created_in]; the node stays in the scope
            it was created in, and if that scope is ever invalidated, its
            node list is drained there. */
        }
        /* Take the kind out (leaving the transient hole) so a bind main can
        drain its rhs scope before the payload is dropped. */
        let old_kind = self.kind.replace(Kind::Uninitialised);
        if let Kind::BindMain { bind, .. } = &old_kind {
            let mut all = bind.all_nodes_created_on_rhs.borrow_mut();
            invalidate_nodes_created_on_rhs(&mut all, state);
        }
        drop(old_kind);
        self.set_kind(Kind::Invalid);
        {
            let mut prop_stack = state.propagate_invalidity.borrow_mut();
            for parent in self.parents.borrow().iter() {
                let Some(parent) = parent.upgrade() else {
                    continue;
                };
                prop_stack.push(parent.weak());
            }
        }
        debug_assert!(!self.needs_to_be_computed());
        if self.is_in_recompute_heap() {
            state.recompute_heap.remove(self.packed());
        }
    }

    fn created_in(&self) -> Scope {
        self.created_in.clone()
    }

    fn run_on_update_handlers(&self, node_update: NodeUpdateDelayed, now: StabilisationNum) {
        tracing::trace!("run_on_update_handlers {:?} {:?}", self.id, node_update);
        // Freeze the current list: handlers added during the dispatch run in
        // a later dispatch, not this one.
        let mut frozen = std::mem::take(&mut *self.on_update_handlers.borrow_mut());
        for handler in frozen.iter_mut() {
            handler.run(self.erased(), node_update, now);
        }
        {
            let mut handlers = self.on_update_handlers.borrow_mut();
            // handlers added during the drain were prepended to the now-empty
            // list; keep them in front of the frozen ones
            handlers.extend(frozen);
        }
        let observers: Vec<StrongObserver> = {
            let os = self.observers.borrow();
            os.values().filter_map(Weak::upgrade).collect()
        };
        for obs in observers {
            obs.run_all(self.erased(), node_update, now);
        }
        // the old value only lives for the duration of the dispatch
        self.old_value_opt.take();
    }

    #[inline]
    fn maybe_handle_after_stabilisation(&self, state: &State) {
        if self.num_on_update_handlers.get() > 0 {
            self.handle_after_stabilisation(state);
        }
    }

    fn handle_after_stabilisation(&self, state: &State) {
        let is_in_stack = &self.is_in_handle_after_stabilisation;
        if !is_in_stack.get() {
            is_in_stack.set(true);
            let mut stack = state.handle_after_stabilisation.borrow_mut();
            stack.push(self.weak());
        }
    }

    fn num_on_update_handlers(&self) -> &Cell<i32> {
        &self.num_on_update_handlers
    }

    fn node_update(&self) -> NodeUpdateDelayed {
        if !self.is_valid() {
            NodeUpdateDelayed::Invalidated
        } else if !self.is_necessary() {
            NodeUpdateDelayed::Unnecessary
        } else {
            match self.value_opt.borrow().is_some() {
                true => NodeUpdateDelayed::Changed,
                false => NodeUpdateDelayed::Necessary,
            }
        }
    }

    fn iter_observers(&self, f: &mut dyn FnMut(&StrongObserver)) {
        let observers: Vec<StrongObserver> = {
            let os = self.observers.borrow();
            os.values().filter_map(Weak::upgrade).collect()
        };
        for obs in observers.iter() {
            f(obs);
        }
    }

    fn child_changed(
        &self,
        child: &dyn ErasedNode,
        child_index: i32,
        old_value_opt: Option<&dyn Any>,
    ) {
        let kind = self.kind.borrow();
        if let Kind::UnorderedArrayFold(uaf) = &*kind {
            let old_value = old_value_opt.and_then(|a| a.downcast_ref::<G::I1>());
            let new_any = child
                .value_as_any()
                .expect("child of an unordered fold must have a value after changing");
            let new_value = new_any
                .downcast_ref::<G::I1>()
                .expect("type mismatch between unordered fold and its child");
            uaf.child_changed(child_index, old_value, new_value);
        }
    }

    fn change_child(
        &self,
        old_child: Option<NodeRef>,
        new_child: NodeRef,
        child_index: i32,
        state: &State,
    ) {
        match old_child {
            None => {
                tracing::debug!(
                    "change_child adding parent to {:?} at child_index {child_index}",
                    new_child.id()
                );
                new_child.state_add_parent(child_index, self.as_parent_dyn_ref(), state);
            }
            Some(old_child) => {
                if old_child.ptr_eq(&*new_child) {
                    // nothing changed
                    return;
                }
                /* We remove [old_child] before adding [new_child], because
                they share the same child index. */
                old_child.remove_parent(child_index, self.as_parent_dyn_ref());
                /* We force [old_child] to temporarily be necessary, so that
                [add_parent] can't mistakenly think it is unnecessary and
                transition it to necessary (which would add duplicate edges
                and break things horribly). */
                old_child.force_necessary().set(true);
                new_child.state_add_parent(child_index, self.as_parent_dyn_ref(), state);
                old_child.force_necessary().set(false);
                /* We [check_if_unnecessary] after [add_parent], so that we
                don't unnecessarily transition nodes from necessary to
                unnecessary and then back again. */
                old_child.check_if_unnecessary(state);
            }
        }
    }

    fn add_parent_without_adjusting_heights(
        &self,
        child_index: i32,
        parent_ref: &dyn ErasedNode,
        state: &State,
    ) {
        debug_assert!(parent_ref.is_necessary());
        let was_necessary = self.is_necessary();
        self.add_parent(child_index, parent_ref);
        if !self.is_valid() {
            let mut pi = state.propagate_invalidity.borrow_mut();
            pi.push(parent_ref.weak());
        }
        if !was_necessary {
            self.became_necessary(state);
        }
    }

    fn state_add_parent(&self, child_index: i32, parent_ref: &dyn ErasedNode, state: &State) {
        let parent = parent_ref.erased();
        tracing::trace!(child_id = ?self.id, child_index = %child_index, parent_id = ?parent.id(), "state_add_parent");
        debug_assert!(parent.is_necessary());
        self.add_parent_without_adjusting_heights(child_index, parent_ref, state);
        if self.height() >= parent.height() {
            // e.g. a bind main whose new rhs sits higher than the main node
            let mut ah_heap = state.adjust_heights_heap.borrow_mut();
            let rch = &state.recompute_heap;
            ah_heap.adjust_heights(rch, self.packed(), parent.packed());
        }
        state.propagate_invalidity();
        /* we only add necessary parents */
        debug_assert!(parent.is_necessary());
        if !parent.is_in_recompute_heap()
            && (parent.recomputed_at().get().is_never() || self.edge_is_stale(parent))
        {
            state.recompute_heap.insert(parent.packed());
        }
    }

    #[rustfmt::skip]
    fn remove_parent(&self, child_index: i32, parent_ref: &dyn ErasedNode) {
        let child = self;
        let mut child_indices = child.parent_child_indices.borrow_mut();
        let mut child_parents = child.parents.borrow_mut();
        let parent = parent_ref.erased();
        let parent_indices_cell = parent.parent_child_indices();
        let mut parent_indices = parent_indices_cell.borrow_mut();
        tracing::trace!(child_id = ?child.id, child_index = %child_index, parent_id = ?parent.id(), "remove_parent");

        let parent_index = parent_indices.my_parent_index_in_child_at_index[child_index as usize];
        debug_assert!(
            !child_parents.is_empty() && parent_index >= 0,
            "remove_parent: edge already removed? child_index={child_index}, parent_index={parent_index}"
        );
        debug_assert!(crate::weak_thin_ptr_eq(
            &parent_ref.weak(),
            &child_parents[parent_index as usize]
        ));

        // Unlink the parent's side first and drop its borrow: with duplicate
        // parents (map2(n, n)), the "last parent" below can be this very
        // parent node, and we would re-borrow its indices.
        parent_indices.my_parent_index_in_child_at_index[child_index as usize] = -1;
        drop(parent_indices);

        let last_parent_index = child_parents.len() - 1;
        if (parent_index as usize) < last_parent_index {
            // Swap the parent at the end of the array into this slot. Far
            // fewer index twiddles than shifting everything back by one.
            let end_p_weak = child_parents[last_parent_index].clone();
            if let Some(end_p) = end_p_weak.upgrade() {
                let end_p_indices_cell = end_p.parent_child_indices();
                let mut end_p_indices = end_p_indices_cell.borrow_mut();
                let end_child_index = child_indices.my_child_index_in_parent_at_index[last_parent_index];
                // link parent_index & end_child_index
                end_p_indices.my_parent_index_in_child_at_index[end_child_index as usize] = parent_index;
                child_indices.my_child_index_in_parent_at_index[parent_index as usize] = end_child_index;
            } else {
                tracing::error!("could not upgrade child_parents[{last_parent_index}]");
            }
        }

        // Finish unlinking the vacated last slot. Must happen after the block
        // above, which still reads it when there are duplicate parents.
        child_indices.my_child_index_in_parent_at_index[last_parent_index] = -1;
        child_parents.swap_remove(parent_index as usize);
    }

    fn alarm_fired(&self, state: &State) {
        if !self.is_valid() {
            return;
        }
        let kind = self.kind.borrow();
        match &*kind {
            Kind::At { .. } => {
                drop(kind);
                self.make_stale_from_alarm(state);
            }
            Kind::AtIntervals { at_intervals, .. } => {
                let clock = at_intervals.clock.clone();
                let next =
                    next_interval_after(at_intervals.base, at_intervals.interval, clock.now());
                drop(kind);
                clock.schedule(next, self.weak());
                self.make_stale_from_alarm(state);
            }
            Kind::StepFunction(sf) => {
                let clock = sf.clock.clone();
                let next = sf.next_step_after(clock.now());
                drop(kind);
                if let Some(next) = next {
                    clock.schedule(next, self.weak());
                }
                self.make_stale_from_alarm(state);
            }
            Kind::Snapshot(snap) => {
                let child = snap.child.clone();
                drop(kind);
                /* The snapshot's moment has arrived: restructure into a
                freeze of the watched input, so the next stabilisation
                captures its value and the node turns constant. */
                let was_necessary = self.is_necessary();
                self.set_kind(Kind::Freeze(FreezeNode {
                    child: child.clone(),
                    only_freeze_when: RefCell::new(Box::new(|_| true)),
                }));
                self.recomputed_at.set(StabilisationNum::init());
                if was_necessary {
                    child.state_add_parent(
                        Kind::<G>::FREEZE_CHILD_INDEX,
                        self.as_parent_dyn_ref(),
                        state,
                    );
                } else {
                    // freeze nodes are necessary in their own right
                    self.became_necessary_propagate(state);
                }
                if self.is_necessary() && !self.is_in_recompute_heap() {
                    state.recompute_heap.insert(self.packed());
                }
            }
            _ => panic!(
                "alarm fired for a node of kind {}, which never schedules alarms",
                self.kind_name()
            ),
        }
    }

    fn invariant(&self) {
        let pci = self.parent_child_indices.borrow();
        // heap membership agrees with the staleness/necessity predicates
        assert_eq!(
            self.needs_to_be_computed(),
            self.is_in_recompute_heap(),
            "needs_to_be_computed != is_in_recompute_heap for node {:?} ({})",
            self.id,
            self.kind_name(),
        );
        assert!(self.height_in_adjust_heights_heap.get() == -1);
        let hirch = self.height_in_recompute_heap.get();
        assert!(hirch == -1 || (hirch >= 0 && hirch <= self.height.get()));
        // back-index array sized by the kind's child slots
        assert_eq!(
            pci.my_parent_index_in_child_at_index.len(),
            self.max_num_children(),
        );
        assert!(pci.my_child_index_in_parent_at_index.len() >= self.num_parents());
        if !self.recomputed_at.get().is_never() && !self.changed_at.get().is_never() {
            assert!(self.changed_at.get() <= self.recomputed_at.get());
        }
        // cached handler count is the sum over own + linked observers
        let observer_handlers = self
            .erased()
            .fold_observers(0i32, |acc, obs| acc + obs.num_handlers());
        assert_eq!(
            self.num_on_update_handlers.get(),
            self.on_update_handlers.borrow().len() as i32 + observer_handlers,
        );
        if self.is_necessary() {
            assert!(!self.should_be_invalidated());
            assert!(self.height.get() > self.created_in.height());
            // every child points back at us, and heights strictly increase
            // along each edge
            self.foreach_child(&mut |ix, child| {
                assert!(self.height.get() > child.height());
                let parent_index = pci.my_parent_index_in_child_at_index[ix as usize];
                assert!(parent_index >= 0);
                let back = child.get_parent(parent_index as usize);
                assert!(back.ptr_eq(self.erased()));
                let child_pci_cell = child.parent_child_indices();
                let child_pci = child_pci_cell.borrow();
                assert_eq!(
                    child_pci.my_child_index_in_parent_at_index[parent_index as usize],
                    ix
                );
            });
        } else {
            assert_eq!(self.height.get(), -1);
            assert!(!self.is_in_recompute_heap());
        }
        // every parent is necessary, sits higher, and knows us by the
        // recorded child slot
        for (parent_index, parent) in self.parents.borrow().iter().enumerate() {
            let parent = parent.upgrade().unwrap();
            assert!(parent.is_necessary());
            assert!(parent.height() > self.height.get());
            let child_index = pci.my_child_index_in_parent_at_index[parent_index];
            assert!(child_index >= 0);
            let parent_pci_cell = parent.parent_child_indices();
            let parent_pci = parent_pci_cell.borrow();
            assert_eq!(
                parent_pci.my_parent_index_in_child_at_index[child_index as usize],
                parent_index as i32
            );
        }
        if self.is_valid() && !self.is_stale() && self.is_necessary() {
            assert!(
                self.value_opt.borrow().is_some(),
                "necessary, valid, up-to-date node {:?} ({}) has no value",
                self.id,
                self.kind_name(),
            );
        }
    }

    fn dot_label(&self, f: &mut dyn Write) -> fmt::Result {
        let id = self.id;
        if let Some(user) = self.user_info.borrow().as_ref() {
            writeln!(f, "{user:?}")?;
        }
        let h = self.height.get();
        let kind = self.kind.borrow();
        match &*kind {
            Kind::Constant(v) => return write!(f, "Const({id:?}) @ {h} => {v:?}"),
            Kind::BindLhsChange { .. } => return write!(f, "BindLhsChange({id:?}) @ {h}"),
            Kind::IfTestChange { .. } => return write!(f, "IfTestChange({id:?}) @ {h}"),
            Kind::JoinLhsChange { .. } => return write!(f, "JoinLhsChange({id:?}) @ {h}"),
            other => write!(f, "{}", other.name())?,
        }
        drop(kind);
        write!(f, "({id:?})")?;
        write!(f, " @ {h}")?;
        if let Some(val) = self.value_as_ref() {
            write!(f, " => {:?}", &*val)?;
        }
        Ok(())
    }

    fn dot_node(&self, f: &mut dyn Write, name: &str) -> fmt::Result {
        let node = self;
        write!(f, "  {} [", name)?;

        struct EscapedWriter<'a> {
            s: &'a str,
        }
        impl fmt::Display for EscapedWriter<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut s = self.s;
                write!(f, "\"")?;
                while !s.is_empty() {
                    let Some(found_esc) = s.find(['"', '\n', '\\']) else {
                        f.write_str(s)?;
                        break;
                    };
                    let b = s.as_bytes();
                    f.write_str(&s[..found_esc])?;
                    match b[found_esc] {
                        // " => \"
                        b'"' => f.write_str("\\\"")?,
                        // newline => \l (left-justified)
                        b'\n' => f.write_str("\\l")?,
                        // \ => \\
                        b'\\' => f.write_str("\\\\")?,
                        _ => return Err(fmt::Error),
                    }
                    s = &s[found_esc + 1..];
                }
                write!(f, "\"")
            }
        }
        write!(f, "label=")?;
        let mut buf = String::new();
        node.dot_label(&mut buf)?;
        write!(f, "{}", EscapedWriter { s: &buf })?;
        if node.is_in_recompute_heap() {
            write!(f, ", fillcolor=3, style=filled")?;
        } else {
            write!(f, ", fillcolor=5, style=filled")?;
        }
        match &*node.kind.borrow() {
            Kind::Var(..) => {
                write!(f, ", shape=note")?;
            }
            Kind::BindLhsChange { .. }
            | Kind::IfTestChange { .. }
            | Kind::JoinLhsChange { .. } => {
                write!(f, ", shape=box3d, bgcolor=grey")?;
            }
            _ => {}
        }
        writeln!(f, "]")?;
        Ok(())
    }

    fn dot_add_bind_edges(&self, bind_edges: &mut Vec<(NodeRef, NodeRef)>) {
        if let Kind::BindLhsChange { bind, .. } = &*self.kind.borrow() {
            let all = bind.all_nodes_created_on_rhs.borrow();
            for rhs in all.iter().filter_map(Weak::upgrade) {
                bind_edges.push((self.packed(), rhs.clone()));
            }
        }
    }

    fn dot_was_changed(&self) -> bool {
        let Some(state) = self.state_opt() else {
            return false;
        };
        let r = state.stabilisation_num.get();
        match state.status.get() {
            crate::state::IncrStatus::NotStabilising => self.changed_at.get().add1() == r,
            _ => self.changed_at.get() == r,
        }
    }
}

impl<G: NodeGenerics> Node<G> {
    fn any_child(&self, pred: &dyn Fn(i32, NodeRef) -> bool) -> bool {
        self.kind
            .borrow()
            .try_fold_children((), &mut |(), ix, node| {
                if pred(ix, node) {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .is_break()
    }

    fn maybe_change_value(&self, value: G::R, state: &State) -> Option<NodeRef> {
        let old_value_opt = self.value_opt.take();
        let mut cutoff = self.cutoff.borrow_mut();
        let should_change = old_value_opt
            .as_ref()
            .map_or(true, |old| !cutoff.should_cutoff(old, &value));
        drop(cutoff);
        self.value_opt.replace(Some(value));
        self.maybe_change_value_manual(old_value_opt, should_change, state)
    }

    fn maybe_change_value_manual(
        &self,
        old_value_opt: Option<G::R>,
        did_change: bool,
        state: &State,
    ) -> Option<NodeRef> {
        if !did_change {
            tracing::trace!("cutoff applied to value change of {:?}", self.id);
            return None;
        }
        self.changed_at.set(state.stabilisation_num.get());
        state.num_nodes_changed.increment();
        self.maybe_handle_after_stabilisation(state);
        let result = {
            let parents = self.parents.borrow();
            let pci = self.parent_child_indices.borrow();
            let mut parents_iter = parents.iter().enumerate();
            // steal the first parent; it may be recomputable right away
            let first_parent = parents_iter.next();
            for (parent_index, parent) in parents_iter {
                let child_index = pci.my_child_index_in_parent_at_index[parent_index];
                let Some(p) = parent.upgrade() else {
                    tracing::error!("parent {parent_index} of {:?} was dropped", self.id);
                    continue;
                };
                p.child_changed(
                    self,
                    child_index,
                    old_value_opt.as_ref().map(|v| v.as_any()),
                );
                debug_assert!(p.needs_to_be_computed(), "p.needs_to_be_computed(): {p:?}");
                /* We don't do the [can_recompute_now] optimisation for any
                but the first parent. While we iterate over the list of
                parents we would execute them, and in particular we could
                execute lhs-change nodes, which restructure the very parent
                list we are iterating over. Think about:

                lhs.bind(|b| if *b { lhs.map(id) } else { incr.constant(b) })

                If the optimisation kicked in while we propagate a change to
                the parents of [lhs], we could execute the lhs-change first,
                which would disconnect the map node from [lhs]. Then we would
                execute the second parent of [lhs], which doesn't exist any
                more. */
                if !p.is_in_recompute_heap() {
                    tracing::trace!(
                        "inserting parent {:?} into recompute heap at height {:?}",
                        p.id(),
                        p.height()
                    );
                    state.recompute_heap.insert(p.packed());
                }
            }
            if let Some((parent_index, parent)) = first_parent {
                let child_index = pci.my_child_index_in_parent_at_index[parent_index];
                let p = parent.upgrade();
                match p {
                    None => {
                        tracing::error!("first parent of {:?} was dropped", self.id);
                        None
                    }
                    Some(p) => {
                        p.child_changed(
                            self,
                            child_index,
                            old_value_opt.as_ref().map(|v| v.as_any()),
                        );
                        debug_assert!(
                            p.needs_to_be_computed(),
                            "p.needs_to_be_computed(): {p:?}"
                        );
                        if !p.is_in_recompute_heap()
                            && p.parent_iter_can_recompute_now(self, state)
                        {
                            Some(p)
                        } else {
                            None
                        }
                    }
                }
            } else {
                None
            }
        };
        if self.num_on_update_handlers.get() > 0 {
            self.old_value_opt.replace(old_value_opt);
        }
        result
    }

    fn copy_child<C: Value>(
        &self,
        child: &Input<C>,
        token: refl::Id<C, G::R>,
        state: &State,
    ) -> Option<NodeRef> {
        if child.is_valid() {
            let latest = child.latest();
            self.maybe_change_value(token.cast(latest), state)
        } else {
            self.invalidate_node(state);
            state.propagate_invalidity();
            None
        }
    }

    /// Installs a new kind, re-initialising the child-slot back-index array
    /// for the new kind's arity. Callers are responsible for unlinking the
    /// old kind's children first.
    pub(crate) fn set_kind(&self, kind: Kind<G>) {
        let mut pci = self.parent_child_indices.borrow_mut();
        pci.my_parent_index_in_child_at_index = smallvec![-1; kind.max_num_children()];
        drop(pci);
        self.kind.replace(kind);
    }

    fn make_stale_from_alarm(&self, state: &State) {
        /* Time-based leaves are stale exactly when they have never been
        recomputed; re-arming that state is how a fired alarm queues the node
        without any graph edge changing. */
        self.recomputed_at.set(StabilisationNum::init());
        if self.is_necessary() && !self.is_in_recompute_heap() {
            state.recompute_heap.insert(self.packed());
        }
    }

    fn add_parent(&self, child_index: i32, parent_ref: &dyn ErasedNode) {
        let child = self;
        let mut child_indices = child.parent_child_indices.borrow_mut();
        let mut child_parents = child.parents.borrow_mut();

        // we're appending here
        let parent = parent_ref;
        let parent_index = child_parents.len() as i32;
        let parent_indices_cell = parent.parent_child_indices();
        let mut parent_indices = parent_indices_cell.borrow_mut();

        while child_indices.my_child_index_in_parent_at_index.len() <= parent_index as usize {
            child_indices.my_child_index_in_parent_at_index.push(-1);
        }
        child_indices.my_child_index_in_parent_at_index[parent_index as usize] = child_index;

        while parent_indices.my_parent_index_in_child_at_index.len() <= child_index as usize {
            parent_indices.my_parent_index_in_child_at_index.push(-1);
        }
        parent_indices.my_parent_index_in_child_at_index[child_index as usize] = parent_index;

        child_parents.push(parent_ref.weak());
    }

    fn as_parent_dyn_ref(&self) -> &dyn ErasedNode {
        self
    }

    fn remove_children(&self, state: &State) {
        self.foreach_child(&mut |index, child| {
            child.remove_parent(index, self.as_parent_dyn_ref());
            child.check_if_unnecessary(state);
        })
    }
}

fn invalidate_nodes_created_on_rhs(all_nodes_created_on_rhs: &mut Vec<WeakNode>, state: &State) {
    tracing::debug!("draining all_nodes_created_on_rhs for invalidation");
    for node in all_nodes_created_on_rhs.drain(..) {
        if let Some(node) = node.upgrade() {
            node.invalidate_node(state);
        }
    }
}

impl<G: NodeGenerics> Node<G> {
    pub fn into_rc(mut self) -> Rc<Self> {
        let rc = Rc::<Self>::new_cyclic(|weak| {
            self.weak_self = weak.clone();
            self
        });
        rc.created_in.add_node(rc.clone());
        rc
    }

    pub fn create(state: Weak<State>, created_in: Scope, kind: Kind<G>) -> Self {
        let t = state.upgrade().unwrap();
        t.num_nodes_created.increment();
        Node {
            id: NodeId::next(),
            weak_self: Weak::<Self>::new(),
            weak_state: state,
            parent_child_indices: RefCell::new(ParentChildIndices {
                my_parent_index_in_child_at_index: smallvec![-1; kind.max_num_children()],
                my_child_index_in_parent_at_index: smallvec![-1],
            }),
            created_in,
            changed_at: Cell::new(StabilisationNum::init()),
            height: Cell::new(-1),
            height_in_recompute_heap: Cell::new(-1),
            height_in_adjust_heights_heap: Cell::new(-1),
            is_in_handle_after_stabilisation: false.into(),
            force_necessary: false.into(),
            num_on_update_handlers: 0.into(),
            recomputed_at: Cell::new(StabilisationNum::init()),
            value_opt: RefCell::new(None),
            old_value_opt: RefCell::new(None),
            kind: RefCell::new(kind),
            parents: RefCell::new(smallvec![]),
            observers: RefCell::new(HashMap::new()),
            on_update_handlers: Default::default(),
            user_info: RefCell::new(None),
            creation_backtrace: config::keep_node_creation_backtrace()
                .then(Backtrace::force_capture),
            cutoff: RefCell::new(Cutoff::PartialEq),
        }
    }

    pub fn create_rc(state: Weak<State>, created_in: Scope, kind: Kind<G>) -> Rc<Self> {
        Node::create(state, created_in, kind).into_rc()
    }
}

pub(crate) fn iter_descendants_internal(
    i: &mut dyn Iterator<Item = &dyn ErasedNode>,
    f: &mut dyn FnMut(&NodeRef),
) -> HashMap<NodeId, i32> {
    let mut seen = HashMap::new();
    for node in i {
        node.iter_descendants_internal_one(&mut seen, f);
    }
    seen
}

pub(crate) fn save_dot_to_file(
    nodes: &mut dyn Iterator<Item = &dyn ErasedNode>,
    named: &str,
) -> std::io::Result<()> {
    let buf = &mut String::new();
    save_dot(buf, nodes).unwrap();

    use std::fs::File;
    use std::io::Write;

    let mut file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(named)?;
    file.write_all(buf.as_bytes())
}

pub(crate) fn save_dot(
    f: &mut dyn Write,
    nodes: &mut dyn Iterator<Item = &dyn ErasedNode>,
) -> fmt::Result {
    fn node_name(node: &NodeRef) -> String {
        node.id().0.to_string()
    }
    writeln!(f, "digraph G {{")?;
    writeln!(
        f,
        r#"rankdir = BT
        graph [fontname = "Courier"];
        node [fontname = "Courier", shape=box, colorscheme=rdylbu7];
        edge [fontname = "Courier", colorscheme=rdylbu7];"#
    )?;
    let mut bind_edges = vec![];
    let seen = iter_descendants_internal(nodes, &mut |node| {
        let name = node_name(node);
        node.dot_node(f, &name).unwrap();
        node.foreach_child(&mut |_, child| {
            write!(f, "  {} -> {}", node_name(&child), name).unwrap();
            if child.dot_was_changed() {
                write!(f, " [color=1]").unwrap();
            }
            writeln!(f).unwrap();
        });
        node.dot_add_bind_edges(&mut bind_edges);
    });
    for (bind, rhs) in bind_edges {
        if seen.contains_key(&rhs.id()) {
            writeln!(
                f,
                "  {} -> {} [style=dashed{}]",
                node_name(&bind),
                node_name(&rhs),
                if bind.dot_was_changed() { ", color=2" } else { "" }
            )?;
        }
    }
    let mut by_height: HashMap<i32, Vec<NodeId>> = HashMap::new();
    let mut min_height = i32::MAX;
    for (node_id, height) in seen {
        by_height.entry(height).or_default().push(node_id);
        min_height = min_height.min(height);
    }
    for (height, nodes) in by_height {
        let rank = if height == min_height { "min" } else { "same" };
        writeln!(f, "{{ rank={:?}; ", rank)?;
        for id in nodes {
            writeln!(f, "{};", id.0)?;
        }
        writeln!(f, "}}")?;
    }
    writeln!(f, "}}")?;
    Ok(())
}
