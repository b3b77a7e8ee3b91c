use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::Hash;
use std::rc::{Rc, Weak};

use crate::cutoff::Cutoff;
use crate::kind::{
    BindLhsChangeGen, BindLhsId, BindMainGen, BindMainId, BindNode, FreezeGen, FreezeNode,
    IfMainGen, IfMainId, IfTestChangeGen, IfTestChangeId, IfThenElseNode, JoinLhsChangeGen,
    JoinLhsId, JoinMainGen, JoinMainId, JoinNode, Kind,
};
use crate::node::{ErasedNode, Incremental, Input, Node, NodeId};
use crate::node_update::{NodeUpdate, OnUpdateHandler};
use crate::scope::{BindScope, Scope};
use crate::stabilisation_num::StabilisationNum;
use crate::{Observer, Value, WeakNode, WeakState};

/// A handle on one node of the computation graph.
///
/// Cheap to clone (it is a reference-counted pointer). Two `Incr`s compare
/// equal when they point at the same node, which is what lets an `Incr` be
/// used as a graph value itself (see [Incr::join]).
#[derive(Debug)]
#[must_use = "Incr<T> must be observed (.observe()) to be part of a computation."]
pub struct Incr<T> {
    pub(crate) node: Input<T>,
}

impl<T> Clone for Incr<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T> From<Input<T>> for Incr<T> {
    fn from(node: Input<T>) -> Self {
        Self { node }
    }
}

impl<T> PartialEq for Incr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T> Eq for Incr<T> {}

impl<T> Hash for Incr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node.id().hash(state)
    }
}

impl<T> Incr<T> {
    /// Allows an extra T2, because you might be comparing two incrs inside a
    /// map2 constructor.
    pub(crate) fn ptr_eq<T2>(&self, other: &Incr<T2>) -> bool {
        crate::rc_thin_ptr_eq_t2(&self.node, &other.node)
    }

    pub fn state(&self) -> WeakState {
        self.node.state().public_weak()
    }

    /// Attaches an annotation shown for this node in DOT exports and debug
    /// output.
    pub fn set_user_info(&self, info: impl fmt::Debug + 'static) {
        self.node.set_user_info(Box::new(info));
    }

    pub fn with_user_info(self, info: impl fmt::Debug + 'static) -> Self {
        self.node.set_user_info(Box::new(info));
        self
    }
}

impl<T: Value> Incr<T> {
    /// The dynamic-graph combinator: runs `f` on the latest value of `self`,
    /// and the computation behaves as if it *is* whatever incremental `f`
    /// returned. Nodes created inside `f` belong to this bind's scope and
    /// are invalidated when `self` next changes.
    pub fn bind<F, R>(&self, f: F) -> Incr<R>
    where
        R: Value,
        F: FnMut(&T) -> Incr<R> + 'static,
    {
        let state = self.node.state();
        let bind = Rc::new_cyclic(|weak| BindNode {
            lhs: self.node.clone(),
            mapper: RefCell::new(Box::new(f) as Box<dyn FnMut(&T) -> Incr<R>>),
            rhs: RefCell::new(None),
            rhs_scope: RefCell::new(Scope::Bind(weak.clone() as Weak<dyn BindScope>)),
            all_nodes_created_on_rhs: RefCell::new(vec![]),
            lhs_change: RefCell::new(Weak::<Node<BindLhsChangeGen<T, R>>>::new() as WeakNode),
            id_lhs_change: Cell::new(NodeId(0)),
            main: RefCell::new(Weak::<Node<BindMainGen<T, R>>>::new() as WeakNode),
        });
        let lhs_change = Node::<BindLhsChangeGen<T, R>>::create_rc(
            state.weak(),
            state.current_scope(),
            Kind::BindLhsChange {
                casts: BindLhsId {
                    r_unit: refl::refl(),
                },
                bind: bind.clone(),
            },
        );
        let main = Node::<BindMainGen<T, R>>::create_rc(
            state.weak(),
            state.current_scope(),
            Kind::BindMain {
                casts: BindMainId {
                    rhs_r: refl::refl(),
                },
                bind: bind.clone(),
                lhs_change: lhs_change.packed(),
            },
        );
        {
            *bind.lhs_change.borrow_mut() = lhs_change.weak();
            *bind.main.borrow_mut() = main.weak();
            bind.id_lhs_change.set(lhs_change.id);
        }
        /* The lhs-change node never cuts off, so that whenever the lhs
        changes, the main node is recomputed. This is necessary to handle
        cases where [f] returns an existing stable node, in which case the
        lhs-change would be the only thing making the main node stale. */
        lhs_change.set_cutoff(Cutoff::Never);
        Incr { node: main }
    }

    /// A version of bind that hands your closure a [WeakState], for building
    /// new incrementals inside the bind.
    pub fn binds<F, R>(&self, mut f: F) -> Incr<R>
    where
        R: Value,
        F: FnMut(&WeakState, &T) -> Incr<R> + 'static,
    {
        let cloned = self.node.state().public_weak();
        self.bind(move |value: &T| f(&cloned, value))
    }

    /// Tracks `self` until `only_freeze_when` accepts a value, after which
    /// the result is constant forever (even if `self` keeps changing or is
    /// invalidated).
    pub fn freeze_when(&self, only_freeze_when: impl FnMut(&T) -> bool + 'static) -> Incr<T> {
        let state = self.node.state();
        // Frozen-to-be values must survive their creation scope, so freeze
        // nodes always live at top scope.
        let node = Node::<FreezeGen<T>>::create_rc(
            state.weak(),
            Scope::Top,
            Kind::Freeze(FreezeNode {
                child: self.node.clone(),
                only_freeze_when: RefCell::new(Box::new(only_freeze_when)),
            }),
        );
        // necessary from birth, observer or not
        node.became_necessary_propagate(&state);
        Incr { node }
    }

    /// Freezes at the first value the next stabilisation produces.
    pub fn freeze(&self) -> Incr<T> {
        self.freeze_when(|_| true)
    }

    /// Turn two incrementals into a tuple incremental.
    pub fn zip<T2: Value>(&self, other: &Incr<T2>) -> Incr<(T, T2)> {
        if let Some(a) = self.node.constant() {
            if let Some(b) = other.node.constant() {
                let state = self.node.state();
                return state.constant((a, b));
            }
        }
        self.map2(other, |a, b| (a.clone(), b.clone()))
    }

    /// Creates an observer for this incremental.
    ///
    /// Observers are the way to read data out of the computation, and their
    /// existence is what makes the nodes underneath them necessary: without
    /// any observer, `var.set(..)` does essentially nothing, no matter how
    /// many maps and binds hang off that variable. Computations stay lazy
    /// until someone is watching.
    pub fn observe(&self) -> Observer<T> {
        let incr = self.clone();
        let internal = incr.node.state().observe(incr);
        Observer::new(internal)
    }

    /// Sets the cutoff function that decides whether a freshly computed
    /// value should count as changed. The default is [Cutoff::PartialEq].
    ///
    /// For types like `Rc<T>` where comparing the whole structure is
    /// expensive, comparing allocation pointers can be a better fit:
    ///
    /// ```
    /// use std::rc::Rc;
    /// use recalc::{Cutoff, IncrState};
    /// let incr = IncrState::new();
    /// let var = incr.var(Rc::new(5));
    /// var.set_cutoff(Cutoff::Fn(Rc::ptr_eq));
    /// ```
    pub fn set_cutoff(&self, cutoff: Cutoff<T>) {
        self.node.set_cutoff(cutoff);
    }

    /// Shorthand for [Incr::set_cutoff] with a plain function pointer.
    pub fn set_cutoff_fn(&self, cutoff_fn: fn(&T, &T) -> bool) {
        self.node.set_cutoff(Cutoff::Fn(cutoff_fn));
    }

    /// Shorthand for [Incr::set_cutoff] with a capturing closure.
    pub fn set_cutoff_fn_boxed<F>(&self, cutoff_fn: F)
    where
        F: FnMut(&T, &T) -> bool + Clone + 'static,
    {
        self.node.set_cutoff(Cutoff::FnBoxed(Box::new(cutoff_fn)));
    }

    pub fn get_cutoff(&self) -> Cutoff<T> {
        self.node.get_cutoff()
    }

    /// Attaches an update handler directly to this node (not through an
    /// observer). Handlers cannot be removed; use an observer subscription
    /// if you need that. The newest handler runs first.
    pub fn on_update(&self, f: impl FnMut(NodeUpdate<&T>) + 'static) {
        let state = self.node.state();
        let now = state.stabilisation_num.get();
        let handler = OnUpdateHandler::new(now, Box::new(f));
        self.node.add_on_update_handler(handler);
    }

    pub fn save_dot_to_file(&self, named: &str) {
        crate::node::save_dot_to_file(&mut core::iter::once(self.node.erased()), named).unwrap()
    }

    pub fn save_dot_to_string(&self) -> String {
        let mut buf = String::new();
        crate::node::save_dot(&mut buf, &mut core::iter::once(self.node.erased())).unwrap();
        buf
    }
}

impl Incr<bool> {
    /// Like `bind`, but for the common two-way branch: the result tracks
    /// `then_` while the test is true and `else_` while it is false. Only
    /// the selected branch is a dependency, so the unselected branch is
    /// neither kept up to date nor able to invalidate the result.
    pub fn if_then_else<T: Value>(&self, then_: &Incr<T>, else_: &Incr<T>) -> Incr<T> {
        let state = self.node.state();
        let if_ = Rc::new(IfThenElseNode {
            test: self.node.clone(),
            then_: then_.node.clone(),
            else_: else_.node.clone(),
            test_change: RefCell::new(Weak::<Node<IfTestChangeGen<T>>>::new() as WeakNode),
            main: RefCell::new(Weak::<Node<IfMainGen<T>>>::new() as WeakNode),
            current_branch: RefCell::new(None),
        });
        let test_change = Node::<IfTestChangeGen<T>>::create_rc(
            state.weak(),
            state.current_scope(),
            Kind::IfTestChange {
                casts: IfTestChangeId {
                    r_unit: refl::refl(),
                },
                if_: if_.clone(),
            },
        );
        let main = Node::<IfMainGen<T>>::create_rc(
            state.weak(),
            state.current_scope(),
            Kind::IfThenElse {
                casts: IfMainId {
                    branch_r: refl::refl(),
                },
                if_: if_.clone(),
                test_change: test_change.packed(),
            },
        );
        {
            *if_.test_change.borrow_mut() = test_change.weak();
            *if_.main.borrow_mut() = main.weak();
        }
        test_change.set_cutoff(Cutoff::Never);
        Incr { node: main }
    }
}

impl<T: Value> Incr<Incr<T>> {
    /// Flattens a nested incremental: the result tracks whatever inner
    /// incremental the outer one currently holds.
    pub fn join(&self) -> Incr<T> {
        let state = self.node.state();
        let join = Rc::new(JoinNode {
            lhs: self.node.clone(),
            lhs_change: RefCell::new(Weak::<Node<JoinLhsChangeGen<T>>>::new() as WeakNode),
            main: RefCell::new(Weak::<Node<JoinMainGen<T>>>::new() as WeakNode),
            rhs: RefCell::new(None),
        });
        let lhs_change = Node::<JoinLhsChangeGen<T>>::create_rc(
            state.weak(),
            state.current_scope(),
            Kind::JoinLhsChange {
                casts: JoinLhsId {
                    r_unit: refl::refl(),
                },
                join: join.clone(),
            },
        );
        let main = Node::<JoinMainGen<T>>::create_rc(
            state.weak(),
            state.current_scope(),
            Kind::JoinMain {
                casts: JoinMainId {
                    rhs_r: refl::refl(),
                },
                join: join.clone(),
                lhs_change: lhs_change.packed(),
            },
        );
        {
            *join.lhs_change.borrow_mut() = lhs_change.weak();
            *join.main.borrow_mut() = main.weak();
        }
        lhs_change.set_cutoff(Cutoff::Never);
        Incr { node: main }
    }
}

/// Introspection, mostly useful in tests and diagnostics.
impl<T: Value> Incr<T> {
    #[doc(hidden)]
    pub fn id(&self) -> NodeId {
        self.node.id()
    }
    #[doc(hidden)]
    pub fn height(&self) -> i32 {
        self.node.height()
    }
    #[doc(hidden)]
    pub fn num_parents(&self) -> usize {
        self.node.num_parents()
    }
    #[doc(hidden)]
    pub fn is_necessary(&self) -> bool {
        self.node.is_necessary()
    }
    #[doc(hidden)]
    pub fn is_valid(&self) -> bool {
        self.node.is_valid()
    }
    #[doc(hidden)]
    pub fn is_const(&self) -> bool {
        self.node.is_const()
    }
    #[doc(hidden)]
    pub fn recomputed_at(&self) -> StabilisationNum {
        self.node.recomputed_at().get()
    }
    #[doc(hidden)]
    pub fn changed_at(&self) -> StabilisationNum {
        self.node.changed_at().get()
    }
    #[doc(hidden)]
    pub fn check_invariant(&self) {
        self.node.invariant()
    }
}
