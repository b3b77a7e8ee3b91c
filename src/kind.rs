use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::ops::ControlFlow;
use std::rc::Rc;

use crate::node::ErasedNode;
use crate::{NodeRef, Value};

mod array_fold;
mod bind;
mod freeze;
mod if_then_else;
mod join;
mod map;
mod time;
mod unordered_fold;

pub(crate) use array_fold::ArrayFold;
pub(crate) use bind::{BindLhsChangeGen, BindLhsId, BindMainGen, BindMainId, BindNode};
pub(crate) use freeze::{FreezeGen, FreezeNode};
pub(crate) use if_then_else::{
    IfMainGen, IfMainId, IfTestChangeGen, IfTestChangeId, IfThenElseNode,
};
pub(crate) use join::{JoinLhsChangeGen, JoinLhsId, JoinMainGen, JoinMainId, JoinNode};
pub(crate) use map::{
    Map2Node, Map3Node, Map4Node, Map5Node, Map6Node, Map7Node, Map8Node, Map9Node, MapNode,
};
pub(crate) use time::{
    next_interval_after, AtGen, AtId, AtIntervalsGen, AtIntervalsId, AtIntervalsNode, AtNode,
    SnapshotGen, SnapshotNode, StepFunctionGen, StepFunctionNode,
};
pub use time::{BeforeOrAfter, Timestamp};
pub(crate) use unordered_fold::{make_update_fn_from_inverse, UnorderedArrayFold};

/// Fills in the associated types of [NodeGenerics] that a particular node
/// shape can never exercise.
macro_rules! node_generics_default {
    ($($name:ident),* $(,)?) => {
        $( crate::kind::node_generics_default!(@single $name); )*
    };
    (@single BindLhs) => { type BindLhs = (); };
    (@single BindRhs) => { type BindRhs = (); };
    (@single I1) => { type I1 = (); };
    (@single I2) => { type I2 = (); };
    (@single I3) => { type I3 = (); };
    (@single I4) => { type I4 = (); };
    (@single I5) => { type I5 = (); };
    (@single I6) => { type I6 = (); };
    (@single I7) => { type I7 = (); };
    (@single I8) => { type I8 = (); };
    (@single I9) => { type I9 = (); };
    (@single Fold) => { type Fold = fn(Self::R, &Self::I1) -> Self::R; };
    (@single Update) => { type Update = fn(Self::R, &Self::I1, &Self::I1) -> Self::R; };
}
pub(crate) use node_generics_default;

/// The type family of one node: its output `R`, its input slots, and the
/// closure shapes the folds use. Each node shape (map, bind, fold, ...) has a
/// zero-sized or payload-carrying type implementing this, and defaults the
/// associated types it does not use.
pub(crate) trait NodeGenerics: 'static {
    type R: Value;
    type BindLhs: Value;
    type BindRhs: Value;
    type I1: Value;
    type I2: Value;
    type I3: Value;
    type I4: Value;
    type I5: Value;
    type I6: Value;
    type I7: Value;
    type I8: Value;
    type I9: Value;
    type Fold: FnMut(Self::R, &Self::I1) -> Self::R + 'static;
    type Update: FnMut(Self::R, &Self::I1, &Self::I1) -> Self::R + 'static;
}

/// What a node computes and which other nodes are its children.
///
/// A closed sum: the recompute engine interrogates kinds in hot loops, and
/// every query (staleness, invalidation, child enumeration) dispatches on it.
/// A node's kind can change over its lifetime, but only along the
/// restructuring edges: anything -> `Invalid`, `Snapshot` -> `Freeze`,
/// `Freeze` -> `Constant`. `Uninitialised` is the hole left while a
/// restructure inspects the outgoing kind; no behavioural query may see it.
pub(crate) enum Kind<G: NodeGenerics> {
    Invalid,
    Uninitialised,
    Constant(G::R),
    // We hold a strong reference to the Var, because (e.g.) the user's
    // public::Var may have been set and then dropped before the next
    // stabilise().
    Var(Rc<crate::var::Var<G::R>>),
    Map(MapNode<G::I1, G::R>),
    Map2(Map2Node<G::I1, G::I2, G::R>),
    Map3(Map3Node<G::I1, G::I2, G::I3, G::R>),
    Map4(Map4Node<G::I1, G::I2, G::I3, G::I4, G::R>),
    Map5(Map5Node<G::I1, G::I2, G::I3, G::I4, G::I5, G::R>),
    Map6(Map6Node<G::I1, G::I2, G::I3, G::I4, G::I5, G::I6, G::R>),
    Map7(Map7Node<G::I1, G::I2, G::I3, G::I4, G::I5, G::I6, G::I7, G::R>),
    Map8(Map8Node<G::I1, G::I2, G::I3, G::I4, G::I5, G::I6, G::I7, G::I8, G::R>),
    Map9(Map9Node<G::I1, G::I2, G::I3, G::I4, G::I5, G::I6, G::I7, G::I8, G::I9, G::R>),
    ArrayFold(ArrayFold<G::Fold, G::I1, G::R>),
    UnorderedArrayFold(UnorderedArrayFold<G::Fold, G::Update, G::I1, G::R>),
    Freeze(FreezeNode<G::R>),
    BindLhsChange {
        casts: BindLhsId<G>,
        // Ownership goes:
        // a Kind::BindMain holds the BindNode and the BindLhsChange node;
        // a Kind::BindLhsChange holds the BindNode;
        // the BindNode holds weak references back to both.
        bind: Rc<BindNode<G::BindLhs, G::BindRhs>>,
    },
    BindMain {
        casts: BindMainId<G>,
        bind: Rc<BindNode<G::BindLhs, G::BindRhs>>,
        lhs_change: NodeRef,
    },
    IfTestChange {
        casts: IfTestChangeId<G>,
        if_: Rc<IfThenElseNode<G::BindRhs>>,
    },
    IfThenElse {
        casts: IfMainId<G>,
        if_: Rc<IfThenElseNode<G::BindRhs>>,
        test_change: NodeRef,
    },
    JoinLhsChange {
        casts: JoinLhsId<G>,
        join: Rc<JoinNode<G::BindRhs>>,
    },
    JoinMain {
        casts: JoinMainId<G>,
        join: Rc<JoinNode<G::BindRhs>>,
        lhs_change: NodeRef,
    },
    At {
        at: AtNode,
        casts: AtId<G>,
    },
    AtIntervals {
        at_intervals: AtIntervalsNode,
        casts: AtIntervalsId<G>,
    },
    Snapshot(SnapshotNode<G::R>),
    StepFunction(StepFunctionNode<G::R>),
}

impl<G: NodeGenerics> Kind<G> {
    /// The child slot that a bind/if/join main node's governed child lives in
    /// (slot 0 being the change-sentinel).
    pub(crate) const RHS_CHILD_INDEX: i32 = 1;
    pub(crate) const FREEZE_CHILD_INDEX: i32 = 0;

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Invalid => "Invalid",
            Self::Uninitialised => "Uninitialised",
            Self::Constant(_) => "Const",
            Self::Var(_) => "Var",
            Self::Map(_) => "Map",
            Self::Map2(_) => "Map2",
            Self::Map3(_) => "Map3",
            Self::Map4(_) => "Map4",
            Self::Map5(_) => "Map5",
            Self::Map6(_) => "Map6",
            Self::Map7(_) => "Map7",
            Self::Map8(_) => "Map8",
            Self::Map9(_) => "Map9",
            Self::ArrayFold(_) => "ArrayFold",
            Self::UnorderedArrayFold(_) => "UnorderedArrayFold",
            Self::Freeze(_) => "Freeze",
            Self::BindLhsChange { .. } => "BindLhsChange",
            Self::BindMain { .. } => "BindMain",
            Self::IfTestChange { .. } => "IfTestChange",
            Self::IfThenElse { .. } => "IfThenElse",
            Self::JoinLhsChange { .. } => "JoinLhsChange",
            Self::JoinMain { .. } => "JoinMain",
            Self::At { .. } => "At",
            Self::AtIntervals { .. } => "AtIntervals",
            Self::Snapshot(_) => "Snapshot",
            Self::StepFunction(_) => "StepFunction",
        }
    }

    /// Upper bound on the number of child slots this kind can occupy. Sizes
    /// `my_parent_index_in_child_at_index`; constant for the kind's lifetime
    /// (folds fix their arity at construction).
    pub(crate) fn max_num_children(&self) -> usize {
        match self {
            Self::Uninitialised => panic!("queried the children of an uninitialised node"),
            Self::Invalid => 0,
            Self::Constant(_) | Self::Var(_) => 0,
            Self::At { .. } | Self::AtIntervals { .. } => 0,
            Self::Snapshot(_) | Self::StepFunction(_) => 0,
            Self::Map(_) => 1,
            Self::Map2(_) => 2,
            Self::Map3(_) => 3,
            Self::Map4(_) => 4,
            Self::Map5(_) => 5,
            Self::Map6(_) => 6,
            Self::Map7(_) => 7,
            Self::Map8(_) => 8,
            Self::Map9(_) => 9,
            Self::ArrayFold(af) => af.children.len(),
            Self::UnorderedArrayFold(uaf) => uaf.children.len(),
            Self::Freeze(_) => 1,
            Self::BindLhsChange { .. } => 1,
            Self::BindMain { .. } => 2,
            Self::IfTestChange { .. } => 1,
            Self::IfThenElse { .. } => 2,
            Self::JoinLhsChange { .. } => 1,
            Self::JoinMain { .. } => 2,
        }
    }

    /// Enumerates the current children in stable slot order. Main nodes whose
    /// governed child has not been installed yet simply skip that slot.
    pub(crate) fn try_fold_children<B, Acc>(
        &self,
        init: Acc,
        mut f: impl FnMut(Acc, i32, NodeRef) -> ControlFlow<B, Acc>,
    ) -> ControlFlow<B, Acc> {
        let mut acc = init;
        match self {
            Kind::Uninitialised => panic!("enumerated the children of an uninitialised node"),
            Kind::Invalid => {}
            Kind::Constant(_) | Kind::Var(_) => {}
            Kind::At { .. } | Kind::AtIntervals { .. } => {}
            Kind::Snapshot(_) | Kind::StepFunction(_) => {}
            Kind::Map(map::MapNode { input, .. }) => acc = f(acc, 0, input.packed())?,
            Kind::Map2(map::Map2Node { one, two, .. }) => {
                acc = f(acc, 0, one.packed())?;
                acc = f(acc, 1, two.packed())?;
            }
            Kind::Map3(map::Map3Node {
                one, two, three, ..
            }) => {
                acc = f(acc, 0, one.packed())?;
                acc = f(acc, 1, two.packed())?;
                acc = f(acc, 2, three.packed())?;
            }
            Kind::Map4(map::Map4Node {
                one,
                two,
                three,
                four,
                ..
            }) => {
                acc = f(acc, 0, one.packed())?;
                acc = f(acc, 1, two.packed())?;
                acc = f(acc, 2, three.packed())?;
                acc = f(acc, 3, four.packed())?;
            }
            Kind::Map5(map::Map5Node {
                one,
                two,
                three,
                four,
                five,
                ..
            }) => {
                acc = f(acc, 0, one.packed())?;
                acc = f(acc, 1, two.packed())?;
                acc = f(acc, 2, three.packed())?;
                acc = f(acc, 3, four.packed())?;
                acc = f(acc, 4, five.packed())?;
            }
            Kind::Map6(map::Map6Node {
                one,
                two,
                three,
                four,
                five,
                six,
                ..
            }) => {
                acc = f(acc, 0, one.packed())?;
                acc = f(acc, 1, two.packed())?;
                acc = f(acc, 2, three.packed())?;
                acc = f(acc, 3, four.packed())?;
                acc = f(acc, 4, five.packed())?;
                acc = f(acc, 5, six.packed())?;
            }
            Kind::Map7(map::Map7Node {
                one,
                two,
                three,
                four,
                five,
                six,
                seven,
                ..
            }) => {
                acc = f(acc, 0, one.packed())?;
                acc = f(acc, 1, two.packed())?;
                acc = f(acc, 2, three.packed())?;
                acc = f(acc, 3, four.packed())?;
                acc = f(acc, 4, five.packed())?;
                acc = f(acc, 5, six.packed())?;
                acc = f(acc, 6, seven.packed())?;
            }
            Kind::Map8(map::Map8Node {
                one,
                two,
                three,
                four,
                five,
                six,
                seven,
                eight,
                ..
            }) => {
                acc = f(acc, 0, one.packed())?;
                acc = f(acc, 1, two.packed())?;
                acc = f(acc, 2, three.packed())?;
                acc = f(acc, 3, four.packed())?;
                acc = f(acc, 4, five.packed())?;
                acc = f(acc, 5, six.packed())?;
                acc = f(acc, 6, seven.packed())?;
                acc = f(acc, 7, eight.packed())?;
            }
            Kind::Map9(map::Map9Node {
                one,
                two,
                three,
                four,
                five,
                six,
                seven,
                eight,
                nine,
                ..
            }) => {
                acc = f(acc, 0, one.packed())?;
                acc = f(acc, 1, two.packed())?;
                acc = f(acc, 2, three.packed())?;
                acc = f(acc, 3, four.packed())?;
                acc = f(acc, 4, five.packed())?;
                acc = f(acc, 5, six.packed())?;
                acc = f(acc, 6, seven.packed())?;
                acc = f(acc, 7, eight.packed())?;
                acc = f(acc, 8, nine.packed())?;
            }
            Kind::ArrayFold(af) => {
                for (ix, child) in af.children.iter().enumerate() {
                    acc = f(acc, ix as i32, child.node.packed())?;
                }
            }
            Kind::UnorderedArrayFold(uaf) => {
                for (ix, child) in uaf.children.iter().enumerate() {
                    acc = f(acc, ix as i32, child.node.packed())?;
                }
            }
            Kind::Freeze(freeze) => acc = f(acc, 0, freeze.child.packed())?,
            Kind::BindLhsChange { bind, .. } => acc = f(acc, 0, bind.lhs.packed())?,
            Kind::BindMain {
                bind, lhs_change, ..
            } => {
                acc = f(acc, 0, lhs_change.clone())?;
                let rhs = bind.rhs.borrow().clone();
                if let Some(rhs) = rhs {
                    acc = f(acc, 1, rhs.packed())?;
                }
            }
            Kind::IfTestChange { if_, .. } => acc = f(acc, 0, if_.test.packed())?,
            Kind::IfThenElse {
                if_, test_change, ..
            } => {
                acc = f(acc, 0, test_change.clone())?;
                let branch = if_.current_branch.borrow().clone();
                if let Some(branch) = branch {
                    acc = f(acc, 1, branch.packed())?;
                }
            }
            Kind::JoinLhsChange { join, .. } => acc = f(acc, 0, join.lhs.packed())?,
            Kind::JoinMain {
                join, lhs_change, ..
            } => {
                acc = f(acc, 0, lhs_change.clone())?;
                let rhs = join.rhs.borrow().clone();
                if let Some(rhs) = rhs {
                    acc = f(acc, 1, rhs.packed())?;
                }
            }
        }
        ControlFlow::Continue(acc)
    }

    pub(crate) fn iteri_children(&self, f: &mut dyn FnMut(i32, NodeRef)) {
        self.try_fold_children((), |(), ix, child| {
            f(ix, child);
            ControlFlow::<()>::Continue(())
        });
    }

    /// O(arity) retrieval of one child by slot index.
    pub(crate) fn slow_get_child(&self, child_index: i32) -> NodeRef {
        let found = self.try_fold_children((), |(), ix, child| {
            if ix == child_index {
                ControlFlow::Break(child)
            } else {
                ControlFlow::Continue(())
            }
        });
        match found {
            ControlFlow::Break(child) => child,
            ControlFlow::Continue(()) => {
                panic!("no child at index {child_index} of a {} node", self.name())
            }
        }
    }
}

impl<G: NodeGenerics> Debug for Kind<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Constant(v) => write!(f, "Const({v:?})"),
            Kind::Var(var) => write!(f, "Var({var:?})"),
            Kind::ArrayFold(af) => write!(f, "ArrayFold({af:?})"),
            Kind::UnorderedArrayFold(uaf) => write!(f, "UnorderedArrayFold({uaf:?})"),
            Kind::StepFunction(sf) => write!(f, "StepFunction({sf:?})"),
            Kind::Snapshot(snap) => write!(f, "Snapshot({snap:?})"),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Generics for a node that only ever produces a constant.
pub(crate) struct ConstantGen<T>(PhantomData<T>);

impl<T: Value> NodeGenerics for ConstantGen<T> {
    type R = T;
    node_generics_default! { BindLhs, BindRhs }
    node_generics_default! { I1, I2, I3, I4, I5, I6, I7, I8, I9 }
    node_generics_default! { Fold, Update }
}
