#![doc = include_str!("../README.md")]
// Incremental graphs accumulate some gnarly generic types, and most of them
// cannot be typedef'd into anything shorter.
#![allow(clippy::type_complexity)]

mod adjust_heights_heap;
mod clock;
pub mod config;
mod cutoff;
mod incr;
mod internal_observer;
mod kind;
mod node;
mod node_update;
mod recompute_heap;
mod scope;
mod stabilisation_num;
mod state;
mod var;

mod public;
pub use public::*;

use std::any::Any;
use std::cell::Cell;
use std::fmt::Debug;
use std::rc::{Rc, Weak};

use self::node::ErasedNode;

/// Trait alias for the values that can flow through the graph:
/// `Debug + Clone + PartialEq + 'static`.
///
/// `PartialEq` is what powers the default cutoff; `Clone` is how values move
/// from a child node into the nodes derived from it.
pub trait Value: Debug + Clone + PartialEq + 'static {
    fn as_any(&self) -> &dyn Any;
}

impl<T> Value for T
where
    T: Debug + Clone + PartialEq + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) type NodeRef = Rc<dyn ErasedNode>;
pub(crate) type WeakNode = Weak<dyn ErasedNode>;

/// Structural self-checks, used by tests and by debug-mode stabilisation.
pub trait Invariant {
    fn invariant(&self);
}

/// Solves the problem of `Rc::<dyn Trait>::ptr_eq` producing bad results,
/// since it compares fat pointers and their vtables, which may differ between
/// crates for the same underlying type, or be the same for two different
/// underlying types when rustc unifies vtables.
pub(crate) fn rc_thin_ptr_eq<T: ?Sized>(one: &Rc<T>, two: &Rc<T>) -> bool {
    let one_: *const () = Rc::as_ptr(one).cast();
    let two_: *const () = Rc::as_ptr(two).cast();
    one_ == two_
}

pub(crate) fn rc_thin_ptr_eq_t2<T: ?Sized, U: ?Sized>(one: &Rc<T>, two: &Rc<U>) -> bool {
    let one_: *const () = Rc::as_ptr(one).cast();
    let two_: *const () = Rc::as_ptr(two).cast();
    one_ == two_
}

pub(crate) fn weak_thin_ptr_eq<T: ?Sized>(one: &Weak<T>, two: &Weak<T>) -> bool {
    let one_: *const () = Weak::as_ptr(one).cast();
    let two_: *const () = Weak::as_ptr(two).cast();
    one_ == two_
}

/// Little helper trait for bumping a statistic.
pub(crate) trait CellIncrement {
    type Num;
    fn increment(&self);
    fn decrement(&self);
    fn update_val(&self, f: impl FnOnce(Self::Num) -> Self::Num);
}

macro_rules! impl_cell_increment {
    ($num_ty:ty) => {
        impl CellIncrement for Cell<$num_ty> {
            type Num = $num_ty;
            #[inline]
            fn update_val(&self, f: impl FnOnce(Self::Num) -> Self::Num) {
                self.set(f(self.get()));
            }
            #[inline(always)]
            fn increment(&self) {
                self.update_val(|x| x + 1)
            }
            #[inline(always)]
            fn decrement(&self) {
                self.update_val(|x| x - 1)
            }
        }
    };
}
impl_cell_increment!(i32);
impl_cell_increment!(usize);
