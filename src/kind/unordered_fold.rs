use std::cell::{Cell, RefCell};

use crate::incr::Incr;
use crate::kind::NodeGenerics;
use crate::node::Incremental;
use crate::Value;

#[derive(Copy, Clone, Debug)]
enum Cycle {
    EveryN { current: u32, n: u32 },
    Never,
}

impl Cycle {
    /// New cycle counter.
    /// - None makes it never trigger.
    /// - Some makes an EveryN cycle starting at N.
    fn new(every_n: Option<u32>) -> Self {
        match every_n {
            Some(n) => Self::EveryN { current: 0, n },
            None => Self::Never,
        }
    }
    fn reset(cell: &Cell<Self>) {
        let v = match cell.get() {
            Self::EveryN { n, .. } => Self::EveryN { current: 0, n },
            Self::Never => Self::Never,
        };
        cell.set(v);
    }
    fn increment(cell: &Cell<Self>) -> bool {
        let mut v = cell.get();
        let wrapped = v.next();
        cell.set(v);
        wrapped
    }
    fn next(&mut self) -> bool {
        match self {
            Self::EveryN { current, n } if *current + 1 >= *n => {
                *current = 0;
                true
            }
            Self::EveryN { current, .. } => {
                *current += 1;
                false
            }
            Self::Never => false,
        }
    }
}

#[test]
fn test_cycle() {
    let mut cycle = Cycle::EveryN { current: 8, n: 10 };
    assert!(!cycle.next());
    assert!(cycle.next());
    assert!(!cycle.next());
}

/// Builds the incremental `update` function for [UnorderedArrayFold] from a
/// fold function and its inverse.
pub(crate) fn make_update_fn_from_inverse<B, A, F, FInv>(
    mut f: F,
    mut f_inv: FInv,
) -> impl FnMut(B, &A, &A) -> B
where
    F: FnMut(B, &A) -> B,
    FInv: FnMut(B, &A) -> B,
{
    move |fold_value, old_value, new_value| {
        // imagine f     is |acc, x| acc + x
        //         f_inv is |acc, x| acc - x
        // this produces an update function
        //         |acc, old, new| (acc - old) + new
        f(f_inv(fold_value, old_value), new_value)
    }
}

/// A fold whose combining function does not care about the order of its
/// inputs. Instead of refolding the whole array on every change, the cached
/// fold value is patched with `update(acc, old_child_value, new_child_value)`.
/// A full recompute still happens on first use, whenever the node has been
/// unnecessary in between, and optionally every N changes (to stop
/// floating-point drift and the like).
pub(crate) struct UnorderedArrayFold<F, U, I, R> {
    pub(crate) init: R,
    pub(crate) fold: RefCell<F>,
    pub(crate) update: RefCell<U>,
    pub(crate) fold_value: RefCell<Option<R>>,
    pub(crate) children: Vec<Incr<I>>,
    cycle: Cell<Cycle>,
}

impl<F, U, I, R> UnorderedArrayFold<F, U, I, R>
where
    F: FnMut(R, &I) -> R + 'static,
    U: FnMut(R, &I, &I) -> R + 'static,
    I: Value,
    R: Value,
{
    pub(crate) fn new(
        children: Vec<Incr<I>>,
        init: R,
        fold: F,
        update: U,
        full_compute_every_n_changes: Option<u32>,
    ) -> Self {
        UnorderedArrayFold {
            init,
            fold: fold.into(),
            update: update.into(),
            fold_value: RefCell::new(None),
            children,
            cycle: Cycle::new(full_compute_every_n_changes).into(),
        }
    }

    fn full_compute(&self) -> R {
        let acc = self.init.clone();
        let mut f = self.fold.borrow_mut();
        self.children.iter().fold(acc, |acc, x| {
            let v = x.node.value_as_ref().unwrap();
            f(acc, &v)
        })
    }

    pub(crate) fn compute(&self) -> R {
        let mut fv = self.fold_value.borrow_mut();
        if fv.is_none() {
            Cycle::reset(&self.cycle);
            fv.replace(self.full_compute());
        }
        fv.as_ref().cloned().unwrap()
    }

    /// Drops the cached fold value so the next compute refolds everything.
    /// Necessary when the node loses its children's parent edges: child
    /// changes stop flowing in, so the patched value can go stale.
    pub(crate) fn force_full_compute(&self) {
        self.fold_value.replace(None);
    }

    pub(crate) fn child_changed(&self, child_index: i32, old_value: Option<&I>, new_value: &I) {
        debug_assert!((child_index as usize) < self.children.len());
        self.fold_value.replace_with(|old| {
            let wrapped = Cycle::increment(&self.cycle);
            if wrapped || old.is_none() || old_value.is_none() {
                None
            } else {
                let mut update = self.update.borrow_mut();
                /* We only reach this case if we have already done a full
                compute, in which case both the cached fold value and the
                child's old value are present. */
                let x = update(old.take().unwrap(), old_value.unwrap(), new_value);
                Some(x)
            }
        });
    }
}

impl<F, U, I: Value, R: Value> NodeGenerics for UnorderedArrayFold<F, U, I, R>
where
    F: FnMut(R, &I) -> R + 'static,
    U: FnMut(R, &I, &I) -> R + 'static,
{
    type R = R;
    type I1 = I;
    type Fold = F;
    type Update = U;
    crate::kind::node_generics_default! { BindLhs, BindRhs }
    crate::kind::node_generics_default! { I2, I3, I4, I5, I6, I7, I8, I9 }
}

impl<F, U, I, R> std::fmt::Debug for UnorderedArrayFold<F, U, I, R>
where
    R: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnorderedArrayFold")
            .field("num_children", &self.children.len())
            .field("fold_value", &self.fold_value.borrow())
            .field("cycle", &self.cycle.get())
            .finish()
    }
}
