use std::cell::RefCell;
use std::rc::Rc;

use recalc::{Incr, IncrState, Invariant, ObserverError};

#[test]
fn bind_switches_between_existing_nodes() {
    #[derive(Debug, Clone, PartialEq)]
    enum Choose {
        B,
        C,
    }

    let incr = IncrState::new();
    let choose = incr.var(Choose::B);
    let b = incr.var(5);
    let c = incr.var(10);
    let b_ = b.watch();
    let c_ = c.watch();
    let bound = choose.watch().bind(move |choose| match choose {
        Choose::B => b_.clone(),
        Choose::C => c_.clone(),
    });
    let obs = bound.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 5);

    // b is currently bound, so changes to it are observable
    b.set(50);
    incr.stabilise();
    assert_eq!(obs.value(), 50);

    // c is not currently bound; setting it must do nothing
    c.set(99);
    incr.stabilise();
    assert_eq!(obs.value(), 50);
    assert!(!c.watch().is_necessary());

    // swapping the lhs re-evaluates the bind function and rewires the graph
    choose.set(Choose::C);
    incr.stabilise();
    assert_eq!(obs.value(), 99);
    assert!(!b.watch().is_necessary());
    incr.invariant();
}

#[test]
fn bind_creates_nodes_in_its_scope() {
    let incr = IncrState::new();
    let v = incr.var(3);
    let bound = v.watch().binds(|state, &x| state.constant(x * 10));
    let obs = bound.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 30);
    v.set(4);
    incr.stabilise();
    assert_eq!(obs.value(), 40);
    incr.invariant();
}

#[test]
fn invalidation_propagates_from_bind_scope() {
    let incr = IncrState::new();
    let flag = incr.var(true);
    let x = incr.var(10);
    let captured: Rc<RefCell<Option<Incr<i32>>>> = Rc::new(RefCell::new(None));

    let xw = x.watch();
    let captured_ = captured.clone();
    let bound = flag.watch().binds(move |state, &flag| {
        if flag {
            // created inside the bind's scope, so it dies with this rhs
            let inner = xw.map(|v| v + 1);
            *captured_.borrow_mut() = Some(inner.clone());
            inner.map(|v| v * 2)
        } else {
            state.constant(0)
        }
    });
    let obs = bound.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 22);

    let inner = captured.borrow().clone().unwrap();
    assert!(inner.is_valid());

    // a node *outside* the bind depending on the scoped node
    let outside = inner.map(|v| v + 100);
    let obs_inner = inner.observe();
    let obs_outside = outside.observe();
    incr.stabilise();
    assert_eq!(obs_inner.value(), 11);
    assert_eq!(obs_outside.value(), 111);

    // flipping the lhs tears down the old rhs scope
    flag.set(false);
    incr.stabilise();
    assert_eq!(obs.value(), 0);
    assert!(!inner.is_valid());
    // the invalidity propagated through the edge into the outside node
    assert!(!outside.is_valid());
    assert_eq!(obs_inner.try_get_value(), Err(ObserverError::ObservingInvalid));
    assert_eq!(
        obs_outside.try_get_value(),
        Err(ObserverError::ObservingInvalid)
    );
    // but the bind main itself was shielded by its lhs-change sentinel
    assert!(bound.is_valid());
    incr.invariant();
}

#[test]
fn nested_binds() {
    let incr = IncrState::new();
    let outer = incr.var(false);
    let inner = incr.var(false);
    let a = incr.var(1);
    let b = incr.var(2);
    let c = incr.var(3);

    let aw = a.watch();
    let bw = b.watch();
    let cw = c.watch();
    let inner_w = inner.watch();
    let bound = outer.watch().bind(move |&o| {
        if o {
            cw.clone()
        } else {
            let aw = aw.clone();
            let bw = bw.clone();
            inner_w.bind(move |&i| if i { bw.clone() } else { aw.clone() })
        }
    });
    let obs = bound.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 1);

    inner.set(true);
    incr.stabilise();
    assert_eq!(obs.value(), 2);

    outer.set(true);
    incr.stabilise();
    assert_eq!(obs.value(), 3);
    // the nested bind was torn down with the outer rhs
    assert!(!inner.watch().is_necessary());

    outer.set(false);
    inner.set(false);
    incr.stabilise();
    assert_eq!(obs.value(), 1);
    incr.invariant();
}

#[test]
fn bind_to_taller_rhs_adjusts_heights() {
    let incr = IncrState::new();
    let choose = incr.var(false);
    let base = incr.var(1);
    let shallow = base.watch().map(|x| *x);
    let deep = base
        .watch()
        .map(|x| x + 1)
        .map(|x| x + 1)
        .map(|x| x + 1)
        .map(|x| x + 1);

    let shallow_ = shallow.clone();
    let deep_ = deep.clone();
    let bound = choose
        .watch()
        .bind(move |&c| if c { deep_.clone() } else { shallow_.clone() });
    let obs = bound.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 1);

    // the new rhs is taller than the bind main was; the height cascade must
    // push the main (and anything above it) out of the way
    choose.set(true);
    incr.stabilise();
    assert_eq!(obs.value(), 5);
    assert!(bound.height() > deep.height());
    incr.invariant();

    base.set(10);
    incr.stabilise();
    assert_eq!(obs.value(), 14);
    incr.invariant();
}

#[test]
fn bind_returning_same_node_still_tracks() {
    let incr = IncrState::new();
    let flag = incr.var(0);
    let shared = incr.var(7);
    let sw = shared.watch();
    let bound = flag.watch().bind(move |_| sw.clone());
    let obs = bound.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 7);

    // the lhs changes but f returns the same node; the never-cutoff
    // lhs-change sentinel still forces the main node to refresh
    flag.set(1);
    incr.stabilise();
    assert_eq!(obs.value(), 7);

    shared.set(8);
    incr.stabilise();
    assert_eq!(obs.value(), 8);
    incr.invariant();
}

#[test]
fn if_then_else_tracks_only_selected_branch() {
    let incr = IncrState::new();
    let test = incr.var(true);
    let t = incr.var(1);
    let e = incr.var(2);
    let result = test.watch().if_then_else(&t.watch(), &e.watch());
    let obs = result.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 1);

    // the else branch is not even a child right now
    assert!(!e.watch().is_necessary());
    e.set(20);
    incr.stabilise();
    assert_eq!(obs.value(), 1);

    test.set(false);
    incr.stabilise();
    assert_eq!(obs.value(), 20);
    assert!(!t.watch().is_necessary());

    t.set(100);
    incr.stabilise();
    assert_eq!(obs.value(), 20);
    incr.invariant();
}

#[test]
fn join_follows_the_inner_incremental() {
    let incr = IncrState::new();
    let a = incr.var(1);
    let b = incr.var(2);
    let outer = incr.var(a.watch());
    let joined = outer.watch().join();
    let obs = joined.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 1);

    a.set(10);
    incr.stabilise();
    assert_eq!(obs.value(), 10);

    outer.set(b.watch());
    incr.stabilise();
    assert_eq!(obs.value(), 2);
    assert!(!a.watch().is_necessary());

    b.set(20);
    incr.stabilise();
    assert_eq!(obs.value(), 20);
    incr.invariant();
}
