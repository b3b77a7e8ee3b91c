use std::cell::RefCell;
use std::rc::Rc;

use recalc::{IncrState, Invariant, StabilisationNum};

#[test]
fn var_set_and_observe() {
    let incr = IncrState::new();
    let var = incr.var(5);
    var.set(10);
    let observer = var.watch().observe();
    incr.stabilise();
    assert_eq!(observer.value(), 10);
    incr.invariant();
}

#[test]
fn test_map() {
    let incr = IncrState::new();
    let var = incr.var(5);
    let mapped = var.watch().map(|x| x * 10);
    let observer = mapped.observe();
    incr.stabilise();
    assert_eq!(observer.value(), 50);
    var.set(3);
    incr.stabilise();
    assert_eq!(observer.value(), 30);
    incr.invariant();
}

#[test]
fn test_map2() {
    let incr = IncrState::new();
    let a = incr.var(5);
    let b = incr.var(8);
    let mapped = a.watch().map2(&b.watch(), |a, b| a + b);
    let observer = mapped.observe();
    incr.stabilise();
    assert_eq!(observer.value(), 13);
    // each of these queues the watch node into the recompute heap
    a.set(3);
    b.set(9);
    incr.stabilise();
    assert_eq!(observer.value(), 12);
    incr.invariant();
}

#[test]
fn test_map_map2() {
    let incr = IncrState::new();
    let a = incr.var(5);
    let b = incr.var(8);
    let map_left = a.watch().map(|a| a * 10);
    let mapped = map_left.map2(&b.watch(), |left, b| left + b);
    let observer = mapped.observe();
    incr.stabilise();
    assert_eq!(observer.value(), 58);
    a.set(3);
    b.set(9);
    incr.stabilise();
    assert_eq!(observer.value(), 39);
    incr.invariant();
}

#[test]
fn cutoff_suppresses_downstream_recomputation() {
    let incr = IncrState::new();
    let v = incr.var(3);
    let parity = v.watch().map(|x| x % 2);
    let calls = Rc::new(RefCell::new(0));
    let calls_ = calls.clone();
    let downstream = parity.map(move |x| {
        *calls_.borrow_mut() += 1;
        *x
    });
    let obs = downstream.observe();

    incr.stabilise();
    assert_eq!(obs.value(), 1);
    assert_eq!(*calls.borrow(), 1);
    assert_eq!(parity.recomputed_at(), StabilisationNum(0));
    assert_eq!(parity.changed_at(), StabilisationNum(0));

    // 5 % 2 == 3 % 2, so parity recomputes but does not change, and the
    // downstream map never runs again.
    v.set(5);
    incr.stabilise();
    assert_eq!(obs.value(), 1);
    assert_eq!(*calls.borrow(), 1);
    assert_eq!(v.watch().recomputed_at(), StabilisationNum(1));
    assert_eq!(parity.recomputed_at(), StabilisationNum(1));
    assert_eq!(parity.changed_at(), StabilisationNum(0));
    assert!(parity.changed_at() < parity.recomputed_at());
    incr.invariant();
}

#[test]
fn heights_order_recomputation() {
    let incr = IncrState::new();
    let a = incr.var(0);
    let log = Rc::new(RefCell::new(Vec::new()));
    let log_b = log.clone();
    let b = a.watch().map(move |x| {
        log_b.borrow_mut().push("b");
        x + 1
    });
    let log_c = log.clone();
    let c = a.watch().map2(&b, move |a, b| {
        log_c.borrow_mut().push("c");
        a + b
    });
    let obs = c.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 1);

    let (ha, hb, hc) = (a.watch().height(), b.height(), c.height());
    assert!(ha < hb, "{ha} < {hb}");
    assert!(hb < hc, "{hb} < {hc}");

    log.borrow_mut().clear();
    a.set(10);
    incr.stabilise();
    assert_eq!(obs.value(), 21);
    // b (lower height) must have recomputed strictly before c
    assert_eq!(*log.borrow(), vec!["b", "c"]);
    incr.invariant();
}

#[test]
fn duplicate_parents_link_and_unlink() {
    let incr = IncrState::new();
    let n = incr.var(1);
    let m = n.watch().map2(&n.watch(), |a, b| a + b);
    let obs = m.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 2);
    // the same parent appears twice in n's parent list
    assert_eq!(n.watch().num_parents(), 2);
    incr.invariant();

    n.set(4);
    incr.stabilise();
    assert_eq!(obs.value(), 8);

    drop(obs);
    incr.stabilise();
    // disconnecting m removed both copies of the edge
    assert_eq!(n.watch().num_parents(), 0);
    assert!(!m.is_necessary());
    assert_eq!(m.height(), -1);
    incr.invariant();
}

#[test]
fn necessary_and_unnecessary_transitions() {
    let incr = IncrState::new();
    let v = incr.var(1);
    let m = v.watch().map(|x| x * 2);
    assert_eq!(m.height(), -1);
    assert!(!m.is_necessary());

    let obs = m.observe();
    incr.stabilise();
    assert!(m.is_necessary());
    assert!(m.height() >= 0);
    assert!(v.watch().is_necessary());
    assert_eq!(obs.value(), 2);

    drop(obs);
    incr.stabilise();
    assert!(!m.is_necessary());
    assert_eq!(m.height(), -1);
    assert!(!v.watch().is_necessary());
    assert_eq!(v.watch().height(), -1);
    incr.invariant();

    // observing again revives the same nodes
    let obs = m.observe();
    v.set(21);
    incr.stabilise();
    assert_eq!(obs.value(), 42);
    incr.invariant();
}

#[test]
fn parent_array_growth() {
    let incr = IncrState::new();
    let n = incr.var(1);
    let observers: Vec<_> = (0..9)
        .map(|i| n.watch().map(move |x| x + i).observe())
        .collect();
    incr.stabilise();
    assert_eq!(n.watch().num_parents(), 9);
    for (i, obs) in observers.iter().enumerate() {
        assert_eq!(obs.value(), 1 + i as i32);
    }
    incr.invariant();

    n.set(100);
    incr.stabilise();
    for (i, obs) in observers.iter().enumerate() {
        assert_eq!(obs.value(), 100 + i as i32);
    }

    // unobserve a few in the middle; the swap-with-last unlink must keep
    // every remaining back-index coherent
    let mut observers = observers;
    observers.remove(4);
    observers.remove(1);
    incr.stabilise();
    assert_eq!(n.watch().num_parents(), 7);
    incr.invariant();

    n.set(7);
    incr.stabilise();
    incr.invariant();
}

#[test]
fn map9_arity() {
    let incr = IncrState::new();
    let vars: Vec<_> = (1..=9).map(|i| incr.var(i)).collect();
    let w: Vec<_> = vars.iter().map(|v| v.watch()).collect();
    let sum = w[0].map9(
        &w[1], &w[2], &w[3], &w[4], &w[5], &w[6], &w[7], &w[8],
        |a, b, c, d, e, f, g, h, i| a + b + c + d + e + f + g + h + i,
    );
    let obs = sum.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 45);
    vars[8].set(90);
    incr.stabilise();
    assert_eq!(obs.value(), 126);
    incr.invariant();
}

#[test]
fn test_fold() {
    let incr = IncrState::new();
    let vars = vec![incr.var(1), incr.var(2), incr.var(3)];
    let watches = vars.iter().map(|v| v.watch()).collect();
    let folded = incr.fold(watches, 0, |acc, x| acc + x);
    let obs = folded.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 6);
    vars[0].set(10);
    incr.stabilise();
    assert_eq!(obs.value(), 15);
    incr.invariant();
}

#[test]
fn test_unordered_fold() {
    let incr = IncrState::new();
    let vars = vec![incr.var(1), incr.var(2), incr.var(3)];
    let watches: Vec<_> = vars.iter().map(|v| v.watch()).collect();
    let full_computes = Rc::new(RefCell::new(0));
    let fc = full_computes.clone();
    let folded = incr.unordered_fold(
        watches,
        0,
        move |acc, x| {
            *fc.borrow_mut() += 1;
            acc + x
        },
        |acc, old, new| acc - old + new,
        None,
    );
    let obs = folded.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 6);
    assert_eq!(*full_computes.borrow(), 3);

    // one change patches the cached value instead of refolding
    vars[1].set(20);
    incr.stabilise();
    assert_eq!(obs.value(), 24);
    assert_eq!(*full_computes.borrow(), 3);
    incr.invariant();
}

#[test]
fn test_unordered_fold_inverse() {
    let incr = IncrState::new();
    let vars = vec![incr.var(10), incr.var(20)];
    let watches: Vec<_> = vars.iter().map(|v| v.watch()).collect();
    let folded = incr.unordered_fold_inverse(
        watches,
        0,
        |acc, x| acc + x,
        |acc, x| acc - x,
        Some(2),
    );
    let obs = folded.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 30);
    vars[0].set(11);
    incr.stabilise();
    assert_eq!(obs.value(), 31);
    vars[1].set(25);
    incr.stabilise();
    assert_eq!(obs.value(), 36);
    incr.invariant();
}

#[test]
fn unordered_fold_becoming_unnecessary_forces_full_compute() {
    let incr = IncrState::new();
    let vars = vec![incr.var(1), incr.var(2)];
    let watches: Vec<_> = vars.iter().map(|v| v.watch()).collect();
    let folded = incr.unordered_fold(
        watches,
        0,
        |acc, x| acc + x,
        |acc, old, new| acc - old + new,
        None,
    );
    let obs = folded.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 3);

    // while unobserved, changes don't flow into the cached fold value
    drop(obs);
    incr.stabilise();
    vars[0].set(100);

    let obs = folded.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 102);
    incr.invariant();
}

#[test]
fn test_zip_and_constant() {
    let incr = IncrState::new();
    let c = incr.constant(5);
    assert!(c.is_const());
    let v = incr.var(2);
    let zipped = c.zip(&v.watch());
    let obs = zipped.observe();
    incr.stabilise();
    assert_eq!(obs.value(), (5, 2));
    v.set(3);
    incr.stabilise();
    assert_eq!(obs.value(), (5, 3));

    // two constants fold into a constant
    let cc = incr.constant(1).zip(&incr.constant(2));
    assert!(cc.is_const());
    incr.invariant();
}

#[test]
fn var_update_and_modify() {
    let incr = IncrState::new();
    let v = incr.var(vec![1, 2]);
    let len = v.watch().map(|xs| xs.len());
    let obs = len.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 2);

    v.update(|mut xs| {
        xs.push(3);
        xs
    });
    incr.stabilise();
    assert_eq!(obs.value(), 3);

    v.modify(|xs| xs.clear());
    incr.stabilise();
    assert_eq!(obs.value(), 0);

    let old = v.replace(vec![9; 9]);
    assert_eq!(old, Vec::<i32>::new());
    incr.stabilise();
    assert_eq!(obs.value(), 9);
    incr.invariant();
}

#[test]
fn set_during_stabilisation_is_deferred() {
    let incr = IncrState::new();
    let v = incr.var(1);
    let v2 = v.clone();
    let m = incr.constant(()).bind(move |_| {
        v2.set(99);
        v2.watch()
    });
    let obs = m.observe();
    incr.stabilise();
    // the set landed after the stabilisation that triggered it
    assert_eq!(obs.value(), 1);
    assert!(!incr.is_stable());
    incr.stabilise();
    assert_eq!(obs.value(), 99);
    incr.invariant();
}

#[test]
fn dot_export_mentions_the_graph() {
    let incr = IncrState::new();
    let v = incr.var(1);
    let m = v.watch().map(|x| x + 1).with_user_info("plus-one");
    let obs = m.observe();
    incr.stabilise();
    let dot = incr.save_dot_to_string();
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("Var"));
    assert!(dot.contains("Map"));
    assert!(dot.contains("plus-one"));
    drop(obs);
}

#[test]
fn stats_count_work() {
    let incr = IncrState::new();
    let v = incr.var(1);
    let m = v.watch().map(|x| x + 1);
    let obs = m.observe();
    let before = incr.stats();
    incr.stabilise();
    let after = incr.stats();
    let diff = after - before;
    assert_eq!(diff.recomputed, 2);
    assert_eq!(diff.changed, 2);
    assert_eq!(obs.value(), 2);

    // cutoff: the map recomputes but does not change
    v.set(1);
    let before = incr.stats();
    incr.stabilise();
    let diff = incr.stats() - before;
    assert_eq!(diff.recomputed, 1);
    assert_eq!(diff.changed, 0);
}
