//! Reverse-mode differentiation through recorded operation graphs.

use std::collections::BTreeMap;

use numdex::{Index, Key, KeyForm, KeySpace, NumDict, TapeError, TapeSlot};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn key(s: &str) -> Key {
    Key::parse(s).unwrap()
}

fn form(s: &str) -> KeyForm {
    KeyForm::from_key(&key(s)).unwrap()
}

fn fixture() -> (KeySpace, NumDict) {
    let ks = KeySpace::new();
    ks.ensure(&key("w:a")).unwrap();
    ks.ensure(&key("w:b")).unwrap();
    let idx = Index::new(&ks, form("w:?")).unwrap();
    let d = NumDict::new(idx, BTreeMap::new(), 0.0).unwrap();
    (ks, d)
}

#[test]
fn product_rule() {
    let (_ks, x) = fixture();
    let y = x.copy();
    x.mutable().unwrap().set(&key("w:a"), 2.0).unwrap();
    y.mutable().unwrap().set(&key("w:a"), 5.0).unwrap();
    y.mutable().unwrap().set(&key("w:b"), 3.0).unwrap();

    let slot = TapeSlot::new();
    slot.begin(false).unwrap();
    let z = x.mul_with(&slot, &[&y], &[]).unwrap();
    let mut tape = slot.end().unwrap();

    let gs = tape.gradients(&slot, &z, &[&x, &y], None).unwrap();
    assert_eq!(gs[0].get(&key("w:a")).unwrap(), 5.0);
    assert_eq!(gs[0].get(&key("w:b")).unwrap(), 3.0);
    assert_eq!(gs[1].get(&key("w:a")).unwrap(), 2.0);
    assert_eq!(gs[1].get(&key("w:b")).unwrap(), 0.0);
}

#[test]
fn gradients_accumulate_across_uses() {
    let (_ks, x) = fixture();
    x.mutable().unwrap().set(&key("w:a"), 3.0).unwrap();

    let slot = TapeSlot::new();
    slot.begin(false).unwrap();
    // z = x * x, so dz/dx = 2x.
    let z = x.mul_with(&slot, &[&x], &[]).unwrap();
    let mut tape = slot.end().unwrap();

    let gs = tape.gradients(&slot, &z, &[&x], None).unwrap();
    assert_eq!(gs[0].get(&key("w:a")).unwrap(), 6.0);
    assert_eq!(gs[0].get(&key("w:b")).unwrap(), 0.0);
}

#[test]
fn chain_rule_through_scalar_ops() {
    let (_ks, x) = fixture();
    x.mutable().unwrap().set(&key("w:a"), 1.0).unwrap();

    let slot = TapeSlot::new();
    slot.begin(false).unwrap();
    // z = (2x + 1)^2, so dz/dx = 8x + 4.
    let z = x.scale(&slot, 2.0).shift(&slot, 1.0).powf(&slot, 2.0);
    let mut tape = slot.end().unwrap();

    let gs = tape.gradients(&slot, &z, &[&x], None).unwrap();
    assert_eq!(gs[0].get(&key("w:a")).unwrap(), 12.0);
    assert_eq!(gs[0].get(&key("w:b")).unwrap(), 4.0);
}

#[test]
fn reduction_gradient_broadcasts_back() {
    let (_ks, x) = fixture();
    {
        let mut m = x.mutable().unwrap();
        m.set(&key("w:a"), 1.0).unwrap();
        m.set(&key("w:b"), 4.0).unwrap();
    }
    let slot = TapeSlot::new();
    slot.begin(false).unwrap();
    let s = x.sum(&slot).unwrap();
    let mut tape = slot.end().unwrap();

    let gs = tape.gradients(&slot, &s, &[&x], None).unwrap();
    assert_eq!(gs[0].get(&key("w:a")).unwrap(), 1.0);
    assert_eq!(gs[0].get(&key("w:b")).unwrap(), 1.0);
}

#[test]
fn max_reduction_routes_gradient_to_the_winner() {
    let (_ks, x) = fixture();
    {
        let mut m = x.mutable().unwrap();
        m.set(&key("w:a"), 1.0).unwrap();
        m.set(&key("w:b"), 4.0).unwrap();
    }
    let slot = TapeSlot::new();
    slot.begin(false).unwrap();
    let s = x.maximum(&slot).unwrap();
    let mut tape = slot.end().unwrap();

    let gs = tape.gradients(&slot, &s, &[&x], None).unwrap();
    assert_eq!(gs[0].get(&key("w:a")).unwrap(), 0.0);
    assert_eq!(gs[0].get(&key("w:b")).unwrap(), 1.0);
}

#[test]
fn with_default_passes_gradient_through_explicit_entries() {
    let (_ks, x) = fixture();
    x.mutable().unwrap().set(&key("w:a"), 2.0).unwrap();

    let slot = TapeSlot::new();
    slot.begin(false).unwrap();
    let z = x.with_default(&slot, 7.0);
    let mut tape = slot.end().unwrap();

    // The rebinding of the default is constant; only the explicit entry
    // carries gradient.
    let gs = tape.gradients(&slot, &z, &[&x], None).unwrap();
    assert_eq!(gs[0].get(&key("w:a")).unwrap(), 1.0);
    assert_eq!(gs[0].get(&key("w:b")).unwrap(), 0.0);
}

#[test]
fn expand_gradient_sums_over_the_broadcast_fiber() {
    let (ks, _d) = fixture();
    let coarse = NumDict::new(
        Index::new(&ks, KeyForm::agg()).unwrap(),
        BTreeMap::new(),
        0.0,
    )
    .unwrap();
    coarse.mutable().unwrap().set(&Key::root(), 5.0).unwrap();
    let idx = Index::new(&ks, form("w:?")).unwrap();

    let slot = TapeSlot::new();
    slot.begin(false).unwrap();
    let z = coarse.expand(&slot, &idx).unwrap();
    let mut tape = slot.end().unwrap();

    assert_eq!(z.get(&key("w:a")).unwrap(), 5.0);
    assert_eq!(z.get(&key("w:b")).unwrap(), 5.0);
    // Both broadcast copies feed back into the single source entry.
    let gs = tape.gradients(&slot, &z, &[&coarse], None).unwrap();
    assert_eq!(gs[0].get(&Key::root()).unwrap(), 2.0);
}

#[test]
fn sample_gradient_follows_the_drawn_indicator() {
    let (_ks, x) = fixture();
    {
        let mut m = x.mutable().unwrap();
        m.set(&key("w:a"), 1.0).unwrap();
        m.set(&key("w:b"), 3.0).unwrap();
    }
    let mut rng = StdRng::seed_from_u64(7);

    let slot = TapeSlot::new();
    slot.begin(false).unwrap();
    let z = x.sample(&slot, &mut rng).unwrap();
    let mut tape = slot.end().unwrap();

    // Gradient is gated by the 0/1 draw: 1.0 at the drawn key, 0.0 at the
    // rest, undefined off the explicit support.
    let gs = tape.gradients(&slot, &z, &[&x], None).unwrap();
    for (k, v) in z.entries() {
        assert_eq!(gs[0].get(&k).unwrap(), v);
    }
    let total: f64 = gs[0].entries().into_iter().map(|(_, v)| v).sum();
    assert_eq!(total, 1.0);
    assert!(gs[0].default().is_nan());
}

#[test]
fn persistent_tapes_replay() {
    let (_ks, x) = fixture();
    x.mutable().unwrap().set(&key("w:a"), 1.0).unwrap();

    let slot = TapeSlot::new();
    slot.begin(true).unwrap();
    let z = x.scale(&slot, 3.0);
    let mut tape = slot.end().unwrap();

    let g1 = tape.gradients(&slot, &z, &[&x], None).unwrap();
    let g2 = tape.gradients(&slot, &z, &[&x], None).unwrap();
    assert_eq!(g1[0].get(&key("w:b")).unwrap(), 3.0);
    assert_eq!(g2[0].get(&key("w:b")).unwrap(), 3.0);
}

#[test]
fn consumed_tapes_forget_their_graph() {
    let (_ks, x) = fixture();
    let slot = TapeSlot::new();
    slot.begin(false).unwrap();
    let z = x.neg(&slot);
    let mut tape = slot.end().unwrap();
    tape.gradients(&slot, &z, &[&x], None).unwrap();
    assert_eq!(
        tape.gradients(&slot, &z, &[&x], None).err(),
        Some(TapeError::NotOnTape)
    );
}

#[test]
fn missing_gradient_rules_fail_loudly() {
    let (_ks, x) = fixture();
    x.mutable().unwrap().set(&key("w:a"), 2.0).unwrap();
    let slot = TapeSlot::new();
    slot.begin(false).unwrap();
    let z = x.shift(&slot, 1.0).prod(&slot).unwrap();
    let mut tape = slot.end().unwrap();
    assert_eq!(
        tape.gradients(&slot, &z, &[&x], None).err(),
        Some(TapeError::UnimplementedGrad("prod".to_string()))
    );
}

#[test]
fn blocked_values_stop_the_backward_pass() {
    let (_ks, x) = fixture();
    x.mutable().unwrap().set(&key("w:a"), 2.0).unwrap();
    let slot = TapeSlot::new();
    slot.begin(false).unwrap();
    let y = x.neg(&slot);
    let z = y.neg(&slot);
    slot.block(&y).unwrap();
    let mut tape = slot.end().unwrap();
    let gs = tape.gradients(&slot, &z, &[&x], None).unwrap();
    assert_eq!(gs[0].default(), 0.0);
    assert_eq!(gs[0].num_entries(), 0);
}

#[test]
fn seeded_gradients_scale_the_pass() {
    let (ks, x) = fixture();
    x.mutable().unwrap().set(&key("w:a"), 2.0).unwrap();
    let slot = TapeSlot::new();
    slot.begin(false).unwrap();
    let z = x.neg(&slot);
    let mut tape = slot.end().unwrap();
    let seed = NumDict::new(
        Index::new(&ks, form("w:?")).unwrap(),
        BTreeMap::new(),
        2.0,
    )
    .unwrap();
    let gs = tape.gradients(&slot, &z, &[&x], Some(&seed)).unwrap();
    assert_eq!(gs[0].get(&key("w:a")).unwrap(), -2.0);
    assert_eq!(gs[0].get(&key("w:b")).unwrap(), -2.0);
}
