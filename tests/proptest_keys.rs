//! Property tests for key parsing, rendering, and surgery.


use generators::arb_key;
use numdex::Key;
use proptest::prelude::*;

proptest! {
    #[test]
    fn display_parse_round_trip(k in arb_key()) {
        let s = k.to_string();
        let back = Key::parse(&s).unwrap();
        prop_assert_eq!(back, k);
    }

    #[test]
    fn cut_link_restores_the_key(k in arb_key()) {
        for n in 0..k.len() {
            let (outer, inner) = k.cut(n, &[]).unwrap();
            let back = outer.link(&inner, n, &[]).unwrap();
            prop_assert_eq!(&back, &k);
        }
    }

    #[test]
    fn containment_is_reflexive_and_rooted(k in arb_key()) {
        prop_assert!(k.is_in(&k));
        prop_assert!(Key::root().is_in(&k));
        if k.size() > 0 {
            prop_assert!(!k.is_in(&Key::root()));
        }
    }

    #[test]
    fn cut_remainders_stay_contained(k in arb_key()) {
        for n in 1..k.len() {
            let (outer, _inner) = k.cut(n, &[]).unwrap();
            prop_assert!(outer.is_in(&k));
        }
    }

    #[test]
    fn rendered_keys_reject_leading_whitespace(k in arb_key()) {
        let s = k.to_string();
        if !s.is_empty() {
            let padded = format!(" {}", s);
            prop_assert!(Key::parse(&padded).is_err());
        }
    }

    #[test]
    fn size_counts_every_node_but_the_root(k in arb_key()) {
        prop_assert_eq!(k.size() + 1, k.len());
        let total: usize = (0..k.len()).map(|i| k.arity(i)).sum();
        prop_assert_eq!(total, k.size());
    }
}
