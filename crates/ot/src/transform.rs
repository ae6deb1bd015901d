// Single-pass positional transform
//
// `transform(op, applied)` rewrites `op`, written against the document as it
// was before `applied`, so that it can be applied after `applied`.
//
// Overlaps are resolved by author session id: the lower id keeps the
// overlapping region. Both removed ranges are always removed; the winner's
// text always survives; the loser's text survives only when the loser starts
// strictly before the winner. Whatever the loser removed inside the winner's
// range is dropped. This is lossy on purpose and keeps every rebased
// operation a single contiguous edit.

use crate::operation::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Before,
    After,
    Overlap,
}

fn placement(op: &Operation, applied: &Operation) -> Placement {
    let (bs, be) = (op.position, op.end());
    let (as_, ae) = (applied.position, applied.end());

    match (bs == be, as_ == ae) {
        // Two pure inserts: position first, then author order at a tie.
        (true, true) => {
            if bs < as_ || (bs == as_ && op.author < applied.author) {
                Placement::Before
            } else {
                Placement::After
            }
        }
        // Insert against a removed range; only a strictly interior point overlaps.
        (true, false) => {
            if bs <= as_ {
                Placement::Before
            } else if bs >= ae {
                Placement::After
            } else {
                Placement::Overlap
            }
        }
        (false, true) => {
            if as_ <= bs {
                Placement::After
            } else if as_ >= be {
                Placement::Before
            } else {
                Placement::Overlap
            }
        }
        (false, false) => {
            if be <= as_ {
                Placement::Before
            } else if bs >= ae {
                Placement::After
            } else {
                Placement::Overlap
            }
        }
    }
}

/// Rebase `op` over one concurrently `applied` operation.
pub fn transform(op: &Operation, applied: &Operation) -> Operation {
    if applied.is_noop() {
        return op.clone();
    }
    if op.is_noop() {
        return op.moved_to(track_point(op.position, applied));
    }

    match placement(op, applied) {
        Placement::Before => op.clone(),
        Placement::After => {
            op.moved_to(op.position - applied.length + applied.inserted_len())
        }
        Placement::Overlap if op.author < applied.author => overlap_won(op, applied),
        Placement::Overlap => overlap_lost(op, applied),
    }
}

/// Where a bare position ends up once `applied` has run. A point inside the
/// removed range lands just after the replacement text.
fn track_point(at: usize, applied: &Operation) -> usize {
    if at <= applied.position {
        at
    } else if at >= applied.end() {
        at - applied.length + applied.inserted_len()
    } else {
        applied.position + applied.inserted_len()
    }
}

/// `op` keeps the overlap; `applied` already removed its own range and
/// inserted its text, which `op` now has to absorb where the winner owns it.
fn overlap_won(op: &Operation, applied: &Operation) -> Operation {
    let (ws, we) = (op.position, op.end());
    let (ls, le) = (applied.position, applied.end());
    let ln = applied.inserted_len();
    let text = op.text.clone();

    if ls < ws {
        if le <= we {
            // Loser covers our head: remove what is left of our range after its text.
            op.reshaped(ls + ln, we - le, text)
        } else {
            // Loser swallowed our whole range: only our text is left to place.
            op.reshaped(ls + ln, 0, text)
        }
    } else if le > we {
        // Loser covers our tail: take back its text along with our head.
        op.reshaped(ws, ls - ws + ln, text)
    } else {
        // Loser sits inside us: remove around and over its text.
        op.reshaped(ws, ls - ws + ln + (we - le), text)
    }
}

/// `op` loses the overlap to `applied`; keep only its non-overlapping remainder.
fn overlap_lost(op: &Operation, applied: &Operation) -> Operation {
    let (ls, le) = (op.position, op.end());
    let (ws, we) = (applied.position, applied.end());
    let wn = applied.inserted_len();

    if ls < ws {
        if le <= we {
            op.reshaped(ls, ws - ls, op.text.clone())
        } else {
            // Both sides of the winner remain; span the winner's text and
            // write it back so the edit stays contiguous.
            let text = format!("{}{}", op.text, applied.text);
            op.reshaped(ls, (ws - ls) + wn + (le - we), text)
        }
    } else if le > we {
        op.reshaped(ws + wn, le - we, String::new())
    } else {
        op.reshaped(ws + wn, 0, String::new())
    }
}

/// Rebase `op` over every operation accepted after its base, in acceptance order.
pub fn rebase<'a, I>(op: &Operation, accepted: I) -> Operation
where
    I: IntoIterator<Item = &'a Operation>,
{
    accepted
        .into_iter()
        .fold(op.clone(), |current, applied| transform(&current, applied))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OpKind;

    #[test]
    fn test_placement_boundaries() {
        let del = Operation::delete(2, 3, 5, 0);

        assert_eq!(placement(&Operation::insert(2, "x", 1, 0), &del), Placement::Before);
        assert_eq!(placement(&Operation::insert(5, "x", 1, 0), &del), Placement::After);
        assert_eq!(placement(&Operation::insert(3, "x", 1, 0), &del), Placement::Overlap);

        assert_eq!(placement(&Operation::delete(0, 2, 1, 0), &del), Placement::Before);
        assert_eq!(placement(&Operation::delete(5, 1, 1, 0), &del), Placement::After);
        assert_eq!(placement(&Operation::delete(4, 2, 1, 0), &del), Placement::Overlap);
    }

    #[test]
    fn test_shift_by_net_delta() {
        let op = Operation::delete(6, 1, 2, 0);

        assert_eq!(transform(&op, &Operation::insert(0, "abc", 1, 0)).position, 9);
        assert_eq!(transform(&op, &Operation::delete(1, 4, 1, 0)).position, 2);
        assert_eq!(transform(&op, &Operation::replace(0, 2, "xyz", 1, 0)).position, 7);
        assert_eq!(transform(&op, &Operation::insert(7, "abc", 1, 0)).position, 6);
    }

    #[test]
    fn test_noop_changes_nothing_but_follows_the_text() {
        let op = Operation::insert(1, "a", 2, 0);
        let noop = Operation::new(0, 0, "", 1, 0);
        assert_eq!(transform(&op, &noop), op);
        assert_eq!(transform(&noop, &op), noop);

        // "QUFI": a no-op at the end must not fall off once the text shrinks
        let tail = Operation::new(4, 0, "", 1, 0);
        let rewrite = Operation::replace(0, 4, "cnk", 2, 0);
        assert_eq!(transform(&tail, &rewrite).position, 3);

        // Inside a removed range it lands after the replacement
        let inside = Operation::new(2, 0, "", 2, 0);
        assert_eq!(transform(&inside, &Operation::replace(1, 3, "xy", 1, 0)).position, 3);
        assert_eq!(transform(&inside, &Operation::delete(0, 1, 1, 0)).position, 1);
    }

    #[test]
    fn test_lost_insert_stays_in_range_across_rebases() {
        // "HELLO": v1 deletes "ELL", v2 deletes "HO"; an insert at 3 from v0
        // loses to the first delete and must still fit the empty document.
        let first = Operation::delete(1, 3, 1, 0);
        let second = Operation::delete(0, 2, 1, 1);
        let rebased = rebase(&Operation::insert(3, "x", 2, 0), [&first, &second]);

        assert!(rebased.is_noop());
        assert_eq!(rebased.position, 0);
        let mut content = "HELLO".to_string();
        for op in [&first, &second, &rebased] {
            crate::text::apply(&mut content, op).unwrap();
        }
        assert_eq!(content, "");
    }

    #[test]
    fn test_contained_loser_becomes_replace() {
        // "ABCDE": session 2 deletes "BCD", session 1 inserted "x" after "B".
        let loser = Operation::delete(1, 3, 2, 0);
        let winner = Operation::insert(2, "x", 1, 0);

        let rebased = transform(&loser, &winner);
        assert_eq!(rebased.kind, OpKind::Replace);
        assert_eq!((rebased.position, rebased.length), (1, 4));
        assert_eq!(rebased.text, "x");
    }
}
