//! Timeline merging: folding a fresh single-pin wave into the combined
//! multi-pin output.

use super::Transition;

/// Merge two transition streams by cumulative timestamp into `out`.
///
/// Each stream's transitions happen at the running sum of the delays before
/// them. Events keep their relative order; at equal timestamps `first`
/// events precede `second` events. Delays in the output are re-derived from
/// the merged timestamps, so the result spans the longer of the two inputs.
///
/// Merging against an empty `first` is how a batch's initial wave is seeded.
pub fn merge(first: &[Transition], second: &[Transition], out: &mut Vec<Transition>) {
    out.clear();
    out.reserve(first.len() + second.len());

    let mut ia = 0;
    let mut ib = 0;
    // Timestamp of each stream's next event.
    let mut ta: u64 = 0;
    let mut tb: u64 = 0;
    // Timestamp already accounted for in emitted delays.
    let mut flushed: u64 = 0;

    while ia < first.len() || ib < second.len() {
        let take_first = if ib >= second.len() {
            true
        } else if ia >= first.len() {
            false
        } else {
            ta <= tb
        };

        let (event, at) = if take_first {
            let e = first[ia];
            let at = ta;
            ta += e.delay_us as u64;
            ia += 1;
            (e, at)
        } else {
            let e = second[ib];
            let at = tb;
            tb += e.delay_us as u64;
            ib += 1;
            (e, at)
        };

        if flushed < at {
            if let Some(prev) = out.last_mut() {
                prev.delay_us += (at - flushed) as u32;
            }
            flushed = at;
        }
        out.push(Transition {
            on_mask: event.on_mask,
            off_mask: event.off_mask,
            delay_us: 0,
        });
    }

    // Settle the tail delay out to the later stream's end.
    let total = ta.max(tb);
    if let Some(prev) = out.last_mut() {
        prev.delay_us += (total - flushed) as u32;
    }
}
