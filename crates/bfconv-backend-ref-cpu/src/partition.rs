use std::ops::Range;

/// Splits `n` items over `team` workers as evenly as possible; the first workers get the
/// larger share. Returns the range owned by worker `tid`.
pub fn balance211(n: usize, team: usize, tid: usize) -> Range<usize> {
    if team <= 1 || n == 0 {
        return if tid == 0 { 0..n } else { n..n };
    }
    let n1 = n.div_ceil(team);
    let n2 = n1 - 1;
    // Workers below `t1` take n1 items, the rest take n2.
    let t1 = n - n2 * team;
    let (start, len) = if tid < t1 {
        (tid * n1, n1)
    } else {
        (t1 * n1 + (tid - t1) * n2, n2)
    };
    let start = start.min(n);
    start..(start + len).min(n)
}

/// Cuts `data` into consecutive pieces of `ranges[i].len() * chunk` elements. `ranges` must be
/// consecutive and start at 0.
pub fn split_by_ranges<'a, T>(
    mut data: &'a mut [T],
    ranges: &[Range<usize>],
    chunk: usize,
) -> Vec<&'a mut [T]> {
    let mut pieces = Vec::with_capacity(ranges.len());
    for range in ranges {
        let (head, tail) = std::mem::take(&mut data).split_at_mut(range.len() * chunk);
        pieces.push(head);
        data = tail;
    }
    pieces
}
