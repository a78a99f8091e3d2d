//! Sort, search and text-boundary utilities.

use std::cmp::Ordering;

/// Partially heap-sort `items` so that the greatest `want` elements (per
/// `cmp`) occupy the tail in ascending order. Result pages are read from the
/// tail, so a full sort is never required.
pub fn heapsort_partial<T, F>(items: &mut [T], want: usize, mut cmp: F)
where
    F: FnMut(&T, &T) -> Ordering,
{
    let len = items.len();
    if len < 2 {
        return;
    }
    let want = want.min(len).max(1);

    // build a max-heap
    for start in (0..len / 2).rev() {
        sift_down(items, start, len, &mut cmp);
    }
    // move the top `want` elements to the tail
    for end in (len - want..len).rev() {
        items.swap(0, end);
        sift_down(items, 0, end, &mut cmp);
    }
}

fn sift_down<T, F>(items: &mut [T], mut root: usize, end: usize, cmp: &mut F)
where
    F: FnMut(&T, &T) -> Ordering,
{
    loop {
        let mut child = root * 2 + 1;
        if child >= end {
            return;
        }
        if child + 1 < end && cmp(&items[child], &items[child + 1]) == Ordering::Less {
            child += 1;
        }
        if cmp(&items[root], &items[child]) == Ordering::Less {
            items.swap(root, child);
            root = child;
        } else {
            return;
        }
    }
}

/// Whether `c` belongs to a word token. Shared with the analyzer boundary.
pub fn is_word_char(c: char) -> bool {
    c.is_alphanumeric()
}

/// Byte offsets of word-token starts in `text`, per the alnum transition
/// scan: a token starts where a non-word (or start of text) is followed by
/// at least two word characters. A final entry holds `text.len()`.
pub fn word_positions(text: &str) -> Vec<u32> {
    let mut positions = Vec::new();
    let mut prev_is_word = true; // suppress position 0
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let next_is_word = chars
            .peek()
            .map(|&(_, n)| is_word_char(n))
            .unwrap_or(false);
        if !prev_is_word && is_word_char(c) && next_is_word {
            positions.push(i as u32);
        }
        prev_is_word = is_word_char(c);
    }
    positions.push(text.len() as u32);
    positions
}

/// Great-circle distance in meters between two (latitude, longitude) points
/// given in degrees.
pub fn earth_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}
