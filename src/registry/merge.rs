//! Two-way merge for descriptive text fields.
//!
//! Successive collectors may report slightly different titles or families
//! for the same context. The merged form keeps the longest common prefix
//! and suffix and marks the divergent middle with `[x]`, so the stored
//! value converges instead of flapping between collectors.

const MARKER: &str = "[x]";

/// Merges two strings into `prefix + "[x]" + suffix`.
///
/// Equal inputs (and inputs already reduced to the marker) pass through
/// unchanged.
pub fn two_way_merge(a: &str, b: &str) -> String {
    if a == b || b == MARKER {
        return a.to_string();
    }
    if a == MARKER {
        return b.to_string();
    }

    let prefix_len = a
        .bytes()
        .zip(b.bytes())
        .take_while(|(x, y)| x == y)
        .count();
    let prefix_len = floor_char_boundary(a, prefix_len);

    let a_rest = &a[prefix_len..];
    let b_rest = &b[prefix_len..];
    let suffix_len = a_rest
        .bytes()
        .rev()
        .zip(b_rest.bytes().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let suffix_len = ceil_suffix_boundary(a_rest, suffix_len);

    let mut out = String::with_capacity(prefix_len + MARKER.len() + suffix_len);
    out.push_str(&a[..prefix_len]);
    out.push_str(MARKER);
    out.push_str(&a_rest[a_rest.len() - suffix_len..]);
    out
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_suffix_boundary(s: &str, mut n: usize) -> usize {
    while n > 0 && !s.is_char_boundary(s.len() - n) {
        n -= 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_pass_through() {
        assert_eq!(two_way_merge("CPU usage", "CPU usage"), "CPU usage");
    }

    #[test]
    fn merges_prefix_and_marks_divergence() {
        assert_eq!(two_way_merge("CPU usage", "CPU utilization"), "CPU u[x]");
    }

    #[test]
    fn keeps_common_suffix() {
        assert_eq!(
            two_way_merge("Disk reads per second", "Disk writes per second"),
            "Disk [x]s per second"
        );
    }

    #[test]
    fn marker_input_yields_other_side() {
        assert_eq!(two_way_merge("[x]", "anything"), "anything");
        assert_eq!(two_way_merge("anything", "[x]"), "anything");
    }

    #[test]
    fn merging_is_stable() {
        let once = two_way_merge("CPU usage", "CPU utilization");
        let twice = two_way_merge(&once, "CPU utilization");
        assert_eq!(once, twice);
    }

    #[test]
    fn multibyte_boundaries_are_respected() {
        let merged = two_way_merge("θerm temp", "θerm heat");
        assert!(merged.starts_with("θerm "));
        assert!(merged.contains("[x]"));
    }
}
