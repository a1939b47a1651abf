//! Priority-prefix ordering for blueprint fragments.
//!
//! Fragments named `NN-name` apply in ascending order of the numeric
//! prefix; names without a prefix get the default priority of 50. Ties
//! fall back to lexicographic order of the remainder.

const DEFAULT_PRIORITY: u64 = 50;

fn split_priority(name: &str) -> (u64, &str) {
    if let Some((prefix, rest)) = name.split_once('-') {
        if !prefix.is_empty() {
            if let Ok(priority) = prefix.parse::<u64>() {
                return (priority, rest);
            }
        }
    }
    (DEFAULT_PRIORITY, name)
}

/// Sort names by priority prefix, then by remainder.
pub fn sort_by_priority_prefix(names: &mut [String]) {
    names.sort_by(|a, b| {
        let (pa, ra) = split_priority(a);
        let (pb, rb) = split_priority(b);
        pa.cmp(&pb).then_with(|| ra.cmp(rb))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(input: &[&str], expected: &[&str]) {
        let mut names: Vec<String> = input.iter().map(|s| s.to_string()).collect();
        sort_by_priority_prefix(&mut names);
        assert_eq!(names, expected);
    }

    #[test]
    fn orders_by_priority() {
        check(&["100-foo", "50-bar"], &["50-bar", "100-foo"]);
        check(&["50-bar", "100-foo"], &["50-bar", "100-foo"]);
    }

    #[test]
    fn leading_zeros_parse_numerically() {
        check(&["100-foo", "05-bar", "00-baz"], &["00-baz", "05-bar", "100-foo"]);
    }

    #[test]
    fn ties_fall_back_to_the_name() {
        check(&["50-foo", "50-bar"], &["50-bar", "50-foo"]);
    }

    #[test]
    fn missing_prefix_takes_the_default_priority() {
        check(&["foo", "20-bar"], &["20-bar", "foo"]);
        check(&["foo", "100-bar"], &["foo", "100-bar"]);
    }
}
