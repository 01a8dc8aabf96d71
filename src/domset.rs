//! Named groups of modules that trigger algorithms can restrict to.
use crate::key::OmKey;
use std::collections::BTreeMap;
use tracing::error;

/// Explicit membership: the set ids each module belongs to.
pub type DomSets = BTreeMap<OmKey, Vec<i32>>;

const DEEPCORE_FIRST_STRING: i32 = 79;
const SET_4_STRINGS: [i32; 7] = [26, 27, 35, 36, 37, 45, 46];
const SET_6_STRINGS: [i32; 12] = [25, 26, 27, 34, 35, 36, 37, 44, 45, 46, 47, 54];

/// Returns `true` if `dom` is a member of set `set`.
///
/// With an explicit map the map decides; a module missing from it belongs to
/// no set. Without one, the built-in set definitions apply.
///
/// # Examples
///
/// ```
/// use trigsim::domset::in_dom_set;
/// use trigsim::key::OmKey;
///
/// assert!(in_dom_set(&OmKey::new(21, 30), 2, None));
/// assert!(!in_dom_set(&OmKey::new(21, 61), 2, None));
/// assert!(in_dom_set(&OmKey::new(80, 20), 5, None));
/// ```
pub fn in_dom_set(dom: &OmKey, set: i32, dom_sets: Option<&DomSets>) -> bool {
    match dom_sets {
        Some(map) => match map.get(dom) {
            Some(sets) => sets.iter().any(|&s| s >= 0 && s == set),
            None => {
                error!(%dom, set, "module not found in the DOM set map");
                false
            }
        },
        None => in_default_dom_set(dom, set),
    }
}

fn in_default_dom_set(dom: &OmKey, set: i32) -> bool {
    let OmKey { string, om } = *dom;
    let deepcore = string >= DEEPCORE_FIRST_STRING && (11..=60).contains(&om);
    match set {
        2 => (1..=78).contains(&string) && (1..=60).contains(&om),
        4 => deepcore || (SET_4_STRINGS.contains(&string) && (41..=60).contains(&om)),
        5 => deepcore || (SET_4_STRINGS.contains(&string) && (39..=60).contains(&om)),
        6 => deepcore || (SET_6_STRINGS.contains(&string) && (39..=60).contains(&om)),
        _ => false,
    }
}

/// Builds the explicit map equivalent to the built-in definitions for the
/// in-ice modules of strings 1 to 86.
pub fn default_dom_sets() -> DomSets {
    let mut map = DomSets::new();
    for string in 1..=86 {
        for om in 1..=60 {
            let dom = OmKey::new(string, om);
            let sets = [2, 4, 5, 6]
                .into_iter()
                .filter(|&set| in_default_dom_set(&dom, set))
                .collect();
            map.insert(dom, sets);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sets() {
        assert!(in_dom_set(&OmKey::new(1, 1), 2, None));
        assert!(in_dom_set(&OmKey::new(78, 60), 2, None));
        assert!(!in_dom_set(&OmKey::new(79, 30), 2, None));

        assert!(in_dom_set(&OmKey::new(36, 41), 4, None));
        assert!(!in_dom_set(&OmKey::new(36, 40), 4, None));
        assert!(in_dom_set(&OmKey::new(36, 39), 5, None));
        assert!(!in_dom_set(&OmKey::new(25, 39), 5, None));
        assert!(in_dom_set(&OmKey::new(25, 39), 6, None));
        assert!(in_dom_set(&OmKey::new(85, 11), 6, None));
        assert!(!in_dom_set(&OmKey::new(85, 10), 6, None));

        assert!(!in_dom_set(&OmKey::new(1, 1), 3, None));
    }

    #[test]
    fn explicit_map_overrides_defaults() {
        let mut map = DomSets::new();
        map.insert(OmKey::new(1, 1), vec![-1, 7]);
        assert!(in_dom_set(&OmKey::new(1, 1), 7, Some(&map)));
        assert!(!in_dom_set(&OmKey::new(1, 1), -1, Some(&map)));
        assert!(!in_dom_set(&OmKey::new(1, 1), 2, Some(&map)));
        assert!(!in_dom_set(&OmKey::new(1, 2), 2, Some(&map)));
    }

    #[test]
    fn default_map_agrees_with_builtin_sets() {
        let map = default_dom_sets();
        assert_eq!(map.len(), 86 * 60);
        for (dom, _) in map.iter().step_by(7) {
            for set in [2, 4, 5, 6] {
                assert_eq!(
                    in_dom_set(dom, set, Some(&map)),
                    in_dom_set(dom, set, None)
                );
            }
        }
    }
}
